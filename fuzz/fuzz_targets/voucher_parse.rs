//! Ownership-voucher fuzz target.
//!
//! Fuzzes voucher parsing, chain validation, and PEM framing.
//! Goal: arbitrary input is rejected with errors, never panics; anything
//! that parses also survives re-encoding.

#![no_main]

use fdo_protocol::voucher::OwnershipVoucher;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(voucher) = OwnershipVoucher::from_bytes(data) {
        // Chain validation over attacker-controlled entries.
        let _ = voucher.validate_chain(None);
        let _ = voucher.current_owner_pk();

        // Exact-bytes round trip for anything structurally valid.
        if let Ok(bytes) = voucher.to_bytes() {
            let reparsed = OwnershipVoucher::from_bytes(&bytes).expect("round trip");
            assert_eq!(reparsed.raw_header().as_bytes(), voucher.raw_header().as_bytes());
        }
    }

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = OwnershipVoucher::from_pem(text);
    }
});
