//! CBOR codec fuzz target.
//!
//! Fuzzes the raw-item scanner and the canonical decode path.
//! Goal: no panics on arbitrary input, and scanner/decoder agreement on
//! item boundaries.

#![no_main]

use ciborium::value::Value;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The scanner must reject or bound every input without panicking.
    let scanned = fdo_cbor::item_length(data);

    // Strict single-item decode.
    let decoded = fdo_cbor::from_cbor::<Value>(data);

    // If both succeed, the scanner must agree with the decoder that the
    // whole input is exactly one item.
    if let (Ok(len), Ok(_)) = (&scanned, &decoded) {
        assert_eq!(*len, data.len());
    }

    // Canonical decode re-encodes; must never panic.
    let _ = fdo_cbor::from_canonical_cbor::<Value>(data);

    // Raw wrappers and bstr unwrapping.
    let _ = fdo_cbor::RawCbor::from_slice(data);
    let _ = fdo_cbor::unwrap_bstr(data);

    // Splitting a concatenated stream terminates.
    let mut rest = data;
    while fdo_cbor::take_item(&mut rest).is_ok() {
        if rest.is_empty() {
            break;
        }
    }
});
