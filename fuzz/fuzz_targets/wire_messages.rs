//! Wire-message fuzz target.
//!
//! Fuzzes the protocol message parsers the responders run on untrusted
//! bodies, plus COSE_Sign1 structure parsing and devmod ingestion.

#![no_main]

use fdo_protocol::devmod::DevmodSnapshot;
use fdo_protocol::messages::{
    AppStart, DeviceServiceInfo, GetOvNextEntry, HelloDevice, HelloRv, OwnerSign, SetHmac,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = fdo_cbor::from_cbor::<AppStart>(data);
    let _ = fdo_cbor::from_cbor::<SetHmac>(data);
    let _ = fdo_cbor::from_cbor::<OwnerSign>(data);
    let _ = fdo_cbor::from_cbor::<HelloRv>(data);
    let _ = fdo_cbor::from_cbor::<HelloDevice>(data);
    let _ = fdo_cbor::from_cbor::<GetOvNextEntry>(data);
    let _ = fdo_cbor::from_cbor::<DeviceServiceInfo>(data);
    let _ = fdo_protocol::error::ErrorMessage::new(
        fdo_protocol::error::ErrorCode::MessageBody,
        255,
        "fuzz",
    );

    // COSE structure parsing on raw bytes.
    let _ = fdo_crypto::cose::sign1_parse(data);
    let _ = fdo_crypto::cose::sign1_payload_unverified(data);

    // Devmod ingestion of hostile values.
    let mut snapshot = DevmodSnapshot::default();
    for message in ["active", "os", "nummodules", "modules", "sn"] {
        let _ = snapshot.absorb(message, data);
    }
});
