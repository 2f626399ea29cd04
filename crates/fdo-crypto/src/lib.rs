//! FDO crypto primitives and helpers.
//!
//! This crate provides the cryptographic building blocks for the FIDO
//! Device Onboard server roles: ownership-voucher signing and chain
//! verification, the TO2 key exchange and encrypted tunnel, and device
//! certificate issuance during DI.
//!
//! # Modules
//!
//! - [`hash`] - SHA-2 digests and HMACs with the FDO registry ids
//! - [`keys`] - the `[pkType, pkEnc, pkBody]` public-key model and signing keys
//! - [`cose`] - `COSE_Sign1` over exact wire bytes
//! - [`kex`] - key-exchange suites and SEK/SVK derivation
//! - [`cipher`] - cipher-suite registry and the TO2 tunnel codec
//! - [`certs`] - device certificate issuance
//! - [`error`] - the shared error type

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod certs;
pub mod cipher;
pub mod cose;
pub mod error;
pub mod hash;
pub mod keys;
pub mod kex;

pub use certs::{DeviceCertAuthority, generate_device_csr, leaf_verifier};
pub use cipher::{CipherSuite, SessionCrypto};
pub use cose::{
    LABEL_ALG, LABEL_IV, sign1_create, sign1_parse, sign1_payload_unverified, sign1_verify,
    verify_parsed_sign1,
};
pub use error::{CryptoError, CryptoResult};
pub use hash::{Hash, HashAlg};
pub use keys::{KeyEncoding, KeyType, PublicKey, SigningKey, Verifier};
pub use kex::{
    DeviceKexResult, KexSuite, OwnerKexState, SessionKeys, SharedSecret, derive_session_keys,
};

// Re-export the RSA key types used by the ASYMKEX suites so callers need
// not depend on the rsa crate directly.
pub use rsa::{RsaPrivateKey, RsaPublicKey};
