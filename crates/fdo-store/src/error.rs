//! Store errors.

use thiserror::Error;

/// Errors raised by session, voucher, and rendezvous-blob stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The token, GUID, or blob is unknown or has expired.
    #[error("not found")]
    NotFound,

    /// Stored state failed to serialize or deserialize.
    #[error("state serialization: {0}")]
    Serialization(String),

    /// Backend failure.
    #[error("store backend: {0}")]
    Backend(String),
}

impl From<fdo_cbor::CodecError> for StoreError {
    fn from(err: fdo_cbor::CodecError) -> Self {
        Self::Serialization(err.to_string())
    }
}
