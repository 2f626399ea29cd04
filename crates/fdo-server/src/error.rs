//! Server-side error taxonomy and its mapping onto wire errors.
//!
//! Responders fail with a [`ServerError`]; the dispatcher turns it into
//! an `ErrorMessage` (type 255) and tears the session down. Chain errors
//! collapse to invalid-message externally, and crypto errors never say
//! why. Unknown or expired tokens surface as HTTP 401 with no body.

use thiserror::Error;
use uuid::Uuid;

use fdo_protocol::error::{ErrorCode, ErrorMessage};
use fdo_protocol::voucher::VoucherError;
use fdo_store::StoreError;

/// A responder failure.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Out-of-order, unexpected, or semantically invalid message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Unknown GUID, missing or expired rendezvous blob.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Signature, MAC, or decryption failure. Opaque externally.
    #[error("cryptographic failure")]
    Crypto,

    /// Body failed to parse or violated size limits.
    #[error("message body error: {0}")]
    MessageBody(String),

    /// Unknown or expired bearer token. Maps to HTTP 401, not a 255.
    #[error("invalid token")]
    InvalidToken,

    /// Everything else. Logged with a correlation id.
    #[error("internal error: {0}")]
    Internal(String),

    /// A peer answered with a type-255 error (client-side only).
    #[error("peer error {code}: {message}")]
    Peer {
        /// Wire error code from the peer.
        code: u16,
        /// Peer-supplied description.
        message: String,
    },
}

impl ServerError {
    /// The wire error code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidMessage(_) => ErrorCode::InvalidMessage,
            Self::ResourceNotFound(_) => ErrorCode::ResourceNotFound,
            Self::Crypto => ErrorCode::Crypto,
            Self::MessageBody(_) => ErrorCode::MessageBody,
            Self::InvalidToken | Self::Internal(_) | Self::Peer { .. } => ErrorCode::Internal,
        }
    }

    /// Build the wire error message for a failed `prev_msg_type`.
    ///
    /// Internal errors log their detail under a correlation id and
    /// surface only the id; crypto errors surface nothing specific.
    #[must_use]
    pub fn to_error_message(&self, prev_msg_type: u8) -> ErrorMessage {
        let text = match self {
            Self::Crypto => "cryptographic failure".to_string(),
            Self::Internal(detail) => {
                let correlation = Uuid::new_v4();
                tracing::error!(%correlation, msg_type = prev_msg_type, %detail, "internal error");
                format!("internal error ({correlation})")
            }
            other => other.to_string(),
        };
        ErrorMessage::new(self.code(), prev_msg_type, text)
    }
}

impl From<fdo_cbor::CodecError> for ServerError {
    fn from(err: fdo_cbor::CodecError) -> Self {
        Self::MessageBody(err.to_string())
    }
}

impl From<fdo_crypto::CryptoError> for ServerError {
    fn from(_: fdo_crypto::CryptoError) -> Self {
        Self::Crypto
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::ResourceNotFound("no such record".into()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<VoucherError> for ServerError {
    fn from(err: VoucherError) -> Self {
        match err {
            // Chain subcodes stay internal; peers see an invalid message.
            VoucherError::Chain(reason) => {
                tracing::debug!(%reason, "voucher chain validation failed");
                Self::InvalidMessage("ownership voucher rejected".into())
            }
            VoucherError::Crypto(_) => Self::Crypto,
            other => Self::MessageBody(other.to_string()),
        }
    }
}
