//! The FDO error message (type 255) and its code registry.
//!
//! Protocol failures are terminal: the responder emits one `ErrorMessage`
//! naming the message it was handling, and the session is deleted. Crypto
//! failures never carry a sub-reason.

use rand::Rng as _;
use serde_tuple::{Deserialize_tuple, Serialize_tuple};
use thiserror::Error;

/// Message type of the error message.
pub const MSG_ERROR: u8 = 255;

/// FDO error codes surfaced to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Message was out of order, unexpected, or semantically invalid.
    InvalidMessage = 1,
    /// Unknown GUID, missing rendezvous blob, or expired resource.
    ResourceNotFound = 2,
    /// Signature, MAC, or decryption failure. No sub-reason.
    Crypto = 3,
    /// Body failed to parse or exceeded size limits.
    MessageBody = 4,
    /// Internal server error; details stay in the log.
    Internal = 500,
}

impl ErrorCode {
    /// Numeric wire code.
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Convert from a wire code, defaulting unknown codes to internal.
    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        match code {
            1 => Self::InvalidMessage,
            2 => Self::ResourceNotFound,
            3 => Self::Crypto,
            4 => Self::MessageBody,
            _ => Self::Internal,
        }
    }
}

/// Wire form of message 255:
/// `[code, prevMsgType, message, timestamp, correlationId]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ErrorMessage {
    /// Error code from the registry.
    pub code: u16,
    /// The message type that was being processed.
    pub prev_msg_type: u8,
    /// Human-readable description; never carries crypto sub-reasons.
    pub message: String,
    /// Seconds since the Unix epoch, or 0 when no clock is available.
    pub timestamp: u64,
    /// Random correlation identifier, echoed into server logs.
    pub correlation_id: u64,
}

impl ErrorMessage {
    /// Build an error message for a failed `prev_msg_type`.
    #[must_use]
    pub fn new(code: ErrorCode, prev_msg_type: u8, message: impl Into<String>) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            code: code.code(),
            prev_msg_type,
            message: message.into(),
            timestamp,
            correlation_id: rand::thread_rng().gen::<u64>(),
        }
    }

    /// The typed error code.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }
}

/// Chain-validation failures. Used internally with entry indexes;
/// externally these collapse to [`ErrorCode::InvalidMessage`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChainError {
    /// An entry signature did not verify against the expected signer.
    #[error("entry {entry}: signature mismatch")]
    SignatureMismatch {
        /// Index of the failing entry.
        entry: usize,
    },

    /// An entry's previous-entry hash did not match the computed link.
    #[error("entry {entry}: hash link mismatch")]
    HashLinkMismatch {
        /// Index of the failing entry.
        entry: usize,
    },

    /// An entry's header-info hash did not match the header.
    #[error("entry {entry}: header info hash mismatch")]
    HeaderInfoMismatch {
        /// Index of the failing entry.
        entry: usize,
    },

    /// Entries do not all use the hash algorithm declared by the chain.
    #[error("entry {entry}: mixed hash algorithms")]
    MixedHashAlgorithms {
        /// Index of the failing entry.
        entry: usize,
    },

    /// An entry payload was structurally invalid.
    #[error("entry {entry}: malformed entry payload")]
    MalformedEntry {
        /// Index of the failing entry.
        entry: usize,
    },

    /// The manufacturer key is not among the trusted roots.
    #[error("manufacturer key is not trusted")]
    UntrustedManufacturer,

    /// The declared certificate-chain hash does not match the chain.
    #[error("certificate chain hash mismatch")]
    CertChainHashMismatch,

    /// The operation requires at least one extension beyond the header.
    #[error("voucher has no owner extensions")]
    NotExtended,
}
