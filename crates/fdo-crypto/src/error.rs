//! Error types for FDO cryptographic operations.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
///
/// Decryption and MAC failures in the TO2 encrypted phase deliberately
/// collapse into the single [`CryptoError::DecryptFailed`] variant so that
/// padding, tag, and length failures are indistinguishable to a peer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes.
        expected: usize,
        /// Actual key length provided.
        actual: usize,
    },

    /// Signature verification failed.
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// MAC verification failed.
    #[error("MAC verification failed")]
    MacVerificationFailed,

    /// Decryption failed. Carries no sub-reason by design.
    #[error("decryption failed")]
    DecryptFailed,

    /// Encryption failed.
    #[error("encryption failed")]
    EncryptFailed,

    /// The AES-CTR 32-bit message counter is exhausted for this session.
    #[error("session frame counter exhausted")]
    CounterExhausted,

    /// Algorithm, key type, or suite identifier is not in the registry.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Suite identifier is in the registry but deprecated and refused.
    #[error("deprecated cipher suite: {0}")]
    DeprecatedSuite(i64),

    /// A COSE structure was malformed or carried unknown critical headers.
    #[error("COSE structure error: {0}")]
    CoseStructure(String),

    /// Invalid public key encoding.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid key-exchange message from the peer.
    #[error("invalid key exchange parameter")]
    InvalidKexParameter,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Certificate issuance or parsing failed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// CBOR encoding of a crypto structure failed.
    #[error(transparent)]
    Cbor(#[from] fdo_cbor::CodecError),
}

/// Result type alias for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
