//! Hash and HMAC types with the FDO algorithm registry.
//!
//! FDO hashes travel as `[hashtype, bstr]` pairs. The registry is closed:
//! SHA-256/384 for digests, HMAC-SHA-256/384 for keyed MACs.

use hmac::{Hmac, Mac};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha384};
use subtle::ConstantTimeEq;

use crate::error::{CryptoError, CryptoResult};

/// FDO hash algorithm identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlg {
    /// HMAC-SHA-256.
    HmacSha256 = 5,
    /// HMAC-SHA-384.
    HmacSha384 = 6,
    /// SHA-256.
    Sha256 = 8,
    /// SHA-384.
    Sha384 = 14,
}

impl HashAlg {
    /// Numeric registry identifier.
    #[must_use]
    pub const fn id(self) -> i64 {
        self as i64
    }

    /// Convert from a numeric identifier.
    ///
    /// # Errors
    /// Returns `CryptoError::UnsupportedAlgorithm` for unknown values.
    pub fn try_from_id(id: i64) -> CryptoResult<Self> {
        match id {
            5 => Ok(Self::HmacSha256),
            6 => Ok(Self::HmacSha384),
            8 => Ok(Self::Sha256),
            14 => Ok(Self::Sha384),
            other => Err(CryptoError::UnsupportedAlgorithm(format!(
                "hash alg {other}"
            ))),
        }
    }

    /// Digest output length in bytes.
    #[must_use]
    pub const fn digest_len(self) -> usize {
        match self {
            Self::HmacSha256 | Self::Sha256 => 32,
            Self::HmacSha384 | Self::Sha384 => 48,
        }
    }

    /// Whether this algorithm is keyed.
    #[must_use]
    pub const fn is_hmac(self) -> bool {
        matches!(self, Self::HmacSha256 | Self::HmacSha384)
    }

    /// The keyed counterpart of a digest algorithm (identity for HMACs).
    #[must_use]
    pub const fn hmac_variant(self) -> Self {
        match self {
            Self::Sha256 | Self::HmacSha256 => Self::HmacSha256,
            Self::Sha384 | Self::HmacSha384 => Self::HmacSha384,
        }
    }
}

/// A hash or HMAC value tagged with its algorithm.
///
/// Wire form is the two-element array `[hashtype, hash]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hash {
    alg: HashAlg,
    value: Vec<u8>,
}

impl Hash {
    /// Compute an unkeyed digest over `data`.
    ///
    /// # Errors
    /// Returns `CryptoError::UnsupportedAlgorithm` if `alg` is an HMAC.
    pub fn digest(alg: HashAlg, data: &[u8]) -> CryptoResult<Self> {
        let value = match alg {
            HashAlg::Sha256 => Sha256::digest(data).to_vec(),
            HashAlg::Sha384 => Sha384::digest(data).to_vec(),
            _ => {
                return Err(CryptoError::UnsupportedAlgorithm(
                    "digest with keyed algorithm".into(),
                ));
            }
        };
        Ok(Self { alg, value })
    }

    /// Compute an HMAC over `data`.
    ///
    /// # Errors
    /// Returns `CryptoError::UnsupportedAlgorithm` if `alg` is unkeyed, or
    /// `CryptoError::InvalidKeyLength` for an unusable key.
    pub fn hmac(alg: HashAlg, key: &[u8], data: &[u8]) -> CryptoResult<Self> {
        let value = match alg {
            HashAlg::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| {
                    CryptoError::InvalidKeyLength {
                        expected: 32,
                        actual: key.len(),
                    }
                })?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            HashAlg::HmacSha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(key).map_err(|_| {
                    CryptoError::InvalidKeyLength {
                        expected: 48,
                        actual: key.len(),
                    }
                })?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            _ => {
                return Err(CryptoError::UnsupportedAlgorithm(
                    "hmac with unkeyed algorithm".into(),
                ));
            }
        };
        Ok(Self { alg, value })
    }

    /// Construct from an already-computed value.
    ///
    /// # Errors
    /// Returns `CryptoError::InvalidKeyLength` if the value length does not
    /// match the algorithm's output length.
    pub fn from_parts(alg: HashAlg, value: Vec<u8>) -> CryptoResult<Self> {
        if value.len() != alg.digest_len() {
            return Err(CryptoError::InvalidKeyLength {
                expected: alg.digest_len(),
                actual: value.len(),
            });
        }
        Ok(Self { alg, value })
    }

    /// The algorithm of this value.
    #[must_use]
    pub const fn alg(&self) -> HashAlg {
        self.alg
    }

    /// The raw digest or MAC bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    /// Constant-time comparison against another hash of the same algorithm.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.alg == other.alg && bool::from(self.value.ct_eq(&other.value))
    }

    /// Recompute the digest of `data` and compare in constant time.
    ///
    /// # Errors
    /// Returns `CryptoError::MacVerificationFailed` on mismatch.
    pub fn verify_data(&self, data: &[u8]) -> CryptoResult<()> {
        let computed = Self::digest(self.alg, data)?;
        if self.matches(&computed) {
            Ok(())
        } else {
            Err(CryptoError::MacVerificationFailed)
        }
    }

    /// Recompute the HMAC of `data` under `key` and compare in constant time.
    ///
    /// # Errors
    /// Returns `CryptoError::MacVerificationFailed` on mismatch.
    pub fn verify_hmac(&self, key: &[u8], data: &[u8]) -> CryptoResult<()> {
        let computed = Self::hmac(self.alg, key, data)?;
        if self.matches(&computed) {
            Ok(())
        } else {
            Err(CryptoError::MacVerificationFailed)
        }
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.alg.id(), serde_bytes::Bytes::new(&self.value)).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (id, value): (i64, serde_bytes::ByteBuf) = Deserialize::deserialize(deserializer)?;
        let alg = HashAlg::try_from_id(id).map_err(D::Error::custom)?;
        Self::from_parts(alg, value.into_vec()).map_err(D::Error::custom)
    }
}
