//! Cipher-suite registry and the TO2 tunnel codec.
//!
//! Every encrypted TO2 payload is a `COSE_Encrypt0` (tag 16). For
//! encrypt-then-MAC suites the Encrypt0 is wrapped in a `COSE_Mac0`
//! (tag 17) keyed with SVK, covering the full MAC_structure over the
//! serialized Encrypt0. IV policy follows the FDO registry:
//!
//! - GCM/CCM/CBC: fresh random IV per message, carried in the
//!   unprotected `IV` header.
//! - CTR: a 12-byte per-side nonce chosen at session start plus a 32-bit
//!   big-endian counter, persisted across messages. Counter exhaustion
//!   tears the session down rather than reusing a keystream.
//!
//! Any decryption failure surfaces as the same opaque error.

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use ccm::Ccm;
use ccm::consts::{U7, U12, U16};
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use coset::{
    CborSerializable, CoseEncrypt0, CoseEncrypt0Builder, CoseMac0, CoseMac0Builder, Header,
    TaggedCborSerializable, iana,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Sha256, Sha384};
use subtle::ConstantTimeEq;

use crate::error::{CryptoError, CryptoResult};
use crate::hash::HashAlg;
use crate::kex::SessionKeys;

type Aes192Gcm = AesGcm<Aes192, U12>;
type Ccm64Aes128 = Ccm<Aes128, U16, U7>;
type Ccm64Aes256 = Ccm<Aes256, U16, U7>;
type Aes128Ctr = ctr::Ctr32BE<Aes128>;
type Aes256Ctr = ctr::Ctr32BE<Aes256>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Negotiable TO2 cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    /// AES-128-GCM.
    A128Gcm,
    /// AES-192-GCM.
    A192Gcm,
    /// AES-256-GCM.
    A256Gcm,
    /// AES-CCM with 8-byte length field, 128-bit tag, 128-bit key.
    AesCcm64_128_128,
    /// AES-CCM with 8-byte length field, 128-bit tag, 256-bit key.
    AesCcm64_128_256,
    /// AES-128-CTR + HMAC-SHA-256.
    Aes128Ctr,
    /// AES-128-CBC (PKCS#7) + HMAC-SHA-256.
    Aes128Cbc,
    /// AES-256-CTR + HMAC-SHA-384.
    Aes256Ctr,
    /// AES-256-CBC (PKCS#7) + HMAC-SHA-384.
    Aes256Cbc,
}

impl CipherSuite {
    /// Numeric registry identifier.
    #[must_use]
    pub const fn id(self) -> i64 {
        match self {
            Self::A128Gcm => 1,
            Self::A192Gcm => 2,
            Self::A256Gcm => 3,
            Self::AesCcm64_128_128 => 32,
            Self::AesCcm64_128_256 => 33,
            Self::Aes128Cbc => -17_760_703,
            Self::Aes128Ctr => -17_760_704,
            Self::Aes256Cbc => -17_760_705,
            Self::Aes256Ctr => -17_760_706,
        }
    }

    /// Convert from a numeric identifier.
    ///
    /// # Errors
    /// Returns `CryptoError::DeprecatedSuite` for the withdrawn
    /// AES-CCM-16 identifiers (30, 31) and `UnsupportedAlgorithm` for
    /// anything else unknown.
    pub fn try_from_id(id: i64) -> CryptoResult<Self> {
        match id {
            1 => Ok(Self::A128Gcm),
            2 => Ok(Self::A192Gcm),
            3 => Ok(Self::A256Gcm),
            30 | 31 => Err(CryptoError::DeprecatedSuite(id)),
            32 => Ok(Self::AesCcm64_128_128),
            33 => Ok(Self::AesCcm64_128_256),
            -17_760_703 => Ok(Self::Aes128Cbc),
            -17_760_704 => Ok(Self::Aes128Ctr),
            -17_760_705 => Ok(Self::Aes256Cbc),
            -17_760_706 => Ok(Self::Aes256Ctr),
            other => Err(CryptoError::UnsupportedAlgorithm(format!(
                "cipher suite {other}"
            ))),
        }
    }

    /// Registry name, as used in configuration files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::A128Gcm => "A128GCM",
            Self::A192Gcm => "A192GCM",
            Self::A256Gcm => "A256GCM",
            Self::AesCcm64_128_128 => "AES-CCM-64-128-128",
            Self::AesCcm64_128_256 => "AES-CCM-64-128-256",
            Self::Aes128Cbc => "COSEAES128CBC",
            Self::Aes128Ctr => "COSEAES128CTR",
            Self::Aes256Cbc => "COSEAES256CBC",
            Self::Aes256Ctr => "COSEAES256CTR",
        }
    }

    /// Whether the suite is authenticated encryption (no companion MAC).
    #[must_use]
    pub const fn is_ae(self) -> bool {
        matches!(
            self,
            Self::A128Gcm
                | Self::A192Gcm
                | Self::A256Gcm
                | Self::AesCcm64_128_128
                | Self::AesCcm64_128_256
        )
    }

    /// Session encryption key length in bytes.
    #[must_use]
    pub const fn sek_len(self) -> usize {
        match self {
            Self::A128Gcm | Self::AesCcm64_128_128 | Self::Aes128Ctr | Self::Aes128Cbc => 16,
            Self::A192Gcm => 24,
            Self::A256Gcm | Self::AesCcm64_128_256 | Self::Aes256Ctr | Self::Aes256Cbc => 32,
        }
    }

    /// Session verification key length in bytes (0 for AE suites).
    #[must_use]
    pub const fn svk_len(self) -> usize {
        match self.mac_alg() {
            None => 0,
            Some(HashAlg::HmacSha256) => 32,
            Some(_) => 48,
        }
    }

    /// The companion MAC algorithm for encrypt-then-MAC suites.
    #[must_use]
    pub const fn mac_alg(self) -> Option<HashAlg> {
        match self {
            Self::Aes128Ctr | Self::Aes128Cbc => Some(HashAlg::HmacSha256),
            Self::Aes256Ctr | Self::Aes256Cbc => Some(HashAlg::HmacSha384),
            _ => None,
        }
    }

    /// PRF hash used by the key-exchange KDF for this suite.
    #[must_use]
    pub const fn prf_hash(self) -> HashAlg {
        match self {
            Self::Aes256Ctr | Self::Aes256Cbc => HashAlg::HmacSha384,
            _ => HashAlg::HmacSha256,
        }
    }

    const fn iv_len(self) -> usize {
        match self {
            Self::AesCcm64_128_128 | Self::AesCcm64_128_256 => 7,
            Self::A128Gcm | Self::A192Gcm | Self::A256Gcm => 12,
            _ => 16,
        }
    }

    fn enc_algorithm(self) -> coset::Algorithm {
        use coset::RegisteredLabelWithPrivate::{Assigned, PrivateUse};
        match self {
            Self::A128Gcm => Assigned(iana::Algorithm::A128GCM),
            Self::A192Gcm => Assigned(iana::Algorithm::A192GCM),
            Self::A256Gcm => Assigned(iana::Algorithm::A256GCM),
            Self::AesCcm64_128_128 => Assigned(iana::Algorithm::AES_CCM_64_128_128),
            Self::AesCcm64_128_256 => Assigned(iana::Algorithm::AES_CCM_64_128_256),
            other => PrivateUse(other.id()),
        }
    }

    fn mac_algorithm(self) -> Option<coset::Algorithm> {
        use coset::RegisteredLabelWithPrivate::Assigned;
        match self.mac_alg() {
            Some(HashAlg::HmacSha256) => Some(Assigned(iana::Algorithm::HMAC_256_256)),
            Some(_) => Some(Assigned(iana::Algorithm::HMAC_384_384)),
            None => None,
        }
    }
}

impl Serialize for CipherSuite {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.id())
    }
}

impl<'de> Deserialize<'de> for CipherSuite {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let id = i64::deserialize(deserializer)?;
        Self::try_from_id(id).map_err(D::Error::custom)
    }
}

/// One side's tunnel state: suite, keys, and CTR IV bookkeeping.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionCrypto {
    suite: CipherSuite,
    keys: SessionKeys,
    #[serde(with = "serde_bytes")]
    ctr_nonce: Vec<u8>,
    ctr_counter: u32,
}

impl SessionCrypto {
    /// Create tunnel state from derived keys, picking this side's CTR
    /// nonce.
    ///
    /// # Errors
    /// Returns `InvalidKeyLength` if the keys do not match the suite.
    pub fn new(suite: CipherSuite, keys: SessionKeys) -> CryptoResult<Self> {
        if keys.sek.len() != suite.sek_len() {
            return Err(CryptoError::InvalidKeyLength {
                expected: suite.sek_len(),
                actual: keys.sek.len(),
            });
        }
        if keys.svk.len() != suite.svk_len() {
            return Err(CryptoError::InvalidKeyLength {
                expected: suite.svk_len(),
                actual: keys.svk.len(),
            });
        }
        let mut ctr_nonce = vec![0u8; 12];
        OsRng.fill_bytes(&mut ctr_nonce);
        Ok(Self {
            suite,
            keys,
            ctr_nonce,
            ctr_counter: 0,
        })
    }

    /// The negotiated suite.
    #[must_use]
    pub const fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Encrypt a message payload into encoded COSE bytes.
    ///
    /// # Errors
    /// Returns `EncryptFailed` on backend failure and `CounterExhausted`
    /// when the CTR counter would wrap.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let iv = self.next_iv(plaintext.len())?;

        let protected = Header {
            alg: Some(self.suite.enc_algorithm()),
            ..Default::default()
        };
        let unprotected = Header {
            iv: iv.clone(),
            ..Default::default()
        };

        let sek = self.keys.sek.clone();
        let suite = self.suite;
        let encrypt0 = CoseEncrypt0Builder::new()
            .protected(protected)
            .unprotected(unprotected)
            .try_create_ciphertext(plaintext, &[], |pt, aad| seal(suite, &sek, &iv, pt, aad))?
            .build();
        let encoded = encrypt0
            .to_tagged_vec()
            .map_err(|_| CryptoError::EncryptFailed)?;

        let Some(mac_algorithm) = self.suite.mac_algorithm() else {
            return Ok(encoded);
        };

        let svk = self.keys.svk.clone();
        let mac_alg = self.suite.mac_alg().unwrap_or(HashAlg::HmacSha256);
        let mac0 = CoseMac0Builder::new()
            .protected(Header {
                alg: Some(mac_algorithm),
                ..Default::default()
            })
            .payload(encoded)
            .try_create_tag(&[], |data| compute_mac(mac_alg, &svk, data))?
            .build();
        mac0.to_tagged_vec().map_err(|_| CryptoError::EncryptFailed)
    }

    /// Decrypt encoded COSE bytes into the message payload.
    ///
    /// All failures (structure, MAC, tag, padding) surface as the same
    /// opaque error.
    ///
    /// # Errors
    /// Returns `DecryptFailed`.
    pub fn decrypt(&mut self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let encrypt0_bytes = if self.suite.is_ae() {
            data.to_vec()
        } else {
            let mac0 = CoseMac0::from_tagged_slice(data)
                .or_else(|_| CoseMac0::from_slice(data))
                .map_err(|_| CryptoError::DecryptFailed)?;
            let mac_alg = self.suite.mac_alg().unwrap_or(HashAlg::HmacSha256);
            let svk = self.keys.svk.clone();
            mac0.verify_tag(&[], |tag, data| {
                let computed = compute_mac(mac_alg, &svk, data)?;
                if bool::from(computed.ct_eq(tag)) {
                    Ok(())
                } else {
                    Err(CryptoError::DecryptFailed)
                }
            })
            .map_err(|_| CryptoError::DecryptFailed)?;
            mac0.payload.ok_or(CryptoError::DecryptFailed)?
        };

        let encrypt0 = CoseEncrypt0::from_tagged_slice(&encrypt0_bytes)
            .or_else(|_| CoseEncrypt0::from_slice(&encrypt0_bytes))
            .map_err(|_| CryptoError::DecryptFailed)?;

        let iv = encrypt0.unprotected.iv.clone();
        if iv.len() != self.suite.iv_len() {
            return Err(CryptoError::DecryptFailed);
        }

        let sek = self.keys.sek.clone();
        let suite = self.suite;
        encrypt0
            .decrypt(&[], |ct, aad| open(suite, &sek, &iv, ct, aad))
            .map_err(|_| CryptoError::DecryptFailed)
    }

    /// Produce the IV for the next outgoing message, advancing CTR state.
    fn next_iv(&mut self, plaintext_len: usize) -> CryptoResult<Vec<u8>> {
        match self.suite {
            CipherSuite::Aes128Ctr | CipherSuite::Aes256Ctr => {
                let mut iv = self.ctr_nonce.clone();
                iv.extend_from_slice(&self.ctr_counter.to_be_bytes());
                let blocks =
                    u32::try_from(plaintext_len.div_ceil(16)).map_err(|_| CryptoError::EncryptFailed)?;
                self.ctr_counter = self
                    .ctr_counter
                    .checked_add(blocks)
                    .ok_or(CryptoError::CounterExhausted)?;
                Ok(iv)
            }
            _ => {
                let mut iv = vec![0u8; self.suite.iv_len()];
                OsRng.fill_bytes(&mut iv);
                Ok(iv)
            }
        }
    }
}

impl std::fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCrypto")
            .field("suite", &self.suite.name())
            .finish_non_exhaustive()
    }
}

fn compute_mac(alg: HashAlg, key: &[u8], data: &[u8]) -> CryptoResult<Vec<u8>> {
    match alg {
        HashAlg::HmacSha256 => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
                .map_err(|_| CryptoError::DecryptFailed)?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        _ => {
            let mut mac = <Hmac<Sha384> as Mac>::new_from_slice(key)
                .map_err(|_| CryptoError::DecryptFailed)?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
    }
}

fn seal(
    suite: CipherSuite,
    sek: &[u8],
    iv: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    match suite {
        CipherSuite::A128Gcm => Aes128Gcm::new_from_slice(sek)
            .map_err(|_| CryptoError::EncryptFailed)?
            .encrypt(iv.into(), payload)
            .map_err(|_| CryptoError::EncryptFailed),
        CipherSuite::A192Gcm => Aes192Gcm::new_from_slice(sek)
            .map_err(|_| CryptoError::EncryptFailed)?
            .encrypt(iv.into(), payload)
            .map_err(|_| CryptoError::EncryptFailed),
        CipherSuite::A256Gcm => Aes256Gcm::new_from_slice(sek)
            .map_err(|_| CryptoError::EncryptFailed)?
            .encrypt(iv.into(), payload)
            .map_err(|_| CryptoError::EncryptFailed),
        CipherSuite::AesCcm64_128_128 => Ccm64Aes128::new_from_slice(sek)
            .map_err(|_| CryptoError::EncryptFailed)?
            .encrypt(iv.into(), payload)
            .map_err(|_| CryptoError::EncryptFailed),
        CipherSuite::AesCcm64_128_256 => Ccm64Aes256::new_from_slice(sek)
            .map_err(|_| CryptoError::EncryptFailed)?
            .encrypt(iv.into(), payload)
            .map_err(|_| CryptoError::EncryptFailed),
        CipherSuite::Aes128Ctr => {
            let mut buf = plaintext.to_vec();
            Aes128Ctr::new_from_slices(sek, iv)
                .map_err(|_| CryptoError::EncryptFailed)?
                .apply_keystream(&mut buf);
            Ok(buf)
        }
        CipherSuite::Aes256Ctr => {
            let mut buf = plaintext.to_vec();
            Aes256Ctr::new_from_slices(sek, iv)
                .map_err(|_| CryptoError::EncryptFailed)?
                .apply_keystream(&mut buf);
            Ok(buf)
        }
        CipherSuite::Aes128Cbc => Ok(Aes128CbcEnc::new_from_slices(sek, iv)
            .map_err(|_| CryptoError::EncryptFailed)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        CipherSuite::Aes256Cbc => Ok(Aes256CbcEnc::new_from_slices(sek, iv)
            .map_err(|_| CryptoError::EncryptFailed)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
    }
}

fn open(
    suite: CipherSuite,
    sek: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    match suite {
        CipherSuite::A128Gcm => Aes128Gcm::new_from_slice(sek)
            .map_err(|_| CryptoError::DecryptFailed)?
            .decrypt(iv.into(), payload)
            .map_err(|_| CryptoError::DecryptFailed),
        CipherSuite::A192Gcm => Aes192Gcm::new_from_slice(sek)
            .map_err(|_| CryptoError::DecryptFailed)?
            .decrypt(iv.into(), payload)
            .map_err(|_| CryptoError::DecryptFailed),
        CipherSuite::A256Gcm => Aes256Gcm::new_from_slice(sek)
            .map_err(|_| CryptoError::DecryptFailed)?
            .decrypt(iv.into(), payload)
            .map_err(|_| CryptoError::DecryptFailed),
        CipherSuite::AesCcm64_128_128 => Ccm64Aes128::new_from_slice(sek)
            .map_err(|_| CryptoError::DecryptFailed)?
            .decrypt(iv.into(), payload)
            .map_err(|_| CryptoError::DecryptFailed),
        CipherSuite::AesCcm64_128_256 => Ccm64Aes256::new_from_slice(sek)
            .map_err(|_| CryptoError::DecryptFailed)?
            .decrypt(iv.into(), payload)
            .map_err(|_| CryptoError::DecryptFailed),
        CipherSuite::Aes128Ctr => {
            let mut buf = ciphertext.to_vec();
            Aes128Ctr::new_from_slices(sek, iv)
                .map_err(|_| CryptoError::DecryptFailed)?
                .apply_keystream(&mut buf);
            Ok(buf)
        }
        CipherSuite::Aes256Ctr => {
            let mut buf = ciphertext.to_vec();
            Aes256Ctr::new_from_slices(sek, iv)
                .map_err(|_| CryptoError::DecryptFailed)?
                .apply_keystream(&mut buf);
            Ok(buf)
        }
        CipherSuite::Aes128Cbc => Aes128CbcDec::new_from_slices(sek, iv)
            .map_err(|_| CryptoError::DecryptFailed)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::DecryptFailed),
        CipherSuite::Aes256Cbc => Aes256CbcDec::new_from_slices(sek, iv)
            .map_err(|_| CryptoError::DecryptFailed)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::DecryptFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_for(suite: CipherSuite) -> SessionKeys {
        SessionKeys {
            sek: vec![0x11; suite.sek_len()],
            svk: vec![0x22; suite.svk_len()],
        }
    }

    fn round_trip(suite: CipherSuite) {
        let mut sender = SessionCrypto::new(suite, keys_for(suite)).unwrap();
        let mut receiver = SessionCrypto::new(suite, keys_for(suite)).unwrap();

        for msg in [&b"hello tunnel"[..], &[0u8; 0], &[0xAB; 1500]] {
            let wire = sender.encrypt(msg).unwrap();
            let plain = receiver.decrypt(&wire).unwrap();
            assert_eq!(plain, msg);
        }
    }

    #[test]
    fn gcm_suites_round_trip() {
        round_trip(CipherSuite::A128Gcm);
        round_trip(CipherSuite::A192Gcm);
        round_trip(CipherSuite::A256Gcm);
    }

    #[test]
    fn ccm_suites_round_trip() {
        round_trip(CipherSuite::AesCcm64_128_128);
        round_trip(CipherSuite::AesCcm64_128_256);
    }

    #[test]
    fn etm_suites_round_trip() {
        round_trip(CipherSuite::Aes128Ctr);
        round_trip(CipherSuite::Aes128Cbc);
        round_trip(CipherSuite::Aes256Ctr);
        round_trip(CipherSuite::Aes256Cbc);
    }

    #[test]
    fn tampering_is_opaque() {
        for suite in [
            CipherSuite::A128Gcm,
            CipherSuite::Aes128Ctr,
            CipherSuite::Aes128Cbc,
        ] {
            let mut sender = SessionCrypto::new(suite, keys_for(suite)).unwrap();
            let mut receiver = SessionCrypto::new(suite, keys_for(suite)).unwrap();
            let mut wire = sender.encrypt(b"payload").unwrap();
            let last = wire.len() - 1;
            wire[last] ^= 0x01;
            assert!(matches!(
                receiver.decrypt(&wire),
                Err(CryptoError::DecryptFailed)
            ));
        }
    }

    #[test]
    fn wrong_key_is_the_same_opaque_error() {
        let suite = CipherSuite::A128Gcm;
        let mut sender = SessionCrypto::new(suite, keys_for(suite)).unwrap();
        let wire = sender.encrypt(b"payload").unwrap();

        let other = SessionKeys {
            sek: vec![0x99; suite.sek_len()],
            svk: vec![],
        };
        let mut receiver = SessionCrypto::new(suite, other).unwrap();
        assert!(matches!(
            receiver.decrypt(&wire),
            Err(CryptoError::DecryptFailed)
        ));
    }

    #[test]
    fn ctr_counter_advances_per_message() {
        let suite = CipherSuite::Aes128Ctr;
        let mut sender = SessionCrypto::new(suite, keys_for(suite)).unwrap();
        assert_eq!(sender.ctr_counter, 0);
        sender.encrypt(&[0u8; 33]).unwrap(); // 3 blocks
        assert_eq!(sender.ctr_counter, 3);
        sender.encrypt(&[0u8; 16]).unwrap(); // 1 block
        assert_eq!(sender.ctr_counter, 4);
    }

    #[test]
    fn ctr_counter_exhaustion_fails_closed() {
        let suite = CipherSuite::Aes128Ctr;
        let mut sender = SessionCrypto::new(suite, keys_for(suite)).unwrap();
        sender.ctr_counter = u32::MAX;
        assert!(matches!(
            sender.encrypt(b"x"),
            Err(CryptoError::CounterExhausted)
        ));
    }

    #[test]
    fn deprecated_ids_are_refused() {
        assert!(matches!(
            CipherSuite::try_from_id(30),
            Err(CryptoError::DeprecatedSuite(30))
        ));
        assert!(matches!(
            CipherSuite::try_from_id(31),
            Err(CryptoError::DeprecatedSuite(31))
        ));
        assert!(matches!(
            CipherSuite::try_from_id(7),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn key_length_table() {
        assert_eq!(CipherSuite::A128Gcm.sek_len(), 16);
        assert_eq!(CipherSuite::A128Gcm.svk_len(), 0);
        assert_eq!(CipherSuite::Aes128Ctr.svk_len(), 32);
        assert_eq!(CipherSuite::Aes256Cbc.svk_len(), 48);
        assert_eq!(CipherSuite::Aes256Ctr.prf_hash(), HashAlg::HmacSha384);
        assert_eq!(CipherSuite::A256Gcm.prf_hash(), HashAlg::HmacSha256);
    }

    #[test]
    fn mismatched_keys_rejected_at_construction() {
        let suite = CipherSuite::A128Gcm;
        let bad = SessionKeys {
            sek: vec![0; 5],
            svk: vec![],
        };
        assert!(SessionCrypto::new(suite, bad).is_err());
    }

    #[test]
    fn id_round_trip() {
        for suite in [
            CipherSuite::A128Gcm,
            CipherSuite::A192Gcm,
            CipherSuite::A256Gcm,
            CipherSuite::AesCcm64_128_128,
            CipherSuite::AesCcm64_128_256,
            CipherSuite::Aes128Ctr,
            CipherSuite::Aes128Cbc,
            CipherSuite::Aes256Ctr,
            CipherSuite::Aes256Cbc,
        ] {
            assert_eq!(CipherSuite::try_from_id(suite.id()).unwrap(), suite);
        }
    }
}
