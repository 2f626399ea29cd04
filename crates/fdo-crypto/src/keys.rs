//! Public-key model and signing keys.
//!
//! An FDO public key travels as `[pkType, pkEnc, pkBody]`. The type and
//! encoding registries are closed; the body varies by encoding (SPKI DER
//! for X509, an array of DER certificates for X5CHAIN, a COSE_Key map for
//! COSEKEY). Two keys are equal iff their canonical encodings are equal.

use ciborium::value::Value;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::pkcs8::{DecodePublicKey as _, EncodePublicKey as _};
use rsa::pkcs8::DecodePublicKey as _;
use rsa::traits::PublicKeyParts as _;
use rsa::{Pkcs1v15Sign, Pss, RsaPrivateKey, RsaPublicKey};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256, Sha384};

use crate::error::{CryptoError, CryptoResult};

/// FDO public-key type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// RSA with restricted 2048-bit modulus (manufacturing restricted).
    Rsa2048Restr = 1,
    /// RSA, PKCS#1 v1.5 signatures.
    RsaPkcs = 5,
    /// RSA, RSASSA-PSS signatures.
    RsaPss = 6,
    /// NIST P-256 (ES256).
    Secp256r1 = 10,
    /// NIST P-384 (ES384).
    Secp384r1 = 11,
}

impl KeyType {
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
            1 => Ok(Self::Rsa2048Restr),
            5 => Ok(Self::RsaPkcs),
            6 => Ok(Self::RsaPss),
            10 => Ok(Self::Secp256r1),
            11 => Ok(Self::Secp384r1),
            other => Err(CryptoError::UnsupportedAlgorithm(format!(
                "key type {other}"
            ))),
        }
    }

    /// Registry name, as used in configuration files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Rsa2048Restr => "RSA2048RESTR",
            Self::RsaPkcs => "RSAPKCS",
            Self::RsaPss => "RSAPSS",
            Self::Secp256r1 => "SECP256R1",
            Self::Secp384r1 => "SECP384R1",
        }
    }
}

/// FDO public-key encoding identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyEncoding {
    /// Key is implied by the crypto context (not used by this server).
    Crypto = 0,
    /// X.509 SubjectPublicKeyInfo, DER.
    X509 = 1,
    /// Ordered X.509 certificate chain, leaf first.
    X5Chain = 2,
    /// COSE_Key map.
    CoseKey = 3,
}

impl KeyEncoding {
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
            0 => Ok(Self::Crypto),
            1 => Ok(Self::X509),
            2 => Ok(Self::X5Chain),
            3 => Ok(Self::CoseKey),
            other => Err(CryptoError::UnsupportedAlgorithm(format!(
                "key encoding {other}"
            ))),
        }
    }
}

/// An FDO public key: `[pkType, pkEnc, pkBody]`.
#[derive(Debug, Clone)]
pub struct PublicKey {
    typ: KeyType,
    enc: KeyEncoding,
    body: Value,
}

impl PublicKey {
    /// Construct from parts. The body is canonicalized on first encode.
    #[must_use]
    pub const fn new(typ: KeyType, enc: KeyEncoding, body: Value) -> Self {
        Self { typ, enc, body }
    }

    /// Wrap an X.509 SubjectPublicKeyInfo.
    #[must_use]
    pub fn x509(typ: KeyType, spki_der: Vec<u8>) -> Self {
        Self::new(typ, KeyEncoding::X509, Value::Bytes(spki_der))
    }

    /// The key type.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.typ
    }

    /// The key encoding.
    #[must_use]
    pub const fn encoding(&self) -> KeyEncoding {
        self.enc
    }

    /// Canonical encoding of the whole `[pkType, pkEnc, pkBody]` array.
    ///
    /// # Errors
    /// Returns a CBOR error if the body cannot be canonicalized.
    pub fn canonical_bytes(&self) -> CryptoResult<Vec<u8>> {
        Ok(fdo_cbor::to_canonical_cbor(self)?)
    }

    /// Build a signature verifier for this key.
    ///
    /// # Errors
    /// Returns `CryptoError::InvalidPublicKey` if the body cannot be parsed
    /// for the declared type and encoding.
    pub fn verifier(&self) -> CryptoResult<Verifier> {
        let spki: Vec<u8> = match (&self.body, self.enc) {
            (Value::Bytes(der), KeyEncoding::X509) => der.clone(),
            (Value::Array(certs), KeyEncoding::X5Chain) => {
                let Some(Value::Bytes(leaf)) = certs.first() else {
                    return Err(CryptoError::InvalidPublicKey);
                };
                spki_from_certificate(leaf)?
            }
            (Value::Map(entries), KeyEncoding::CoseKey) => {
                return verifier_from_cose_key(self.typ, entries);
            }
            _ => return Err(CryptoError::InvalidPublicKey),
        };
        Verifier::from_spki(self.typ, &spki)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        match (self.canonical_bytes(), other.canonical_bytes()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PublicKey {}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.typ.id(), self.enc.id(), &self.body).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (typ, enc, body): (i64, i64, Value) = Deserialize::deserialize(deserializer)?;
        Ok(Self {
            typ: KeyType::try_from_id(typ).map_err(D::Error::custom)?,
            enc: KeyEncoding::try_from_id(enc).map_err(D::Error::custom)?,
            body,
        })
    }
}

/// Extract the SubjectPublicKeyInfo DER from an X.509 certificate.
pub(crate) fn spki_from_certificate(cert_der: &[u8]) -> CryptoResult<Vec<u8>> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;
    Ok(cert.tbs_certificate.subject_pki.raw.to_vec())
}

fn verifier_from_cose_key(typ: KeyType, entries: &[(Value, Value)]) -> CryptoResult<Verifier> {
    let get = |label: i64| -> Option<&Value> {
        entries.iter().find_map(|(k, v)| match k {
            Value::Integer(i) if i64::try_from(*i) == Ok(label) => Some(v),
            _ => None,
        })
    };
    // EC2 keys: x is label -2, y is label -3.
    let (Some(Value::Bytes(x)), Some(Value::Bytes(y))) = (get(-2), get(-3)) else {
        return Err(CryptoError::InvalidPublicKey);
    };
    match typ {
        KeyType::Secp256r1 => {
            if x.len() != 32 || y.len() != 32 {
                return Err(CryptoError::InvalidPublicKey);
            }
            let point = p256::EncodedPoint::from_affine_coordinates(
                p256::FieldBytes::from_slice(x),
                p256::FieldBytes::from_slice(y),
                false,
            );
            let key = p256::ecdsa::VerifyingKey::from_encoded_point(&point)
                .map_err(|_| CryptoError::InvalidPublicKey)?;
            Ok(Verifier::Es256(key))
        }
        KeyType::Secp384r1 => {
            if x.len() != 48 || y.len() != 48 {
                return Err(CryptoError::InvalidPublicKey);
            }
            let point = p384::EncodedPoint::from_affine_coordinates(
                p384::FieldBytes::from_slice(x),
                p384::FieldBytes::from_slice(y),
                false,
            );
            let key = p384::ecdsa::VerifyingKey::from_encoded_point(&point)
                .map_err(|_| CryptoError::InvalidPublicKey)?;
            Ok(Verifier::Es384(key))
        }
        _ => Err(CryptoError::InvalidPublicKey),
    }
}

/// A ready-to-use signature verifier.
#[derive(Debug, Clone)]
pub enum Verifier {
    /// ECDSA P-256 with SHA-256.
    Es256(p256::ecdsa::VerifyingKey),
    /// ECDSA P-384 with SHA-384.
    Es384(p384::ecdsa::VerifyingKey),
    /// RSASSA-PKCS1-v1_5; digest chosen by modulus size.
    RsaPkcs(RsaPublicKey),
    /// RSASSA-PSS; digest chosen by modulus size.
    RsaPss(RsaPublicKey),
}

impl Verifier {
    /// Parse a SubjectPublicKeyInfo for the given key type.
    ///
    /// # Errors
    /// Returns `CryptoError::InvalidPublicKey` if the DER does not parse as
    /// the declared type.
    pub fn from_spki(typ: KeyType, spki_der: &[u8]) -> CryptoResult<Self> {
        match typ {
            KeyType::Secp256r1 => p256::ecdsa::VerifyingKey::from_public_key_der(spki_der)
                .map(Self::Es256)
                .map_err(|_| CryptoError::InvalidPublicKey),
            KeyType::Secp384r1 => p384::ecdsa::VerifyingKey::from_public_key_der(spki_der)
                .map(Self::Es384)
                .map_err(|_| CryptoError::InvalidPublicKey),
            KeyType::Rsa2048Restr | KeyType::RsaPkcs => {
                RsaPublicKey::from_public_key_der(spki_der)
                    .map(Self::RsaPkcs)
                    .map_err(|_| CryptoError::InvalidPublicKey)
            }
            KeyType::RsaPss => RsaPublicKey::from_public_key_der(spki_der)
                .map(Self::RsaPss)
                .map_err(|_| CryptoError::InvalidPublicKey),
        }
    }

    /// COSE algorithm identifier this verifier checks.
    #[must_use]
    pub fn cose_alg(&self) -> i64 {
        match self {
            Self::Es256(_) => -7,
            Self::Es384(_) => -35,
            Self::RsaPkcs(k) => {
                if k.size() > 256 {
                    -258 // RS384
                } else {
                    -257 // RS256
                }
            }
            Self::RsaPss(k) => {
                if k.size() > 256 {
                    -38 // PS384
                } else {
                    -37 // PS256
                }
            }
        }
    }

    /// Verify `signature` over `data`.
    ///
    /// # Errors
    /// Returns `CryptoError::SignatureVerificationFailed` on any mismatch.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> CryptoResult<()> {
        match self {
            Self::Es256(key) => {
                let sig = p256::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| CryptoError::SignatureVerificationFailed)?;
                key.verify(data, &sig)
                    .map_err(|_| CryptoError::SignatureVerificationFailed)
            }
            Self::Es384(key) => {
                let sig = p384::ecdsa::Signature::from_slice(signature)
                    .map_err(|_| CryptoError::SignatureVerificationFailed)?;
                key.verify(data, &sig)
                    .map_err(|_| CryptoError::SignatureVerificationFailed)
            }
            Self::RsaPkcs(key) => {
                if key.size() > 256 {
                    let digest = Sha384::digest(data);
                    key.verify(Pkcs1v15Sign::new::<Sha384>(), &digest, signature)
                } else {
                    let digest = Sha256::digest(data);
                    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
                }
                .map_err(|_| CryptoError::SignatureVerificationFailed)
            }
            Self::RsaPss(key) => {
                if key.size() > 256 {
                    let digest = Sha384::digest(data);
                    key.verify(Pss::new::<Sha384>(), &digest, signature)
                } else {
                    let digest = Sha256::digest(data);
                    key.verify(Pss::new::<Sha256>(), &digest, signature)
                }
                .map_err(|_| CryptoError::SignatureVerificationFailed)
            }
        }
    }
}

/// A server-held signing key (manufacturer or owner).
#[derive(Clone)]
pub enum SigningKey {
    /// ECDSA P-256.
    Es256(p256::ecdsa::SigningKey),
    /// ECDSA P-384.
    Es384(p384::ecdsa::SigningKey),
    /// RSASSA-PKCS1-v1_5.
    RsaPkcs(Box<RsaPrivateKey>),
}

impl SigningKey {
    /// Generate a fresh P-256 key.
    #[must_use]
    pub fn generate_es256() -> Self {
        Self::Es256(p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Generate a fresh P-384 key.
    #[must_use]
    pub fn generate_es384() -> Self {
        Self::Es384(p384::ecdsa::SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// The FDO key type of this key.
    #[must_use]
    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Es256(_) => KeyType::Secp256r1,
            Self::Es384(_) => KeyType::Secp384r1,
            Self::RsaPkcs(_) => KeyType::RsaPkcs,
        }
    }

    /// COSE algorithm identifier this key signs with.
    #[must_use]
    pub fn cose_alg(&self) -> i64 {
        match self {
            Self::Es256(_) => -7,
            Self::Es384(_) => -35,
            Self::RsaPkcs(k) => {
                if k.size() > 256 {
                    -258
                } else {
                    -257
                }
            }
        }
    }

    /// The public half as an X509-encoded FDO public key.
    ///
    /// # Errors
    /// Returns `CryptoError::InvalidPublicKey` if SPKI encoding fails.
    pub fn public_key(&self) -> CryptoResult<PublicKey> {
        let spki = match self {
            Self::Es256(key) => key
                .verifying_key()
                .to_public_key_der()
                .map_err(|_| CryptoError::InvalidPublicKey)?
                .into_vec(),
            Self::Es384(key) => key
                .verifying_key()
                .to_public_key_der()
                .map_err(|_| CryptoError::InvalidPublicKey)?
                .into_vec(),
            Self::RsaPkcs(key) => rsa::pkcs8::EncodePublicKey::to_public_key_der(
                &key.to_public_key(),
            )
            .map_err(|_| CryptoError::InvalidPublicKey)?
            .into_vec(),
        };
        Ok(PublicKey::x509(self.key_type(), spki))
    }

    /// The matching verifier.
    ///
    /// # Errors
    /// Returns `CryptoError::InvalidPublicKey` if the public half cannot be
    /// derived.
    pub fn verifier(&self) -> CryptoResult<Verifier> {
        match self {
            Self::Es256(key) => Ok(Verifier::Es256(*key.verifying_key())),
            Self::Es384(key) => Ok(Verifier::Es384(*key.verifying_key())),
            Self::RsaPkcs(key) => Ok(Verifier::RsaPkcs(key.to_public_key())),
        }
    }

    /// Sign `data`, returning the COSE-form signature bytes.
    ///
    /// # Errors
    /// Returns `CryptoError::SignatureVerificationFailed` if the backend
    /// rejects the operation.
    pub fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        match self {
            Self::Es256(key) => {
                let sig: p256::ecdsa::Signature = key.sign(data);
                Ok(sig.to_bytes().to_vec())
            }
            Self::Es384(key) => {
                let sig: p384::ecdsa::Signature = key.sign(data);
                Ok(sig.to_bytes().to_vec())
            }
            Self::RsaPkcs(key) => {
                let out = if key.size() > 256 {
                    let digest = Sha384::digest(data);
                    key.sign(Pkcs1v15Sign::new::<Sha384>(), &digest)
                } else {
                    let digest = Sha256::digest(data);
                    key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                };
                out.map_err(|_| CryptoError::SignatureVerificationFailed)
            }
        }
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_type", &self.key_type())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn es256_sign_verify_round_trip() {
        let key = SigningKey::generate_es256();
        let sig = key.sign(b"message").unwrap();
        key.verifier().unwrap().verify(b"message", &sig).unwrap();
    }

    #[test]
    fn es384_sign_verify_round_trip() {
        let key = SigningKey::generate_es384();
        let sig = key.sign(b"message").unwrap();
        key.verifier().unwrap().verify(b"message", &sig).unwrap();
    }

    #[test]
    fn tampered_signature_rejected() {
        let key = SigningKey::generate_es256();
        let mut sig = key.sign(b"message").unwrap();
        sig[10] ^= 0xff;
        assert!(matches!(
            key.verifier().unwrap().verify(b"message", &sig),
            Err(CryptoError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn tampered_payload_rejected() {
        let key = SigningKey::generate_es256();
        let sig = key.sign(b"message").unwrap();
        assert!(key.verifier().unwrap().verify(b"messagf", &sig).is_err());
    }

    #[test]
    fn public_key_wire_round_trip() {
        let key = SigningKey::generate_es256();
        let pk = key.public_key().unwrap();
        let bytes = fdo_cbor::to_canonical_cbor(&pk).unwrap();
        let decoded: PublicKey = fdo_cbor::from_cbor(&bytes).unwrap();
        assert_eq!(decoded, pk);
        assert_eq!(decoded.key_type(), KeyType::Secp256r1);
        assert_eq!(decoded.encoding(), KeyEncoding::X509);
    }

    #[test]
    fn spki_round_trips_into_verifier() {
        let key = SigningKey::generate_es384();
        let pk = key.public_key().unwrap();
        let verifier = pk.verifier().unwrap();
        let sig = key.sign(b"data").unwrap();
        verifier.verify(b"data", &sig).unwrap();
    }

    #[test]
    fn equality_is_by_canonical_encoding() {
        let key = SigningKey::generate_es256();
        let a = key.public_key().unwrap();
        let b = key.public_key().unwrap();
        assert_eq!(a, b);

        let other = SigningKey::generate_es256().public_key().unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn key_type_names_parse_ids() {
        for typ in [
            KeyType::Rsa2048Restr,
            KeyType::RsaPkcs,
            KeyType::RsaPss,
            KeyType::Secp256r1,
            KeyType::Secp384r1,
        ] {
            assert_eq!(KeyType::try_from_id(typ.id()).unwrap(), typ);
        }
        assert!(KeyType::try_from_id(99).is_err());
    }
}
