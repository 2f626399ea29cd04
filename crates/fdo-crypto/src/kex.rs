//! Key-exchange suites and session-key derivation.
//!
//! FDO negotiates one of six suites in TO2.HelloDevice. The owner is
//! party A (its parameter rides in ProveOVHdr), the device is party B
//! (ProveDevice). Both halves are implemented so the honest-party
//! agreement property can be exercised end to end.
//!
//! The derived secret feeds an SP 800-108 counter-mode KDF (HMAC with the
//! cipher suite's PRF hash, label `"FIDO-KDF"`, context
//! `"AutomaticOnboardTunnel"`) producing `SEK ‖ SVK`.

use hmac::{Hmac, Mac};
use num_bigint_dig::BigUint;
use p256::elliptic_curve::sec1::{FromEncodedPoint as _, ToEncodedPoint as _};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Sha256, Sha384};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::hash::HashAlg;

/// RFC 3526 group 14 prime (2048-bit), big-endian hex.
const MODP_2048_PRIME: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// RFC 3526 group 15 prime (3072-bit), big-endian hex.
const MODP_3072_PRIME: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

/// Key-exchange suite names from the FDO registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexSuite {
    /// Diffie–Hellman over RFC 3526 group 14 (2048-bit MODP).
    DhkexId14,
    /// Diffie–Hellman over RFC 3526 group 15 (3072-bit MODP).
    DhkexId15,
    /// ECDH over NIST P-256.
    Ecdh256,
    /// ECDH over NIST P-384.
    Ecdh384,
    /// RSA-OAEP key transport against a 2048-bit owner key.
    Asymkex2048,
    /// RSA-OAEP key transport against a 3072-bit owner key.
    Asymkex3072,
}

impl KexSuite {
    /// Wire name of the suite.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DhkexId14 => "DHKEXid14",
            Self::DhkexId15 => "DHKEXid15",
            Self::Ecdh256 => "ECDH256",
            Self::Ecdh384 => "ECDH384",
            Self::Asymkex2048 => "ASYMKEX2048",
            Self::Asymkex3072 => "ASYMKEX3072",
        }
    }

    /// Parse a wire name.
    ///
    /// # Errors
    /// Returns `CryptoError::UnsupportedAlgorithm` for unknown names.
    pub fn try_from_name(name: &str) -> CryptoResult<Self> {
        match name {
            "DHKEXid14" => Ok(Self::DhkexId14),
            "DHKEXid15" => Ok(Self::DhkexId15),
            "ECDH256" => Ok(Self::Ecdh256),
            "ECDH384" => Ok(Self::Ecdh384),
            "ASYMKEX2048" => Ok(Self::Asymkex2048),
            "ASYMKEX3072" => Ok(Self::Asymkex3072),
            other => Err(CryptoError::UnsupportedAlgorithm(format!(
                "kex suite {other}"
            ))),
        }
    }

    /// Whether the suite needs the owner's RSA decryption key.
    #[must_use]
    pub const fn is_asymkex(self) -> bool {
        matches!(self, Self::Asymkex2048 | Self::Asymkex3072)
    }

    const fn random_len(self) -> usize {
        match self {
            Self::Ecdh256 => 16,
            Self::Ecdh384 => 48,
            Self::Asymkex2048 => 32,
            Self::Asymkex3072 => 96,
            Self::DhkexId14 | Self::DhkexId15 => 0,
        }
    }

    const fn dh_exponent_len(self) -> usize {
        match self {
            Self::DhkexId15 => 48,
            _ => 32,
        }
    }

    fn dh_prime(self) -> BigUint {
        let hex = match self {
            Self::DhkexId15 => MODP_3072_PRIME,
            _ => MODP_2048_PRIME,
        };
        BigUint::parse_bytes(hex.as_bytes(), 16).expect("constant prime parses")
    }

    const fn dh_group_len(self) -> usize {
        match self {
            Self::DhkexId15 => 384,
            _ => 256,
        }
    }

    /// Begin the exchange as party A (the owner).
    ///
    /// # Errors
    /// Returns a crypto error if key generation fails.
    pub fn owner_start(self) -> CryptoResult<OwnerKexState> {
        match self {
            Self::Ecdh256 => {
                let secret = p256::SecretKey::random(&mut OsRng);
                let point = secret.public_key().to_encoded_point(false);
                let random = random_bytes(self.random_len());
                let param = ecdh_message(
                    point.x().ok_or(CryptoError::KeyDerivationFailed)?.as_slice(),
                    point.y().ok_or(CryptoError::KeyDerivationFailed)?.as_slice(),
                    &random,
                );
                Ok(OwnerKexState {
                    suite: self,
                    secret: secret.to_bytes().as_slice().to_vec(),
                    random,
                    param,
                })
            }
            Self::Ecdh384 => {
                let secret = p384::SecretKey::random(&mut OsRng);
                let point = secret.public_key().to_encoded_point(false);
                let random = random_bytes(self.random_len());
                let param = ecdh_message(
                    point.x().ok_or(CryptoError::KeyDerivationFailed)?.as_slice(),
                    point.y().ok_or(CryptoError::KeyDerivationFailed)?.as_slice(),
                    &random,
                );
                Ok(OwnerKexState {
                    suite: self,
                    secret: secret.to_bytes().as_slice().to_vec(),
                    random,
                    param,
                })
            }
            Self::DhkexId14 | Self::DhkexId15 => {
                let prime = self.dh_prime();
                let exponent = random_bytes(self.dh_exponent_len());
                let a = BigUint::from_bytes_be(&exponent);
                let xa = BigUint::from(2u8).modpow(&a, &prime);
                Ok(OwnerKexState {
                    suite: self,
                    secret: exponent,
                    random: Vec::new(),
                    param: to_fixed_be(&xa, self.dh_group_len()),
                })
            }
            Self::Asymkex2048 | Self::Asymkex3072 => {
                let random = random_bytes(self.random_len());
                Ok(OwnerKexState {
                    suite: self,
                    secret: Vec::new(),
                    random: random.clone(),
                    param: random,
                })
            }
        }
    }

    /// Run party B (the device). Used by device simulators and tests.
    ///
    /// `owner_rsa` is required for the ASYMKEX suites.
    ///
    /// # Errors
    /// Returns `InvalidKexParameter` for an unusable party-A message.
    pub fn device_respond(
        self,
        param_a: &[u8],
        owner_rsa: Option<&RsaPublicKey>,
    ) -> CryptoResult<DeviceKexResult> {
        match self {
            Self::Ecdh256 => {
                let (ax, ay, a_random) = parse_ecdh_message(param_a)?;
                let secret = p256::SecretKey::random(&mut OsRng);
                let point = secret.public_key().to_encoded_point(false);
                let b_random = random_bytes(self.random_len());
                let param_b = ecdh_message(
                    point.x().ok_or(CryptoError::KeyDerivationFailed)?.as_slice(),
                    point.y().ok_or(CryptoError::KeyDerivationFailed)?.as_slice(),
                    &b_random,
                );
                let shx = p256_shared_x(&secret.to_bytes(), &ax, &ay)?;
                Ok(DeviceKexResult {
                    param_b,
                    shared: SharedSecret::concat(&[&shx, &b_random, &a_random]),
                })
            }
            Self::Ecdh384 => {
                let (ax, ay, a_random) = parse_ecdh_message(param_a)?;
                let secret = p384::SecretKey::random(&mut OsRng);
                let point = secret.public_key().to_encoded_point(false);
                let b_random = random_bytes(self.random_len());
                let param_b = ecdh_message(
                    point.x().ok_or(CryptoError::KeyDerivationFailed)?.as_slice(),
                    point.y().ok_or(CryptoError::KeyDerivationFailed)?.as_slice(),
                    &b_random,
                );
                let shx = p384_shared_x(&secret.to_bytes(), &ax, &ay)?;
                Ok(DeviceKexResult {
                    param_b,
                    shared: SharedSecret::concat(&[&shx, &b_random, &a_random]),
                })
            }
            Self::DhkexId14 | Self::DhkexId15 => {
                let prime = self.dh_prime();
                let xa = dh_check(param_a, &prime)?;
                let exponent = random_bytes(self.dh_exponent_len());
                let b = BigUint::from_bytes_be(&exponent);
                let xb = BigUint::from(2u8).modpow(&b, &prime);
                let shse = xa.modpow(&b, &prime);
                Ok(DeviceKexResult {
                    param_b: to_fixed_be(&xb, self.dh_group_len()),
                    shared: SharedSecret(to_fixed_be(&shse, self.dh_group_len())),
                })
            }
            Self::Asymkex2048 | Self::Asymkex3072 => {
                let owner_rsa = owner_rsa.ok_or(CryptoError::InvalidKexParameter)?;
                if param_a.len() != self.random_len() {
                    return Err(CryptoError::InvalidKexParameter);
                }
                let xb = random_bytes(self.random_len());
                let param_b = owner_rsa
                    .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &xb)
                    .map_err(|_| CryptoError::EncryptFailed)?;
                Ok(DeviceKexResult {
                    param_b,
                    shared: SharedSecret::concat(&[&xb, param_a]),
                })
            }
        }
    }
}

impl Serialize for KexSuite {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for KexSuite {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::try_from_name(&name).map_err(D::Error::custom)
    }
}

/// Party-A state held by the owner across the TO2 exchange.
///
/// Serializable so it survives in the session row between ProveOVHdr and
/// ProveDevice. Secrets are zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct OwnerKexState {
    #[zeroize(skip)]
    suite: KexSuite,
    #[serde(with = "serde_bytes")]
    secret: Vec<u8>,
    #[serde(with = "serde_bytes")]
    random: Vec<u8>,
    #[serde(with = "serde_bytes")]
    param: Vec<u8>,
}

impl OwnerKexState {
    /// The suite this exchange runs.
    #[must_use]
    pub const fn suite(&self) -> KexSuite {
        self.suite
    }

    /// The party-A parameter to send to the device.
    #[must_use]
    pub fn param_a(&self) -> &[u8] {
        &self.param
    }

    /// Complete the exchange with the device's party-B parameter.
    ///
    /// `asymkex_key` supplies the owner RSA key for the ASYMKEX suites.
    ///
    /// # Errors
    /// Returns `InvalidKexParameter` for an unusable party-B message.
    pub fn derive(
        &self,
        param_b: &[u8],
        asymkex_key: Option<&RsaPrivateKey>,
    ) -> CryptoResult<SharedSecret> {
        match self.suite {
            KexSuite::Ecdh256 => {
                let (bx, by, b_random) = parse_ecdh_message(param_b)?;
                let shx = p256_shared_x(&self.secret, &bx, &by)?;
                Ok(SharedSecret::concat(&[&shx, &b_random, &self.random]))
            }
            KexSuite::Ecdh384 => {
                let (bx, by, b_random) = parse_ecdh_message(param_b)?;
                let shx = p384_shared_x(&self.secret, &bx, &by)?;
                Ok(SharedSecret::concat(&[&shx, &b_random, &self.random]))
            }
            KexSuite::DhkexId14 | KexSuite::DhkexId15 => {
                let prime = self.suite.dh_prime();
                let xb = dh_check(param_b, &prime)?;
                let a = BigUint::from_bytes_be(&self.secret);
                let shse = xb.modpow(&a, &prime);
                Ok(SharedSecret(to_fixed_be(&shse, self.suite.dh_group_len())))
            }
            KexSuite::Asymkex2048 | KexSuite::Asymkex3072 => {
                let key = asymkex_key.ok_or(CryptoError::InvalidKexParameter)?;
                let xb = key
                    .decrypt(Oaep::new::<Sha256>(), param_b)
                    .map_err(|_| CryptoError::DecryptFailed)?;
                if xb.len() != self.suite.random_len() {
                    return Err(CryptoError::InvalidKexParameter);
                }
                Ok(SharedSecret::concat(&[&xb, &self.random]))
            }
        }
    }
}

impl std::fmt::Debug for OwnerKexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerKexState")
            .field("suite", &self.suite.name())
            .finish_non_exhaustive()
    }
}

/// Device-side result of an exchange: the party-B message plus the secret.
pub struct DeviceKexResult {
    /// Parameter to send back to the owner.
    pub param_b: Vec<u8>,
    /// The shared secret; must match the owner's derivation.
    pub shared: SharedSecret,
}

/// A derived shared secret, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    fn concat(parts: &[&[u8]]) -> Self {
        Self(parts.concat())
    }

    /// Borrow the secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Session encryption and verification keys.
///
/// `svk` is empty for authenticated-encryption suites. Zeroized on drop;
/// serializable so the session row can carry it for the tunnel phase.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Session encryption key.
    #[serde(with = "serde_bytes")]
    pub sek: Vec<u8>,
    /// Session verification (MAC) key; empty for AE cipher suites.
    #[serde(with = "serde_bytes")]
    pub svk: Vec<u8>,
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("sek_len", &self.sek.len())
            .field("svk_len", &self.svk.len())
            .finish()
    }
}

/// Derive `SEK ‖ SVK` from a shared secret.
///
/// # Errors
/// Returns `UnsupportedAlgorithm` if `prf` is not a keyed algorithm.
pub fn derive_session_keys(
    shared: &SharedSecret,
    prf: HashAlg,
    sek_len: usize,
    svk_len: usize,
) -> CryptoResult<SessionKeys> {
    let okm = kdf(prf, shared.as_bytes(), sek_len + svk_len)?;
    let (sek, svk) = okm.split_at(sek_len);
    Ok(SessionKeys {
        sek: sek.to_vec(),
        svk: svk.to_vec(),
    })
}

/// SP 800-108 KDF in counter mode.
///
/// `K(i) = HMAC(key, i ‖ "FIDO-KDF" ‖ 0x00 ‖ "AutomaticOnboardTunnel" ‖ L)`
/// with an 8-bit counter and a 16-bit output length in bits.
fn kdf(prf: HashAlg, key: &[u8], out_len: usize) -> CryptoResult<Vec<u8>> {
    let mut fixed = Vec::with_capacity(32);
    fixed.extend_from_slice(b"FIDO-KDF");
    fixed.push(0x00);
    fixed.extend_from_slice(b"AutomaticOnboardTunnel");
    let bits =
        u16::try_from(out_len * 8).map_err(|_| CryptoError::KeyDerivationFailed)?;
    fixed.extend_from_slice(&bits.to_be_bytes());

    let mut out = Vec::with_capacity(out_len);
    let mut counter = 1u8;
    while out.len() < out_len {
        match prf {
            HashAlg::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .map_err(|_| CryptoError::KeyDerivationFailed)?;
                mac.update(&[counter]);
                mac.update(&fixed);
                out.extend_from_slice(&mac.finalize().into_bytes());
            }
            HashAlg::HmacSha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(key)
                    .map_err(|_| CryptoError::KeyDerivationFailed)?;
                mac.update(&[counter]);
                mac.update(&fixed);
                out.extend_from_slice(&mac.finalize().into_bytes());
            }
            _ => {
                return Err(CryptoError::UnsupportedAlgorithm(
                    "KDF requires a keyed PRF".into(),
                ));
            }
        }
        counter = counter.checked_add(1).ok_or(CryptoError::KeyDerivationFailed)?;
    }
    out.truncate(out_len);
    Ok(out)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// `len16(x) ‖ x ‖ len16(y) ‖ y ‖ len16(random) ‖ random`.
fn ecdh_message(x: &[u8], y: &[u8], random: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + x.len() + y.len() + random.len());
    for part in [x, y, random] {
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(part.len() as u16).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

fn parse_ecdh_message(bytes: &[u8]) -> CryptoResult<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut rest = bytes;
    let mut take = || -> CryptoResult<Vec<u8>> {
        if rest.len() < 2 {
            return Err(CryptoError::InvalidKexParameter);
        }
        let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
        rest = &rest[2..];
        if rest.len() < len {
            return Err(CryptoError::InvalidKexParameter);
        }
        let (part, tail) = rest.split_at(len);
        rest = tail;
        Ok(part.to_vec())
    };
    let x = take()?;
    let y = take()?;
    let random = take()?;
    if !rest.is_empty() {
        return Err(CryptoError::InvalidKexParameter);
    }
    Ok((x, y, random))
}

fn p256_shared_x(scalar: &[u8], peer_x: &[u8], peer_y: &[u8]) -> CryptoResult<Vec<u8>> {
    if peer_x.len() != 32 || peer_y.len() != 32 {
        return Err(CryptoError::InvalidKexParameter);
    }
    let secret =
        p256::SecretKey::from_slice(scalar).map_err(|_| CryptoError::InvalidKexParameter)?;
    let point = p256::EncodedPoint::from_affine_coordinates(
        p256::FieldBytes::from_slice(peer_x),
        p256::FieldBytes::from_slice(peer_y),
        false,
    );
    let peer = Option::<p256::PublicKey>::from(p256::PublicKey::from_encoded_point(&point))
        .ok_or(CryptoError::InvalidKexParameter)?;
    let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    Ok(shared.raw_secret_bytes().as_slice().to_vec())
}

fn p384_shared_x(scalar: &[u8], peer_x: &[u8], peer_y: &[u8]) -> CryptoResult<Vec<u8>> {
    if peer_x.len() != 48 || peer_y.len() != 48 {
        return Err(CryptoError::InvalidKexParameter);
    }
    let secret =
        p384::SecretKey::from_slice(scalar).map_err(|_| CryptoError::InvalidKexParameter)?;
    let point = p384::EncodedPoint::from_affine_coordinates(
        p384::FieldBytes::from_slice(peer_x),
        p384::FieldBytes::from_slice(peer_y),
        false,
    );
    let peer = Option::<p384::PublicKey>::from(p384::PublicKey::from_encoded_point(&point))
        .ok_or(CryptoError::InvalidKexParameter)?;
    let shared = p384::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    Ok(shared.raw_secret_bytes().as_slice().to_vec())
}

/// Reject trivial DH public values.
fn dh_check(bytes: &[u8], prime: &BigUint) -> CryptoResult<BigUint> {
    let value = BigUint::from_bytes_be(bytes);
    let one = BigUint::from(1u8);
    if value <= one || value >= prime - &one {
        return Err(CryptoError::InvalidKexParameter);
    }
    Ok(value)
}

fn to_fixed_be(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agree(suite: KexSuite) -> (SharedSecret, SharedSecret) {
        let owner = suite.owner_start().unwrap();
        let device = suite.device_respond(owner.param_a(), None).unwrap();
        let owner_secret = owner.derive(&device.param_b, None).unwrap();
        (owner_secret, device.shared)
    }

    #[test]
    fn ecdh256_honest_parties_agree() {
        let (a, b) = agree(KexSuite::Ecdh256);
        assert_eq!(a.as_bytes(), b.as_bytes());
        // Shx(32) + deviceRandom(16) + ownerRandom(16)
        assert_eq!(a.as_bytes().len(), 64);
    }

    #[test]
    fn ecdh384_honest_parties_agree() {
        let (a, b) = agree(KexSuite::Ecdh384);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes().len(), 48 + 48 + 48);
    }

    #[test]
    fn dhkex14_honest_parties_agree() {
        let (a, b) = agree(KexSuite::DhkexId14);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.as_bytes().len(), 256);
    }

    #[test]
    fn asymkex2048_honest_parties_agree() {
        let rsa_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let rsa_pub = rsa_key.to_public_key();

        let owner = KexSuite::Asymkex2048.owner_start().unwrap();
        let device = KexSuite::Asymkex2048
            .device_respond(owner.param_a(), Some(&rsa_pub))
            .unwrap();
        let owner_secret = owner.derive(&device.param_b, Some(&rsa_key)).unwrap();
        assert_eq!(owner_secret.as_bytes(), device.shared.as_bytes());
    }

    #[test]
    fn corrupted_nonce_diverges() {
        let owner = KexSuite::Ecdh256.owner_start().unwrap();
        let device = KexSuite::Ecdh256.device_respond(owner.param_a(), None).unwrap();

        // Flip a bit inside the device random (the trailing section).
        let mut corrupted = device.param_b.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;

        let honest = owner.derive(&device.param_b, None).unwrap();
        let diverged = owner.derive(&corrupted, None).unwrap();
        assert_ne!(honest.as_bytes(), diverged.as_bytes());
    }

    #[test]
    fn dh_rejects_trivial_values() {
        let owner = KexSuite::DhkexId14.owner_start().unwrap();
        assert!(matches!(
            owner.derive(&[0x01], None),
            Err(CryptoError::InvalidKexParameter)
        ));
        assert!(matches!(
            owner.derive(&[0x00], None),
            Err(CryptoError::InvalidKexParameter)
        ));
    }

    #[test]
    fn ecdh_message_round_trip() {
        let msg = ecdh_message(&[1; 32], &[2; 32], &[3; 16]);
        let (x, y, r) = parse_ecdh_message(&msg).unwrap();
        assert_eq!(x, vec![1; 32]);
        assert_eq!(y, vec![2; 32]);
        assert_eq!(r, vec![3; 16]);

        assert!(parse_ecdh_message(&msg[..msg.len() - 1]).is_err());
    }

    #[test]
    fn kdf_is_deterministic_and_length_exact() {
        let shared = SharedSecret(vec![0x42; 64]);
        let k1 = derive_session_keys(&shared, HashAlg::HmacSha256, 16, 32).unwrap();
        let k2 = derive_session_keys(&shared, HashAlg::HmacSha256, 16, 32).unwrap();
        assert_eq!(k1.sek, k2.sek);
        assert_eq!(k1.svk, k2.svk);
        assert_eq!(k1.sek.len(), 16);
        assert_eq!(k1.svk.len(), 32);
        assert_ne!(k1.sek, k1.svk[..16].to_vec());
    }

    #[test]
    fn kdf_differs_by_prf() {
        let shared = SharedSecret(vec![0x42; 64]);
        let a = derive_session_keys(&shared, HashAlg::HmacSha256, 32, 0).unwrap();
        let b = derive_session_keys(&shared, HashAlg::HmacSha384, 32, 0).unwrap();
        assert_ne!(a.sek, b.sek);
    }

    #[test]
    fn owner_state_survives_serialization() {
        let owner = KexSuite::Ecdh256.owner_start().unwrap();
        let bytes = fdo_cbor::to_canonical_cbor(&owner).unwrap();
        let restored: OwnerKexState = fdo_cbor::from_cbor(&bytes).unwrap();

        let device = KexSuite::Ecdh256.device_respond(owner.param_a(), None).unwrap();
        let secret = restored.derive(&device.param_b, None).unwrap();
        assert_eq!(secret.as_bytes(), device.shared.as_bytes());
    }

    #[test]
    fn suite_names_round_trip() {
        for suite in [
            KexSuite::DhkexId14,
            KexSuite::DhkexId15,
            KexSuite::Ecdh256,
            KexSuite::Ecdh384,
            KexSuite::Asymkex2048,
            KexSuite::Asymkex3072,
        ] {
            assert_eq!(KexSuite::try_from_name(suite.name()).unwrap(), suite);
        }
        assert!(KexSuite::try_from_name("ECDH521").is_err());
    }
}
