//! Device certificate issuance for DI.
//!
//! During Device Initialization the device submits a PKCS#10 request for
//! its attestation key; the manufacturing CA issues a leaf and returns the
//! chain leaf-first. The chain's leaf public key later authenticates the
//! device in TO1 and TO2.

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, KeyPair,
};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyType, Verifier, spki_from_certificate};

/// The manufacturing certificate authority for device attestation keys.
pub struct DeviceCertAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
    cert_der: Vec<u8>,
}

impl DeviceCertAuthority {
    /// Generate a fresh self-signed P-256 CA.
    ///
    /// # Errors
    /// Returns `CryptoError::Certificate` if generation fails.
    pub fn generate(common_name: &str) -> CryptoResult<Self> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;

        let mut params = CertificateParams::new(Vec::new())
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let cert = params
            .self_signed(&key)
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        let cert_der = cert.der().to_vec();
        Ok(Self { cert, key, cert_der })
    }

    /// The CA certificate, DER.
    #[must_use]
    pub fn ca_certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Issue a device certificate from a PKCS#10 request.
    ///
    /// Returns the chain leaf-first: `[device, ca]`.
    ///
    /// # Errors
    /// Returns `CryptoError::Certificate` if the CSR does not parse or
    /// signing fails.
    pub fn sign_device_certificate(&self, csr_der: &[u8]) -> CryptoResult<Vec<Vec<u8>>> {
        let csr = CertificateSigningRequestParams::from_der(&csr_der.to_vec().into())
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        let leaf = csr
            .signed_by(&self.cert, &self.key)
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        Ok(vec![leaf.der().to_vec(), self.cert_der.clone()])
    }
}

impl std::fmt::Debug for DeviceCertAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCertAuthority").finish_non_exhaustive()
    }
}

/// Build a PKCS#10 request for a P-256 attestation key.
///
/// Device-side helper, used by simulators and tests.
///
/// # Errors
/// Returns `CryptoError::Certificate` if key conversion or serialization
/// fails.
pub fn generate_device_csr(
    device_key: &p256::ecdsa::SigningKey,
    common_name: &str,
) -> CryptoResult<Vec<u8>> {
    use p256::pkcs8::EncodePrivateKey as _;

    let pkcs8 = p256::SecretKey::from(device_key.clone())
        .to_pkcs8_der()
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;
    let key_pair = KeyPair::try_from(pkcs8.as_bytes())
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;

    let mut params = CertificateParams::new(Vec::new())
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;
    Ok(csr.der().to_vec())
}

/// Build a verifier for the leaf of a DER certificate chain.
///
/// # Errors
/// Returns `CryptoError::Certificate` if the chain is empty or the leaf
/// SPKI matches no supported key type.
pub fn leaf_verifier(cert_chain: &[Vec<u8>]) -> CryptoResult<Verifier> {
    let leaf = cert_chain
        .first()
        .ok_or_else(|| CryptoError::Certificate("empty certificate chain".into()))?;
    let spki = spki_from_certificate(leaf)?;

    for typ in [KeyType::Secp256r1, KeyType::Secp384r1, KeyType::RsaPkcs] {
        if let Ok(verifier) = Verifier::from_spki(typ, &spki) {
            return Ok(verifier);
        }
    }
    Err(CryptoError::Certificate(
        "unsupported leaf public key".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use p256::ecdsa::signature::Signer as _;
    use rand::rngs::OsRng;

    #[test]
    fn issue_and_verify_device_certificate() {
        let ca = DeviceCertAuthority::generate("Test Mfg CA").unwrap();
        let device_key = SigningKey::random(&mut OsRng);
        let csr = generate_device_csr(&device_key, "test-device").unwrap();

        let chain = ca.sign_device_certificate(&csr).unwrap();
        assert_eq!(chain.len(), 2);

        // The leaf must carry the device's attestation key.
        let verifier = leaf_verifier(&chain).unwrap();
        let sig: p256::ecdsa::Signature = device_key.sign(b"attest");
        verifier.verify(b"attest", &sig.to_bytes()).unwrap();
    }

    #[test]
    fn garbage_csr_is_rejected() {
        let ca = DeviceCertAuthority::generate("Test Mfg CA").unwrap();
        assert!(matches!(
            ca.sign_device_certificate(&[0xde, 0xad, 0xbe, 0xef]),
            Err(CryptoError::Certificate(_))
        ));
    }

    #[test]
    fn empty_chain_has_no_verifier() {
        assert!(leaf_verifier(&[]).is_err());
    }
}
