//! COSE_Sign1 helpers over the exact wire bytes.
//!
//! Sign-and-verify operates on the RFC 8152 `Sig_structure` built from the
//! received protected-header bytes, so verification never depends on
//! re-encoding. External AAD is empty everywhere in FDO. Signed structures
//! are emitted with CBOR tag 18 and accepted tagged or untagged.

use coset::{
    CborSerializable, CoseSign1, CoseSign1Builder, Header, TaggedCborSerializable, iana,
};

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{SigningKey, Verifier};

/// COSE header label for the algorithm (`alg`).
pub const LABEL_ALG: i64 = 1;
/// COSE header label for the full initialization vector (`IV`).
pub const LABEL_IV: i64 = 5;

fn cose_algorithm(id: i64) -> coset::Algorithm {
    use coset::RegisteredLabelWithPrivate::{Assigned, PrivateUse};
    match id {
        -7 => Assigned(iana::Algorithm::ES256),
        -35 => Assigned(iana::Algorithm::ES384),
        -37 => Assigned(iana::Algorithm::PS256),
        -38 => Assigned(iana::Algorithm::PS384),
        -257 => Assigned(iana::Algorithm::RS256),
        -258 => Assigned(iana::Algorithm::RS384),
        other => PrivateUse(other),
    }
}

/// Sign `payload` into an encoded, tag-18 `COSE_Sign1`.
///
/// # Errors
/// Returns a crypto error if signing fails, or `CoseStructure` if the
/// result cannot be serialized.
pub fn sign1_create(payload: &[u8], signer: &SigningKey) -> CryptoResult<Vec<u8>> {
    let protected = Header {
        alg: Some(cose_algorithm(signer.cose_alg())),
        ..Default::default()
    };

    let mut sign1 = CoseSign1Builder::new()
        .protected(protected)
        .payload(payload.to_vec())
        .build();

    let tbs = sign1.tbs_data(&[]);
    sign1.signature = signer.sign(&tbs)?;

    sign1
        .to_tagged_vec()
        .map_err(|e| CryptoError::CoseStructure(e.to_string()))
}

/// Parse an encoded `COSE_Sign1`, accepting tag 18 or the bare array.
///
/// # Errors
/// Returns `CoseStructure` if neither form parses.
pub fn sign1_parse(bytes: &[u8]) -> CryptoResult<CoseSign1> {
    CoseSign1::from_tagged_slice(bytes)
        .or_else(|_| CoseSign1::from_slice(bytes))
        .map_err(|e| CryptoError::CoseStructure(e.to_string()))
}

/// Verify an encoded `COSE_Sign1` and return its payload.
///
/// The signature is checked before any claim is surfaced. Unknown critical
/// headers fail verification; a protected `alg` that disagrees with the
/// verifier fails verification.
///
/// # Errors
/// Returns `SignatureVerificationFailed` on any mismatch, `CoseStructure`
/// for malformed structures or a missing payload.
pub fn sign1_verify(bytes: &[u8], verifier: &Verifier) -> CryptoResult<Vec<u8>> {
    let sign1 = sign1_parse(bytes)?;
    verify_parsed_sign1(&sign1, verifier)
}

/// Verify an already-parsed `COSE_Sign1` and return its payload.
///
/// # Errors
/// See [`sign1_verify`].
pub fn verify_parsed_sign1(sign1: &CoseSign1, verifier: &Verifier) -> CryptoResult<Vec<u8>> {
    reject_unknown_critical_headers(&sign1.protected.header)?;

    if let Some(alg) = &sign1.protected.header.alg {
        if *alg != cose_algorithm(verifier.cose_alg()) {
            return Err(CryptoError::SignatureVerificationFailed);
        }
    }

    let tbs = sign1.tbs_data(&[]);
    verifier.verify(&tbs, &sign1.signature)?;

    sign1
        .payload
        .clone()
        .ok_or_else(|| CryptoError::CoseStructure("missing payload".into()))
}

/// Extract the payload without verifying. Callers must verify before
/// trusting anything read this way.
///
/// # Errors
/// Returns `CoseStructure` for malformed structures or a missing payload.
pub fn sign1_payload_unverified(bytes: &[u8]) -> CryptoResult<Vec<u8>> {
    sign1_parse(bytes)?
        .payload
        .ok_or_else(|| CryptoError::CoseStructure("missing payload".into()))
}

/// Fail if the protected header marks anything critical that this
/// implementation does not understand.
pub(crate) fn reject_unknown_critical_headers(header: &Header) -> CryptoResult<()> {
    for crit in &header.crit {
        let known = matches!(
            crit,
            coset::RegisteredLabel::Assigned(iana::HeaderParameter::Alg)
        );
        if !known {
            return Err(CryptoError::CoseStructure(format!(
                "unknown critical header {crit:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SigningKey;

    #[test]
    fn sign1_round_trip() {
        let key = SigningKey::generate_es256();
        let encoded = sign1_create(b"payload bytes", &key).unwrap();
        let payload = sign1_verify(&encoded, &key.verifier().unwrap()).unwrap();
        assert_eq!(payload, b"payload bytes");
    }

    #[test]
    fn sign1_emits_tag_18() {
        let key = SigningKey::generate_es256();
        let encoded = sign1_create(b"x", &key).unwrap();
        // 0xd2 = tag(18)
        assert_eq!(encoded[0], 0xd2);
    }

    #[test]
    fn untagged_form_is_accepted() {
        let key = SigningKey::generate_es256();
        let encoded = sign1_create(b"x", &key).unwrap();
        let untagged = &encoded[1..];
        let payload = sign1_verify(untagged, &key.verifier().unwrap()).unwrap();
        assert_eq!(payload, b"x");
    }

    #[test]
    fn flipping_any_payload_byte_fails() {
        let key = SigningKey::generate_es256();
        let encoded = sign1_create(b"payload", &key).unwrap();
        let verifier = key.verifier().unwrap();

        let mut sign1 = sign1_parse(&encoded).unwrap();
        let mut payload = sign1.payload.take().unwrap();
        payload[0] ^= 0x01;
        sign1.payload = Some(payload);
        let tampered = sign1.to_tagged_vec().unwrap();

        assert!(matches!(
            sign1_verify(&tampered, &verifier),
            Err(CryptoError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn flipping_signature_byte_fails() {
        let key = SigningKey::generate_es256();
        let encoded = sign1_create(b"payload", &key).unwrap();
        let verifier = key.verifier().unwrap();

        let mut sign1 = sign1_parse(&encoded).unwrap();
        sign1.signature[0] ^= 0x01;
        let tampered = sign1.to_tagged_vec().unwrap();

        assert!(sign1_verify(&tampered, &verifier).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let key = SigningKey::generate_es256();
        let other = SigningKey::generate_es256();
        let encoded = sign1_create(b"payload", &key).unwrap();
        assert!(sign1_verify(&encoded, &other.verifier().unwrap()).is_err());
    }

    #[test]
    fn wrong_curve_fails() {
        let key = SigningKey::generate_es256();
        let other = SigningKey::generate_es384();
        let encoded = sign1_create(b"payload", &key).unwrap();
        assert!(sign1_verify(&encoded, &other.verifier().unwrap()).is_err());
    }

    #[test]
    fn unknown_critical_header_fails_verification() {
        let key = SigningKey::generate_es256();
        let protected = Header {
            alg: Some(cose_algorithm(key.cose_alg())),
            crit: vec![coset::RegisteredLabel::Assigned(
                iana::HeaderParameter::CounterSignature,
            )],
            ..Default::default()
        };
        let mut sign1 = CoseSign1Builder::new()
            .protected(protected)
            .payload(b"x".to_vec())
            .build();
        let tbs = sign1.tbs_data(&[]);
        sign1.signature = key.sign(&tbs).unwrap();
        let encoded = sign1.to_tagged_vec().unwrap();

        assert!(matches!(
            sign1_verify(&encoded, &key.verifier().unwrap()),
            Err(CryptoError::CoseStructure(_))
        ));
    }
}
