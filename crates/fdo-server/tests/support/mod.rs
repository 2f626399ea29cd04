//! In-process device simulation for end-to-end protocol tests.
//!
//! Drives the device halves of DI, TO1, and TO2 against a
//! [`MessageTransport`], exercising the responders exactly the way a
//! real device would over HTTP.

use serde_bytes::ByteBuf;

use fdo_crypto::{
    CipherSuite, Hash, HashAlg, KexSuite, SessionCrypto, SigningKey, cose, derive_session_keys,
    generate_device_csr,
};
use fdo_protocol::messages::{
    AppStart, AttestationPayload, DeviceMfgInfo, DeviceServiceInfo, DeviceServiceInfoReady,
    GetOvNextEntry, HelloDevice, HelloRv, HelloRvAck, MSG_DI_APP_START, MSG_DI_DONE,
    MSG_DI_SET_CREDENTIALS, MSG_DI_SET_HMAC, MSG_TO1_HELLO_RV, MSG_TO1_HELLO_RV_ACK,
    MSG_TO1_PROVE_TO_RV, MSG_TO1_RV_REDIRECT, MSG_TO2_DEVICE_SERVICE_INFO,
    MSG_TO2_DEVICE_SERVICE_INFO_READY, MSG_TO2_DONE, MSG_TO2_DONE2, MSG_TO2_GET_OV_NEXT_ENTRY,
    MSG_TO2_HELLO_DEVICE, MSG_TO2_OV_NEXT_ENTRY, MSG_TO2_OWNER_SERVICE_INFO,
    MSG_TO2_OWNER_SERVICE_INFO_READY, MSG_TO2_PROVE_DEVICE, MSG_TO2_PROVE_OV_HDR,
    MSG_TO2_SETUP_DEVICE, OvNextEntry, OwnerServiceInfo, OwnerServiceInfoReady,
    ProveOvHdrPayload, SetCredentials, SetHmac, SetupDevicePayload, SigInfo, To2Done, To2Done2,
};
use fdo_protocol::serviceinfo::ServiceInfoKv;
use fdo_protocol::voucher::{OwnershipVoucher, VoucherHeader};
use fdo_protocol::{Guid, Nonce};
use fdo_server::{MessageTransport, ServerError};

/// A simulated device: attestation key, HMAC secret, and DI credentials.
pub struct SimulatedDevice {
    pub attestation_key: SigningKey,
    pub hmac_secret: Vec<u8>,
    pub serial: String,
    pub device_info: String,
    pub guid: Option<Guid>,
    pub voucher_header: Option<Vec<u8>>,
}

/// Result of a completed TO2 run, device side.
#[derive(Debug)]
pub struct To2Outcome {
    /// Logical owner ServiceInfo values in arrival order; consecutive
    /// same-key values are merged the way a chunk-in pipe would.
    pub received: Vec<(String, Vec<u8>)>,
    /// Number of OwnerServiceInfo messages that carried payload frames.
    pub owner_messages: usize,
    /// The replacement GUID issued in SetupDevice.
    pub replacement_guid: Guid,
}

impl SimulatedDevice {
    pub fn new(serial: &str, device_info: &str) -> Self {
        Self {
            attestation_key: SigningKey::generate_es256(),
            hmac_secret: {
                let mut secret = vec![0u8; 32];
                rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut secret);
                secret
            },
            serial: serial.to_string(),
            device_info: device_info.to_string(),
            guid: None,
            voucher_header: None,
        }
    }

    fn attestation_p256(&self) -> p256::ecdsa::SigningKey {
        match &self.attestation_key {
            SigningKey::Es256(key) => key.clone(),
            _ => unreachable!("simulated devices use ES256"),
        }
    }

    /// Run DI: AppStart/SetCredentials then SetHMAC/Done.
    pub async fn run_di(&mut self, transport: &dyn MessageTransport) -> Result<(), ServerError> {
        let csr = generate_device_csr(&self.attestation_p256(), &self.serial).unwrap();
        let info = DeviceMfgInfo {
            key_type: 10,
            key_encoding: 1,
            serial: self.serial.clone(),
            device_info: self.device_info.clone(),
            csr: ByteBuf::from(csr),
        };
        let app_start = AppStart::new(&info).unwrap();

        let (msg_type, body, token) = transport
            .call(
                MSG_DI_APP_START,
                None,
                fdo_cbor::to_canonical_cbor(&app_start)?,
            )
            .await?;
        assert_eq!(msg_type, MSG_DI_SET_CREDENTIALS);
        let creds: SetCredentials = fdo_cbor::from_cbor(&body)?;

        let header: VoucherHeader = fdo_cbor::from_cbor(&creds.ov_header)?;
        self.guid = Some(header.guid);
        self.voucher_header = Some(creds.ov_header.clone().into_vec());

        let hmac = Hash::hmac(HashAlg::HmacSha256, &self.hmac_secret, &creds.ov_header).unwrap();
        let (msg_type, _, _) = transport
            .call(
                MSG_DI_SET_HMAC,
                token,
                fdo_cbor::to_canonical_cbor(&SetHmac { hmac })?,
            )
            .await?;
        assert_eq!(msg_type, MSG_DI_DONE);
        Ok(())
    }

    /// Run TO1, returning the owner's `to1d` bytes.
    pub async fn run_to1(
        &self,
        transport: &dyn MessageTransport,
    ) -> Result<Vec<u8>, ServerError> {
        let hello = HelloRv {
            guid: self.guid.expect("run_di first"),
            sig_info: SigInfo::es256(),
        };
        let (msg_type, body, token) = transport
            .call(MSG_TO1_HELLO_RV, None, fdo_cbor::to_canonical_cbor(&hello)?)
            .await?;
        assert_eq!(msg_type, MSG_TO1_HELLO_RV_ACK);
        let ack: HelloRvAck = fdo_cbor::from_cbor(&body)?;

        let proof = AttestationPayload {
            nonce: ack.nonce4,
            guid: self.guid.unwrap(),
            extra: None,
            setup_nonce: None,
        };
        let signed = cose::sign1_create(
            &fdo_cbor::to_canonical_cbor(&proof)?,
            &self.attestation_key,
        )
        .unwrap();

        let (msg_type, body, _) = transport.call(MSG_TO1_PROVE_TO_RV, token, signed).await?;
        assert_eq!(msg_type, MSG_TO1_RV_REDIRECT);
        Ok(body)
    }

    /// Run the full TO2 onboarding.
    ///
    /// `device_info_kvs` are the device's own ServiceInfo frames (devmod
    /// at minimum).
    pub async fn run_to2(
        &mut self,
        transport: &dyn MessageTransport,
        kex_suite: KexSuite,
        cipher_suite_id: i64,
        mtu: u16,
        device_info_kvs: Vec<ServiceInfoKv>,
    ) -> Result<To2Outcome, ServerError> {
        let guid = self.guid.expect("run_di first");
        let nonce_prove_ov = Nonce::random();

        // Phase 1: hello and proof of voucher.
        let hello = HelloDevice {
            max_device_message_size: mtu,
            guid,
            nonce_prove_ov,
            kex_suite,
            cipher_suite: cipher_suite_id,
            sig_info: SigInfo::es256(),
        };
        let (msg_type, prove_hdr_bytes, token) = transport
            .call(
                MSG_TO2_HELLO_DEVICE,
                None,
                fdo_cbor::to_canonical_cbor(&hello)?,
            )
            .await?;
        assert_eq!(msg_type, MSG_TO2_PROVE_OV_HDR);
        let hdr_payload_bytes = cose::sign1_payload_unverified(&prove_hdr_bytes).unwrap();
        let hdr_payload: ProveOvHdrPayload = fdo_cbor::from_cbor(&hdr_payload_bytes)?;
        assert_eq!(hdr_payload.nonce_prove_ov, nonce_prove_ov);

        // Our own credential must be what the owner is presenting.
        hdr_payload
            .hmac
            .verify_hmac(&self.hmac_secret, &hdr_payload.ov_header)
            .unwrap();

        // Phase 2: replay the voucher entries and validate the chain.
        let mut entries: Vec<ByteBuf> = Vec::new();
        let mut token = token;
        for entry_num in 0..hdr_payload.num_entries {
            let (msg_type, body, next_token) = transport
                .call(
                    MSG_TO2_GET_OV_NEXT_ENTRY,
                    token,
                    fdo_cbor::to_canonical_cbor(&GetOvNextEntry { entry_num })?,
                )
                .await?;
            assert_eq!(msg_type, MSG_TO2_OV_NEXT_ENTRY);
            let entry: OvNextEntry = fdo_cbor::from_cbor(&body)?;
            assert_eq!(entry.entry_num, entry_num);
            entries.push(entry.entry);
            token = next_token;
        }

        let wire = (
            fdo_protocol::PROTOCOL_VERSION,
            ByteBuf::from(hdr_payload.ov_header.clone().into_vec()),
            &hdr_payload.hmac,
            None::<Vec<ByteBuf>>,
            &entries,
        );
        let voucher = OwnershipVoucher::from_bytes(&fdo_cbor::to_canonical_cbor(&wire)?)?;
        let owner_pk = voucher.validate_chain(None).unwrap();

        // The ProveOVHdr signature must come from the chain's tail key.
        cose::sign1_verify(&prove_hdr_bytes, &owner_pk.verifier().unwrap()).unwrap();

        // Phase 3: prove the device, receive the setup parameters.
        let kex_result = kex_suite
            .device_respond(&hdr_payload.xa_kex, None)
            .unwrap();
        let setup_nonce = Nonce::random();
        let proof = AttestationPayload {
            nonce: hdr_payload.nonce_prove_dv,
            guid,
            extra: Some(ByteBuf::from(kex_result.param_b.clone())),
            setup_nonce: Some(setup_nonce),
        };
        let signed = cose::sign1_create(
            &fdo_cbor::to_canonical_cbor(&proof)?,
            &self.attestation_key,
        )
        .unwrap();
        let (msg_type, setup_bytes, next_token) =
            transport.call(MSG_TO2_PROVE_DEVICE, token, signed).await?;
        assert_eq!(msg_type, MSG_TO2_SETUP_DEVICE);
        token = next_token;

        let setup_payload_bytes = cose::sign1_payload_unverified(&setup_bytes).unwrap();
        let setup: SetupDevicePayload = fdo_cbor::from_cbor(&setup_payload_bytes)?;
        assert_eq!(setup.nonce_setup_dv, setup_nonce);
        cose::sign1_verify(&setup_bytes, &setup.owner2_key.verifier().unwrap()).unwrap();

        // Phase 4: the encrypted tunnel.
        let cipher = CipherSuite::try_from_id(cipher_suite_id).unwrap();
        let keys = derive_session_keys(
            &kex_result.shared,
            cipher.prf_hash(),
            cipher.sek_len(),
            cipher.svk_len(),
        )
        .unwrap();
        let mut crypto = SessionCrypto::new(cipher, keys).unwrap();

        // Replacement credential HMAC, over header bytes both sides build
        // identically.
        let original_header: VoucherHeader = fdo_cbor::from_cbor(&hdr_payload.ov_header)?;
        let replacement_header = VoucherHeader {
            prot_ver: original_header.prot_ver,
            guid: setup.replacement_guid,
            rv_info: original_header.rv_info.clone(),
            device_info: original_header.device_info.clone(),
            mfg_pubkey: setup.owner2_key.clone(),
            cert_chain_hash: original_header.cert_chain_hash.clone(),
        };
        let replacement_raw = fdo_cbor::to_canonical_cbor(&replacement_header)?;
        let replacement_hmac =
            Hash::hmac(HashAlg::HmacSha256, &self.hmac_secret, &replacement_raw).unwrap();

        let ready = DeviceServiceInfoReady {
            replacement_hmac: Some(replacement_hmac),
            max_owner_message_size: Some(mtu),
        };
        let encrypted = crypto
            .encrypt(&fdo_cbor::to_canonical_cbor(&ready)?)
            .unwrap();
        let (msg_type, body, next_token) = transport
            .call(MSG_TO2_DEVICE_SERVICE_INFO_READY, token, encrypted)
            .await?;
        assert_eq!(msg_type, MSG_TO2_OWNER_SERVICE_INFO_READY);
        token = next_token;
        let ready_reply = crypto.decrypt(&body).unwrap();
        let _: OwnerServiceInfoReady = fdo_cbor::from_cbor(&ready_reply)?;

        // Send device ServiceInfo, then poll owner ServiceInfo to the end.
        let mut received: Vec<(String, Vec<u8>)> = Vec::new();
        let mut owner_messages = 0usize;
        let mut device_info_to_send = Some(device_info_kvs);
        loop {
            let request = DeviceServiceInfo {
                is_more: false,
                info: device_info_to_send.take().unwrap_or_default(),
            };
            let encrypted = crypto
                .encrypt(&fdo_cbor::to_canonical_cbor(&request)?)
                .unwrap();
            let (msg_type, body, next_token) = transport
                .call(MSG_TO2_DEVICE_SERVICE_INFO, token, encrypted)
                .await?;
            assert_eq!(msg_type, MSG_TO2_OWNER_SERVICE_INFO);
            token = next_token;

            let reply_bytes = crypto.decrypt(&body).unwrap();
            let reply: OwnerServiceInfo = fdo_cbor::from_cbor(&reply_bytes)?;
            assert!(
                fdo_cbor::to_canonical_cbor(&reply)?.len() <= usize::from(mtu),
                "owner service info exceeds negotiated MTU"
            );
            if !reply.info.is_empty() {
                owner_messages += 1;
            }
            for kv in reply.info {
                match received.last_mut() {
                    Some((key, value)) if *key == kv.key => value.extend_from_slice(&kv.value),
                    _ => received.push((kv.key, kv.value)),
                }
            }
            if reply.is_done {
                break;
            }
        }

        // Done / Done2.
        let done = To2Done {
            nonce_prove_dv: hdr_payload.nonce_prove_dv,
        };
        let encrypted = crypto
            .encrypt(&fdo_cbor::to_canonical_cbor(&done)?)
            .unwrap();
        let (msg_type, body, _) = transport.call(MSG_TO2_DONE, token, encrypted).await?;
        assert_eq!(msg_type, MSG_TO2_DONE2);
        let done2_bytes = crypto.decrypt(&body).unwrap();
        let done2: To2Done2 = fdo_cbor::from_cbor(&done2_bytes)?;
        assert_eq!(done2.nonce_setup_dv, setup_nonce);

        // The device would persist the replacement credential here.
        self.guid = Some(setup.replacement_guid);
        self.voucher_header = Some(replacement_raw);

        Ok(To2Outcome {
            received,
            owner_messages,
            replacement_guid: setup.replacement_guid,
        })
    }
}
