//! TO2: the owner onboards the device (messages 60-71).
//!
//! Four phases:
//!
//! 1. Hello and proof of voucher: the owner signs the header, the entry
//!    count, its key-exchange parameter, and the device's nonce.
//! 2. Entry replay: the device pulls each voucher entry by index and
//!    validates the chain itself.
//! 3. Proof of device and setup: the device signs the owner's nonce and
//!    its party-B parameter; the owner derives SEK/SVK and issues the
//!    replacement credential parameters.
//! 4. Encrypted ServiceInfo: devmod ingestion, owner modules streamed at
//!    the negotiated MTU, then Done/Done2 and voucher replacement.
//!
//! Owner-module output is produced through the chunk-out pipe each
//! request; logical values that do not fit the current message carry over
//! in the session row, so no producer outlives a request.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_bytes::ByteBuf;
use tracing::{debug, info, warn};

use fdo_crypto::{
    CipherSuite, RsaPrivateKey, SessionCrypto, SigningKey, certs, cose, derive_session_keys,
};
use fdo_protocol::devmod::DEVMOD_MODULE;
use fdo_protocol::messages::{
    AttestationPayload, DeviceServiceInfo, DeviceServiceInfoReady, GetOvNextEntry, HelloDevice,
    MSG_TO2_DEVICE_SERVICE_INFO, MSG_TO2_DEVICE_SERVICE_INFO_READY, MSG_TO2_DONE, MSG_TO2_DONE2,
    MSG_TO2_GET_OV_NEXT_ENTRY, MSG_TO2_HELLO_DEVICE, MSG_TO2_OV_NEXT_ENTRY,
    MSG_TO2_OWNER_SERVICE_INFO, MSG_TO2_OWNER_SERVICE_INFO_READY, MSG_TO2_PROVE_DEVICE,
    MSG_TO2_PROVE_OV_HDR, MSG_TO2_SETUP_DEVICE, OvNextEntry, OwnerServiceInfo,
    OwnerServiceInfoReady, ProveOvHdrPayload, SetupDevicePayload, To2Done, To2Done2,
};
use fdo_protocol::rendezvous::RvTo2Addr;
use fdo_protocol::serviceinfo::{
    DEFAULT_PIPE_CAPACITY, ServiceInfoError, ServiceInfoKv, new_chunk_out_pipe,
};
use fdo_protocol::voucher::{OwnershipVoucher, VoucherHeader};
use fdo_protocol::{Guid, Nonce};
use fdo_store::{
    PendingKv, SessionState, SessionStore, SessionToken, To2Phase, To2Session, VoucherStore,
};

use crate::error::ServerError;
use crate::modules::OwnerModule;

/// Default and maximum ServiceInfo message size.
pub const DEFAULT_MESSAGE_SIZE: u16 = 1300;

/// Bytes reserved for the `[isMore, isDone, [...]]` envelope.
const MESSAGE_ENVELOPE_OVERHEAD: u16 = 8;

/// The owner-side TO2 responder.
pub struct To2Responder {
    sessions: Arc<dyn SessionStore>,
    vouchers: Arc<dyn VoucherStore>,
    owner_key: Arc<SigningKey>,
    owner2_key: Arc<SigningKey>,
    asymkex_key: Option<Arc<RsaPrivateKey>>,
    modules: Vec<Arc<dyn OwnerModule>>,
    rv_to2_addrs: Arc<RwLock<Vec<RvTo2Addr>>>,
    reuse_credential: bool,
    max_message_size: u16,
}

impl To2Responder {
    /// Build the responder.
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        vouchers: Arc<dyn VoucherStore>,
        owner_key: Arc<SigningKey>,
        owner2_key: Arc<SigningKey>,
        rv_to2_addrs: Arc<RwLock<Vec<RvTo2Addr>>>,
        modules: Vec<Arc<dyn OwnerModule>>,
    ) -> Self {
        Self {
            sessions,
            vouchers,
            owner_key,
            owner2_key,
            asymkex_key: None,
            modules,
            rv_to2_addrs,
            reuse_credential: false,
            max_message_size: DEFAULT_MESSAGE_SIZE,
        }
    }

    /// Supply the RSA key required by the ASYMKEX suites.
    #[must_use]
    pub fn with_asymkex_key(mut self, key: Arc<RsaPrivateKey>) -> Self {
        self.asymkex_key = Some(key);
        self
    }

    /// Reuse the device credential instead of rotating the GUID.
    #[must_use]
    pub const fn with_credential_reuse(mut self, reuse: bool) -> Self {
        self.reuse_credential = reuse;
        self
    }

    /// Cap the negotiated ServiceInfo message size.
    #[must_use]
    pub const fn with_max_message_size(mut self, size: u16) -> Self {
        self.max_message_size = size;
        self
    }

    /// Handle one TO2 request.
    ///
    /// # Errors
    /// Returns a [`ServerError`] for the dispatcher to surface. Any
    /// failure inside the encrypted phase is terminal for the session.
    pub async fn handle(
        &self,
        token: Option<SessionToken>,
        msg_type: u8,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        match msg_type {
            MSG_TO2_HELLO_DEVICE => self.hello_device(body).await,
            MSG_TO2_GET_OV_NEXT_ENTRY => self.get_ov_next_entry(token, body).await,
            MSG_TO2_PROVE_DEVICE => self.prove_device(token, body).await,
            MSG_TO2_DEVICE_SERVICE_INFO_READY => self.service_info_ready(token, body).await,
            MSG_TO2_DEVICE_SERVICE_INFO => self.device_service_info(token, body).await,
            MSG_TO2_DONE => self.done(token, body).await,
            other => Err(ServerError::InvalidMessage(format!(
                "unexpected TO2 message {other}"
            ))),
        }
    }

    async fn load(&self, token: Option<SessionToken>) -> Result<(SessionToken, Box<To2Session>), ServerError> {
        let token = token.ok_or(ServerError::InvalidToken)?;
        let state = self
            .sessions
            .get(&token)
            .await
            .map_err(|_| ServerError::InvalidToken)?;
        match state {
            SessionState::To2(session) => Ok((token, session)),
            _ => Err(ServerError::InvalidMessage(
                "token is not a TO2 session".into(),
            )),
        }
    }

    async fn hello_device(&self, body: &[u8]) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        let msg: HelloDevice = fdo_cbor::from_cbor(body)?;

        let cipher_suite = CipherSuite::try_from_id(msg.cipher_suite)
            .map_err(|e| ServerError::MessageBody(e.to_string()))?;
        if msg.kex_suite.is_asymkex() && self.asymkex_key.is_none() {
            return Err(ServerError::MessageBody(format!(
                "key exchange {} not available",
                msg.kex_suite.name()
            )));
        }

        let voucher_bytes = self
            .vouchers
            .get(&msg.guid)
            .await
            .map_err(|_| ServerError::ResourceNotFound(format!("no voucher for {}", msg.guid)))?;
        let voucher = OwnershipVoucher::from_bytes(&voucher_bytes)?;

        let current_owner = voucher.validate_chain(None)?;
        if current_owner != self.owner_key.public_key()? {
            return Err(ServerError::InvalidMessage(
                "voucher is not owned by this service".into(),
            ));
        }
        if voucher.num_entries() == 0 {
            // An unextended voucher never reaches TO2; the tail must
            // differ from the header.
            return Err(ServerError::InvalidMessage(
                "voucher has no owner extensions".into(),
            ));
        }
        let num_entries = u16::try_from(voucher.num_entries())
            .map_err(|_| ServerError::InvalidMessage("voucher entry count".into()))?;

        let kex = msg.kex_suite.owner_start()?;
        let nonce_prove_dv = Nonce::random();

        let payload = ProveOvHdrPayload {
            ov_header: ByteBuf::from(voucher.raw_header().as_bytes().to_vec()),
            num_entries,
            hmac: voucher.header_hmac().clone(),
            nonce_prove_ov: msg.nonce_prove_ov,
            sig_info_b: msg.sig_info.clone(),
            xa_kex: ByteBuf::from(kex.param_a().to_vec()),
            nonce_prove_dv,
        };
        let reply = cose::sign1_create(&fdo_cbor::to_canonical_cbor(&payload)?, &self.owner_key)?;

        let mtu = if msg.max_device_message_size == 0 {
            self.max_message_size
        } else {
            msg.max_device_message_size.min(self.max_message_size)
        };

        let replacement_guid = if self.reuse_credential {
            msg.guid
        } else {
            Guid::random()
        };

        let session = To2Session {
            guid: msg.guid,
            phase: To2Phase::EntryReplay,
            nonce_prove_ov: msg.nonce_prove_ov,
            nonce_prove_dv,
            nonce_setup_dv: None,
            voucher: voucher_bytes,
            kex,
            cipher_suite,
            num_entries,
            next_entry: 0,
            crypto: None,
            replacement_guid,
            replacement_header: Vec::new(),
            replacement_hmac: None,
            max_device_message_size: mtu,
            max_owner_message_size: mtu,
            devmod: fdo_protocol::DevmodSnapshot::default(),
            pending_device_kv: None,
            pending_owner: Vec::new(),
            module_index: 0,
            module_state: None,
            device_done: false,
            owner_done: self.modules.is_empty(),
        };

        let token = self.sessions.new_token().await?;
        self.sessions
            .put(&token, SessionState::To2(Box::new(session)))
            .await?;

        debug!(guid = %msg.guid, suite = msg.kex_suite.name(), cipher = cipher_suite.name(),
            "TO2: hello accepted");
        Ok((token, MSG_TO2_PROVE_OV_HDR, reply))
    }

    async fn get_ov_next_entry(
        &self,
        token: Option<SessionToken>,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        let (token, mut session) = self.load(token).await?;
        if session.phase != To2Phase::EntryReplay {
            return Err(ServerError::InvalidMessage("entry replay is over".into()));
        }

        let msg: GetOvNextEntry = fdo_cbor::from_cbor(body)?;
        if msg.entry_num != session.next_entry || msg.entry_num >= session.num_entries {
            return Err(ServerError::InvalidMessage(format!(
                "entry {} out of order",
                msg.entry_num
            )));
        }

        let voucher = OwnershipVoucher::from_bytes(&session.voucher)?;
        let entry = voucher
            .entry(usize::from(msg.entry_num))
            .ok_or_else(|| ServerError::Internal("entry index out of range".into()))?;

        let reply = OvNextEntry {
            entry_num: msg.entry_num,
            entry: ByteBuf::from(entry.as_bytes().to_vec()),
        };

        session.next_entry += 1;
        self.sessions
            .put(&token, SessionState::To2(session))
            .await?;
        Ok((
            token,
            MSG_TO2_OV_NEXT_ENTRY,
            fdo_cbor::to_canonical_cbor(&reply)?,
        ))
    }

    async fn prove_device(
        &self,
        token: Option<SessionToken>,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        let (token, mut session) = self.load(token).await?;
        if session.phase != To2Phase::EntryReplay || session.next_entry != session.num_entries {
            return Err(ServerError::InvalidMessage(
                "entries not fully replayed".into(),
            ));
        }

        let voucher = OwnershipVoucher::from_bytes(&session.voucher)?;
        let cert_chain = voucher.cert_chain().ok_or_else(|| {
            ServerError::InvalidMessage("voucher carries no device certificate chain".into())
        })?;
        let verifier = certs::leaf_verifier(cert_chain)?;

        let payload_bytes = cose::sign1_verify(body, &verifier)?;
        let proof: AttestationPayload = fdo_cbor::from_cbor(&payload_bytes)?;
        if proof.nonce != session.nonce_prove_dv {
            return Err(ServerError::InvalidMessage("stale device proof nonce".into()));
        }
        if proof.guid != session.guid {
            return Err(ServerError::InvalidMessage("GUID mismatch".into()));
        }
        let xb = proof
            .extra
            .ok_or_else(|| ServerError::MessageBody("missing key exchange parameter".into()))?;
        let setup_nonce = proof
            .setup_nonce
            .ok_or_else(|| ServerError::MessageBody("missing setup nonce".into()))?;

        let shared = session
            .kex
            .derive(&xb, self.asymkex_key.as_deref())?;
        let keys = derive_session_keys(
            &shared,
            session.cipher_suite.prf_hash(),
            session.cipher_suite.sek_len(),
            session.cipher_suite.svk_len(),
        )?;
        session.crypto = Some(SessionCrypto::new(session.cipher_suite, keys)?);

        // Replacement credential rooted at the new owner key.
        let header = voucher.header();
        let replacement = VoucherHeader {
            prot_ver: header.prot_ver,
            guid: session.replacement_guid,
            rv_info: header.rv_info.clone(),
            device_info: header.device_info.clone(),
            mfg_pubkey: self.owner2_key.public_key()?,
            cert_chain_hash: header.cert_chain_hash.clone(),
        };
        session.replacement_header = replacement.to_raw()?.into_bytes();

        let payload = SetupDevicePayload {
            rendezvous: self.rv_to2_addrs.read().clone(),
            replacement_guid: session.replacement_guid,
            nonce_setup_dv: setup_nonce,
            owner2_key: self.owner2_key.public_key()?,
        };
        let reply = cose::sign1_create(&fdo_cbor::to_canonical_cbor(&payload)?, &self.owner2_key)?;

        session.nonce_setup_dv = Some(setup_nonce);
        session.phase = To2Phase::ServiceInfoReady;
        self.sessions
            .put(&token, SessionState::To2(session))
            .await?;

        Ok((token, MSG_TO2_SETUP_DEVICE, reply))
    }

    async fn service_info_ready(
        &self,
        token: Option<SessionToken>,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        let (token, mut session) = self.load(token).await?;
        if session.phase != To2Phase::ServiceInfoReady {
            return Err(ServerError::InvalidMessage(
                "service info not expected yet".into(),
            ));
        }
        let mut crypto = session
            .crypto
            .take()
            .ok_or_else(|| ServerError::Internal("missing session crypto".into()))?;

        let plaintext = crypto.decrypt(body)?;
        let msg: DeviceServiceInfoReady = fdo_cbor::from_cbor(&plaintext)?;

        if msg.replacement_hmac.is_none() && !self.reuse_credential {
            return Err(ServerError::InvalidMessage(
                "replacement HMAC required".into(),
            ));
        }
        session.replacement_hmac = msg.replacement_hmac;
        if let Some(limit) = msg.max_owner_message_size {
            if limit > 0 {
                session.max_owner_message_size = limit.min(self.max_message_size);
            }
        }

        let reply = OwnerServiceInfoReady {
            max_device_message_size: Some(session.max_device_message_size),
        };
        let encrypted = crypto.encrypt(&fdo_cbor::to_canonical_cbor(&reply)?)?;

        session.crypto = Some(crypto);
        session.phase = To2Phase::ServiceInfo;
        self.sessions
            .put(&token, SessionState::To2(session))
            .await?;
        Ok((token, MSG_TO2_OWNER_SERVICE_INFO_READY, encrypted))
    }

    async fn device_service_info(
        &self,
        token: Option<SessionToken>,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        let (token, mut session) = self.load(token).await?;
        if session.phase != To2Phase::ServiceInfo {
            return Err(ServerError::InvalidMessage(
                "service info not expected yet".into(),
            ));
        }
        let mut crypto = session
            .crypto
            .take()
            .ok_or_else(|| ServerError::Internal("missing session crypto".into()))?;

        let plaintext = crypto.decrypt(body)?;
        let msg: DeviceServiceInfo = fdo_cbor::from_cbor(&plaintext)?;

        ingest_device_info(&mut session, &msg)?;

        let reply = if msg.is_more {
            // Let the device finish before the owner starts streaming.
            OwnerServiceInfo {
                is_more: false,
                is_done: false,
                info: Vec::new(),
            }
        } else {
            session.device_done = true;
            if session.devmod.active != Some(true) {
                return Err(ServerError::InvalidMessage(
                    "devmod module is not active".into(),
                ));
            }
            let (info, finished) = self.produce_owner_info(&mut session)?;
            if finished {
                session.phase = To2Phase::Done;
            }
            OwnerServiceInfo {
                is_more: !finished,
                is_done: finished,
                info,
            }
        };

        let encrypted = crypto.encrypt(&fdo_cbor::to_canonical_cbor(&reply)?)?;
        session.crypto = Some(crypto);
        self.sessions
            .put(&token, SessionState::To2(session))
            .await?;
        Ok((token, MSG_TO2_OWNER_SERVICE_INFO, encrypted))
    }

    /// Assemble one OwnerServiceInfo worth of module output.
    ///
    /// Modules write logical values into a fresh chunk-out pipe; frames
    /// are drained up to the device's MTU and the residue is carried in
    /// the session for the next request.
    fn produce_owner_info(
        &self,
        session: &mut To2Session,
    ) -> Result<(Vec<ServiceInfoKv>, bool), ServerError> {
        let mtu = session.max_device_message_size;
        let budget_total = mtu.saturating_sub(MESSAGE_ENVELOPE_OVERHEAD);
        // Everything queued this round is drained before the pipe drops,
        // so capacity must cover the full round to keep writes unblocked.
        let capacity = DEFAULT_PIPE_CAPACITY.max(usize::from(budget_total) * 4);
        let (reader, producer) = new_chunk_out_pipe(capacity);

        // Replay values that did not fit the previous message.
        for pending in session.pending_owner.drain(..) {
            let (module, message) = pending
                .key
                .split_once(':')
                .ok_or_else(|| ServerError::Internal("pending key without module".into()))?;
            producer
                .next_service_info(module, message)
                .and_then(|()| producer.write(&pending.value))
                .map_err(|e| ServerError::Internal(format!("service info pipe: {e}")))?;
        }

        // Run module steps until enough is queued to fill this message.
        let mut module_state = session.module_state.take().map(ByteBuf::into_vec);
        while !session.owner_done && producer.total_written() < usize::from(budget_total) * 2 {
            let module = &self.modules[session.module_index];
            let step = module.next(module_state.as_deref(), &session.devmod, &producer)?;
            module_state = step.state;
            if step.done {
                module_state = None;
                session.module_index += 1;
                if session.module_index == self.modules.len() {
                    session.owner_done = true;
                }
            }
        }
        session.module_state = module_state.map(ByteBuf::from);
        producer.close();

        // Drain frames into the message, then park the residue.
        let mut info = Vec::new();
        let mut remaining = budget_total;
        loop {
            match reader.read_chunk(remaining) {
                Ok(Some(kv)) => {
                    let encoded = fdo_cbor::to_canonical_cbor(&kv)?.len();
                    remaining = remaining.saturating_sub(
                        u16::try_from(encoded).unwrap_or(u16::MAX),
                    );
                    info.push(kv);
                }
                Ok(None) => break,
                Err(ServiceInfoError::SizeTooSmall) => {
                    if info.is_empty() && remaining == budget_total {
                        return Err(ServerError::Internal(
                            "negotiated MTU cannot fit service info".into(),
                        ));
                    }
                    break;
                }
                Err(e) => return Err(ServerError::Internal(format!("service info pipe: {e}"))),
            }
        }

        let mut leftover: Vec<PendingKv> = Vec::new();
        loop {
            match reader.read_chunk(u16::MAX) {
                Ok(Some(kv)) => match leftover.last_mut() {
                    Some(last) if last.key == kv.key => last.value.extend_from_slice(&kv.value),
                    _ => leftover.push(PendingKv {
                        key: kv.key,
                        value: kv.value,
                    }),
                },
                Ok(None) => break,
                Err(ServiceInfoError::SizeTooSmall) => continue,
                Err(e) => return Err(ServerError::Internal(format!("service info pipe: {e}"))),
            }
        }
        session.pending_owner = leftover;

        let finished = session.owner_done && session.pending_owner.is_empty();
        Ok((info, finished))
    }

    async fn done(
        &self,
        token: Option<SessionToken>,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        let (token, mut session) = self.load(token).await?;
        if session.phase != To2Phase::Done {
            return Err(ServerError::InvalidMessage("not ready for Done".into()));
        }
        let mut crypto = session
            .crypto
            .take()
            .ok_or_else(|| ServerError::Internal("missing session crypto".into()))?;

        let plaintext = crypto.decrypt(body)?;
        let msg: To2Done = fdo_cbor::from_cbor(&plaintext)?;
        if msg.nonce_prove_dv != session.nonce_prove_dv {
            return Err(ServerError::InvalidMessage("stale Done nonce".into()));
        }
        let nonce_setup_dv = session
            .nonce_setup_dv
            .ok_or_else(|| ServerError::Internal("missing setup nonce".into()))?;

        if !self.reuse_credential {
            let hmac = session
                .replacement_hmac
                .clone()
                .ok_or_else(|| ServerError::InvalidMessage("replacement HMAC missing".into()))?;
            let original = OwnershipVoucher::from_bytes(&session.voucher)?;
            let raw_header = fdo_cbor::RawCbor::from_slice(&session.replacement_header)
                .map_err(|e| ServerError::Internal(format!("replacement header: {e}")))?;
            let replacement = OwnershipVoucher::new(
                raw_header,
                hmac,
                original.cert_chain().map(<[Vec<u8>]>::to_vec),
            )?
            .extend(&self.owner2_key, &self.owner2_key.public_key()?)?;

            self.vouchers
                .insert(session.replacement_guid, replacement.to_bytes()?)
                .await?;
            if session.replacement_guid != session.guid {
                if let Err(err) = self.vouchers.remove(&session.guid).await {
                    warn!(guid = %session.guid, %err, "could not drop consumed voucher");
                }
            }
        }

        for module in &self.modules {
            module.cleanup();
        }

        let reply = To2Done2 {
            nonce_setup_dv,
        };
        let encrypted = crypto.encrypt(&fdo_cbor::to_canonical_cbor(&reply)?)?;
        self.sessions.delete(&token).await?;

        info!(guid = %session.guid, replacement = %session.replacement_guid,
            "TO2: onboarding complete");
        Ok((token, MSG_TO2_DONE2, encrypted))
    }
}

/// Fold incoming device frames into session state, reassembling values
/// split across messages. A value only continues past a message boundary
/// while `isMore` is set.
fn ingest_device_info(session: &mut To2Session, msg: &DeviceServiceInfo) -> Result<(), ServerError> {
    for kv in &msg.info {
        let continues = session
            .pending_device_kv
            .as_ref()
            .is_some_and(|pending| pending.key == kv.key);
        if continues {
            if let Some(pending) = session.pending_device_kv.as_mut() {
                pending.value.extend_from_slice(&kv.value);
            }
        } else {
            if let Some(finished) = session.pending_device_kv.take() {
                absorb_device_kv(session, &finished)?;
            }
            session.pending_device_kv = Some(PendingKv {
                key: kv.key.clone(),
                value: kv.value.clone(),
            });
        }
    }
    if !msg.is_more {
        if let Some(finished) = session.pending_device_kv.take() {
            absorb_device_kv(session, &finished)?;
        }
    }
    Ok(())
}

fn absorb_device_kv(session: &mut To2Session, kv: &PendingKv) -> Result<(), ServerError> {
    let (module, message) = kv
        .key
        .split_once(':')
        .ok_or_else(|| ServerError::MessageBody("service info key without module".into()))?;
    if module == DEVMOD_MODULE {
        session
            .devmod
            .absorb(message, &kv.value)
            .map_err(|e| ServerError::MessageBody(format!("devmod value: {e}")))?;
    } else {
        // Module acknowledgements (e.g. fdo.download:done) are logged and
        // do not change owner state.
        debug!(key = %kv.key, len = kv.value.len(), "device service info");
    }
    Ok(())
}

impl std::fmt::Debug for To2Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("To2Responder")
            .field("modules", &self.modules.len())
            .field("reuse_credential", &self.reuse_credential)
            .finish_non_exhaustive()
    }
}
