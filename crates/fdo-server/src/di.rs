//! DI: Device Initialization (messages 10-13), manufacturing role.
//!
//! `AppStart -> SetCredentials` issues the device certificate chain and
//! the voucher header; `SetHMAC -> Done` persists the voucher. An
//! optional pre-persist extension hands the voucher straight to a first
//! owner key.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_bytes::ByteBuf;
use tracing::{debug, info};

use fdo_crypto::{DeviceCertAuthority, Hash, HashAlg, PublicKey, SigningKey};
use fdo_protocol::messages::{
    AppStart, DiDone, MSG_DI_APP_START, MSG_DI_DONE, MSG_DI_SET_CREDENTIALS, MSG_DI_SET_HMAC,
    SetCredentials, SetHmac,
};
use fdo_protocol::rendezvous::RvInfo;
use fdo_protocol::voucher::{OwnershipVoucher, PROTOCOL_VERSION, VoucherHeader};
use fdo_protocol::Guid;
use fdo_store::{DiSession, SessionState, SessionStore, SessionToken, VoucherStore};

use crate::error::ServerError;

/// The manufacturing responder.
pub struct DiResponder {
    mfg_key: Arc<SigningKey>,
    device_ca: Arc<DeviceCertAuthority>,
    rv_info: Arc<RwLock<RvInfo>>,
    sessions: Arc<dyn SessionStore>,
    vouchers: Arc<dyn VoucherStore>,
    /// When set, every voucher is extended to this owner before persist.
    auto_extend_to: Option<PublicKey>,
}

impl DiResponder {
    /// Build the responder.
    #[must_use]
    pub fn new(
        mfg_key: Arc<SigningKey>,
        device_ca: Arc<DeviceCertAuthority>,
        rv_info: Arc<RwLock<RvInfo>>,
        sessions: Arc<dyn SessionStore>,
        vouchers: Arc<dyn VoucherStore>,
        auto_extend_to: Option<PublicKey>,
    ) -> Self {
        Self {
            mfg_key,
            device_ca,
            rv_info,
            sessions,
            vouchers,
            auto_extend_to,
        }
    }

    /// Handle one DI request.
    ///
    /// # Errors
    /// Returns a [`ServerError`] that the dispatcher converts into an
    /// error message (type 255) and a session teardown.
    pub async fn handle(
        &self,
        token: Option<SessionToken>,
        msg_type: u8,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        match msg_type {
            MSG_DI_APP_START => self.app_start(body).await,
            MSG_DI_SET_HMAC => self.set_hmac(token, body).await,
            other => Err(ServerError::InvalidMessage(format!(
                "unexpected DI message {other}"
            ))),
        }
    }

    async fn app_start(&self, body: &[u8]) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        let msg: AppStart = fdo_cbor::from_cbor(body)?;
        let info = msg.mfg_info()?;

        let cert_chain = self.device_ca.sign_device_certificate(&info.csr)?;
        let concatenated: Vec<u8> = cert_chain.iter().flatten().copied().collect();
        let cert_chain_hash = Hash::digest(HashAlg::Sha256, &concatenated)?;

        let guid = Guid::random();
        let header = VoucherHeader {
            prot_ver: PROTOCOL_VERSION,
            guid,
            rv_info: self.rv_info.read().clone(),
            device_info: info.device_info.clone(),
            mfg_pubkey: self.mfg_key.public_key()?,
            cert_chain_hash: Some(cert_chain_hash),
        };
        let raw_header = header.to_raw()?;

        let token = self.sessions.new_token().await?;
        self.sessions
            .put(
                &token,
                SessionState::Di(DiSession {
                    raw_header: raw_header.as_bytes().to_vec(),
                    cert_chain: cert_chain.iter().map(|c| ByteBuf::from(c.clone())).collect(),
                }),
            )
            .await?;

        debug!(%guid, serial = %info.serial, "DI: issued credentials");
        let reply = SetCredentials {
            ov_header: ByteBuf::from(raw_header.into_bytes()),
        };
        Ok((
            token,
            MSG_DI_SET_CREDENTIALS,
            fdo_cbor::to_canonical_cbor(&reply)?,
        ))
    }

    async fn set_hmac(
        &self,
        token: Option<SessionToken>,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        let token = token.ok_or(ServerError::InvalidToken)?;
        let state = self
            .sessions
            .get(&token)
            .await
            .map_err(|_| ServerError::InvalidToken)?;
        let SessionState::Di(session) = state else {
            return Err(ServerError::InvalidMessage(
                "token is not a DI session".into(),
            ));
        };

        let msg: SetHmac = fdo_cbor::from_cbor(body)?;
        let raw_header = fdo_cbor::RawCbor::from_slice(&session.raw_header)
            .map_err(|e| ServerError::Internal(format!("stored header: {e}")))?;
        let cert_chain: Vec<Vec<u8>> = session
            .cert_chain
            .into_iter()
            .map(ByteBuf::into_vec)
            .collect();

        let mut voucher = OwnershipVoucher::new(raw_header, msg.hmac, Some(cert_chain))?;
        if let Some(first_owner) = &self.auto_extend_to {
            voucher = voucher.extend(&self.mfg_key, first_owner)?;
        }

        let guid = voucher.guid();
        self.vouchers.insert(guid, voucher.to_bytes()?).await?;
        self.sessions.delete(&token).await?;

        info!(%guid, entries = voucher.num_entries(), "DI: voucher persisted");
        Ok((token, MSG_DI_DONE, fdo_cbor::to_canonical_cbor(&DiDone)?))
    }
}

impl std::fmt::Debug for DiResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiResponder").finish_non_exhaustive()
    }
}
