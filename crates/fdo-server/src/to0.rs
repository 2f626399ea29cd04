//! TO0: the owner publishes its rendezvous blob (messages 20-23).
//!
//! Rendezvous side: a two-round exchange in which the owner proves
//! possession of the voucher's current owner key and uploads the signed
//! `to1d` redirect. The responder verifies the voucher chain, the `to1d`
//! signature against the chain's tail key, and the `to0dHash` binding,
//! then stores `(guid, to1d, waitSeconds)` with atomic replace.
//!
//! Owner side: [`OwnerTo0Client`] assembles the signed `OwnerSign` and
//! drives the exchange over any [`crate::dispatch::MessageTransport`].

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_bytes::ByteBuf;
use tracing::{debug, info};

use fdo_crypto::{Hash, PublicKey, SigningKey, cose};
use fdo_protocol::messages::{
    AcceptOwner, MSG_TO0_ACCEPT_OWNER, MSG_TO0_HELLO, MSG_TO0_HELLO_ACK, MSG_TO0_OWNER_SIGN,
    OwnerSign, To0Data, To0Hello, To0HelloAck, To1dPayload,
};
use fdo_protocol::rendezvous::RvTo2Addr;
use fdo_protocol::voucher::OwnershipVoucher;
use fdo_protocol::Nonce;
use fdo_store::{RvBlob, RvBlobStore, SessionState, SessionStore, SessionToken, To0Session};

use crate::dispatch::MessageTransport;
use crate::error::ServerError;

/// Upper bound a rendezvous grants for blob lifetime (30 days).
pub const MAX_WAIT_SECONDS: u32 = 30 * 24 * 3600;

/// The rendezvous-side TO0 responder.
pub struct To0Responder {
    sessions: Arc<dyn SessionStore>,
    rv_blobs: Arc<dyn RvBlobStore>,
    /// When set, only vouchers rooted at one of these keys are accepted.
    trusted_mfg_keys: Option<Vec<PublicKey>>,
}

impl To0Responder {
    /// Build the responder.
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        rv_blobs: Arc<dyn RvBlobStore>,
        trusted_mfg_keys: Option<Vec<PublicKey>>,
    ) -> Self {
        Self {
            sessions,
            rv_blobs,
            trusted_mfg_keys,
        }
    }

    /// Handle one TO0 request.
    ///
    /// # Errors
    /// Returns a [`ServerError`] for the dispatcher to surface.
    pub async fn handle(
        &self,
        token: Option<SessionToken>,
        msg_type: u8,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        match msg_type {
            MSG_TO0_HELLO => self.hello(body).await,
            MSG_TO0_OWNER_SIGN => self.owner_sign(token, body).await,
            other => Err(ServerError::InvalidMessage(format!(
                "unexpected TO0 message {other}"
            ))),
        }
    }

    async fn hello(&self, body: &[u8]) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        let _: To0Hello = fdo_cbor::from_cbor(body)?;
        let nonce3 = Nonce::random();

        let token = self.sessions.new_token().await?;
        self.sessions
            .put(&token, SessionState::To0(To0Session { nonce3 }))
            .await?;

        let reply = To0HelloAck { nonce3 };
        Ok((
            token,
            MSG_TO0_HELLO_ACK,
            fdo_cbor::to_canonical_cbor(&reply)?,
        ))
    }

    async fn owner_sign(
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
        let SessionState::To0(session) = state else {
            return Err(ServerError::InvalidMessage(
                "token is not a TO0 session".into(),
            ));
        };

        let msg: OwnerSign = fdo_cbor::from_cbor(body)?;
        let to0d: To0Data = fdo_cbor::from_cbor(&msg.to0d)?;
        if to0d.nonce3 != session.nonce3 {
            return Err(ServerError::InvalidMessage("stale TO0 nonce".into()));
        }

        // (a) the voucher chain must verify end to end.
        let owner_pk = to0d
            .voucher
            .validate_chain(self.trusted_mfg_keys.as_deref())?;

        // (b) to1d must be signed by the chain's tail key.
        let payload_bytes = cose::sign1_verify(&msg.to1d, &owner_pk.verifier()?)?;
        let to1d_payload: To1dPayload = fdo_cbor::from_cbor(&payload_bytes)?;

        // (c) to1d must bind these exact to0d bytes.
        let computed = Hash::digest(to1d_payload.to0d_hash.alg(), &msg.to0d)?;
        if !to1d_payload.to0d_hash.matches(&computed) {
            return Err(ServerError::InvalidMessage("to0d hash mismatch".into()));
        }

        let wait_seconds = to0d.wait_seconds.min(MAX_WAIT_SECONDS);
        let guid = to0d.voucher.guid();
        let device_cert_chain = to0d
            .voucher
            .cert_chain()
            .map(<[Vec<u8>]>::to_vec)
            .unwrap_or_default();

        self.rv_blobs
            .put_rv_blob(
                guid,
                RvBlob {
                    to1d: msg.to1d.clone().into_vec(),
                    device_cert_chain,
                    expires_at: Utc::now() + Duration::seconds(i64::from(wait_seconds)),
                },
            )
            .await?;
        self.sessions.delete(&token).await?;

        info!(%guid, wait_seconds, "TO0: owner redirect accepted");
        let reply = AcceptOwner { wait_seconds };
        Ok((
            token,
            MSG_TO0_ACCEPT_OWNER,
            fdo_cbor::to_canonical_cbor(&reply)?,
        ))
    }
}

impl std::fmt::Debug for To0Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("To0Responder").finish_non_exhaustive()
    }
}

/// Owner-side TO0 client: publishes one voucher to a rendezvous service.
pub struct OwnerTo0Client {
    owner_key: Arc<SigningKey>,
    addrs: Vec<RvTo2Addr>,
}

impl OwnerTo0Client {
    /// Build a client advertising the given TO2 endpoints.
    #[must_use]
    pub fn new(owner_key: Arc<SigningKey>, addrs: Vec<RvTo2Addr>) -> Self {
        Self { owner_key, addrs }
    }

    /// Run the two-round TO0 exchange for `voucher` over `transport`.
    ///
    /// Returns the granted `waitSeconds`.
    ///
    /// # Errors
    /// Returns transport or signing failures, or `InvalidMessage` when
    /// the rendezvous replies out of order.
    pub async fn publish(
        &self,
        voucher: &OwnershipVoucher,
        wait_seconds: u32,
        transport: &dyn MessageTransport,
    ) -> Result<u32, ServerError> {
        let hello = fdo_cbor::to_canonical_cbor(&To0Hello::default())?;
        let (msg_type, body, token) = transport.call(MSG_TO0_HELLO, None, hello).await?;
        if msg_type != MSG_TO0_HELLO_ACK {
            return Err(ServerError::InvalidMessage(format!(
                "expected HelloAck, got {msg_type}"
            )));
        }
        let ack: To0HelloAck = fdo_cbor::from_cbor(&body)?;

        let to0d = To0Data {
            voucher: voucher.clone(),
            wait_seconds,
            nonce3: ack.nonce3,
        };
        let to0d_bytes = fdo_cbor::to_canonical_cbor(&to0d)?;
        let to0d_hash = Hash::digest(voucher.chain_hash_alg(), &to0d_bytes)?;

        let payload = To1dPayload {
            addrs: self.addrs.clone(),
            to0d_hash,
        };
        let to1d = cose::sign1_create(&fdo_cbor::to_canonical_cbor(&payload)?, &self.owner_key)?;

        let owner_sign = OwnerSign {
            to0d: ByteBuf::from(to0d_bytes),
            to1d: ByteBuf::from(to1d),
        };
        let (msg_type, body, _) = transport
            .call(
                MSG_TO0_OWNER_SIGN,
                token,
                fdo_cbor::to_canonical_cbor(&owner_sign)?,
            )
            .await?;
        if msg_type != MSG_TO0_ACCEPT_OWNER {
            return Err(ServerError::InvalidMessage(format!(
                "expected AcceptOwner, got {msg_type}"
            )));
        }
        let accept: AcceptOwner = fdo_cbor::from_cbor(&body)?;
        debug!(guid = %voucher.guid(), granted = accept.wait_seconds, "TO0 published");
        Ok(accept.wait_seconds)
    }
}

impl std::fmt::Debug for OwnerTo0Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerTo0Client").finish_non_exhaustive()
    }
}
