//! TO1: the device resolves its owner address (messages 30-33).
//!
//! The device presents its GUID, signs the rendezvous challenge with its
//! attestation key, and receives the stored `to1d` bytes untouched. The
//! device key is checked against the certificate-chain leaf captured from
//! the voucher during TO0.

use std::sync::Arc;

use tracing::debug;

use fdo_crypto::{certs, cose};
use fdo_protocol::Nonce;
use fdo_protocol::messages::{
    AttestationPayload, HelloRv, HelloRvAck, MSG_TO1_HELLO_RV, MSG_TO1_HELLO_RV_ACK,
    MSG_TO1_PROVE_TO_RV, MSG_TO1_RV_REDIRECT,
};
use fdo_store::{RvBlobStore, SessionState, SessionStore, SessionToken, To1Session};

use crate::error::ServerError;

/// The rendezvous-side TO1 responder.
pub struct To1Responder {
    sessions: Arc<dyn SessionStore>,
    rv_blobs: Arc<dyn RvBlobStore>,
}

impl To1Responder {
    /// Build the responder.
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionStore>, rv_blobs: Arc<dyn RvBlobStore>) -> Self {
        Self { sessions, rv_blobs }
    }

    /// Handle one TO1 request.
    ///
    /// # Errors
    /// Returns a [`ServerError`] for the dispatcher to surface; a GUID
    /// with no unexpired blob is a resource-not-found.
    pub async fn handle(
        &self,
        token: Option<SessionToken>,
        msg_type: u8,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        match msg_type {
            MSG_TO1_HELLO_RV => self.hello_rv(body).await,
            MSG_TO1_PROVE_TO_RV => self.prove_to_rv(token, body).await,
            other => Err(ServerError::InvalidMessage(format!(
                "unexpected TO1 message {other}"
            ))),
        }
    }

    async fn hello_rv(&self, body: &[u8]) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        let msg: HelloRv = fdo_cbor::from_cbor(body)?;

        // Fail early when no owner has published for this GUID.
        self.rv_blobs
            .get_rv_blob(&msg.guid)
            .await
            .map_err(|_| ServerError::ResourceNotFound(format!("no redirect for {}", msg.guid)))?;

        let nonce4 = Nonce::random();
        let token = self.sessions.new_token().await?;
        self.sessions
            .put(
                &token,
                SessionState::To1(To1Session {
                    guid: msg.guid,
                    nonce4,
                }),
            )
            .await?;

        let reply = HelloRvAck {
            nonce4,
            sig_info: msg.sig_info,
        };
        Ok((
            token,
            MSG_TO1_HELLO_RV_ACK,
            fdo_cbor::to_canonical_cbor(&reply)?,
        ))
    }

    async fn prove_to_rv(
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
        let SessionState::To1(session) = state else {
            return Err(ServerError::InvalidMessage(
                "token is not a TO1 session".into(),
            ));
        };

        let blob = self
            .rv_blobs
            .get_rv_blob(&session.guid)
            .await
            .map_err(|_| {
                ServerError::ResourceNotFound(format!("no redirect for {}", session.guid))
            })?;

        let verifier = certs::leaf_verifier(&blob.device_cert_chain)?;
        let payload_bytes = cose::sign1_verify(body, &verifier)?;
        let proof: AttestationPayload = fdo_cbor::from_cbor(&payload_bytes)?;
        if proof.nonce != session.nonce4 {
            return Err(ServerError::InvalidMessage("stale TO1 nonce".into()));
        }
        if proof.guid != session.guid {
            return Err(ServerError::InvalidMessage("GUID mismatch".into()));
        }

        self.sessions.delete(&token).await?;
        debug!(guid = %session.guid, "TO1: redirect served");

        // The stored to1d bytes go back verbatim; the device verifies the
        // owner signature itself in TO2.
        Ok((token, MSG_TO1_RV_REDIRECT, blob.to1d))
    }
}

impl std::fmt::Debug for To1Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("To1Responder").finish_non_exhaustive()
    }
}
