//! Message-number routing, token binding, and error surfacing.
//!
//! The transport hands every `(msgType, token, body)` here. The
//! dispatcher serializes requests per token, applies the session
//! deadline and cancellation signal, routes to the responder for the
//! message's protocol, and converts failures into a type-255 error plus
//! session teardown. Responders are stateless across requests; this is
//! the only place tokens are interpreted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fdo_protocol::error::ErrorMessage;
use fdo_protocol::messages::{
    MSG_DI_APP_START, MSG_DI_SET_HMAC, MSG_TO0_HELLO, MSG_TO0_OWNER_SIGN, MSG_TO1_HELLO_RV,
    MSG_TO1_PROVE_TO_RV, MSG_TO2_DEVICE_SERVICE_INFO, MSG_TO2_DEVICE_SERVICE_INFO_READY,
    MSG_TO2_DONE, MSG_TO2_GET_OV_NEXT_ENTRY, MSG_TO2_HELLO_DEVICE, MSG_TO2_PROVE_DEVICE,
};
use fdo_store::{SessionStore, SessionToken};

use crate::di::DiResponder;
use crate::error::ServerError;
use crate::to0::To0Responder;
use crate::to1::To1Responder;
use crate::to2::To2Responder;

/// Default wall-clock deadline per responder call.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(30);

/// Result of dispatching one request.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The responder produced the next message.
    Reply {
        /// Reply message type for the `Message-Type` header.
        msg_type: u8,
        /// CBOR reply body.
        body: Vec<u8>,
        /// Token to carry in the next request.
        token: SessionToken,
    },
    /// Terminal protocol failure; the session is gone.
    ProtocolError(ErrorMessage),
    /// Unknown or expired token. HTTP 401 with no body detail.
    Unauthorized,
}

/// Routes messages to the responders configured for this server role.
pub struct Dispatcher {
    di: Option<Arc<DiResponder>>,
    to0: Option<Arc<To0Responder>>,
    to1: Option<Arc<To1Responder>>,
    to2: Option<Arc<To2Responder>>,
    sessions: Arc<dyn SessionStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    deadline: Duration,
}

impl Dispatcher {
    /// Build a dispatcher with no responders attached.
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            di: None,
            to0: None,
            to1: None,
            to2: None,
            sessions,
            locks: Mutex::new(HashMap::new()),
            deadline: DEFAULT_CALL_DEADLINE,
        }
    }

    /// Attach the manufacturing responder.
    #[must_use]
    pub fn with_di(mut self, di: Arc<DiResponder>) -> Self {
        self.di = Some(di);
        self
    }

    /// Attach the rendezvous responders.
    #[must_use]
    pub fn with_rendezvous(mut self, to0: Arc<To0Responder>, to1: Arc<To1Responder>) -> Self {
        self.to0 = Some(to0);
        self.to1 = Some(to1);
        self
    }

    /// Attach the owner responder.
    #[must_use]
    pub fn with_to2(mut self, to2: Arc<To2Responder>) -> Self {
        self.to2 = Some(to2);
        self
    }

    /// Override the per-call deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Dispatch one request.
    ///
    /// Requests sharing a token run strictly serially. Cancellation or
    /// deadline expiry deletes the session and releases its locks.
    pub async fn handle(
        &self,
        msg_type: u8,
        token: Option<String>,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let token = token.map(SessionToken::from_string);

        // Per-token mutual exclusion; tokenless requests start sessions
        // and need no serialization.
        let lock = token.as_ref().map(|t| {
            self.locks
                .lock()
                .entry(t.as_str().to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        });
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let result = tokio::select! {
            () = cancel.cancelled() => Err(ServerError::Internal("request cancelled".into())),
            outcome = tokio::time::timeout(self.deadline, self.route(msg_type, token.clone(), &body)) => {
                outcome.unwrap_or_else(|_| Err(ServerError::Internal("deadline exceeded".into())))
            }
        };

        match result {
            Ok((token, reply_type, reply_body)) => {
                debug!(msg_type, reply_type, "dispatched");
                DispatchOutcome::Reply {
                    msg_type: reply_type,
                    body: reply_body,
                    token,
                }
            }
            Err(ServerError::InvalidToken) => DispatchOutcome::Unauthorized,
            Err(err) => {
                if let Some(token) = &token {
                    if let Err(delete_err) = self.sessions.delete(token).await {
                        warn!(%delete_err, "session teardown failed");
                    }
                    self.locks.lock().remove(token.as_str());
                }
                warn!(msg_type, %err, "request failed");
                DispatchOutcome::ProtocolError(err.to_error_message(msg_type))
            }
        }
    }

    async fn route(
        &self,
        msg_type: u8,
        token: Option<SessionToken>,
        body: &[u8],
    ) -> Result<(SessionToken, u8, Vec<u8>), ServerError> {
        match msg_type {
            MSG_DI_APP_START | MSG_DI_SET_HMAC => {
                let di = self.di.as_ref().ok_or_else(unsupported)?;
                di.handle(token, msg_type, body).await
            }
            MSG_TO0_HELLO | MSG_TO0_OWNER_SIGN => {
                let to0 = self.to0.as_ref().ok_or_else(unsupported)?;
                to0.handle(token, msg_type, body).await
            }
            MSG_TO1_HELLO_RV | MSG_TO1_PROVE_TO_RV => {
                let to1 = self.to1.as_ref().ok_or_else(unsupported)?;
                to1.handle(token, msg_type, body).await
            }
            MSG_TO2_HELLO_DEVICE
            | MSG_TO2_GET_OV_NEXT_ENTRY
            | MSG_TO2_PROVE_DEVICE
            | MSG_TO2_DEVICE_SERVICE_INFO_READY
            | MSG_TO2_DEVICE_SERVICE_INFO
            | MSG_TO2_DONE => {
                let to2 = self.to2.as_ref().ok_or_else(unsupported)?;
                to2.handle(token, msg_type, body).await
            }
            other => Err(ServerError::InvalidMessage(format!(
                "unknown message type {other}"
            ))),
        }
    }
}

fn unsupported() -> ServerError {
    ServerError::InvalidMessage("protocol not served by this endpoint".into())
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("di", &self.di.is_some())
            .field("to0", &self.to0.is_some())
            .field("to1", &self.to1.is_some())
            .field("to2", &self.to2.is_some())
            .finish_non_exhaustive()
    }
}

/// One round trip of the FDO message pipeline, as seen by a client
/// (the owner's TO0 run, tests, or an HTTP adapter).
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send `(msgType, body)` under `token`; returns the reply triple
    /// `(msgType, body, token)`.
    ///
    /// # Errors
    /// Returns the peer's error as a [`ServerError`].
    async fn call(
        &self,
        msg_type: u8,
        token: Option<String>,
        body: Vec<u8>,
    ) -> Result<(u8, Vec<u8>, Option<String>), ServerError>;
}

/// In-process transport over a [`Dispatcher`].
pub struct LocalTransport {
    dispatcher: Arc<Dispatcher>,
}

impl LocalTransport {
    /// Wrap a dispatcher.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl MessageTransport for LocalTransport {
    async fn call(
        &self,
        msg_type: u8,
        token: Option<String>,
        body: Vec<u8>,
    ) -> Result<(u8, Vec<u8>, Option<String>), ServerError> {
        let cancel = CancellationToken::new();
        match self.dispatcher.handle(msg_type, token, body, &cancel).await {
            DispatchOutcome::Reply {
                msg_type,
                body,
                token,
            } => Ok((msg_type, body, Some(token.as_str().to_string()))),
            DispatchOutcome::ProtocolError(err) => Err(ServerError::Peer {
                code: err.code,
                message: err.message,
            }),
            DispatchOutcome::Unauthorized => Err(ServerError::InvalidToken),
        }
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport").finish_non_exhaustive()
    }
}
