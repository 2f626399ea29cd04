//! FDO-over-HTTP transport adapter.
//!
//! `POST /fdo/101/msg/{msgType}` with a CBOR body. The bearer token from
//! `Authorization` binds the session; replies carry `Message-Type` and
//! the next token. Unknown tokens get a bare 401. Protocol failures get
//! a type-255 body with status 500.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tokio_util::sync::CancellationToken;

use fdo_protocol::MSG_ERROR;

use crate::dispatch::{DispatchOutcome, Dispatcher};

/// Response header naming the FDO message type of the body.
pub const MESSAGE_TYPE_HEADER: &str = "Message-Type";

/// Build the FDO transport router.
#[must_use]
pub fn fdo_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/fdo/101/msg/:msg_type", post(handle_message))
        .with_state(dispatcher)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn handle_message(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(msg_type): Path<u8>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = bearer_token(&headers);
    let cancel = CancellationToken::new();

    match dispatcher
        .handle(msg_type, token, body.to_vec(), &cancel)
        .await
    {
        DispatchOutcome::Reply {
            msg_type,
            body,
            token,
        } => (
            StatusCode::OK,
            [
                (MESSAGE_TYPE_HEADER, msg_type.to_string()),
                (
                    header::AUTHORIZATION.as_str(),
                    format!("Bearer {}", token.as_str()),
                ),
                (header::CONTENT_TYPE.as_str(), "application/cbor".to_string()),
            ],
            body,
        )
            .into_response(),
        DispatchOutcome::ProtocolError(error) => {
            let body = fdo_cbor::to_canonical_cbor(&error).unwrap_or_default();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [
                    (MESSAGE_TYPE_HEADER, MSG_ERROR.to_string()),
                    (header::CONTENT_TYPE.as_str(), "application/cbor".to_string()),
                ],
                body,
            )
                .into_response()
        }
        DispatchOutcome::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
    }
}
