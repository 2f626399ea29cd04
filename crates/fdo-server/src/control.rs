//! Out-of-band control API (JSON).
//!
//! Operator-facing endpoints next to the FDO transport:
//!
//! - `GET/POST/PUT /api/v1/rvinfo` - the rendezvous directives DI burns
//!   into new vouchers
//! - `GET/POST/PUT /api/v1/owner/redirect` - the owner's TO2 endpoints
//! - `GET /api/v1/vouchers?guid=` - fetch a PEM voucher (manufacturer)
//! - `POST /api/v1/owner/vouchers` - upload a PEM voucher to the owner
//!   (validates the chain before storing)
//! - `POST /api/v1/owner/resell/{guid}` - extend a voucher to a new
//!   owner public key (PEM SPKI body), returning the extended PEM
//! - `GET /api/v1/to0/{guid}` - trigger a TO0 publish for one voucher
//! - `GET /health` - liveness

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use fdo_crypto::{KeyType, PublicKey, SigningKey, Verifier};
use fdo_protocol::Guid;
use fdo_protocol::rendezvous::{RvInfo, RvTo2Addr};
use fdo_protocol::voucher::OwnershipVoucher;
use fdo_store::VoucherStore;

use crate::dispatch::MessageTransport;
use crate::error::ServerError;
use crate::to0::OwnerTo0Client;

/// Publishes one voucher's redirect to a rendezvous service.
#[async_trait]
pub trait To0Publisher: Send + Sync {
    /// Run TO0 for `guid`; returns the granted `waitSeconds`.
    ///
    /// # Errors
    /// Returns a [`ServerError`] on lookup, signing, or transport failure.
    async fn publish(&self, guid: Guid) -> Result<u32, ServerError>;
}

/// [`To0Publisher`] over the owner's voucher store and a transport to its
/// configured rendezvous service.
pub struct OwnerTo0Publisher {
    client: OwnerTo0Client,
    vouchers: Arc<dyn VoucherStore>,
    transport: Arc<dyn MessageTransport>,
    wait_seconds: u32,
}

impl OwnerTo0Publisher {
    /// Build a publisher requesting the given blob lifetime.
    #[must_use]
    pub fn new(
        client: OwnerTo0Client,
        vouchers: Arc<dyn VoucherStore>,
        transport: Arc<dyn MessageTransport>,
        wait_seconds: u32,
    ) -> Self {
        Self {
            client,
            vouchers,
            transport,
            wait_seconds,
        }
    }
}

#[async_trait]
impl To0Publisher for OwnerTo0Publisher {
    async fn publish(&self, guid: Guid) -> Result<u32, ServerError> {
        let bytes = self.vouchers.get(&guid).await?;
        let voucher = OwnershipVoucher::from_bytes(&bytes)?;
        self.client
            .publish(&voucher, self.wait_seconds, self.transport.as_ref())
            .await
    }
}

/// Rendezvous directive configuration accepted over the control API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RvInfoDoc {
    /// DNS name of the rendezvous service.
    pub dns: String,
    /// Port devices and owners connect to.
    pub port: u16,
}

/// Shared state behind the control router.
pub struct ControlState {
    /// Directives DI burns into new voucher headers.
    pub rv_info: Arc<RwLock<RvInfo>>,
    /// Last-accepted rendezvous configuration document.
    pub rv_doc: RwLock<Option<RvInfoDoc>>,
    /// The owner's advertised TO2 endpoints.
    pub owner_redirects: Arc<RwLock<Vec<RvTo2Addr>>>,
    /// Manufacturer voucher table (serves `GET /api/v1/vouchers`).
    pub mfg_vouchers: Option<Arc<dyn VoucherStore>>,
    /// Owner voucher table (uploads and resale).
    pub owner_vouchers: Option<Arc<dyn VoucherStore>>,
    /// Owner signing key for resale extensions.
    pub owner_key: Option<Arc<SigningKey>>,
    /// TO0 trigger, when this server is an owner.
    pub to0: Option<Arc<dyn To0Publisher>>,
}

/// Build the control router.
#[must_use]
pub fn control_router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route(
            "/api/v1/rvinfo",
            get(get_rv_info).post(set_rv_info).put(set_rv_info),
        )
        .route(
            "/api/v1/owner/redirect",
            get(get_redirect).post(set_redirect).put(set_redirect),
        )
        .route("/api/v1/vouchers", get(get_voucher))
        .route("/api/v1/owner/vouchers", post(upload_voucher))
        .route("/api/v1/owner/resell/:guid", post(resell_voucher))
        .route("/api/v1/to0/:guid", get(trigger_to0))
        .route("/health", get(health))
        .with_state(state)
}

type Control = State<Arc<ControlState>>;

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, message.into()).into_response()
}

fn not_found(message: impl Into<String>) -> Response {
    (StatusCode::NOT_FOUND, message.into()).into_response()
}

async fn health() -> Response {
    axum::Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn get_rv_info(State(state): Control) -> Response {
    match state.rv_doc.read().clone() {
        Some(doc) => axum::Json(doc).into_response(),
        None => not_found("no rendezvous info configured"),
    }
}

async fn set_rv_info(State(state): Control, axum::Json(doc): axum::Json<RvInfoDoc>) -> Response {
    match RvInfo::http(&doc.dns, doc.port) {
        Ok(info) => {
            *state.rv_info.write() = info;
            *state.rv_doc.write() = Some(doc.clone());
            info!(dns = %doc.dns, port = doc.port, "rendezvous info updated");
            (StatusCode::CREATED, axum::Json(doc)).into_response()
        }
        Err(e) => bad_request(format!("invalid rendezvous info: {e}")),
    }
}

async fn get_redirect(State(state): Control) -> Response {
    axum::Json(state.owner_redirects.read().clone()).into_response()
}

async fn set_redirect(
    State(state): Control,
    axum::Json(addrs): axum::Json<Vec<RvTo2Addr>>,
) -> Response {
    if addrs.is_empty() {
        return bad_request("redirect list must not be empty");
    }
    *state.owner_redirects.write() = addrs.clone();
    info!(endpoints = addrs.len(), "owner redirect updated");
    (StatusCode::CREATED, axum::Json(addrs)).into_response()
}

#[derive(Deserialize)]
struct VoucherQuery {
    guid: String,
}

fn parse_guid(hex_guid: &str) -> Result<Guid, Response> {
    let bytes = hex::decode(hex_guid).map_err(|_| bad_request("invalid GUID"))?;
    Guid::try_from_slice(&bytes).ok_or_else(|| bad_request("invalid GUID length"))
}

async fn get_voucher(State(state): Control, Query(query): Query<VoucherQuery>) -> Response {
    let Some(store) = &state.mfg_vouchers else {
        return not_found("not a manufacturing server");
    };
    let guid = match parse_guid(&query.guid) {
        Ok(guid) => guid,
        Err(resp) => return resp,
    };
    let Ok(bytes) = store.get(&guid).await else {
        return not_found("no voucher for GUID");
    };
    match OwnershipVoucher::from_bytes(&bytes).and_then(|v| v.to_pem()) {
        Ok(pem_text) => (StatusCode::OK, pem_text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn upload_voucher(State(state): Control, body: String) -> Response {
    let Some(store) = &state.owner_vouchers else {
        return not_found("not an owner server");
    };
    let voucher = match OwnershipVoucher::from_pem(&body) {
        Ok(voucher) => voucher,
        Err(e) => return bad_request(format!("invalid voucher: {e}")),
    };
    // Every voucher entering storage has passed full chain validation.
    if let Err(e) = voucher.validate_chain(None) {
        return bad_request(format!("voucher rejected: {e}"));
    }
    let guid = voucher.guid();
    match voucher.to_bytes() {
        Ok(bytes) => {
            if let Err(e) = store.insert(guid, bytes).await {
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
            info!(%guid, "owner voucher stored");
            (StatusCode::CREATED, guid.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn resell_voucher(
    State(state): Control,
    UrlPath(hex_guid): UrlPath<String>,
    body: String,
) -> Response {
    let (Some(store), Some(owner_key)) = (&state.owner_vouchers, &state.owner_key) else {
        return not_found("not an owner server");
    };
    let guid = match parse_guid(&hex_guid) {
        Ok(guid) => guid,
        Err(resp) => return resp,
    };

    let Ok(block) = pem::parse(&body) else {
        return bad_request("body must be a PEM public key");
    };
    if block.tag() != "PUBLIC KEY" {
        return bad_request("body must be a PEM public key");
    }
    let new_owner = match public_key_from_spki(block.contents()) {
        Some(key) => key,
        None => return bad_request("unsupported public key"),
    };

    let Ok(bytes) = store.get(&guid).await else {
        return not_found("no voucher for GUID");
    };
    let extended = OwnershipVoucher::from_bytes(&bytes)
        .and_then(|voucher| voucher.extend(owner_key, &new_owner))
        .and_then(|extended| extended.to_pem());
    match extended {
        Ok(pem_text) => {
            info!(%guid, "voucher extended for resale");
            (StatusCode::OK, pem_text).into_response()
        }
        Err(e) => bad_request(format!("resale failed: {e}")),
    }
}

/// Identify the key type of an SPKI by attempting each supported parser.
fn public_key_from_spki(spki_der: &[u8]) -> Option<PublicKey> {
    for typ in [
        KeyType::Secp256r1,
        KeyType::Secp384r1,
        KeyType::RsaPkcs,
    ] {
        if Verifier::from_spki(typ, spki_der).is_ok() {
            return Some(PublicKey::x509(typ, spki_der.to_vec()));
        }
    }
    None
}

async fn trigger_to0(State(state): Control, UrlPath(hex_guid): UrlPath<String>) -> Response {
    let Some(publisher) = &state.to0 else {
        return not_found("not an owner server");
    };
    let guid = match parse_guid(&hex_guid) {
        Ok(guid) => guid,
        Err(resp) => return resp,
    };
    match publisher.publish(guid).await {
        Ok(wait_seconds) => {
            axum::Json(serde_json::json!({ "wait_seconds": wait_seconds })).into_response()
        }
        Err(ServerError::ResourceNotFound(e)) => not_found(e),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
