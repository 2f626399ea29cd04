//! Storage contracts for the FDO server roles.
//!
//! The protocol responders are stateless across requests; everything
//! mutable lives behind these traits:
//!
//! - [`SessionStore`]: one state row per bearer token, TTL-bound
//! - [`VoucherStore`]: exact voucher bytes per GUID, linearizable updates
//! - [`RvBlobStore`]: at most one owner redirect per GUID, TTL-bound,
//!   atomic replace
//!
//! In-memory implementations live in [`memory`].

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod memory;
pub mod session;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fdo_protocol::guid::Guid;

pub use error::StoreError;
pub use memory::{
    DEFAULT_SESSION_TTL_SECS, MemoryRvBlobStore, MemorySessionStore, MemoryVoucherStore,
};
pub use session::{
    DiSession, PendingKv, SessionState, SessionToken, To0Session, To1Session, To2Phase,
    To2Session,
};

/// Mutator run under the exclusive voucher-row lock.
pub type VoucherUpdate<'a> = &'a mut (dyn FnMut(&mut Vec<u8>) -> Result<(), StoreError> + Send);

/// Per-token session state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Mint a globally unique token.
    ///
    /// # Errors
    /// Returns a backend error on failure.
    async fn new_token(&self) -> Result<SessionToken, StoreError>;

    /// Load the state for a token.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown or expired tokens.
    async fn get(&self, token: &SessionToken) -> Result<SessionState, StoreError>;

    /// Atomically replace the state for a token, refreshing its TTL.
    ///
    /// # Errors
    /// Returns a backend error on failure.
    async fn put(&self, token: &SessionToken, state: SessionState) -> Result<(), StoreError>;

    /// Remove a session. Idempotent.
    ///
    /// # Errors
    /// Returns a backend error on failure.
    async fn delete(&self, token: &SessionToken) -> Result<(), StoreError>;
}

/// Voucher rows: exact bytes as received or extended, never re-serialized
/// by the store.
#[async_trait]
pub trait VoucherStore: Send + Sync {
    /// Insert or replace the voucher for a GUID.
    ///
    /// # Errors
    /// Returns a backend error on failure.
    async fn insert(&self, guid: Guid, voucher_bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Read a voucher's bytes.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown GUIDs.
    async fn get(&self, guid: &Guid) -> Result<Vec<u8>, StoreError>;

    /// Run `update` while holding the row exclusively; writes are
    /// linearizable per GUID.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown GUIDs, or the update's error.
    async fn with_voucher(&self, guid: &Guid, update: VoucherUpdate<'_>)
    -> Result<(), StoreError>;

    /// Remove a voucher row.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown GUIDs.
    async fn remove(&self, guid: &Guid) -> Result<(), StoreError>;

    /// All stored GUIDs.
    async fn list(&self) -> Vec<Guid>;
}

/// An owner redirect published through TO0.
#[derive(Debug, Clone)]
pub struct RvBlob {
    /// The owner-signed `to1d` token, exact bytes.
    pub to1d: Vec<u8>,
    /// Device certificate chain from the voucher, leaf first; TO1 uses
    /// the leaf key to authenticate the device.
    pub device_cert_chain: Vec<Vec<u8>>,
    /// Expiry instant derived from `waitSeconds`.
    pub expires_at: DateTime<Utc>,
}

/// Owner rendezvous blobs: at most one per GUID.
#[async_trait]
pub trait RvBlobStore: Send + Sync {
    /// Atomically replace the blob for a GUID.
    ///
    /// # Errors
    /// Returns a backend error on failure.
    async fn put_rv_blob(&self, guid: Guid, blob: RvBlob) -> Result<(), StoreError>;

    /// Read the blob for a GUID.
    ///
    /// # Errors
    /// Returns `NotFound` when absent or expired.
    async fn get_rv_blob(&self, guid: &Guid) -> Result<RvBlob, StoreError>;
}
