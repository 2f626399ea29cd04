//! In-memory store implementations.
//!
//! Suitable for tests and single-node deployments. Sessions and
//! rendezvous blobs expire by wall clock; voucher rows are serialized per
//! GUID through an async mutex so updates are linearizable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use fdo_protocol::guid::Guid;

use crate::error::StoreError;
use crate::session::{SessionState, SessionToken};
use crate::{RvBlob, RvBlobStore, SessionStore, VoucherStore, VoucherUpdate};

/// Default session lifetime.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 30;

/// In-memory [`SessionStore`] with TTL expiry.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
    ttl: Duration,
}

impl MemorySessionStore {
    /// Create a store with the default 30-second session deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_SESSION_TTL_SECS))
    }

    /// Create a store with an explicit session lifetime.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn prune(&self) {
        let now = Utc::now();
        self.sessions.write().retain(|_, (_, expiry)| *expiry > now);
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn new_token(&self) -> Result<SessionToken, StoreError> {
        Ok(SessionToken::random())
    }

    async fn get(&self, token: &SessionToken) -> Result<SessionState, StoreError> {
        self.prune();
        let sessions = self.sessions.read();
        let (bytes, _) = sessions.get(token.as_str()).ok_or(StoreError::NotFound)?;
        Ok(SessionState::from_cbor(bytes)?)
    }

    async fn put(&self, token: &SessionToken, state: SessionState) -> Result<(), StoreError> {
        let bytes = state.to_cbor()?;
        let expiry = Utc::now() + self.ttl;
        self.sessions
            .write()
            .insert(token.as_str().to_string(), (bytes, expiry));
        Ok(())
    }

    async fn delete(&self, token: &SessionToken) -> Result<(), StoreError> {
        self.sessions.write().remove(token.as_str());
        Ok(())
    }
}

/// In-memory [`VoucherStore`] with per-GUID row locks.
pub struct MemoryVoucherStore {
    rows: RwLock<HashMap<Guid, Arc<Mutex<Vec<u8>>>>>,
}

impl MemoryVoucherStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryVoucherStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VoucherStore for MemoryVoucherStore {
    async fn insert(&self, guid: Guid, voucher_bytes: Vec<u8>) -> Result<(), StoreError> {
        self.rows
            .write()
            .insert(guid, Arc::new(Mutex::new(voucher_bytes)));
        Ok(())
    }

    async fn get(&self, guid: &Guid) -> Result<Vec<u8>, StoreError> {
        let row = self
            .rows
            .read()
            .get(guid)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let bytes = row.lock().await;
        Ok(bytes.clone())
    }

    async fn with_voucher(
        &self,
        guid: &Guid,
        update: VoucherUpdate<'_>,
    ) -> Result<(), StoreError> {
        let row = self
            .rows
            .read()
            .get(guid)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let mut bytes = row.lock().await;
        update(&mut bytes)
    }

    async fn remove(&self, guid: &Guid) -> Result<(), StoreError> {
        self.rows
            .write()
            .remove(guid)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> Vec<Guid> {
        self.rows.read().keys().copied().collect()
    }
}

/// In-memory [`RvBlobStore`] with TTL expiry and atomic replace.
pub struct MemoryRvBlobStore {
    blobs: RwLock<HashMap<Guid, RvBlob>>,
}

impl MemoryRvBlobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRvBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RvBlobStore for MemoryRvBlobStore {
    async fn put_rv_blob(&self, guid: Guid, blob: RvBlob) -> Result<(), StoreError> {
        self.blobs.write().insert(guid, blob);
        Ok(())
    }

    async fn get_rv_blob(&self, guid: &Guid) -> Result<RvBlob, StoreError> {
        let blobs = self.blobs.read();
        let blob = blobs.get(guid).ok_or(StoreError::NotFound)?;
        if blob.expires_at <= Utc::now() {
            return Err(StoreError::NotFound);
        }
        Ok(blob.clone())
    }
}
