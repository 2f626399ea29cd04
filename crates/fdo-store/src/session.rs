//! Per-token session state for each protocol run.
//!
//! One bearer token maps to one `SessionState`. The state is a CBOR
//! value in storage (`sessions(token, state_cbor)`), so everything in it
//! serializes; derived keys live here only for the session's lifetime
//! and are destroyed with it.

use serde::{Deserialize, Serialize};

use fdo_crypto::{CipherSuite, Hash, OwnerKexState, SessionCrypto};
use fdo_protocol::devmod::DevmodSnapshot;
use fdo_protocol::guid::{Guid, Nonce};

/// Opaque bearer token identifying one protocol run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a fresh, globally unique token.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
        Self(hex::encode(bytes))
    }

    /// Wrap an existing token string (transport layer).
    #[must_use]
    pub fn from_string(token: String) -> Self {
        Self(token)
    }

    /// The token text placed in the `Authorization` header.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// State for one protocol run, keyed by bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionState {
    /// Device Initialization (msgs 10-13).
    Di(DiSession),
    /// Owner publish (msgs 20-23).
    To0(To0Session),
    /// Device resolve (msgs 30-33).
    To1(To1Session),
    /// Onboarding (msgs 60-71).
    To2(Box<To2Session>),
}

/// DI state between SetCredentials and SetHmac.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiSession {
    /// Exact voucher header bytes issued in SetCredentials.
    #[serde(with = "serde_bytes")]
    pub raw_header: Vec<u8>,
    /// Issued device certificate chain, leaf first.
    pub cert_chain: Vec<serde_bytes::ByteBuf>,
}

/// TO0 state between HelloAck and OwnerSign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct To0Session {
    /// Challenge the owner must echo inside `to0d`.
    pub nonce3: Nonce,
}

/// TO1 state between HelloRVAck and ProveToRV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct To1Session {
    /// The GUID being resolved.
    pub guid: Guid,
    /// Challenge the device must sign.
    pub nonce4: Nonce,
}

/// TO2 phase, keyed by which message numbers are legal next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum To2Phase {
    /// Entry replay in progress (62/64 legal).
    EntryReplay,
    /// Waiting for DeviceServiceInfoReady (66).
    ServiceInfoReady,
    /// ServiceInfo exchange in progress (68).
    ServiceInfo,
    /// Waiting for Done (70).
    Done,
}

/// The owner's per-session TO2 state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct To2Session {
    /// The device being onboarded.
    pub guid: Guid,
    /// Current phase.
    pub phase: To2Phase,
    /// Device's NonceTO2ProveOV from HelloDevice.
    pub nonce_prove_ov: Nonce,
    /// Owner's NonceTO2ProveDv sent in ProveOVHdr.
    pub nonce_prove_dv: Nonce,
    /// Device's NonceTO2SetupDv from ProveDevice.
    pub nonce_setup_dv: Option<Nonce>,
    /// The in-flight voucher, exact bytes, pinned for the whole run.
    #[serde(with = "serde_bytes")]
    pub voucher: Vec<u8>,
    /// Party-A key-exchange state.
    pub kex: OwnerKexState,
    /// Negotiated cipher suite.
    pub cipher_suite: CipherSuite,
    /// Entries in the voucher under onboarding.
    pub num_entries: u16,
    /// Next entry index the device may request.
    pub next_entry: u16,
    /// Tunnel crypto once SEK/SVK are derived.
    pub crypto: Option<SessionCrypto>,
    /// Replacement GUID issued in SetupDevice.
    pub replacement_guid: Guid,
    /// Replacement header bytes for the extended voucher.
    #[serde(with = "serde_bytes")]
    pub replacement_header: Vec<u8>,
    /// Device HMAC over the replacement header.
    pub replacement_hmac: Option<Hash>,
    /// Largest message the device accepts (from HelloDevice).
    pub max_device_message_size: u16,
    /// Largest message the device will send us (from ServiceInfoReady).
    pub max_owner_message_size: u16,
    /// Collected devmod values.
    pub devmod: DevmodSnapshot,
    /// Reassembly state for a device value split across messages.
    pub pending_device_kv: Option<PendingKv>,
    /// Owner-side logical values carried over to the next message.
    pub pending_owner: Vec<PendingKv>,
    /// Owner-module cursor: index of the active module.
    pub module_index: usize,
    /// Module-private cursor state, serialized by the module.
    pub module_state: Option<serde_bytes::ByteBuf>,
    /// Whether the device has finished sending ServiceInfo.
    pub device_done: bool,
    /// Whether every owner module has finished.
    pub owner_done: bool,
}

/// A device ServiceInfo value that may continue in the next message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingKv {
    /// Full `module:message` key.
    pub key: String,
    /// Value bytes received so far.
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl SessionState {
    /// Serialize for the `state_cbor` column.
    ///
    /// # Errors
    /// Returns a codec error on failure.
    pub fn to_cbor(&self) -> Result<Vec<u8>, fdo_cbor::CodecError> {
        fdo_cbor::to_canonical_cbor(self)
    }

    /// Restore from the `state_cbor` column.
    ///
    /// # Errors
    /// Returns a codec error for malformed state.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, fdo_cbor::CodecError> {
        fdo_cbor::from_cbor(bytes)
    }
}
