//! Wire messages for DI, TO0, TO1, and TO2.
//!
//! Every message body is a CBOR array. Substructures that are hashed or
//! signed elsewhere (the voucher header, voucher entries, `to0d`, signed
//! tokens) travel byte-string-wrapped so their exact bytes survive the
//! round trip. Message type numbers: DI 10–13, TO0 20–23, TO1 30–33,
//! TO2 60–71, error 255.

use serde_bytes::ByteBuf;
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

use fdo_crypto::{Hash, KexSuite};

use crate::guid::{Guid, Nonce};
use crate::voucher::OwnershipVoucher;

// DI: Device Initialization.

/// DI.AppStart message type.
pub const MSG_DI_APP_START: u8 = 10;
/// DI.SetCredentials message type.
pub const MSG_DI_SET_CREDENTIALS: u8 = 11;
/// DI.SetHMAC message type.
pub const MSG_DI_SET_HMAC: u8 = 12;
/// DI.Done message type.
pub const MSG_DI_DONE: u8 = 13;

// TO0: owner publishes its rendezvous blob.

/// TO0.Hello message type.
pub const MSG_TO0_HELLO: u8 = 20;
/// TO0.HelloAck message type.
pub const MSG_TO0_HELLO_ACK: u8 = 21;
/// TO0.OwnerSign message type.
pub const MSG_TO0_OWNER_SIGN: u8 = 22;
/// TO0.AcceptOwner message type.
pub const MSG_TO0_ACCEPT_OWNER: u8 = 23;

// TO1: device resolves its owner address.

/// TO1.HelloRV message type.
pub const MSG_TO1_HELLO_RV: u8 = 30;
/// TO1.HelloRVAck message type.
pub const MSG_TO1_HELLO_RV_ACK: u8 = 31;
/// TO1.ProveToRV message type.
pub const MSG_TO1_PROVE_TO_RV: u8 = 32;
/// TO1.RVRedirect message type.
pub const MSG_TO1_RV_REDIRECT: u8 = 33;

// TO2: owner onboards the device.

/// TO2.HelloDevice message type.
pub const MSG_TO2_HELLO_DEVICE: u8 = 60;
/// TO2.ProveOVHdr message type.
pub const MSG_TO2_PROVE_OV_HDR: u8 = 61;
/// TO2.GetOVNextEntry message type.
pub const MSG_TO2_GET_OV_NEXT_ENTRY: u8 = 62;
/// TO2.OVNextEntry message type.
pub const MSG_TO2_OV_NEXT_ENTRY: u8 = 63;
/// TO2.ProveDevice message type.
pub const MSG_TO2_PROVE_DEVICE: u8 = 64;
/// TO2.SetupDevice message type.
pub const MSG_TO2_SETUP_DEVICE: u8 = 65;
/// TO2.DeviceServiceInfoReady message type (first encrypted message).
pub const MSG_TO2_DEVICE_SERVICE_INFO_READY: u8 = 66;
/// TO2.OwnerServiceInfoReady message type.
pub const MSG_TO2_OWNER_SERVICE_INFO_READY: u8 = 67;
/// TO2.DeviceServiceInfo message type.
pub const MSG_TO2_DEVICE_SERVICE_INFO: u8 = 68;
/// TO2.OwnerServiceInfo message type.
pub const MSG_TO2_OWNER_SERVICE_INFO: u8 = 69;
/// TO2.Done message type.
pub const MSG_TO2_DONE: u8 = 70;
/// TO2.Done2 message type.
pub const MSG_TO2_DONE2: u8 = 71;

/// Signature capability descriptor: `[sgType, info]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct SigInfo {
    /// COSE signature algorithm identifier (e.g. -7 for ES256).
    pub sg_type: i64,
    /// Opaque capability info, usually empty.
    pub info: ByteBuf,
}

impl SigInfo {
    /// `SigInfo` for an ES256 attestation key.
    #[must_use]
    pub fn es256() -> Self {
        Self {
            sg_type: -7,
            info: ByteBuf::new(),
        }
    }

    /// `SigInfo` for an ES384 attestation key.
    #[must_use]
    pub fn es384() -> Self {
        Self {
            sg_type: -35,
            info: ByteBuf::new(),
        }
    }
}

/// Manufacturing data submitted by the device in DI.AppStart, carried as
/// `bstr .cbor DeviceMfgInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct DeviceMfgInfo {
    /// Requested manufacturer key type (FDO registry id).
    pub key_type: i64,
    /// Requested public-key encoding for the voucher header.
    pub key_encoding: i64,
    /// Manufacturer-scoped device serial number.
    pub serial: String,
    /// Device model / info string recorded in the voucher header.
    pub device_info: String,
    /// PKCS#10 request for the device attestation key.
    pub csr: ByteBuf,
}

/// DI.AppStart (10): `[bstr .cbor DeviceMfgInfo]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct AppStart {
    /// Wrapped manufacturing info.
    pub mfg_info: ByteBuf,
}

impl AppStart {
    /// Wrap manufacturing info.
    ///
    /// # Errors
    /// Returns a codec error on serialization failure.
    pub fn new(info: &DeviceMfgInfo) -> Result<Self, fdo_cbor::CodecError> {
        Ok(Self {
            mfg_info: ByteBuf::from(fdo_cbor::to_canonical_cbor(info)?),
        })
    }

    /// Unwrap and parse the manufacturing info.
    ///
    /// # Errors
    /// Returns a codec error for malformed contents.
    pub fn mfg_info(&self) -> Result<DeviceMfgInfo, fdo_cbor::CodecError> {
        fdo_cbor::from_cbor(&self.mfg_info)
    }
}

/// DI.SetCredentials (11): `[bstr .cbor OVHeader]`. The wrapped bytes are
/// the authoritative header encoding from this point on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct SetCredentials {
    /// Exact voucher header bytes.
    pub ov_header: ByteBuf,
}

/// DI.SetHMAC (12): `[hmac]`.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SetHmac {
    /// Device HMAC over the exact header bytes.
    pub hmac: Hash,
}

/// DI.Done (13): `[]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiDone;

impl serde::Serialize for DiDone {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTuple as _;
        serializer.serialize_tuple(0)?.end()
    }
}

impl<'de> serde::Deserialize<'de> for DiDone {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<ciborium::value::Value>::deserialize(deserializer)?;
        if items.is_empty() {
            Ok(Self)
        } else {
            Err(serde::de::Error::custom("DI.Done carries no fields"))
        }
    }
}

/// TO0.Hello (20): `[]` (reuses the empty-array shape of [`DiDone`]).
pub type To0Hello = DiDone;

/// TO0.HelloAck (21): `[nonce]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct To0HelloAck {
    /// Challenge the owner must sign into `to0d`.
    pub nonce3: Nonce,
}

/// The owner's signed state for TO0: `[voucher, waitSeconds, nonce3]`.
///
/// Hashed as exact bytes into `to1d`; carried byte-string-wrapped.
#[derive(Debug, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct To0Data {
    /// The full ownership voucher.
    pub voucher: OwnershipVoucher,
    /// Requested blob lifetime in seconds.
    pub wait_seconds: u32,
    /// Echo of the rendezvous challenge.
    pub nonce3: Nonce,
}

/// TO0.OwnerSign (22): `[bstr .cbor to0d, to1d]` where `to1d` is the
/// owner-signed redirect (encoded COSE_Sign1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct OwnerSign {
    /// Exact `to0d` bytes; `to1d` binds their hash.
    pub to0d: ByteBuf,
    /// Encoded `COSE_Sign1` over [`crate::rendezvous::RvTo2Addr`] list +
    /// `to0d` hash.
    pub to1d: ByteBuf,
}

/// Payload of the owner-signed `to1d` redirect:
/// `[[RVTO2Addr...], to0dHash]`.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct To1dPayload {
    /// Owner TO2 endpoints, in preference order.
    pub addrs: Vec<crate::rendezvous::RvTo2Addr>,
    /// Hash over the exact `to0d` bytes.
    pub to0d_hash: Hash,
}

/// TO0.AcceptOwner (23): `[waitSeconds]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct AcceptOwner {
    /// Granted blob lifetime in seconds.
    pub wait_seconds: u32,
}

/// TO1.HelloRV (30): `[guid, sigInfo]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct HelloRv {
    /// Device GUID to resolve.
    pub guid: Guid,
    /// Device attestation capability.
    pub sig_info: SigInfo,
}

/// TO1.HelloRVAck (31): `[nonce, sigInfo]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct HelloRvAck {
    /// Challenge the device must sign.
    pub nonce4: Nonce,
    /// Echoed attestation capability.
    pub sig_info: SigInfo,
}

/// Signed attestation payload used by TO1.ProveToRV (32) and
/// TO2.ProveDevice (64): `[nonce, guid, extra?]`.
///
/// For ProveDevice, `extra` carries the party-B key-exchange parameter and
/// `setup_nonce` the device's NonceTO2SetupDv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct AttestationPayload {
    /// The challenge being answered.
    pub nonce: Nonce,
    /// The attesting device.
    pub guid: Guid,
    /// Party-B key-exchange parameter (TO2 only).
    pub extra: Option<ByteBuf>,
    /// Device-chosen nonce for SetupDevice (TO2 only).
    pub setup_nonce: Option<Nonce>,
}

/// TO2.HelloDevice (60):
/// `[maxMsgSize, guid, nonce, kexSuiteName, cipherSuite, sigInfo]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct HelloDevice {
    /// Largest message the device accepts.
    pub max_device_message_size: u16,
    /// Device GUID.
    pub guid: Guid,
    /// NonceTO2ProveOV; the owner must sign it into ProveOVHdr.
    pub nonce_prove_ov: Nonce,
    /// Offered key-exchange suite.
    pub kex_suite: KexSuite,
    /// Offered cipher-suite identifier. Kept numeric so unsupported and
    /// deprecated offers can be refused during negotiation instead of at
    /// parse time.
    pub cipher_suite: i64,
    /// Device attestation capability.
    pub sig_info: SigInfo,
}

/// Payload of TO2.ProveOVHdr (61), signed by the current owner key:
/// `[bstr .cbor OVHeader, numEntries, hmac, nonce, sigInfo, xA, nonceDv]`.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ProveOvHdrPayload {
    /// Exact voucher header bytes.
    pub ov_header: ByteBuf,
    /// Number of entries the device may fetch.
    pub num_entries: u16,
    /// The voucher's header HMAC.
    pub hmac: Hash,
    /// Echo of the device's NonceTO2ProveOV.
    pub nonce_prove_ov: Nonce,
    /// Owner attestation capability response.
    pub sig_info_b: SigInfo,
    /// Party-A key-exchange parameter.
    pub xa_kex: ByteBuf,
    /// NonceTO2ProveDv for the device to sign in ProveDevice.
    pub nonce_prove_dv: Nonce,
}

/// TO2.GetOVNextEntry (62): `[entryNum]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct GetOvNextEntry {
    /// Requested entry index.
    pub entry_num: u16,
}

/// TO2.OVNextEntry (63): `[entryNum, bstr entry]` with the entry's exact
/// COSE bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct OvNextEntry {
    /// Index of this entry.
    pub entry_num: u16,
    /// Exact entry bytes as stored in the voucher.
    pub entry: ByteBuf,
}

/// Payload of TO2.SetupDevice (65), signed by the replacement owner key:
/// `[[RVTO2Addr...], guid, nonce, owner2Key]`.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SetupDevicePayload {
    /// Replacement owner endpoints for the next onboarding.
    pub rendezvous: Vec<crate::rendezvous::RvTo2Addr>,
    /// Replacement GUID (fresh unless credential reuse is on).
    pub replacement_guid: Guid,
    /// Echo of the device's NonceTO2SetupDv.
    pub nonce_setup_dv: Nonce,
    /// The replacement owner public key.
    pub owner2_key: fdo_crypto::PublicKey,
}

/// TO2.DeviceServiceInfoReady (66): `[replacementHmac?, maxOwnerMsgSize?]`.
/// First message inside the encrypted tunnel.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DeviceServiceInfoReady {
    /// HMAC over the replacement header, when credential reuse is off.
    pub replacement_hmac: Option<Hash>,
    /// Largest ServiceInfo message the device will send the owner.
    pub max_owner_message_size: Option<u16>,
}

/// TO2.OwnerServiceInfoReady (67): `[maxDeviceMsgSize?]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct OwnerServiceInfoReady {
    /// Largest ServiceInfo message the owner will send the device.
    pub max_device_message_size: Option<u16>,
}

/// TO2.DeviceServiceInfo (68): `[isMore, [KV...]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct DeviceServiceInfo {
    /// Whether the device has more ServiceInfo to send.
    pub is_more: bool,
    /// MTU-bounded key-value frames.
    pub info: Vec<crate::serviceinfo::ServiceInfoKv>,
}

/// TO2.OwnerServiceInfo (69): `[isMore, isDone, [KV...]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct OwnerServiceInfo {
    /// Whether the owner has more ServiceInfo queued.
    pub is_more: bool,
    /// Whether the owner is finished with ServiceInfo entirely.
    pub is_done: bool,
    /// MTU-bounded key-value frames.
    pub info: Vec<crate::serviceinfo::ServiceInfoKv>,
}

/// TO2.Done (70): `[nonceProveDv]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct To2Done {
    /// Echo of NonceTO2ProveDv, closing the loop on the device proof.
    pub nonce_prove_dv: Nonce,
}

/// TO2.Done2 (71): `[nonceSetupDv]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct To2Done2 {
    /// Echo of NonceTO2SetupDv, closing the loop on SetupDevice.
    pub nonce_setup_dv: Nonce,
}
