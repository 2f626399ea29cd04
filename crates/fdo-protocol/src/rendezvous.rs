//! Rendezvous instructions and owner TO2 addresses.
//!
//! `RendezvousInfo` is an ordered list of directives; each directive is an
//! ordered list of `[variable, value?]` instructions and represents one
//! alternative way for the device to reach a rendezvous server. Values are
//! byte-string-wrapped CBOR.

use ciborium::value::Value;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_tuple::{Deserialize_tuple, Serialize_tuple};

use fdo_cbor::CodecError;

/// Rendezvous variable identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RvVariable {
    /// Directive applies to the device only.
    DevOnly = 0,
    /// Directive applies to the owner only.
    OwnerOnly = 1,
    /// IP address (bstr).
    IpAddress = 2,
    /// Device-side TCP port.
    DevPort = 3,
    /// Owner-side TCP port.
    OwnerPort = 4,
    /// DNS name (tstr).
    Dns = 5,
    /// Server certificate hash.
    SvCertHash = 6,
    /// CA certificate hash.
    ClCertHash = 7,
    /// User input required.
    UserInput = 8,
    /// Wi-Fi SSID.
    WifiSsid = 9,
    /// Wi-Fi password.
    WifiPw = 10,
    /// Transport medium.
    Medium = 11,
    /// Transport protocol.
    Protocol = 12,
    /// Delay before contact, seconds.
    DelaySec = 13,
    /// Rendezvous bypass.
    Bypass = 14,
}

impl RvVariable {
    /// Numeric registry identifier.
    #[must_use]
    pub const fn id(self) -> u64 {
        self as u64
    }
}

/// Protocol values for the [`RvVariable::Protocol`] instruction.
pub const RV_PROT_HTTP: u8 = 1;
/// HTTPS protocol value.
pub const RV_PROT_HTTPS: u8 = 2;

/// One `[variable, value?]` instruction.
///
/// The value, when present, is byte-string-wrapped CBOR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RvInstruction {
    /// Variable identifier.
    pub variable: u64,
    /// Wrapped value bytes, absent for flag variables.
    pub value: Option<Vec<u8>>,
}

impl RvInstruction {
    /// Build an instruction with a CBOR-encoded value.
    ///
    /// # Errors
    /// Returns a codec error if the value cannot be encoded.
    pub fn with_value<T: Serialize>(variable: RvVariable, value: &T) -> Result<Self, CodecError> {
        Ok(Self {
            variable: variable.id(),
            value: Some(fdo_cbor::to_canonical_cbor(value)?),
        })
    }

    /// Build a bare flag instruction.
    #[must_use]
    pub const fn flag(variable: RvVariable) -> Self {
        Self {
            variable: variable.id(),
            value: None,
        }
    }

    /// Decode the wrapped value.
    ///
    /// # Errors
    /// Returns a codec error if absent or undecodable.
    pub fn decode_value<T: serde::de::DeserializeOwned>(&self) -> Result<T, CodecError> {
        let bytes = self.value.as_deref().ok_or(CodecError::Malformed)?;
        fdo_cbor::from_cbor(bytes)
    }
}

impl Serialize for RvInstruction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.value {
            Some(value) => (self.variable, serde_bytes::Bytes::new(value)).serialize(serializer),
            None => (self.variable,).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for RvInstruction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Value::Array(items) = value else {
            return Err(D::Error::custom("rendezvous instruction must be an array"));
        };
        let variable = match items.first() {
            Some(Value::Integer(i)) => {
                u64::try_from(*i).map_err(|_| D::Error::custom("invalid rv variable"))?
            }
            _ => return Err(D::Error::custom("rendezvous instruction missing variable")),
        };
        let value = match items.get(1) {
            Some(Value::Bytes(bytes)) => Some(bytes.clone()),
            None => None,
            Some(_) => return Err(D::Error::custom("rendezvous value must be a byte string")),
        };
        if items.len() > 2 {
            return Err(D::Error::custom("rendezvous instruction too long"));
        }
        Ok(Self { variable, value })
    }
}

/// One ordered alternative: a list of instructions.
pub type RvDirective = Vec<RvInstruction>;

/// Ordered rendezvous directives burned into the voucher at DI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct RvInfo(pub Vec<RvDirective>);

impl RvInfo {
    /// A single-directive `RvInfo` pointing at one HTTP rendezvous server.
    ///
    /// # Errors
    /// Returns a codec error if value encoding fails.
    pub fn http(dns: &str, port: u16) -> Result<Self, CodecError> {
        Ok(Self(vec![vec![
            RvInstruction::with_value(RvVariable::Dns, &dns)?,
            RvInstruction::with_value(RvVariable::DevPort, &port)?,
            RvInstruction::with_value(RvVariable::OwnerPort, &port)?,
            RvInstruction::with_value(RvVariable::Protocol, &RV_PROT_HTTP)?,
        ]]))
    }
}

/// One owner TO2 endpoint: `[ip?, dns?, port, protocol]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct RvTo2Addr {
    /// Raw IP address bytes, or null.
    pub ip: Option<serde_bytes::ByteBuf>,
    /// DNS name, or null.
    pub dns: Option<String>,
    /// TCP port.
    pub port: u16,
    /// Transport protocol (`RV_PROT_HTTP` / `RV_PROT_HTTPS`).
    pub protocol: u8,
}

impl RvTo2Addr {
    /// An HTTP endpoint by DNS name.
    #[must_use]
    pub fn http_dns(dns: &str, port: u16) -> Self {
        Self {
            ip: None,
            dns: Some(dns.to_string()),
            port,
            protocol: RV_PROT_HTTP,
        }
    }
}
