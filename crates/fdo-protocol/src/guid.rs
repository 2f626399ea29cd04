//! Device GUIDs and protocol nonces.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 128-bit device identifier, present in every voucher and message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid([u8; 16]);

impl Guid {
    /// Generate a fresh random GUID.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice.
    ///
    /// Returns `None` for any length other than 16.
    #[must_use]
    pub fn try_from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 16] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for Guid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Self::try_from_slice(&bytes)
            .ok_or_else(|| D::Error::custom(format!("invalid GUID length {}", bytes.len())))
    }
}

/// 128-bit protocol nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; 16]);

impl Nonce {
    /// Generate a fresh random nonce.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        let bytes: [u8; 16] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::custom(format!("invalid nonce length {}", bytes.len())))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_round_trip() {
        let guid = Guid::random();
        let bytes = fdo_cbor::to_canonical_cbor(&guid).unwrap();
        let decoded: Guid = fdo_cbor::from_cbor(&bytes).unwrap();
        assert_eq!(decoded, guid);
        // bstr(16): 0x50
        assert_eq!(bytes[0], 0x50);
    }

    #[test]
    fn literal_guid_displays_as_hex() {
        let guid = Guid::from_bytes([
            0xfe, 0x85, 0x1c, 0xc3, 0xa2, 0xfe, 0x08, 0x16, 0x6b, 0x36, 0x4b, 0x19, 0x1c, 0xfb,
            0xb5, 0xd0,
        ]);
        assert_eq!(guid.to_string(), "fe851cc3a2fe08166b364b191cfbb5d0");
    }

    #[test]
    fn wrong_length_rejected() {
        let bytes = fdo_cbor::to_canonical_cbor(&serde_bytes::Bytes::new(&[0u8; 8])).unwrap();
        assert!(fdo_cbor::from_cbor::<Guid>(&bytes).is_err());
        assert!(fdo_cbor::from_cbor::<Nonce>(&bytes).is_err());
    }
}
