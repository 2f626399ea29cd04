//! Canonical CBOR codec for FIDO Device Onboard wire structures.
//!
//! FDO requires RFC 8949 §4.2 deterministic encoding on every signed or
//! MACed payload, and requires that substructures which were signed on the
//! wire (ownership-voucher entries, COSE payloads) are hashed and verified
//! over the exact bytes received, never a re-encoding. This crate provides
//! both halves:
//!
//! - [`to_canonical_cbor`] / [`from_cbor`] / [`from_canonical_cbor`] for
//!   deterministic serde round-trips, and
//! - [`item_length`] / [`take_item`] / [`RawCbor`] for slicing out and
//!   carrying already-encoded items without touching their bytes.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::io::Cursor;

use ciborium::de::from_reader;
use ciborium::ser::into_writer;
use ciborium::value::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Maximum nesting depth accepted by the raw-item scanner.
const MAX_ITEM_DEPTH: usize = 128;

/// Errors raised by encoding, decoding, or raw-item scanning.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input is not well-formed CBOR (reserved additional-info values,
    /// indefinite lengths, or garbage where an item was expected).
    #[error("malformed CBOR item")]
    Malformed,

    /// A decoded item had a different major type than the caller required.
    #[error("unexpected CBOR type (expected {expected})")]
    UnexpectedType {
        /// Human-readable description of what was expected.
        expected: &'static str,
    },

    /// Input ended before the item it describes.
    #[error("truncated CBOR item (need {needed} more bytes)")]
    Truncated {
        /// Additional bytes required to complete the item.
        needed: usize,
    },

    /// A length or integer argument does not fit the platform.
    #[error("CBOR integer overflow")]
    IntegerOverflow,

    /// A map contains two keys with identical canonical encodings.
    #[error("duplicate map key (canonical key bytes: {key_hex})")]
    DuplicateMapKey {
        /// Hex of the offending canonical key bytes.
        key_hex: String,
    },

    /// Extra bytes remained after the first complete item.
    #[error("trailing bytes after CBOR item")]
    TrailingBytes,

    /// The input decodes but is not in canonical form.
    #[error("non-canonical CBOR encoding")]
    NonCanonical,

    /// The value cannot be represented as a dynamic CBOR `Value`.
    #[error("cbor value conversion error: {0}")]
    Value(#[from] ciborium::value::Error),

    /// CBOR serialization failed.
    #[error("cbor serialization error: {0}")]
    Serialize(#[from] ciborium::ser::Error<std::io::Error>),

    /// CBOR deserialization failed.
    #[error("cbor deserialization error: {0}")]
    Deserialize(#[from] ciborium::de::Error<std::io::Error>),
}

/// Serialize a value to deterministic canonical CBOR bytes.
///
/// Map keys are ordered by the canonical rule (shorter encoding first,
/// then lexicographic) at every nesting level, including inside tags.
///
/// # Errors
/// Returns [`CodecError::DuplicateMapKey`] if two keys canonicalize to the
/// same bytes, or a serialization error from the underlying writer.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut v = Value::serialized(value)?;
    canonicalize_value_in_place(&mut v)?;
    let mut out = Vec::new();
    into_writer(&v, &mut out)?;
    Ok(out)
}

/// Deserialize exactly one CBOR item, rejecting trailing bytes.
///
/// # Errors
/// Returns [`CodecError::TrailingBytes`] if input continues past the first
/// item, or a deserialization error for malformed input.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut cursor = Cursor::new(bytes);
    let value: T = from_reader(&mut cursor)?;
    #[allow(clippy::cast_possible_truncation)] // cursor position <= bytes.len()
    if cursor.position() as usize != bytes.len() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(value)
}

/// Deserialize one CBOR item and require the input to be canonical.
///
/// The decoded value is re-encoded canonically and compared to the input;
/// any difference fails closed. Use this on untrusted signed payloads.
///
/// # Errors
/// Returns [`CodecError::NonCanonical`] for well-formed but non-canonical
/// input, plus everything [`from_cbor`] can return.
pub fn from_canonical_cbor<T: Serialize + DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, CodecError> {
    let value: T = from_cbor(bytes)?;
    if to_canonical_cbor(&value)? != bytes {
        return Err(CodecError::NonCanonical);
    }
    Ok(value)
}

fn canonicalize_value_in_place(v: &mut Value) -> Result<(), CodecError> {
    match v {
        Value::Array(items) => {
            for item in items {
                canonicalize_value_in_place(item)?;
            }
        }
        Value::Map(entries) => canonicalize_map(entries)?,
        Value::Tag(_, boxed) => canonicalize_value_in_place(boxed)?,
        _ => {}
    }
    Ok(())
}

fn canonicalize_map(entries: &mut Vec<(Value, Value)>) -> Result<(), CodecError> {
    use std::cmp::Ordering;

    let mut with_keys = Vec::with_capacity(entries.len());
    for (mut key, mut value) in std::mem::take(entries) {
        canonicalize_value_in_place(&mut key)?;
        canonicalize_value_in_place(&mut value)?;

        let mut key_bytes = Vec::new();
        into_writer(&key, &mut key_bytes)?;
        with_keys.push((key_bytes, key, value));
    }

    with_keys.sort_by(
        |(a_bytes, _, _), (b_bytes, _, _)| match a_bytes.len().cmp(&b_bytes.len()) {
            Ordering::Equal => a_bytes.cmp(b_bytes),
            other => other,
        },
    );

    for pair in with_keys.windows(2) {
        let (left_bytes, _, _) = &pair[0];
        let (right_bytes, _, _) = &pair[1];
        if left_bytes == right_bytes {
            return Err(CodecError::DuplicateMapKey {
                key_hex: hex::encode(right_bytes),
            });
        }
    }

    *entries = with_keys
        .into_iter()
        .map(|(_, key, value)| (key, value))
        .collect();

    Ok(())
}

/// Compute the byte length of the first CBOR item in `bytes`.
///
/// Only definite-length items are accepted; FDO forbids indefinite
/// lengths on the wire. This is the primitive behind all exact-bytes
/// slicing: no item is ever re-encoded to find its boundaries.
///
/// # Errors
/// Returns [`CodecError::Truncated`] if the input ends inside the item,
/// [`CodecError::Malformed`] for indefinite lengths or reserved headers,
/// and [`CodecError::IntegerOverflow`] for lengths beyond the platform.
pub fn item_length(bytes: &[u8]) -> Result<usize, CodecError> {
    item_length_at(bytes, 0)
}

fn item_length_at(bytes: &[u8], depth: usize) -> Result<usize, CodecError> {
    if depth > MAX_ITEM_DEPTH {
        return Err(CodecError::Malformed);
    }
    let first = *bytes.first().ok_or(CodecError::Truncated { needed: 1 })?;
    let major = first >> 5;
    let info = first & 0x1f;

    let (arg, mut len) = decode_argument(bytes, info)?;

    match major {
        // Unsigned and negative integers: the argument is the value.
        0 | 1 => Ok(len),
        // Byte and text strings: the argument is the payload length.
        2 | 3 => {
            let payload = usize::try_from(arg).map_err(|_| CodecError::IntegerOverflow)?;
            let total = len
                .checked_add(payload)
                .ok_or(CodecError::IntegerOverflow)?;
            if bytes.len() < total {
                return Err(CodecError::Truncated {
                    needed: total - bytes.len(),
                });
            }
            Ok(total)
        }
        // Arrays and maps: the argument is an element (or pair) count.
        4 | 5 => {
            let count = usize::try_from(arg).map_err(|_| CodecError::IntegerOverflow)?;
            let items = if major == 5 {
                count.checked_mul(2).ok_or(CodecError::IntegerOverflow)?
            } else {
                count
            };
            for _ in 0..items {
                let inner = item_length_at(&bytes[len..], depth + 1)?;
                len = len.checked_add(inner).ok_or(CodecError::IntegerOverflow)?;
            }
            Ok(len)
        }
        // Tag: the argument is the tag number, followed by one item.
        6 => {
            let inner = item_length_at(&bytes[len..], depth + 1)?;
            len.checked_add(inner).ok_or(CodecError::IntegerOverflow)
        }
        // Simple values and floats: the argument is inline.
        _ => Ok(len),
    }
}

/// Decode the initial-byte argument; returns `(argument, header_len)`.
fn decode_argument(bytes: &[u8], info: u8) -> Result<(u64, usize), CodecError> {
    let take = |n: usize| -> Result<(u64, usize), CodecError> {
        let end = 1 + n;
        if bytes.len() < end {
            return Err(CodecError::Truncated {
                needed: end - bytes.len(),
            });
        }
        let mut arg = 0u64;
        for &b in &bytes[1..end] {
            arg = (arg << 8) | u64::from(b);
        }
        Ok((arg, end))
    };

    match info {
        0..=23 => Ok((u64::from(info), 1)),
        24 => take(1),
        25 => take(2),
        26 => take(4),
        27 => take(8),
        // 28-30 are reserved; 31 is an indefinite length.
        _ => Err(CodecError::Malformed),
    }
}

/// Split the first CBOR item off the front of `input`, advancing it.
///
/// # Errors
/// See [`item_length`].
pub fn take_item<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    let len = item_length(input)?;
    let (item, rest) = input.split_at(len);
    *input = rest;
    Ok(item)
}

/// An opaque, already-encoded CBOR item.
///
/// Carries the exact wire bytes of one item so that hashing and signature
/// verification operate on what was received. Decoding is on demand; the
/// bytes are never normalized.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RawCbor(Vec<u8>);

impl RawCbor {
    /// Wrap bytes that must contain exactly one well-formed CBOR item.
    ///
    /// # Errors
    /// Returns [`CodecError::TrailingBytes`] if more than one item is
    /// present, or a scanner error for malformed input.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        if item_length(bytes)? != bytes.len() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Canonically encode a value into a raw item.
    ///
    /// # Errors
    /// See [`to_canonical_cbor`].
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        Ok(Self(to_canonical_cbor(value)?))
    }

    /// Split one item off the front of `input` and take ownership of it.
    ///
    /// # Errors
    /// See [`item_length`].
    pub fn take_from(input: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(Self(take_item(input)?.to_vec()))
    }

    /// Borrow the exact encoded bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the exact encoded bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the item is empty (never true for a valid item).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decode the item into a typed value.
    ///
    /// # Errors
    /// See [`from_cbor`].
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        from_cbor(&self.0)
    }
}

impl std::fmt::Debug for RawCbor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawCbor({} bytes)", self.0.len())
    }
}

impl AsRef<[u8]> for RawCbor {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Append the header of a definite-length item to `out`.
///
/// `major` is the CBOR major type (0..=7) shifted into place by this
/// function; `arg` is the length/count/value argument, encoded minimally.
pub fn push_header(major: u8, arg: u64, out: &mut Vec<u8>) {
    let mt = major << 5;
    if arg < 24 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(mt | arg as u8);
    } else if arg <= u64::from(u8::MAX) {
        out.push(mt | 24);
        #[allow(clippy::cast_possible_truncation)]
        out.push(arg as u8);
    } else if arg <= u64::from(u16::MAX) {
        out.push(mt | 25);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= u64::from(u32::MAX) {
        out.push(mt | 26);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        out.push(mt | 27);
        out.extend_from_slice(&arg.to_be_bytes());
    }
}

/// Encode an array header for `count` elements.
#[must_use]
pub fn array_header(count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    push_header(4, count as u64, &mut out);
    out
}

/// Wrap already-encoded bytes in a CBOR byte string (`bstr .cbor X`).
#[must_use]
pub fn wrap_bstr(inner: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(inner.len() + 9);
    push_header(2, inner.len() as u64, &mut out);
    out.extend_from_slice(inner);
    out
}

/// Unwrap a CBOR byte string, returning the contained bytes.
///
/// # Errors
/// Returns [`CodecError::UnexpectedType`] if the item is not a byte
/// string, [`CodecError::TrailingBytes`] if input continues past it.
pub fn unwrap_bstr(bytes: &[u8]) -> Result<&[u8], CodecError> {
    let first = *bytes.first().ok_or(CodecError::Truncated { needed: 1 })?;
    if first >> 5 != 2 {
        return Err(CodecError::UnexpectedType {
            expected: "byte string",
        });
    }
    let (arg, header) = decode_argument(bytes, first & 0x1f)?;
    let payload = usize::try_from(arg).map_err(|_| CodecError::IntegerOverflow)?;
    let total = header
        .checked_add(payload)
        .ok_or(CodecError::IntegerOverflow)?;
    if bytes.len() < total {
        return Err(CodecError::Truncated {
            needed: total - bytes.len(),
        });
    }
    if bytes.len() > total {
        return Err(CodecError::TrailingBytes);
    }
    Ok(&bytes[header..total])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn canonical_integers_are_minimal() {
        assert_eq!(to_canonical_cbor(&0u8).unwrap(), vec![0x00]);
        assert_eq!(to_canonical_cbor(&23u8).unwrap(), vec![0x17]);
        assert_eq!(to_canonical_cbor(&24u8).unwrap(), vec![0x18, 0x18]);
        assert_eq!(to_canonical_cbor(&256u16).unwrap(), vec![0x19, 0x01, 0x00]);
    }

    #[test]
    fn canonical_map_orders_keys_length_first() {
        let mut map = HashMap::new();
        map.insert("bb", 1);
        map.insert("a", 2);
        map.insert("aaa", 3);
        map.insert("z", 4);

        let bytes = to_canonical_cbor(&map).unwrap();
        let value: Value = from_cbor(&bytes).unwrap();
        let Value::Map(entries) = value else {
            panic!("expected map");
        };
        let keys: Vec<_> = entries
            .iter()
            .filter_map(|(k, _)| match k {
                Value::Text(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec!["a", "z", "bb", "aaa"]);
    }

    #[test]
    fn duplicate_map_keys_rejected_on_encode() {
        let entries = vec![
            (Value::Text("a".into()), Value::Integer(1.into())),
            (Value::Text("a".into()), Value::Integer(2.into())),
        ];
        let err = to_canonical_cbor(&Value::Map(entries)).unwrap_err();
        assert!(matches!(err, CodecError::DuplicateMapKey { .. }));
    }

    #[test]
    fn strict_decode_rejects_trailing_bytes() {
        let mut bytes = to_canonical_cbor(&1u8).unwrap();
        bytes.push(0x00);
        assert!(matches!(
            from_cbor::<u8>(&bytes),
            Err(CodecError::TrailingBytes)
        ));
    }

    #[test]
    fn canonical_decode_rejects_oversized_int_encoding() {
        // 1 encoded as 0x18 0x01 instead of 0x01.
        let err = from_canonical_cbor::<u8>(&[0x18, 0x01]).unwrap_err();
        assert!(matches!(err, CodecError::NonCanonical));
    }

    #[test]
    fn item_length_scalar_and_strings() {
        assert_eq!(item_length(&[0x00]).unwrap(), 1);
        assert_eq!(item_length(&[0x18, 0xff]).unwrap(), 2);
        // "abc"
        assert_eq!(item_length(&[0x63, b'a', b'b', b'c']).unwrap(), 4);
        // h'0102' followed by junk: only the item is measured.
        assert_eq!(item_length(&[0x42, 1, 2, 0xde, 0xad]).unwrap(), 3);
    }

    #[test]
    fn item_length_nested() {
        // [1, [2, 3], h'00'] = 0x83 0x01 0x82 0x02 0x03 0x41 0x00
        let bytes = [0x83, 0x01, 0x82, 0x02, 0x03, 0x41, 0x00];
        assert_eq!(item_length(&bytes).unwrap(), 7);
        // tag 18 around an array
        let tagged = [0xd2, 0x82, 0x01, 0x02];
        assert_eq!(item_length(&tagged).unwrap(), 4);
    }

    #[test]
    fn item_length_rejects_indefinite_and_truncated() {
        assert!(matches!(item_length(&[0x9f]), Err(CodecError::Malformed)));
        assert!(matches!(
            item_length(&[0x82, 0x01]),
            Err(CodecError::Truncated { .. })
        ));
        assert!(matches!(
            item_length(&[0x62, b'a']),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn take_item_splits_concatenated_items() {
        let mut input: &[u8] = &[0x01, 0x62, b'h', b'i', 0x82, 0x02, 0x03];
        assert_eq!(take_item(&mut input).unwrap(), &[0x01]);
        assert_eq!(take_item(&mut input).unwrap(), &[0x62, b'h', b'i']);
        assert_eq!(take_item(&mut input).unwrap(), &[0x82, 0x02, 0x03]);
        assert!(input.is_empty());
    }

    #[test]
    fn raw_cbor_preserves_non_canonical_bytes() {
        // Deliberately non-canonical encoding of 1.
        let raw = RawCbor::from_slice(&[0x18, 0x01]).unwrap();
        assert_eq!(raw.as_bytes(), &[0x18, 0x01]);
        assert_eq!(raw.decode::<u8>().unwrap(), 1);
    }

    #[test]
    fn raw_cbor_rejects_two_items() {
        assert!(matches!(
            RawCbor::from_slice(&[0x01, 0x02]),
            Err(CodecError::TrailingBytes)
        ));
    }

    #[test]
    fn bstr_wrap_round_trip() {
        let inner = to_canonical_cbor(&vec![1u8, 2, 3]).unwrap();
        let wrapped = wrap_bstr(&inner);
        assert_eq!(unwrap_bstr(&wrapped).unwrap(), inner.as_slice());

        let decoded: serde_bytes::ByteBuf = from_cbor(&wrapped).unwrap();
        assert_eq!(decoded.as_ref(), inner.as_slice());
    }

    #[test]
    fn unwrap_bstr_rejects_other_types() {
        let arr = to_canonical_cbor(&vec![1u8]).unwrap();
        assert!(matches!(
            unwrap_bstr(&arr),
            Err(CodecError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn array_header_golden() {
        assert_eq!(array_header(0), vec![0x80]);
        assert_eq!(array_header(4), vec![0x84]);
        assert_eq!(array_header(24), vec![0x98, 0x18]);
        assert_eq!(array_header(300), vec![0x99, 0x01, 0x2c]);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<u32>().prop_map(|v| Value::Integer(v.into())),
            any::<i32>().prop_map(|v| Value::Integer(v.into())),
            proptest::collection::vec(any::<u8>(), 0..24).prop_map(Value::Bytes),
            "[a-z]{0,12}".prop_map(Value::Text),
            any::<bool>().prop_map(Value::Bool),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                (2u64..=55799, inner).prop_map(|(t, v)| Value::Tag(t, Box::new(v))),
            ]
        })
    }

    proptest! {
        #[test]
        fn scanner_agrees_with_encoder(value in arb_value()) {
            let bytes = to_canonical_cbor(&value).unwrap();
            prop_assert_eq!(item_length(&bytes).unwrap(), bytes.len());
        }

        #[test]
        fn canonical_round_trip(value in arb_value()) {
            let bytes = to_canonical_cbor(&value).unwrap();
            let decoded: Value = from_canonical_cbor(&bytes).unwrap();
            let re = to_canonical_cbor(&decoded).unwrap();
            prop_assert_eq!(re, bytes);
        }
    }
}
