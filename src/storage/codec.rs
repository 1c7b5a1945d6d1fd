//! Value Codec
//!
//! Every value stored in the LMDB environment is a single byte string with
//! a small header in front of the payload:
//!
//! ```text
//! ┌──────────────┬───────────────────────────┬─────────────────┐
//! │ type|encoding│ expiration                │ payload         │
//! │   1 byte     │ 0x00  or  6 bytes (flag)  │ remaining bytes │
//! └──────────────┴───────────────────────────┴─────────────────┘
//! ```
//!
//! The first byte holds the value type in the high nibble and the encoding in
//! the low nibble. The expiration field is either a single zero byte ("never
//! expires") or 6 big-endian bytes holding the low 48 bits of the millisecond
//! timestamp with the top bit overlaid as the "has expiration" flag. That
//! leaves 47 bits of timestamp, enough for the next four thousand years.
//!
//! Only raw strings are supported. Any other type/encoding nibble found on
//! disk means the environment is corrupt, and decoding panics.

use bytes::Bytes;

/// Size of the type/encoding header.
const HEADER_LEN: usize = 1;

/// Size of the expiration field when an expiration is present.
const EXPIRE_LEN: usize = 6;

/// Flag bit in the first expiration byte.
const EXPIRE_FLAG: u8 = 0x80;

/// Largest expiration timestamp the record format can hold.
pub const MAX_EXPIRE_AT: i64 = (1 << 47) - 1;

/// Kind of value held by a record. The nibble leaves room for 16 kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    String = 0,
}

impl ValueType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(ValueType::String),
            _ => None,
        }
    }

    /// Name reported by TYPE and DEBUG OBJECT.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
        }
    }
}

/// Physical representation of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    Raw = 0,
}

impl Encoding {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Encoding::Raw),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Raw => "raw",
        }
    }
}

/// A decoded record.
///
/// `payload` is `None` when the record was decoded shallowly; `len` is the
/// payload length in both cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value_type: ValueType,
    pub encoding: Encoding,
    /// Absolute expiration in unix milliseconds, `None` = never expires.
    pub expire_at: Option<i64>,
    pub len: usize,
    pub payload: Option<Bytes>,
}

impl StoredValue {
    /// Creates a raw string value.
    pub fn string(payload: impl Into<Bytes>, expire_at: Option<i64>) -> Self {
        let payload = payload.into();
        Self {
            value_type: ValueType::String,
            encoding: Encoding::Raw,
            expire_at,
            len: payload.len(),
            payload: Some(payload),
        }
    }

    /// Returns true if the value has an expiration strictly before `now_ms`.
    #[inline]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_at.map(|at| now_ms > at).unwrap_or(false)
    }

    /// Returns the payload bytes, empty for a shallow decode.
    pub fn bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

/// Encodes a payload and optional expiration into a record.
///
/// Expirations outside `[0, MAX_EXPIRE_AT]` are clamped: anything in the past
/// is simply "expired", anything past the format's range is "far future".
pub fn encode(payload: &[u8], expire_at: Option<i64>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + EXPIRE_LEN + payload.len());
    buf.push(((ValueType::String as u8) << 4) | Encoding::Raw as u8);

    match expire_at {
        Some(at) => {
            let at = at.clamp(0, MAX_EXPIRE_AT) as u64;
            let be = at.to_be_bytes();
            buf.extend_from_slice(&be[2..]);
            buf[HEADER_LEN] |= EXPIRE_FLAG;
        }
        None => buf.push(0),
    }

    buf.extend_from_slice(payload);
    buf
}

/// Encodes a [`StoredValue`].
///
/// # Panics
///
/// Panics if the value is not a raw string. The command layer never builds
/// anything else.
pub fn encode_value(value: &StoredValue) -> Vec<u8> {
    assert!(
        value.value_type == ValueType::String && value.encoding == Encoding::Raw,
        "MDB: unsupported value type/encoding {:?}/{:?}",
        value.value_type,
        value.encoding
    );
    encode(value.bytes(), value.expire_at)
}

/// Decodes a record read from the environment.
///
/// With `shallow` set the payload is not copied out; only the header,
/// expiration and payload length are returned.
///
/// # Panics
///
/// Panics on an unsupported type/encoding nibble or a truncated header. Both
/// mean the environment holds data this layer never wrote.
pub fn decode(raw: &[u8], shallow: bool) -> StoredValue {
    assert!(
        raw.len() > HEADER_LEN,
        "MDB: corrupt record, {} byte(s) is shorter than the header",
        raw.len()
    );

    let value_type = ValueType::from_nibble(raw[0] >> 4)
        .unwrap_or_else(|| panic!("MDB: corrupt record, unknown type {:#x}", raw[0] >> 4));
    let encoding = Encoding::from_nibble(raw[0] & 0x0F)
        .unwrap_or_else(|| panic!("MDB: corrupt record, unknown encoding {:#x}", raw[0] & 0x0F));

    let rest = &raw[HEADER_LEN..];
    let (expire_at, body) = if rest[0] & EXPIRE_FLAG != 0 {
        assert!(
            rest.len() >= EXPIRE_LEN,
            "MDB: corrupt record, truncated expiration field"
        );
        let mut be = [0u8; 8];
        be[2..].copy_from_slice(&rest[..EXPIRE_LEN]);
        be[2] &= !EXPIRE_FLAG;
        (Some(u64::from_be_bytes(be) as i64), &rest[EXPIRE_LEN..])
    } else {
        (None, &rest[1..])
    };

    StoredValue {
        value_type,
        encoding,
        expire_at,
        len: body.len(),
        payload: if shallow {
            None
        } else {
            Some(Bytes::copy_from_slice(body))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_expiration_layout() {
        let raw = encode(b"hello", None);
        assert_eq!(raw, b"\x00\x00hello");

        let value = decode(&raw, false);
        assert_eq!(value, StoredValue::string("hello", None));
    }

    #[test]
    fn test_expiration_layout() {
        let at = 1_700_000_000_123i64;
        let raw = encode(b"v", Some(at));
        assert_eq!(raw.len(), 1 + 6 + 1);
        assert_eq!(raw[1] & 0x80, 0x80);

        let mut expected = at.to_be_bytes();
        expected[2] |= 0x80;
        assert_eq!(&raw[1..7], &expected[2..]);

        let value = decode(&raw, false);
        assert_eq!(value.expire_at, Some(at));
        assert_eq!(value.bytes(), b"v");
    }

    #[test]
    fn test_empty_payload() {
        let raw = encode(b"", None);
        assert_eq!(raw.len(), 2);
        let value = decode(&raw, false);
        assert_eq!(value.len, 0);
        assert_eq!(value.payload, Some(Bytes::new()));
    }

    #[test]
    fn test_shallow_decode_skips_payload() {
        let raw = encode(b"payload", Some(42));
        let value = decode(&raw, true);
        assert_eq!(value.payload, None);
        assert_eq!(value.len, 7);
        assert_eq!(value.expire_at, Some(42));
        assert_eq!(value.value_type.as_str(), "string");
        assert_eq!(value.encoding.as_str(), "raw");
    }

    #[test]
    fn test_zero_expiration_is_not_never() {
        let value = decode(&encode(b"x", Some(0)), true);
        assert_eq!(value.expire_at, Some(0));
        assert!(value.is_expired(1));
    }

    #[test]
    fn test_out_of_range_expirations_clamp() {
        assert_eq!(decode(&encode(b"x", Some(-5)), true).expire_at, Some(0));
        assert_eq!(
            decode(&encode(b"x", Some(i64::MAX)), true).expire_at,
            Some(MAX_EXPIRE_AT)
        );
    }

    #[test]
    fn test_encode_value_matches_encode() {
        let value = StoredValue::string("abc", Some(1000));
        assert_eq!(encode_value(&value), encode(b"abc", Some(1000)));
    }

    #[test]
    #[should_panic(expected = "unknown type")]
    fn test_unknown_type_is_fatal() {
        decode(b"\x10\x00abc", false);
    }

    #[test]
    #[should_panic(expected = "unknown encoding")]
    fn test_unknown_encoding_is_fatal() {
        decode(b"\x03\x00abc", true);
    }

    #[test]
    #[should_panic(expected = "shorter than the header")]
    fn test_short_record_is_fatal() {
        decode(b"\x00", true);
    }

    #[test]
    fn test_is_expired() {
        let value = StoredValue::string("v", Some(100));
        assert!(!value.is_expired(100));
        assert!(value.is_expired(101));
        assert!(!StoredValue::string("v", None).is_expired(i64::MAX));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn record_roundtrip(
                payload in prop::collection::vec(any::<u8>(), 0..256),
                expire_at in prop::option::of(0i64..=MAX_EXPIRE_AT),
            ) {
                let value = StoredValue::string(payload.clone(), expire_at);
                let raw = encode_value(&value);
                prop_assert_eq!(decode(&raw, false), value);

                let shallow = decode(&raw, true);
                prop_assert_eq!(shallow.len, payload.len());
                prop_assert_eq!(shallow.expire_at, expire_at);
            }
        }
    }
}
