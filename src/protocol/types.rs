//! RESP Values
//!
//! The reply vocabulary of the server. Requests never need the full type
//! tree (they are always arrays of bulk strings, see [`parser`]), so this
//! type only has to be serialized, and compared in tests.
//!
//! ```text
//! +OK\r\n                 status
//! -ERR no such key\r\n    error
//! :42\r\n                 integer
//! $5\r\nhello\r\n         bulk
//! $-1\r\n                 nil
//! *2\r\n...               array
//! ```
//!
//! [`parser`]: crate::protocol::parser

use bytes::{BufMut, Bytes, BytesMut};

/// The CRLF terminator used by RESP.
pub const CRLF: &[u8] = b"\r\n";

/// RESP type prefixes.
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A value in the RESP protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Status reply, must not contain CRLF.
    SimpleString(String),

    /// Error reply. By convention the text starts with an upper-case code
    /// such as `ERR`.
    Error(String),

    Integer(i64),

    /// Binary-safe string.
    BulkString(Bytes),

    /// The nil bulk string.
    Null,

    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// `+OK`
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Appends the wire form of this value to `buf`.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(s) => write_line(buf, prefix::ERROR, s.as_bytes()),
            RespValue::Integer(n) => write_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => {
                write_line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::Null => write_line(buf, prefix::BULK_STRING, b"-1"),
            RespValue::Array(values) => {
                write_array_header(buf, values.len());
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Returns the wire form of this value.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf);
        buf.freeze()
    }
}

/// Writes `*<len>\r\n`.
pub(crate) fn write_array_header(buf: &mut BytesMut, len: usize) {
    write_line(buf, prefix::ARRAY, len.to_string().as_bytes());
}

fn write_line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.reserve(1 + body.len() + CRLF.len());
    buf.put_u8(prefix);
    buf.put_slice(body);
    buf.put_slice(CRLF);
}
