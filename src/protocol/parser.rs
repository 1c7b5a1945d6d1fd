//! Request Parser
//!
//! Clients send commands either as a RESP array of bulk strings
//! (`*2\r\n$5\r\nMMGET\r\n$3\r\nkey\r\n`) or as a plain inline line
//! (`MMGET key\r\n`, handy with telnet). Both become a list of arguments.
//!
//! The parser works on the connection's `BytesMut` read buffer. A complete
//! request is split off the front of the buffer and its arguments are
//! zero-copy slices of that frame. An incomplete request leaves the buffer
//! untouched and returns `Ok(None)`.

use crate::protocol::types::{prefix, CRLF};
use bytes::{Bytes, BytesMut};
use std::ops::Range;
use thiserror::Error;

/// Errors that make a request stream unusable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid multibulk length")]
    InvalidMultibulkLength,

    #[error("invalid bulk length")]
    InvalidBulkLength,

    #[error("expected '$', got '{}'", char::from(*.0))]
    ExpectedBulk(u8),

    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,

    #[error("request too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Largest bulk argument accepted (512 MB, same as Redis).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Largest number of arguments in one request.
pub const MAX_ARGS: usize = 1024 * 1024;

/// Largest inline request line.
pub const MAX_INLINE_SIZE: usize = 64 * 1024;

/// Incremental request parser.
#[derive(Debug, Default)]
pub struct RequestParser {
    /// Reusable scratch list of argument ranges.
    ranges: Vec<Range<usize>>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one request from the front of `buf`.
    ///
    /// On success the request's bytes are removed from `buf`. Empty inline
    /// lines are skipped and yield an empty argument list.
    pub fn parse(&mut self, buf: &mut BytesMut) -> ParseResult<Option<Vec<Bytes>>> {
        if buf.is_empty() {
            return Ok(None);
        }

        self.ranges.clear();
        let consumed = if buf[0] == prefix::ARRAY {
            match self.scan_multibulk(buf)? {
                Some(n) => n,
                None => return Ok(None),
            }
        } else {
            match self.scan_inline(buf)? {
                Some(n) => n,
                None => return Ok(None),
            }
        };

        let frame = buf.split_to(consumed).freeze();
        Ok(Some(
            self.ranges.drain(..).map(|r| frame.slice(r)).collect(),
        ))
    }

    fn scan_multibulk(&mut self, buf: &[u8]) -> ParseResult<Option<usize>> {
        let Some((count, mut pos)) = read_length_line(buf, 1)? else {
            return Ok(None);
        };
        let count = match count {
            n if n <= 0 => return Ok(Some(pos)),
            n if n as usize > MAX_ARGS => return Err(ParseError::InvalidMultibulkLength),
            n => n as usize,
        };

        self.ranges.reserve(count);
        for _ in 0..count {
            let Some(&tag) = buf.get(pos) else {
                return Ok(None);
            };
            if tag != prefix::BULK_STRING {
                return Err(ParseError::ExpectedBulk(tag));
            }

            let Some((len, start)) = read_length_line(buf, pos + 1)? else {
                return Ok(None);
            };
            if len < 0 {
                return Err(ParseError::InvalidBulkLength);
            }
            let len = len as usize;
            if len > MAX_BULK_SIZE {
                return Err(ParseError::TooLarge {
                    size: len,
                    max: MAX_BULK_SIZE,
                });
            }

            let end = start + len;
            if buf.len() < end + CRLF.len() {
                return Ok(None);
            }
            if &buf[end..end + CRLF.len()] != CRLF {
                return Err(ParseError::MissingCrlf);
            }

            self.ranges.push(start..end);
            pos = end + CRLF.len();
        }
        Ok(Some(pos))
    }

    fn scan_inline(&mut self, buf: &[u8]) -> ParseResult<Option<usize>> {
        let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_INLINE_SIZE {
                return Err(ParseError::TooLarge {
                    size: buf.len(),
                    max: MAX_INLINE_SIZE,
                });
            }
            return Ok(None);
        };

        let line_end = if newline > 0 && buf[newline - 1] == b'\r' {
            newline - 1
        } else {
            newline
        };

        let mut i = 0;
        while i < line_end {
            if buf[i].is_ascii_whitespace() {
                i += 1;
                continue;
            }
            let start = i;
            while i < line_end && !buf[i].is_ascii_whitespace() {
                i += 1;
            }
            self.ranges.push(start..i);
        }
        Ok(Some(newline + 1))
    }
}

/// Reads a `<int>\r\n` line starting at `from`; returns the value and the
/// offset just past the CRLF.
fn read_length_line(buf: &[u8], from: usize) -> ParseResult<Option<(i64, usize)>> {
    let Some(rest) = buf.get(from..) else {
        return Ok(None);
    };
    let Some(cr) = rest.windows(2).position(|w| w == CRLF) else {
        return Ok(None);
    };

    let n = std::str::from_utf8(&rest[..cr])
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(if buf[0] == prefix::ARRAY && from == 1 {
            ParseError::InvalidMultibulkLength
        } else {
            ParseError::InvalidBulkLength
        })?;

    Ok(Some((n, from + cr + CRLF.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> (Vec<Vec<Bytes>>, BytesMut) {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(args) = parser.parse(&mut buf).unwrap() {
            out.push(args);
        }
        (out, buf)
    }

    #[test]
    fn test_multibulk_request() {
        let (requests, rest) = parse_all(b"*3\r\n$5\r\nMMSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");
        assert!(rest.is_empty());
        assert_eq!(
            requests,
            vec![vec![
                Bytes::from("MMSET"),
                Bytes::from("key"),
                Bytes::from("value")
            ]]
        );
    }

    #[test]
    fn test_pipelined_requests() {
        let (requests, _) = parse_all(b"*1\r\n$4\r\nPING\r\n*2\r\n$5\r\nMMGET\r\n$1\r\nk\r\n");
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1][0], Bytes::from("MMGET"));
    }

    #[test]
    fn test_incomplete_request_leaves_buffer() {
        let input = b"*2\r\n$5\r\nMMGET\r\n$3\r\nke";
        let (requests, rest) = parse_all(input);
        assert!(requests.is_empty());
        assert_eq!(&rest[..], &input[..]);
    }

    #[test]
    fn test_binary_safe_argument() {
        let (requests, _) = parse_all(b"*2\r\n$5\r\nMMGET\r\n$5\r\na\r\n\x00b\r\n");
        assert_eq!(requests[0][1], Bytes::from_static(b"a\r\n\x00b"));
    }

    #[test]
    fn test_inline_request() {
        let (requests, _) = parse_all(b"MMSET  key value\r\nPING\n");
        assert_eq!(
            requests,
            vec![
                vec![Bytes::from("MMSET"), Bytes::from("key"), Bytes::from("value")],
                vec![Bytes::from("PING")],
            ]
        );
    }

    #[test]
    fn test_empty_inline_line() {
        let (requests, _) = parse_all(b"\r\n");
        assert_eq!(requests, vec![Vec::<Bytes>::new()]);
    }

    #[test]
    fn test_protocol_errors() {
        let mut parser = RequestParser::new();

        let mut buf = BytesMut::from(&b"*x\r\n"[..]);
        assert_eq!(parser.parse(&mut buf), Err(ParseError::InvalidMultibulkLength));

        let mut buf = BytesMut::from(&b"*1\r\n:1\r\n"[..]);
        assert_eq!(parser.parse(&mut buf), Err(ParseError::ExpectedBulk(b':')));

        let mut buf = BytesMut::from(&b"*1\r\n$1\r\nab\r\n"[..]);
        assert_eq!(parser.parse(&mut buf), Err(ParseError::MissingCrlf));

        let mut buf = BytesMut::from(&b"*1\r\n$-5\r\n"[..]);
        assert_eq!(parser.parse(&mut buf), Err(ParseError::InvalidBulkLength));
    }
}
