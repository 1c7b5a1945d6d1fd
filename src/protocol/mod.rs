//! RESP Protocol
//!
//! - `types`: [`RespValue`] and its wire serialization
//! - `reply`: [`Reply`], the per-command output sink with deferred arrays
//! - `parser`: [`RequestParser`], turning the read buffer into argument lists
//!
//! ```ignore
//! use flashmdb::protocol::{Reply, RequestParser};
//! use bytes::BytesMut;
//!
//! let mut buf = BytesMut::from(&b"*2\r\n$5\r\nMMGET\r\n$4\r\nname\r\n"[..]);
//! let args = RequestParser::new().parse(&mut buf)?.unwrap();
//!
//! let mut reply = Reply::new();
//! reply.bulk("Ariz");
//! ```

pub mod parser;
pub mod reply;
pub mod types;

pub use parser::{ParseError, ParseResult, RequestParser};
pub use reply::{DeferredLen, Reply, ReplyMark};
pub use types::RespValue;
