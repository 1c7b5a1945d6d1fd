//! Reply Sink
//!
//! Commands write their output into a [`Reply`] instead of returning a single
//! value. This lets a command stream an array whose length is only known at
//! the end (MMKEYS walks the whole keyspace before it knows how many keys
//! matched) and lets the transaction wrapper discard a half-written reply
//! when the engine fails midway.

use crate::protocol::types::{write_array_header, RespValue};
use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Value(RespValue),
    /// Array header; `None` until the deferred length is set.
    ArrayHeader(Option<usize>),
}

/// Placeholder for an array length that is filled in later.
#[derive(Debug)]
#[must_use = "a deferred length must be set before the reply is sent"]
pub struct DeferredLen(usize);

/// Position in a reply, used to roll back partial output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyMark(usize);

/// Output collected for one command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reply {
    frames: Vec<Frame>,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: RespValue) {
        self.frames.push(Frame::Value(value));
    }

    pub fn ok(&mut self) {
        self.add(RespValue::ok());
    }

    pub fn status(&mut self, status: impl Into<String>) {
        self.add(RespValue::simple_string(status));
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.add(RespValue::error(msg));
    }

    pub fn integer(&mut self, n: i64) {
        self.add(RespValue::integer(n));
    }

    pub fn bulk(&mut self, data: impl Into<Bytes>) {
        self.add(RespValue::bulk_string(data));
    }

    pub fn null(&mut self) {
        self.add(RespValue::null());
    }

    /// Starts an array whose length will be set with
    /// [`Reply::set_deferred_len`].
    pub fn add_deferred_len(&mut self) -> DeferredLen {
        self.frames.push(Frame::ArrayHeader(None));
        DeferredLen(self.frames.len() - 1)
    }

    pub fn set_deferred_len(&mut self, slot: DeferredLen, len: usize) {
        if let Some(frame) = self.frames.get_mut(slot.0) {
            *frame = Frame::ArrayHeader(Some(len));
        }
    }

    pub fn mark(&self) -> ReplyMark {
        ReplyMark(self.frames.len())
    }

    /// Drops everything written after `mark`.
    pub fn truncate(&mut self, mark: ReplyMark) {
        self.frames.truncate(mark.0);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Appends the wire form of the reply to `buf`.
    ///
    /// An array header whose length was never set is written as an empty
    /// array so the stream stays well-formed.
    pub fn serialize_into(&self, buf: &mut BytesMut) {
        for frame in &self.frames {
            match frame {
                Frame::Value(value) => value.serialize_into(buf),
                Frame::ArrayHeader(len) => write_array_header(buf, len.unwrap_or(0)),
            }
        }
    }

    /// Folds the frames back into values, nesting deferred arrays.
    pub fn into_values(self) -> Vec<RespValue> {
        let mut frames = self.frames.into_iter();
        let mut out = Vec::new();
        while let Some(value) = fold(&mut frames) {
            out.push(value);
        }
        out
    }

    /// Returns the single value of a one-value reply, `None` otherwise.
    pub fn into_single(self) -> Option<RespValue> {
        let mut values = self.into_values();
        if values.len() == 1 {
            values.pop()
        } else {
            None
        }
    }
}

fn fold(frames: &mut impl Iterator<Item = Frame>) -> Option<RespValue> {
    match frames.next()? {
        Frame::Value(value) => Some(value),
        Frame::ArrayHeader(len) => {
            let len = len.unwrap_or(0);
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(fold(frames)?);
            }
            Some(RespValue::Array(items))
        }
    }
}
