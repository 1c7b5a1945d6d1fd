//! Storage Engine Contract
//!
//! The layer runs on top of an ordered, transactional key-value engine. This
//! module describes exactly what it needs from one, so the command layer and
//! the expiry scanner can be driven by LMDB in production and by an in-memory
//! map in tests.
//!
//! ```text
//!        Backend ──open()──> Engine ──read_txn()──> ReadTxn ──cursor()──> Cursor
//!           │                  │   └──write_txn()─> WriteTxn (commit | abort)
//!           │                  └──copy(sink)  (streams a full environment image)
//!           └──create_image()  (fresh backing file for a restore)
//! ```
//!
//! All calls are synchronous. Every failure is an [`EngineError`] whose
//! `Display` is the engine's own diagnostic text; that text is what clients
//! see in the storage error reply.

use std::io::{self, Write};
use thiserror::Error;

/// Errors reported by a storage engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error raised by LMDB (map full, reader table full, I/O, ...)
    #[error("{0}")]
    Lmdb(#[from] heed::Error),

    /// Filesystem error outside of LMDB itself
    #[error("{0}")]
    Io(#[from] io::Error),

    /// A restored environment image could not be parsed
    #[error("corrupt environment image: {0}")]
    CorruptImage(String),

    /// The environment is closed (layer disabled or mid-restore)
    #[error("environment is closed")]
    Closed,

    /// A transaction handle was used after it was committed or aborted
    #[error("transaction already resolved")]
    TxnResolved,
}

/// A key/value pair borrowed from a transaction.
pub type Entry<'t> = (&'t [u8], &'t [u8]);

/// Cursor positioning operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp<'k> {
    /// Position at exactly this key.
    Set(&'k [u8]),
    /// Position at the first key greater than or equal to this key.
    SetRange(&'k [u8]),
    /// Position at the first key.
    First,
    /// Advance one entry; an unpositioned cursor moves to the first key.
    Next,
}

/// A cursor over the main database, living as long as its transaction.
pub trait Cursor<'t> {
    /// Repositions the cursor and returns the entry under it, if any.
    fn get(&mut self, op: CursorOp<'_>) -> Result<Option<Entry<'t>>, EngineError>;
}

/// Operations available inside any transaction.
pub trait ReadTxn {
    /// Point lookup.
    fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, EngineError>;

    /// Opens a fresh, unpositioned cursor.
    fn cursor(&self) -> Result<Box<dyn Cursor<'_> + '_>, EngineError>;

    /// Number of entries in the main database.
    fn entries(&self) -> Result<u64, EngineError>;

    /// Returns true if a direct lookup of `key` succeeds.
    fn exists(&self, key: &[u8]) -> Result<bool, EngineError> {
        Ok(self.get(key)?.is_some())
    }
}

/// A read-write transaction. It must be resolved with exactly one of
/// [`WriteTxn::commit`] or [`WriteTxn::abort`].
pub trait WriteTxn: ReadTxn {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError>;

    /// Deletes `key`, returning false if it was not present.
    fn delete(&mut self, key: &[u8]) -> Result<bool, EngineError>;

    /// Removes every entry of the main database.
    fn drop_all(&mut self) -> Result<(), EngineError>;

    fn commit(self: Box<Self>) -> Result<(), EngineError>;

    fn abort(self: Box<Self>);
}

/// Environment-level figures reported by MMINFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    pub map_size: usize,
    pub readers: u32,
    pub max_readers: u32,
}

/// Receives a streamed copy of a whole environment.
///
/// `total_size` is called exactly once before any `data` call.
pub trait CopySink {
    fn total_size(&mut self, size: u64) -> io::Result<()>;
    fn data(&mut self, chunk: &[u8]) -> io::Result<()>;
}

/// An open environment.
pub trait Engine: Send {
    fn read_txn(&self) -> Result<Box<dyn ReadTxn + '_>, EngineError>;

    fn write_txn(&self) -> Result<Box<dyn WriteTxn + '_>, EngineError>;

    fn info(&self) -> Result<EngineInfo, EngineError>;

    /// Streams a consistent image of the environment into `sink`.
    fn copy(&self, sink: &mut dyn CopySink) -> Result<(), EngineError>;

    /// Closes the environment, waiting for the engine to release its files.
    fn close(self: Box<Self>);
}

/// Opens environments and owns their backing storage.
pub trait Backend: Send {
    /// Opens (creating if needed) the environment.
    fn open(&self) -> Result<Box<dyn Engine>, EngineError>;

    /// Truncates the backing storage and returns a writer for a raw
    /// environment image. Only valid while no environment is open.
    fn create_image(&self) -> Result<Box<dyn Write + Send>, EngineError>;

    /// Short name for logs and INFO.
    fn name(&self) -> &'static str;
}
