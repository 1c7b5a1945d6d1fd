//! Transaction Manager
//!
//! Every MDB command body runs inside exactly one of two wrappers:
//!
//! - [`with_read_only`] hands the body a read transaction that lives only for
//!   the duration of the call, so no read snapshot is ever held across
//!   client I/O.
//! - [`with_read_write`] hands the body an [`RwGuard`]. The body commits it
//!   explicitly before writing its success reply; on any failure, or if the
//!   body returns without committing, the guard aborts.
//!
//! Bodies return [`TxnResult`]. [`Rollback`] means "the reply is already
//! written, stop quietly". An engine error is logged, any partial output is
//! discarded and the client gets `-ERR <engine text>`.

use crate::protocol::{Reply, ReplyMark};
use crate::storage::engine::{Cursor, Engine, EngineError, ReadTxn, WriteTxn};
use thiserror::Error;
use tracing::warn;

/// Marker returned by a command body that already wrote its reply and wants
/// the transaction abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rollback;

/// Failure of a command body.
#[derive(Debug, Error)]
pub enum TxnError {
    #[error("rollback")]
    Rollback,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<Rollback> for TxnError {
    fn from(_: Rollback) -> Self {
        TxnError::Rollback
    }
}

pub type TxnResult<T = ()> = Result<T, TxnError>;

/// A read-write transaction that aborts on drop unless committed.
pub struct RwGuard<'e> {
    txn: Option<Box<dyn WriteTxn + 'e>>,
}

impl<'e> RwGuard<'e> {
    pub fn new(txn: Box<dyn WriteTxn + 'e>) -> Self {
        Self { txn: Some(txn) }
    }

    fn live(&self) -> Result<&(dyn WriteTxn + 'e), EngineError> {
        self.txn.as_deref().ok_or(EngineError::TxnResolved)
    }

    fn live_mut(&mut self) -> Result<&mut (dyn WriteTxn + 'e), EngineError> {
        match self.txn.as_deref_mut() {
            Some(txn) => Ok(txn),
            None => Err(EngineError::TxnResolved),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, EngineError> {
        self.live()?.get(key)
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool, EngineError> {
        self.live()?.exists(key)
    }

    pub fn entries(&self) -> Result<u64, EngineError> {
        self.live()?.entries()
    }

    pub fn cursor(&self) -> Result<Box<dyn Cursor<'_> + '_>, EngineError> {
        self.live()?.cursor()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.live_mut()?.put(key, value)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<bool, EngineError> {
        self.live_mut()?.delete(key)
    }

    pub fn drop_all(&mut self) -> Result<(), EngineError> {
        self.live_mut()?.drop_all()
    }

    pub fn commit(&mut self) -> Result<(), EngineError> {
        match self.txn.take() {
            Some(txn) => txn.commit(),
            None => Err(EngineError::TxnResolved),
        }
    }

    pub fn abort(&mut self) {
        if let Some(txn) = self.txn.take() {
            txn.abort();
        }
    }

    /// Returns true until the transaction is committed or aborted.
    pub fn is_open(&self) -> bool {
        self.txn.is_some()
    }
}

impl Drop for RwGuard<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Runs `op` against a fresh read transaction.
///
/// Returns the body's value, or `None` if it rolled back or failed (in which
/// case the reply already says so).
pub fn with_read_only<T, F>(engine: &dyn Engine, cmd: &str, reply: &mut Reply, op: F) -> Option<T>
where
    F: FnOnce(&dyn ReadTxn, &mut Reply) -> TxnResult<T>,
{
    let mark = reply.mark();
    let result = match engine.read_txn() {
        Ok(txn) => op(txn.as_ref(), reply),
        Err(err) => Err(err.into()),
    };
    settle(cmd, reply, mark, result)
}

/// Runs `op` inside a read-write transaction.
///
/// The body is expected to commit before writing a success reply. Whatever
/// it leaves unresolved is aborted before an error is reported.
pub fn with_read_write<T, F>(engine: &dyn Engine, cmd: &str, reply: &mut Reply, op: F) -> Option<T>
where
    F: FnOnce(&mut RwGuard<'_>, &mut Reply) -> TxnResult<T>,
{
    let mark = reply.mark();
    let result = match engine.write_txn() {
        Ok(txn) => {
            let mut guard = RwGuard::new(txn);
            let result = op(&mut guard, reply);
            guard.abort();
            result
        }
        Err(err) => Err(err.into()),
    };
    settle(cmd, reply, mark, result)
}

/// Reports a failure that happened before any transaction could be opened.
pub fn report_engine_error(cmd: &str, reply: &mut Reply, err: &EngineError) {
    warn!("MDB: {} (on '{}')", err, cmd);
    reply.error(format!("ERR {}", err));
}

fn settle<T>(cmd: &str, reply: &mut Reply, mark: ReplyMark, result: TxnResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(TxnError::Rollback) => None,
        Err(TxnError::Engine(err)) => {
            reply.truncate(mark);
            report_engine_error(cmd, reply, &err);
            None
        }
    }
}
