//! MDB Storage Layer
//!
//! Keys managed by this layer live in an on-disk, memory-mapped,
//! transactional B+tree (LMDB) instead of the server's heap. Values are raw
//! strings with an optional absolute expiration.
//!
//! ## Architecture
//!
//! ```text
//!   commands ──> MdbStore ──read()/write()──> txn ──> Engine (LMDB | memory)
//!                   │                          │
//!                   │                        codec (record header + payload)
//!                   │
//!                   ├── expiry    scanner batches, ExpireController, cron task
//!                   └── snapshot  engine copy <──> persistence file section
//! ```
//!
//! - [`codec`]: on-disk record format
//! - [`engine`]: what the layer needs from an engine
//! - [`lmdb`] / [`memory`]: the two engines
//! - [`txn`]: read-only and read-write transaction wrappers
//! - [`store`]: the [`MdbStore`] context object and the [`Host`] seam
//! - [`expiry`]: active expiration
//! - [`snapshot`]: dump/restore through the persistence file

pub mod codec;
pub mod engine;
pub mod expiry;
pub mod lmdb;
pub mod memory;
pub mod snapshot;
pub mod store;
pub mod txn;

pub use codec::StoredValue;
pub use engine::{Backend, Engine, EngineError};
pub use expiry::{ExpireConfig, ExpireController, ExpirySweeper, ScanCursor};
pub use snapshot::SnapshotError;
pub use store::{BackendKind, Host, Lookup, MdbConfig, MdbStore};
pub use txn::{Rollback, RwGuard, TxnError, TxnResult};

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for storage tests.

    use super::codec;
    use super::memory::MemoryBackend;
    use super::store::{Host, MdbConfig, MdbStore};
    use bytes::Bytes;

    /// A host that records what the layer asks of it.
    #[derive(Debug, Default)]
    pub struct RecordingHost {
        pub replica: bool,
        pub dirty: u64,
        pub propagated: Vec<Vec<Bytes>>,
    }

    impl Host for RecordingHost {
        fn is_replica(&self) -> bool {
            self.replica
        }

        fn add_dirty(&mut self, changes: u64) {
            self.dirty += changes;
        }

        fn propagate(&mut self, argv: Vec<Bytes>) {
            self.propagated.push(argv);
        }
    }

    pub fn memory_store_with(config: MdbConfig) -> MdbStore {
        MdbStore::open(config, Box::new(MemoryBackend::new())).unwrap()
    }

    pub fn memory_store() -> MdbStore {
        memory_store_with(MdbConfig::default())
    }

    /// Writes an encoded record directly, bypassing the command layer.
    pub fn put_raw(store: &MdbStore, key: &str, payload: &[u8], expire_at: Option<i64>) {
        let engine = store.engine().unwrap();
        let mut txn = engine.write_txn().unwrap();
        txn.put(key.as_bytes(), &codec::encode(payload, expire_at))
            .unwrap();
        txn.commit().unwrap();
    }
}
