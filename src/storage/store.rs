//! MDB Store
//!
//! [`MdbStore`] is the one context object the rest of the server talks to.
//! It owns the configuration, the backend, the open environment, the
//! scanner's resume cursor and the expiry controller. Components receive it
//! explicitly; there is no global state.
//!
//! The server it is embedded in is reached through the [`Host`] trait: the
//! dirty counter, the replication role and the propagation of synthetic
//! `MMDEL` commands when keys expire.

use crate::protocol::Reply;
use crate::storage::codec::{self, StoredValue};
use crate::storage::engine::{Backend, Engine, EngineError, ReadTxn};
use crate::storage::expiry::{ExpireConfig, ExpireController, ScanCursor};
use crate::storage::lmdb::LmdbBackend;
use crate::storage::memory::MemoryBackend;
use crate::storage::txn::{self, RwGuard, TxnResult};
use bytes::Bytes;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Default LMDB map size: 32 MiB minus one byte, rounded up to a page
/// multiple when the environment is opened.
pub const DEFAULT_MAP_SIZE: usize = 32 * 1024 * 1024 - 1;

/// Default reader slots, matching the host's default client limit.
pub const DEFAULT_MAX_READERS: u32 = 10_000;

/// Identifier written in front of the MDB section of the persistence file.
pub const DEFAULT_DBID: u64 = 16381;

/// Name of the command used to propagate expirations.
pub const MMDEL: &str = "MMDEL";

/// Which engine backs the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Lmdb,
    Memory,
}

/// Configuration of the MDB layer.
#[derive(Debug, Clone)]
pub struct MdbConfig {
    pub enabled: bool,
    pub map_size: usize,
    pub max_readers: u32,
    pub dbid: u64,
    /// Let a replica expire keys on its own instead of waiting for MMDEL
    /// from its master.
    pub replica_expire: bool,
    pub backend: BackendKind,
    pub expire: ExpireConfig,
}

impl Default for MdbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            dbid: DEFAULT_DBID,
            replica_expire: false,
            backend: BackendKind::Lmdb,
            expire: ExpireConfig::default(),
        }
    }
}

impl MdbConfig {
    /// Builds the backend selected by this configuration, rooted at `dir`.
    pub fn backend(&self, dir: &Path) -> Box<dyn Backend> {
        match self.backend {
            BackendKind::Lmdb => Box::new(LmdbBackend::new(
                dir.join("mdb"),
                self.map_size,
                self.max_readers,
            )),
            BackendKind::Memory => Box::new(MemoryBackend::new()),
        }
    }
}

/// What the layer needs from the server it runs in.
pub trait Host {
    /// True when this instance follows a master.
    fn is_replica(&self) -> bool;

    /// Records `changes` modifications for the persistence scheduler.
    fn add_dirty(&mut self, changes: u64);

    /// Feeds a command to the replication and append-only streams.
    fn propagate(&mut self, argv: Vec<Bytes>);
}

/// Result of looking a key up with expiration taken into account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    /// Present on disk but past its expiration; treated as missing.
    Expired,
    Live(StoredValue),
}

impl Lookup {
    /// Classifies a raw record read from the engine.
    pub fn classify(raw: Option<&[u8]>, shallow: bool, now_ms: i64) -> Self {
        match raw {
            None => Lookup::Missing,
            Some(raw) => {
                let value = codec::decode(raw, shallow);
                if value.is_expired(now_ms) {
                    Lookup::Expired
                } else {
                    Lookup::Live(value)
                }
            }
        }
    }

    pub fn live(self) -> Option<StoredValue> {
        match self {
            Lookup::Live(value) => Some(value),
            _ => None,
        }
    }
}

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current unix time in microseconds.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// The MDB layer's runtime context.
pub struct MdbStore {
    config: MdbConfig,
    backend: Box<dyn Backend>,
    env: Option<Box<dyn Engine>>,
    pub(crate) scan: ScanCursor,
    pub(crate) controller: ExpireController,
}

impl MdbStore {
    /// Creates the store and, if the layer is enabled, opens the environment.
    pub fn open(config: MdbConfig, backend: Box<dyn Backend>) -> Result<Self, EngineError> {
        let controller = ExpireController::new(config.expire.clone());
        let mut store = Self {
            config,
            backend,
            env: None,
            scan: ScanCursor::default(),
            controller,
        };
        if store.config.enabled {
            store.reopen_env()?;
        } else {
            info!("MDB layer disabled");
        }
        Ok(store)
    }

    pub fn config(&self) -> &MdbConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// The open environment.
    pub fn engine(&self) -> Result<&dyn Engine, EngineError> {
        self.env.as_deref().ok_or(EngineError::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.env.is_some()
    }

    /// Closes the environment. Commands fail with "environment is closed"
    /// until [`MdbStore::reopen_env`] succeeds.
    pub fn close_env(&mut self) {
        if let Some(env) = self.env.take() {
            env.close();
            debug!(backend = self.backend.name(), "MDB environment released");
        }
    }

    /// Opens the environment again, e.g. after a restore replaced its files.
    pub fn reopen_env(&mut self) -> Result<(), EngineError> {
        self.close_env();
        self.env = Some(self.backend.open()?);
        self.scan = ScanCursor::default();
        Ok(())
    }

    /// Runs a read-only command body. See [`txn::with_read_only`].
    pub fn read<T, F>(&self, cmd: &str, reply: &mut Reply, op: F) -> Option<T>
    where
        F: FnOnce(&dyn ReadTxn, &mut Reply) -> TxnResult<T>,
    {
        match self.engine() {
            Ok(engine) => txn::with_read_only(engine, cmd, reply, op),
            Err(err) => {
                txn::report_engine_error(cmd, reply, &err);
                None
            }
        }
    }

    /// Runs a read-write command body. See [`txn::with_read_write`].
    pub fn write<T, F>(&self, cmd: &str, reply: &mut Reply, op: F) -> Option<T>
    where
        F: FnOnce(&mut RwGuard<'_>, &mut Reply) -> TxnResult<T>,
    {
        match self.engine() {
            Ok(engine) => txn::with_read_write(engine, cmd, reply, op),
            Err(err) => {
                txn::report_engine_error(cmd, reply, &err);
                None
            }
        }
    }

    /// True if this instance deletes expired keys itself and propagates the
    /// deletions; a replica waits for its master unless configured otherwise.
    pub fn originates_expiries(&self, host: &dyn Host) -> bool {
        !host.is_replica() || self.config.replica_expire
    }

    /// Deletes `keys` in one read-write transaction and propagates an
    /// `MMDEL` for each key that was actually removed.
    ///
    /// Returns the number of keys deleted.
    pub fn expire_keys<K: AsRef<[u8]>>(
        &self,
        keys: &[K],
        host: &mut dyn Host,
    ) -> Result<usize, EngineError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let engine = self.engine()?;
        let mut guard = RwGuard::new(engine.write_txn()?);
        let mut deleted = Vec::with_capacity(keys.len());
        for key in keys {
            if guard.delete(key.as_ref())? {
                deleted.push(key.as_ref());
            }
        }
        guard.commit()?;

        for key in &deleted {
            host.propagate(vec![
                Bytes::from_static(MMDEL.as_bytes()),
                Bytes::copy_from_slice(key),
            ]);
        }
        Ok(deleted.len())
    }

    /// Lazily expires keys a command found past their expiration, if this
    /// instance originates expiries. Failures are logged, never replied.
    pub fn expire_lazily(&self, keys: &[Bytes], host: &mut dyn Host) {
        if keys.is_empty() || !self.originates_expiries(host) {
            return;
        }
        if let Err(err) = self.expire_keys(keys, host) {
            warn!("MDB: {} (on lazy expire)", err);
        }
    }
}

impl Drop for MdbStore {
    fn drop(&mut self) {
        self.close_env();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::{memory_store, memory_store_with, put_raw, RecordingHost};

    #[test]
    fn test_disabled_store_has_no_env() {
        let store = memory_store_with(MdbConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!store.is_open());

        let mut reply = Reply::new();
        let out: Option<()> = store.read("mmget", &mut reply, |_, _| Ok(()));
        assert_eq!(out, None);
        assert!(reply.into_single().unwrap().is_error());
    }

    #[test]
    fn test_lookup_classify() {
        let live = codec::encode(b"v", Some(2_000));
        let now = 1_000;
        assert_eq!(Lookup::classify(None, false, now), Lookup::Missing);
        assert!(matches!(
            Lookup::classify(Some(&live), false, now),
            Lookup::Live(_)
        ));
        assert_eq!(Lookup::classify(Some(&live), true, 2_001), Lookup::Expired);
    }

    #[test]
    fn test_expire_keys_propagates_deleted_only() {
        let store = memory_store();
        put_raw(&store, "a", b"v", Some(1));
        let mut host = RecordingHost::default();

        let deleted = store.expire_keys(&[b"a".to_vec(), b"ghost".to_vec()], &mut host);
        assert_eq!(deleted.unwrap(), 1);
        assert_eq!(
            host.propagated,
            vec![vec![Bytes::from("MMDEL"), Bytes::from("a")]]
        );
    }

    #[test]
    fn test_replica_does_not_originate_expiries() {
        let store = memory_store();
        put_raw(&store, "a", b"v", Some(1));
        let mut host = RecordingHost {
            replica: true,
            ..Default::default()
        };

        store.expire_lazily(&[Bytes::from("a")], &mut host);
        assert!(host.propagated.is_empty());
        assert!(store.engine().unwrap().read_txn().unwrap().exists(b"a").unwrap());

        let store = memory_store_with(MdbConfig {
            replica_expire: true,
            ..Default::default()
        });
        put_raw(&store, "a", b"v", Some(1));
        store.expire_lazily(&[Bytes::from("a")], &mut host);
        assert_eq!(host.propagated.len(), 1);
    }

    #[test]
    fn test_reopen_resets_scan_cursor() {
        let mut store = memory_store();
        store.scan = ScanCursor::at(b"k".to_vec());
        store.reopen_env().unwrap();
        assert!(store.scan.is_at_start());
    }

    #[test]
    fn test_lmdb_backend_under_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = MdbConfig {
            map_size: 1024 * 1024,
            max_readers: 8,
            ..Default::default()
        };
        let store = MdbStore::open(config.clone(), config.backend(dir.path())).unwrap();
        put_raw(&store, "k", b"v", None);
        assert!(dir.path().join("mdb").join("data.mdb").exists());
    }
}
