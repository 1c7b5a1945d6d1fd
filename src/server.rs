//! Server State
//!
//! Everything a command can reach lives in one [`ServerState`] behind a
//! mutex: the configuration, the [`MdbStore`] and the host-side bookkeeping
//! the MDB layer reports into through the [`Host`] trait.
//!
//! The host side is deliberately thin:
//!
//! - a dirty counter (changes since the last successful SAVE),
//! - the replication role,
//! - a bounded [`ReplicationBacklog`] of propagated commands, standing in for
//!   the replication and append-only streams,
//! - save/load of the persistence file (`<dir>/<dbfilename>`). Loading runs
//!   while clients are connected; they are answered with LOADING until it
//!   is done.

use crate::config::Config;
use crate::connection::ConnectionStats;
use crate::rdb::{RdbError, RdbReader, RdbWriter, OPCODE_EOF, OPCODE_SELECT_STORE};
use crate::storage::snapshot::{self, SnapshotError};
use crate::storage::store::{now_us, Host, MdbStore};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncRead;
use tracing::{debug, info, trace, warn};

/// Commands kept in the replication backlog.
pub const DEFAULT_BACKLOG_LEN: usize = 1024;

pub type SharedState = Arc<Mutex<ServerState>>;

/// Wraps the state for sharing between connections and the cron.
pub fn shared(state: ServerState) -> SharedState {
    Arc::new(Mutex::new(state))
}

/// Locks the state. A panic in another holder does not make the state
/// unusable; every mutation it guards is committed or not as a whole.
pub fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Replication role of this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Replica => "slave",
        }
    }
}

/// The most recent propagated commands.
#[derive(Debug)]
pub struct ReplicationBacklog {
    entries: VecDeque<Vec<Bytes>>,
    capacity: usize,
    /// Commands propagated since startup.
    offset: u64,
}

impl ReplicationBacklog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_BACKLOG_LEN)),
            capacity: capacity.max(1),
            offset: 0,
        }
    }

    pub fn push(&mut self, argv: Vec<Bytes>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(argv);
        self.offset += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vec<Bytes>> {
        self.entries.iter()
    }
}

/// Host bookkeeping the MDB layer reports into.
#[derive(Debug)]
pub struct HostState {
    role: Role,
    dirty: u64,
    backlog: ReplicationBacklog,
    /// Unix seconds of the last successful save.
    last_save: Option<u64>,
    last_save_ok: bool,
}

impl HostState {
    pub fn new(replica: bool, backlog_len: usize) -> Self {
        Self {
            role: if replica { Role::Replica } else { Role::Master },
            dirty: 0,
            backlog: ReplicationBacklog::new(backlog_len),
            last_save: None,
            last_save_ok: true,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_replica(&mut self, replica: bool) {
        self.role = if replica { Role::Replica } else { Role::Master };
    }

    /// Changes since the last successful save.
    pub fn dirty(&self) -> u64 {
        self.dirty
    }

    pub fn backlog(&self) -> &ReplicationBacklog {
        &self.backlog
    }

    pub fn last_save(&self) -> Option<u64> {
        self.last_save
    }

    pub fn last_save_ok(&self) -> bool {
        self.last_save_ok
    }

    fn record_save(&mut self, ok: bool) {
        self.last_save_ok = ok;
        if ok {
            self.dirty = 0;
            self.last_save = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs());
        }
    }
}

impl Host for HostState {
    fn is_replica(&self) -> bool {
        self.role == Role::Replica
    }

    fn add_dirty(&mut self, changes: u64) {
        self.dirty += changes;
    }

    fn propagate(&mut self, argv: Vec<Bytes>) {
        trace!(
            command = %String::from_utf8_lossy(argv.first().map(|b| &b[..]).unwrap_or_default()),
            offset = self.backlog.offset(),
            "Propagating command"
        );
        self.backlog.push(argv);
    }
}

/// Everything shared by connections and the cron.
pub struct ServerState {
    pub config: Config,
    pub store: MdbStore,
    pub host: HostState,
    pub stats: Arc<ConnectionStats>,
    pub start_time: Instant,
    /// The persistence file is being loaded; only commands marked safe for
    /// it are served.
    pub loading: bool,
}

impl ServerState {
    pub fn new(config: Config, store: MdbStore, stats: Arc<ConnectionStats>) -> Self {
        let host = HostState::new(config.replica, DEFAULT_BACKLOG_LEN);
        Self {
            config,
            store,
            host,
            stats,
            start_time: Instant::now(),
            loading: false,
        }
    }

    /// One host cron tick: runs the active expiration cycle when enabled.
    /// Returns the number of keys expired.
    pub fn cron(&mut self) -> usize {
        if self.loading || !self.config.active_expire || !self.store.is_enabled() {
            return 0;
        }
        let ServerState {
            store, host, config, ..
        } = self;
        store.active_expire_cycle(host, config.hz, now_us())
    }
}

/// Writes the persistence file: to a temporary file first, then renamed
/// over `<dir>/<dbfilename>`. Returns the number of bytes written.
pub fn save_rdb(state: &mut ServerState) -> Result<u64, SnapshotError> {
    let path = state.config.rdb_path();
    let tmp = state
        .config
        .dir
        .join(format!("temp-{}.rdb", std::process::id()));

    let result = fs::create_dir_all(&state.config.dir)
        .map_err(SnapshotError::from)
        .and_then(|()| write_rdb(&state.store, state.host.is_replica(), &tmp))
        .and_then(|bytes| {
            fs::rename(&tmp, &path)?;
            Ok(bytes)
        });

    match &result {
        Ok(bytes) => {
            state.host.record_save(true);
            info!(path = %path.display(), bytes, "DB saved on disk");
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            state.host.record_save(false);
            warn!(path = %path.display(), error = %err, "Failed saving the DB");
        }
    }
    result
}

fn write_rdb(store: &MdbStore, is_replica: bool, path: &Path) -> Result<u64, SnapshotError> {
    let file = File::create(path)?;
    let mut writer = RdbWriter::new(BufWriter::new(file));
    writer.write_header()?;
    if !snapshot::save(store, is_replica, &mut writer)? {
        writer.write_eof()?;
    }

    let written = writer.written();
    let mut out = writer.into_inner();
    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(written)
}

/// Loads `<dir>/<dbfilename>` if it exists. Returns false if there was no
/// file to load.
///
/// Clients may be connected meanwhile; see [`load_rdb_from`].
pub async fn load_rdb(state: &SharedState) -> Result<bool, SnapshotError> {
    let path = lock(state).config.rdb_path();
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "No persistence file to load");
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    };

    let started = Instant::now();
    let bytes = load_rdb_from(state, tokio::io::BufReader::new(file)).await?;
    info!(
        path = %path.display(),
        bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "DB loaded from disk"
    );
    Ok(true)
}

/// Loads a persistence stream into the shared state and returns the number
/// of bytes consumed.
///
/// `loading` is set for the duration, so connected clients get a LOADING
/// error for anything that needs the keyspace. The state is locked only to
/// prepare and to complete the MDB section, never while reading.
pub async fn load_rdb_from<R: AsyncRead + Unpin>(
    state: &SharedState,
    input: R,
) -> Result<u64, SnapshotError> {
    lock(state).loading = true;
    let result = read_sections(state, RdbReader::new(input)).await;
    lock(state).loading = false;
    result
}

async fn read_sections<R: AsyncRead + Unpin>(
    state: &SharedState,
    mut reader: RdbReader<R>,
) -> Result<u64, SnapshotError> {
    reader.read_header().await?;
    loop {
        match reader.read_type().await? {
            OPCODE_EOF => break,
            OPCODE_SELECT_STORE => {
                let dbid = reader.read_len().await?;
                let mut section = {
                    let mut guard = lock(state);
                    let ServerState { store, host, .. } = &mut *guard;
                    if dbid != store.config().dbid {
                        return Err(RdbError::UnknownStore(dbid).into());
                    }
                    snapshot::begin_load(store, host.is_replica())?
                };
                // The section carries its own end marker.
                section.read(&mut reader).await?;
                snapshot::finish_load(&mut lock(state).store, section)?;
                break;
            }
            other => return Err(RdbError::UnexpectedOpcode(other).into()),
        }
    }
    Ok(reader.position())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::store::MdbConfig;
    use crate::storage::testing::put_raw;

    fn state_in(dir: &Path, replica: bool) -> ServerState {
        let config = Config {
            dir: dir.to_path_buf(),
            replica,
            ..Config::default()
        };
        let store = MdbStore::open(MdbConfig::default(), Box::new(MemoryBackend::new())).unwrap();
        ServerState::new(config, store, Arc::new(ConnectionStats::new()))
    }

    fn raw(state: &ServerState, key: &[u8]) -> Option<Vec<u8>> {
        let engine = state.store.engine().unwrap();
        let txn = engine.read_txn().unwrap();
        let value = txn.get(key).unwrap().map(<[u8]>::to_vec);
        value
    }

    #[test]
    fn test_backlog_is_bounded() {
        let mut backlog = ReplicationBacklog::new(2);
        for key in ["a", "b", "c"] {
            backlog.push(vec![Bytes::from("MMDEL"), Bytes::from(key)]);
        }
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog.offset(), 3);
        assert_eq!(backlog.iter().next().unwrap()[1], Bytes::from("b"));
    }

    #[test]
    fn test_host_counts_dirty_and_propagates() {
        let mut host = HostState::new(false, 8);
        host.add_dirty(3);
        host.propagate(vec![Bytes::from("MMDEL"), Bytes::from("k")]);
        assert_eq!(host.dirty(), 3);
        assert_eq!(host.backlog().len(), 1);
        assert!(!host.is_replica());

        host.set_replica(true);
        assert_eq!(host.role().as_str(), "slave");
    }

    #[tokio::test]
    async fn test_save_then_load_on_replica() {
        let dir = tempfile::tempdir().unwrap();

        let mut master = state_in(dir.path(), false);
        put_raw(&master.store, "a", b"1", None);
        put_raw(&master.store, "b", b"2", Some(1_000));
        master.host.add_dirty(5);

        let bytes = save_rdb(&mut master).unwrap();
        assert!(bytes > 0);
        assert_eq!(master.host.dirty(), 0);
        assert!(master.host.last_save().is_some());
        assert!(dir.path().join("dump.rdb").exists());

        let replica = shared(state_in(dir.path(), true));
        assert!(load_rdb(&replica).await.unwrap());
        let replica = lock(&replica);
        assert!(!replica.loading);
        assert_eq!(raw(&replica, b"a"), Some(codec::encode(b"1", None)));
        assert_eq!(raw(&replica, b"b"), raw(&master, b"b"));
    }

    #[tokio::test]
    async fn test_master_keeps_its_environment_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut master = state_in(dir.path(), false);
        put_raw(&master.store, "a", b"1", None);
        save_rdb(&mut master).unwrap();

        let other = state_in(dir.path(), false);
        put_raw(&other.store, "mine", b"x", None);
        let other = shared(other);
        assert!(load_rdb(&other).await.unwrap());
        let other = lock(&other);
        assert_eq!(raw(&other, b"a"), None);
        assert!(raw(&other, b"mine").is_some());
    }

    #[tokio::test]
    async fn test_replica_saves_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut replica = state_in(dir.path(), true);
        put_raw(&replica.store, "a", b"1", None);
        save_rdb(&mut replica).unwrap();

        let contents = fs::read(dir.path().join("dump.rdb")).unwrap();
        assert_eq!(contents, b"FLASHRDB0001\xFF");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = shared(state_in(dir.path(), true));
        assert!(!load_rdb(&state).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dump.rdb"), b"FLASHRDB0001\x01").unwrap();
        let state = shared(state_in(dir.path(), true));
        assert!(matches!(
            load_rdb(&state).await,
            Err(SnapshotError::Rdb(RdbError::UnexpectedOpcode(0x01)))
        ));
        assert!(!lock(&state).loading);
    }

    #[tokio::test]
    async fn test_clients_are_served_while_loading() {
        use crate::commands::CommandHandler;
        use crate::connection::handle_connection;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};
        use tokio::time::{timeout, Duration};

        let dir = tempfile::tempdir().unwrap();
        let state = shared(state_in(dir.path(), false));
        put_raw(&lock(&state).store, "k", b"v", None);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = CommandHandler::new(Arc::clone(&state));
        let stats = Arc::new(ConnectionStats::new());
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, peer, handler.clone(), Arc::clone(&stats)));
            }
        });

        let image = vec![0u8; 1024 * 1024];
        let mut head = RdbWriter::new(Vec::new());
        head.write_header().unwrap();
        head.write_type(OPCODE_SELECT_STORE).unwrap();
        head.write_len(MdbConfig::default().dbid).unwrap();
        head.write_raw(&(image.len() as u64).to_be_bytes()).unwrap();
        let head = head.into_inner();

        let (mut feed, input) = tokio::io::duplex(64 * 1024);
        let loader = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { load_rdb_from(&state, input).await })
        };
        feed.write_all(&head).await.unwrap();
        feed.write_all(&image[..image.len() / 2]).await.unwrap();
        assert!(lock(&state).loading);

        async fn roundtrip(client: &mut TcpStream, request: &[u8], expected: &[u8]) {
            client.write_all(request).await.unwrap();
            let mut buf = vec![0u8; expected.len()];
            let mut total = 0;
            while total < expected.len() {
                match timeout(Duration::from_secs(2), client.read(&mut buf[total..])).await {
                    Ok(Ok(n)) if n > 0 => total += n,
                    _ => break,
                }
            }
            assert_eq!(&buf[..total], expected);
        }

        // The section is only half written, so the load cannot be over yet
        let mut client = TcpStream::connect(addr).await.unwrap();
        let loading = format!("-{}\r\n", crate::commands::handler::LOADING);
        roundtrip(&mut client, b"PING\r\n", b"+PONG\r\n").await;
        roundtrip(&mut client, b"MMGET k\r\n", loading.as_bytes()).await;
        assert!(lock(&state).loading);
        assert_eq!(lock(&state).cron(), 0);

        feed.write_all(&image[image.len() / 2..]).await.unwrap();
        feed.write_all(&[OPCODE_EOF]).await.unwrap();
        let consumed = loader.await.unwrap().unwrap();
        assert_eq!(consumed, head.len() as u64 + image.len() as u64 + 1);
        assert!(!lock(&state).loading);

        roundtrip(&mut client, b"MMGET k\r\n", b"$1\r\nv\r\n").await;
    }

    #[test]
    fn test_cron_respects_active_expire() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_in(dir.path(), false);
        put_raw(&state.store, "old", b"v", Some(1));

        state.config.active_expire = false;
        assert_eq!(state.cron(), 0);

        state.config.active_expire = true;
        assert_eq!(state.cron(), 1);
        assert_eq!(raw(&state, b"old"), None);
        assert_eq!(state.host.backlog().len(), 1);
    }
}
