//! LMDB Backend
//!
//! Production engine: a single unnamed LMDB database opened through `heed`
//! with raw byte keys and values. Records are already encoded by the codec,
//! so no heed codecs beyond `Bytes` are involved.

use crate::storage::engine::{
    Backend, CopySink, Cursor, CursorOp, Engine, EngineError, EngineInfo, Entry, ReadTxn,
    WriteTxn,
};
use heed::types::Bytes as RawBytes;
use heed::{CompactionOption, Database, Env, EnvOpenOptions, RoRange, RoTxn, RwTxn};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::ops::Bound;
use std::path::PathBuf;
use tracing::{debug, info};

type RawDatabase = Database<RawBytes, RawBytes>;

/// Name of the LMDB data file inside the environment directory.
pub const DATA_FILE: &str = "data.mdb";

/// Name of the LMDB lock file inside the environment directory.
pub const LOCK_FILE: &str = "lock.mdb";

/// Map sizes are rounded up to this so they are a multiple of any page size.
const MAP_SIZE_ALIGN: usize = 64 * 1024;

/// Read buffer used when streaming an environment copy.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Opens LMDB environments in a directory.
#[derive(Debug, Clone)]
pub struct LmdbBackend {
    dir: PathBuf,
    map_size: usize,
    max_readers: u32,
}

impl LmdbBackend {
    pub fn new(dir: impl Into<PathBuf>, map_size: usize, max_readers: u32) -> Self {
        Self {
            dir: dir.into(),
            map_size: map_size.max(1).div_ceil(MAP_SIZE_ALIGN) * MAP_SIZE_ALIGN,
            max_readers: max_readers.max(1),
        }
    }
}

impl Backend for LmdbBackend {
    fn open(&self) -> Result<Box<dyn Engine>, EngineError> {
        fs::create_dir_all(&self.dir)?;

        // SAFETY: the environment directory is owned by this process; nothing
        // else maps or truncates data.mdb while it is open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(self.map_size)
                .max_readers(self.max_readers)
                .max_dbs(1)
                .open(&self.dir)?
        };

        let mut wtxn = env.write_txn()?;
        let db: RawDatabase = env.create_database(&mut wtxn, None)?;
        wtxn.commit()?;

        info!(
            dir = %self.dir.display(),
            map_size = self.map_size,
            max_readers = self.max_readers,
            "MDB environment opened"
        );

        Ok(Box::new(LmdbEngine {
            env,
            db,
            dir: self.dir.clone(),
        }))
    }

    fn create_image(&self) -> Result<Box<dyn Write + Send>, EngineError> {
        fs::create_dir_all(&self.dir)?;
        match fs::remove_file(self.dir.join(LOCK_FILE)) {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        let file = File::create(self.dir.join(DATA_FILE))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn name(&self) -> &'static str {
        "lmdb"
    }
}

/// An open LMDB environment and its main database.
pub struct LmdbEngine {
    env: Env,
    db: RawDatabase,
    dir: PathBuf,
}

impl Engine for LmdbEngine {
    fn read_txn(&self) -> Result<Box<dyn ReadTxn + '_>, EngineError> {
        Ok(Box::new(LmdbRead {
            txn: self.env.read_txn()?,
            db: self.db,
        }))
    }

    fn write_txn(&self) -> Result<Box<dyn WriteTxn + '_>, EngineError> {
        Ok(Box::new(LmdbWrite {
            txn: self.env.write_txn()?,
            db: self.db,
        }))
    }

    fn info(&self) -> Result<EngineInfo, EngineError> {
        let info = self.env.info();
        Ok(EngineInfo {
            map_size: info.map_size,
            readers: info.number_of_readers,
            max_readers: info.maximum_number_of_readers,
        })
    }

    fn copy(&self, sink: &mut dyn CopySink) -> Result<(), EngineError> {
        // LMDB copies into a file; stage it next to the live environment so
        // the copy stays on the same filesystem.
        let staging = tempfile::Builder::new()
            .prefix("mdb-copy")
            .tempdir_in(&self.dir)?;
        let path = staging.path().join(DATA_FILE);
        drop(self.env.copy_to_file(&path, CompactionOption::Enabled)?);

        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();
        sink.total_size(size)?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sink.data(&buf[..n])?;
        }

        debug!(bytes = size, "MDB environment copy streamed");
        Ok(())
    }

    fn close(self: Box<Self>) {
        let LmdbEngine { env, dir, .. } = *self;
        env.prepare_for_closing().wait();
        info!(dir = %dir.display(), "MDB environment closed");
    }
}

struct LmdbRead<'e> {
    txn: RoTxn<'e>,
    db: RawDatabase,
}

impl ReadTxn for LmdbRead<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, EngineError> {
        Ok(self.db.get(&self.txn, key)?)
    }

    fn cursor(&self) -> Result<Box<dyn Cursor<'_> + '_>, EngineError> {
        Ok(Box::new(LmdbCursor::new(&self.txn, self.db)))
    }

    fn entries(&self) -> Result<u64, EngineError> {
        Ok(self.db.len(&self.txn)?)
    }
}

struct LmdbWrite<'e> {
    txn: RwTxn<'e>,
    db: RawDatabase,
}

impl ReadTxn for LmdbWrite<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, EngineError> {
        Ok(self.db.get(&self.txn, key)?)
    }

    fn cursor(&self) -> Result<Box<dyn Cursor<'_> + '_>, EngineError> {
        Ok(Box::new(LmdbCursor::new(&self.txn, self.db)))
    }

    fn entries(&self) -> Result<u64, EngineError> {
        Ok(self.db.len(&self.txn)?)
    }
}

impl WriteTxn for LmdbWrite<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        Ok(self.db.put(&mut self.txn, key, value)?)
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool, EngineError> {
        Ok(self.db.delete(&mut self.txn, key)?)
    }

    fn drop_all(&mut self) -> Result<(), EngineError> {
        Ok(self.db.clear(&mut self.txn)?)
    }

    fn commit(self: Box<Self>) -> Result<(), EngineError> {
        Ok(self.txn.commit()?)
    }

    fn abort(self: Box<Self>) {
        self.txn.abort();
    }
}

/// Cursor emulated on top of heed range iterators: every positioning
/// operator opens a new range starting at the target key, `Next` advances it.
struct LmdbCursor<'t, 'e> {
    txn: &'t RoTxn<'e>,
    db: RawDatabase,
    range: Option<RoRange<'t, RawBytes, RawBytes>>,
}

impl<'t, 'e> LmdbCursor<'t, 'e> {
    fn new(txn: &'t RoTxn<'e>, db: RawDatabase) -> Self {
        Self {
            txn,
            db,
            range: None,
        }
    }

    fn position(&mut self, start: Bound<&[u8]>) -> Result<Option<Entry<'t>>, EngineError> {
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (start, Bound::Unbounded);
        let mut range = self.db.range(self.txn, &bounds)?;
        let entry = range.next().transpose()?;
        self.range = Some(range);
        Ok(entry)
    }
}

impl<'t, 'e> Cursor<'t> for LmdbCursor<'t, 'e> {
    fn get(&mut self, op: CursorOp<'_>) -> Result<Option<Entry<'t>>, EngineError> {
        match op {
            CursorOp::First => self.position(Bound::Unbounded),
            CursorOp::SetRange(key) => self.position(Bound::Included(key)),
            CursorOp::Set(key) => match self.position(Bound::Included(key))? {
                Some(entry) if entry.0 == key => Ok(Some(entry)),
                _ => {
                    self.range = None;
                    Ok(None)
                }
            },
            CursorOp::Next => match self.range.as_mut() {
                Some(range) => Ok(range.next().transpose()?),
                None => self.position(Bound::Unbounded),
            },
        }
    }
}
