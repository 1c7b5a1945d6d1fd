//! In-Memory Backend
//!
//! An ordered `BTreeMap` behind the same engine traits as LMDB. Used by the
//! unit tests and selectable with `--backend memory` when durability is not
//! wanted.
//!
//! Read transactions hold an `Arc` snapshot of the map, so they never block
//! writers. A write transaction records its changes in an overlay on top of
//! the snapshot it started from and folds them into the shared map on
//! commit; the map itself is only cloned if a reader still holds it.
//! Environment images use a small framing of their own:
//!
//! ```text
//! "FKVMEM01" | count: u64 BE | (key_len: u32 BE, key, val_len: u32 BE, val)*
//! ```

use crate::storage::engine::{
    Backend, CopySink, Cursor, CursorOp, Engine, EngineError, EngineInfo, Entry, ReadTxn,
    WriteTxn,
};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// Pending writes of one transaction; `None` marks a deletion.
type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

const IMAGE_MAGIC: &[u8; 8] = b"FKVMEM01";

/// Chunk size used when streaming a copy.
const COPY_CHUNK_SIZE: usize = 16 * 1024;

/// Nominal figures reported through `info()`.
const MEMORY_MAP_SIZE: usize = usize::MAX;
const MEMORY_MAX_READERS: u32 = u32::MAX;

#[derive(Default)]
struct Shared {
    data: Arc<Map>,
    /// Pending image written by `create_image`, applied on the next `open`.
    image: Option<Vec<u8>>,
    readers: u32,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backend whose "files" live in process memory. Clones share storage.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn open(&self) -> Result<Box<dyn Engine>, EngineError> {
        let mut shared = lock(&self.shared);
        if let Some(image) = shared.image.take() {
            shared.data = Arc::new(decode_image(&image)?);
        }
        Ok(Box::new(MemoryEngine {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn create_image(&self) -> Result<Box<dyn Write + Send>, EngineError> {
        let mut shared = lock(&self.shared);
        shared.data = Arc::new(Map::new());
        shared.image = Some(Vec::new());
        Ok(Box::new(ImageWriter {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct ImageWriter {
    shared: Arc<Mutex<Shared>>,
}

impl Write for ImageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.shared)
            .image
            .get_or_insert_with(Vec::new)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An open in-memory environment.
pub struct MemoryEngine {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryEngine {
    fn snapshot(&self) -> Arc<Map> {
        Arc::clone(&lock(&self.shared).data)
    }
}

impl Engine for MemoryEngine {
    fn read_txn(&self) -> Result<Box<dyn ReadTxn + '_>, EngineError> {
        let snapshot = {
            let mut shared = lock(&self.shared);
            shared.readers += 1;
            Arc::clone(&shared.data)
        };
        Ok(Box::new(MemoryRead {
            snapshot,
            shared: &self.shared,
        }))
    }

    fn write_txn(&self) -> Result<Box<dyn WriteTxn + '_>, EngineError> {
        Ok(Box::new(MemoryWrite {
            base: self.snapshot(),
            cleared: false,
            changes: Overlay::new(),
            shared: &self.shared,
        }))
    }

    fn info(&self) -> Result<EngineInfo, EngineError> {
        Ok(EngineInfo {
            map_size: MEMORY_MAP_SIZE,
            readers: lock(&self.shared).readers,
            max_readers: MEMORY_MAX_READERS,
        })
    }

    fn copy(&self, sink: &mut dyn CopySink) -> Result<(), EngineError> {
        let image = encode_image(&self.snapshot());
        sink.total_size(image.len() as u64)?;
        for chunk in image.chunks(COPY_CHUNK_SIZE) {
            sink.data(chunk)?;
        }
        Ok(())
    }

    fn close(self: Box<Self>) {}
}

struct MemoryRead<'e> {
    snapshot: Arc<Map>,
    shared: &'e Mutex<Shared>,
}

impl Drop for MemoryRead<'_> {
    fn drop(&mut self) {
        let mut shared = lock(self.shared);
        shared.readers = shared.readers.saturating_sub(1);
    }
}

impl ReadTxn for MemoryRead<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, EngineError> {
        Ok(self.snapshot.get(key).map(Vec::as_slice))
    }

    fn cursor(&self) -> Result<Box<dyn Cursor<'_> + '_>, EngineError> {
        Ok(Box::new(MemoryCursor::new(Some(&*self.snapshot), None)))
    }

    fn entries(&self) -> Result<u64, EngineError> {
        Ok(self.snapshot.len() as u64)
    }
}

struct MemoryWrite<'e> {
    base: Arc<Map>,
    /// `drop_all` was called; `base` no longer shows through.
    cleared: bool,
    changes: Overlay,
    shared: &'e Mutex<Shared>,
}

impl MemoryWrite<'_> {
    fn visible_base(&self) -> Option<&Map> {
        (!self.cleared).then_some(&*self.base)
    }
}

impl ReadTxn for MemoryWrite<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, EngineError> {
        let value = match self.changes.get(key) {
            Some(change) => change.as_deref(),
            None => self
                .visible_base()
                .and_then(|base| base.get(key))
                .map(Vec::as_slice),
        };
        Ok(value)
    }

    fn cursor(&self) -> Result<Box<dyn Cursor<'_> + '_>, EngineError> {
        Ok(Box::new(MemoryCursor::new(
            self.visible_base(),
            Some(&self.changes),
        )))
    }

    fn entries(&self) -> Result<u64, EngineError> {
        let base = self.visible_base();
        let mut count = base.map_or(0, |b| b.len() as i64);
        for (key, change) in &self.changes {
            let in_base = base.is_some_and(|b| b.contains_key(key));
            match (in_base, change.is_some()) {
                (false, true) => count += 1,
                (true, false) => count -= 1,
                _ => {}
            }
        }
        Ok(count.max(0) as u64)
    }
}

impl WriteTxn for MemoryWrite<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        self.changes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<bool, EngineError> {
        let existed = self.get(key)?.is_some();
        if existed {
            self.changes.insert(key.to_vec(), None);
        }
        Ok(existed)
    }

    fn drop_all(&mut self) -> Result<(), EngineError> {
        self.cleared = true;
        self.changes.clear();
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), EngineError> {
        let MemoryWrite {
            base,
            cleared,
            changes,
            shared,
        } = *self;
        // Our own reference must go before make_mut decides whether to clone.
        drop(base);

        let mut shared = lock(shared);
        if cleared {
            shared.data = Arc::new(Map::new());
        }
        let data = Arc::make_mut(&mut shared.data);
        for (key, change) in changes {
            match change {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

/// Where a [`MemoryCursor`] stands.
#[derive(Clone, Copy)]
enum Position<'t> {
    Unset,
    At(&'t [u8]),
    End,
}

/// Walks a committed map, optionally with a transaction's overlay merged on
/// top of it.
struct MemoryCursor<'t> {
    base: Option<&'t Map>,
    overlay: Option<&'t Overlay>,
    position: Position<'t>,
}

impl<'t> MemoryCursor<'t> {
    fn new(base: Option<&'t Map>, overlay: Option<&'t Overlay>) -> Self {
        Self {
            base,
            overlay,
            position: Position::Unset,
        }
    }

    /// First visible entry at or after `start`.
    fn seek(&self, start: Bound<&[u8]>) -> Option<Entry<'t>> {
        let mut next = self.first_from(start)?;
        loop {
            match next {
                (key, Some(value)) => return Some((key, value)),
                (key, None) => next = self.first_from(Bound::Excluded(key))?,
            }
        }
    }

    /// First key at or after `start` in either map, with its value or
    /// `None` for an overlay deletion. Overlay entries shadow the base.
    fn first_from(&self, start: Bound<&[u8]>) -> Option<(&'t [u8], Option<&'t [u8]>)> {
        let range = (start, Bound::<&[u8]>::Unbounded);
        let committed = self.base.and_then(|m| m.range::<[u8], _>(range).next());
        let pending = self.overlay.and_then(|m| m.range::<[u8], _>(range).next());

        match (committed, pending) {
            (None, None) => None,
            (Some((bk, bv)), None) => Some((bk.as_slice(), Some(bv.as_slice()))),
            (Some((bk, bv)), Some((ok, _))) if bk < ok => {
                Some((bk.as_slice(), Some(bv.as_slice())))
            }
            (_, Some((ok, change))) => Some((ok.as_slice(), change.as_deref())),
        }
    }

    fn move_to(&mut self, start: Bound<&[u8]>) -> Option<Entry<'t>> {
        let entry = self.seek(start);
        self.position = entry.map_or(Position::End, |(k, _)| Position::At(k));
        entry
    }
}

impl<'t> Cursor<'t> for MemoryCursor<'t> {
    fn get(&mut self, op: CursorOp<'_>) -> Result<Option<Entry<'t>>, EngineError> {
        let position = self.position;
        let entry = match op {
            CursorOp::First => self.move_to(Bound::Unbounded),
            CursorOp::SetRange(key) => self.move_to(Bound::Included(key)),
            CursorOp::Set(key) => match self.seek(Bound::Included(key)) {
                Some(entry) if entry.0 == key => {
                    self.position = Position::At(entry.0);
                    Some(entry)
                }
                _ => {
                    self.position = Position::Unset;
                    None
                }
            },
            CursorOp::Next => match position {
                Position::Unset => self.move_to(Bound::Unbounded),
                Position::At(key) => self.move_to(Bound::Excluded(key)),
                Position::End => None,
            },
        };
        Ok(entry)
    }
}

fn encode_image(map: &Map) -> Vec<u8> {
    let body: usize = map.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
    let mut out = Vec::with_capacity(IMAGE_MAGIC.len() + 8 + body);
    out.extend_from_slice(IMAGE_MAGIC);
    out.extend_from_slice(&(map.len() as u64).to_be_bytes());
    for (key, value) in map {
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}

fn decode_image(mut buf: &[u8]) -> Result<Map, EngineError> {
    fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], EngineError> {
        if buf.len() < n {
            return Err(EngineError::CorruptImage(format!(
                "wanted {} more byte(s), {} left",
                n,
                buf.len()
            )));
        }
        let (head, tail) = buf.split_at(n);
        *buf = tail;
        Ok(head)
    }

    fn take_len(buf: &mut &[u8]) -> Result<usize, EngineError> {
        let raw = take(buf, 4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize)
    }

    let mut map = Map::new();
    if buf.is_empty() {
        return Ok(map);
    }

    if take(&mut buf, IMAGE_MAGIC.len())? != IMAGE_MAGIC {
        return Err(EngineError::CorruptImage("bad magic".to_string()));
    }

    let mut count = [0u8; 8];
    count.copy_from_slice(take(&mut buf, 8)?);
    for _ in 0..u64::from_be_bytes(count) {
        let key_len = take_len(&mut buf)?;
        let key = take(&mut buf, key_len)?.to_vec();
        let val_len = take_len(&mut buf)?;
        let value = take(&mut buf, val_len)?.to_vec();
        map.insert(key, value);
    }

    if !buf.is_empty() {
        return Err(EngineError::CorruptImage(format!(
            "{} trailing byte(s)",
            buf.len()
        )));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(pairs: &[(&str, &str)]) -> Box<dyn Engine> {
        let engine = MemoryBackend::new().open().unwrap();
        let mut txn = engine.write_txn().unwrap();
        for (k, v) in pairs {
            txn.put(k.as_bytes(), v.as_bytes()).unwrap();
        }
        txn.commit().unwrap();
        engine
    }

    #[test]
    fn test_read_snapshot_isolation() {
        let engine = engine_with(&[("a", "1")]);

        let reader = engine.read_txn().unwrap();
        let mut writer = engine.write_txn().unwrap();
        writer.put(b"b", b"2").unwrap();
        assert!(writer.exists(b"b").unwrap());
        writer.commit().unwrap();

        // The old snapshot does not see the commit
        assert!(!reader.exists(b"b").unwrap());
        drop(reader);
        assert!(engine.read_txn().unwrap().exists(b"b").unwrap());
    }

    #[test]
    fn test_abort_discards() {
        let engine = engine_with(&[]);
        let mut txn = engine.write_txn().unwrap();
        txn.put(b"k", b"v").unwrap();
        txn.abort();
        assert_eq!(engine.read_txn().unwrap().entries().unwrap(), 0);
    }

    #[test]
    fn test_cursor_operators() {
        let engine = engine_with(&[("a", "1"), ("c", "3"), ("e", "5")]);
        let txn = engine.read_txn().unwrap();
        let mut cursor = txn.cursor().unwrap();

        assert_eq!(cursor.get(CursorOp::Next).unwrap().unwrap().0, b"a");
        assert_eq!(cursor.get(CursorOp::SetRange(b"d")).unwrap().unwrap().0, b"e");
        assert_eq!(cursor.get(CursorOp::Next).unwrap(), None);
        assert_eq!(cursor.get(CursorOp::Set(b"d")).unwrap(), None);
        assert_eq!(
            cursor.get(CursorOp::Set(b"c")).unwrap(),
            Some((&b"c"[..], &b"3"[..]))
        );
        assert_eq!(cursor.get(CursorOp::First).unwrap().unwrap().0, b"a");
    }

    #[test]
    fn test_write_txn_sees_its_own_changes() {
        let engine = engine_with(&[("a", "1"), ("c", "3"), ("e", "5")]);
        let mut txn = engine.write_txn().unwrap();
        txn.put(b"b", b"2").unwrap();
        txn.put(b"c", b"33").unwrap();
        assert!(txn.delete(b"e").unwrap());
        assert!(!txn.delete(b"zz").unwrap());

        assert_eq!(txn.get(b"c").unwrap(), Some(&b"33"[..]));
        assert_eq!(txn.get(b"e").unwrap(), None);
        assert_eq!(txn.entries().unwrap(), 3);

        let mut seen = Vec::new();
        {
            let mut cursor = txn.cursor().unwrap();
            let mut entry = cursor.get(CursorOp::First).unwrap();
            while let Some((k, v)) = entry {
                seen.push((k.to_vec(), v.to_vec()));
                entry = cursor.get(CursorOp::Next).unwrap();
            }
            assert_eq!(cursor.get(CursorOp::SetRange(b"d")).unwrap(), None);
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"33".to_vec()),
            ]
        );

        // Nothing is visible outside until commit
        assert_eq!(engine.read_txn().unwrap().get(b"b").unwrap(), None);
        txn.commit().unwrap();
        let reader = engine.read_txn().unwrap();
        assert_eq!(reader.entries().unwrap(), 3);
        assert_eq!(reader.get(b"c").unwrap(), Some(&b"33"[..]));
        assert_eq!(reader.get(b"e").unwrap(), None);
    }

    #[test]
    fn test_drop_all_hides_committed_entries() {
        let engine = engine_with(&[("a", "1"), ("b", "2")]);
        let mut txn = engine.write_txn().unwrap();
        txn.drop_all().unwrap();
        txn.put(b"z", b"26").unwrap();
        assert_eq!(txn.entries().unwrap(), 1);
        assert_eq!(txn.get(b"a").unwrap(), None);
        assert_eq!(
            txn.cursor().unwrap().get(CursorOp::First).unwrap(),
            Some((&b"z"[..], &b"26"[..]))
        );
        txn.commit().unwrap();

        let reader = engine.read_txn().unwrap();
        assert_eq!(reader.entries().unwrap(), 1);
        assert!(!reader.exists(b"a").unwrap());
    }

    #[test]
    fn test_reader_count() {
        let engine = engine_with(&[]);
        let first = engine.read_txn().unwrap();
        let second = engine.read_txn().unwrap();
        assert_eq!(engine.info().unwrap().readers, 2);
        drop(first);
        drop(second);
        assert_eq!(engine.info().unwrap().readers, 0);
    }

    struct VecSink(Vec<u8>);

    impl CopySink for VecSink {
        fn total_size(&mut self, _size: u64) -> io::Result<()> {
            Ok(())
        }

        fn data(&mut self, chunk: &[u8]) -> io::Result<()> {
            self.0.extend_from_slice(chunk);
            Ok(())
        }
    }

    #[test]
    fn test_copy_and_restore() {
        let engine = engine_with(&[("a", "1"), ("b", "2")]);
        let mut sink = VecSink(Vec::new());
        engine.copy(&mut sink).unwrap();

        let backend = MemoryBackend::new();
        backend.create_image().unwrap().write_all(&sink.0).unwrap();
        let restored = backend.open().unwrap();

        let txn = restored.read_txn().unwrap();
        assert_eq!(txn.entries().unwrap(), 2);
        assert_eq!(txn.get(b"b").unwrap(), Some(&b"2"[..]));
    }

    #[test]
    fn test_corrupt_image_rejected() {
        let backend = MemoryBackend::new();
        backend.create_image().unwrap().write_all(b"garbage!").unwrap();
        assert!(matches!(
            backend.open(),
            Err(EngineError::CorruptImage(_))
        ));
    }
}
