//! Snapshot Bridge
//!
//! Carries the MDB environment through the server's persistence file as one
//! section:
//!
//! ```text
//! OPCODE_SELECT_STORE <len: dbid> <u64 BE: image size> <image bytes> OPCODE_EOF
//! ```
//!
//! Saving streams a compacting copy of the environment into the section.
//! Loading always consumes the full section; only a replica with the layer
//! enabled actually replaces its environment with the image. A load is split
//! in three steps so the stream can be read without holding the store.

use crate::rdb::{RdbError, RdbReader, RdbWriter, OPCODE_EOF, OPCODE_SELECT_STORE};
use crate::storage::engine::{CopySink, EngineError};
use crate::storage::store::MdbStore;
use std::io::{self, Write};
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, info};

/// Image bytes are written to the persistence file in pieces of this size.
pub const SUB_CHUNK_SIZE: usize = 1024;

/// Read size used when loading an image.
const LOAD_CHUNK_SIZE: usize = 16 * 1024;

/// The loader yields to the event loop after this many chunks.
const YIELD_EVERY: usize = 64;

/// Errors that abort a save or a load.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("MDB: {0}")]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Rdb(#[from] RdbError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("environment copy announced {expected} bytes but produced {got}")]
    ShortCopy { expected: u64, got: u64 },

    #[error("MDB section truncated after {got} of {expected} bytes")]
    ShortRead { expected: u64, got: u64 },

    #[error("MDB section not followed by end marker (found {0:#04x})")]
    MissingEndMarker(u8),
}

/// Forwards an engine copy into the persistence stream.
struct SectionSink<'a, W: Write> {
    out: &'a mut RdbWriter<W>,
    expected: Option<u64>,
    sent: u64,
}

impl<W: Write> CopySink for SectionSink<'_, W> {
    fn total_size(&mut self, size: u64) -> io::Result<()> {
        self.expected = Some(size);
        self.out.write_raw(&size.to_be_bytes())
    }

    fn data(&mut self, chunk: &[u8]) -> io::Result<()> {
        for piece in chunk.chunks(SUB_CHUNK_SIZE) {
            self.out.write_raw(piece)?;
        }
        self.sent += chunk.len() as u64;
        Ok(())
    }
}

/// Writes the MDB section, including its end marker.
///
/// Returns `Ok(false)` without writing anything when the layer is disabled or
/// this instance is a replica.
pub fn save<W: Write>(
    store: &MdbStore,
    is_replica: bool,
    out: &mut RdbWriter<W>,
) -> Result<bool, SnapshotError> {
    if !store.is_enabled() || is_replica {
        debug!(is_replica, "MDB section skipped");
        return Ok(false);
    }

    let engine = store.engine()?;
    out.write_type(OPCODE_SELECT_STORE)?;
    out.write_len(store.config().dbid)?;

    let mut sink = SectionSink {
        out,
        expected: None,
        sent: 0,
    };
    engine.copy(&mut sink)?;
    let (expected, sent) = (sink.expected.unwrap_or(0), sink.sent);
    if expected != sent {
        return Err(SnapshotError::ShortCopy {
            expected,
            got: sent,
        });
    }

    out.write_type(OPCODE_EOF)?;
    info!(bytes = sent, "MDB environment saved");
    Ok(true)
}

/// A section load in progress.
///
/// [`begin_load`] and [`finish_load`] need the store; [`SectionLoad::read`]
/// does all the stream I/O without it, so a server can keep serving other
/// clients while a large image comes in.
pub struct SectionLoad {
    /// Present when this instance restores from the section.
    image: Option<Box<dyn Write + Send>>,
    size: u64,
}

/// Prepares to read an MDB section whose opcode and dbid were already
/// consumed. When the layer is enabled and this instance is a replica, the
/// environment is closed and its backing storage truncated for the image.
pub fn begin_load(store: &mut MdbStore, is_replica: bool) -> Result<SectionLoad, SnapshotError> {
    let image = if store.is_enabled() && is_replica {
        store.close_env();
        Some(store.backend().create_image()?)
    } else {
        None
    };
    Ok(SectionLoad { image, size: 0 })
}

impl SectionLoad {
    /// True if the environment is replaced by the image.
    pub fn restores(&self) -> bool {
        self.image.is_some()
    }

    /// Reads the image and its end marker in full, yielding to the runtime
    /// every few chunks. Returns the image size.
    pub async fn read<R: AsyncRead + Unpin>(
        &mut self,
        input: &mut RdbReader<R>,
    ) -> Result<u64, SnapshotError> {
        let size = input.read_u64_be().await?;
        self.size = size;

        let mut buf = vec![0u8; LOAD_CHUNK_SIZE];
        let mut remaining = size;
        let mut chunks = 0usize;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            input
                .read_exact(&mut buf[..n])
                .await
                .map_err(|err| match err {
                    RdbError::UnexpectedEof => SnapshotError::ShortRead {
                        expected: size,
                        got: size - remaining,
                    },
                    other => other.into(),
                })?;
            if let Some(image) = self.image.as_mut() {
                image.write_all(&buf[..n])?;
            }
            remaining -= n as u64;

            chunks += 1;
            if chunks % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }
        if let Some(image) = self.image.as_mut() {
            image.flush()?;
        }

        match input.read_type().await {
            Ok(OPCODE_EOF) => Ok(size),
            Ok(other) => Err(SnapshotError::MissingEndMarker(other)),
            Err(RdbError::UnexpectedEof) => Err(SnapshotError::ShortRead {
                expected: size,
                got: size,
            }),
            Err(err) => Err(err.into()),
        }
    }
}

/// Completes a load once [`SectionLoad::read`] succeeded: a restoring
/// instance reopens its environment on the new image.
pub fn finish_load(store: &mut MdbStore, load: SectionLoad) -> Result<(), SnapshotError> {
    let SectionLoad { image, size } = load;
    if image.is_none() {
        debug!(bytes = size, "MDB section discarded");
        return Ok(());
    }
    // The image writer must be gone before the environment maps the file.
    drop(image);
    store.reopen_env()?;
    info!(bytes = size, "MDB environment restored");
    Ok(())
}
