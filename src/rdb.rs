//! Persistence File Framing
//!
//! The server's snapshot file is a small tagged stream:
//!
//! ```text
//! "FLASHRDB" "0001"                       magic + 4-digit version
//! 0xFE <len: dbid> <section bytes...>     one section per sub-store
//! 0xFF                                    end of file
//! ```
//!
//! Lengths use the compact encoding Redis uses in its RDB files: the two top
//! bits of the first byte select a 6-bit, 14-bit, 32-bit or 64-bit value.
//! Writing is synchronous (SAVE blocks, like Redis); reading is async so the
//! loader can yield to the event loop.

use std::io::{self, Write};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAGIC: &[u8; 8] = b"FLASHRDB";
pub const VERSION: u16 = 1;

/// Opcode: a sub-store section follows, identified by a length-encoded id.
pub const OPCODE_SELECT_STORE: u8 = 0xFE;

/// Opcode: end of file.
pub const OPCODE_EOF: u8 = 0xFF;

const LEN_6BIT: u8 = 0;
const LEN_14BIT: u8 = 1;
const LEN_32BIT: u8 = 0x80;
const LEN_64BIT: u8 = 0x81;

/// Errors raised while reading a persistence file.
#[derive(Debug, Error)]
pub enum RdbError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("wrong signature, not a persistence file")]
    BadMagic,

    #[error("can't handle persistence format version {0}")]
    UnsupportedVersion(String),

    #[error("unknown length encoding {0:#04x}")]
    BadLength(u8),

    #[error("unexpected opcode {0:#04x}")]
    UnexpectedOpcode(u8),

    #[error("unknown sub-store {0}")]
    UnknownStore(u64),
}

/// Writes the persistence stream.
pub struct RdbWriter<W: Write> {
    out: W,
    written: u64,
}

impl<W: Write> RdbWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    pub fn write_header(&mut self) -> io::Result<()> {
        self.write_raw(MAGIC)?;
        self.write_raw(format!("{:04}", VERSION).as_bytes())
    }

    pub fn write_type(&mut self, opcode: u8) -> io::Result<()> {
        self.write_raw(&[opcode])
    }

    pub fn write_len(&mut self, len: u64) -> io::Result<()> {
        if len < 1 << 6 {
            self.write_raw(&[(LEN_6BIT << 6) | len as u8])
        } else if len < 1 << 14 {
            self.write_raw(&[(LEN_14BIT << 6) | (len >> 8) as u8, len as u8])
        } else if len <= u64::from(u32::MAX) {
            self.write_raw(&[LEN_32BIT])?;
            self.write_raw(&(len as u32).to_be_bytes())
        } else {
            self.write_raw(&[LEN_64BIT])?;
            self.write_raw(&len.to_be_bytes())
        }
    }

    pub fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        self.out.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn write_eof(&mut self) -> io::Result<()> {
        self.write_type(OPCODE_EOF)?;
        self.out.flush()
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Reads the persistence stream.
pub struct RdbReader<R> {
    input: R,
    read: u64,
}

impl<R: AsyncRead + Unpin> RdbReader<R> {
    pub fn new(input: R) -> Self {
        Self { input, read: 0 }
    }

    pub async fn read_header(&mut self) -> Result<u16, RdbError> {
        let mut magic = [0u8; 8];
        self.read_exact(&mut magic).await?;
        if &magic != MAGIC {
            return Err(RdbError::BadMagic);
        }

        let mut version = [0u8; 4];
        self.read_exact(&mut version).await?;
        let text = String::from_utf8_lossy(&version).into_owned();
        match text.parse::<u16>() {
            Ok(v) if (1..=VERSION).contains(&v) => Ok(v),
            _ => Err(RdbError::UnsupportedVersion(text)),
        }
    }

    pub async fn read_type(&mut self) -> Result<u8, RdbError> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    pub async fn read_len(&mut self) -> Result<u64, RdbError> {
        let first = self.read_type().await?;
        match first >> 6 {
            0 => Ok(u64::from(first & 0x3F)),
            1 => {
                let second = self.read_type().await?;
                Ok((u64::from(first & 0x3F) << 8) | u64::from(second))
            }
            _ => match first {
                LEN_32BIT => {
                    let mut raw = [0u8; 4];
                    self.read_exact(&mut raw).await?;
                    Ok(u64::from(u32::from_be_bytes(raw)))
                }
                LEN_64BIT => self.read_u64_be().await,
                other => Err(RdbError::BadLength(other)),
            },
        }
    }

    pub async fn read_u64_be(&mut self) -> Result<u64, RdbError> {
        let mut raw = [0u8; 8];
        self.read_exact(&mut raw).await?;
        Ok(u64::from_be_bytes(raw))
    }

    /// Fills `buf` completely; a short stream is [`RdbError::UnexpectedEof`].
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), RdbError> {
        match self.input.read_exact(buf).await {
            Ok(_) => {
                self.read += buf.len() as u64;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(RdbError::UnexpectedEof),
            Err(e) => Err(e.into()),
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.read
    }
}
