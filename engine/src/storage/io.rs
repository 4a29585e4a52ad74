//! Stream abstraction and storage-layer errors.
//!
//! Block storage runs on top of any seekable byte stream that can also be
//! resized. The same code then works against a real file in production and
//! an in-memory `Cursor<Vec<u8>>` in tests.
//!
//! # Implementation Notes
//!
//! Implementations must ensure:
//! - `len` reports the current logical length of the stream
//! - `set_len` grows the stream with zero bytes (or truncates it)
//! - reads and writes honor the position set by `seek`

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use crate::storage::block::BlockId;

/// A seekable, readable and writable byte stream with a resizable length.
#[allow(clippy::len_without_is_empty)]
pub trait Stream: Read + Write + Seek {
    /// Current length of the stream in bytes.
    fn len(&mut self) -> std::io::Result<u64>;

    /// Grow or truncate the stream to exactly `len` bytes.
    fn set_len(&mut self, len: u64) -> std::io::Result<()>;
}

impl Stream for File {
    fn len(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        Self::set_len(self, len)
    }
}

impl Stream for Cursor<Vec<u8>> {
    fn len(&mut self) -> std::io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> std::io::Result<()> {
        let len = usize::try_from(len).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("length {len} does not fit in memory"),
            )
        })?;
        self.get_mut().resize(len, 0);
        // Keep the cursor inside the buffer after a truncation.
        let position = self.position().min(len as u64);
        self.seek(SeekFrom::Start(position))?;
        Ok(())
    }
}

/// Errors that can occur in the block and record layers.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error from the underlying stream.
    Io(std::io::Error),
    /// A caller supplied an out-of-range offset, length or field.
    InvalidArgument(String),
    /// Operation on a block handle that has already been released.
    Disposed(BlockId),
    /// An expected block or record does not exist.
    NotFound(String),
    /// Structural corruption (misaligned stream, oversized lengths, broken chains).
    Corruption(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Disposed(id) => write!(f, "block {id} has already been released"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::InvalidArgument(_) | Self::Disposed(_) | Self::NotFound(_) | Self::Corruption(_) => {
                None
            }
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
