//! Data units that are either held in memory or read on demand from a source.

use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::block::BLOCK_SIZE;
use crate::checksum::Accumulator;
use crate::error::{Error, Result};

/// Byte sources a deferred data unit can read from.
pub trait Source: Read + Seek + Send {}

impl<T: Read + Seek + Send> Source for T {}

/// A source shared by every unit of one container.
pub type SharedSource = Arc<Mutex<dyn Source>>;

/// Chunk size used when streaming deferred bytes.
const STREAM_CHUNK: usize = 16 * BLOCK_SIZE;

/// The data area of one unit, without block padding.
#[derive(Clone, Default)]
pub enum DataUnit {
    #[default]
    Empty,
    Realized(Vec<u8>),
    Deferred {
        source: SharedSource,
        offset: u64,
        len: usize,
    },
}

impl fmt::Debug for DataUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataUnit::Empty => f.write_str("Empty"),
            DataUnit::Realized(b) => write!(f, "Realized({} bytes)", b.len()),
            DataUnit::Deferred { offset, len, .. } => {
                write!(f, "Deferred {{ offset: {offset}, len: {len} }}")
            }
        }
    }
}

fn lock(source: &SharedSource) -> Result<MutexGuard<'_, dyn Source + 'static>> {
    source
        .lock()
        .map_err(|_| Error::Io(std::io::Error::other("data source lock poisoned")))
}

impl DataUnit {
    pub fn len(&self) -> usize {
        match self {
            DataUnit::Empty => 0,
            DataUnit::Realized(b) => b.len(),
            DataUnit::Deferred { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, DataUnit::Deferred { .. })
    }

    /// Read `len` bytes starting at `start` within the unit.
    ///
    /// A deferred unit holds its source lock for this one read only.
    pub fn read_range(&self, start: usize, len: usize) -> Result<Vec<u8>> {
        let end = start.checked_add(len).ok_or(Error::UnexpectedEof)?;
        if end > self.len() {
            return Err(Error::UnexpectedEof);
        }
        match self {
            DataUnit::Empty => Ok(Vec::new()),
            DataUnit::Realized(b) => Ok(b[start..end].to_vec()),
            DataUnit::Deferred { source, offset, .. } => {
                let mut buf = vec![0u8; len];
                let mut guard = lock(source)?;
                guard.seek(SeekFrom::Start(offset + start as u64))?;
                guard.read_exact(&mut buf).map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
                    _ => Error::Io(e),
                })?;
                Ok(buf)
            }
        }
    }

    /// All bytes of the unit, borrowed when already in memory.
    pub fn bytes(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            DataUnit::Realized(b) => Ok(Cow::Borrowed(b)),
            other => Ok(Cow::Owned(other.read_range(0, other.len())?)),
        }
    }

    /// Replace a deferred unit with its bytes.
    pub fn realize(&mut self) -> Result<()> {
        if let DataUnit::Deferred { .. } = self {
            let bytes = self.read_range(0, self.len())?;
            *self = DataUnit::Realized(bytes);
        }
        Ok(())
    }

    /// Visit the bytes of `start..start+len` in chunks without holding them all.
    pub fn for_each_chunk<F>(&self, start: usize, len: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        match self {
            DataUnit::Realized(b) => {
                let end = start.checked_add(len).ok_or(Error::UnexpectedEof)?;
                let slice = b.get(start..end).ok_or(Error::UnexpectedEof)?;
                f(slice)
            }
            _ => {
                let mut at = start;
                let end = start + len;
                while at < end {
                    let n = STREAM_CHUNK.min(end - at);
                    f(&self.read_range(at, n)?)?;
                    at += n;
                }
                Ok(())
            }
        }
    }

    /// Ones'-complement checksum of a byte range, streamed for deferred units.
    pub fn checksum_range(&self, start: usize, len: usize) -> Result<u32> {
        let mut acc = Accumulator::new();
        self.for_each_chunk(start, len, |chunk| {
            acc.update(chunk);
            Ok(())
        })?;
        Ok(acc.finish())
    }

    /// Checksum of the whole unit (block padding adds nothing).
    pub fn checksum(&self) -> Result<u32> {
        self.checksum_range(0, self.len())
    }
}
