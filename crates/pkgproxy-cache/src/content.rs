//! Readable, seekable view of cached content.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::time::SystemTime;

use bytes::Bytes;

/// Cached bytes, either shared from memory or streamed from the disk object.
#[derive(Debug)]
pub enum Content {
    /// In-memory copy.
    Memory(Cursor<Bytes>),
    /// Open disk object.
    File(File),
}

impl Content {
    pub(crate) fn memory(bytes: Bytes) -> Self {
        Self::Memory(Cursor::new(bytes))
    }

    /// Whether the content is served from the in-memory tier.
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }
}

impl Read for Content {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Memory(cursor) => cursor.read(buf),
            Self::File(file) => file.read(buf),
        }
    }
}

impl Seek for Content {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Memory(cursor) => cursor.seek(pos),
            Self::File(file) => file.seek(pos),
        }
    }
}

/// Result of a successful [`CacheEngine::read`](crate::CacheEngine::read).
#[derive(Debug)]
pub struct Served {
    /// Content positioned at offset 0.
    pub content: Content,
    /// Content length in bytes.
    pub len: u64,
    /// When the disk object was written (used for `Last-Modified`).
    pub loaded_at: SystemTime,
    /// Content is past its TTL and revalidation failed.
    pub stale: bool,
}
