//! In-memory stream source.

use std::io::{self, Read};
use std::sync::{Arc, PoisonError, RwLock};

use crate::Source;

/// Growable in-memory byte buffer shared by all readers of a stream.
#[derive(Default)]
pub struct BufferSource {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl BufferSource {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(Vec::with_capacity(capacity))),
        }
    }
}

impl Source for BufferSource {
    fn append(&self, data: &[u8]) -> io::Result<()> {
        self.buf
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(())
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(BufferReader {
            buf: Arc::clone(&self.buf),
            pos: 0,
        }))
    }
}

/// Cursor into a [`BufferSource`].
struct BufferReader {
    buf: Arc<RwLock<Vec<u8>>>,
    pos: usize,
}

impl Read for BufferReader {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let buf = self.buf.read().unwrap_or_else(PoisonError::into_inner);
        let Some(available) = buf.get(self.pos..) else {
            return Ok(0);
        };
        let n = available.len().min(dst.len());
        dst[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}
