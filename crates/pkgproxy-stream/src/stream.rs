//! Stream state machine and blocking readers.

use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Backing store for a [`Stream`].
///
/// Implementations accept appends from a single writer and hand out any number
/// of independent readers. A reader returned by [`Source::open`] reports
/// `Ok(0)` when it has caught up with the data appended so far; the [`Stream`]
/// decides whether that means "wait" or "end of data".
pub trait Source: Send + Sync {
    /// Append bytes to the end of the source.
    fn append(&self, data: &[u8]) -> io::Result<()>;

    /// Open a new reader positioned at offset 0.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn append(&self, data: &[u8]) -> io::Result<()> {
        (**self).append(data)
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        (**self).open()
    }
}

/// Stream error.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Write or close attempted after the stream was closed for writing.
    #[error("stream already closed for writing")]
    Closed,
    /// The backing source failed.
    #[error("stream source error: {0}")]
    Io(#[from] io::Error),
}

/// Byte stream with one writer and many concurrent readers.
///
/// The stream is `Open` until [`close_write`](Self::close_write) moves it to
/// `Closed`; the transition happens once and is never undone.
pub struct Stream<S> {
    source: S,
    closed: Mutex<bool>,
    cond: Condvar,
}

impl<S: Source> Stream<S> {
    /// Create an open stream backed by `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            closed: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Append `data` and wake every blocked reader.
    ///
    /// Returns [`StreamError::Closed`] once the stream has been closed.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        if *self.lock() {
            return Err(StreamError::Closed);
        }
        self.source.append(data)?;

        // Taking the lock orders the notification after any reader that
        // already checked for data and is about to wait.
        let _closed = self.lock();
        self.cond.notify_all();
        Ok(data.len())
    }

    /// Declare the end of the stream.
    ///
    /// Readers that have consumed everything receive end-of-data from now on.
    /// Closing twice returns [`StreamError::Closed`].
    pub fn close_write(&self) -> Result<(), StreamError> {
        let mut closed = self.lock();
        if *closed {
            return Err(StreamError::Closed);
        }
        *closed = true;
        self.cond.notify_all();
        Ok(())
    }

    /// Whether the writer has closed the stream.
    pub fn is_closed(&self) -> bool {
        *self.lock()
    }

    /// Create a reader starting at offset 0.
    ///
    /// May be called any number of times, before or after closing.
    pub fn new_reader(self: &Arc<Self>) -> Result<StreamReader<S>, StreamError> {
        let inner = self.source.open()?;
        Ok(StreamReader {
            stream: Arc::clone(self),
            inner,
        })
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Source> Write for &Stream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Stream::write(*self, buf).map_err(|e| match e {
            StreamError::Io(err) => err,
            StreamError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, StreamError::Closed),
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Independent cursor into a [`Stream`].
pub struct StreamReader<S> {
    stream: Arc<Stream<S>>,
    inner: Box<dyn Read + Send>,
}

impl<S: Source> Read for StreamReader<S> {
    /// Read available bytes, blocking while the stream is open and empty.
    ///
    /// A short read from the source is returned as-is even if the source hit
    /// its current end; only a zero-byte read on a closed stream is end-of-data.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let n = self.inner.read(buf)?;
        if n > 0 {
            return Ok(n);
        }

        let mut closed = self.stream.lock();
        loop {
            let n = self.inner.read(buf)?;
            if n > 0 || *closed {
                return Ok(n);
            }
            closed = self
                .stream
                .cond
                .wait(closed)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
