//! Single-writer, multi-reader byte streams.
//!
//! A [`Stream`] lets any number of consumers read data while it is still being
//! produced, without each consumer keeping a private copy. Data lives in a
//! shared [`Source`]:
//!
//! - [`BufferSource`]: growable in-memory buffer
//! - [`FileSource`]: file on disk, optionally removed when the source is dropped
//!
//! Readers created with [`Stream::new_reader`] start at offset 0, so a reader
//! that joins late (even after the writer closed the stream) still sees the
//! complete history. A read that finds no data blocks until the writer appends
//! more or declares the end with [`Stream::close_write`].
//!
//! # Example
//!
//! ```
//! use std::io::Read;
//! use std::sync::Arc;
//!
//! use pkgproxy_stream::{BufferSource, Stream};
//!
//! let stream = Arc::new(Stream::new(BufferSource::new()));
//! let mut reader = stream.new_reader().unwrap();
//!
//! stream.write(b"hello").unwrap();
//! stream.write(b" world").unwrap();
//! stream.close_write().unwrap();
//!
//! let mut out = String::new();
//! reader.read_to_string(&mut out).unwrap();
//! assert_eq!(out, "hello world");
//! ```

mod buffer;
mod file;
mod stream;

pub use buffer::BufferSource;
pub use file::FileSource;
pub use stream::{Source, Stream, StreamError, StreamReader};
