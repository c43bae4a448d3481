//! On-disk object store for pkgproxy.
//!
//! Each cache key maps to exactly one file. Keys look like
//! `host/path/to/object`; the first segment becomes a shard directory and the
//! remainder is percent-escaped into a single file name:
//!
//! ```text
//! {root}/
//! +-- deb.debian.org/
//! |   +-- debian%2Fdists%2Fstable%2FInRelease
//! +-- example.com/
//!     +-- file%2Etar%2Egz
//! ```
//!
//! Escaping `.` and `/` keeps every file name free of path separators and
//! relative components, and makes the mapping reversible so [`ObjectStore::scan`]
//! can recover keys from a populated directory.
//!
//! Writes go to a temporary file in the shard directory and are renamed into
//! place once complete, so a reader never observes a partially written object.
//! The store does no per-key locking: callers must not write the same key
//! concurrently.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

/// Characters escaped in object file names.
const FILE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'~');

/// Prefix for in-progress writes; escaped names never start with `.`.
const TEMP_PREFIX: &str = ".tmp";

/// Object store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Key cannot be mapped to a storage path.
    #[error("invalid cache key '{0}'")]
    InvalidKey(String),
    /// File system operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path the operation was working on.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// Fewer or more bytes arrived than announced.
    #[error("incomplete object {}: expected {expected} bytes, got {written}", path.display())]
    Incomplete {
        /// Target path (never written).
        path: PathBuf,
        /// Announced length.
        expected: u64,
        /// Bytes actually copied.
        written: u64,
    },
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Size and age reference of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object length in bytes.
    pub len: u64,
    /// Modification time; the object's "loaded at" timestamp.
    pub modified: SystemTime,
}

/// Directory-backed object store.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        if !root.is_dir() {
            tracing::info!(path = %root.display(), "creating cache folder");
        }
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path holding `key`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let (shard, rest) = split_key(key)?;
        let name = utf8_percent_encode(rest, FILE_NAME).to_string();
        Ok(self.root.join(shard).join(name))
    }

    /// Copy `reader` into the object for `key`, replacing any previous object.
    ///
    /// When `expected_len` is given and the copied length differs, nothing is
    /// written and [`StoreError::Incomplete`] is returned.
    pub fn write(
        &self,
        key: &str,
        reader: &mut dyn Read,
        expected_len: Option<u64>,
    ) -> Result<ObjectMeta, StoreError> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_owned()))?;
        ensure_dir(dir)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)
            .map_err(|e| StoreError::io(dir, e))?;

        let written = {
            let mut writer = BufWriter::new(temp.as_file_mut());
            let written = io::copy(reader, &mut writer).map_err(|e| StoreError::io(&path, e))?;
            writer.flush().map_err(|e| StoreError::io(&path, e))?;
            written
        };

        if let Some(expected) = expected_len
            && expected != written
        {
            return Err(StoreError::Incomplete {
                path,
                expected,
                written,
            });
        }

        temp.persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;
        tracing::debug!(key, bytes = written, path = %path.display(), "object written");

        self.metadata(key)
    }

    /// Open the object for reading.
    pub fn reader(&self, key: &str) -> Result<File, StoreError> {
        let path = self.path_for(key)?;
        File::open(&path).map_err(|e| StoreError::io(path, e))
    }

    /// Open the object together with the size and mtime of that same file.
    ///
    /// The metadata comes from the open handle, so it describes the bytes the
    /// handle will yield even if the object is replaced meanwhile.
    pub fn reader_with_meta(&self, key: &str) -> Result<(File, ObjectMeta), StoreError> {
        let path = self.path_for(key)?;
        let file = File::open(&path).map_err(|e| StoreError::io(&path, e))?;
        let meta = file.metadata().map_err(|e| StoreError::io(&path, e))?;
        let modified = meta.modified().map_err(|e| StoreError::io(&path, e))?;
        Ok((
            file,
            ObjectMeta {
                len: meta.len(),
                modified,
            },
        ))
    }

    /// Read the whole object into memory.
    pub fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|e| StoreError::io(path, e))
    }

    /// Length and modification time of the object.
    pub fn metadata(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        let path = self.path_for(key)?;
        let meta = fs::metadata(&path).map_err(|e| StoreError::io(&path, e))?;
        let modified = meta.modified().map_err(|e| StoreError::io(&path, e))?;
        Ok(ObjectMeta {
            len: meta.len(),
            modified,
        })
    }

    /// List the keys of all stored objects.
    ///
    /// Entries whose names start with `.` (in-progress writes, scratch
    /// directories) and names that do not decode are skipped.
    pub fn scan(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for shard in read_dir(&self.root)? {
            let Some(shard_name) = visible_name(&shard) else {
                continue;
            };
            if !shard.is_dir() {
                continue;
            }
            for object in read_dir(&shard)? {
                let Some(file_name) = visible_name(&object) else {
                    continue;
                };
                if !object.is_file() {
                    continue;
                }
                match percent_decode_str(file_name).decode_utf8() {
                    Ok(rest) => keys.push(format!("{shard_name}/{rest}")),
                    Err(_) => {
                        tracing::warn!(path = %object.display(), "skipping undecodable object name");
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Split a key into shard directory and remainder, rejecting keys that would
/// escape the store or collide with reserved names.
fn split_key(key: &str) -> Result<(&str, &str), StoreError> {
    let invalid = || StoreError::InvalidKey(key.to_owned());
    let (shard, rest) = key.split_once('/').ok_or_else(invalid)?;
    if shard.is_empty() || shard.starts_with('.') || shard.contains('\\') || rest.is_empty() {
        return Err(invalid());
    }
    Ok((shard, rest))
}

/// Create `dir` and its parents if it does not exist yet.
fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    entries
        .map(|entry| entry.map(|e| e.path()).map_err(|e| StoreError::io(dir, e)))
        .collect()
}

fn visible_name(path: &Path) -> Option<&str> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.starts_with('.'))
}
