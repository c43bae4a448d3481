//! File-backed stream source.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};

use crate::Source;

/// Stream source backed by a file on disk.
///
/// The writer appends through its own handle; every reader opens the file
/// again read-only, so each has its own offset. Temporary sources created
/// with [`FileSource::temporary_in`] delete the file when dropped. Readers
/// opened before that keep working on platforms that allow reading unlinked
/// files.
pub struct FileSource {
    file: File,
    path: PathBuf,
    _temp: Option<TempPath>,
}

impl FileSource {
    /// Create (or truncate) the file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            _temp: None,
        })
    }

    /// Create a uniquely named file in `dir` that is removed on drop.
    pub fn temporary_in(dir: &Path) -> io::Result<Self> {
        let (file, temp) = NamedTempFile::new_in(dir)?.into_parts();
        Ok(Self {
            file,
            path: temp.to_path_buf(),
            _temp: Some(temp),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Source for FileSource {
    fn append(&self, data: &[u8]) -> io::Result<()> {
        (&self.file).write_all(data)
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}
