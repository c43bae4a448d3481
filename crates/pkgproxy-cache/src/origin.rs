//! Origin fetch collaborator.

use std::io::Read;

use crate::OriginError;

/// Body and announced length of a successful origin response.
pub struct Fetched {
    /// Response body.
    pub body: Box<dyn Read + Send>,
    /// Length announced by the origin, if any.
    pub content_length: Option<u64>,
}

impl Fetched {
    /// Wrap a body reader.
    pub fn new(body: impl Read + Send + 'static, content_length: Option<u64>) -> Self {
        Self {
            body: Box::new(body),
            content_length,
        }
    }

    /// Fully buffered body with a known length.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let len = data.len() as u64;
        Self::new(std::io::Cursor::new(data), Some(len))
    }
}

impl std::fmt::Debug for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetched")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Fetches the bytes for a key from the upstream server.
///
/// The implementation owns its timeouts. Anything other than a complete
/// success is an [`OriginError`].
pub trait Origin: Send + Sync {
    /// Start fetching `key`.
    fn fetch(&self, key: &str) -> Result<Fetched, OriginError>;
}

impl<F> Origin for F
where
    F: Fn(&str) -> Result<Fetched, OriginError> + Send + Sync,
{
    fn fetch(&self, key: &str) -> Result<Fetched, OriginError> {
        self(key)
    }
}
