//! Cache and origin error types.

use std::io;

use pkgproxy_store::StoreError;

/// Failure reported by an [`Origin`](crate::Origin).
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    /// Origin answered with a status other than 200.
    #[error("origin returned HTTP {status}")]
    HttpResponse {
        /// HTTP status code.
        status: u16,
        /// Response body (may explain the failure).
        body: String,
    },
    /// Request could not be completed (connection, timeout, proxy).
    #[error("origin request failed: {0}")]
    Transport(String),
    /// Response body could not be read to the end.
    #[error("origin body read failed: {0}")]
    Body(#[from] io::Error),
}

/// Cache engine error.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Key was never stored.
    #[error("'{0}' is not cached")]
    NotFound(String),
    /// Disk object could not be written, opened or stat'ed.
    #[error("storage error for '{key}': {source}")]
    Io {
        /// Cache key.
        key: String,
        /// Underlying store error.
        source: StoreError,
    },
    /// Fetch from the origin failed.
    #[error("origin fetch failed for '{key}': {source}")]
    Origin {
        /// Cache key.
        key: String,
        /// Underlying origin error.
        source: OriginError,
    },
    /// Existing objects could not be enumerated at startup.
    #[error("cannot scan cache folder: {0}")]
    Scan(#[source] StoreError),
}

impl CacheError {
    pub(crate) fn io(key: &str, source: StoreError) -> Self {
        Self::Io {
            key: key.to_owned(),
            source,
        }
    }

    pub(crate) fn origin(key: &str, source: OriginError) -> Self {
        Self::Origin {
            key: key.to_owned(),
            source,
        }
    }
}
