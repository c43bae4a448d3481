//! Server error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pkgproxy_cache::{CacheError, OriginError};
use pkgproxy_store::StoreError;

/// Error answering a proxy request.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Request path is not a usable cache key.
    #[error("invalid request path '{path}': {reason}")]
    InvalidKey {
        /// Request path.
        path: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// Only GET and HEAD are proxied.
    #[error("method {0} not allowed")]
    MethodNotAllowed(String),
    /// Cache engine failure.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Self::InvalidKey { .. } => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Cache(CacheError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Cache(CacheError::Origin {
                source: OriginError::HttpResponse { status, .. },
                ..
            }) => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Cache(CacheError::Origin { .. }) => StatusCode::BAD_GATEWAY,
            Self::Cache(CacheError::Io { .. } | CacheError::Scan(_)) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::info!(error = %self, status = status.as_u16(), "request rejected");
        }

        match self {
            // The origin's own error page goes back to the client unchanged.
            Self::Cache(CacheError::Origin {
                source: OriginError::HttpResponse { body, .. },
                ..
            }) => (status, body).into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}

/// Error starting the server.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// Cache folder could not be prepared.
    #[error("cache folder: {0}")]
    Store(#[from] StoreError),
    /// Existing cache could not be loaded.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Scratch directory for in-flight downloads could not be prepared.
    #[error("{}: {source}", path.display())]
    Inflight {
        /// Scratch directory.
        path: std::path::PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Indexing task did not finish.
    #[error("cache index: {0}")]
    Index(String),
    /// Certificate or private key for the TLS listener could not be loaded.
    #[error("TLS certificate {}: {source}", certificate.display())]
    Tls {
        /// Certificate file.
        certificate: std::path::PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Origin client could not be built (bad proxy URL).
    #[error("origin client: {0}")]
    Origin(#[from] OriginError),
    /// Listener could not be bound or served.
    #[error("{addr}: {source}")]
    Listen {
        /// Address being bound.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },
}
