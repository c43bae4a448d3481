//! Application state.
//!
//! Shared state for all request handlers.

use std::path::PathBuf;
use std::sync::Arc;

use pkgproxy_cache::CacheEngine;

use crate::metrics::Metrics;

/// Application state shared across all handlers.
pub(crate) struct AppState {
    /// Cache engine.
    pub(crate) engine: CacheEngine,
    /// Counters, also registered as the engine's observer.
    pub(crate) metrics: Arc<Metrics>,
    /// Scratch directory for large in-flight downloads.
    pub(crate) inflight_dir: PathBuf,
}
