//! Router construction.

use std::sync::Arc;

use axum::routing::get;
use axum::{Extension, Router};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::metrics::{Metrics, Protocol};
use crate::state::AppState;

/// Create the proxy router for one listener: every path is a cache key.
pub(crate) fn create_router(state: Arc<AppState>, protocol: Protocol) -> Router {
    Router::new()
        .fallback(handlers::proxy::proxy)
        .layer(Extension(protocol))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the metrics router (`GET /metrics`).
pub(crate) fn create_metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics::get_metrics))
        .with_state(metrics)
}
