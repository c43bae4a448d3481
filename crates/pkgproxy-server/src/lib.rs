//! HTTP front end for the pkgproxy caching proxy.
//!
//! Requests for `/{host}/{path}` are answered from the local cache, fetching
//! `{scheme}://{host}/{path}` from the origin on a miss. The same router can
//! also be served over HTTPS. Counters are exposed in OpenMetrics text format
//! on a separate listener.
//!
//! # Quick Start
//!
//! ```ignore
//! use pkgproxy_config::Config;
//! use pkgproxy_server::{run_server, server_config_from_config};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::load(None, None).unwrap();
//!     run_server(server_config_from_config(&config).unwrap()).await.unwrap();
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Client ──HTTP(S)──► axum (pkgproxy-server)
//!                     │
//!                     ├─► proxy handler ──blocking pool──► CacheEngine (pkgproxy-cache)
//!                     │                                       ├─► ObjectStore (disk)
//!                     │                                       └─► HttpOrigin (ureq)
//!                     │
//!                     └─► /metrics (separate listener) ──► Metrics
//! ```

mod app;
mod error;
mod handlers;
mod key;
mod metrics;
mod origin;
mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pkgproxy_cache::{CacheConfig, CacheEngine, CacheObserver};
use axum_server::tls_rustls::RustlsConfig;
use pkgproxy_config::{Config, ConfigError, TlsConfig};
use pkgproxy_rules::TtlRules;
use pkgproxy_store::ObjectStore;
use state::AppState;

pub use error::{ServerError, StartupError};
pub use metrics::{Metrics, Protocol};
pub use origin::HttpOrigin;

/// Scratch directory inside the cache folder for downloads too large to buffer.
pub const INFLIGHT_DIR: &str = ".inflight";

/// Server configuration.
#[derive(Debug)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// HTTPS listener on the same host, `None` disables it.
    pub tls: Option<TlsConfig>,
    /// Metrics listener (`host:port`), `None` disables it.
    pub metrics_address: Option<String>,
    /// Cache folder.
    pub cache_dir: PathBuf,
    /// Scheme for origin URLs.
    pub upstream_scheme: String,
    /// Origin request timeout.
    pub timeout: Duration,
    /// Outbound proxy for origin requests.
    pub proxy: Option<String>,
    /// Cache engine tuning.
    pub cache: CacheConfig,
    /// TTL rules.
    pub rules: TtlRules,
}

/// Create server configuration from the loaded config file.
///
/// # Errors
///
/// Returns an error if a TTL pattern does not compile.
pub fn server_config_from_config(config: &Config) -> Result<ServerConfig, ConfigError> {
    Ok(ServerConfig {
        host: config.listen_address.clone(),
        port: config.listen_port,
        tls: config.tls.clone(),
        metrics_address: config.metrics_address.clone(),
        cache_dir: config.cache_dir.clone(),
        upstream_scheme: config.upstream_scheme.clone(),
        timeout: config.timeout,
        proxy: config.proxy.clone(),
        cache: CacheConfig {
            memory_item_size: config.memory_item_size,
            serve_stale_on_error: config.serve_stale_on_error,
        },
        rules: config.ttl_rules()?,
    })
}

/// Run the proxy until Ctrl-C.
///
/// Opens the cache folder, indexes the objects already on disk, then serves
/// the proxy and (when configured) the HTTPS and metrics listeners.
pub async fn run_server(config: ServerConfig) -> Result<(), StartupError> {
    let store = ObjectStore::open(&config.cache_dir)?;
    let inflight_dir = prepare_inflight_dir(store.root())?;

    let origin = HttpOrigin::new(
        &config.upstream_scheme,
        config.timeout,
        config.proxy.as_deref(),
    )?;
    let metrics = Arc::new(Metrics::new());
    let engine = CacheEngine::new(store, config.rules, config.cache, Arc::new(origin))
        .with_observer(Arc::clone(&metrics) as Arc<dyn CacheObserver>);

    let engine = tokio::task::spawn_blocking(move || -> Result<_, StartupError> {
        let count = engine.load_existing()?;
        tracing::info!(objects = count, "cache index loaded");
        Ok(engine)
    })
    .await
    .map_err(|e| StartupError::Index(e.to_string()))??;

    if let Some(addr) = &config.metrics_address {
        let listener = bind(addr).await?;
        let app = app::create_metrics_router(Arc::clone(&metrics));
        tracing::info!(address = %addr, "Serving metrics");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "metrics listener failed");
            }
        });
    }

    let state = Arc::new(AppState {
        engine,
        metrics,
        inflight_dir,
    });
    if let Some(tls) = &config.tls {
        let rustls = load_tls(tls).await?;
        let addr = format!("{}:{}", config.host, tls.port);
        let listener = bind(&addr)
            .await?
            .into_std()
            .map_err(|source| StartupError::Listen {
                addr: addr.clone(),
                source,
            })?;
        let app = app::create_router(Arc::clone(&state), Protocol::Https);
        let handle = axum_server::Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown_signal().await;
                handle.graceful_shutdown(Some(Duration::from_secs(10)));
            }
        });
        tracing::info!(address = %addr, "Starting TLS server");
        tokio::spawn(async move {
            let server = axum_server::from_tcp_rustls(listener, rustls)
                .handle(handle)
                .serve(app.into_make_service());
            if let Err(err) = server.await {
                tracing::error!(address = %addr, error = %err, "TLS listener failed");
            }
        });
    }

    let app = app::create_router(state, Protocol::Http);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = bind(&addr).await?;
    tracing::info!(address = %addr, "Starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|source| StartupError::Listen { addr, source })
}

async fn bind(addr: &str) -> Result<tokio::net::TcpListener, StartupError> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Listen {
            addr: addr.to_owned(),
            source,
        })
}

/// Load the certificate chain and private key for the HTTPS listener.
async fn load_tls(tls: &TlsConfig) -> Result<RustlsConfig, StartupError> {
    RustlsConfig::from_pem_file(&tls.certificate_file, &tls.private_key)
        .await
        .map_err(|source| StartupError::Tls {
            certificate: tls.certificate_file.clone(),
            source,
        })
}

/// Recreate the scratch directory, dropping leftovers of interrupted downloads.
fn prepare_inflight_dir(root: &Path) -> Result<PathBuf, StartupError> {
    let path = root.join(INFLIGHT_DIR);
    let wrap = |source| StartupError::Inflight {
        path: path.clone(),
        source,
    };
    match std::fs::remove_dir_all(&path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(wrap(err)),
    }
    std::fs::create_dir_all(&path).map_err(wrap)?;
    Ok(path)
}

/// Wait for shutdown signal (Ctrl-C).
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for Ctrl+C, running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping server...");
}
