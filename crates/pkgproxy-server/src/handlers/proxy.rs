//! Proxy endpoint.
//!
//! Every request path is `/{host}/{path}`. The cache engine blocks (locks,
//! disk, origin I/O), so each request runs on the blocking pool and hands its
//! response head and body chunks back over channels:
//!
//! ```text
//! handler ──spawn_blocking──► transfer
//!    ▲                          │ reserve / read / fetch_origin + store
//!    ├──── oneshot: Head ───────┤
//!    └──── mpsc: body chunks ◄── pump (reads cached content or a stream reader)
//! ```
//!
//! On a miss the origin body is copied into a [`Stream`] while the engine
//! persists it, so the client receives bytes as they arrive.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use axum::body::Body;
use axum::Extension;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pkgproxy_cache::{Lookup, Reservation};
use pkgproxy_rules::host_of;
use pkgproxy_stream::{BufferSource, FileSource, Source, Stream};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ServerError;
use crate::key::cache_key;
use crate::metrics::Protocol;
use crate::state::AppState;

/// Chunk size for body transfer.
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the blocking pump and the connection.
const BODY_CHANNEL_DEPTH: usize = 8;

type BodySender = mpsc::Sender<io::Result<Bytes>>;
type HeadSender = oneshot::Sender<Result<Head, ServerError>>;

/// Where the response content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheStatus {
    Hit,
    Miss,
    Stale,
}

impl CacheStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
        }
    }
}

/// Response head produced by the blocking side.
#[derive(Debug)]
struct Head {
    len: Option<u64>,
    /// Disk timestamp of cached content; `None` while it is still arriving.
    loaded_at: Option<SystemTime>,
    status: CacheStatus,
}

/// Handle any request outside `/metrics`.
pub(crate) async fn proxy(
    State(state): State<Arc<AppState>>,
    Extension(protocol): Extension<Protocol>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let key = cache_key(uri.path())?.to_owned();
    if method != Method::GET && method != Method::HEAD {
        return Err(ServerError::MethodNotAllowed(method.to_string()));
    }
    state.metrics.record_request(protocol, host_of(&key));

    let force = wants_revalidation(&headers);
    tracing::info!(%key, force, "requested");

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
    let worker = Arc::clone(&state);
    tokio::task::spawn_blocking(move || transfer(&worker, &key, force, head_tx, body_tx));

    let head = head_rx
        .await
        .map_err(|_| ServerError::Internal("transfer ended without a response".to_owned()))??;

    if let Some(loaded_at) = head.loaded_at
        && not_modified(&headers, loaded_at)
    {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::LAST_MODIFIED, http_date(loaded_at))
            .body(Body::empty())
            .map_err(|e| ServerError::Internal(e.to_string()));
    }

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("x-cache", head.status.as_str());
    if let Some(loaded_at) = head.loaded_at {
        response = response.header(header::LAST_MODIFIED, http_date(loaded_at));
    }
    if let Some(len) = head.len {
        response = response.header(header::CONTENT_LENGTH, len);
    }
    response
        .body(Body::from_stream(ReceiverStream::new(body_rx)))
        .map_err(|e| ServerError::Internal(e.to_string()))
}

/// Blocking half of a request.
fn transfer(state: &AppState, key: &str, force: bool, head_tx: HeadSender, body_tx: BodySender) {
    match state.engine.reserve(key) {
        Lookup::Hit => serve_cached(state, key, force, head_tx, &body_tx),
        Lookup::Miss(reservation) => serve_fetched(state, reservation, head_tx, body_tx),
    }
}

fn serve_cached(
    state: &AppState,
    key: &str,
    force: bool,
    head_tx: HeadSender,
    body_tx: &BodySender,
) {
    let served = match state.engine.read(key, force) {
        Ok(served) => served,
        Err(err) => {
            let _ = head_tx.send(Err(err.into()));
            return;
        }
    };

    let head = Head {
        len: Some(served.len),
        loaded_at: Some(served.loaded_at),
        status: if served.stale {
            CacheStatus::Stale
        } else {
            CacheStatus::Hit
        },
    };
    if head_tx.send(Ok(head)).is_ok() {
        pump(served.content, body_tx);
    }
}

fn serve_fetched(
    state: &AppState,
    reservation: Reservation<'_>,
    head_tx: HeadSender,
    body_tx: BodySender,
) {
    let engine = &state.engine;
    let mut fetched = match engine.fetch_origin(reservation.key()) {
        Ok(fetched) => fetched,
        Err(err) => {
            let _ = head_tx.send(Err(err.into()));
            return;
        }
    };

    let source = match stream_source(state, fetched.content_length) {
        Ok(source) => source,
        Err(err) => {
            let _ = head_tx.send(Err(ServerError::Internal(format!(
                "cannot buffer download: {err}"
            ))));
            return;
        }
    };
    let stream = Arc::new(Stream::new(source));
    let failed = Arc::new(AtomicBool::new(false));

    match stream.new_reader() {
        Ok(reader) => {
            let head = Head {
                len: fetched.content_length,
                loaded_at: None,
                status: CacheStatus::Miss,
            };
            if head_tx.send(Ok(head)).is_ok() {
                let reader = Abortable {
                    inner: reader,
                    failed: Arc::clone(&failed),
                };
                tokio::task::spawn_blocking(move || pump(reader, &body_tx));
            }
        }
        Err(err) => {
            let _ = head_tx.send(Err(ServerError::Internal(err.to_string())));
        }
    }

    let key = reservation.key().to_owned();
    let mut tee = Tee {
        inner: &mut fetched.body,
        stream: &*stream,
    };
    // The copy continues even if the client is gone so the object still lands in the cache.
    if let Err(err) = engine.store(reservation, &mut tee, fetched.content_length) {
        tracing::warn!(%key, error = %err, "download failed, aborting client response");
        failed.store(true, Ordering::SeqCst);
    }
    let _ = stream.close_write();
}

/// Pick the in-flight buffer: memory for small known sizes, a scratch file otherwise.
fn stream_source(state: &AppState, content_length: Option<u64>) -> io::Result<Box<dyn Source>> {
    match content_length {
        Some(len) if len <= state.engine.config().memory_item_size => {
            let capacity = usize::try_from(len).unwrap_or(0);
            Ok(Box::new(BufferSource::with_capacity(capacity)))
        }
        _ => Ok(Box::new(FileSource::temporary_in(&state.inflight_dir)?)),
    }
}

/// Copy `reader` to the client until end of data, an error, or disconnect.
fn pump(mut reader: impl Read, body_tx: &BodySender) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if body_tx
                    .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    tracing::debug!("client disconnected");
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                let _ = body_tx.blocking_send(Err(err));
                return;
            }
        }
    }
}

/// Copies everything read from the origin into the in-flight stream.
struct Tee<'a, S> {
    inner: &'a mut dyn Read,
    stream: &'a Stream<S>,
}

impl<S: Source> Read for Tee<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.stream.write(&buf[..n]).map_err(io::Error::other)?;
        }
        Ok(n)
    }
}

/// Turns end-of-data into an error when the download behind it failed.
struct Abortable<R> {
    inner: R,
    failed: Arc<AtomicBool>,
}

impl<R: Read> Read for Abortable<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() && self.failed.load(Ordering::SeqCst) {
            return Err(io::Error::other("origin transfer failed"));
        }
        Ok(n)
    }
}

/// `Cache-Control: no-cache` or `Pragma: no-cache`.
fn wants_revalidation(headers: &HeaderMap) -> bool {
    let has_no_cache = |name| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|directive| directive.trim().eq_ignore_ascii_case("no-cache"))
    };
    has_no_cache(header::CACHE_CONTROL) || has_no_cache(header::PRAGMA)
}

/// Whether `If-Modified-Since` is at or after `loaded_at` (second precision).
fn not_modified(headers: &HeaderMap, loaded_at: SystemTime) -> bool {
    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
    else {
        return false;
    };
    DateTime::<Utc>::from(loaded_at).timestamp() <= since.timestamp()
}

/// Format as an HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`).
fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::{HeaderValue, Request};
    use pkgproxy_cache::{CacheConfig, CacheEngine, Fetched, OriginError};
    use pkgproxy_rules::TtlRules;
    use pkgproxy_store::ObjectStore;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::app::create_router;
    use crate::metrics::Metrics;

    struct Fixture {
        _dir: TempDir,
        state: Arc<AppState>,
        calls: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn router(&self) -> Router {
            create_router(Arc::clone(&self.state), Protocol::Http)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn fixture(
        memory_item_size: u64,
        respond: impl Fn(&str) -> Result<Fetched, OriginError> + Send + Sync + 'static,
    ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path().join("cache")).unwrap();
        let inflight_dir = store.root().join(".inflight");
        std::fs::create_dir_all(&inflight_dir).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let origin = move |key: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            respond(key)
        };

        let metrics = Arc::new(Metrics::new());
        let engine = CacheEngine::new(
            store,
            TtlRules::new(Duration::from_secs(600)),
            CacheConfig {
                memory_item_size,
                serve_stale_on_error: true,
            },
            Arc::new(origin),
        )
        .with_observer(Arc::clone(&metrics) as Arc<dyn pkgproxy_cache::CacheObserver>);

        Fixture {
            _dir: dir,
            state: Arc::new(AppState {
                engine,
                metrics,
                inflight_dir,
            }),
            calls,
        }
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Result<Bytes, axum::Error> {
        axum::body::to_bytes(response.into_body(), usize::MAX).await
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let fx = fixture(1024, |_| Ok(Fetched::from_bytes(b"package".to_vec())));

        let first = fx.router().oneshot(get("/example.com/pool/a.deb")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-cache"], "MISS");
        assert!(!first.headers().contains_key(header::LAST_MODIFIED));
        assert_eq!(first.headers()[header::CONTENT_LENGTH], "7");
        assert_eq!(body_bytes(first).await.unwrap(), "package");

        let second = fx.router().oneshot(get("/example.com/pool/a.deb")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()["x-cache"], "HIT");
        let modified = fx.state.engine.read("example.com/pool/a.deb", false).unwrap().loaded_at;
        assert_eq!(second.headers()[header::LAST_MODIFIED], http_date(modified).as_str());
        assert_eq!(body_bytes(second).await.unwrap(), "package");

        assert_eq!(fx.calls(), 1);
        assert_eq!(fx.state.engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_large_object_streams_through_file() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let body = payload.clone();
        let fx = fixture(1024, move |_| Ok(Fetched::from_bytes(body.clone())));

        let first = fx.router().oneshot(get("/example.com/big.iso")).await.unwrap();
        assert_eq!(first.headers()["x-cache"], "MISS");
        assert_eq!(body_bytes(first).await.unwrap(), payload);

        let second = fx.router().oneshot(get("/example.com/big.iso")).await.unwrap();
        assert_eq!(body_bytes(second).await.unwrap(), payload);
        assert_eq!(fx.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_length_streams() {
        let fx = fixture(1024, |_| {
            Ok(Fetched::new(io::Cursor::new(b"chunked body".to_vec()), None))
        });

        let response = fx.router().oneshot(get("/example.com/index")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(header::CONTENT_LENGTH));
        assert_eq!(body_bytes(response).await.unwrap(), "chunked body");
    }

    #[tokio::test]
    async fn test_invalid_path_is_bad_request() {
        let fx = fixture(1024, |_| Ok(Fetched::from_bytes(Vec::new())));

        for path in ["/example.com/../secret", "/example.com/dir/", "/example.com"] {
            let response = fx.router().oneshot(get(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
        }
        assert_eq!(fx.calls(), 0);
    }

    #[tokio::test]
    async fn test_post_not_allowed() {
        let fx = fixture(1024, |_| Ok(Fetched::from_bytes(Vec::new())));

        let request = Request::post("/example.com/a").body(Body::empty()).unwrap();
        let response = fx.router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(fx.state.metrics.requests(Protocol::Http), 0);
        assert!(!fx.state.metrics.render().unwrap().contains("host=\"example.com\""));
    }

    #[tokio::test]
    async fn test_if_modified_since_ignored_on_miss() {
        let fx = fixture(1024, |_| Ok(Fetched::from_bytes(b"v".to_vec())));

        let later = http_date(SystemTime::now() + Duration::from_secs(3600));
        let request = Request::get("/example.com/a")
            .header(header::IF_MODIFIED_SINCE, later)
            .body(Body::empty())
            .unwrap();
        let response = fx.router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "MISS");
        assert_eq!(body_bytes(response).await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_origin_error_passed_through() {
        let fx = fixture(1024, |_| {
            Err(OriginError::HttpResponse {
                status: 404,
                body: "not here".to_owned(),
            })
        });

        let response = fx.router().oneshot(get("/example.com/missing")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await.unwrap(), "not here");
        assert_eq!(fx.state.engine.in_flight(), 0);
        assert!(fx.state.engine.is_empty());
    }

    #[tokio::test]
    async fn test_origin_unreachable_is_bad_gateway() {
        let fx = fixture(1024, |_| Err(OriginError::Transport("refused".to_owned())));

        let response = fx.router().oneshot(get("/example.com/a")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_truncated_origin_body_aborts_response() {
        let fx = fixture(1024, |_| {
            Ok(Fetched::new(io::Cursor::new(b"short".to_vec()), Some(100)))
        });

        let response = fx.router().oneshot(get("/example.com/a")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_bytes(response).await.is_err());

        let retry = fx.router().oneshot(get("/example.com/a")).await.unwrap();
        let _ = body_bytes(retry).await;
        assert_eq!(fx.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_cache_forces_revalidation() {
        let fx = fixture(1024, |_| Ok(Fetched::from_bytes(b"v".to_vec())));

        let first = fx.router().oneshot(get("/example.com/a")).await.unwrap();
        body_bytes(first).await.unwrap();

        let request = Request::get("/example.com/a")
            .header(header::CACHE_CONTROL, "max-age=0, no-cache")
            .body(Body::empty())
            .unwrap();
        let second = fx.router().oneshot(request).await.unwrap();
        assert_eq!(second.headers()["x-cache"], "HIT");
        body_bytes(second).await.unwrap();

        assert_eq!(fx.calls(), 2);
    }

    #[tokio::test]
    async fn test_if_modified_since_returns_not_modified() {
        let fx = fixture(1024, |_| Ok(Fetched::from_bytes(b"v".to_vec())));

        let first = fx.router().oneshot(get("/example.com/a")).await.unwrap();
        body_bytes(first).await.unwrap();

        let later = http_date(SystemTime::now() + Duration::from_secs(3600));
        let request = Request::get("/example.com/a")
            .header(header::IF_MODIFIED_SINCE, later)
            .body(Body::empty())
            .unwrap();
        let response = fx.router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(body_bytes(response).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requests_counted_per_host() {
        let fx = fixture(1024, |_| Ok(Fetched::from_bytes(b"v".to_vec())));

        let response = fx.router().oneshot(get("/example.com/a")).await.unwrap();
        body_bytes(response).await.unwrap();
        let _ = fx.router().oneshot(get("/bad")).await.unwrap();

        let text = fx.state.metrics.render().unwrap();
        assert!(text.contains("pkgproxy_requests_total{protocol=\"Http\"} 1\n"));
        assert!(text.contains("pkgproxy_host_requests_total{host=\"example.com\"} 1\n"));
        assert!(text.contains("pkgproxy_cache_miss_total 1\n"));
        assert!(text.contains("pkgproxy_remote_ok_total 1\n"));
    }

    #[tokio::test]
    async fn test_requests_counted_per_protocol() {
        let fx = fixture(1024, |_| Ok(Fetched::from_bytes(b"v".to_vec())));

        let plain = fx.router().oneshot(get("/example.com/a")).await.unwrap();
        body_bytes(plain).await.unwrap();
        let secure = create_router(Arc::clone(&fx.state), Protocol::Https)
            .oneshot(get("/example.com/a"))
            .await
            .unwrap();
        assert_eq!(secure.headers()["x-cache"], "HIT");
        body_bytes(secure).await.unwrap();

        assert_eq!(fx.state.metrics.requests(Protocol::Http), 1);
        assert_eq!(fx.state.metrics.requests(Protocol::Https), 1);
        assert_eq!(fx.calls(), 1);
    }

    #[test]
    fn test_wants_revalidation() {
        let mut headers = HeaderMap::new();
        assert!(!wants_revalidation(&headers));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        assert!(!wants_revalidation(&headers));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("No-Cache"));
        assert!(wants_revalidation(&headers));

        let mut pragma = HeaderMap::new();
        pragma.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        assert!(wants_revalidation(&pragma));
    }

    #[test]
    fn test_http_date() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777);
        assert_eq!(http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_not_modified() {
        let loaded = SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777);
        let mut headers = HeaderMap::new();
        assert!(!not_modified(&headers, loaded));

        headers.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"),
        );
        assert!(not_modified(&headers, loaded));
        assert!(!not_modified(&headers, loaded + Duration::from_secs(1)));

        headers.insert(header::IF_MODIFIED_SINCE, HeaderValue::from_static("garbage"));
        assert!(!not_modified(&headers, loaded));
    }
}
