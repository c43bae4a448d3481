//! Single-flight cache engine.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use pkgproxy_rules::{TtlRules, host_of};
use pkgproxy_store::{ObjectMeta, ObjectStore, StoreError};

use crate::gate::Gate;
use crate::{
    CacheError, CacheEvent, CacheObserver, Content, Fetched, NullObserver, Origin, OriginError,
    Served,
};

/// Default in-memory cutoff (5 MiB).
pub const DEFAULT_MEMORY_ITEM_SIZE: u64 = 5 * 1024 * 1024;

type Clock = Box<dyn Fn() -> SystemTime + Send + Sync>;

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Objects up to this many bytes are kept in memory.
    pub memory_item_size: u64,
    /// Serve expired content when revalidation fails.
    pub serve_stale_on_error: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_item_size: DEFAULT_MEMORY_ITEM_SIZE,
            serve_stale_on_error: true,
        }
    }
}

/// Outcome of [`CacheEngine::reserve`].
#[derive(Debug)]
pub enum Lookup<'a> {
    /// Key is cached; call [`CacheEngine::read`].
    Hit,
    /// Key is not cached and the caller now owns its fetch.
    Miss(Reservation<'a>),
}

/// Exclusive right to populate one key.
///
/// While a reservation is alive every other `reserve` for the key blocks.
/// Passing it to [`CacheEngine::store`] installs the content; dropping it
/// without storing (fetch failed, client went away) just wakes the waiters,
/// and one of them becomes the next owner.
#[must_use = "dropping a reservation abandons the fetch"]
pub struct Reservation<'a> {
    engine: &'a CacheEngine,
    key: String,
    gate: Option<Arc<Gate>>,
}

impl Reservation<'_> {
    /// Reserved key.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn complete(mut self, entry: Option<Entry>) {
        if let Some(gate) = self.gate.take() {
            self.engine.release(&self.key, &gate, entry);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            tracing::debug!(key = %self.key, "reservation released without content");
            self.engine.release(&self.key, &gate, None);
        }
    }
}

impl std::fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    /// Present when the object is small enough for the memory tier.
    content: Option<Bytes>,
    /// Disk modification time of the object `content` was taken from.
    loaded_at: SystemTime,
}

#[derive(Debug, Default)]
struct Tables {
    entries: HashMap<String, Entry>,
    busy: HashMap<String, Arc<Gate>>,
}

enum Claim<'a> {
    Known,
    Busy(Arc<Gate>),
    Reserved(Reservation<'a>),
}

enum Refresh {
    /// This thread fetched and stored a new copy.
    Fetched,
    /// Another thread held the key and stored a new copy.
    Waited,
    /// Another thread held the key and its fetch failed.
    Abandoned,
}

/// Two-tier (memory, disk) cache with single-flight population.
///
/// At most one fetch per key is in flight at any time, whether it is the
/// initial miss or a revalidation. Concurrent requests wait for it and then
/// read what it stored.
pub struct CacheEngine {
    store: ObjectStore,
    rules: TtlRules,
    config: CacheConfig,
    origin: Arc<dyn Origin>,
    observer: Arc<dyn CacheObserver>,
    clock: Clock,
    tables: Mutex<Tables>,
}

impl CacheEngine {
    /// Create an empty engine over `store`.
    ///
    /// Objects already on disk are unknown until [`load_existing`](Self::load_existing).
    pub fn new(
        store: ObjectStore,
        rules: TtlRules,
        config: CacheConfig,
        origin: Arc<dyn Origin>,
    ) -> Self {
        Self {
            store,
            rules,
            config,
            origin,
            observer: Arc::new(NullObserver),
            clock: Box::new(SystemTime::now),
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Report events to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: impl Fn() -> SystemTime + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Register every object found on disk, returning how many were found.
    ///
    /// Contents stay on disk; small objects move into memory on first read.
    pub fn load_existing(&self) -> Result<usize, CacheError> {
        let keys = self.store.scan().map_err(CacheError::Scan)?;
        let now = (self.clock)();
        let mut tables = self.lock();
        for key in &keys {
            tables.entries.entry(key.clone()).or_insert(Entry {
                content: None,
                loaded_at: now,
            });
        }
        tracing::info!(objects = keys.len(), root = %self.store.root().display(), "loaded existing cache");
        Ok(keys.len())
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// TTL rules in effect.
    pub fn rules(&self) -> &TtlRules {
        &self.rules
    }

    /// Number of known keys.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether no key is known.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Number of keys with a fetch in flight.
    pub fn in_flight(&self) -> usize {
        self.lock().busy.len()
    }

    /// Look up `key`, claiming it for population when it is not cached.
    ///
    /// Blocks while another caller holds a reservation for the key, then
    /// checks again: the other fetch may have stored the key or given up.
    pub fn reserve(&self, key: &str) -> Lookup<'_> {
        loop {
            match self.claim(key, true) {
                Claim::Known => {
                    tracing::debug!(key, "cache hit");
                    self.observe(key, CacheEvent::Hit);
                    return Lookup::Hit;
                }
                Claim::Reserved(reservation) => {
                    tracing::debug!(key, "cache miss");
                    self.observe(key, CacheEvent::Miss);
                    return Lookup::Miss(reservation);
                }
                Claim::Busy(gate) => {
                    tracing::debug!(key, "waiting for in-flight fetch");
                    gate.wait();
                }
            }
        }
    }

    /// Start an origin fetch for `key`.
    pub fn fetch_origin(&self, key: &str) -> Result<Fetched, CacheError> {
        match self.origin.fetch(key) {
            Ok(fetched) => {
                tracing::debug!(key, content_length = ?fetched.content_length, "origin responded");
                self.observe(key, CacheEvent::OriginOk);
                Ok(fetched)
            }
            Err(source) => {
                tracing::warn!(key, error = %source, "origin fetch failed");
                self.observe(key, CacheEvent::OriginFailed);
                Err(CacheError::origin(key, source))
            }
        }
    }

    /// Fetch the reserved key from the origin and store it.
    pub fn fill(&self, reservation: Reservation<'_>) -> Result<ObjectMeta, CacheError> {
        let mut fetched = self.fetch_origin(reservation.key())?;
        self.store(reservation, &mut fetched.body, fetched.content_length)
    }

    /// Persist `content` for the reserved key and wake its waiters.
    ///
    /// The object is written to disk first; when its length is at most
    /// `memory_item_size` it is also kept in memory. On failure nothing is
    /// installed and the reservation is released.
    pub fn store(
        &self,
        reservation: Reservation<'_>,
        content: &mut dyn Read,
        content_length: Option<u64>,
    ) -> Result<ObjectMeta, CacheError> {
        let key = reservation.key();
        let limit = self.config.memory_item_size;
        let keep = content_length.is_none_or(|len| len <= limit);
        let mut capture = Capture::new(content, keep.then_some(limit));

        let meta = match self.store.write(key, &mut capture, content_length) {
            Ok(meta) => meta,
            Err(StoreError::Io { source, .. }) if capture.read_failed => {
                return Err(CacheError::origin(key, OriginError::Body(source)));
            }
            Err(err @ StoreError::Incomplete { .. }) => {
                let source = io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string());
                return Err(CacheError::origin(key, OriginError::Body(source)));
            }
            Err(err) => return Err(CacheError::io(key, err)),
        };

        let content = capture
            .into_buffer()
            .filter(|buf| buf.len() as u64 == meta.len)
            .map(Bytes::from);
        tracing::info!(key, bytes = meta.len, in_memory = content.is_some(), "object cached");

        reservation.complete(Some(Entry {
            content,
            loaded_at: meta.modified,
        }));
        Ok(meta)
    }

    /// Return the cached content for `key`, revalidating it first when it is
    /// past its TTL or `force_invalidate` is set.
    ///
    /// Revalidation fetches through the same single-flight reservation as a
    /// miss; a caller that finds one in progress waits for its outcome instead
    /// of fetching again. If the revalidation fails and stale serving is
    /// enabled, the expired copy is returned with [`Served::stale`] set. An
    /// unreadable disk object is fetched again once before the error is
    /// returned.
    pub fn read(&self, key: &str, force_invalidate: bool) -> Result<Served, CacheError> {
        let mut recovered = false;
        let mut validated = false;

        loop {
            if !self.lock().entries.contains_key(key) {
                return Err(CacheError::NotFound(key.to_owned()));
            }

            if !validated {
                let meta = match self.store.metadata(key) {
                    Ok(meta) => meta,
                    Err(source) if recovered => return Err(CacheError::io(key, source)),
                    Err(source) => {
                        recovered = true;
                        validated = self.recover(key, &source)?;
                        continue;
                    }
                };

                let ttl = self.rules.ttl_for(key);
                let age = (self.clock)()
                    .duration_since(meta.modified)
                    .unwrap_or(Duration::ZERO);

                if force_invalidate || is_expired(age, ttl) {
                    tracing::info!(key, ?age, ?ttl, force = force_invalidate, "revalidating cached object");
                    self.observe(key, CacheEvent::Expired);
                    match self.refresh(key) {
                        Ok(Refresh::Fetched) => self.observe(key, CacheEvent::Revalidated),
                        Ok(Refresh::Waited) => {}
                        Ok(Refresh::Abandoned) => {
                            let source = OriginError::Transport(
                                "concurrent revalidation failed".to_owned(),
                            );
                            return self.serve_stale(key, CacheError::origin(key, source));
                        }
                        Err(err) => return self.serve_stale(key, err),
                    }
                    validated = true;
                    continue;
                }
                self.observe(key, CacheEvent::Fresh);
            }

            match self.load(key, false) {
                Ok(served) => return Ok(served),
                Err(source) if recovered => return Err(CacheError::io(key, source)),
                Err(source) => {
                    recovered = true;
                    validated = self.recover(key, &source)?;
                }
            }
        }
    }

    /// Serve the expired copy after a failed revalidation, or return `err`.
    fn serve_stale(&self, key: &str, err: CacheError) -> Result<Served, CacheError> {
        if !self.config.serve_stale_on_error {
            return Err(err);
        }
        tracing::warn!(key, error = %err, "revalidation failed, serving stale content");
        self.observe(key, CacheEvent::StaleServed);
        self.load(key, true)
            .map_err(|source| CacheError::io(key, source))
    }

    fn recover(&self, key: &str, source: &StoreError) -> Result<bool, CacheError> {
        tracing::error!(key, error = %source, "cached object unreadable, fetching again");
        self.observe(key, CacheEvent::Recovered);
        Ok(matches!(
            self.refresh(key)?,
            Refresh::Fetched | Refresh::Waited
        ))
    }

    fn refresh(&self, key: &str) -> Result<Refresh, CacheError> {
        match self.claim(key, false) {
            Claim::Reserved(reservation) => {
                self.fill(reservation)?;
                Ok(Refresh::Fetched)
            }
            Claim::Busy(gate) => {
                tracing::debug!(key, "waiting for in-flight revalidation");
                if gate.wait() {
                    Ok(Refresh::Waited)
                } else {
                    Ok(Refresh::Abandoned)
                }
            }
            Claim::Known => Ok(Refresh::Waited),
        }
    }

    /// Open the content for `key`.
    ///
    /// Length and timestamp always describe the bytes returned: the memory
    /// copy carries its own, and a disk read takes them from the open handle.
    fn load(&self, key: &str, stale: bool) -> Result<Served, StoreError> {
        let entry = self.lock().entries.get(key).cloned();
        let seen = match entry {
            Some(Entry {
                content: Some(bytes),
                loaded_at,
            }) => {
                let len = bytes.len() as u64;
                self.observe(key, CacheEvent::ReadMemory(len));
                return Ok(Served {
                    content: Content::memory(bytes),
                    len,
                    loaded_at,
                    stale,
                });
            }
            Some(entry) => Some(entry.loaded_at),
            None => None,
        };

        let (mut file, meta) = self.store.reader_with_meta(key)?;
        if let Some(seen) = seen
            && meta.len <= self.config.memory_item_size
        {
            let mut buf = Vec::with_capacity(usize::try_from(meta.len).unwrap_or(0));
            file.read_to_end(&mut buf)
                .map_err(|source| StoreError::Io {
                    path: self.store.root().join(key),
                    source,
                })?;
            let bytes = Bytes::from(buf);
            let len = bytes.len() as u64;
            if len == meta.len {
                self.promote(key, seen, bytes.clone(), meta.modified);
            }
            self.observe(key, CacheEvent::ReadFile(len));
            return Ok(Served {
                content: Content::memory(bytes),
                len,
                loaded_at: meta.modified,
                stale,
            });
        }

        self.observe(key, CacheEvent::ReadFile(meta.len));
        Ok(Served {
            content: Content::File(file),
            len: meta.len,
            loaded_at: meta.modified,
            stale,
        })
    }

    /// Attach `bytes` to the entry unless it was replaced since `seen`.
    fn promote(&self, key: &str, seen: SystemTime, bytes: Bytes, modified: SystemTime) {
        let mut tables = self.lock();
        if let Some(entry) = tables.entries.get_mut(key)
            && entry.content.is_none()
            && entry.loaded_at == seen
        {
            tracing::debug!(key, bytes = bytes.len(), "promoted object into memory");
            entry.content = Some(bytes);
            entry.loaded_at = modified;
        }
    }

    fn claim(&self, key: &str, hit_if_known: bool) -> Claim<'_> {
        let mut tables = self.lock();
        if let Some(gate) = tables.busy.get(key) {
            return Claim::Busy(Arc::clone(gate));
        }
        if hit_if_known && tables.entries.contains_key(key) {
            return Claim::Known;
        }
        let gate = Arc::new(Gate::new());
        tables.busy.insert(key.to_owned(), Arc::clone(&gate));
        Claim::Reserved(Reservation {
            engine: self,
            key: key.to_owned(),
            gate: Some(gate),
        })
    }

    fn release(&self, key: &str, gate: &Arc<Gate>, entry: Option<Entry>) {
        let stored = entry.is_some();
        {
            let mut tables = self.lock();
            if let Some(entry) = entry {
                tables.entries.insert(key.to_owned(), entry);
            }
            if tables.busy.get(key).is_some_and(|g| Arc::ptr_eq(g, gate)) {
                tables.busy.remove(key);
            }
        }
        gate.open(stored);
    }

    fn observe(&self, key: &str, event: CacheEvent) {
        self.observer.observe(host_of(key), event);
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An object exactly `ttl` old is still fresh.
fn is_expired(age: Duration, ttl: Duration) -> bool {
    age > ttl
}

/// Reader adapter that keeps a copy of small bodies and remembers whether a
/// failure came from the inner reader rather than from the disk.
struct Capture<'r> {
    inner: &'r mut dyn Read,
    buf: Option<Vec<u8>>,
    limit: u64,
    read_failed: bool,
}

impl<'r> Capture<'r> {
    fn new(inner: &'r mut dyn Read, limit: Option<u64>) -> Self {
        Self {
            inner,
            buf: limit.map(|_| Vec::new()),
            limit: limit.unwrap_or(0),
            read_failed: false,
        }
    }

    fn into_buffer(self) -> Option<Vec<u8>> {
        self.buf
    }
}

impl Read for Capture<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = match self.inner.read(out) {
            Ok(n) => n,
            Err(e) => {
                if e.kind() != io::ErrorKind::Interrupted {
                    self.read_failed = true;
                }
                return Err(e);
            }
        };

        let overflow = self
            .buf
            .as_ref()
            .is_some_and(|buf| (buf.len() + n) as u64 > self.limit);
        if overflow {
            self.buf = None;
        } else if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(&out[..n]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    const KEY: &str = "example.com/pool/pkg.deb";

    struct Counting {
        calls: AtomicUsize,
        body: Mutex<Result<Vec<u8>, u16>>,
        delay: Duration,
    }

    impl Counting {
        fn new(body: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                body: Mutex::new(Ok(body.to_vec())),
                delay: Duration::ZERO,
            })
        }

        fn slow(body: &[u8], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                body: Mutex::new(Ok(body.to_vec())),
                delay,
            })
        }

        fn respond(&self, body: Result<&[u8], u16>) {
            *self.body.lock().unwrap() = body.map(<[u8]>::to_vec);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Origin for Counting {
        fn fetch(&self, _key: &str) -> Result<Fetched, OriginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            match &*self.body.lock().unwrap() {
                Ok(body) => Ok(Fetched::from_bytes(body.clone())),
                Err(status) => Err(OriginError::HttpResponse {
                    status: *status,
                    body: String::new(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, CacheEvent)>>);

    impl CacheObserver for Recorder {
        fn observe(&self, category: &str, event: CacheEvent) {
            self.0.lock().unwrap().push((category.to_owned(), event));
        }
    }

    impl Recorder {
        fn count(&self, wanted: CacheEvent) -> usize {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, e)| *e == wanted)
                .count()
        }
    }

    fn engine(dir: &TempDir, origin: Arc<dyn Origin>, config: CacheConfig) -> CacheEngine {
        let store = ObjectStore::open(dir.path()).unwrap();
        let rules = TtlRules::new(Duration::from_secs(600));
        CacheEngine::new(store, rules, config, origin)
    }

    fn small_memory() -> CacheConfig {
        CacheConfig {
            memory_item_size: 16,
            serve_stale_on_error: true,
        }
    }

    fn populate(engine: &CacheEngine, key: &str, body: &[u8]) -> ObjectMeta {
        let Lookup::Miss(reservation) = engine.reserve(key) else {
            panic!("expected miss for {key}");
        };
        engine
            .store(reservation, &mut &body[..], Some(body.len() as u64))
            .unwrap()
    }

    fn read_all(served: Served) -> Vec<u8> {
        let mut content = served.content;
        let mut out = Vec::new();
        content.read_to_end(&mut out).unwrap();
        out
    }

    fn backdate(engine: &CacheEngine, key: &str, by: Duration) {
        let path = engine.store.path_for(key).unwrap();
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_read_unknown_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Counting::new(b""), CacheConfig::default());

        let err = engine.read(KEY, false).unwrap_err();

        assert!(matches!(err, CacheError::NotFound(ref k) if k == KEY));
    }

    #[test]
    fn test_store_then_read_small_object_from_memory() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Counting::new(b""), small_memory());

        let meta = populate(&engine, KEY, b"tiny");
        let served = engine.read(KEY, false).unwrap();

        assert!(served.content.is_memory());
        assert!(!served.stale);
        assert_eq!(served.len, 4);
        assert_eq!(served.loaded_at, meta.modified);
        assert_eq!(read_all(served), b"tiny");
    }

    #[test]
    fn test_store_then_read_large_object_from_disk() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Counting::new(b""), small_memory());
        let body = vec![7u8; 64];

        populate(&engine, KEY, &body);
        let served = engine.read(KEY, false).unwrap();

        assert!(!served.content.is_memory());
        assert_eq!(served.len, 64);
        assert_eq!(read_all(served), body);
    }

    #[test]
    fn test_unknown_length_body_over_limit_stays_on_disk() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Counting::new(b""), small_memory());
        let body = vec![1u8; 40];

        let Lookup::Miss(reservation) = engine.reserve(KEY) else {
            panic!("expected miss");
        };
        engine.store(reservation, &mut &body[..], None).unwrap();

        assert!(engine.lock().entries[KEY].content.is_none());
        assert_eq!(read_all(engine.read(KEY, false).unwrap()), body);
    }

    #[test]
    fn test_reserve_after_store_is_hit() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Counting::new(b""), CacheConfig::default());

        populate(&engine, KEY, b"data");

        assert!(matches!(engine.reserve(KEY), Lookup::Hit));
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_reserve_grants_single_miss() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Counting::new(b""), CacheConfig::default());
        let barrier = Barrier::new(8);
        let misses = AtomicUsize::new(0);
        let hits = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    match engine.reserve(KEY) {
                        Lookup::Miss(reservation) => {
                            misses.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            engine
                                .store(reservation, &mut &b"payload"[..], Some(7))
                                .unwrap();
                        }
                        Lookup::Hit => {
                            hits.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(read_all(engine.read(KEY, false).unwrap()), b"payload");
                        }
                    }
                });
            }
        });

        assert_eq!(misses.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 7);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_dropped_reservation_hands_over_to_waiter() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Counting::new(b""), CacheConfig::default());

        let Lookup::Miss(first) = engine.reserve(KEY) else {
            panic!("expected miss");
        };

        thread::scope(|s| {
            let waiter = s.spawn(|| matches!(engine.reserve(KEY), Lookup::Miss(_)));
            thread::sleep(Duration::from_millis(30));
            drop(first);
            assert!(waiter.join().unwrap());
        });

        assert_eq!(engine.in_flight(), 0);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_truncated_body_is_origin_error_and_releases_marker() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Counting::new(b""), CacheConfig::default());

        let Lookup::Miss(reservation) = engine.reserve(KEY) else {
            panic!("expected miss");
        };
        let err = engine
            .store(reservation, &mut &b"short"[..], Some(100))
            .unwrap_err();

        assert!(matches!(err, CacheError::Origin { .. }));
        assert_eq!(engine.in_flight(), 0);
        assert!(matches!(engine.read(KEY, false), Err(CacheError::NotFound(_))));
        assert!(matches!(engine.reserve(KEY), Lookup::Miss(_)));
    }

    #[test]
    fn test_failing_body_reader_is_origin_error() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            }
        }

        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Counting::new(b""), CacheConfig::default());

        let Lookup::Miss(reservation) = engine.reserve(KEY) else {
            panic!("expected miss");
        };
        let err = engine.store(reservation, &mut Broken, None).unwrap_err();

        assert!(matches!(
            err,
            CacheError::Origin {
                source: OriginError::Body(_),
                ..
            }
        ));
    }

    #[test]
    fn test_fresh_object_is_not_revalidated() {
        let dir = TempDir::new().unwrap();
        let origin = Counting::new(b"new");
        let engine = engine(&dir, origin.clone(), CacheConfig::default());

        populate(&engine, KEY, b"old");

        assert_eq!(read_all(engine.read(KEY, false).unwrap()), b"old");
        assert_eq!(origin.calls(), 0);
    }

    #[test]
    fn test_ttl_boundary_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let origin = Counting::new(b"new");
        let store = ObjectStore::open(dir.path()).unwrap();
        let writer = CacheEngine::new(
            store.clone(),
            TtlRules::new(Duration::from_secs(60)),
            CacheConfig::default(),
            origin.clone(),
        );
        let meta = populate(&writer, KEY, b"old");

        let at_boundary = CacheEngine::new(
            store.clone(),
            TtlRules::new(Duration::from_secs(60)),
            CacheConfig::default(),
            origin.clone(),
        )
        .with_clock(move || meta.modified + Duration::from_secs(60));
        at_boundary.load_existing().unwrap();
        assert_eq!(read_all(at_boundary.read(KEY, false).unwrap()), b"old");
        assert_eq!(origin.calls(), 0);

        let past_boundary = CacheEngine::new(
            store,
            TtlRules::new(Duration::from_secs(60)),
            CacheConfig::default(),
            origin.clone(),
        )
        .with_clock(move || meta.modified + Duration::from_secs(60) + Duration::from_nanos(1));
        past_boundary.load_existing().unwrap();
        assert_eq!(read_all(past_boundary.read(KEY, false).unwrap()), b"new");
        assert_eq!(origin.calls(), 1);
    }

    #[test]
    fn test_is_expired() {
        let ttl = Duration::from_secs(10);
        assert!(!is_expired(Duration::from_secs(9), ttl));
        assert!(!is_expired(ttl, ttl));
        assert!(is_expired(ttl + Duration::from_nanos(1), ttl));
        assert!(is_expired(Duration::from_nanos(1), Duration::ZERO));
    }

    #[test]
    fn test_expired_object_is_replaced() {
        let dir = TempDir::new().unwrap();
        let origin = Counting::new(b"new");
        let recorder = Arc::new(Recorder::default());
        let engine = engine(&dir, origin.clone(), CacheConfig::default())
            .with_observer(recorder.clone());

        populate(&engine, KEY, b"old");
        backdate(&engine, KEY, Duration::from_secs(3600));

        let served = engine.read(KEY, false).unwrap();

        assert!(!served.stale);
        assert_eq!(read_all(served), b"new");
        assert_eq!(origin.calls(), 1);
        assert_eq!(recorder.count(CacheEvent::Expired), 1);
        assert_eq!(recorder.count(CacheEvent::Revalidated), 1);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_force_invalidate_fetches_fresh_object() {
        let dir = TempDir::new().unwrap();
        let origin = Counting::new(b"forced");
        let engine = engine(&dir, origin.clone(), CacheConfig::default());

        populate(&engine, KEY, b"old");

        assert_eq!(read_all(engine.read(KEY, true).unwrap()), b"forced");
        assert_eq!(origin.calls(), 1);
        assert_eq!(read_all(engine.read(KEY, false).unwrap()), b"forced");
        assert_eq!(origin.calls(), 1);
    }

    #[test]
    fn test_failed_revalidation_serves_stale() {
        let dir = TempDir::new().unwrap();
        let origin = Counting::new(b"");
        origin.respond(Err(503));
        let recorder = Arc::new(Recorder::default());
        let engine = engine(&dir, origin.clone(), CacheConfig::default())
            .with_observer(recorder.clone());

        populate(&engine, KEY, b"old");
        backdate(&engine, KEY, Duration::from_secs(3600));

        let served = engine.read(KEY, false).unwrap();

        assert!(served.stale);
        assert_eq!(read_all(served), b"old");
        assert_eq!(recorder.count(CacheEvent::StaleServed), 1);
        assert_eq!(recorder.count(CacheEvent::OriginFailed), 1);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_failed_revalidation_without_stale_is_error() {
        let dir = TempDir::new().unwrap();
        let origin = Counting::new(b"");
        origin.respond(Err(500));
        let config = CacheConfig {
            serve_stale_on_error: false,
            ..CacheConfig::default()
        };
        let engine = engine(&dir, origin, config);

        populate(&engine, KEY, b"old");
        backdate(&engine, KEY, Duration::from_secs(3600));

        let err = engine.read(KEY, false).unwrap_err();

        assert!(matches!(
            err,
            CacheError::Origin {
                source: OriginError::HttpResponse { status: 500, .. },
                ..
            }
        ));
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_revalidation_fetches_once() {
        let dir = TempDir::new().unwrap();
        let origin = Counting::slow(b"new", Duration::from_millis(50));
        let engine = engine(&dir, origin.clone(), CacheConfig::default());

        populate(&engine, KEY, b"old");
        backdate(&engine, KEY, Duration::from_secs(3600));

        let barrier = Barrier::new(8);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    barrier.wait();
                    assert_eq!(read_all(engine.read(KEY, false).unwrap()), b"new");
                });
            }
        });

        assert_eq!(origin.calls(), 1);
        assert_eq!(engine.in_flight(), 0);
    }

    fn failing_revalidation_under_load(
        serve_stale_on_error: bool,
    ) -> (Arc<Counting>, Vec<Result<Served, CacheError>>) {
        let dir = TempDir::new().unwrap();
        let origin = Counting::slow(b"", Duration::from_millis(100));
        let config = CacheConfig {
            serve_stale_on_error,
            ..CacheConfig::default()
        };
        let engine = engine(&dir, origin.clone(), config);

        populate(&engine, KEY, b"old");
        backdate(&engine, KEY, Duration::from_secs(3600));
        origin.respond(Err(503));

        let barrier = Barrier::new(6);
        let results = thread::scope(|s| {
            let handles: Vec<_> = (0..6)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        engine.read(KEY, false)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(engine.in_flight(), 0);
        (origin, results)
    }

    #[test]
    fn test_failed_concurrent_revalidation_fetches_once_and_serves_stale() {
        let (origin, results) = failing_revalidation_under_load(true);

        assert_eq!(origin.calls(), 1);
        for result in results {
            let served = result.unwrap();
            assert!(served.stale);
            assert_eq!(read_all(served), b"old");
        }
    }

    #[test]
    fn test_failed_concurrent_revalidation_without_stale_fetches_once() {
        let (origin, results) = failing_revalidation_under_load(false);

        assert_eq!(origin.calls(), 1);
        for result in results {
            assert!(matches!(result, Err(CacheError::Origin { .. })));
        }
    }

    #[test]
    fn test_disk_read_reports_length_of_replaced_object() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Counting::new(b""), small_memory());
        populate(&engine, KEY, &[1u8; 40]);

        let replacement = vec![2u8; 64];
        engine
            .store
            .write(KEY, &mut &replacement[..], Some(64))
            .unwrap();
        let served = engine.read(KEY, false).unwrap();

        assert_eq!(served.len, 64);
        assert_eq!(served.loaded_at, engine.store.metadata(KEY).unwrap().modified);
        assert_eq!(read_all(served), replacement);
    }

    #[test]
    fn test_promoted_object_keeps_disk_timestamp() {
        let dir = TempDir::new().unwrap();
        {
            let first = engine(&dir, Counting::new(b""), small_memory());
            populate(&first, KEY, b"small");
        }
        let engine = engine(&dir, Counting::new(b""), small_memory());
        engine.load_existing().unwrap();
        let modified = engine.store.metadata(KEY).unwrap().modified;

        let from_disk = engine.read(KEY, false).unwrap();
        let from_memory = engine.read(KEY, false).unwrap();

        assert!(from_memory.content.is_memory());
        assert_eq!(from_disk.loaded_at, modified);
        assert_eq!(from_memory.loaded_at, modified);
        assert_eq!(from_memory.len, 5);
    }

    #[test]
    fn test_missing_disk_object_is_fetched_again() {
        let dir = TempDir::new().unwrap();
        let origin = Counting::new(b"refetched");
        let recorder = Arc::new(Recorder::default());
        let engine = engine(&dir, origin.clone(), CacheConfig::default())
            .with_observer(recorder.clone());

        populate(&engine, KEY, b"original");
        std::fs::remove_file(engine.store.path_for(KEY).unwrap()).unwrap();

        assert_eq!(read_all(engine.read(KEY, false).unwrap()), b"refetched");
        assert_eq!(origin.calls(), 1);
        assert_eq!(recorder.count(CacheEvent::Recovered), 1);
    }

    #[test]
    fn test_missing_disk_object_with_failing_origin_is_error() {
        let dir = TempDir::new().unwrap();
        let origin = Counting::new(b"");
        origin.respond(Err(404));
        let engine = engine(&dir, origin, CacheConfig::default());

        populate(&engine, KEY, b"original");
        std::fs::remove_file(engine.store.path_for(KEY).unwrap()).unwrap();

        let err = engine.read(KEY, false).unwrap_err();

        assert!(matches!(err, CacheError::Origin { .. }));
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_load_existing_registers_disk_objects() {
        let dir = TempDir::new().unwrap();
        {
            let first = engine(&dir, Counting::new(b""), CacheConfig::default());
            populate(&first, KEY, b"persisted");
            populate(&first, "other.org/a/b", b"second");
        }

        let origin = Counting::new(b"");
        let engine = engine(&dir, origin.clone(), CacheConfig::default());
        assert!(matches!(engine.read(KEY, false), Err(CacheError::NotFound(_))));

        assert_eq!(engine.load_existing().unwrap(), 2);
        assert_eq!(engine.len(), 2);
        assert!(matches!(engine.reserve(KEY), Lookup::Hit));
        assert_eq!(read_all(engine.read(KEY, false).unwrap()), b"persisted");
        assert_eq!(origin.calls(), 0);
    }

    #[test]
    fn test_small_disk_object_promoted_on_read() {
        let dir = TempDir::new().unwrap();
        {
            let first = engine(&dir, Counting::new(b""), small_memory());
            populate(&first, KEY, b"small");
        }

        let recorder = Arc::new(Recorder::default());
        let engine = engine(&dir, Counting::new(b""), small_memory())
            .with_observer(recorder.clone());
        engine.load_existing().unwrap();
        assert!(engine.lock().entries[KEY].content.is_none());

        assert_eq!(read_all(engine.read(KEY, false).unwrap()), b"small");
        assert!(engine.lock().entries[KEY].content.is_some());
        assert_eq!(recorder.count(CacheEvent::ReadFile(5)), 1);

        assert_eq!(read_all(engine.read(KEY, false).unwrap()), b"small");
        assert_eq!(recorder.count(CacheEvent::ReadMemory(5)), 1);
    }

    #[test]
    fn test_events_are_categorised_by_host() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let engine = engine(&dir, Counting::new(b""), CacheConfig::default())
            .with_observer(recorder.clone());

        populate(&engine, KEY, b"x");
        let _ = engine.reserve(KEY);

        let events = recorder.0.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ("example.com".to_owned(), CacheEvent::Miss),
                ("example.com".to_owned(), CacheEvent::Hit),
            ]
        );
    }

    #[test]
    fn test_closure_origin() {
        let dir = TempDir::new().unwrap();
        let origin = |key: &str| -> Result<Fetched, OriginError> {
            Ok(Fetched::from_bytes(key.as_bytes().to_vec()))
        };
        let engine = engine(&dir, Arc::new(origin), CacheConfig::default());

        let Lookup::Miss(reservation) = engine.reserve(KEY) else {
            panic!("expected miss");
        };
        engine.fill(reservation).unwrap();

        assert_eq!(read_all(engine.read(KEY, false).unwrap()), KEY.as_bytes());
    }
}
