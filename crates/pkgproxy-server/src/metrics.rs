//! Request and cache counters exposed in OpenMetrics text format.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use pkgproxy_cache::{CacheEvent, CacheObserver};
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Distinct hosts tracked with their own series; the rest share [`OTHER_HOST`].
pub const MAX_TRACKED_HOSTS: usize = 1024;

/// Label for requests to hosts beyond [`MAX_TRACKED_HOSTS`].
pub const OTHER_HOST: &str = "other";

/// Listener a request arrived on.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Protocol {
    Http,
    Https,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProtocolLabels {
    protocol: Protocol,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct HostLabels {
    host: String,
}

/// Process-wide counters, registered under the `pkgproxy` prefix.
pub struct Metrics {
    registry: Registry,
    requests: Family<ProtocolLabels, Counter>,
    host_requests: Family<HostLabels, Counter>,
    tracked_hosts: Mutex<HashSet<String>>,
    cache_hit: Counter,
    cache_miss: Counter,
    cache_too_old: Counter,
    cache_ok: Counter,
    revalidated: Counter,
    stale_served: Counter,
    recovered: Counter,
    remote_ok: Counter,
    remote_errors: Counter,
    read_memory_bytes: Counter,
    read_file_bytes: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create zeroed counters and register them.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("pkgproxy");

        let requests = Family::<ProtocolLabels, Counter>::default();
        registry.register(
            "requests",
            "Requests received by listener protocol",
            requests.clone(),
        );

        let host_requests = Family::<HostLabels, Counter>::default();
        registry.register(
            "host_requests",
            "Requests per origin host",
            host_requests.clone(),
        );

        let mut counter = |name: &str, help: &str| {
            let counter: Counter = Counter::default();
            registry.register(name, help, counter.clone());
            counter
        };
        let cache_hit = counter("cache_hit", "Requests for keys already cached");
        let cache_miss = counter("cache_miss", "Requests that triggered an initial fetch");
        let cache_too_old = counter("cache_too_old", "Reads that found expired content");
        let cache_ok = counter("cache_ok", "Reads that found fresh content");
        let revalidated = counter("cache_revalidated", "Expired objects replaced from the origin");
        let stale_served = counter(
            "cache_stale_served",
            "Expired objects served after a failed revalidation",
        );
        let recovered = counter("cache_recovered", "Unreadable disk objects fetched again");
        let remote_ok = counter("remote_ok", "Successful origin fetches");
        let remote_errors = counter("remote_errors", "Failed origin fetches");
        let read_memory_bytes = counter("cache_read_memory_bytes", "Bytes served from memory");
        let read_file_bytes = counter("cache_read_file_bytes", "Bytes served from disk");

        Self {
            registry,
            requests,
            host_requests,
            tracked_hosts: Mutex::new(HashSet::new()),
            cache_hit,
            cache_miss,
            cache_too_old,
            cache_ok,
            revalidated,
            stale_served,
            recovered,
            remote_ok,
            remote_errors,
            read_memory_bytes,
            read_file_bytes,
        }
    }

    /// Count an accepted request on `protocol`, attributed to `host`.
    ///
    /// Once [`MAX_TRACKED_HOSTS`] hosts have a series, new hosts are counted
    /// under [`OTHER_HOST`].
    pub fn record_request(&self, protocol: Protocol, host: &str) {
        self.requests
            .get_or_create(&ProtocolLabels { protocol })
            .inc();

        let host = {
            let mut tracked = self
                .tracked_hosts
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if tracked.contains(host) {
                host
            } else if tracked.len() < MAX_TRACKED_HOSTS {
                tracked.insert(host.to_owned());
                host
            } else {
                OTHER_HOST
            }
        };
        self.host_requests
            .get_or_create(&HostLabels {
                host: host.to_owned(),
            })
            .inc();
    }

    /// Total requests seen on `protocol`.
    pub fn requests(&self, protocol: Protocol) -> u64 {
        self.requests
            .get_or_create(&ProtocolLabels { protocol })
            .get()
    }

    /// Render all counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder fails to write.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

impl CacheObserver for Metrics {
    fn observe(&self, _category: &str, event: CacheEvent) {
        let (counter, amount) = match event {
            CacheEvent::Hit => (&self.cache_hit, 1),
            CacheEvent::Miss => (&self.cache_miss, 1),
            CacheEvent::Expired => (&self.cache_too_old, 1),
            CacheEvent::Fresh => (&self.cache_ok, 1),
            CacheEvent::Revalidated => (&self.revalidated, 1),
            CacheEvent::StaleServed => (&self.stale_served, 1),
            CacheEvent::Recovered => (&self.recovered, 1),
            CacheEvent::OriginOk => (&self.remote_ok, 1),
            CacheEvent::OriginFailed => (&self.remote_errors, 1),
            CacheEvent::ReadMemory(bytes) => (&self.read_memory_bytes, bytes),
            CacheEvent::ReadFile(bytes) => (&self.read_file_bytes, bytes),
        };
        counter.inc_by(amount);
    }
}
