//! Observability hook.

/// Something worth counting happened for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    /// `reserve` found the key already cached.
    Hit,
    /// `reserve` handed out a fetch reservation.
    Miss,
    /// Cached object is within its TTL.
    Fresh,
    /// Cached object is past its TTL (or invalidation was forced).
    Expired,
    /// Expired object was replaced by a fresh copy.
    Revalidated,
    /// Revalidation failed and the expired copy was served.
    StaleServed,
    /// Disk object was unreadable and had to be fetched again.
    Recovered,
    /// Origin answered successfully.
    OriginOk,
    /// Origin fetch failed.
    OriginFailed,
    /// Bytes served from the in-memory tier.
    ReadMemory(u64),
    /// Bytes served from disk.
    ReadFile(u64),
}

/// Receives cache events.
///
/// `category` is the key's first path segment (normally the origin host).
/// Implementations must be cheap: they run on the request path.
pub trait CacheObserver: Send + Sync {
    /// Record `event` for a key in `category`.
    fn observe(&self, category: &str, event: CacheEvent);
}

/// [`CacheObserver`] that discards every event.
pub struct NullObserver;

impl CacheObserver for NullObserver {
    fn observe(&self, _category: &str, _event: CacheEvent) {}
}
