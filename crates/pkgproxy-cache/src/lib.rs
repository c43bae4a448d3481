//! Cache engine for pkgproxy.
//!
//! [`CacheEngine`] keeps every cached object on disk (through
//! [`pkgproxy_store::ObjectStore`]) and small objects in memory as well. It
//! guarantees that at most one origin fetch per key is in flight:
//!
//! 1. [`CacheEngine::reserve`] returns [`Lookup::Hit`] for a known key, or
//!    [`Lookup::Miss`] carrying a [`Reservation`]. Other callers for the same
//!    key block until the reservation is stored or dropped.
//! 2. The reservation holder fetches the content (usually via
//!    [`CacheEngine::fetch_origin`]) and hands it to [`CacheEngine::store`].
//! 3. [`CacheEngine::read`] serves the content, revalidating it against the
//!    origin once it is older than the TTL chosen by
//!    [`pkgproxy_rules::TtlRules`].
//!
//! # Example
//!
//! ```
//! use std::io::Read;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use pkgproxy_cache::{CacheConfig, CacheEngine, Fetched, Lookup, OriginError};
//! use pkgproxy_rules::TtlRules;
//! use pkgproxy_store::ObjectStore;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let origin = |_key: &str| -> Result<Fetched, OriginError> {
//!     Ok(Fetched::from_bytes(b"package".to_vec()))
//! };
//! let engine = CacheEngine::new(
//!     ObjectStore::open(dir.path()).unwrap(),
//!     TtlRules::new(Duration::from_secs(600)),
//!     CacheConfig::default(),
//!     Arc::new(origin),
//! );
//!
//! if let Lookup::Miss(reservation) = engine.reserve("example.com/pkg") {
//!     engine.fill(reservation).unwrap();
//! }
//!
//! let mut body = String::new();
//! engine
//!     .read("example.com/pkg", false)
//!     .unwrap()
//!     .content
//!     .read_to_string(&mut body)
//!     .unwrap();
//! assert_eq!(body, "package");
//! ```

mod content;
mod engine;
mod error;
mod gate;
mod observer;
mod origin;

pub use content::{Content, Served};
pub use engine::{CacheConfig, CacheEngine, DEFAULT_MEMORY_ITEM_SIZE, Lookup, Reservation};
pub use error::{CacheError, OriginError};
pub use observer::{CacheEvent, CacheObserver, NullObserver};
pub use origin::{Fetched, Origin};
