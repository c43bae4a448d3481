//! Request path to cache key.

use crate::error::ServerError;

/// Turn `/host/path/to/file` into the cache key `host/path/to/file`.
///
/// The path is used as received (still percent-encoded) so the key doubles
/// as the origin URL without the scheme.
pub(crate) fn cache_key(path: &str) -> Result<&str, ServerError> {
    let key = path.trim_start_matches('/');
    let reject = |reason| {
        Err(ServerError::InvalidKey {
            path: path.to_owned(),
            reason,
        })
    };

    if key.contains("..") {
        return reject(".. is not allowed");
    }
    if key.ends_with('/') {
        return reject("path must not end with /");
    }
    match key.split_once('/') {
        Some((host, rest)) if !host.is_empty() && !rest.is_empty() => Ok(key),
        _ => reject("expected /<host>/<path>"),
    }
}
