//! HTTP request handlers.

pub(crate) mod metrics;
pub(crate) mod proxy;
