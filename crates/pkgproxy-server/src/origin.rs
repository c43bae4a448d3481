//! Origin fetcher over HTTP(S).

use std::time::{Duration, Instant};

use pkgproxy_cache::{Fetched, Origin, OriginError};
use ureq::Agent;
use ureq::http::header::CONTENT_LENGTH;

/// Fetches `{scheme}://{key}` with a shared, pooled agent.
pub struct HttpOrigin {
    agent: Agent,
    scheme: String,
}

impl HttpOrigin {
    /// Create the origin client.
    ///
    /// `timeout` bounds a whole request including the body. `proxy` is an
    /// `http://` or `https://` proxy URL.
    pub fn new(scheme: &str, timeout: Duration, proxy: Option<&str>) -> Result<Self, OriginError> {
        let proxy = proxy
            .map(ureq::Proxy::new)
            .transpose()
            .map_err(|e| OriginError::Transport(format!("invalid proxy: {e}")))?;

        let agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .proxy(proxy)
            .build()
            .into();

        Ok(Self {
            agent,
            scheme: scheme.to_owned(),
        })
    }

    /// Origin URL for a cache key.
    pub fn url_for(&self, key: &str) -> String {
        format!("{}://{key}", self.scheme)
    }
}

impl Origin for HttpOrigin {
    fn fetch(&self, key: &str) -> Result<Fetched, OriginError> {
        let url = self.url_for(key);
        let started = Instant::now();

        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| OriginError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        tracing::debug!(%url, status, elapsed = ?started.elapsed(), "origin answered");

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let mut body = response.into_body();

        if status != 200 {
            let body = body
                .read_to_string()
                .unwrap_or_else(|_| String::from("(unable to read error body)"));
            return Err(OriginError::HttpResponse { status, body });
        }

        Ok(Fetched::new(body.into_reader(), content_length))
    }
}
