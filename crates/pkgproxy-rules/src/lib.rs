//! TTL selection for cache keys.
//!
//! [`TtlRules`] holds three tiers that are consulted in order:
//!
//! 1. Path rules: regular expressions searched (not fully matched) against the
//!    whole key, in declaration order. The first match wins.
//! 2. Host defaults: looked up by the key's first path segment. Exact host
//!    names are checked before patterns; patterns must match the whole host.
//! 3. The global default TTL.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use pkgproxy_rules::TtlRules;
//!
//! let rules = TtlRules::new(Duration::from_secs(60))
//!     .with_rule(r"\.deb$", Duration::from_secs(86400))
//!     .unwrap()
//!     .with_host("deb.debian.org", Duration::from_secs(3600))
//!     .unwrap();
//!
//! assert_eq!(rules.ttl_for("deb.debian.org/pool/a.deb"), Duration::from_secs(86400));
//! assert_eq!(rules.ttl_for("deb.debian.org/dists/InRelease"), Duration::from_secs(3600));
//! assert_eq!(rules.ttl_for("example.com/file"), Duration::from_secs(60));
//! ```

use std::time::Duration;

use regex::Regex;

/// Rule compilation error.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// Pattern is not a valid regular expression.
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern as written in configuration.
        pattern: String,
        /// Regex compilation error.
        source: regex::Error,
    },
}

/// Which tier supplied a TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlSource {
    /// Path rule at the given index.
    Rule(usize),
    /// Host default at the given index.
    Host(usize),
    /// Global default.
    Default,
}

/// A selected TTL together with the tier that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Time-to-live to apply.
    pub ttl: Duration,
    /// Tier the TTL came from.
    pub source: TtlSource,
}

/// Path pattern rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    ttl: Duration,
}

impl Rule {
    /// Pattern source text.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// TTL applied when the pattern matches.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Host default entry.
#[derive(Debug, Clone)]
struct HostRule {
    host: String,
    pattern: Regex,
    ttl: Duration,
}

/// Ordered, immutable TTL rule table.
#[derive(Debug, Clone)]
pub struct TtlRules {
    rules: Vec<Rule>,
    hosts: Vec<HostRule>,
    default_ttl: Duration,
}

impl TtlRules {
    /// Create a table with no rules and the given global default.
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            rules: Vec::new(),
            hosts: Vec::new(),
            default_ttl,
        }
    }

    /// Append a path rule. Rules are evaluated in the order they are added.
    pub fn with_rule(mut self, pattern: &str, ttl: Duration) -> Result<Self, RuleError> {
        self.rules.push(Rule {
            pattern: compile(pattern, pattern)?,
            ttl,
        });
        Ok(self)
    }

    /// Append a host default. `host` is an exact host name or a pattern that
    /// must match the entire host.
    pub fn with_host(mut self, host: &str, ttl: Duration) -> Result<Self, RuleError> {
        let pattern = compile(&format!("^(?:{host})$"), host)?;
        self.hosts.push(HostRule {
            host: host.to_owned(),
            pattern,
            ttl,
        });
        Ok(self)
    }

    /// Global default TTL.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Path rules in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// TTL for `key`.
    pub fn ttl_for(&self, key: &str) -> Duration {
        self.select(key).ttl
    }

    /// TTL for `key` and the tier that supplied it.
    pub fn select(&self, key: &str) -> Selection {
        if let Some(index) = self.rules.iter().position(|r| r.pattern.is_match(key)) {
            return Selection {
                ttl: self.rules[index].ttl,
                source: TtlSource::Rule(index),
            };
        }

        if let Some((index, ttl)) = self.host_ttl(host_of(key)) {
            return Selection {
                ttl,
                source: TtlSource::Host(index),
            };
        }

        Selection {
            ttl: self.default_ttl,
            source: TtlSource::Default,
        }
    }

    /// Host default for `host`, if any entry applies.
    pub fn ttl_for_host(&self, host: &str) -> Option<Duration> {
        self.host_ttl(host).map(|(_, ttl)| ttl)
    }

    fn host_ttl(&self, host: &str) -> Option<(usize, Duration)> {
        if host.is_empty() {
            return None;
        }
        let exact = self.hosts.iter().position(|h| h.host == host);
        let index = exact.or_else(|| self.hosts.iter().position(|h| h.pattern.is_match(host)))?;
        Some((index, self.hosts[index].ttl))
    }
}

/// First path segment of a key, usually the origin host.
///
/// Returns the whole key when it contains no `/`.
pub fn host_of(key: &str) -> &str {
    key.split_once('/').map_or(key, |(host, _)| host)
}

fn compile(expr: &str, original: &str) -> Result<Regex, RuleError> {
    Regex::new(expr).map_err(|source| {
        tracing::debug!(pattern = original, "rejecting invalid TTL pattern");
        RuleError::InvalidPattern {
            pattern: original.to_owned(),
            source,
        }
    })
}
