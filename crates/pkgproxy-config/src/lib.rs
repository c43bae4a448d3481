//! Configuration management for pkgproxy.
//!
//! Parses `pkgproxy.yaml` with serde. Durations are human-readable strings
//! (`90s`, `10m`, `30d`). CLI settings can be applied during load via
//! [`CliSettings`].
//!
//! ## Environment Variable Expansion
//!
//! - `${VAR}` - expands to the value of VAR, errors if unset
//! - `${VAR:-default}` - expands to VAR if set, otherwise uses default
//!
//! Expanded fields:
//! - `cache_folder`
//! - `proxy`

mod expand;

use std::path::{Path, PathBuf};
use std::time::Duration;

use pkgproxy_rules::TtlRules;
use serde::Deserialize;

/// CLI settings that override configuration file values.
///
/// All fields are optional. Only non-None values override the loaded config.
#[derive(Debug, Default)]
pub struct CliSettings {
    /// Override listen address.
    pub host: Option<String>,
    /// Override listen port.
    pub port: Option<u16>,
    /// Override cache folder.
    pub cache_folder: Option<PathBuf>,
    /// Override debug flag.
    pub debug: Option<bool>,
}

/// Configuration filename looked up in the current directory.
pub const CONFIG_FILENAME: &str = "pkgproxy.yaml";

const DEFAULT_CACHE_FOLDER: &str = "./cache";

/// Per-host default TTL.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostTtl {
    /// Hostname or regular expression matched against the whole hostname.
    pub host: String,
    /// TTL for keys on matching hosts.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

/// Path-pattern TTL rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuleTtl {
    /// Regular expression searched for in the cache key.
    pub pattern: String,
    /// TTL for matching keys.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

/// HTTPS listener.
///
/// Served on `listen_address` next to the plain listener. Certificate and
/// key paths are resolved relative to the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsConfig {
    /// HTTPS port.
    pub port: u16,
    /// PEM certificate chain.
    pub certificate_file: PathBuf,
    /// PEM private key.
    pub private_key: PathBuf,
}

/// Application configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Proxy listen address.
    pub listen_address: String,
    /// Proxy listen port.
    pub listen_port: u16,
    /// Optional HTTPS listener.
    pub tls: Option<TlsConfig>,
    /// Metrics listener (`host:port`); `null` disables it.
    pub metrics_address: Option<String>,
    /// Origin request timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Cache folder as written in the file (relative to the file).
    cache_folder: String,
    /// Outbound HTTP proxy for origin requests.
    pub proxy: Option<String>,
    /// Scheme used to turn keys into origin URLs.
    pub upstream_scheme: String,
    /// Enable debug logging.
    pub debug: bool,
    /// Default TTL when no rule or host entry matches.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Objects up to this many bytes are also kept in memory.
    pub memory_item_size: u64,
    /// Serve expired content when the origin cannot be reached.
    pub serve_stale_on_error: bool,
    /// Ordered per-host TTLs.
    pub hosts: Vec<HostTtl>,
    /// Ordered path-pattern TTLs; they win over host entries.
    pub rules: Vec<RuleTtl>,

    /// Resolved cache directory (set after loading).
    #[serde(skip)]
    pub cache_dir: PathBuf,
    /// Path to the config file (set after loading).
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::default_with_base(Path::new("."))
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File not found.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// Validation error.
    #[error("Configuration error: {0}")]
    Validation(String),
    /// Environment variable error during expansion.
    #[error("Environment variable error in {field}: {message}")]
    EnvVar {
        /// Config field (e.g., "`proxy`").
        field: String,
        /// Error message (e.g., "${`PROXY_HOST`}: environment variable not found").
        message: String,
    },
}

/// Require a string field to be non-empty.
fn require_non_empty(value: &str, field: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Require a URL field to use http:// or https:// scheme.
fn require_http_url(url: &str, field: &str) -> Result<(), ConfigError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from file with optional CLI settings.
    ///
    /// If `config_path` is provided, loads from that file. Otherwise uses
    /// `pkgproxy.yaml` from the current directory when present, and defaults
    /// when not.
    ///
    /// CLI settings are applied after loading and path resolution; the result
    /// is validated last.
    ///
    /// # Errors
    ///
    /// Returns error if explicit `config_path` doesn't exist, parsing fails,
    /// or validation fails.
    pub fn load(
        config_path: Option<&Path>,
        cli_settings: Option<&CliSettings>,
    ) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Self::load_from_file(path)?
        } else {
            let cwd = std::env::current_dir()?;
            let candidate = cwd.join(CONFIG_FILENAME);
            if candidate.exists() {
                Self::load_from_file(&candidate)?
            } else {
                Self::default_with_base(&cwd)
            }
        };

        if let Some(settings) = cli_settings {
            config.apply_cli_settings(settings);
        }

        config.validate()?;
        Ok(config)
    }

    /// `listen_address:listen_port`.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }

    /// Build the TTL rule set described by `cache_ttl`, `hosts` and `rules`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the first pattern that does
    /// not compile.
    pub fn ttl_rules(&self) -> Result<TtlRules, ConfigError> {
        let mut rules = TtlRules::new(self.cache_ttl);
        for (index, host) in self.hosts.iter().enumerate() {
            rules = rules
                .with_host(&host.host, host.ttl)
                .map_err(|e| ConfigError::Validation(format!("hosts[{index}].host: {e}")))?;
        }
        for (index, rule) in self.rules.iter().enumerate() {
            rules = rules
                .with_rule(&rule.pattern, rule.ttl)
                .map_err(|e| ConfigError::Validation(format!("rules[{index}].pattern: {e}")))?;
        }
        Ok(rules)
    }

    /// Apply CLI settings to the configuration.
    fn apply_cli_settings(&mut self, settings: &CliSettings) {
        if let Some(host) = &settings.host {
            self.listen_address.clone_from(host);
        }
        if let Some(port) = settings.port {
            self.listen_port = port;
        }
        if let Some(cache_folder) = &settings.cache_folder {
            self.cache_dir.clone_from(cache_folder);
        }
        if let Some(debug) = settings.debug {
            self.debug = debug;
        }
    }

    /// Create default config with paths relative to given base directory.
    fn default_with_base(base: &Path) -> Self {
        Self {
            listen_address: "127.0.0.1".to_owned(),
            listen_port: 8080,
            tls: None,
            metrics_address: Some("127.0.0.1:2112".to_owned()),
            timeout: Duration::from_secs(120),
            cache_folder: DEFAULT_CACHE_FOLDER.to_owned(),
            proxy: None,
            upstream_scheme: "https".to_owned(),
            debug: false,
            cache_ttl: Duration::from_secs(600),
            memory_item_size: 5 * 1024 * 1024,
            serve_stale_on_error: true,
            hosts: Vec::new(),
            rules: Vec::new(),
            cache_dir: base.join(DEFAULT_CACHE_FOLDER),
            config_path: None,
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content)?
        };

        // Expand environment variables before path resolution
        config.expand_env_vars()?;

        let config_dir = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(config_dir)?;
        config.config_path = Some(path.to_path_buf());

        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// Called automatically by [`Config::load`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if any validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_listener()?;
        self.validate_upstream()?;
        self.ttl_rules()?;
        Ok(())
    }

    fn validate_listener(&self) -> Result<(), ConfigError> {
        require_non_empty(&self.listen_address, "listen_address")?;
        if self.listen_port == 0 {
            return Err(ConfigError::Validation(
                "listen_port cannot be 0".to_owned(),
            ));
        }
        if let Some(ref metrics) = self.metrics_address {
            require_non_empty(metrics, "metrics_address")?;
        }
        if let Some(ref tls) = self.tls {
            if tls.port == 0 {
                return Err(ConfigError::Validation("tls.port cannot be 0".to_owned()));
            }
            if tls.port == self.listen_port {
                return Err(ConfigError::Validation(format!(
                    "tls.port {} is already used by listen_port",
                    tls.port
                )));
            }
            if tls.certificate_file.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "tls.certificate_file cannot be empty".to_owned(),
                ));
            }
            if tls.private_key.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "tls.private_key cannot be empty".to_owned(),
                ));
            }
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "cache_folder cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }

    fn validate_upstream(&self) -> Result<(), ConfigError> {
        if !matches!(self.upstream_scheme.as_str(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "upstream_scheme must be http or https, got '{}'",
                self.upstream_scheme
            )));
        }
        if let Some(ref proxy) = self.proxy {
            require_non_empty(proxy, "proxy")?;
            require_http_url(proxy, "proxy")?;
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Validation(
                "timeout must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }

    /// Expand environment variable references in configuration strings.
    fn expand_env_vars(&mut self) -> Result<(), ConfigError> {
        self.cache_folder = expand::expand_env(&self.cache_folder, "cache_folder")?;
        if let Some(ref proxy) = self.proxy {
            self.proxy = Some(expand::expand_env(proxy, "proxy")?);
        }
        Ok(())
    }

    /// Resolve the cache folder and TLS files against the config file directory.
    fn resolve_paths(&mut self, config_dir: &Path) -> Result<(), ConfigError> {
        require_non_empty(&self.cache_folder, "cache_folder")?;
        self.cache_dir = config_dir.join(&self.cache_folder);
        if let Some(tls) = self.tls.as_mut() {
            tls.certificate_file = config_dir.join(&tls.certificate_file);
            tls.private_key = config_dir.join(&tls.private_key);
        }
        Ok(())
    }
}
