//! `pkgproxy serve` command implementation.

use std::path::PathBuf;

use clap::Args;
use pkgproxy_config::{CliSettings, Config};
use pkgproxy_server::{run_server, server_config_from_config};

use crate::error::CliError;
use crate::output::Console;

/// Arguments for the serve command.
#[derive(Args)]
pub(crate) struct ServeArgs {
    /// Path to configuration file (default: ./pkgproxy.yaml when present).
    #[arg(short, long, env = "PKGPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to (overrides config).
    #[arg(short, long)]
    port: Option<u16>,

    /// Cache folder (overrides config).
    #[arg(long)]
    cache_folder: Option<PathBuf>,

    /// Log requests and cache decisions.
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable debug logging (overrides config).
    #[arg(long)]
    pub debug: bool,
}

impl ServeArgs {
    /// Load the configuration with command-line overrides applied.
    pub(crate) fn load_config(&self) -> Result<Config, CliError> {
        let cli_settings = CliSettings {
            host: self.host.clone(),
            port: self.port,
            cache_folder: self.cache_folder.clone(),
            debug: self.debug.then_some(true),
        };
        Ok(Config::load(self.config.as_deref(), Some(&cli_settings))?)
    }

    /// Execute the serve command.
    ///
    /// # Errors
    ///
    /// Returns an error if the TTL rules are invalid or the server fails to start.
    pub(crate) async fn execute(self, config: Config, version: &str) -> Result<(), CliError> {
        let console = Console::stderr();

        console.title(version);
        console.setting("listen", format!("http://{}", config.listen_addr()));
        if let Some(tls) = &config.tls {
            console.setting(
                "listen (tls)",
                format!("https://{}:{}", config.listen_address, tls.port),
            );
            console.setting("certificate", tls.certificate_file.display());
        }
        match &config.metrics_address {
            Some(addr) => console.setting("metrics", format!("http://{addr}/metrics")),
            None => console.setting("metrics", "disabled"),
        }
        console.setting("cache folder", config.cache_dir.display());
        if let Some(path) = &config.config_path {
            console.setting("config file", path.display());
        }
        if let Some(proxy) = &config.proxy {
            console.setting("origin proxy", proxy);
        }

        let server_config = server_config_from_config(&config)?;
        run_server(server_config).await?;

        Ok(())
    }
}
