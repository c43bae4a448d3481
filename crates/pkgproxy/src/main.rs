//! pkgproxy CLI - caching reverse proxy for package repositories.
//!
//! Provides commands for:
//! - `serve`: Start the proxy

mod commands;
mod error;
mod output;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::ServeArgs;
use output::Console;

/// Application version from Cargo.toml.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// pkgproxy - caching reverse proxy for package repositories.
#[derive(Parser)]
#[command(name = "pkgproxy", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server.
    Serve(ServeArgs),
}

fn main() {
    let cli = Cli::parse();
    let console = Console::stderr();

    let Commands::Serve(args) = cli.command;

    // Config is loaded before tracing so its `debug` flag can pick the level
    let config = match args.load_config() {
        Ok(config) => config,
        Err(err) => {
            console.failure(&err);
            std::process::exit(1);
        }
    };

    // --debug (or `debug: true`) enables DEBUG, --verbose enables INFO,
    // otherwise use RUST_LOG or default to WARN
    let filter = if config.debug {
        EnvFilter::new("debug")
    } else if args.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(args.execute(config, VERSION)),
        Err(err) => Err(err.into()),
    };

    if let Err(err) = result {
        console.failure(&err);
        std::process::exit(1);
    }
}
