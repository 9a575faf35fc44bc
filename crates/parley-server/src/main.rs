//! # Parley Server
//!
//! Real-time presence and message relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with custom config
//! parley --config /path/to/parley.toml
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 parley
//! ```

use anyhow::Result;
use clap::Parser;
use parley_server::{metrics, run_server, Config};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parley presence and message relay server.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Real-time presence and message relay")]
struct Cli {
    /// Path to a TOML config file. Defaults to the first of `parley.toml`,
    /// `/etc/parley/parley.toml` and `~/.config/parley/parley.toml` that exists.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load_from(cli.config)?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    run_server(config).await?;

    tracing::info!("Parley server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_flag() {
        let cli = Cli::try_parse_from(["parley"]).unwrap();
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["parley", "--config", "/tmp/parley.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/parley.toml")));

        let cli = Cli::try_parse_from(["parley", "--config=custom.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));

        assert!(Cli::try_parse_from(["parley", "--config"]).is_err());
        assert!(Cli::try_parse_from(["parley", "--bogus"]).is_err());
    }
}
