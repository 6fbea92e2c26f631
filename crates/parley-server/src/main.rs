//! # Parley Server
//!
//! Realtime presence and messaging server.
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
//! PARLEY_PORT=8080 PARLEY_AUTH__JWT_SECRET=... parley
//! ```

use anyhow::{bail, Result};
use parley_server::config::Config;
use parley_server::{metrics, run_server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_core=debug,parley_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    run_server(config).await
}

fn load_config() -> Result<Config> {
    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (None, _) => Config::load(),
        (Some("--config"), Some(path)) => Config::from_file(path),
        (Some("--config"), None) => bail!("--config requires a path"),
        (Some(other), _) => bail!("Unknown argument: {other} (usage: parley [--config <path>])"),
    }
}
