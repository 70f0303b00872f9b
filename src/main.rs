//! ml-forge CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get log_level
    let cli = ml_forge::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > LOG_LEVEL env var > "info"
    let log_filter = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    ml_forge::cli::run_with_cli(cli).await
}
