//! chat-relay: a line-oriented chat relay server
//!
//! Clients connect over TCP, send a display name as their first line, then
//! exchange messages:
//! - `<text>` is broadcast to every registered client
//! - `@<name> <text>` is whispered to one client
//!
//! Features:
//! - Single-threaded readiness loop (mio) or coordinator task (tokio)
//! - Fixed connection capacity with immediate rejection when full
//! - Line reassembly across fragmented and fused TCP reads
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        runtime = ?config.runtime,
        max_clients = config.max_clients,
        overflow = ?config.overflow,
        "Starting chat-relay server"
    );

    runtime::run(config)?;
    Ok(())
}
