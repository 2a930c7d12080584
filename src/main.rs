//! WebSocket Room Relay - Entry Point
//!
//! Starts the relay on the address given as the first argument.

use std::env;

use tracing::info;
use tracing_subscriber::EnvFilter;

use wsrooms::{Config, CookieReader, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=wsrooms=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wsrooms=info")),
        )
        .init();

    // Get bind address from command line or use default
    let mut config = Config::default();
    if let Some(addr) = env::args().nth(1) {
        config = config.with_addr(addr);
    }

    info!(
        "Default room '{}', ping every {:?}",
        config.default_room, config.ping_period
    );

    Server::new(config)
        .with_session_reader(CookieReader)
        .run()
        .await?;

    Ok(())
}
