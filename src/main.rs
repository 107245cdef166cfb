//! name-relay: a username-addressed TCP message relay
//!
//! Clients connect, announce a username in a fixed-width handshake, and
//! then exchange frames:
//! - Keepalive frames hold the connection open
//! - Content frames are forwarded unchanged to every connected client
//!   registered under the recipient name embedded in the payload
//!
//! Features:
//! - Stream resynchronization on misaligned input
//! - Per-address connection ceiling
//! - Idle and write deadlines per connection
//! - Per-address throughput reporting
//! - Configuration via CLI arguments or TOML file

mod admission;
mod config;
mod connection;
mod error;
mod forward;
mod metrics;
mod protocol;
mod registry;
mod server;
mod throughput;

use config::Config;
use server::Server;
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
        workers = config.worker_threads(),
        max_connections_per_address = config.max_connections_per_address,
        max_content_size = config.max_content_size,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Starting name-relay server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::bind(config)?;
        server.run().await
    })?;

    Ok(())
}
