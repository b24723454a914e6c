//! edge-echo: a TCP echo server on a shared readiness multiplexer.
//!
//! Every byte a peer sends is written straight back on the same connection.
//! A fixed pool of worker threads waits on one epoll instance:
//! - the listener is drained until accept would block
//! - connections are edge-triggered and drained until read would block
//! - unsent echo bytes are queued and flushed on writable readiness
//! - teardown (deregister + close) happens exactly once per connection
//!
//! Configuration via CLI arguments or an optional TOML file.

mod config;
mod runtime;

use config::Config;
use tracing::{error, info};
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
        host = %config.host,
        port = config.port,
        workers = config.workers,
        max_pending = config.max_pending,
        max_events = config.max_events,
        "Starting edge-echo server"
    );

    if let Err(e) = runtime::run(config) {
        error!(error = %e, "Server stopped");
        return Err(e.into());
    }
    Ok(())
}
