//! flowgrindd: measurement daemon for flowgrind TCP tests
//!
//! Clients connect on the control port, propose a test, and get a freshly
//! bound data socket back. Each session then exchanges timestamped
//! blocks under the timing the client asked for, echoing a reply block
//! with the inter-arrival time for every block received.
//!
//! Features:
//! - Host/subnet access control on control connections
//! - One isolated worker per session
//! - Configuration via CLI arguments or TOML file

mod acl;
mod config;
mod error;
mod protocol;
mod server;
mod session;
mod tcp_test;

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
        .with_writer(std::io::stderr)
        .init();

    info!(
        listen = %config.listen,
        poll_interval_ms = config.session.poll_interval.as_millis() as u64,
        handshake_timeout = ?config.session.handshake_timeout,
        max_block_size = config.session.max_block_size,
        "Starting flowgrindd"
    );

    if config.acl.is_empty() {
        info!("No access list configured, serving every host");
    }
    for entry in config.acl.iter() {
        info!(entry = %entry, "Allowing host");
    }

    let server = Server::bind(&config)?;
    server.run()?;
    Ok(())
}
