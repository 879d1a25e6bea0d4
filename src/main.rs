//! tallyd: comparative TCP server architectures over one tiny protocol.
//!
//! Every engine speaks the same wire exchange: read one client payload,
//! reply with its byte count as a 2-byte big-endian integer. What varies
//! is how concurrent connections are multiplexed:
//! - iterative: one connection at a time over blocking sockets
//! - multiplex: single-threaded readiness multiplexing, fixed table
//! - pool: acceptor event loop handing connections to worker threads
//! - threadpool: reserved stub
//!
//! Per-connection service times land in a CSV file so runs of the
//! different engines can be compared.

mod config;
mod engine;
mod handler;
mod net;
mod shutdown;
mod timing;

use config::Config;
use shutdown::Shutdown;
use timing::CsvSink;
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
        engine = config.engine.label(),
        host = %config.host,
        port = config.port,
        workers = config.workers,
        max_clients = config.max_clients,
        csv = %config.csv.display(),
        "Starting tallyd"
    );

    let shutdown = Shutdown::new();
    shutdown.install_sigint()?;

    let sink = CsvSink::open(&config.csv, config.truncate_csv)?;

    engine::run(&config, &shutdown, &sink)?;

    info!("Shutdown complete");
    Ok(())
}
