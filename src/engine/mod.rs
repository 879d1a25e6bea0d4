//! The engine family: one protocol, several connection-multiplexing
//! strategies, selected at startup and compared through the timing log.

pub mod connection;
pub mod iterative;
pub mod multiplex;
pub mod pool;

use crate::config::Config;
use crate::shutdown::Shutdown;
use crate::timing::TimingSink;
use std::io;
use std::str::FromStr;
use tracing::info;

/// Which multiplexing strategy serves connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// One connection at a time over blocking sockets.
    Iterative,
    /// Single thread, readiness-multiplexed over a fixed table.
    Multiplex,
    /// Acceptor event loop plus a pool of worker threads.
    Pool,
    /// Reserved variant; selectable but not implemented yet.
    ThreadPool,
}

impl Engine {
    /// Label used in logs and timing records.
    pub fn label(&self) -> &'static str {
        match self {
            Engine::Iterative => "iterative",
            Engine::Multiplex => "multiplex",
            Engine::Pool => "pool",
            Engine::ThreadPool => "threadpool",
        }
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iterative" => Ok(Engine::Iterative),
            "multiplex" => Ok(Engine::Multiplex),
            "pool" => Ok(Engine::Pool),
            "threadpool" => Ok(Engine::ThreadPool),
            other => Err(format!(
                "unknown engine '{other}' (expected iterative, multiplex, pool, or threadpool)"
            )),
        }
    }
}

/// Run the selected engine until shutdown.
pub fn run(config: &Config, shutdown: &Shutdown, sink: &dyn TimingSink) -> io::Result<()> {
    match config.engine {
        Engine::Iterative => iterative::run(config, shutdown, sink),
        Engine::Multiplex => multiplex::run(config, shutdown, sink),
        Engine::Pool => pool::run(config, shutdown, sink),
        Engine::ThreadPool => {
            info!(engine = "threadpool", "Thread-pool engine is a stub, nothing to run");
            Ok(())
        }
    }
}
