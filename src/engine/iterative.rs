//! Serial baseline: one connection at a time over blocking sockets.
//!
//! Accept, serve the client to completion, close, repeat. No readiness
//! machinery at all; a second client waits in the listen backlog until
//! the first one is done.

use crate::config::Config;
use crate::handler::{self, Outcome};
use crate::net;
use crate::shutdown::Shutdown;
use crate::timing::TimingSink;
use std::io;
use std::net::TcpListener;
use std::time::Instant;
use tracing::{debug, info, warn};

const ENGINE: &str = "iterative";

/// Bind and serve until shutdown.
pub fn run(config: &Config, shutdown: &Shutdown, sink: &dyn TimingSink) -> io::Result<()> {
    let listener = net::bind_listener(config.socket_addr()?, config.backlog)?;
    let addr = listener.local_addr()?;
    info!(addr = %addr, engine = ENGINE, "Listening");
    run_on(listener, shutdown, sink)
}

/// Serve an already-bound listener.
pub(crate) fn run_on(
    listener: TcpListener,
    shutdown: &Shutdown,
    sink: &dyn TimingSink,
) -> io::Result<()> {
    while !shutdown.requested() {
        let started = Instant::now();

        let (mut stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        debug!(peer = %peer, "Accepted connection");

        // Serve this client to completion before the next accept.
        loop {
            match handler::handle_once(&mut stream) {
                Ok(Outcome::Replied(_)) => continue,
                Ok(Outcome::Idle) => {
                    // A signal interrupted the read; bail out if it was ours.
                    if shutdown.requested() {
                        break;
                    }
                }
                Ok(Outcome::PeerClosed) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Connection error");
                    break;
                }
            }
        }

        sink.record(ENGINE, "handle_connection", started.elapsed());
    }

    info!(engine = ENGINE, "Shut down");
    Ok(())
}
