//! The one protocol every engine speaks.
//!
//! A connection is served in single steps: read one payload of up to
//! [`MAX_PAYLOAD`] bytes, reply with the byte count as a 2-byte
//! big-endian integer. Engines decide when a step runs and when the
//! connection closes; the handler itself keeps no state.

use std::io::{self, ErrorKind, Read, Write};
use tracing::trace;

/// Largest payload counted in one step.
pub const MAX_PAYLOAD: usize = 1023;

/// What one protocol step observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A payload of this many bytes was counted and acknowledged.
    Replied(usize),
    /// The peer closed its end; nothing was read.
    PeerClosed,
    /// Readiness was spurious; try again on the next event.
    Idle,
}

/// Run one protocol step: read once, reply with the byte count.
///
/// The count is truncated to 16 bits and sent in network byte order,
/// so a client applying the same byte swap reads it back unchanged.
/// Write failures are connection errors: a peer that cannot absorb a
/// 2-byte reply is not draining its socket.
pub fn handle_once<S: Read + Write>(stream: &mut S) -> io::Result<Outcome> {
    let mut buf = [0u8; MAX_PAYLOAD];

    let n = match stream.read(&mut buf) {
        Ok(0) => return Ok(Outcome::PeerClosed),
        Ok(n) => n,
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
            return Ok(Outcome::Idle);
        }
        Err(e) => return Err(e),
    };

    stream.write_all(&(n as u16).to_be_bytes())?;
    trace!(bytes = n, "Acknowledged payload");
    Ok(Outcome::Replied(n))
}
