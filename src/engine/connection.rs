//! Connection table and token scheme for the event-loop engines.
//!
//! Tokens 0 and 1 are reserved for the listener and the revival waker;
//! client tokens count up from 2 and are never reused, so a stale
//! readiness event cannot alias a newer connection. The table is an
//! ordered list: removal shifts later entries down and the backing
//! storage always matches the live count exactly.

use mio::net::TcpStream;
use mio::Token;
use std::time::Instant;

/// Listener readiness sentinel.
pub const LISTENER: Token = Token(0);
/// Revival-notification sentinel.
pub const WAKER: Token = Token(1);
/// First token handed to a client connection.
pub const FIRST_CLIENT: usize = 2;

/// Who may act on a connection right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered for readiness; the acceptor owns the stream.
    Armed,
    /// On loan to a worker; no readiness events are delivered.
    InFlight,
    /// Finished; swept out at the end of the iteration.
    Closed,
}

/// One tracked connection.
pub struct Entry {
    pub token: Token,
    pub state: ConnState,
    /// Present while the acceptor holds the stream, taken for handoff.
    pub stream: Option<TcpStream>,
    pub opened_at: Instant,
}

/// Ordered connection table.
pub struct EntryList {
    entries: Vec<Entry>,
    next_token: usize,
}

impl EntryList {
    pub fn new() -> Self {
        EntryList {
            entries: Vec::new(),
            next_token: FIRST_CLIENT,
        }
    }

    /// Admit a connection, growing storage by exactly one slot.
    pub fn push(&mut self, stream: TcpStream) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.entries.reserve_exact(1);
        self.entries.push(Entry {
            token,
            state: ConnState::Armed,
            stream: Some(stream),
            opened_at: Instant::now(),
        });
        token
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|entry| entry.token == token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every closed entry, preserving the order of the rest.
    ///
    /// Returns the removed entries so the caller can deregister, time,
    /// and drop them. Storage shrinks to the remaining count and is
    /// released entirely when the table empties.
    pub fn sweep_closed(&mut self) -> Vec<Entry> {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].state == ConnState::Closed {
                removed.push(self.entries.remove(index));
            } else {
                index += 1;
            }
        }

        if !removed.is_empty() {
            self.entries.shrink_to_fit();
        }
        removed
    }
}
