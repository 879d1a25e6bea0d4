//! Readiness-multiplexed engine: one thread, one poll, a fixed table.
//!
//! Every live socket is registered for readiness; each event runs one
//! handler step on the ready socket. The client table has a fixed
//! capacity and connections beyond it are shed at accept.

use crate::config::Config;
use crate::engine::connection::{FIRST_CLIENT, LISTENER, WAKER};
use crate::handler::{self, Outcome};
use crate::net;
use crate::shutdown::Shutdown;
use crate::timing::TimingSink;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const ENGINE: &str = "multiplex";
const EVENTS_CAPACITY: usize = 64;

/// One slot in the fixed client table.
struct ClientSlot {
    stream: TcpStream,
    opened_at: Instant,
}

/// Bind and serve until shutdown.
pub fn run(config: &Config, shutdown: &Shutdown, sink: &dyn TimingSink) -> io::Result<()> {
    let listener = net::bind_listener(config.socket_addr()?, config.backlog)?;
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    info!(
        addr = %addr,
        max_clients = config.max_clients,
        engine = ENGINE,
        "Listening"
    );
    run_on(TcpListener::from_std(listener), config.max_clients, shutdown, sink)
}

/// Serve an already-bound listener.
pub(crate) fn run_on(
    mut listener: TcpListener,
    max_clients: usize,
    shutdown: &Shutdown,
    sink: &dyn TimingSink,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;
    shutdown.register_waker(Arc::new(Waker::new(poll.registry(), WAKER)?));

    let mut clients: Slab<ClientSlot> = Slab::with_capacity(max_clients);

    while !shutdown.requested() {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            // A signal interrupted the wait; the flag decides at the top.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Poll failed");
                continue;
            }
        }

        for event in events.iter() {
            match event.token() {
                LISTENER => accept_clients(&listener, &mut poll, &mut clients, max_clients),
                WAKER => {}
                Token(raw) => serve_client(raw - FIRST_CLIENT, &mut poll, &mut clients, sink),
            }
        }
    }

    info!(engine = ENGINE, open = clients.len(), "Shut down");
    Ok(())
}

fn accept_clients(
    listener: &TcpListener,
    poll: &mut Poll,
    clients: &mut Slab<ClientSlot>,
    max_clients: usize,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if clients.len() >= max_clients {
                    // Table full: shed the newcomer, keep serving the rest.
                    warn!(peer = %peer, max_clients, "Client table full, dropping connection");
                    continue;
                }

                let key = clients.insert(ClientSlot {
                    stream,
                    opened_at: Instant::now(),
                });

                // Re-borrow after insert
                let slot = &mut clients[key];
                let token = Token(key + FIRST_CLIENT);
                if let Err(e) = poll
                    .registry()
                    .register(&mut slot.stream, token, Interest::READABLE)
                {
                    warn!(peer = %peer, error = %e, "Register failed");
                    clients.remove(key);
                    continue;
                }

                debug!(peer = %peer, slot = key, "Accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                break;
            }
        }
    }
}

fn serve_client(key: usize, poll: &mut Poll, clients: &mut Slab<ClientSlot>, sink: &dyn TimingSink) {
    let slot = match clients.get_mut(key) {
        Some(slot) => slot,
        // Stale event for a slot already freed this iteration.
        None => return,
    };

    match handler::handle_once(&mut slot.stream) {
        Ok(Outcome::Replied(_)) | Ok(Outcome::Idle) => {
            // Re-arm: the edge was consumed by the read, so a payload
            // that arrived during handling must fire a fresh event.
            let token = Token(key + FIRST_CLIENT);
            match poll
                .registry()
                .reregister(&mut slot.stream, token, Interest::READABLE)
            {
                Ok(()) => return,
                Err(e) => warn!(slot = key, error = %e, "Re-register failed"),
            }
        }
        Ok(Outcome::PeerClosed) => {}
        Err(e) => debug!(slot = key, error = %e, "Connection error"),
    }

    if let Some(mut slot) = clients.try_remove(key) {
        let _ = poll.registry().deregister(&mut slot.stream);
        sink.record(ENGINE, "handle_data", slot.opened_at.elapsed());
        debug!(slot = key, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::MemorySink;
    use std::io::{Read, Write};
    use std::net::SocketAddr;
    use std::thread;
    use std::time::Duration;

    fn spawn_engine(
        max_clients: usize,
        shutdown: &Shutdown,
        sink: &Arc<MemorySink>,
    ) -> (SocketAddr, thread::JoinHandle<io::Result<()>>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        let listener = TcpListener::from_std(listener);

        let shutdown = shutdown.clone();
        let sink = Arc::clone(sink);
        let handle =
            thread::spawn(move || run_on(listener, max_clients, &shutdown, sink.as_ref()));
        (addr, handle)
    }

    fn connect(addr: SocketAddr) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    #[test]
    fn test_multiplexes_interleaved_clients() {
        let shutdown = Shutdown::new();
        let sink = Arc::new(MemorySink::new());
        let (addr, engine) = spawn_engine(10, &shutdown, &sink);

        let mut reply = [0u8; 2];

        let mut first = connect(addr);
        first.write_all(b"hello").unwrap();
        first.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply), 5);

        let mut second = connect(addr);
        second.write_all(b"hi").unwrap();
        second.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply), 2);

        // Back to the first client: its slot is still armed.
        first.write_all(b"abc").unwrap();
        first.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply), 3);

        drop(first);
        drop(second);
        assert!(sink.wait_for_records(2, Duration::from_secs(5)));

        shutdown.trigger();
        engine.join().unwrap().unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.engine == "multiplex" && r.operation == "handle_data"));
    }

    #[test]
    fn test_full_payload_then_teardown() {
        let shutdown = Shutdown::new();
        let sink = Arc::new(MemorySink::new());
        let (addr, engine) = spawn_engine(10, &shutdown, &sink);

        let mut client = connect(addr);
        client.write_all(&[9u8; handler::MAX_PAYLOAD]).unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply) as usize, handler::MAX_PAYLOAD);

        drop(client);
        assert!(sink.wait_for_records(1, Duration::from_secs(5)));

        shutdown.trigger();
        engine.join().unwrap().unwrap();
    }

    #[test]
    fn test_full_table_sheds_new_clients() {
        let shutdown = Shutdown::new();
        let sink = Arc::new(MemorySink::new());
        let (addr, engine) = spawn_engine(1, &shutdown, &sink);

        let mut reply = [0u8; 2];

        let mut resident = connect(addr);
        resident.write_all(b"a").unwrap();
        resident.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply), 1);

        // The table is full, so this connection is closed on arrival.
        let mut shed = connect(addr);
        let mut byte = [0u8; 1];
        let shed_closed = matches!(shed.read(&mut byte), Ok(0) | Err(_));
        assert!(shed_closed);

        // The resident connection is untouched.
        resident.write_all(b"ok!").unwrap();
        resident.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply), 3);

        drop(resident);
        assert!(sink.wait_for_records(1, Duration::from_secs(5)));

        shutdown.trigger();
        engine.join().unwrap().unwrap();

        // Only the resident produced a record; the shed one never served.
        assert_eq!(sink.records().len(), 1);
    }
}
