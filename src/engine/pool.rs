//! Worker-pool engine: an acceptor event loop feeding live connections
//! to a fixed pool of worker threads.
//!
//! The acceptor owns the listener, the poll registry, and the
//! connection table. A connection that turns readable is disarmed and
//! sent through a bounded channel to exactly one worker, which runs a
//! single handler step and sends the connection back on the revival
//! channel, waking the acceptor. The acceptor re-arms or closes.
//! Workers never touch the registry and never close sockets.

use crate::config::Config;
use crate::engine::connection::{ConnState, EntryList, LISTENER, WAKER};
use crate::handler::{self, Outcome};
use crate::net;
use crate::shutdown::Shutdown;
use crate::timing::TimingSink;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

const ENGINE: &str = "pool";
const EVENTS_CAPACITY: usize = 64;

/// A connection on loan to a worker.
struct Handoff {
    token: Token,
    stream: TcpStream,
}

/// A connection coming back from a worker.
struct Revival {
    token: Token,
    stream: TcpStream,
    closed: bool,
}

/// Bind and serve until shutdown.
pub fn run(config: &Config, shutdown: &Shutdown, sink: &dyn TimingSink) -> io::Result<()> {
    let workers = if config.workers == 0 {
        default_workers()
    } else {
        config.workers
    };
    let addr = config.socket_addr()?;
    let backlog = config.backlog;

    serve(
        move || net::bind_listener(addr, backlog),
        workers,
        shutdown,
        sink,
    )
}

/// Serve an already-bound listener.
#[allow(dead_code)]
pub(crate) fn run_on(
    listener: std::net::TcpListener,
    workers: usize,
    shutdown: &Shutdown,
    sink: &dyn TimingSink,
) -> io::Result<()> {
    serve(move || Ok(listener), workers, shutdown, sink)
}

/// Bring up the pool, then the listener, then run the acceptor loop.
///
/// The bind is deferred so the workers exist before the first
/// connection can possibly arrive; a failed bind tears the pool back
/// down and leaves nothing running.
fn serve<F>(bind: F, workers: usize, shutdown: &Shutdown, sink: &dyn TimingSink) -> io::Result<()>
where
    F: FnOnce() -> io::Result<std::net::TcpListener>,
{
    let (handoff_tx, handoff_rx) = bounded::<Handoff>(workers);
    let (revival_tx, revival_rx) = unbounded::<Revival>();

    let mut poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
    shutdown.register_waker(Arc::clone(&waker));

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let handoff_rx = handoff_rx.clone();
        let revival_tx = revival_tx.clone();
        let worker_waker = Arc::clone(&waker);
        let worker_shutdown = shutdown.clone();

        let spawned = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                worker_loop(worker_id, handoff_rx, revival_tx, worker_waker, worker_shutdown)
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => return fail_startup(shutdown, handoff_tx, handles, e),
        }
    }
    drop(handoff_rx);
    drop(revival_tx);

    info!(workers, engine = ENGINE, "Worker pool started");

    let listener = match bind().and_then(|listener| {
        listener.set_nonblocking(true)?;
        Ok(listener)
    }) {
        Ok(listener) => {
            if let Ok(addr) = listener.local_addr() {
                info!(addr = %addr, engine = ENGINE, "Listening");
            }
            listener
        }
        Err(e) => {
            error!(error = %e, "Listener setup failed");
            return fail_startup(shutdown, handoff_tx, handles, e);
        }
    };

    let mut listener = TcpListener::from_std(listener);
    if let Err(e) = poll
        .registry()
        .register(&mut listener, LISTENER, Interest::READABLE)
    {
        return fail_startup(shutdown, handoff_tx, handles, e);
    }

    let result = accept_loop(&listener, &mut poll, &handoff_tx, &revival_rx, shutdown, sink);

    // Teardown order: release the pool first, the listener last.
    drop(handoff_tx);
    join_workers(handles);
    drop(listener);

    result
}

/// Startup failed after workers were spawned: unwind them and report.
fn fail_startup(
    shutdown: &Shutdown,
    handoff_tx: Sender<Handoff>,
    handles: Vec<JoinHandle<()>>,
    e: io::Error,
) -> io::Result<()> {
    shutdown.trigger();
    drop(handoff_tx);
    join_workers(handles);
    Err(e)
}

fn join_workers(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let name = handle.thread().name().unwrap_or("worker-?").to_string();
        if handle.join().is_err() {
            error!(worker = %name, "Worker panicked");
        }
    }
}

fn accept_loop(
    listener: &TcpListener,
    poll: &mut Poll,
    handoff_tx: &Sender<Handoff>,
    revival_rx: &Receiver<Revival>,
    shutdown: &Shutdown,
    sink: &dyn TimingSink,
) -> io::Result<()> {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    let mut entries = EntryList::new();

    while !shutdown.requested() {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            // A signal interrupted the wait; the flag decides at the top.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "Poll failed");
                break;
            }
        }

        // Sentinels first: new connections and revivals are admitted
        // before client readiness is dispatched.
        let mut accept_ready = false;
        let mut revive_ready = false;
        for event in events.iter() {
            match event.token() {
                LISTENER => accept_ready = true,
                WAKER => revive_ready = true,
                _ => {}
            }
        }

        if accept_ready {
            accept_clients(listener, poll, &mut entries);
        }
        if revive_ready {
            drain_revivals(revival_rx, poll, &mut entries);
        }

        for event in events.iter() {
            let token = event.token();
            if token == LISTENER || token == WAKER {
                continue;
            }

            if event.is_error() {
                if let Some(entry) = entries.get_mut(token) {
                    if entry.state == ConnState::Armed {
                        debug!(token = token.0, "Error event, closing");
                        entry.state = ConnState::Closed;
                    }
                }
                continue;
            }

            dispatch(token, poll, &mut entries, handoff_tx);
        }

        sweep(poll, &mut entries, sink);
    }

    info!(engine = ENGINE, open = entries.len(), "Shut down");
    Ok(())
}

fn accept_clients(listener: &TcpListener, poll: &mut Poll, entries: &mut EntryList) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let token = entries.push(stream);

                // Re-borrow after insert to register the stored stream.
                if let Some(entry) = entries.get_mut(token) {
                    if let Some(stream) = entry.stream.as_mut() {
                        match poll.registry().register(stream, token, Interest::READABLE) {
                            Ok(()) => {
                                debug!(peer = %peer, token = token.0, "Accepted connection");
                            }
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "Register failed");
                                entry.state = ConnState::Closed;
                            }
                        }
                    }
                }
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

/// Hand an armed connection to the pool.
fn dispatch(token: Token, poll: &mut Poll, entries: &mut EntryList, handoff_tx: &Sender<Handoff>) {
    let mut stream = match entries.get_mut(token) {
        Some(entry) if entry.state == ConnState::Armed => match entry.stream.take() {
            Some(stream) => {
                entry.state = ConnState::InFlight;
                stream
            }
            None => return,
        },
        // Stale event for an entry already in flight or swept.
        _ => return,
    };

    // Disarm before the handoff: no events while a worker holds it.
    if let Err(e) = poll.registry().deregister(&mut stream) {
        warn!(token = token.0, error = %e, "Deregister failed");
    }

    // Blocks while every worker is busy; a revival frees a slot.
    match handoff_tx.send(Handoff { token, stream }) {
        Ok(()) => trace!(token = token.0, "Handed off"),
        Err(e) => {
            // The pool is gone. Take the connection back and shed it.
            error!(token = token.0, "No live workers, closing connection");
            if let Some(entry) = entries.get_mut(token) {
                entry.stream = Some(e.into_inner().stream);
                entry.state = ConnState::Closed;
            }
        }
    }
}

/// Apply every queued revival: re-arm survivors, mark the rest closed.
fn drain_revivals(revival_rx: &Receiver<Revival>, poll: &mut Poll, entries: &mut EntryList) {
    while let Ok(revival) = revival_rx.try_recv() {
        let Revival {
            token,
            mut stream,
            closed,
        } = revival;

        let entry = match entries.get_mut(token) {
            Some(entry) => entry,
            None => {
                debug!(token = token.0, "Revival for a swept entry");
                continue;
            }
        };

        if closed {
            entry.stream = Some(stream);
            entry.state = ConnState::Closed;
            continue;
        }

        // Back under readiness watch; a pending payload fires at once.
        match poll.registry().register(&mut stream, token, Interest::READABLE) {
            Ok(()) => {
                entry.stream = Some(stream);
                entry.state = ConnState::Armed;
            }
            Err(e) => {
                warn!(token = token.0, error = %e, "Re-register failed, closing");
                entry.stream = Some(stream);
                entry.state = ConnState::Closed;
            }
        }
    }
}

/// Close and time every entry marked closed this iteration.
fn sweep(poll: &mut Poll, entries: &mut EntryList, sink: &dyn TimingSink) {
    for mut entry in entries.sweep_closed() {
        if let Some(stream) = entry.stream.as_mut() {
            let _ = poll.registry().deregister(stream);
        }
        sink.record(ENGINE, "handle_connection", entry.opened_at.elapsed());
        debug!(token = entry.token.0, "Connection closed");
    }
}

/// One pool thread: pull a connection, run one step, send it back.
fn worker_loop(
    worker_id: usize,
    handoff_rx: Receiver<Handoff>,
    revival_tx: Sender<Revival>,
    waker: Arc<Waker>,
    shutdown: Shutdown,
) {
    debug!(worker = worker_id, "Worker started");

    while !shutdown.requested() {
        // Unblocked at teardown when the acceptor drops the sender.
        let Handoff { token, mut stream } = match handoff_rx.recv() {
            Ok(handoff) => handoff,
            Err(_) => break,
        };

        let closed = match handler::handle_once(&mut stream) {
            Ok(Outcome::Replied(n)) => {
                trace!(worker = worker_id, token = token.0, bytes = n, "Replied");
                false
            }
            Ok(Outcome::Idle) => false,
            Ok(Outcome::PeerClosed) => true,
            Err(e) => {
                warn!(worker = worker_id, token = token.0, error = %e, "Connection error");
                true
            }
        };

        if revival_tx
            .send(Revival {
                token,
                stream,
                closed,
            })
            .is_err()
        {
            break;
        }
        if let Err(e) = waker.wake() {
            warn!(worker = worker_id, error = %e, "Wake failed");
        }
    }

    debug!(worker = worker_id, "Worker stopped");
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::timing::MemorySink;
    use std::io::{Read, Write};
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::Duration;

    fn spawn_engine(
        workers: usize,
        shutdown: &Shutdown,
        sink: &Arc<MemorySink>,
    ) -> (SocketAddr, thread::JoinHandle<io::Result<()>>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = shutdown.clone();
        let sink = Arc::clone(sink);
        let handle = thread::spawn(move || run_on(listener, workers, &shutdown, sink.as_ref()));
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
    fn test_replies_through_the_pool() {
        let shutdown = Shutdown::new();
        let sink = Arc::new(MemorySink::new());
        let (addr, engine) = spawn_engine(2, &shutdown, &sink);

        let mut reply = [0u8; 2];

        let mut first = connect(addr);
        first.write_all(b"hello").unwrap();
        first.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply), 5);

        // Second payload on the same connection: the revival re-armed it.
        first.write_all(b"hey").unwrap();
        first.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply), 3);

        let mut second = connect(addr);
        second.write_all(&[5u8; handler::MAX_PAYLOAD]).unwrap();
        second.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply) as usize, handler::MAX_PAYLOAD);

        drop(first);
        drop(second);
        assert!(sink.wait_for_records(2, Duration::from_secs(5)));

        shutdown.trigger();
        engine.join().unwrap().unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.engine == "pool" && r.operation == "handle_connection"));
    }

    #[test]
    fn test_concurrent_clients_get_their_own_replies() {
        let shutdown = Shutdown::new();
        let sink = Arc::new(MemorySink::new());
        let (addr, engine) = spawn_engine(2, &shutdown, &sink);

        let mut first = connect(addr);
        let mut second = connect(addr);

        // Both in flight at once; each reply must route to its sender.
        first.write_all(b"aaaa").unwrap();
        second.write_all(b"bb").unwrap();

        let mut reply = [0u8; 2];
        first.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply), 4);
        second.read_exact(&mut reply).unwrap();
        assert_eq!(u16::from_be_bytes(reply), 2);

        drop(first);
        drop(second);
        assert!(sink.wait_for_records(2, Duration::from_secs(5)));

        shutdown.trigger();
        engine.join().unwrap().unwrap();
    }

    #[test]
    fn test_bind_failure_releases_workers() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();

        let config = Config {
            engine: Engine::Pool,
            host: addr.ip().to_string(),
            port: addr.port(),
            backlog: 5,
            workers: 2,
            max_clients: 10,
            csv: PathBuf::from("states.csv"),
            truncate_csv: false,
            log_level: "info".to_string(),
        };

        let sink = MemorySink::new();
        let shutdown = Shutdown::new();

        // run() returning at all proves the spawned workers were joined.
        let err = run(&config, &shutdown, &sink).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
