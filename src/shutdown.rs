//! Cooperative shutdown shared by every engine loop.
//!
//! One flag, set by SIGINT or by `trigger`, checked at the top of each
//! loop iteration. Event-loop engines also register their poll waker
//! here so a trigger interrupts an in-flight wait; a handled signal
//! interrupts the wait on its own by making it return `Interrupted`.

use mio::Waker;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cancellation context passed by reference into engine loops.
#[derive(Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    waker: Arc<Mutex<Option<Arc<Waker>>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown::default()
    }

    /// True once shutdown has been requested.
    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Request shutdown and wake any registered poll.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(guard) = self.waker.lock() {
            if let Some(waker) = guard.as_ref() {
                let _ = waker.wake();
            }
        }
    }

    /// Point `trigger` at the engine's poll waker.
    pub fn register_waker(&self, waker: Arc<Waker>) {
        if let Ok(mut guard) = self.waker.lock() {
            *guard = Some(waker);
        }
    }

    /// Route SIGINT to the flag instead of process termination.
    pub fn install_sigint(&self) -> io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.flag))
            .map(|_| ())
    }
}
