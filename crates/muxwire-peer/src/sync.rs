//! Shutdown primitives shared by contexts, clients and servers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// One-way, idempotent close latch.
///
/// The first caller of [`CloseOnce::close`] flips the flag and runs the
/// teardown while holding the latch; every later caller is a no-op. Teardown
/// should be short (closing a socket, taking a handle) and must not call back
/// into the same latch.
#[derive(Debug, Default)]
pub struct CloseOnce {
    closed: Mutex<bool>,
}

impl CloseOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the latch, running `teardown` only if this call won.
    ///
    /// Returns `true` for the winning call.
    pub fn close(&self, teardown: impl FnOnce()) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return false;
        }
        *closed = true;
        teardown();
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Observe state under the latch so a concurrent close is never seen half done.
    pub fn inspect<R>(&self, f: impl FnOnce(bool) -> R) -> R {
        let closed = self.closed.lock();
        f(*closed)
    }
}

/// Cooperative cancellation flag shared between loops.
///
/// Loops check it once per iteration. It does not interrupt blocking socket
/// calls on its own; whoever cancels also closes the socket.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
