use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Tells long-lived connections (exec WebSockets) that the server is going
/// down, and counts how many are still open.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a connection. The connection counts as active until the
    /// returned guard is dropped; the receiver flips to `true` on shutdown.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard {
            active: self.active.clone(),
        };
        (guard, self.tx.subscribe())
    }

    /// Number of registered connections still open.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    /// Signal every registered connection to close.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
        tracing::debug!(active = self.active_count(), "shutdown signalled");
    }
}

/// Keeps a connection counted in [`ShutdownCoordinator::active_count`].
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
