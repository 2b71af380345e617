//! Start-up handshake and guaranteed cleanup for session workers.
//!
//! A worker goes through three phases: establish its stream, report ready and
//! pump, then clean up exactly once. The request that spawned the worker waits
//! on a [`ReadyWaiter`] with a deadline and never polls. Cleanup is tied to an
//! [`ExitGuard`] owned by the worker so it runs on every exit path, including
//! early returns, errors and task abort.

use std::time::Duration;

use tokio::sync::oneshot;

/// Create a connected signal/waiter pair.
pub fn readiness<E>() -> (ReadySignal<E>, ReadyWaiter<E>) {
    let (tx, rx) = oneshot::channel();
    (ReadySignal { tx }, ReadyWaiter { rx })
}

/// Worker side of the handshake. Consumed on first use, so it fires at most once.
#[derive(Debug)]
pub struct ReadySignal<E> {
    tx: oneshot::Sender<Result<(), E>>,
}

impl<E> ReadySignal<E> {
    /// Report that the stream is usable.
    ///
    /// Returns `false` if the waiter is gone (timed out or abandoned), in
    /// which case the worker must not go on to pump.
    pub fn ready(self) -> bool {
        self.tx.send(Ok(())).is_ok()
    }

    /// Report that establishing the stream failed.
    pub fn fail(self, err: E) -> bool {
        self.tx.send(Err(err)).is_ok()
    }
}

/// Result of waiting for a worker to start.
#[derive(Debug)]
pub enum StartOutcome<E> {
    Ready,
    Failed(E),
    /// The worker exited without reporting either way.
    Abandoned,
    TimedOut,
}

/// Caller side of the handshake.
#[derive(Debug)]
pub struct ReadyWaiter<E> {
    rx: oneshot::Receiver<Result<(), E>>,
}

impl<E> ReadyWaiter<E> {
    /// Block until the worker reports ready, reports an error, or `timeout`
    /// elapses, whichever comes first.
    pub async fn wait(self, timeout: Duration) -> StartOutcome<E> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(Ok(()))) => StartOutcome::Ready,
            Ok(Ok(Err(err))) => StartOutcome::Failed(err),
            Ok(Err(_)) => StartOutcome::Abandoned,
            Err(_) => StartOutcome::TimedOut,
        }
    }
}

/// RAII guard that runs its action exactly once when dropped.
pub struct ExitGuard<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> ExitGuard<F> {
    pub fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }
}

impl<F: FnOnce()> Drop for ExitGuard<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}
