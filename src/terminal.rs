use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Terminal dimensions as reported by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl From<TerminalSize> for kube::api::TerminalSize {
    fn from(size: TerminalSize) -> Self {
        kube::api::TerminalSize {
            width: size.cols,
            height: size.rows,
        }
    }
}

/// Single-slot, most-recent-wins queue of pending terminal resizes.
///
/// Only the latest terminal size is meaningful, so a burst of resize events
/// collapses into whatever value was pushed last. `push` never blocks and
/// never grows the queue beyond one entry.
#[derive(Clone, Default)]
pub struct ResizeQueue {
    slot: Arc<ResizeSlot>,
}

#[derive(Default)]
struct ResizeSlot {
    pending: Mutex<Option<TerminalSize>>,
    notify: Notify,
}

impl ResizeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `size` as the pending resize, replacing any older one.
    ///
    /// Returns `true` if a pending value was overwritten.
    pub fn push(&self, size: TerminalSize) -> bool {
        let replaced = self.slot.pending.lock().replace(size).is_some();
        self.slot.notify.notify_one();
        replaced
    }

    /// Take the pending resize without waiting.
    pub fn try_pop(&self) -> Option<TerminalSize> {
        self.slot.pending.lock().take()
    }

    /// Wait for the next pending resize.
    ///
    /// Cancel safe: a value is only taken out of the slot when it is returned.
    pub async fn pop(&self) -> TerminalSize {
        loop {
            if let Some(size) = self.try_pop() {
                return size;
            }
            // A push between try_pop and here leaves a stored permit, so this
            // cannot miss a wakeup.
            self.slot.notify.notified().await;
        }
    }
}
