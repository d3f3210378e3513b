//! Single-flight completion gate.
//!
//! A gate marks "an operation is in flight". The operation owns the
//! [`CompletionGate`]; everyone else gets a [`GateSignal`] they can wait on.
//! Completion is the drop of the `CompletionGate`, so a cancelled operation
//! releases its waiters just like a finished one. Waking up says nothing
//! about the outcome: waiters must re-examine the state they care about.

use tokio::sync::watch;

/// Held by the caller performing the in-flight operation
#[derive(Debug)]
pub struct CompletionGate {
    // Never written to: closing the channel is the completion broadcast.
    _tx: watch::Sender<()>,
}

/// Waitable view of a [`CompletionGate`]
#[derive(Debug, Clone)]
pub struct GateSignal {
    rx: watch::Receiver<()>,
}

impl CompletionGate {
    /// Open a new gate, returning the owning half and a signal to share
    pub fn open() -> (Self, GateSignal) {
        let (tx, rx) = watch::channel(());
        (Self { _tx: tx }, GateSignal { rx })
    }

    /// Complete the operation and release all waiters
    pub fn complete(self) {
        drop(self);
    }
}

impl GateSignal {
    /// Whether the owning operation is still in flight
    pub fn is_pending(&self) -> bool {
        self.rx.has_changed().is_ok()
    }

    /// Wait until the owning operation completes (or is abandoned)
    pub async fn wait(mut self) {
        // Nothing is ever sent, so this only returns once the sender is gone.
        let _ = self.rx.changed().await;
    }
}
