//! Cancellation signal threaded through every suspending store operation.
//!
//! An `Interruptor` is a cloneable, level-triggered signal. Operations that
//! wait — on the FIFO enforcer, on transaction acquisition, or between
//! backfill chunks — race their wait against `interrupted()` and fail with
//! `StoreError::Interrupted` if the signal fires first. Once a transaction
//! has been handed to a B-tree operation the signal is no longer consulted
//! until the next natural yield point; in-flight operations run to
//! completion so on-disk invariants hold.

use tokio::sync::watch;

/// A cloneable cancellation signal. All clones observe the same state;
/// firing any clone fires them all.
#[derive(Clone, Debug)]
pub struct Interruptor {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Interruptor {
    /// Creates a signal in the unfired state.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Fires the signal. Idempotent; wakes every current and future waiter.
    pub fn interrupt(&self) {
        let _ = self.tx.send(true);
    }

    /// Returns whether the signal has fired.
    pub fn is_interrupted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has fired. Never resolves otherwise.
    pub async fn interrupted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // All senders gone without firing; this signal can never
                // fire, so the wait must be eternal.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Interruptor {
    fn default() -> Self {
        Self::new()
    }
}
