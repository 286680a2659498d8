//! Cooperative cancellation for in-flight conversions.
//!
//! A [`CancelToken`] is a cheap cloneable handle shared between the caller
//! and every chunk task of a request. Cancelling it:
//!
//! * aborts any wait for an admission slot,
//! * interrupts a pending backend call at the next suspension point
//!   (backends that cannot be interrupted mid-call run to completion and
//!   their result is discarded),
//! * lets held [`crate::governor::AdmissionTicket`]s drop promptly so other
//!   requests are not starved by an abandoned one.
//!
//! Built on `tokio::sync::watch` rather than a bespoke flag so waiters can
//! `await` the transition instead of polling.

use tokio::sync::watch;

/// Cloneable cancellation signal for one conversion request.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
}

impl CancelToken {
    /// A token that is not (yet) cancelled.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Signal cancellation. Idempotent; safe to call from any task.
    pub fn cancel(&self) {
        // send_replace never fails: the sender itself keeps the channel open.
        self.tx.send_replace(true);
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once cancellation is signalled. Never resolves for a token
    /// that is never cancelled — always race it inside `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for returns immediately when the value is already true.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
