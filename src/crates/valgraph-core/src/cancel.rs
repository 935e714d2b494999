//! Cooperative cancellation.
//!
//! A [`CancelHandle`] flips a watch channel; every [`CancelToken`] cloned
//! from it observes the flip. Nodes check the token between external calls;
//! the runtime checks it at superstep boundaries.

use tokio::sync::watch;

/// Sender half: signals cancellation to all tokens
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiver half: observed by nodes and the run loop
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/token pair
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    /// Signal cancellation; idempotent
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelToken {
    /// A token that never fires (for tests and detached runs)
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(_tx);
        Self { rx }
    }

    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is signalled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped without cancelling: treat as never-cancelled and
        // park forever so select! arms using this future stay pending.
        std::future::pending::<()>().await;
    }
}
