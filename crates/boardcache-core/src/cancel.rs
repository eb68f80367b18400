//! Cancellation signal for in-flight builds
//!
//! A cloneable flag backed by `tokio::sync::watch`. Cancelling aborts the wait
//! on the acquisition process; it does not interrupt store operations.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Signal every clone of this token
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once `cancel` has been called on any clone
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // Sender is owned by the token, so it outlives this borrow
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
