//! Cooperative cancellation shared by bypass sessions and adapter calls.
//!
//! A token is cheap to clone; every clone observes the same flag. Long-running
//! operations race their work against [`CancellationToken::cancelled`] and
//! tear down whatever they own (browser context, child process) when it fires.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancellation flag backed by a `watch` channel.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Flag the token. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot observe a
        // closed channel here.
        let _ = receiver.wait_for(|flag| *flag).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
