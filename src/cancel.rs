// Cooperative cancellation
//
// A CancellationToken is passed explicitly through every call that may block
// (downloads, subprocess reads, retries). Work checks it at fixed points and
// exits voluntarily. Killing a live subprocess is the only forced interrupt.

use tokio::sync::watch;

/// Shared cancellation flag backed by a `watch` channel.
///
/// Clones observe the same flag. Cancelling is idempotent and irreversible.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        // send_replace never fails, even with no receivers left
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // wait_for only errors if the sender is dropped, and we hold it
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Returns `Err(Cancelled)` if cancellation was requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Marker returned by [`CancellationToken::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;
