//! Caller-supplied cancellation for long-running stages.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::watch;

/// A cloneable cancellation signal.
///
/// Installing and staged uploads race against [`Cancellation::cancelled`];
/// the publish call only checks [`Cancellation::is_cancelled`] before the
/// request is sent.
#[derive(Clone, Debug)]
pub struct Cancellation {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Cancels automatically once `timeout` has elapsed.
    pub fn cancel_after(&self, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            debug!("Timeout of {:?} reached, cancelling", timeout);
            this.cancel();
        })
    }
}
