//! Shutdown coordination for the sweeper's background tasks.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for every task, aborting whatever is still running at the deadline.
///
/// A sweep waiting on its receipt is the slowest thing to stop; whatever it
/// leaves in `processing` is visible in the ledger.
pub async fn drain(tasks: Vec<(&'static str, JoinHandle<()>)>, deadline: Duration) {
    let started = tokio::time::Instant::now();
    for (name, mut handle) in tasks {
        let remaining = deadline.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, &mut handle).await {
            Ok(Ok(())) => tracing::debug!(task = name, "Task stopped"),
            Ok(Err(e)) => tracing::error!(task = name, error = %e, "Task ended abnormally"),
            Err(_) => {
                tracing::warn!(task = name, "Task did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}
