//! Shutdown coordination.

use tokio::sync::broadcast;

/// Fan-out stop signal for the server and its background tasks.
///
/// Every long-running task holds a receiver from [`Shutdown::subscribe`];
/// a dropped sender also reads as shutdown on the receiving side.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Signal every subscriber. Returns how many were listening.
    pub fn trigger(&self) -> usize {
        let listening = self.tx.send(()).unwrap_or(0);
        tracing::debug!(listening, "Shutdown triggered");
        listening
    }

    /// Tasks that have subscribed and not yet finished.
    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_is_woken() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.subscribe();
        let mut b = shutdown.subscribe();
        assert_eq!(shutdown.subscribers(), 2);

        assert_eq!(shutdown.trigger(), 2);
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());

        drop((a, b));
        assert_eq!(shutdown.subscribers(), 0);
        assert_eq!(shutdown.trigger(), 0);
    }
}
