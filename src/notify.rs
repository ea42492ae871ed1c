//! Change notification for observable state.
//!
//! Every observable field owns a [`Notifier`]. Interested parties (the
//! resource adapter's observe streams, tests) call [`Notifier::subscribe`]
//! and receive a unit tick whenever the field changes; they then re-read the
//! current value through the owning component. Ticks carry no payload so a
//! slow subscriber can never hold stale data alive.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A multi-subscriber change signal.
///
/// Cloning the notifier shares the subscriber list, so a component can hand
/// out clones to worker tasks that fire notifications.
#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: std::sync::Arc<Mutex<Vec<mpsc::UnboundedSender<()>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer. The returned receiver yields one tick per
    /// change (coalescing is up to the subscriber).
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Signal a change to all live observers, dropping the ones that went
    /// away.
    pub fn notify(&self) {
        self.subscribers.lock().retain(|tx| tx.send(()).is_ok());
    }

    /// Number of live subscribers (observers whose receiver still exists).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_reaches_all_subscribers() {
        let n = Notifier::new();
        let mut a = n.subscribe();
        let mut b = n.subscribe();
        n.notify();
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_dead_subscribers_are_pruned() {
        let n = Notifier::new();
        let rx = n.subscribe();
        drop(rx);
        n.notify();
        assert_eq!(n.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_clone_shares_subscribers() {
        let n = Notifier::new();
        let mut rx = n.subscribe();
        let n2 = n.clone();
        n2.notify();
        assert!(rx.try_recv().is_ok());
    }
}
