//! Change notifications for storage mutations.
//!
//! Each backend owns a [`ChangeNotifier`]. Every instance sharing a backend
//! can register a sender and refresh its in-memory views when another
//! instance writes. Notifications are best-effort: they are not a lock.

use parking_lot::RwLock;
use std::sync::mpsc::Sender;

/// A mutation observed on a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    /// Collection that changed.
    pub collection: String,
    /// Key that changed. `None` when the whole collection was cleared.
    pub key: Option<String>,
}

impl StorageChange {
    /// A single key changed.
    pub fn key(collection: &str, key: &str) -> Self {
        Self {
            collection: collection.to_string(),
            key: Some(key.to_string()),
        }
    }

    /// A whole collection was cleared.
    pub fn cleared(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            key: None,
        }
    }
}

/// Fan-out of [`StorageChange`] events to registered senders.
#[derive(Debug, Default)]
pub struct ChangeNotifier {
    subscribers: RwLock<Vec<Sender<StorageChange>>>,
}

impl ChangeNotifier {
    /// Creates a notifier with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber.
    pub fn register(&self, sender: Sender<StorageChange>) {
        self.subscribers.write().push(sender);
    }

    /// Publishes a change, dropping subscribers whose receiver is gone.
    pub fn publish(&self, change: StorageChange) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn publish_reaches_subscribers() {
        let notifier = ChangeNotifier::new();
        let (tx, rx) = mpsc::channel();
        notifier.register(tx);

        notifier.publish(StorageChange::key("orders", "a"));
        assert_eq!(rx.recv().unwrap(), StorageChange::key("orders", "a"));
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let notifier = ChangeNotifier::new();
        let (tx, rx) = mpsc::channel();
        notifier.register(tx);
        assert_eq!(notifier.subscriber_count(), 1);

        drop(rx);
        notifier.publish(StorageChange::cleared("cache"));
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
