//! Observer registry with explicit unsubscribe.
//!
//! An [`EventFeed`] fans events out to every live [`Subscription`]. Events
//! arrive in emission order. Dropping a subscription, or calling
//! [`Subscription::unsubscribe`], removes it from the feed.
//!
//! ```rust
//! use harbor_core::EventFeed;
//!
//! let feed = EventFeed::new();
//! let sub = feed.subscribe();
//! feed.emit(1u32);
//! assert_eq!(sub.try_recv(), Some(1));
//!
//! sub.unsubscribe();
//! assert_eq!(feed.subscriber_count(), 0);
//! ```

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct FeedInner<E> {
    subscribers: RwLock<Vec<(u64, Sender<E>)>>,
    next_id: AtomicU64,
}

/// A cloneable fan-out feed of events.
pub struct EventFeed<E> {
    inner: Arc<FeedInner<E>>,
}

impl<E> Clone for EventFeed<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone> Default for EventFeed<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventFeed<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFeed")
            .field("subscribers", &self.inner.subscribers.read().len())
            .finish()
    }
}

impl<E: Clone> EventFeed<E> {
    /// Creates a feed with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FeedInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((id, tx));
        Subscription {
            id,
            receiver: rx,
            feed: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `event` to every live subscriber.
    pub fn emit(&self, event: E) {
        let mut subscribers = self.inner.subscribers.write();
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

/// Receiving end of an [`EventFeed`].
pub struct Subscription<E> {
    id: u64,
    receiver: Receiver<E>,
    feed: Weak<FeedInner<E>>,
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl<E> Subscription<E> {
    /// Returns the next pending event without blocking.
    pub fn try_recv(&self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    /// Waits up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<E> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Returns every pending event.
    pub fn drain(&self) -> Vec<E> {
        self.receiver.try_iter().collect()
    }

    /// Stops receiving events.
    pub fn unsubscribe(self) {}
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.subscribers.write().retain(|(id, _)| *id != self.id);
        }
    }
}
