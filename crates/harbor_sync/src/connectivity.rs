//! Online/offline belief shared by the engine and its host.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// An observable boolean connectivity signal.
///
/// Clones share the same state. The background sync loop watches for the
/// offline to online edge.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    /// Creates a signal with an initial belief.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Returns the current belief.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Updates the belief. Returns true if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if *state == online {
                false
            } else {
                *state = online;
                true
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
        changed
    }

    /// Returns a receiver notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
