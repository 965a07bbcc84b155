//! Time-to-live cache over the durable store.

use crate::error::CoreResult;
use crate::types::CACHE;
use harbor_storage::{Clock, DurableStore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A persisted cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cache key.
    pub key: String,
    /// Cached value.
    pub data: Value,
    /// Milliseconds since the Unix epoch when the entry was written.
    pub created_at: u64,
    /// Milliseconds since the Unix epoch after which the entry is a miss.
    pub expires_at: u64,
}

impl CacheEntry {
    /// Returns true if the entry has expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Key/value cache whose entries expire after a per-entry TTL.
///
/// Expired entries read as misses and are deleted when read. A zero TTL
/// yields an entry that is already expired.
#[derive(Debug, Clone)]
pub struct TtlCache {
    store: Arc<DurableStore>,
}

impl TtlCache {
    /// Creates a cache over `store`, using the store's clock.
    pub fn new(store: Arc<DurableStore>) -> Self {
        Self { store }
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.store.clock()
    }

    /// Stores `data` under `key` for `ttl`.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Duration) -> CoreResult<()> {
        let now = self.clock().now_millis();
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let entry = CacheEntry {
            key: key.to_string(),
            data: serde_json::to_value(data).map_err(harbor_storage::StorageError::from)?,
            created_at: now,
            expires_at: now.saturating_add(ttl_millis),
        };
        self.store.put(CACHE, key, &entry)?;
        Ok(())
    }

    /// Returns the live entry under `key`.
    pub fn entry(&self, key: &str) -> CoreResult<Option<CacheEntry>> {
        let Some(entry) = self.store.get::<CacheEntry>(CACHE, key)? else {
            return Ok(None);
        };
        if entry.is_expired(self.clock().now_millis()) {
            debug!(key, "cache entry expired");
            self.store.delete(CACHE, key)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Returns the live value under `key`.
    ///
    /// A value that does not deserialize as `T` is removed and reads as a
    /// miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        let Some(entry) = self.entry(key)? else {
            return Ok(None);
        };
        match serde_json::from_value(entry.data) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                debug!(key, error = %err, "cache entry has unexpected shape");
                self.store.delete(CACHE, key)?;
                Ok(None)
            }
        }
    }

    /// Removes the entry under `key`.
    pub fn remove(&self, key: &str) -> CoreResult<()> {
        self.store.delete(CACHE, key)?;
        Ok(())
    }

    /// Deletes every expired entry, returning how many were removed.
    pub fn sweep_expired(&self) -> CoreResult<usize> {
        let now = self.clock().now_millis();
        let mut removed = 0;
        for (key, entry) in self.store.get_all::<CacheEntry>(CACHE)? {
            if entry.is_expired(now) {
                self.store.delete(CACHE, &key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        Ok(removed)
    }

    /// Returns every entry, expired ones included.
    pub fn entries(&self) -> CoreResult<Vec<CacheEntry>> {
        Ok(self
            .store
            .get_all::<CacheEntry>(CACHE)?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Removes every entry.
    pub fn clear(&self) -> CoreResult<()> {
        self.store.clear(CACHE)?;
        Ok(())
    }
}
