//! Key/value backend trait definition.

use crate::error::StorageResult;
use crate::notify::StorageChange;
use std::sync::mpsc::Sender;
use std::time::Duration;

/// A durable key/value backend.
///
/// Backends store **JSON text** under `(collection, key)`. They do not
/// interpret values beyond what secondary indices need. Higher layers own
/// typing and validation.
///
/// # Invariants
///
/// - A write that returns an error leaves the backend unchanged
/// - `get_all` returns entries in key order
/// - Every successful mutation is published to registered watchers
/// - Backends must be `Send + Sync` for shared access
///
/// # Implementors
///
/// - [`super::StructuredBackend`] - named collections with secondary indices
/// - [`super::FlatBackend`] - one string namespace, collections simulated
pub trait KvBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Checks whether the backend is usable in this environment.
    ///
    /// Called once when a [`super::DurableStore`] is opened.
    fn probe(&self) -> bool;

    /// Stores `value` under `(collection, key)`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`super::StorageError::QuotaExceeded`] if the write would
    /// exceed the backend quota, or an I/O error if persisting fails.
    fn put(&self, collection: &str, key: &str, value: &str) -> StorageResult<()>;

    /// Reads the raw value stored under `(collection, key)`.
    fn get(&self, collection: &str, key: &str) -> StorageResult<Option<String>>;

    /// Reads every `(key, value)` pair of a collection, in key order.
    fn get_all(&self, collection: &str) -> StorageResult<Vec<(String, String)>>;

    /// Removes `(collection, key)`. Removing a missing key is not an error.
    fn delete(&self, collection: &str, key: &str) -> StorageResult<()>;

    /// Removes every entry of a collection.
    fn clear(&self, collection: &str) -> StorageResult<()>;

    /// Looks up keys through a secondary index on a top-level JSON field.
    ///
    /// Returns `Ok(None)` when the backend has no index for `field`, in which
    /// case callers fall back to scanning.
    fn find_by_index(
        &self,
        _collection: &str,
        _field: &str,
        _value: &serde_json::Value,
    ) -> StorageResult<Option<Vec<String>>> {
        Ok(None)
    }

    /// Evicts entries stored longer than `max_age` ago.
    ///
    /// Collections listed in `exempt` are left alone. Returns the number of
    /// evicted entries. Backends without entry timestamps evict nothing.
    fn evict_older_than(
        &self,
        _max_age: Duration,
        _now_millis: u64,
        _exempt: &[String],
    ) -> StorageResult<usize> {
        Ok(0)
    }

    /// Registers a sender that receives every change made through this backend.
    fn watch(&self, sender: Sender<StorageChange>);
}
