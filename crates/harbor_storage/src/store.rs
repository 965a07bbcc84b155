//! The store the rest of harbor talks to.
//!
//! [`DurableStore`] composes the two backends behind one typed interface and
//! owns the selection, fallback, eviction and corrupt-value policies.

use crate::backend::KvBackend;
use crate::clock::{Clock, SystemClock};
use crate::error::{StorageError, StorageResult};
use crate::flat::FlatBackend;
use crate::notify::StorageChange;
use crate::structured::StructuredBackend;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default age after which flat entries may be evicted under quota pressure.
pub const DEFAULT_EVICTION_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Which backend a store selected when it was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The structured backend passed its probe and serves all traffic.
    Structured,
    /// Only the flat backend is in use.
    Flat,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Structured => write!(f, "structured"),
            BackendKind::Flat => write!(f, "flat"),
        }
    }
}

/// Eviction applied to the flat backend when a write hits its quota.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Entries stored longer ago than this may be evicted.
    pub max_age: Duration,
    /// Collections that are never evicted.
    pub exempt: Vec<String>,
}

impl EvictionPolicy {
    /// Creates a policy with the given age and no exemptions.
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            exempt: Vec::new(),
        }
    }

    /// Exempts a collection from eviction.
    #[must_use]
    pub fn exempt(mut self, collection: impl Into<String>) -> Self {
        self.exempt.push(collection.into());
        self
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_EVICTION_AGE)
    }
}

/// A durable, typed key/value store over a structured and a flat backend.
///
/// # Selection
///
/// The structured backend is probed once in [`DurableStore::open`]. If it is
/// absent or the probe fails, the flat backend serves everything. The choice
/// is never re-checked.
///
/// # Fallback
///
/// A structured write that fails is written to the flat backend instead, and
/// that flat copy shadows the structured one until a later structured write
/// for the same key succeeds. A flat write rejected for quota triggers one
/// eviction pass and one retry; if that still fails the call returns
/// [`StorageError::Full`] and nothing is persisted.
///
/// # Corrupt values
///
/// A stored value that does not parse as the requested type is logged,
/// deleted and reported as a miss.
pub struct DurableStore {
    structured: Option<Arc<dyn KvBackend>>,
    flat: Arc<dyn KvBackend>,
    kind: BackendKind,
    eviction: EvictionPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("kind", &self.kind)
            .field("eviction", &self.eviction)
            .finish_non_exhaustive()
    }
}

impl DurableStore {
    /// Opens a store, probing the structured backend once.
    pub fn open(
        structured: Option<Arc<dyn KvBackend>>,
        flat: Arc<dyn KvBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let structured = structured.filter(|backend| backend.probe());
        let kind = if structured.is_some() {
            BackendKind::Structured
        } else {
            BackendKind::Flat
        };
        info!(backend = %kind, "opened durable store");
        Self {
            structured,
            flat,
            kind,
            eviction: EvictionPolicy::default(),
            clock,
        }
    }

    /// Opens an in-memory store with both backends and the system clock.
    pub fn in_memory() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::open(
            Some(Arc::new(StructuredBackend::in_memory())),
            Arc::new(FlatBackend::in_memory(Arc::clone(&clock))),
            clock,
        )
    }

    /// Sets the eviction policy used under flat quota pressure.
    #[must_use]
    pub fn with_eviction(mut self, policy: EvictionPolicy) -> Self {
        self.eviction = policy;
        self
    }

    /// Returns the backend selected at open time.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Returns the clock this store stamps entries with.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Serializes and stores `value` under `(collection, key)`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Full`] if no backend can take the write, or
    /// the underlying error for non-quota failures.
    pub fn put<T: Serialize + ?Sized>(
        &self,
        collection: &str,
        key: &str,
        value: &T,
    ) -> StorageResult<()> {
        let raw = serde_json::to_string(value)?;
        self.put_raw(collection, key, &raw)
    }

    /// Stores raw JSON text under `(collection, key)`.
    pub fn put_raw(&self, collection: &str, key: &str, raw: &str) -> StorageResult<()> {
        let Some(structured) = &self.structured else {
            return self.put_flat(collection, key, raw);
        };

        match structured.put(collection, key, raw) {
            Ok(()) => {
                self.drop_flat_shadow(collection, key);
                Ok(())
            }
            Err(err) => {
                warn!(collection, key, error = %err, "structured write failed, using flat fallback");
                self.put_flat(collection, key, raw)?;
                if let Err(err) = structured.delete(collection, key) {
                    warn!(collection, key, error = %err, "could not remove superseded structured copy");
                }
                Ok(())
            }
        }
    }

    fn put_flat(&self, collection: &str, key: &str, raw: &str) -> StorageResult<()> {
        match self.flat.put(collection, key, raw) {
            Err(err) if err.is_quota() => {
                let evicted = self.flat.evict_older_than(
                    self.eviction.max_age,
                    self.clock.now_millis(),
                    &self.eviction.exempt,
                )?;
                info!(collection, key, evicted, "flat quota reached, retrying after eviction");
                match self.flat.put(collection, key, raw) {
                    Err(err) if err.is_quota() => Err(StorageError::Full {
                        collection: collection.to_string(),
                        key: key.to_string(),
                    }),
                    other => other,
                }
            }
            other => other,
        }
    }

    fn drop_flat_shadow(&self, collection: &str, key: &str) {
        match self.flat.get(collection, key) {
            Ok(Some(_)) => {
                if let Err(err) = self.flat.delete(collection, key) {
                    warn!(collection, key, error = %err, "could not remove stale flat copy");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(collection, key, error = %err, "could not check flat copy"),
        }
    }

    /// Reads and deserializes the value under `(collection, key)`.
    ///
    /// A flat copy shadows the structured one; if the flat copy is corrupt
    /// it is deleted and the structured copy is read instead.
    pub fn get<T: DeserializeOwned>(&self, collection: &str, key: &str) -> StorageResult<Option<T>> {
        if let Some(raw) = self.flat.get(collection, key)? {
            if let Some(value) = self.decode(collection, key, &raw, &self.flat) {
                return Ok(Some(value));
            }
        }
        if let Some(structured) = &self.structured {
            if let Some(raw) = structured.get(collection, key)? {
                return Ok(self.decode(collection, key, &raw, structured));
            }
        }
        Ok(None)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
        raw: &str,
        backend: &Arc<dyn KvBackend>,
    ) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(collection, key, backend = backend.name(), error = %err, "discarding corrupt value");
                if let Err(err) = backend.delete(collection, key) {
                    warn!(collection, key, error = %err, "could not delete corrupt value");
                }
                None
            }
        }
    }

    /// Reads every entry of a collection, in key order.
    ///
    /// Corrupt entries are deleted and skipped, falling back to the
    /// structured copy when a flat shadow is the corrupt one.
    pub fn get_all<T: DeserializeOwned>(&self, collection: &str) -> StorageResult<Vec<(String, T)>> {
        let mut merged: BTreeMap<String, Vec<(String, &Arc<dyn KvBackend>)>> = BTreeMap::new();
        for (key, raw) in self.flat.get_all(collection)? {
            merged.entry(key).or_default().push((raw, &self.flat));
        }
        if let Some(structured) = &self.structured {
            for (key, raw) in structured.get_all(collection)? {
                merged.entry(key).or_default().push((raw, structured));
            }
        }

        Ok(merged
            .into_iter()
            .filter_map(|(key, copies)| {
                copies
                    .into_iter()
                    .find_map(|(raw, backend)| self.decode(collection, &key, &raw, backend))
                    .map(|value| (key, value))
            })
            .collect())
    }

    /// Finds entries whose top-level JSON `field` equals `value`.
    ///
    /// Uses the structured backend's secondary index when one exists,
    /// otherwise scans the collection.
    pub fn find_by<T: DeserializeOwned>(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StorageResult<Vec<(String, T)>> {
        let indexed = match &self.structured {
            Some(structured) => structured.find_by_index(collection, field, value)?,
            None => None,
        };

        let Some(keys) = indexed else {
            debug!(collection, field, "no index, scanning collection");
            return Ok(self
                .get_all::<Value>(collection)?
                .into_iter()
                .filter(|(_, entry)| entry.get(field) == Some(value))
                .filter_map(|(key, entry)| serde_json::from_value(entry).ok().map(|v| (key, v)))
                .collect());
        };

        // Flat shadow copies are not indexed; merge them in.
        let mut found: BTreeMap<String, T> = BTreeMap::new();
        for key in keys {
            if let Some(entry) = self.get::<Value>(collection, &key)? {
                if entry.get(field) == Some(value) {
                    if let Ok(typed) = serde_json::from_value(entry) {
                        found.insert(key, typed);
                    }
                }
            }
        }
        for (key, raw) in self.flat.get_all(collection)? {
            if let Some(entry) = self.decode::<Value>(collection, &key, &raw, &self.flat) {
                if entry.get(field) == Some(value) {
                    if let Ok(typed) = serde_json::from_value(entry) {
                        found.insert(key, typed);
                    }
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Removes `(collection, key)` from both backends.
    pub fn delete(&self, collection: &str, key: &str) -> StorageResult<()> {
        if let Some(structured) = &self.structured {
            structured.delete(collection, key)?;
        }
        self.flat.delete(collection, key)
    }

    /// Removes every entry of a collection from both backends.
    pub fn clear(&self, collection: &str) -> StorageResult<()> {
        if let Some(structured) = &self.structured {
            structured.clear(collection)?;
        }
        self.flat.clear(collection)
    }

    /// Runs one eviction pass over the flat backend.
    pub fn evict_aged(&self) -> StorageResult<usize> {
        self.flat.evict_older_than(
            self.eviction.max_age,
            self.clock.now_millis(),
            &self.eviction.exempt,
        )
    }

    /// Subscribes to changes made through either backend.
    ///
    /// Other stores sharing the same backends publish here too.
    pub fn watch(&self) -> Receiver<StorageChange> {
        let (tx, rx) = mpsc::channel();
        if let Some(structured) = &self.structured {
            structured.watch(tx.clone());
        }
        self.flat.watch(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde::Deserialize;
    use serde_json::json;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: String,
        status: String,
        price: u64,
    }

    fn order(id: &str, status: &str, price: u64) -> Order {
        Order {
            id: id.into(),
            status: status.into(),
            price,
        }
    }

    struct Fixture {
        clock: ManualClock,
        structured: Arc<StructuredBackend>,
        flat: Arc<FlatBackend>,
    }

    impl Fixture {
        fn new(structured_quota: Option<usize>, flat_quota: Option<usize>) -> Self {
            let clock = ManualClock::new(1_000);
            let mut structured = StructuredBackend::in_memory();
            if let Some(q) = structured_quota {
                structured = structured.with_quota(q);
            }
            let mut flat = FlatBackend::in_memory(Arc::new(clock.clone()));
            if let Some(q) = flat_quota {
                flat = flat.with_quota(q);
            }
            Self {
                clock,
                structured: Arc::new(structured),
                flat: Arc::new(flat),
            }
        }

        fn store(&self) -> DurableStore {
            DurableStore::open(
                Some(self.structured.clone() as Arc<dyn KvBackend>),
                self.flat.clone(),
                Arc::new(self.clock.clone()),
            )
            .with_eviction(EvictionPolicy::default().exempt("offlineQueue"))
        }

        fn flat_only(&self) -> DurableStore {
            DurableStore::open(None, self.flat.clone(), Arc::new(self.clock.clone()))
        }
    }

    #[test]
    fn selects_structured_when_probe_passes() {
        let fx = Fixture::new(None, None);
        let store = fx.store();
        assert_eq!(store.kind(), BackendKind::Structured);

        store.put("orders", "a", &order("a", "synced", 1)).unwrap();
        assert!(fx.structured.get("orders", "a").unwrap().is_some());
        assert!(fx.flat.get("orders", "a").unwrap().is_none());
    }

    #[test]
    fn flat_only_when_structured_absent() {
        let fx = Fixture::new(None, None);
        let store = fx.flat_only();
        assert_eq!(store.kind(), BackendKind::Flat);

        store.put("orders", "a", &order("a", "synced", 1)).unwrap();
        assert_eq!(
            store.get::<Order>("orders", "a").unwrap(),
            Some(order("a", "synced", 1))
        );
        assert!(fx.flat.get("orders", "a").unwrap().is_some());
    }

    #[test]
    fn structured_quota_falls_back_to_flat() {
        let fx = Fixture::new(Some(64), None);
        let store = fx.store();
        store.put("orders", "a", &order("a", "synced", 1)).unwrap();

        let big = order("b", "pending-local", 10_000);
        let mut padded = serde_json::to_value(&big).unwrap();
        padded["note"] = json!("x".repeat(100));
        store.put("orders", "b", &padded).unwrap();

        assert!(fx.structured.get("orders", "b").unwrap().is_none());
        assert!(fx.flat.get("orders", "b").unwrap().is_some());

        let all = store.get_all::<Value>("orders").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].1["note"], json!("x".repeat(100)));
    }

    #[test]
    fn flat_copy_shadows_until_structured_write_succeeds() {
        let fx = Fixture::new(None, None);
        let store = fx.store();
        fx.structured
            .put("orders", "a", &serde_json::to_string(&order("a", "synced", 1)).unwrap())
            .unwrap();
        fx.flat
            .put("orders", "a", &serde_json::to_string(&order("a", "synced", 2)).unwrap())
            .unwrap();

        assert_eq!(store.get::<Order>("orders", "a").unwrap().unwrap().price, 2);

        store.put("orders", "a", &order("a", "synced", 3)).unwrap();
        assert!(fx.flat.get("orders", "a").unwrap().is_none());
        assert_eq!(store.get::<Order>("orders", "a").unwrap().unwrap().price, 3);
    }

    #[test]
    fn eviction_makes_room_then_retry_succeeds() {
        let fx = Fixture::new(Some(0), Some(200));
        let store = fx.store();
        store.put("cache", "stats", &json!({"n": 1})).unwrap();

        fx.clock.advance(DAY * 8);
        let payload = json!({"blob": "z".repeat(90)});
        store.put("orders", "a", &payload).unwrap();

        assert!(store.get::<Value>("cache", "stats").unwrap().is_none());
        assert_eq!(store.get::<Value>("orders", "a").unwrap(), Some(payload));
    }

    #[test]
    fn storage_full_after_eviction_persists_nothing() {
        let fx = Fixture::new(Some(0), Some(100));
        let store = fx.store();

        let payload = json!({"blob": "z".repeat(200)});
        let result = store.put("orders", "a", &payload);
        assert!(matches!(result, Err(StorageError::Full { .. })));
        assert!(store.get::<Value>("orders", "a").unwrap().is_none());
        assert!(fx.structured.get_all("orders").unwrap().is_empty());
        assert!(fx.flat.get_all("orders").unwrap().is_empty());
    }

    #[test]
    fn exempt_collections_survive_eviction() {
        let fx = Fixture::new(Some(0), Some(220));
        let store = fx.store();
        store.put("offlineQueue", "pending", &json!([1, 2, 3])).unwrap();

        fx.clock.advance(DAY * 30);
        let result = store.put("orders", "a", &json!({"blob": "z".repeat(150)}));
        assert!(matches!(result, Err(StorageError::Full { .. })));
        assert!(store.get::<Value>("offlineQueue", "pending").unwrap().is_some());
    }

    #[test]
    fn corrupt_value_is_a_miss_and_is_deleted() {
        let fx = Fixture::new(None, None);
        let store = fx.store();
        fx.structured.put("orders", "a", "{not json").unwrap();
        fx.structured.put("orders", "b", r#"{"wrong":"shape"}"#).unwrap();

        assert!(store.get::<Order>("orders", "a").unwrap().is_none());
        assert!(fx.structured.get("orders", "a").unwrap().is_none());

        assert!(store.get_all::<Order>("orders").unwrap().is_empty());
        assert!(fx.structured.get("orders", "b").unwrap().is_none());
    }

    #[test]
    fn corrupt_flat_shadow_falls_back_to_structured_copy() {
        let fx = Fixture::new(None, None);
        let store = fx.store();
        for key in ["a", "b"] {
            fx.structured
                .put("orders", key, &serde_json::to_string(&order(key, "synced", 1)).unwrap())
                .unwrap();
            fx.flat.put("orders", key, "{not json").unwrap();
        }

        assert_eq!(
            store.get::<Order>("orders", "a").unwrap(),
            Some(order("a", "synced", 1))
        );
        assert!(fx.flat.get("orders", "a").unwrap().is_none());

        let all = store.get_all::<Order>("orders").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1], ("b".to_string(), order("b", "synced", 1)));
        assert!(fx.flat.get("orders", "b").unwrap().is_none());
    }

    #[test]
    fn find_by_uses_index_and_flat_shadows() {
        let fx = Fixture::new(None, None);
        fx.structured.define_index("orders", "status");
        let store = fx.store();
        store.put("orders", "a", &order("a", "synced", 1)).unwrap();
        store.put("orders", "b", &order("b", "pending-local", 2)).unwrap();
        fx.flat
            .put("orders", "c", &serde_json::to_string(&order("c", "synced", 3)).unwrap())
            .unwrap();

        let synced: Vec<(String, Order)> = store.find_by("orders", "status", &json!("synced")).unwrap();
        let ids: Vec<&str> = synced.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let flat_store = fx.flat_only();
        let scanned: Vec<(String, Order)> =
            flat_store.find_by("orders", "status", &json!("synced")).unwrap();
        assert_eq!(scanned.len(), 1);
    }

    #[test]
    fn delete_and_clear_reach_both_backends() {
        let fx = Fixture::new(None, None);
        let store = fx.store();
        fx.structured.put("orders", "a", "1").unwrap();
        fx.flat.put("orders", "a", "1").unwrap();
        fx.flat.put("orders", "b", "2").unwrap();

        store.delete("orders", "a").unwrap();
        assert!(fx.structured.get("orders", "a").unwrap().is_none());
        assert!(fx.flat.get("orders", "a").unwrap().is_none());

        store.clear("orders").unwrap();
        assert!(store.get_all::<Value>("orders").unwrap().is_empty());
    }

    #[test]
    fn watch_sees_writes_from_another_store() {
        let fx = Fixture::new(None, None);
        let first = fx.store();
        let second = fx.store();
        let changes = second.watch();

        first.put("orders", "a", &order("a", "synced", 1)).unwrap();
        assert_eq!(changes.recv().unwrap(), StorageChange::key("orders", "a"));
    }
}
