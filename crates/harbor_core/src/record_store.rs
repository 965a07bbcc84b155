//! In-memory record index with write-through persistence.

use crate::error::CoreResult;
use crate::observer::{EventFeed, Subscription};
use crate::record::{Record, RecordFilter, RecordStatus};
use crate::types::{RecordId, ORDERS};
use harbor_storage::DurableStore;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A change to the record index.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    /// A record was inserted or replaced.
    Upserted(Record),
    /// A record was removed.
    Removed(RecordId),
    /// The index was reloaded from storage.
    Reloaded,
}

/// The authoritative local set of records.
///
/// Every mutation is written to the `orders` collection before the index is
/// updated; a rejected write leaves both unchanged.
#[derive(Debug)]
pub struct RecordStore {
    store: Arc<DurableStore>,
    index: RwLock<BTreeMap<RecordId, Record>>,
    feed: EventFeed<RecordChange>,
    generation: AtomicU64,
}

impl RecordStore {
    /// Loads every persisted record into memory.
    pub fn load(store: Arc<DurableStore>) -> CoreResult<Self> {
        let index = read_all(&store)?;
        debug!(records = index.len(), "loaded record store");
        Ok(Self {
            store,
            index: RwLock::new(index),
            feed: EventFeed::new(),
            generation: AtomicU64::new(0),
        })
    }

    /// Inserts or replaces a record.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed records and
    /// [`crate::CoreError::StorageFull`] if persistence rejects the write.
    pub fn upsert(&self, record: Record) -> CoreResult<()> {
        record.validate()?;
        {
            let mut index = self.index.write();
            self.store.put(ORDERS, record.id.as_str(), &record)?;
            index.insert(record.id.clone(), record.clone());
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.feed.emit(RecordChange::Upserted(record));
        Ok(())
    }

    /// Removes a record, returning it if present.
    pub fn remove(&self, id: &RecordId) -> CoreResult<Option<Record>> {
        let removed = {
            let mut index = self.index.write();
            self.store.delete(ORDERS, id.as_str())?;
            self.generation.fetch_add(1, Ordering::AcqRel);
            index.remove(id)
        };
        if removed.is_some() {
            self.feed.emit(RecordChange::Removed(id.clone()));
        }
        Ok(removed)
    }

    /// Returns a record by id, including deleted-local ones.
    pub fn get(&self, id: &RecordId) -> Option<Record> {
        self.index.read().get(id).cloned()
    }

    /// Returns true if a record with `id` exists.
    pub fn contains(&self, id: &RecordId) -> bool {
        self.index.read().contains_key(id)
    }

    /// Returns every record matching `filter`, in id order.
    pub fn list(&self, filter: &RecordFilter) -> Vec<Record> {
        self.index
            .read()
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect()
    }

    /// Returns every record, deleted-local ones included.
    pub fn all(&self) -> Vec<Record> {
        self.index.read().values().cloned().collect()
    }

    /// Reads records with `status` straight from storage.
    pub fn query_status(&self, status: RecordStatus) -> CoreResult<Vec<Record>> {
        Ok(self
            .store
            .find_by::<Record>(ORDERS, "status", &Value::String(status.as_str().to_string()))?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Returns the number of records, deleted-local ones included.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// Returns true if there are no records.
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Rebuilds the index from storage.
    pub fn refresh(&self) -> CoreResult<()> {
        {
            let mut index = self.index.write();
            *index = read_all(&self.store)?;
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.feed.emit(RecordChange::Reloaded);
        Ok(())
    }

    /// Returns a counter bumped on every change to the index.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Subscribes to index changes.
    pub fn subscribe(&self) -> Subscription<RecordChange> {
        self.feed.subscribe()
    }
}

fn read_all(store: &DurableStore) -> CoreResult<BTreeMap<RecordId, Record>> {
    let mut index = BTreeMap::new();
    for (key, record) in store.get_all::<Record>(ORDERS)? {
        if record.id.as_str() != key {
            warn!(key, id = %record.id, "skipping record stored under another key");
            continue;
        }
        index.insert(record.id.clone(), record);
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use harbor_storage::{Clock, FlatBackend, ManualClock};
    use serde_json::json;

    fn record(id: &str, price: u64) -> Record {
        Record::new_local(&json!({"id": id, "price": price}), 1).unwrap()
    }

    #[test]
    fn upsert_get_remove() {
        let store = RecordStore::load(Arc::new(DurableStore::in_memory())).unwrap();
        store.upsert(record("A", 1)).unwrap();
        store.upsert(record("B", 2)).unwrap();
        assert_eq!(store.len(), 2);

        let id = RecordId::new("A").unwrap();
        assert_eq!(store.get(&id).unwrap().field("price"), Some(&json!(1)));

        assert!(store.remove(&id).unwrap().is_some());
        assert!(store.remove(&id).unwrap().is_none());
        assert!(!store.contains(&id));
    }

    #[test]
    fn survives_reload() {
        let durable = Arc::new(DurableStore::in_memory());
        let store = RecordStore::load(Arc::clone(&durable)).unwrap();
        store.upsert(record("A", 1)).unwrap();

        let reopened = RecordStore::load(durable).unwrap();
        assert_eq!(reopened.all(), store.all());
    }

    #[test]
    fn rejected_write_leaves_index_unchanged() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let flat = FlatBackend::in_memory(Arc::clone(&clock)).with_quota(200);
        let durable = Arc::new(DurableStore::open(None, Arc::new(flat), clock));
        let store = RecordStore::load(durable).unwrap();

        store.upsert(record("A", 1)).unwrap();
        let mut big = record("B", 2);
        big.fields.insert("blob".into(), json!("x".repeat(500)));

        let err = store.upsert(big).unwrap_err();
        assert!(matches!(err, CoreError::StorageFull { .. }));
        assert_eq!(store.len(), 1);
        assert!(!store.contains(&RecordId::new("B").unwrap()));
    }

    #[test]
    fn entries_under_a_foreign_key_are_skipped() {
        let durable = Arc::new(DurableStore::in_memory());
        durable.put(ORDERS, "A", &record("A", 1)).unwrap();
        durable.put(ORDERS, "stale", &record("A", 2)).unwrap();
        durable.put(ORDERS, "B", &record("A", 3)).unwrap();

        let store = RecordStore::load(durable).unwrap();
        assert_eq!(store.len(), 1);
        let only = store.get(&RecordId::new("A").unwrap()).unwrap();
        assert_eq!(only.field("price"), Some(&json!(1)));
        assert!(!store.contains(&RecordId::new("B").unwrap()));
    }

    #[test]
    fn list_applies_filter() {
        let store = RecordStore::load(Arc::new(DurableStore::in_memory())).unwrap();
        store.upsert(record("A", 1)).unwrap();
        let mut deleted = record("B", 2);
        deleted.mark_deleted(2);
        store.upsert(deleted).unwrap();

        assert_eq!(store.list(&RecordFilter::new()).len(), 1);
        assert_eq!(store.list(&RecordFilter::new().include_deleted()).len(), 2);
        assert_eq!(
            store
                .query_status(RecordStatus::DeletedLocal)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn subscribers_see_changes() {
        let store = RecordStore::load(Arc::new(DurableStore::in_memory())).unwrap();
        let sub = store.subscribe();

        store.upsert(record("A", 1)).unwrap();
        store.remove(&RecordId::new("A").unwrap()).unwrap();
        store.refresh().unwrap();

        let events = sub.drain();
        assert!(matches!(events[0], RecordChange::Upserted(_)));
        assert!(matches!(events[1], RecordChange::Removed(_)));
        assert_eq!(events[2], RecordChange::Reloaded);
    }

    #[test]
    fn generation_moves_on_every_change() {
        let store = RecordStore::load(Arc::new(DurableStore::in_memory())).unwrap();
        let start = store.generation();
        store.upsert(record("A", 1)).unwrap();
        let after_upsert = store.generation();
        assert!(after_upsert > start);

        let _ = store.get(&RecordId::new("A").unwrap());
        assert_eq!(store.generation(), after_upsert);

        store.refresh().unwrap();
        assert!(store.generation() > after_upsert);
    }

    #[test]
    fn refresh_picks_up_external_writes() {
        let durable = Arc::new(DurableStore::in_memory());
        let store = RecordStore::load(Arc::clone(&durable)).unwrap();
        durable.put(ORDERS, "Z", &record("Z", 9)).unwrap();

        assert!(!store.contains(&RecordId::new("Z").unwrap()));
        store.refresh().unwrap();
        assert!(store.contains(&RecordId::new("Z").unwrap()));
    }
}
