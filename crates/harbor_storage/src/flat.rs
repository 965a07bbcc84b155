//! Flat fallback backend: one string-keyed namespace.
//!
//! The namespace behaves like browser local storage: string keys, string
//! values, one byte budget for everything. A collection is simulated by a
//! single namespace key whose value is the serialized list of its entries.

use crate::backend::KvBackend;
use crate::clock::Clock;
use crate::error::{StorageError, StorageResult};
use crate::notify::{ChangeNotifier, StorageChange};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One entry of a simulated collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FlatEntry {
    key: String,
    value: String,
    #[serde(rename = "storedAt")]
    stored_at: u64,
}

#[derive(Debug, Default)]
struct Namespace {
    items: BTreeMap<String, String>,
    bytes: usize,
}

impl Namespace {
    fn item_len(&self, name: &str) -> usize {
        self.items.get(name).map(|v| name.len() + v.len()).unwrap_or(0)
    }

    fn set(&mut self, name: &str, value: String) {
        self.bytes = self.bytes - self.item_len(name) + name.len() + value.len();
        self.items.insert(name.to_string(), value);
    }

    fn remove(&mut self, name: &str) -> Option<String> {
        self.bytes -= self.item_len(name);
        self.items.remove(name)
    }
}

/// A flat key/value backend.
///
/// With a file path, the whole namespace is persisted as one JSON object and
/// rewritten atomically on every mutation. Each stored entry records when it
/// was written so aged entries can be evicted under quota pressure.
pub struct FlatBackend {
    path: Option<PathBuf>,
    quota: Option<usize>,
    namespace: Mutex<Namespace>,
    clock: Arc<dyn Clock>,
    notifier: ChangeNotifier,
}

impl std::fmt::Debug for FlatBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatBackend")
            .field("path", &self.path)
            .field("quota", &self.quota)
            .finish_non_exhaustive()
    }
}

impl FlatBackend {
    /// Creates a backend that keeps the namespace in memory.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            path: None,
            quota: None,
            namespace: Mutex::new(Namespace::default()),
            clock,
            notifier: ChangeNotifier::new(),
        }
    }

    /// Opens a backend persisted in the single file at `path`.
    ///
    /// An unreadable file is discarded and the namespace starts empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// file cannot be read or removed.
    pub fn open(path: &Path, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut namespace = Namespace::default();
        if path.exists() {
            let text = fs::read_to_string(path)?;
            match serde_json::from_str::<BTreeMap<String, String>>(&text) {
                Ok(items) => {
                    namespace.bytes = items.iter().map(|(k, v)| k.len() + v.len()).sum();
                    namespace.items = items;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "discarding unreadable flat namespace");
                    fs::remove_file(path)?;
                }
            }
        }
        Ok(Self {
            path: Some(path.to_path_buf()),
            quota: None,
            namespace: Mutex::new(namespace),
            clock,
            notifier: ChangeNotifier::new(),
        })
    }

    /// Limits the total bytes (names plus values) of the namespace.
    #[must_use]
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// Returns the total bytes currently held by the namespace.
    pub fn bytes_used(&self) -> usize {
        self.namespace.lock().bytes
    }

    /// Returns every namespace key (one per simulated collection).
    pub fn namespace_keys(&self) -> Vec<String> {
        self.namespace.lock().items.keys().cloned().collect()
    }

    fn persist(&self, namespace: &Namespace) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string(&namespace.items)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Parses a simulated collection. An unparseable list is removed.
    fn load_entries(&self, namespace: &mut Namespace, collection: &str) -> Vec<FlatEntry> {
        let Some(raw) = namespace.items.get(collection) else {
            return Vec::new();
        };
        match serde_json::from_str::<Vec<FlatEntry>>(raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(collection, error = %err, "discarding unreadable flat collection");
                namespace.remove(collection);
                if let Err(err) = self.persist(namespace) {
                    warn!(collection, error = %err, "failed to persist discarded collection");
                }
                Vec::new()
            }
        }
    }

    /// Replaces a simulated collection, enforcing the quota.
    fn store_entries(
        &self,
        namespace: &mut Namespace,
        collection: &str,
        entries: &[FlatEntry],
    ) -> StorageResult<()> {
        if entries.is_empty() {
            let previous = namespace.remove(collection);
            if let Err(err) = self.persist(namespace) {
                if let Some(previous) = previous {
                    namespace.set(collection, previous);
                }
                return Err(err);
            }
            return Ok(());
        }

        let serialized = serde_json::to_string(entries)?;
        let required =
            namespace.bytes - namespace.item_len(collection) + collection.len() + serialized.len();
        if let Some(limit) = self.quota {
            if required > limit {
                return Err(StorageError::QuotaExceeded { required, limit });
            }
        }

        let previous = namespace.items.get(collection).cloned();
        namespace.set(collection, serialized);
        if let Err(err) = self.persist(namespace) {
            match previous {
                Some(previous) => namespace.set(collection, previous),
                None => {
                    namespace.remove(collection);
                }
            }
            return Err(err);
        }
        Ok(())
    }
}

impl KvBackend for FlatBackend {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn probe(&self) -> bool {
        true
    }

    fn put(&self, collection: &str, key: &str, value: &str) -> StorageResult<()> {
        let mut namespace = self.namespace.lock();
        let mut entries = self.load_entries(&mut namespace, collection);
        let entry = FlatEntry {
            key: key.to_string(),
            value: value.to_string(),
            stored_at: self.clock.now_millis(),
        };
        match entries.binary_search_by(|e| e.key.as_str().cmp(key)) {
            Ok(pos) => entries[pos] = entry,
            Err(pos) => entries.insert(pos, entry),
        }
        self.store_entries(&mut namespace, collection, &entries)?;
        drop(namespace);
        self.notifier.publish(StorageChange::key(collection, key));
        Ok(())
    }

    fn get(&self, collection: &str, key: &str) -> StorageResult<Option<String>> {
        let mut namespace = self.namespace.lock();
        Ok(self
            .load_entries(&mut namespace, collection)
            .into_iter()
            .find(|e| e.key == key)
            .map(|e| e.value))
    }

    fn get_all(&self, collection: &str) -> StorageResult<Vec<(String, String)>> {
        let mut namespace = self.namespace.lock();
        Ok(self
            .load_entries(&mut namespace, collection)
            .into_iter()
            .map(|e| (e.key, e.value))
            .collect())
    }

    fn delete(&self, collection: &str, key: &str) -> StorageResult<()> {
        let mut namespace = self.namespace.lock();
        let mut entries = self.load_entries(&mut namespace, collection);
        let before = entries.len();
        entries.retain(|e| e.key != key);
        if entries.len() == before {
            return Ok(());
        }
        self.store_entries(&mut namespace, collection, &entries)?;
        drop(namespace);
        self.notifier.publish(StorageChange::key(collection, key));
        Ok(())
    }

    fn clear(&self, collection: &str) -> StorageResult<()> {
        let mut namespace = self.namespace.lock();
        if !namespace.items.contains_key(collection) {
            return Ok(());
        }
        self.store_entries(&mut namespace, collection, &[])?;
        drop(namespace);
        self.notifier.publish(StorageChange::cleared(collection));
        Ok(())
    }

    fn evict_older_than(
        &self,
        max_age: Duration,
        now_millis: u64,
        exempt: &[String],
    ) -> StorageResult<usize> {
        let cutoff = now_millis.saturating_sub(max_age.as_millis() as u64);
        let mut namespace = self.namespace.lock();
        let names: Vec<String> = namespace
            .items
            .keys()
            .filter(|name| !exempt.contains(name))
            .cloned()
            .collect();

        let mut evicted = 0;
        let mut touched = Vec::new();
        for name in names {
            let mut entries = self.load_entries(&mut namespace, &name);
            let before = entries.len();
            entries.retain(|e| e.stored_at >= cutoff);
            if entries.len() != before {
                evicted += before - entries.len();
                self.store_entries(&mut namespace, &name, &entries)?;
                touched.push(name);
            }
        }
        drop(namespace);

        if evicted > 0 {
            debug!(evicted, collections = touched.len(), "evicted aged flat entries");
        }
        for name in touched {
            self.notifier.publish(StorageChange::cleared(&name));
        }
        Ok(evicted)
    }

    fn watch(&self, sender: Sender<StorageChange>) {
        self.notifier.register(sender);
    }
}
