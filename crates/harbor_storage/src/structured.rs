//! Structured backend: independent named collections with secondary indices.

use crate::backend::KvBackend;
use crate::error::{StorageError, StorageResult};
use crate::notify::{ChangeNotifier, StorageChange};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use tracing::{debug, warn};

const PROBE_FILE: &str = ".probe";

/// One collection: its entries plus any secondary indices over them.
#[derive(Debug, Default)]
struct Collection {
    entries: BTreeMap<String, String>,
    /// field -> canonical JSON of the field value -> keys
    indices: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl Collection {
    fn index_insert(&mut self, key: &str, value: &str) {
        if self.indices.is_empty() {
            return;
        }
        let Ok(parsed) = serde_json::from_str::<Value>(value) else {
            return;
        };
        for (field, index) in &mut self.indices {
            if let Some(field_value) = parsed.get(field) {
                index
                    .entry(field_value.to_string())
                    .or_default()
                    .insert(key.to_string());
            }
        }
    }

    fn index_remove(&mut self, key: &str, value: &str) {
        if self.indices.is_empty() {
            return;
        }
        let Ok(parsed) = serde_json::from_str::<Value>(value) else {
            return;
        };
        for (field, index) in &mut self.indices {
            if let Some(field_value) = parsed.get(field) {
                let bucket_key = field_value.to_string();
                if let Some(bucket) = index.get_mut(&bucket_key) {
                    bucket.remove(key);
                    if bucket.is_empty() {
                        index.remove(&bucket_key);
                    }
                }
            }
        }
    }

    fn byte_size(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<String, Collection>,
    bytes: usize,
}

/// A structured key/value backend.
///
/// Holds independent named collections. With a directory, each collection
/// is persisted as `<dir>/<collection>.json`, rewritten atomically (temp file
/// then rename) on every mutation. Without one, data lives only in memory.
///
/// Secondary indices are declared per collection on a top-level JSON field
/// with [`StructuredBackend::define_index`] and are rebuilt in memory.
///
/// # Example
///
/// ```rust
/// use harbor_storage::{KvBackend, StructuredBackend};
///
/// let backend = StructuredBackend::in_memory();
/// backend.define_index("orders", "status");
/// backend.put("orders", "a", r#"{"status":"synced"}"#).unwrap();
///
/// let keys = backend
///     .find_by_index("orders", "status", &serde_json::json!("synced"))
///     .unwrap();
/// assert_eq!(keys, Some(vec!["a".to_string()]));
/// ```
#[derive(Debug)]
pub struct StructuredBackend {
    dir: Option<PathBuf>,
    quota: Option<usize>,
    inner: RwLock<Inner>,
    notifier: ChangeNotifier,
}

impl StructuredBackend {
    /// Creates a backend that keeps everything in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            quota: None,
            inner: RwLock::new(Inner::default()),
            notifier: ChangeNotifier::new(),
        }
    }

    /// Opens a backend persisted under `dir`, loading existing collections.
    ///
    /// Collection files that cannot be parsed are removed and treated as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        let mut inner = Inner::default();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = fs::read_to_string(&path)?;
            match serde_json::from_str::<BTreeMap<String, String>>(&text) {
                Ok(entries) => {
                    let collection = Collection {
                        entries,
                        indices: BTreeMap::new(),
                    };
                    inner.bytes += collection.byte_size();
                    inner.collections.insert(name.to_string(), collection);
                }
                Err(err) => {
                    warn!(collection = name, error = %err, "discarding unreadable collection file");
                    fs::remove_file(&path)?;
                }
            }
        }

        debug!(dir = %dir.display(), collections = inner.collections.len(), "opened structured backend");
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            quota: None,
            inner: RwLock::new(inner),
            notifier: ChangeNotifier::new(),
        })
    }

    /// Limits the total bytes (keys plus values) the backend may hold.
    #[must_use]
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// Returns the persistence directory, if any.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Returns the total bytes currently held.
    pub fn bytes_used(&self) -> usize {
        self.inner.read().bytes
    }

    /// Returns the names of all non-empty collections.
    pub fn collection_names(&self) -> Vec<String> {
        self.inner
            .read()
            .collections
            .iter()
            .filter(|(_, c)| !c.entries.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Declares a secondary index on a top-level JSON field of a collection.
    ///
    /// Existing entries are indexed immediately. Declaring the same index
    /// twice is a no-op.
    pub fn define_index(&self, collection: &str, field: &str) {
        let mut inner = self.inner.write();
        let col = inner.collections.entry(collection.to_string()).or_default();
        if col.indices.contains_key(field) {
            return;
        }
        col.indices.insert(field.to_string(), BTreeMap::new());
        let entries: Vec<(String, String)> = col
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in entries {
            col.index_insert(&key, &value);
        }
    }

    fn collection_path(&self, collection: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{collection}.json")))
    }

    fn persist(&self, collection: &str, col: Option<&Collection>) -> StorageResult<()> {
        let Some(path) = self.collection_path(collection) else {
            return Ok(());
        };
        match col {
            Some(col) if !col.entries.is_empty() => {
                let text = serde_json::to_string(&col.entries)?;
                let tmp = path.with_extension("json.tmp");
                fs::write(&tmp, text)?;
                fs::rename(&tmp, &path)?;
            }
            _ => {
                if path.exists() {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }
}

fn check_collection_name(collection: &str) -> StorageResult<()> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::Unavailable(format!(
            "invalid collection name {collection:?}"
        )))
    }
}

impl KvBackend for StructuredBackend {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn probe(&self) -> bool {
        let Some(dir) = &self.dir else {
            return true;
        };
        let probe = dir.join(PROBE_FILE);
        let ok = fs::create_dir_all(dir).is_ok()
            && fs::write(&probe, b"ok").is_ok()
            && fs::remove_file(&probe).is_ok();
        if !ok {
            warn!(dir = %dir.display(), "structured backend probe failed");
        }
        ok
    }

    fn put(&self, collection: &str, key: &str, value: &str) -> StorageResult<()> {
        check_collection_name(collection)?;
        let mut inner = self.inner.write();

        let old_len = inner
            .collections
            .get(collection)
            .and_then(|c| c.entries.get(key))
            .map(|v| key.len() + v.len())
            .unwrap_or(0);
        let required = inner.bytes - old_len + key.len() + value.len();
        if let Some(limit) = self.quota {
            if required > limit {
                return Err(StorageError::QuotaExceeded { required, limit });
            }
        }

        let col = inner.collections.entry(collection.to_string()).or_default();
        let previous = col.entries.insert(key.to_string(), value.to_string());
        if let Some(old) = &previous {
            col.index_remove(key, old);
        }
        col.index_insert(key, value);

        let persisted = self.persist(collection, inner.collections.get(collection));
        if let Err(err) = persisted {
            let col = inner.collections.entry(collection.to_string()).or_default();
            col.index_remove(key, value);
            match previous {
                Some(old) => {
                    col.index_insert(key, &old);
                    col.entries.insert(key.to_string(), old);
                }
                None => {
                    col.entries.remove(key);
                }
            }
            return Err(err);
        }

        inner.bytes = required;
        drop(inner);
        self.notifier.publish(StorageChange::key(collection, key));
        Ok(())
    }

    fn get(&self, collection: &str, key: &str) -> StorageResult<Option<String>> {
        Ok(self
            .inner
            .read()
            .collections
            .get(collection)
            .and_then(|c| c.entries.get(key).cloned()))
    }

    fn get_all(&self, collection: &str) -> StorageResult<Vec<(String, String)>> {
        Ok(self
            .inner
            .read()
            .collections
            .get(collection)
            .map(|c| {
                c.entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete(&self, collection: &str, key: &str) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let Some(col) = inner.collections.get_mut(collection) else {
            return Ok(());
        };
        let Some(old) = col.entries.remove(key) else {
            return Ok(());
        };
        col.index_remove(key, &old);

        if let Err(err) = self.persist(collection, inner.collections.get(collection)) {
            if let Some(col) = inner.collections.get_mut(collection) {
                col.index_insert(key, &old);
                col.entries.insert(key.to_string(), old);
            }
            return Err(err);
        }

        inner.bytes -= key.len() + old.len();
        drop(inner);
        self.notifier.publish(StorageChange::key(collection, key));
        Ok(())
    }

    fn clear(&self, collection: &str) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let Some(col) = inner.collections.get_mut(collection) else {
            return Ok(());
        };
        let freed = col.byte_size();
        let entries = std::mem::take(&mut col.entries);
        for index in col.indices.values_mut() {
            index.clear();
        }

        if let Err(err) = self.persist(collection, None) {
            if let Some(col) = inner.collections.get_mut(collection) {
                for (key, value) in &entries {
                    col.index_insert(key, value);
                }
                col.entries = entries;
            }
            return Err(err);
        }

        inner.bytes -= freed;
        drop(inner);
        self.notifier.publish(StorageChange::cleared(collection));
        Ok(())
    }

    fn find_by_index(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StorageResult<Option<Vec<String>>> {
        let inner = self.inner.read();
        let Some(index) = inner
            .collections
            .get(collection)
            .and_then(|c| c.indices.get(field))
        else {
            return Ok(None);
        };
        Ok(Some(
            index
                .get(&value.to_string())
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
        ))
    }

    fn watch(&self, sender: Sender<StorageChange>) {
        self.notifier.register(sender);
    }
}
