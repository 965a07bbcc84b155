//! Inspect command implementation.

use super::{format_size, open_store};
use harbor_core::{
    Clock, MutationQueue, RecordStore, StoreConfig, TtlCache, CACHE, OFFLINE_QUEUE, ORDERS,
};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store directory.
    pub path: String,
    /// Backend the store selected.
    pub backend: String,
    /// Bytes held by the structured backend, if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_bytes: Option<usize>,
    /// Bytes held by the flat backend.
    pub flat_bytes: usize,
    /// Per-collection entry counts.
    pub collections: Vec<CollectionStats>,
    /// Records in the record store, deleted-local ones included.
    pub record_count: usize,
    /// Operations waiting in the mutation queue.
    pub queue_length: usize,
    /// Cache entries already past their expiry.
    pub expired_cache_entries: usize,
}

/// Statistics for a single collection.
#[derive(Debug, Serialize)]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Number of entries.
    pub entries: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => print_text_output(&result),
    }
    Ok(())
}

/// Gathers statistics for the store under `path`.
pub fn inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let opened = open_store(path, &StoreConfig::new().dir(path))?;
    let store = &opened.store;

    let mut collections = Vec::new();
    for name in [ORDERS, OFFLINE_QUEUE, CACHE] {
        collections.push(CollectionStats {
            name: name.to_string(),
            entries: store.get_all::<Value>(name)?.len(),
        });
    }

    let records = RecordStore::load(Arc::clone(store))?;
    let queue = MutationQueue::load(Arc::clone(store))?;
    let now = store.clock().now_millis();
    let expired_cache_entries = TtlCache::new(Arc::clone(store))
        .entries()?
        .iter()
        .filter(|entry| entry.is_expired(now))
        .count();

    Ok(InspectResult {
        path: path.display().to_string(),
        backend: store.kind().to_string(),
        structured_bytes: opened.structured.as_ref().map(|b| b.bytes_used()),
        flat_bytes: opened.flat.bytes_used(),
        collections,
        record_count: records.len(),
        queue_length: queue.size(),
        expired_cache_entries,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Harbor Store Inspection");
    println!("=======================");
    println!();
    println!("Path:    {}", result.path);
    println!("Backend: {}", result.backend);
    println!();
    println!("Storage:");
    if let Some(bytes) = result.structured_bytes {
        println!("  Structured: {}", format_size(bytes));
    }
    println!("  Flat:       {}", format_size(result.flat_bytes));
    println!();
    println!("Collections:");
    for col in &result.collections {
        println!("  {:<14} {} entries", col.name, col.entries);
    }
    println!();
    println!("Records:        {}", result.record_count);
    println!("Queued:         {}", result.queue_length);
    println!("Expired cache:  {}", result.expired_cache_entries);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::seed;

    #[test]
    fn reports_seeded_store() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());

        let result = inspect(dir.path()).unwrap();
        assert_eq!(result.backend, "structured");
        assert_eq!(result.record_count, 2);
        assert_eq!(result.queue_length, 1);
        assert_eq!(result.collections[0].entries, 2);
    }

    #[test]
    fn missing_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect(&dir.path().join("nothing")).is_err());
    }
}
