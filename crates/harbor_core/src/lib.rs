//! # Harbor Core
//!
//! Local data layer of the harbor offline-first client.
//!
//! This crate sits on [`harbor_storage`] and provides:
//!
//! - [`Record`] - a business record with its sync status
//! - [`RecordStore`] - the authoritative in-memory index of records,
//!   written through to durable storage
//! - [`MutationQueue`] - the durable FIFO of mutations awaiting delivery
//! - [`TtlCache`] - a key/value cache with per-entry expiry
//! - [`EventFeed`] - observer registration with explicit unsubscribe
//!
//! ## Example
//!
//! ```rust
//! use harbor_core::{Record, RecordStore, StoreConfig};
//! use harbor_storage::SystemClock;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let store = Arc::new(StoreConfig::new().open(Arc::new(SystemClock)).unwrap());
//! let records = RecordStore::load(store).unwrap();
//!
//! let record = Record::new_local(&json!({"id": "A", "price": 100000}), 0).unwrap();
//! records.upsert(record).unwrap();
//! assert_eq!(records.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod error;
mod observer;
mod queue;
mod record;
mod record_store;
mod stats;
mod types;

pub use cache::{CacheEntry, TtlCache};
pub use config::{StoreConfig, FLAT_FILE, STRUCTURED_DIR};
pub use error::{CoreError, CoreResult};
pub use observer::{EventFeed, Subscription};
pub use queue::{MutationKind, MutationOperation, MutationQueue, QUEUE_KEY};
pub use record::{Fields, Record, RecordFilter, RecordStatus, RESERVED_FIELDS};
pub use record_store::{RecordChange, RecordStore};
pub use stats::{OrderStats, STATS_CACHE_KEY};
pub use types::{RecordId, CACHE, MAX_ID_LEN, OFFLINE_QUEUE, ORDERS};

// Re-export storage types that appear in this crate's API.
pub use harbor_storage::{BackendKind, Clock, DurableStore, ManualClock, SystemClock};
