//! # Harbor Storage
//!
//! Durable key/value storage for harbor.
//!
//! This crate is the lowest persistence layer. Every higher layer talks to
//! a [`DurableStore`], which composes two backends behind one interface:
//!
//! - [`StructuredBackend`] - independent named collections with secondary
//!   indices; preferred when available
//! - [`FlatBackend`] - a single string namespace where each collection is one
//!   serialized list; used when the structured backend is absent or rejects
//!   a write
//!
//! ## Design Principles
//!
//! - Backends store JSON text and never interpret record semantics
//! - Backend selection happens once, from an explicit probe
//! - A failed write leaves storage unchanged
//! - Corrupt values read as misses and are deleted on access
//!
//! ## Example
//!
//! ```rust
//! use harbor_storage::DurableStore;
//!
//! let store = DurableStore::in_memory();
//! store.put("cache", "greeting", &"hello").unwrap();
//! let value: Option<String> = store.get("cache", "greeting").unwrap();
//! assert_eq!(value.as_deref(), Some("hello"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod clock;
mod error;
mod flat;
mod notify;
mod store;
mod structured;

pub use backend::KvBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StorageError, StorageResult};
pub use flat::FlatBackend;
pub use notify::{ChangeNotifier, StorageChange};
pub use store::{BackendKind, DurableStore, EvictionPolicy, DEFAULT_EVICTION_AGE};
pub use structured::StructuredBackend;
