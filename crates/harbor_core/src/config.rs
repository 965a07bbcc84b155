//! Store configuration.

use crate::error::CoreResult;
use crate::types::{OFFLINE_QUEUE, ORDERS};
use harbor_storage::{
    Clock, DurableStore, EvictionPolicy, FlatBackend, KvBackend, StructuredBackend,
    DEFAULT_EVICTION_AGE,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Directory below the store root holding structured collections.
pub const STRUCTURED_DIR: &str = "structured";
/// File below the store root holding the flat namespace.
pub const FLAT_FILE: &str = "flat.json";

/// Configuration for opening a durable store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory; `None` keeps everything in memory.
    pub dir: Option<PathBuf>,

    /// Whether the structured backend may be used at all.
    pub structured: bool,

    /// Byte quota of the structured backend.
    pub structured_quota: Option<usize>,

    /// Byte quota of the flat backend.
    pub flat_quota: Option<usize>,

    /// Age past which flat entries may be evicted under quota pressure.
    pub eviction_age: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            structured: true,
            structured_quota: None,
            flat_quota: Some(5 * 1024 * 1024), // 5 MB
            eviction_age: DEFAULT_EVICTION_AGE,
        }
    }
}

impl StoreConfig {
    /// Creates an in-memory configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists under `dir`.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Enables or disables the structured backend.
    #[must_use]
    pub fn structured(mut self, value: bool) -> Self {
        self.structured = value;
        self
    }

    /// Sets the structured backend quota.
    #[must_use]
    pub fn structured_quota(mut self, bytes: usize) -> Self {
        self.structured_quota = Some(bytes);
        self
    }

    /// Sets the flat backend quota.
    #[must_use]
    pub fn flat_quota(mut self, bytes: usize) -> Self {
        self.flat_quota = Some(bytes);
        self
    }

    /// Sets the eviction age.
    #[must_use]
    pub fn eviction_age(mut self, age: Duration) -> Self {
        self.eviction_age = age;
        self
    }

    /// Returns the eviction policy: aged entries go, records and the
    /// mutation queue never do.
    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy::new(self.eviction_age)
            .exempt(ORDERS)
            .exempt(OFFLINE_QUEUE)
    }

    /// Opens the configured backends and composes them into a store.
    ///
    /// A structured backend that cannot be opened is logged and skipped, so
    /// the store runs flat-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the flat backend cannot be opened.
    pub fn open(&self, clock: Arc<dyn Clock>) -> CoreResult<DurableStore> {
        let structured = if self.structured {
            let opened = match &self.dir {
                Some(dir) => match StructuredBackend::open(&dir.join(STRUCTURED_DIR)) {
                    Ok(backend) => Some(backend),
                    Err(err) => {
                        warn!(error = %err, "structured backend unavailable");
                        None
                    }
                },
                None => Some(StructuredBackend::in_memory()),
            };
            opened.map(|backend| match self.structured_quota {
                Some(bytes) => Arc::new(backend.with_quota(bytes)),
                None => Arc::new(backend),
            })
        } else {
            None
        };

        let flat = match &self.dir {
            Some(dir) => FlatBackend::open(&dir.join(FLAT_FILE), Arc::clone(&clock))?,
            None => FlatBackend::in_memory(Arc::clone(&clock)),
        };
        let flat = match self.flat_quota {
            Some(bytes) => flat.with_quota(bytes),
            None => flat,
        };

        Ok(self.assemble(structured, Arc::new(flat), clock))
    }

    /// Composes already-open backends into a store.
    ///
    /// Stores assembled from the same backend instances share state, like
    /// several processes over one storage directory.
    pub fn assemble(
        &self,
        structured: Option<Arc<StructuredBackend>>,
        flat: Arc<FlatBackend>,
        clock: Arc<dyn Clock>,
    ) -> DurableStore {
        let structured = structured.map(|backend| {
            backend.define_index(ORDERS, "status");
            backend as Arc<dyn KvBackend>
        });
        DurableStore::open(structured, flat, clock).with_eviction(self.eviction_policy())
    }
}
