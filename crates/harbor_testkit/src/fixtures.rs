//! Store and client fixtures.
//!
//! Every fixture runs on a [`ManualClock`] so expiry and eviction can be
//! driven by the test instead of wall time.

use harbor_core::{StoreConfig, FLAT_FILE, STRUCTURED_DIR};
use harbor_storage::{Clock, DurableStore, FlatBackend, ManualClock, StructuredBackend};
use harbor_sync::{MemoryRemote, OfflineClient, SyncConfig};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Start time of [`fixed_clock`], in milliseconds since the Unix epoch.
pub const FIXED_START_MILLIS: u64 = 1_700_000_000_000;

/// Returns a manual clock at [`FIXED_START_MILLIS`].
pub fn fixed_clock() -> ManualClock {
    ManualClock::new(FIXED_START_MILLIS)
}

/// A durable store with shared backends and automatic cleanup.
pub struct TestStore {
    /// The composed store.
    pub store: Arc<DurableStore>,
    /// The clock every backend reads.
    pub clock: ManualClock,
    /// The structured backend, if enabled.
    pub structured: Option<Arc<StructuredBackend>>,
    /// The flat backend.
    pub flat: Arc<FlatBackend>,
    config: StoreConfig,
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates an in-memory store with both backends.
    pub fn memory() -> Self {
        Self::memory_with(StoreConfig::new())
    }

    /// Creates an in-memory store from `config`, honoring its quotas and
    /// whether the structured backend is enabled.
    pub fn memory_with(config: StoreConfig) -> Self {
        Self::memory_at(config, fixed_clock())
    }

    /// Like [`TestStore::memory_with`], on a caller-supplied clock.
    pub fn memory_at(config: StoreConfig, clock: ManualClock) -> Self {
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let structured = config.structured.then(|| {
            let backend = StructuredBackend::in_memory();
            Arc::new(match config.structured_quota {
                Some(bytes) => backend.with_quota(bytes),
                None => backend,
            })
        });
        let flat = FlatBackend::in_memory(Arc::clone(&shared));
        let flat = Arc::new(match config.flat_quota {
            Some(bytes) => flat.with_quota(bytes),
            None => flat,
        });
        let store = Arc::new(config.assemble(structured.clone(), Arc::clone(&flat), shared));
        Self {
            store,
            clock,
            structured,
            flat,
            config,
            _temp_dir: None,
        }
    }

    /// Creates a store persisted under a fresh temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut store = Self::open_dir(temp_dir.path(), StoreConfig::new(), fixed_clock());
        store._temp_dir = Some(temp_dir);
        store
    }

    fn open_dir(dir: &Path, config: StoreConfig, clock: ManualClock) -> Self {
        let config = config.dir(dir);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let structured = Arc::new(
            StructuredBackend::open(&dir.join(STRUCTURED_DIR))
                .expect("Failed to open structured backend"),
        );
        let flat = Arc::new(
            FlatBackend::open(&dir.join(FLAT_FILE), Arc::clone(&shared))
                .expect("Failed to open flat backend"),
        );
        let store = Arc::new(config.assemble(
            Some(Arc::clone(&structured)),
            Arc::clone(&flat),
            shared,
        ));
        Self {
            store,
            clock,
            structured: Some(structured),
            flat,
            config,
            _temp_dir: None,
        }
    }

    /// Reopens a file-based store from disk, as a restarted process would.
    ///
    /// # Panics
    ///
    /// Panics if the store is in-memory.
    pub fn reopen(&self) -> Self {
        let dir = self.path().expect("Only file-based stores can be reopened");
        Self::open_dir(dir, self.config.clone(), self.clock.clone())
    }

    /// Returns a second store over the same backends, like another process
    /// sharing the storage directory.
    pub fn sibling(&self) -> Arc<DurableStore> {
        let shared: Arc<dyn Clock> = Arc::new(self.clock.clone());
        Arc::new(
            self.config
                .assemble(self.structured.clone(), Arc::clone(&self.flat), shared),
        )
    }

    /// Returns the directory if file-based.
    pub fn path(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(|d| d.path())
    }
}

impl std::ops::Deref for TestStore {
    type Target = DurableStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// A client wired to an in-memory remote.
pub struct TestClient {
    /// The client under test.
    pub client: OfflineClient,
    /// The remote it talks to; clones share state.
    pub remote: MemoryRemote,
    /// The store beneath the client.
    pub store: TestStore,
}

impl TestClient {
    /// Builds a client over `store` with `config`.
    pub fn new(store: TestStore, config: SyncConfig) -> Self {
        Self::with_remote(store, MemoryRemote::new(), config)
    }

    /// Builds a client over `store` talking to `remote`.
    pub fn with_remote(store: TestStore, remote: MemoryRemote, config: SyncConfig) -> Self {
        let client = OfflineClient::open(
            Arc::clone(&store.store),
            Arc::new(remote.clone()),
            config,
        )
        .expect("Failed to open client");
        Self {
            client,
            remote,
            store,
        }
    }

    /// Returns the manual clock.
    pub fn clock(&self) -> &ManualClock {
        &self.store.clock
    }
}

impl std::ops::Deref for TestClient {
    type Target = OfflineClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Returns an online client over an in-memory store.
pub fn online_client() -> TestClient {
    TestClient::new(TestStore::memory(), SyncConfig::new().start_online(true))
}

/// Returns an offline client over an in-memory store.
pub fn offline_client() -> TestClient {
    TestClient::new(TestStore::memory(), SyncConfig::new().start_online(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::ORDERS;

    #[test]
    fn file_store_survives_reopen() {
        let store = TestStore::file();
        store.put(ORDERS, "A", &serde_json::json!({"id": "A"})).unwrap();

        let reopened = store.reopen();
        let value: Option<serde_json::Value> = reopened.get(ORDERS, "A").unwrap();
        assert!(value.is_some());
    }

    #[test]
    fn sibling_shares_backends() {
        let store = TestStore::memory();
        let other = store.sibling();
        store.put(ORDERS, "A", &1).unwrap();
        assert_eq!(other.get::<i32>(ORDERS, "A").unwrap(), Some(1));
    }

    #[test]
    fn flat_only_when_structured_disabled() {
        let store = TestStore::memory_with(StoreConfig::new().structured(false));
        assert!(store.structured.is_none());
        assert_eq!(store.kind(), harbor_storage::BackendKind::Flat);
    }
}
