//! Public facade over the local data layer and the sync engine.

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::engine::{SubmitOutcome, SyncEngine, SyncHandle, SyncStats};
use crate::error::{ClientError, ClientResult};
use crate::events::{DrainReport, SyncEvent};
use crate::transport::{JsonObject, RemoteTransport};
use harbor_core::{
    Clock, MutationOperation, MutationQueue, OrderStats, Record, RecordChange, RecordFilter,
    RecordId, RecordStatus, RecordStore, Subscription, TtlCache, STATS_CACHE_KEY,
};
use harbor_storage::DurableStore;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Offline-first client: local reads, optimistic writes, queued replay.
///
/// Every call answers from local state. Mutations are written locally
/// first, then sent immediately when online or queued for a later drain.
/// Transport failures on the write path are absorbed and reported through
/// [`OfflineClient::subscribe`].
///
/// # Example
///
/// ```rust
/// use harbor_core::DurableStore;
/// use harbor_sync::{MemoryRemote, OfflineClient, SyncConfig};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # tokio_test_block_on(async {
/// let remote = MemoryRemote::new();
/// let client = OfflineClient::open(
///     Arc::new(DurableStore::in_memory()),
///     Arc::new(remote.clone()),
///     SyncConfig::new().start_online(false),
/// )
/// .unwrap();
///
/// client.create_record(json!({"id": "A", "price": 100000})).await.unwrap();
/// assert!(client.get_record("A").unwrap().unwrap().offline);
///
/// client.set_online(true);
/// client.drain().await.unwrap();
/// assert!(!client.get_record("A").unwrap().unwrap().offline);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
pub struct OfflineClient {
    store: Arc<DurableStore>,
    records: Arc<RecordStore>,
    queue: Arc<MutationQueue>,
    cache: TtlCache,
    engine: Arc<SyncEngine>,
    clock: Arc<dyn Clock>,
    stats_generation: Mutex<Option<u64>>,
}

impl std::fmt::Debug for OfflineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineClient")
            .field("backend", &self.store.kind())
            .field("records", &self.records.len())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl OfflineClient {
    /// Opens a client over `store`, loading records and the queue.
    ///
    /// Expired cache entries are swept once here.
    pub fn open(
        store: Arc<DurableStore>,
        transport: Arc<dyn RemoteTransport>,
        config: SyncConfig,
    ) -> ClientResult<Self> {
        let records = Arc::new(RecordStore::load(Arc::clone(&store))?);
        let queue = Arc::new(MutationQueue::load(Arc::clone(&store))?);
        let cache = TtlCache::new(Arc::clone(&store));
        let clock = store.clock();

        let swept = cache.sweep_expired()?;
        cache.remove(STATS_CACHE_KEY)?;
        info!(
            backend = %store.kind(),
            records = records.len(),
            queued = queue.size(),
            swept,
            "opened offline client"
        );

        let connectivity = Connectivity::new(config.start_online);
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&records),
            Arc::clone(&queue),
            transport,
            connectivity,
            config,
        ));

        Ok(Self {
            store,
            records,
            queue,
            cache,
            engine,
            clock,
            stats_generation: Mutex::new(None),
        })
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    /// Returns the sync engine.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn parse_id(id: &str) -> ClientResult<RecordId> {
        Ok(RecordId::new(id)?)
    }

    fn live(&self, id: &RecordId) -> Option<Record> {
        self.records.get(id).filter(|record| !record.is_deleted())
    }

    /// Submits `op`, restoring `previous` locally if it could not be queued.
    async fn submit(&self, op: MutationOperation, previous: Option<Record>) -> ClientResult<()> {
        let id = op.id.clone();
        match self.engine.submit(op).await {
            Ok(SubmitOutcome::Confirmed | SubmitOutcome::Queued) => Ok(()),
            Err(err @ ClientError::StorageFull { .. }) => {
                warn!(id = %id, "queue rejected the operation, restoring local copy");
                let restored = match previous {
                    Some(record) => self.records.upsert(record),
                    None => self.records.remove(&id).map(|_| ()),
                };
                if let Err(restore_err) = restored {
                    warn!(id = %id, error = %restore_err, "could not restore local copy");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Creates a record from `payload`, generating an id if it has none.
    ///
    /// Returns the record as stored afterwards: the server copy when the
    /// create was confirmed immediately, the local copy otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ValidationFailure`] for malformed payloads or
    /// an id already in use, and [`ClientError::StorageFull`] if the record
    /// cannot be persisted.
    pub async fn create_record(&self, payload: Value) -> ClientResult<Record> {
        let now = self.now();
        let record = Record::new_local(&payload, now)?;
        let previous = self.records.get(&record.id);
        if previous.as_ref().is_some_and(|r| !r.is_deleted()) {
            return Err(ClientError::ValidationFailure(format!(
                "record {} already exists",
                record.id
            )));
        }

        self.records.upsert(record.clone())?;
        self.submit(MutationOperation::create(&record, now), previous)
            .await?;
        Ok(self.records.get(&record.id).unwrap_or(record))
    }

    /// Applies a partial update; `null` values remove fields.
    pub async fn update_record(&self, id: &str, patch: Value) -> ClientResult<Record> {
        let id = Self::parse_id(id)?;
        let previous = self
            .live(&id)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;

        let now = self.now();
        let mut record = previous.clone();
        record.apply_patch(&patch, now)?;

        self.records.upsert(record.clone())?;
        self.submit(MutationOperation::update(&record, now), Some(previous))
            .await?;
        Ok(self.records.get(&id).unwrap_or(record))
    }

    /// Deletes a record.
    ///
    /// The record is hidden from reads immediately and removed once the
    /// remote service confirms the delete.
    pub async fn delete_record(&self, id: &str) -> ClientResult<()> {
        let id = Self::parse_id(id)?;
        let previous = self
            .live(&id)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;

        let now = self.now();
        let mut record = previous.clone();
        record.mark_deleted(now);

        self.records.upsert(record)?;
        self.submit(MutationOperation::delete(id, now), Some(previous))
            .await
    }

    /// Returns a live record.
    pub fn get_record(&self, id: &str) -> ClientResult<Option<Record>> {
        let id = Self::parse_id(id)?;
        Ok(self.live(&id))
    }

    /// Returns the records matching `filter`.
    pub fn list_records(&self, filter: &RecordFilter) -> Vec<Record> {
        self.records.list(filter)
    }

    /// Reads a cached value.
    pub fn get_cached<T: DeserializeOwned>(&self, key: &str) -> ClientResult<Option<T>> {
        Ok(self.cache.get(key)?)
    }

    /// Caches a value for `ttl`.
    pub fn set_cached<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
        ttl: Duration,
    ) -> ClientResult<()> {
        Ok(self.cache.set(key, data, ttl)?)
    }

    /// Returns the cached value under `key`, fetching and caching it on a
    /// miss.
    pub async fn cached_or_fetch<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> ClientResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        if let Some(hit) = self.cache.get::<T>(key)? {
            return Ok(hit);
        }
        let value = fetch().await?;
        self.cache.set(key, &value, ttl)?;
        Ok(value)
    }

    /// Returns order statistics, cached until records change or the TTL
    /// runs out.
    pub fn order_stats(&self) -> ClientResult<OrderStats> {
        let generation = self.records.generation();
        let mut computed_at = self.stats_generation.lock();
        if *computed_at == Some(generation) {
            if let Some(stats) = self.cache.get::<OrderStats>(STATS_CACHE_KEY)? {
                return Ok(stats);
            }
        }

        let records = self.records.all();
        let stats = OrderStats::compute(&records, &self.engine.config().amount_field, self.now());
        self.cache
            .set(STATS_CACHE_KEY, &stats, self.engine.config().stats_ttl)?;
        *computed_at = Some(generation);
        debug!(total = stats.total, unsynced = stats.unsynced, "computed order stats");
        Ok(stats)
    }

    /// Fetches records from the remote service and stores the server copies.
    ///
    /// Records with local changes not yet confirmed are left untouched.
    /// Returns how many records were stored.
    pub async fn pull_remote(&self, filters: JsonObject) -> ClientResult<usize> {
        let listed = self.engine.list_remote(filters).await?;

        let now = self.now();
        let mut stored = 0;
        for object in listed {
            let record = match Record::from_server(&object, now) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping malformed server record");
                    continue;
                }
            };
            let pending = self.queue.contains(&record.id)
                || self.engine.is_in_flight(&record.id)
                || self.records.get(&record.id).is_some_and(|r| r.offline);
            if pending {
                continue;
            }
            self.records.upsert(record)?;
            stored += 1;
        }
        Ok(stored)
    }

    /// Replays the queue now.
    pub async fn drain(&self) -> ClientResult<DrainReport> {
        self.engine.drain().await
    }

    /// Updates the connectivity belief.
    pub fn set_online(&self, online: bool) {
        self.engine.set_online(online);
    }

    /// Returns the connectivity belief.
    pub fn is_online(&self) -> bool {
        self.engine.is_online()
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> Subscription<SyncEvent> {
        self.engine.subscribe()
    }

    /// Subscribes to record changes.
    pub fn subscribe_records(&self) -> Subscription<RecordChange> {
        self.records.subscribe()
    }

    /// Returns engine activity counters.
    pub fn sync_stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Re-submits an unresolved record: a create for pending-local records,
    /// a delete for deleted-local ones. Operations the remote service
    /// refused are released instead and, when online, drained at once.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotFound`] for unknown ids and
    /// [`ClientError::ValidationFailure`] if the record is synced or already
    /// queued.
    pub async fn retry_record(&self, id: &str) -> ClientResult<()> {
        let id = Self::parse_id(id)?;
        let record = self
            .records
            .get(&id)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        if self.queue.is_blocked(&id) {
            let released = self.queue.unblock(&id)?;
            info!(id = %id, released, "releasing refused operations");
            if self.engine.is_online() {
                self.engine.drain().await?;
            }
            return Ok(());
        }
        if self.queue.contains(&id) || self.engine.is_in_flight(&id) {
            return Err(ClientError::ValidationFailure(format!(
                "record {id} already has pending operations"
            )));
        }

        let now = self.now();
        let op = match record.status {
            RecordStatus::PendingLocal => MutationOperation::create(&record, now),
            RecordStatus::DeletedLocal => MutationOperation::delete(id.clone(), now),
            RecordStatus::Synced if record.offline => MutationOperation::create(&record, now),
            RecordStatus::Synced => {
                return Err(ClientError::ValidationFailure(format!(
                    "record {id} is already synced"
                )))
            }
        };
        info!(id = %id, kind = %op.kind, "retrying unresolved record");
        self.engine.submit(op).await?;
        Ok(())
    }

    /// Returns every queued operation in delivery order.
    pub fn pending_operations(&self) -> Vec<MutationOperation> {
        self.queue.peek_all()
    }

    /// Returns records flagged offline that have nothing queued or in
    /// flight, such as those whose operation was exhausted.
    pub fn unresolved_records(&self) -> Vec<Record> {
        self.records
            .list(&RecordFilter::new().offline(true).include_deleted())
            .into_iter()
            .filter(|record| {
                !self.queue.contains(&record.id) && !self.engine.is_in_flight(&record.id)
            })
            .collect()
    }

    /// Reloads records and the queue from storage, picking up writes made
    /// by another instance.
    pub fn reload_from_storage(&self) -> ClientResult<()> {
        self.engine.reload()
    }

    /// Starts the background sync loop.
    pub fn start_background(&self) -> SyncHandle {
        self.engine.spawn()
    }
}
