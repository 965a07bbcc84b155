//! Sync engine: immediate sends, queue drains and the background loop.
//!
//! # Ordering
//!
//! Operations on one record reach the remote service in submission order:
//!
//! - a mutation is sent immediately only when online and nothing for the
//!   same record is queued or already in flight; otherwise it is queued
//! - an immediate send reserves its queue position first, so if it fails it
//!   lands ahead of anything submitted while it was in flight
//! - a drain delivers one operation at a time from the head and stops at the
//!   first failure, or when the head's record has an immediate send in flight
//! - an operation refused with a non-retryable answer is blocked in place;
//!   drains stop at it until the record is retried
//! - only one drain runs at a time; a concurrent request is coalesced

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{ClientResult, TransportError, TransportResult};
use crate::events::{DrainReport, DrainStop, SyncEvent};
use crate::transport::{JsonObject, RemoteTransport};
use harbor_core::{
    Clock, EventFeed, MutationKind, MutationOperation, MutationQueue, Record, RecordId,
    RecordStore, Subscription,
};
use harbor_storage::{DurableStore, StorageChange};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of submitting a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The remote service confirmed the mutation within the call.
    Confirmed,
    /// The mutation was queued for a later drain.
    Queued,
}

/// Counters describing engine activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Mutations confirmed on the immediate path.
    pub immediate_confirmed: u64,
    /// Mutations written to the queue.
    pub queued: u64,
    /// Operations confirmed by drains.
    pub drained: u64,
    /// Failed remote calls.
    pub failed_attempts: u64,
    /// Operations abandoned after too many attempts.
    pub exhausted: u64,
    /// Drain cycles run.
    pub drains: u64,
}

/// Marks a record as having an immediate send in flight.
struct InFlight<'a> {
    map: &'a Mutex<HashMap<RecordId, usize>>,
    id: RecordId,
}

impl<'a> InFlight<'a> {
    fn enter(map: &'a Mutex<HashMap<RecordId, usize>>, id: RecordId) -> Self {
        *map.lock().entry(id.clone()).or_insert(0) += 1;
        Self { map, id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        if let Some(count) = map.get_mut(&self.id) {
            *count -= 1;
            if *count == 0 {
                map.remove(&self.id);
            }
        }
    }
}

struct DrainFlag<'a>(&'a AtomicBool);

impl Drop for DrainFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Reconciles the record store and mutation queue with a remote transport.
pub struct SyncEngine {
    store: Arc<DurableStore>,
    records: Arc<RecordStore>,
    queue: Arc<MutationQueue>,
    transport: Arc<dyn RemoteTransport>,
    connectivity: Connectivity,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    events: EventFeed<SyncEvent>,
    in_flight: Mutex<HashMap<RecordId, usize>>,
    draining: AtomicBool,
    kick: Notify,
    stats: Mutex<SyncStats>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("online", &self.connectivity.is_online())
            .field("queued", &self.queue.size())
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Creates an engine over the given components.
    ///
    /// `records` and `queue` must be loaded from `store`; timestamps come
    /// from the store's clock.
    pub fn new(
        store: Arc<DurableStore>,
        records: Arc<RecordStore>,
        queue: Arc<MutationQueue>,
        transport: Arc<dyn RemoteTransport>,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Self {
        let clock = store.clock();
        Self {
            store,
            records,
            queue,
            transport,
            connectivity,
            config,
            clock,
            events: EventFeed::new(),
            in_flight: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
            kick: Notify::new(),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the connectivity signal.
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Returns the current connectivity belief.
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Updates the connectivity belief, publishing an event on change.
    pub fn set_online(&self, online: bool) {
        if self.connectivity.set_online(online) {
            self.events.emit(SyncEvent::ConnectivityChanged { online });
        }
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> Subscription<SyncEvent> {
        self.events.subscribe()
    }

    /// Returns activity counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Returns true while a drain is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Returns true if `id` has an immediate send in flight.
    pub fn is_in_flight(&self, id: &RecordId) -> bool {
        self.in_flight.lock().contains_key(id)
    }

    /// Asks the background loop to run a drain.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Sends `op` now if possible, otherwise queues it.
    ///
    /// The local record must already reflect the mutation. A failed
    /// immediate send is absorbed: the operation is queued and the event
    /// feed reports the failure.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ClientError::StorageFull`] if the operation cannot be
    /// queued. Once the remote service has confirmed, local storage failures
    /// are reported as [`SyncEvent::ReconcileFailed`] instead.
    pub async fn submit(&self, op: MutationOperation) -> ClientResult<SubmitOutcome> {
        let id = op.id.clone();
        if !self.is_online() || self.queue.contains(&id) || self.is_in_flight(&id) {
            self.enqueue(op)?;
            return Ok(SubmitOutcome::Queued);
        }

        let seq = self.queue.reserve_seq();
        let guard = InFlight::enter(&self.in_flight, id.clone());
        let result = self.send(&op).await;

        let outcome = match result {
            Ok(response) => {
                self.settle(&op, response);
                self.stats.lock().immediate_confirmed += 1;
                self.events.emit(SyncEvent::Confirmed {
                    id: id.clone(),
                    kind: op.kind,
                });
                SubmitOutcome::Confirmed
            }
            Err(error) => {
                debug!(id = %id, kind = %op.kind, error = %error, "immediate send failed, queueing");
                self.stats.lock().failed_attempts += 1;
                let mut queued = op.with_seq(seq);
                queued.last_error = Some(error.to_string());
                queued.blocked = !error.is_retryable();
                let (kind, blocked) = (queued.kind, queued.blocked);
                self.enqueue(queued)?;
                self.events.emit(SyncEvent::TransportFailed {
                    id: id.clone(),
                    kind,
                    error: error.clone(),
                    attempts: 0,
                });
                if blocked {
                    warn!(id = %id, kind = %kind, error = %error, "remote refused mutation, holding it for retry");
                    self.events.emit(SyncEvent::Blocked {
                        id: id.clone(),
                        kind,
                        error,
                    });
                }
                SubmitOutcome::Queued
            }
        };
        drop(guard);

        if outcome == SubmitOutcome::Confirmed && !self.queue.is_empty() {
            self.kick();
        }
        Ok(outcome)
    }

    fn enqueue(&self, op: MutationOperation) -> ClientResult<()> {
        let id = op.id.clone();
        let kind = op.kind;
        self.queue.enqueue(op)?;
        self.stats.lock().queued += 1;
        self.events.emit(SyncEvent::Queued { id, kind });
        Ok(())
    }

    /// Performs the remote call for `op` under the request timeout.
    ///
    /// Returns the canonical server copy for creates and updates. A delete
    /// answered with 404 counts as confirmed.
    async fn send(&self, op: &MutationOperation) -> TransportResult<Option<JsonObject>> {
        let call = async {
            match op.kind {
                MutationKind::Create => {
                    let record = payload(op)?;
                    self.transport.create(record.to_wire()).await.map(Some)
                }
                MutationKind::Update => {
                    let record = payload(op)?;
                    self.transport
                        .update(op.id.as_str(), record.to_wire())
                        .await
                        .map(Some)
                }
                MutationKind::Delete => match self.transport.delete(op.id.as_str()).await {
                    Ok(()) => Ok(None),
                    Err(err) if err.is_not_found() => {
                        debug!(id = %op.id, "record already gone remotely");
                        Ok(None)
                    }
                    Err(err) => Err(err),
                },
            }
        };
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Reconciles a confirmed operation, keeping the local copy if that
    /// fails. The record then stays flagged offline with nothing queued.
    fn settle(&self, op: &MutationOperation, response: Option<JsonObject>) {
        if let Err(err) = self.reconcile(op, response) {
            warn!(id = %op.id, kind = %op.kind, error = %err, "confirmed remotely but the canonical copy was not stored");
            self.events.emit(SyncEvent::ReconcileFailed {
                id: op.id.clone(),
                kind: op.kind,
                error: err.to_string(),
            });
        }
    }

    /// Applies a confirmed operation to the record store.
    ///
    /// The local copy is left alone while later operations for the same
    /// record are still queued; the last of them reconciles.
    fn reconcile(&self, op: &MutationOperation, response: Option<JsonObject>) -> ClientResult<()> {
        if self.queue.contains(&op.id) {
            debug!(id = %op.id, "later operations queued, keeping local copy");
            return Ok(());
        }
        match (op.kind, response) {
            (MutationKind::Delete, _) => {
                self.records.remove(&op.id)?;
            }
            (_, Some(object)) => {
                let canonical = Record::from_server(&object, self.clock.now_millis())?;
                let renamed = canonical.id != op.id;
                self.records.upsert(canonical)?;
                if renamed {
                    self.records.remove(&op.id)?;
                }
            }
            (_, None) => {
                warn!(id = %op.id, "confirmed without a canonical copy");
            }
        }
        Ok(())
    }

    /// Replays the queue in order until it is empty or a call fails.
    ///
    /// # Errors
    ///
    /// Returns an error only for local storage failures; transport failures
    /// end the cycle and are reported in the [`DrainReport`].
    pub async fn drain(&self) -> ClientResult<DrainReport> {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("drain already running, coalescing");
            return Ok(DrainReport {
                remaining: self.queue.size(),
                stopped: Some(DrainStop::AlreadyRunning),
                ..DrainReport::default()
            });
        }
        let _flag = DrainFlag(&self.draining);
        self.stats.lock().drains += 1;

        let mut report = DrainReport::default();
        let pending = self.queue.size();
        if pending == 0 {
            return Ok(report);
        }
        info!(pending, "draining mutation queue");
        self.events.emit(SyncEvent::DrainStarted { pending });

        while let Some(op) = self.queue.head() {
            if !self.is_online() {
                report.stopped = Some(DrainStop::Offline);
                break;
            }
            if self.is_in_flight(&op.id) {
                report.stopped = Some(DrainStop::InFlight(op.id.clone()));
                break;
            }
            if op.blocked {
                report.stopped = Some(DrainStop::Blocked(op.id.clone()));
                break;
            }

            match self.send(&op).await {
                Ok(response) => {
                    self.queue.remove_seq(op.seq)?;
                    self.settle(&op, response);
                    report.delivered += 1;
                    self.stats.lock().drained += 1;
                    self.events.emit(SyncEvent::Confirmed {
                        id: op.id.clone(),
                        kind: op.kind,
                    });
                }
                Err(error) => {
                    let stop = self.handle_failure(&op, error, &mut report)?;
                    report.stopped = Some(stop);
                    break;
                }
            }
        }

        report.remaining = self.queue.size();
        info!(
            delivered = report.delivered,
            remaining = report.remaining,
            stopped = ?report.stopped,
            "drain finished"
        );
        self.events.emit(SyncEvent::DrainFinished(report.clone()));
        Ok(report)
    }

    fn handle_failure(
        &self,
        op: &MutationOperation,
        error: TransportError,
        report: &mut DrainReport,
    ) -> ClientResult<DrainStop> {
        self.stats.lock().failed_attempts += 1;
        if !error.is_retryable() {
            self.queue.block(op.seq, &error.to_string())?;
            warn!(id = %op.id, kind = %op.kind, error = %error, "remote refused queued operation, holding it for retry");
            self.events.emit(SyncEvent::Blocked {
                id: op.id.clone(),
                kind: op.kind,
                error,
            });
            return Ok(DrainStop::Blocked(op.id.clone()));
        }

        let attempts = self
            .queue
            .record_failure(op.seq, &error.to_string())?
            .unwrap_or(op.attempts + 1);

        if attempts < self.config.max_attempts {
            debug!(id = %op.id, attempts, error = %error, "delivery failed");
            self.events.emit(SyncEvent::TransportFailed {
                id: op.id.clone(),
                kind: op.kind,
                error: error.clone(),
                attempts,
            });
            return Ok(DrainStop::Failed(error));
        }

        let removed = self.queue.remove_seq(op.seq)?;
        let mut abandoned = removed.unwrap_or_else(|| op.clone());
        abandoned.attempts = attempts;
        abandoned.last_error = Some(error.to_string());
        warn!(id = %op.id, kind = %op.kind, attempts, error = %error, "giving up on queued operation");
        self.stats.lock().exhausted += 1;
        self.events.emit(SyncEvent::QueueExhausted {
            id: op.id.clone(),
            kind: op.kind,
            attempts,
            last_error: abandoned.last_error.clone(),
        });
        report.exhausted.push(abandoned);
        Ok(DrainStop::Failed(error))
    }

    /// Starts the background loop.
    ///
    /// The loop drains at start when online, on every offline to online
    /// edge, on [`SyncEngine::kick`], and every poll interval while work is
    /// queued, backing off after failed cycles. With
    /// [`SyncConfig::watch_storage`] set, in-memory views are reloaded when
    /// storage reports changes.
    pub fn spawn(self: &Arc<Self>) -> SyncHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move { engine.run(shutdown_rx).await });

        let watcher_stop = Arc::new(AtomicBool::new(false));
        if self.config.watch_storage {
            spawn_watcher(Arc::downgrade(self), &self.store, Arc::clone(&watcher_stop));
        }

        SyncHandle {
            shutdown,
            task: Some(task),
            watcher_stop,
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut online = self.connectivity.subscribe();
        let mut was_online = *online.borrow_and_update();
        let mut failures = 0;
        if was_online {
            failures = self.cycle(failures).await;
        }

        loop {
            let wait = if failures == 0 {
                self.config.poll_interval
            } else {
                self.config
                    .retry
                    .delay_for_attempt(failures)
                    .max(Duration::from_millis(10))
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_online = *online.borrow_and_update();
                    if now_online && !was_online {
                        failures = self.cycle(0).await;
                    }
                    was_online = now_online;
                }
                _ = self.kick.notified() => {
                    failures = self.cycle(failures).await;
                }
                _ = tokio::time::sleep(wait) => {
                    if self.is_online() && self.queue.head().is_some_and(|op| !op.blocked) {
                        failures = self.cycle(failures).await;
                    }
                }
            }
        }
        debug!("sync loop stopped");
    }

    /// Runs one drain and returns the updated failure streak.
    async fn cycle(&self, failures: u32) -> u32 {
        match self.drain().await {
            Ok(report) if report.failed() => failures.saturating_add(1),
            Ok(_) => 0,
            Err(err) => {
                warn!(error = %err, "drain aborted by storage error");
                failures.saturating_add(1)
            }
        }
    }

    /// Lists remote records within the request timeout.
    ///
    /// Fails fast with a network error while offline.
    pub async fn list_remote(&self, filters: JsonObject) -> TransportResult<Vec<JsonObject>> {
        if !self.is_online() {
            return Err(TransportError::Network("offline".to_string()));
        }
        match tokio::time::timeout(self.config.request_timeout, self.transport.list(filters)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Reloads the record store and queue from storage.
    pub fn reload(&self) -> ClientResult<()> {
        self.records.refresh()?;
        self.queue.refresh()?;
        Ok(())
    }
}

fn payload(op: &MutationOperation) -> TransportResult<&Record> {
    op.payload.as_ref().ok_or_else(|| {
        TransportError::InvalidRequest(format!("{} of {} has no payload", op.kind, op.id))
    })
}

/// Watches storage changes on a plain thread and reloads in-memory views.
fn spawn_watcher(engine: Weak<SyncEngine>, store: &DurableStore, stop: Arc<AtomicBool>) {
    let changes = store.watch();
    std::thread::spawn(move || loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match changes.recv_timeout(Duration::from_millis(200)) {
            Ok(first) => {
                let batch: Vec<StorageChange> = std::iter::once(first).chain(changes.try_iter()).collect();
                let Some(live) = engine.upgrade() else {
                    break;
                };
                debug!(changes = batch.len(), "storage changed, reloading views");
                if let Err(err) = live.reload() {
                    warn!(error = %err, "failed to reload after storage change");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if engine.strong_count() == 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    });
}

/// Handle to a running background loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    watcher_stop: Arc<AtomicBool>,
}

impl SyncHandle {
    /// Stops the loop and waits for it to finish.
    pub async fn stop(mut self) {
        self.signal();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "sync loop ended abnormally");
            }
        }
    }

    /// Returns true while the loop task is running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn signal(&self) {
        self.watcher_stop.store(true, Ordering::Release);
        let _ = self.shutdown.send(true);
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.signal();
    }
}
