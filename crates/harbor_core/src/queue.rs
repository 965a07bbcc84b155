//! Durable FIFO of pending remote mutations.
//!
//! The queue is persisted as a single snapshot under the `pending` key of the
//! `offlineQueue` collection, so an enqueue or dequeue is one atomic write.
//! Operations are ordered by sequence number. A sequence number can be
//! reserved before an operation is enqueued; the operation is then inserted
//! at its sequence position, ahead of anything reserved later.

use crate::error::CoreResult;
use crate::record::Record;
use crate::types::{RecordId, OFFLINE_QUEUE};
use harbor_storage::DurableStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Key of the queue snapshot inside [`OFFLINE_QUEUE`].
pub const QUEUE_KEY: &str = "pending";

/// Kind of remote mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    /// Create the record remotely.
    Create,
    /// Update the record remotely.
    Update,
    /// Delete the record remotely.
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// A queued remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOperation {
    /// Position in the queue; zero until enqueued.
    pub seq: u64,
    /// Target record.
    pub id: RecordId,
    /// What to do remotely.
    pub kind: MutationKind,
    /// Record snapshot for create and update.
    pub payload: Option<Record>,
    /// Milliseconds since the Unix epoch when the operation was created.
    pub enqueued_at: u64,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Message of the last failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set when the remote service refused the operation outright; a
    /// blocked operation is not delivered again until it is released.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
}

impl MutationOperation {
    fn new(kind: MutationKind, id: RecordId, payload: Option<Record>, now: u64) -> Self {
        Self {
            seq: 0,
            id,
            kind,
            payload,
            enqueued_at: now,
            attempts: 0,
            last_error: None,
            blocked: false,
        }
    }

    /// A create carrying `record`.
    pub fn create(record: &Record, now: u64) -> Self {
        Self::new(MutationKind::Create, record.id.clone(), Some(record.clone()), now)
    }

    /// An update carrying `record`.
    pub fn update(record: &Record, now: u64) -> Self {
        Self::new(MutationKind::Update, record.id.clone(), Some(record.clone()), now)
    }

    /// A delete of `id`.
    pub fn delete(id: RecordId, now: u64) -> Self {
        Self::new(MutationKind::Delete, id, None, now)
    }

    /// Sets a reserved sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshot {
    next_seq: u64,
    operations: Vec<MutationOperation>,
}

#[derive(Debug, Clone)]
struct QueueState {
    next_seq: u64,
    ops: VecDeque<MutationOperation>,
}

impl QueueState {
    fn from_snapshot(snapshot: QueueSnapshot) -> Self {
        let mut ops: Vec<_> = snapshot.operations;
        ops.sort_by_key(|op| op.seq);
        let max_seq = ops.last().map(|op| op.seq).unwrap_or(0);
        Self {
            next_seq: snapshot.next_seq.max(max_seq + 1).max(1),
            ops: ops.into(),
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            next_seq: self.next_seq,
            operations: self.ops.iter().cloned().collect(),
        }
    }
}

/// Durable, ordered queue of [`MutationOperation`]s.
#[derive(Debug)]
pub struct MutationQueue {
    store: Arc<DurableStore>,
    state: Mutex<QueueState>,
}

impl MutationQueue {
    /// Loads the persisted queue; a missing snapshot is an empty queue.
    pub fn load(store: Arc<DurableStore>) -> CoreResult<Self> {
        let state = read_state(&store)?;
        debug!(pending = state.ops.len(), "loaded mutation queue");
        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// Runs `change` on a copy of the state and persists it; the in-memory
    /// state is only replaced if the write succeeds.
    fn commit<R>(&self, change: impl FnOnce(&mut QueueState) -> R) -> CoreResult<R> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let out = change(&mut next);
        self.store.put(OFFLINE_QUEUE, QUEUE_KEY, &next.snapshot())?;
        *state = next;
        Ok(out)
    }

    /// Reserves the next sequence number.
    pub fn reserve_seq(&self) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    /// Appends `op`, or inserts it at its reserved position, and returns its
    /// sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::StorageFull`] if the queue cannot be
    /// persisted; the queue is unchanged in that case.
    pub fn enqueue(&self, mut op: MutationOperation) -> CoreResult<u64> {
        self.commit(|state| {
            if op.seq == 0 {
                op.seq = state.next_seq;
                state.next_seq += 1;
            } else if op.seq >= state.next_seq {
                state.next_seq = op.seq + 1;
            }
            let seq = op.seq;
            let pos = state.ops.partition_point(|queued| queued.seq < seq);
            debug!(seq, id = %op.id, kind = %op.kind, "enqueued mutation");
            state.ops.insert(pos, op);
            seq
        })
    }

    /// Removes and returns the earliest operation targeting `id`.
    pub fn dequeue(&self, id: &RecordId) -> CoreResult<Option<MutationOperation>> {
        if !self.contains(id) {
            return Ok(None);
        }
        self.commit(|state| {
            let pos = state.ops.iter().position(|op| &op.id == id)?;
            state.ops.remove(pos)
        })
    }

    /// Removes and returns the operation with sequence number `seq`.
    pub fn remove_seq(&self, seq: u64) -> CoreResult<Option<MutationOperation>> {
        if !self.state.lock().ops.iter().any(|op| op.seq == seq) {
            return Ok(None);
        }
        self.commit(|state| {
            let pos = state.ops.iter().position(|op| op.seq == seq)?;
            state.ops.remove(pos)
        })
    }

    /// Records a failed attempt, returning the new attempt count.
    pub fn record_failure(&self, seq: u64, error: &str) -> CoreResult<Option<u32>> {
        if !self.state.lock().ops.iter().any(|op| op.seq == seq) {
            return Ok(None);
        }
        self.commit(|state| {
            let op = state.ops.iter_mut().find(|op| op.seq == seq)?;
            op.attempts += 1;
            op.last_error = Some(error.to_string());
            Some(op.attempts)
        })
    }

    /// Marks the operation with sequence number `seq` as blocked without
    /// counting an attempt. Returns false if it is no longer queued.
    pub fn block(&self, seq: u64, error: &str) -> CoreResult<bool> {
        if !self.state.lock().ops.iter().any(|op| op.seq == seq) {
            return Ok(false);
        }
        self.commit(|state| match state.ops.iter_mut().find(|op| op.seq == seq) {
            Some(op) => {
                op.blocked = true;
                op.last_error = Some(error.to_string());
                true
            }
            None => false,
        })
    }

    /// Releases every blocked operation targeting `id`, returning how many
    /// were released.
    pub fn unblock(&self, id: &RecordId) -> CoreResult<usize> {
        let blocked = self
            .state
            .lock()
            .ops
            .iter()
            .any(|op| &op.id == id && op.blocked);
        if !blocked {
            return Ok(0);
        }
        self.commit(|state| {
            let mut released = 0;
            for op in state.ops.iter_mut().filter(|op| &op.id == id && op.blocked) {
                op.blocked = false;
                released += 1;
            }
            released
        })
    }

    /// Returns true if an operation targeting `id` is blocked.
    pub fn is_blocked(&self, id: &RecordId) -> bool {
        self.state
            .lock()
            .ops
            .iter()
            .any(|op| &op.id == id && op.blocked)
    }

    /// Returns the operation that would be delivered next.
    pub fn head(&self) -> Option<MutationOperation> {
        self.state.lock().ops.front().cloned()
    }

    /// Returns every queued operation in delivery order.
    pub fn peek_all(&self) -> Vec<MutationOperation> {
        self.state.lock().ops.iter().cloned().collect()
    }

    /// Returns true if any operation targets `id`.
    pub fn contains(&self, id: &RecordId) -> bool {
        self.state.lock().ops.iter().any(|op| &op.id == id)
    }

    /// Returns how many operations target `id`.
    pub fn pending_for(&self, id: &RecordId) -> usize {
        self.state.lock().ops.iter().filter(|op| &op.id == id).count()
    }

    /// Returns the number of queued operations.
    pub fn size(&self) -> usize {
        self.state.lock().ops.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.state.lock().ops.is_empty()
    }

    /// Reloads the queue from storage.
    ///
    /// Sequence numbers already reserved in this process stay reserved.
    pub fn refresh(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        let fresh = read_state(&self.store)?;
        let next_seq = state.next_seq.max(fresh.next_seq);
        *state = QueueState { next_seq, ..fresh };
        Ok(())
    }
}

fn read_state(store: &DurableStore) -> CoreResult<QueueState> {
    let snapshot = store
        .get::<QueueSnapshot>(OFFLINE_QUEUE, QUEUE_KEY)?
        .unwrap_or_default();
    Ok(QueueState::from_snapshot(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> Record {
        Record::new_local(&json!({"id": id}), 0).unwrap()
    }

    fn id(s: &str) -> RecordId {
        RecordId::new(s).unwrap()
    }

    fn queue() -> (MutationQueue, Arc<DurableStore>) {
        let store = Arc::new(DurableStore::in_memory());
        (MutationQueue::load(Arc::clone(&store)).unwrap(), store)
    }

    #[test]
    fn fifo_order_and_sequence_numbers() {
        let (queue, _) = queue();
        let a = queue.enqueue(MutationOperation::create(&record("A"), 0)).unwrap();
        let b = queue.enqueue(MutationOperation::create(&record("B"), 0)).unwrap();
        assert!(a < b);

        let ids: Vec<_> = queue.peek_all().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![id("A"), id("B")]);
        assert_eq!(queue.head().unwrap().seq, a);
    }

    #[test]
    fn dequeue_removes_earliest_for_id() {
        let (queue, _) = queue();
        queue.enqueue(MutationOperation::update(&record("A"), 1)).unwrap();
        queue.enqueue(MutationOperation::update(&record("B"), 2)).unwrap();
        queue.enqueue(MutationOperation::delete(id("A"), 3)).unwrap();

        let first = queue.dequeue(&id("A")).unwrap().unwrap();
        assert_eq!(first.kind, MutationKind::Update);
        assert_eq!(queue.pending_for(&id("A")), 1);
        assert_eq!(queue.dequeue(&id("Z")).unwrap(), None);
    }

    #[test]
    fn reserved_seq_is_inserted_in_order() {
        let (queue, _) = queue();
        let reserved = queue.reserve_seq();
        let later = queue.enqueue(MutationOperation::update(&record("A"), 1)).unwrap();
        assert!(later > reserved);

        queue
            .enqueue(MutationOperation::create(&record("A"), 0).with_seq(reserved))
            .unwrap();
        let kinds: Vec<_> = queue.peek_all().into_iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![MutationKind::Create, MutationKind::Update]);
    }

    #[test]
    fn survives_reload() {
        let (queue, store) = queue();
        let seq = queue.enqueue(MutationOperation::delete(id("A"), 5)).unwrap();
        queue.record_failure(seq, "timeout").unwrap();

        let reloaded = MutationQueue::load(store).unwrap();
        let head = reloaded.head().unwrap();
        assert_eq!(head.attempts, 1);
        assert_eq!(head.last_error.as_deref(), Some("timeout"));
        assert!(reloaded.enqueue(MutationOperation::delete(id("B"), 6)).unwrap() > seq);
    }

    #[test]
    fn record_failure_counts_attempts() {
        let (queue, _) = queue();
        let seq = queue.enqueue(MutationOperation::delete(id("A"), 0)).unwrap();
        assert_eq!(queue.record_failure(seq, "e1").unwrap(), Some(1));
        assert_eq!(queue.record_failure(seq, "e2").unwrap(), Some(2));
        assert_eq!(queue.record_failure(seq + 100, "e").unwrap(), None);
    }

    #[test]
    fn block_and_release() {
        let (queue, store) = queue();
        let seq = queue.enqueue(MutationOperation::update(&record("A"), 0)).unwrap();
        assert!(queue.block(seq, "422 bad price").unwrap());
        assert!(!queue.block(seq + 100, "e").unwrap());

        let head = queue.head().unwrap();
        assert!(head.blocked);
        assert_eq!(head.attempts, 0);
        assert_eq!(head.last_error.as_deref(), Some("422 bad price"));
        assert!(MutationQueue::load(Arc::clone(&store)).unwrap().is_blocked(&id("A")));

        assert_eq!(queue.unblock(&id("A")).unwrap(), 1);
        assert!(!queue.is_blocked(&id("A")));
        assert_eq!(queue.unblock(&id("A")).unwrap(), 0);
    }

    #[test]
    fn remove_seq_targets_one_operation() {
        let (queue, _) = queue();
        let first = queue.enqueue(MutationOperation::update(&record("A"), 0)).unwrap();
        queue.enqueue(MutationOperation::update(&record("A"), 1)).unwrap();

        assert_eq!(queue.remove_seq(first).unwrap().unwrap().seq, first);
        assert_eq!(queue.size(), 1);
        assert!(queue.remove_seq(first).unwrap().is_none());
    }

    #[test]
    fn refresh_sees_other_writers() {
        let store = Arc::new(DurableStore::in_memory());
        let a = MutationQueue::load(Arc::clone(&store)).unwrap();
        let b = MutationQueue::load(Arc::clone(&store)).unwrap();

        a.enqueue(MutationOperation::delete(id("A"), 0)).unwrap();
        assert!(b.is_empty());
        b.refresh().unwrap();
        assert!(b.contains(&id("A")));
    }

    #[test]
    fn persisted_layout() {
        let (queue, store) = queue();
        queue.enqueue(MutationOperation::delete(id("A"), 9)).unwrap();

        let raw: serde_json::Value = store.get(OFFLINE_QUEUE, QUEUE_KEY).unwrap().unwrap();
        assert_eq!(raw["operations"][0]["kind"], json!("delete"));
        assert_eq!(raw["operations"][0]["enqueuedAt"], json!(9));
        assert_eq!(raw["nextSeq"], json!(2));
    }
}
