//! Remote transport abstraction.
//!
//! The remote service is reached through four actions: create, update,
//! delete and list. Records travel as JSON objects carrying their `id` and
//! business fields.
//!
//! # Contract
//!
//! - `create` is an upsert keyed by the client-generated id, so a replayed
//!   create never produces a second record
//! - `update` carries the full record snapshot and replaces the remote fields
//! - create and update answer with the canonical server copy

use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// A JSON object as exchanged with the remote service.
pub type JsonObject = Map<String, Value>;

/// Field the in-memory server bumps on every write.
pub const REVISION_FIELD: &str = "revision";

/// Transport used by the sync engine to reach the remote service.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Creates (or idempotently replaces) a record, returning the canonical copy.
    async fn create(&self, record: JsonObject) -> TransportResult<JsonObject>;

    /// Replaces the fields of record `id`, returning the canonical copy.
    async fn update(&self, id: &str, record: JsonObject) -> TransportResult<JsonObject>;

    /// Deletes record `id`.
    async fn delete(&self, id: &str) -> TransportResult<()>;

    /// Lists records whose fields equal every entry of `filters`.
    async fn list(&self, filters: JsonObject) -> TransportResult<Vec<JsonObject>>;
}

/// Remote action, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteAction {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `list`
    List,
}

impl RemoteAction {
    /// Returns the wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
        }
    }

    /// Parses a wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "list" => Some(Self::List),
            _ => None,
        }
    }
}

/// One call received by a [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    /// The action.
    pub action: RemoteAction,
    /// Target record, if the action has one.
    pub id: Option<String>,
}

#[derive(Debug)]
struct RemoteInner {
    records: BTreeMap<String, JsonObject>,
    reachable: bool,
    failures: VecDeque<TransportError>,
    apply_then_fail: usize,
    latency: Duration,
    calls: Vec<RemoteCall>,
    next_server_id: u64,
}

impl Default for RemoteInner {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            reachable: true,
            failures: VecDeque::new(),
            apply_then_fail: 0,
            latency: Duration::ZERO,
            calls: Vec::new(),
            next_server_id: 1,
        }
    }
}

/// In-memory remote service for tests and local development.
///
/// Clones share state, so a test can hand one clone to the client and keep
/// another to script failures and inspect the server side.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<RemoteInner>>,
}

impl MemoryRemote {
    /// Creates an empty, reachable remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with a network error while `false`.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// Returns whether the remote is reachable.
    pub fn is_reachable(&self) -> bool {
        self.inner.lock().reachable
    }

    /// Fails the next call with `error` without applying it.
    pub fn fail_next(&self, error: TransportError) {
        self.inner.lock().failures.push_back(error);
    }

    /// Fails the next `count` calls with `error`.
    pub fn fail_next_n(&self, error: TransportError, count: usize) {
        let mut inner = self.inner.lock();
        for _ in 0..count {
            inner.failures.push_back(error.clone());
        }
    }

    /// Applies the next write but answers with a timeout, as if the
    /// response was lost.
    pub fn apply_then_fail_next(&self) {
        self.inner.lock().apply_then_fail += 1;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Returns every call received so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.inner.lock().calls.clone()
    }

    /// Returns how many calls of `action` were received.
    pub fn call_count(&self, action: RemoteAction) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| call.action == action)
            .count()
    }

    /// Returns the server copy of record `id`.
    pub fn record(&self, id: &str) -> Option<JsonObject> {
        self.inner.lock().records.get(id).cloned()
    }

    /// Returns every server record in id order.
    pub fn records(&self) -> Vec<JsonObject> {
        self.inner.lock().records.values().cloned().collect()
    }

    /// Returns the number of server records.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns true if the server holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Seeds a server-side record directly.
    pub fn insert(&self, record: JsonObject) {
        let mut inner = self.inner.lock();
        let id = match record.get("id") {
            Some(Value::String(id)) => id.clone(),
            _ => {
                let id = format!("srv-{}", inner.next_server_id);
                inner.next_server_id += 1;
                id
            }
        };
        let mut record = record;
        record.insert("id".to_string(), Value::String(id.clone()));
        inner.records.insert(id, record);
    }

    async fn begin(&self, action: RemoteAction, id: Option<&str>) -> TransportResult<()> {
        let latency = {
            let mut inner = self.inner.lock();
            inner.calls.push(RemoteCall {
                action,
                id: id.map(str::to_string),
            });
            inner.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock();
        if !inner.reachable {
            return Err(TransportError::Network("remote unreachable".to_string()));
        }
        match inner.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Answers an applied write, or loses the answer if scripted to.
    fn finish<T>(&self, value: T) -> TransportResult<T> {
        let mut inner = self.inner.lock();
        if inner.apply_then_fail > 0 {
            inner.apply_then_fail -= 1;
            return Err(TransportError::Timeout);
        }
        Ok(value)
    }
}

/// Copies the business fields of `source` onto a fresh canonical object.
fn canonical(id: &str, source: &JsonObject, revision: u64) -> JsonObject {
    let mut record: JsonObject = source
        .iter()
        .filter(|(name, _)| !matches!(name.as_str(), "id" | "status" | "offline" | REVISION_FIELD))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    record.insert("id".to_string(), Value::String(id.to_string()));
    record.insert(REVISION_FIELD.to_string(), Value::from(revision));
    record
}

fn revision_of(record: &JsonObject) -> u64 {
    record
        .get(REVISION_FIELD)
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

#[async_trait]
impl RemoteTransport for MemoryRemote {
    async fn create(&self, record: JsonObject) -> TransportResult<JsonObject> {
        let id = match record.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        self.begin(RemoteAction::Create, id.as_deref()).await?;

        let stored = {
            let mut inner = self.inner.lock();
            let id = match id {
                Some(id) => id,
                None => {
                    let id = format!("srv-{}", inner.next_server_id);
                    inner.next_server_id += 1;
                    id
                }
            };
            let revision = inner.records.get(&id).map(revision_of).unwrap_or(0) + 1;
            let stored = canonical(&id, &record, revision);
            inner.records.insert(id, stored.clone());
            stored
        };
        self.finish(stored)
    }

    async fn update(&self, id: &str, record: JsonObject) -> TransportResult<JsonObject> {
        self.begin(RemoteAction::Update, Some(id)).await?;

        let stored = {
            let mut inner = self.inner.lock();
            let Some(existing) = inner.records.get(id) else {
                return Err(TransportError::status(404, format!("no record {id}")));
            };
            let stored = canonical(id, &record, revision_of(existing) + 1);
            inner.records.insert(id.to_string(), stored.clone());
            stored
        };
        self.finish(stored)
    }

    async fn delete(&self, id: &str) -> TransportResult<()> {
        self.begin(RemoteAction::Delete, Some(id)).await?;

        if self.inner.lock().records.remove(id).is_none() {
            return Err(TransportError::status(404, format!("no record {id}")));
        }
        self.finish(())
    }

    async fn list(&self, filters: JsonObject) -> TransportResult<Vec<JsonObject>> {
        self.begin(RemoteAction::List, None).await?;

        let inner = self.inner.lock();
        Ok(inner
            .records
            .values()
            .filter(|record| {
                filters
                    .iter()
                    .all(|(name, value)| record.get(name) == Some(value))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn create_is_idempotent_upsert() {
        let remote = MemoryRemote::new();
        let first = remote.create(object(json!({"id": "A", "price": 1}))).await.unwrap();
        let second = remote.create(object(json!({"id": "A", "price": 1}))).await.unwrap();

        assert_eq!(remote.len(), 1);
        assert_eq!(first["revision"], json!(1));
        assert_eq!(second["revision"], json!(2));
        assert_eq!(remote.call_count(RemoteAction::Create), 2);
    }

    #[tokio::test]
    async fn create_without_id_gets_server_id() {
        let remote = MemoryRemote::new();
        let created = remote.create(object(json!({"price": 1}))).await.unwrap();
        assert_eq!(created["id"], json!("srv-1"));
    }

    #[tokio::test]
    async fn update_replaces_fields() {
        let remote = MemoryRemote::new();
        remote
            .create(object(json!({"id": "A", "price": 1, "note": "x"})))
            .await
            .unwrap();
        let updated = remote.update("A", object(json!({"price": 2}))).await.unwrap();

        assert_eq!(updated, object(json!({"id": "A", "price": 2, "revision": 2})));
        let missing = remote.update("Z", object(json!({}))).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn delete_and_list() {
        let remote = MemoryRemote::new();
        remote.insert(object(json!({"id": "A", "kind": "x"})));
        remote.insert(object(json!({"id": "B", "kind": "y"})));

        let listed = remote.list(object(json!({"kind": "x"}))).await.unwrap();
        assert_eq!(listed.len(), 1);

        remote.delete("A").await.unwrap();
        assert!(remote.delete("A").await.unwrap_err().is_not_found());
        assert_eq!(remote.len(), 1);
    }

    #[tokio::test]
    async fn scripted_failures() {
        let remote = MemoryRemote::new();
        remote.fail_next(TransportError::status(500, "boom"));
        assert!(remote.create(object(json!({"id": "A"}))).await.is_err());
        assert!(remote.is_empty());

        remote.set_reachable(false);
        assert!(matches!(
            remote.list(JsonObject::new()).await,
            Err(TransportError::Network(_))
        ));
        remote.set_reachable(true);

        remote.apply_then_fail_next();
        assert_eq!(
            remote.create(object(json!({"id": "A"}))).await,
            Err(TransportError::Timeout)
        );
        assert_eq!(remote.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_calls() {
        let remote = MemoryRemote::new();
        remote.set_latency(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        remote.list(JsonObject::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn action_names() {
        for action in [
            RemoteAction::Create,
            RemoteAction::Update,
            RemoteAction::Delete,
            RemoteAction::List,
        ] {
            assert_eq!(RemoteAction::parse(action.as_str()), Some(action));
        }
    }
}
