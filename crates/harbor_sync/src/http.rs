//! HTTP transport implementation.
//!
//! Every call is a POST of a `{ "action", "payload" }` envelope to one
//! endpoint. The actual HTTP client is abstracted via a trait so any HTTP
//! library can sit underneath.

use crate::config::RetryConfig;
use crate::error::{TransportError, TransportResult};
use crate::transport::{JsonObject, MemoryRemote, RemoteAction, RemoteTransport};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// HTTP client abstraction.
///
/// Errors returned here are connection-level (`Network`, `Timeout`); status
/// codes travel in [`HttpResponse`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with a JSON body.
    async fn post(&self, url: &str, body: String) -> TransportResult<HttpResponse>;
}

/// Envelope-based transport over an [`HttpClient`].
///
/// Retryable failures are retried in-call according to its [`RetryConfig`].
pub struct HttpTransport<C: HttpClient> {
    url: String,
    client: C,
    retry: RetryConfig,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> std::fmt::Debug for HttpTransport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport posting to `url` with default retries.
    pub fn new(url: impl Into<String>, client: C) -> Self {
        Self {
            url: url.into(),
            client,
            retry: RetryConfig::default(),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the in-call retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the message of the last failed call.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn call(&self, action: RemoteAction, payload: Value) -> TransportResult<Value> {
        let envelope = json!({ "action": action.as_str(), "payload": payload }).to_string();
        let mut attempt = 0;
        loop {
            match self.post_once(&envelope).await {
                Ok(value) => {
                    *self.last_error.write() = None;
                    return Ok(value);
                }
                Err(err) => {
                    *self.last_error.write() = Some(err.to_string());
                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.retry.max_attempts {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(action = action.as_str(), attempt, ?delay, error = %err, "retrying request");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn post_once(&self, envelope: &str) -> TransportResult<Value> {
        let response = self.client.post(&self.url, envelope.to_string()).await?;
        if !(200..300).contains(&response.status) {
            return Err(TransportError::status(response.status, error_message(&response.body)));
        }
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        let body: Value = serde_json::from_str(&response.body)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        Ok(unwrap_data(body))
    }
}

/// Accepts bodies either bare or wrapped in `{ "data": ... }`.
fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut object) if object.len() == 1 && object.contains_key("data") => {
            object.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

fn into_object(value: Value) -> TransportResult<JsonObject> {
    match value {
        Value::Object(object) => Ok(object),
        other => Err(TransportError::InvalidResponse(format!(
            "expected an object, got {other}"
        ))),
    }
}

#[async_trait]
impl<C: HttpClient> RemoteTransport for HttpTransport<C> {
    async fn create(&self, record: JsonObject) -> TransportResult<JsonObject> {
        into_object(self.call(RemoteAction::Create, Value::Object(record)).await?)
    }

    async fn update(&self, id: &str, record: JsonObject) -> TransportResult<JsonObject> {
        let payload = json!({ "id": id, "patch": record });
        into_object(self.call(RemoteAction::Update, payload).await?)
    }

    async fn delete(&self, id: &str) -> TransportResult<()> {
        self.call(RemoteAction::Delete, json!({ "id": id })).await?;
        Ok(())
    }

    async fn list(&self, filters: JsonObject) -> TransportResult<Vec<JsonObject>> {
        match self.call(RemoteAction::List, Value::Object(filters)).await? {
            Value::Array(items) => items.into_iter().map(into_object).collect(),
            Value::Null => Ok(Vec::new()),
            other => Err(TransportError::InvalidResponse(format!(
                "expected an array, got {other}"
            ))),
        }
    }
}

/// An HTTP client that routes envelopes straight to a [`MemoryRemote`].
///
/// Useful for exercising [`HttpTransport`] without a network.
#[derive(Debug, Clone, Default)]
pub struct LoopbackClient {
    remote: MemoryRemote,
}

impl LoopbackClient {
    /// Creates a client connected to `remote`.
    pub fn new(remote: MemoryRemote) -> Self {
        Self { remote }
    }

    async fn dispatch(&self, envelope: &Value) -> TransportResult<Value> {
        let action = envelope
            .get("action")
            .and_then(Value::as_str)
            .and_then(RemoteAction::parse)
            .ok_or_else(|| TransportError::status(400, "unknown action"))?;
        let payload = envelope.get("payload").cloned().unwrap_or(Value::Null);
        let object = |value: Value| -> TransportResult<JsonObject> {
            match value {
                Value::Object(object) => Ok(object),
                _ => Err(TransportError::status(400, "payload must be an object")),
            }
        };

        match action {
            RemoteAction::Create => Ok(Value::Object(self.remote.create(object(payload)?).await?)),
            RemoteAction::Update => {
                let id = payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransportError::status(400, "missing id"))?
                    .to_string();
                let patch = object(payload.get("patch").cloned().unwrap_or(Value::Null))?;
                Ok(Value::Object(self.remote.update(&id, patch).await?))
            }
            RemoteAction::Delete => {
                let id = payload
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransportError::status(400, "missing id"))?;
                self.remote.delete(id).await?;
                Ok(json!({ "ok": true }))
            }
            RemoteAction::List => {
                let items = self.remote.list(object(payload)?).await?;
                Ok(Value::Array(items.into_iter().map(Value::Object).collect()))
            }
        }
    }
}

#[async_trait]
impl HttpClient for LoopbackClient {
    async fn post(&self, _url: &str, body: String) -> TransportResult<HttpResponse> {
        let envelope: Value = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "loopback received malformed envelope");
                return Ok(HttpResponse::new(400, json!({ "error": err.to_string() }).to_string()));
            }
        };
        match self.dispatch(&envelope).await {
            Ok(data) => Ok(HttpResponse::new(200, json!({ "data": data }).to_string())),
            Err(TransportError::HttpStatus { code, message }) => Ok(HttpResponse::new(
                code,
                json!({ "error": message }).to_string(),
            )),
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Default, Clone)]
    struct ScriptedClient {
        responses: Arc<Mutex<VecDeque<TransportResult<HttpResponse>>>>,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedClient {
        fn push(&self, response: TransportResult<HttpResponse>) {
            self.responses.lock().push_back(response);
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn post(&self, _url: &str, body: String) -> TransportResult<HttpResponse> {
            self.requests.lock().push(body);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Network("no response scripted".into())))
        }
    }

    fn object(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn sends_envelope_and_unwraps_data() {
        let client = ScriptedClient::default();
        client.push(Ok(HttpResponse::new(200, r#"{"data": {"id": "A", "price": 1}}"#)));
        let transport = HttpTransport::new("https://api.example.com/rpc", client.clone());

        let created = transport.create(object(json!({"id": "A", "price": 1}))).await.unwrap();
        assert_eq!(created["id"], json!("A"));

        let sent: Value = serde_json::from_str(&client.requests.lock()[0]).unwrap();
        assert_eq!(sent["action"], json!("create"));
        assert_eq!(sent["payload"]["price"], json!(1));
    }

    #[tokio::test]
    async fn accepts_bare_bodies() {
        let client = ScriptedClient::default();
        client.push(Ok(HttpResponse::new(200, r#"[{"id": "A"}, {"id": "B"}]"#)));
        let transport = HttpTransport::new("u", client);

        let listed = transport.list(JsonObject::new()).await.unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let client = ScriptedClient::default();
        client.push(Ok(HttpResponse::new(422, r#"{"error": "bad price"}"#)));
        let transport = HttpTransport::new("u", client.clone());

        let err = transport.delete("A").await.unwrap_err();
        assert_eq!(err, TransportError::status(422, "bad price"));
        assert_eq!(client.requests.lock().len(), 1);
        assert!(transport.last_error().unwrap().contains("422"));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_retried() {
        let client = ScriptedClient::default();
        client.push(Ok(HttpResponse::new(503, "unavailable")));
        client.push(Err(TransportError::Network("reset".into())));
        client.push(Ok(HttpResponse::new(200, r#"{"data": {"ok": true}}"#)));
        let transport = HttpTransport::new("u", client.clone()).with_retry(RetryConfig::new(3));

        transport.delete("A").await.unwrap();
        assert_eq!(client.requests.lock().len(), 3);
        assert!(transport.last_error().is_none());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let client = ScriptedClient::default();
        let transport = HttpTransport::new("u", client.clone()).with_retry(RetryConfig::no_retry());

        let err = transport.delete("A").await.unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
        assert_eq!(client.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn rejects_malformed_bodies() {
        let client = ScriptedClient::default();
        client.push(Ok(HttpResponse::new(200, "not json")));
        client.push(Ok(HttpResponse::new(200, r#"{"data": 5}"#)));
        let transport = HttpTransport::new("u", client).with_retry(RetryConfig::no_retry());

        assert!(matches!(
            transport.create(JsonObject::new()).await,
            Err(TransportError::InvalidResponse(_))
        ));
        assert!(matches!(
            transport.create(JsonObject::new()).await,
            Err(TransportError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn loopback_round_trip() {
        let remote = MemoryRemote::new();
        let transport = HttpTransport::new("loopback", LoopbackClient::new(remote.clone()))
            .with_retry(RetryConfig::no_retry());

        transport.create(object(json!({"id": "A", "price": 1}))).await.unwrap();
        let updated = transport.update("A", object(json!({"price": 2}))).await.unwrap();
        assert_eq!(updated["price"], json!(2));
        assert_eq!(transport.list(JsonObject::new()).await.unwrap().len(), 1);

        transport.delete("A").await.unwrap();
        assert!(transport.delete("A").await.unwrap_err().is_not_found());
        assert!(remote.is_empty());
    }
}
