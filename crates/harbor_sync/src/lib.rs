//! # Harbor Sync
//!
//! Remote delivery for the harbor offline-first client.
//!
//! This crate provides:
//! - [`OfflineClient`] - the facade applications call
//! - [`SyncEngine`] - immediate sends, queue drains and the background loop
//! - [`RemoteTransport`] - the four-verb contract to the remote service
//! - [`HttpTransport`] - an envelope protocol over a pluggable HTTP client
//! - [`MemoryRemote`] - an in-memory remote service with failure scripting
//! - [`Connectivity`] - the online/offline belief and its change signal
//!
//! ## Delivery model
//!
//! Writes land locally first. While online they are sent straight away;
//! otherwise, or if the send fails, they join the durable mutation queue.
//! Queued operations are replayed strictly in order, one at a time, and a
//! drain stops at the first failure so nothing overtakes an undelivered
//! operation on the same record.
//!
//! ## Key Invariants
//!
//! - Local state is always readable, online or not
//! - Transport failures on the write path never reach the caller
//! - Per-record operation order is preserved end to end
//! - The server copy replaces the local one once no later operation is queued

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod connectivity;
mod engine;
mod error;
mod events;
mod http;
mod transport;

pub use client::OfflineClient;
pub use config::{RetryConfig, SyncConfig, DEFAULT_MAX_ATTEMPTS};
pub use connectivity::Connectivity;
pub use engine::{SubmitOutcome, SyncEngine, SyncHandle, SyncStats};
pub use error::{ClientError, ClientResult, TransportError, TransportResult};
pub use events::{DrainReport, DrainStop, SyncEvent};
pub use http::{HttpClient, HttpResponse, HttpTransport, LoopbackClient};
pub use transport::{
    JsonObject, MemoryRemote, RemoteAction, RemoteCall, RemoteTransport, REVISION_FIELD,
};
