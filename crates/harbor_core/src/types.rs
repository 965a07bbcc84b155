//! Core identifiers and persisted layout names.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Collection holding the Record Store.
pub const ORDERS: &str = "orders";
/// Collection holding the Mutation Queue.
pub const OFFLINE_QUEUE: &str = "offlineQueue";
/// Collection holding the TTL cache.
pub const CACHE: &str = "cache";

/// Maximum length of a record id.
pub const MAX_ID_LEN: usize = 128;

/// Globally unique record identifier, client- or server-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Creates an id after validating it.
    ///
    /// # Errors
    ///
    /// Returns a validation error for empty ids, ids longer than
    /// [`MAX_ID_LEN`], or ids containing control characters.
    pub fn new(id: impl Into<String>) -> CoreResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoreError::validation("record id must not be empty"));
        }
        if id.len() > MAX_ID_LEN {
            return Err(CoreError::validation(format!(
                "record id longer than {MAX_ID_LEN} bytes"
            )));
        }
        if id.chars().any(char::is_control) {
            return Err(CoreError::validation("record id contains control characters"));
        }
        Ok(Self(id))
    }

    /// Generates a fresh client-side id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RecordId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
