//! Business records and their sync status.

use crate::error::{CoreError, CoreResult};
use crate::types::RecordId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Free-form business fields of a record.
pub type Fields = Map<String, Value>;

/// Field names owned by the record envelope.
pub const RESERVED_FIELDS: [&str; 4] = ["id", "status", "updatedAt", "offline"];

/// Sync status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    /// Matches the last server-confirmed state.
    Synced,
    /// Created or updated locally, not yet confirmed.
    PendingLocal,
    /// Deleted locally; kept until the server confirms the delete.
    DeletedLocal,
}

impl RecordStatus {
    /// Returns the persisted name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::PendingLocal => "pending-local",
            Self::DeletedLocal => "deleted-local",
        }
    }

    /// Parses a persisted status name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(Self::Synced),
            "pending-local" => Some(Self::PendingLocal),
            "deleted-local" => Some(Self::DeletedLocal),
            _ => None,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A business record with its local sync bookkeeping.
///
/// Serialized as a flat JSON object: the envelope fields `id`, `status`,
/// `updatedAt` and `offline` next to the business fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identity.
    pub id: RecordId,
    /// Sync status.
    pub status: RecordStatus,
    /// Milliseconds since the Unix epoch of the last local change.
    #[serde(rename = "updatedAt")]
    pub updated_at: u64,
    /// True while the record differs from the last confirmed server state.
    pub offline: bool,
    /// Business fields.
    #[serde(flatten)]
    pub fields: Fields,
}

impl Record {
    /// Builds a locally created record from a caller payload.
    ///
    /// The payload's `id` is used when present, otherwise one is generated.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the payload is not an object, carries
    /// an invalid id, or sets a reserved envelope field.
    pub fn new_local(payload: &Value, now: u64) -> CoreResult<Self> {
        let Some(object) = payload.as_object() else {
            return Err(CoreError::validation("record payload must be a JSON object"));
        };

        let id = match object.get("id") {
            None | Some(Value::Null) => RecordId::generate(),
            Some(value) => id_from_value(value)?,
        };

        let mut fields = Fields::new();
        for (name, value) in object {
            if name == "id" {
                continue;
            }
            check_field_name(name)?;
            fields.insert(name.clone(), value.clone());
        }

        Ok(Self {
            id,
            status: RecordStatus::PendingLocal,
            updated_at: now,
            offline: true,
            fields,
        })
    }

    /// Builds a synced record from a server representation.
    ///
    /// Envelope fields sent by the server are consumed, except `updatedAt`
    /// which is kept when numeric.
    pub fn from_server(object: &Fields, now: u64) -> CoreResult<Self> {
        let id = match object.get("id") {
            Some(value) => id_from_value(value)?,
            None => return Err(CoreError::validation("server record has no id")),
        };
        let updated_at = object
            .get("updatedAt")
            .and_then(Value::as_u64)
            .unwrap_or(now);

        let fields = object
            .iter()
            .filter(|(name, _)| !RESERVED_FIELDS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(Self {
            id,
            status: RecordStatus::Synced,
            updated_at,
            offline: false,
            fields,
        })
    }

    /// Applies a partial update.
    ///
    /// A `null` value removes the field. The record becomes pending-local.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the patch is not an object, names a
    /// different id, or sets a reserved envelope field. The record is left
    /// unchanged on error.
    pub fn apply_patch(&mut self, patch: &Value, now: u64) -> CoreResult<()> {
        let Some(object) = patch.as_object() else {
            return Err(CoreError::validation("patch must be a JSON object"));
        };

        for (name, value) in object {
            if name == "id" {
                if id_from_value(value)? != self.id {
                    return Err(CoreError::validation("patch cannot change a record id"));
                }
                continue;
            }
            check_field_name(name)?;
        }

        for (name, value) in object {
            if name == "id" {
                continue;
            }
            if value.is_null() {
                self.fields.remove(name);
            } else {
                self.fields.insert(name.clone(), value.clone());
            }
        }

        self.status = RecordStatus::PendingLocal;
        self.offline = true;
        self.updated_at = now;
        Ok(())
    }

    /// Marks the record as locally deleted.
    pub fn mark_deleted(&mut self, now: u64) {
        self.status = RecordStatus::DeletedLocal;
        self.offline = true;
        self.updated_at = now;
    }

    /// Returns true if the record is deleted locally.
    pub fn is_deleted(&self) -> bool {
        self.status == RecordStatus::DeletedLocal
    }

    /// Checks envelope invariants: a valid id and no reserved business field.
    pub fn validate(&self) -> CoreResult<()> {
        RecordId::new(self.id.as_str())?;
        for name in self.fields.keys() {
            check_field_name(name)?;
        }
        Ok(())
    }

    /// Returns the representation sent to the server: id plus business fields.
    pub fn to_wire(&self) -> Fields {
        let mut object = self.fields.clone();
        object.insert("id".to_string(), Value::String(self.id.to_string()));
        object
    }

    /// Returns a business field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

fn id_from_value(value: &Value) -> CoreResult<RecordId> {
    match value {
        Value::String(s) => RecordId::new(s.as_str()),
        Value::Number(n) => RecordId::new(n.to_string()),
        _ => Err(CoreError::validation("record id must be a string or number")),
    }
}

fn check_field_name(name: &str) -> CoreResult<()> {
    if name.is_empty() {
        return Err(CoreError::validation("field names must not be empty"));
    }
    if RESERVED_FIELDS.contains(&name) {
        return Err(CoreError::validation(format!(
            "field `{name}` is reserved"
        )));
    }
    Ok(())
}

/// Selection criteria for listing records.
///
/// Deleted-local records are excluded unless the filter asks for them,
/// either with [`RecordFilter::include_deleted`] or by filtering on
/// [`RecordStatus::DeletedLocal`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    status: Option<RecordStatus>,
    offline: Option<bool>,
    include_deleted: bool,
    equals: Vec<(String, Value)>,
}

impl RecordFilter {
    /// Creates a filter matching every live record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one status.
    #[must_use]
    pub fn status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to records with the given offline flag.
    #[must_use]
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = Some(offline);
        self
    }

    /// Includes deleted-local records.
    #[must_use]
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Requires a business field to equal `value`.
    #[must_use]
    pub fn field_eq(mut self, name: impl Into<String>, value: Value) -> Self {
        self.equals.push((name.into(), value));
        self
    }

    /// Returns the status restriction, if any.
    pub fn status_filter(&self) -> Option<RecordStatus> {
        self.status
    }

    /// Returns true if `record` passes every criterion.
    pub fn matches(&self, record: &Record) -> bool {
        if record.is_deleted()
            && !self.include_deleted
            && self.status != Some(RecordStatus::DeletedLocal)
        {
            return false;
        }
        if self.status.is_some_and(|status| status != record.status) {
            return false;
        }
        if self.offline.is_some_and(|offline| offline != record.offline) {
            return false;
        }
        self.equals
            .iter()
            .all(|(name, value)| record.fields.get(name) == Some(value))
    }
}
