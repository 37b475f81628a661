//! Stored resource types.
//!
//! [`StoredVersion`] is one immutable version of a logical resource as read
//! back from the store. [`WriteRequest`] and [`WriteOutcome`] are the input
//! and result of the version-advance protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::parameter::ExtractedParameterValue;

/// The durable identity of a logical resource.
///
/// Identities are created once and never deleted, so a resolved
/// `logical_resource_id` stays valid for the life of the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalResourceIdent {
    /// The resource type name, e.g. `Patient`.
    pub resource_type: String,
    /// The business id.
    pub logical_id: String,
    /// Internal surrogate id.
    pub logical_resource_id: i64,
    /// Id of the resource type in the `resource_types` dictionary.
    pub resource_type_id: i32,
}

/// A single version of a resource.
///
/// # Examples
///
/// ```
/// use helios_index_store::types::StoredVersion;
/// use chrono::Utc;
/// use serde_json::json;
///
/// let version = StoredVersion::new(
///     "Patient",
///     "123",
///     1001,
///     2002,
///     3,
///     json!({"resourceType": "Patient", "id": "123"}),
///     false,
///     Utc::now(),
/// );
///
/// assert_eq!(version.url(), "Patient/123");
/// assert_eq!(version.etag(), "W/\"3\"");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVersion {
    resource_type: String,
    id: String,
    logical_resource_id: i64,
    resource_id: i64,
    version_id: i32,
    content: Value,
    is_deleted: bool,
    last_updated: DateTime<Utc>,
}

impl StoredVersion {
    /// Creates a stored version from its persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        logical_resource_id: i64,
        resource_id: i64,
        version_id: i32,
        content: Value,
        is_deleted: bool,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            logical_resource_id,
            resource_id,
            version_id,
            content,
            is_deleted,
            last_updated,
        }
    }

    /// Returns the resource type.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Returns the logical id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the internal logical resource id.
    pub fn logical_resource_id(&self) -> i64 {
        self.logical_resource_id
    }

    /// Returns the surrogate id of this version row.
    pub fn resource_id(&self) -> i64 {
        self.resource_id
    }

    /// Returns the version number.
    pub fn version_id(&self) -> i32 {
        self.version_id
    }

    /// Returns the payload.
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Consumes the version and returns the payload.
    pub fn into_content(self) -> Value {
        self.content
    }

    /// Returns true if this version is a delete marker.
    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    /// Returns when this version was written.
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Returns the relative URL, `Type/id`.
    pub fn url(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// Returns the versioned relative URL.
    pub fn versioned_url(&self) -> String {
        format!("{}/{}/_history/{}", self.resource_type, self.id, self.version_id)
    }

    /// Returns the weak ETag derived from the version.
    pub fn etag(&self) -> String {
        format!("W/\"{}\"", self.version_id)
    }
}

/// A request to persist one version of a logical resource.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// The resource type.
    pub resource_type: String,
    /// The business id.
    pub logical_id: String,
    /// The payload. Ignored for delete markers.
    pub payload: Value,
    /// Whether this version is a delete marker.
    pub is_deleted: bool,
    /// Version supplied by the caller on replay or redelivery.
    pub explicit_version: Option<i32>,
    /// Timestamp to record; defaults to now.
    pub last_updated: Option<DateTime<Utc>>,
    /// Pre-extracted parameters; extracted from the payload when absent.
    pub parameters: Option<Vec<ExtractedParameterValue>>,
}

impl WriteRequest {
    /// Creates a create-or-update request.
    pub fn upsert(
        resource_type: impl Into<String>,
        logical_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            logical_id: logical_id.into(),
            payload,
            is_deleted: false,
            explicit_version: None,
            last_updated: None,
            parameters: None,
        }
    }

    /// Creates a delete request.
    pub fn delete(resource_type: impl Into<String>, logical_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            logical_id: logical_id.into(),
            payload: Value::Null,
            is_deleted: true,
            explicit_version: None,
            last_updated: None,
            parameters: None,
        }
    }

    /// Sets an explicit version for idempotent redelivery.
    pub fn with_version(mut self, version: i32) -> Self {
        self.explicit_version = Some(version);
        self
    }

    /// Sets the recorded timestamp.
    pub fn with_last_updated(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated = Some(at);
        self
    }

    /// Supplies the parameters instead of extracting them.
    pub fn with_parameters(mut self, parameters: Vec<ExtractedParameterValue>) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// What a write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteDisposition {
    /// First version of a new logical resource.
    Created,
    /// New current version of an existing logical resource.
    Updated,
    /// New current version that is a delete marker.
    Deleted,
    /// An older explicit version stored as history only.
    HistoryOnly,
    /// The explicit version already existed; nothing was written.
    Unchanged,
}

/// The result of a write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// The persisted (or pre-existing) version.
    pub version: StoredVersion,
    /// What happened.
    pub disposition: WriteDisposition,
    /// Number of parameter rows inserted.
    pub parameter_rows: usize,
}

impl WriteOutcome {
    /// Returns true if the current version pointer moved.
    pub fn is_current(&self) -> bool {
        matches!(
            self.disposition,
            WriteDisposition::Created | WriteDisposition::Updated | WriteDisposition::Deleted
        )
    }
}
