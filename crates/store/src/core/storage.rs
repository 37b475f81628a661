//! Core resource storage trait.
//!
//! This module defines the [`ResourceStorage`] trait: versioned writes and
//! reads of logical resources. A backend instance serves exactly one tenant,
//! fixed by its configuration.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageResult;
use crate::types::{LogicalResourceIdent, StoredVersion, WriteOutcome, WriteRequest};

/// Versioned storage of logical resources.
///
/// # Versioning
///
/// Every write of a logical resource creates a new version whose number is
/// one higher than the current one. Concurrent writers of the same resource
/// are serialized; the loser of a race retries and sees the winner's
/// version. Replaying an explicit version that is already stored is a no-op
/// reporting [`WriteDisposition::Unchanged`]; an explicit version older than
/// the current one is kept as history only.
///
/// # Deletes
///
/// A delete appends a delete marker version. The history is kept and a
/// later write resurrects the resource with the next version number.
///
/// # Example
///
/// ```ignore
/// use helios_index_store::backends::sqlite::SqliteBackend;
/// use helios_index_store::core::ResourceStorage;
///
/// let storage = SqliteBackend::in_memory()?;
/// let outcome = storage
///     .upsert("Patient", "p1", serde_json::json!({"resourceType": "Patient"}))
///     .await?;
/// assert_eq!(outcome.version.version_id(), 1);
/// ```
///
/// [`WriteDisposition::Unchanged`]: crate::types::WriteDisposition::Unchanged
#[async_trait]
pub trait ResourceStorage: Send + Sync {
    /// Returns a human-readable name for this storage backend.
    fn backend_name(&self) -> &'static str;

    /// Persists one version and its search parameters.
    async fn write(&self, request: WriteRequest) -> StorageResult<WriteOutcome>;

    /// Reads the current version.
    ///
    /// Returns `Ok(None)` if the resource was never written and
    /// [`ResourceError::Gone`](crate::error::ResourceError::Gone) if it is
    /// deleted.
    async fn read(&self, resource_type: &str, id: &str) -> StorageResult<Option<StoredVersion>>;

    /// Reads one specific version.
    async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version_id: i32,
    ) -> StorageResult<StoredVersion>;

    /// Lists versions oldest first.
    async fn history(
        &self,
        resource_type: &str,
        id: &str,
        offset: u64,
        limit: u64,
    ) -> StorageResult<Vec<StoredVersion>>;

    /// Returns the identity of a logical resource, creating it if needed.
    async fn resolve_identity(
        &self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<LogicalResourceIdent>;

    /// Creates or updates a resource.
    async fn upsert(
        &self,
        resource_type: &str,
        id: &str,
        payload: Value,
    ) -> StorageResult<WriteOutcome> {
        self.write(WriteRequest::upsert(resource_type, id, payload))
            .await
    }

    /// Appends a delete marker.
    async fn delete(&self, resource_type: &str, id: &str) -> StorageResult<WriteOutcome> {
        self.write(WriteRequest::delete(resource_type, id)).await
    }
}
