//! ResourceStorage implementation for SQLite.

use async_trait::async_trait;
use tracing::debug;

use crate::core::ResourceStorage;
use crate::error::StorageResult;
use crate::store::{identity, reader, writer};
use crate::types::{LogicalResourceIdent, StoredVersion, WriteOutcome, WriteRequest};

use super::SqliteBackend;

#[async_trait]
impl ResourceStorage for SqliteBackend {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn write(&self, request: WriteRequest) -> StorageResult<WriteOutcome> {
        let outcome = self
            .with_retry("write", |conn, ctx, stage| {
                writer::write(conn, ctx, stage, &request)
            })
            .await?;
        debug!(
            resource_type = %request.resource_type,
            id = %request.logical_id,
            version = outcome.version.version_id(),
            disposition = ?outcome.disposition,
            rows = outcome.parameter_rows,
            "Wrote resource version"
        );
        Ok(outcome)
    }

    async fn read(&self, resource_type: &str, id: &str) -> StorageResult<Option<StoredVersion>> {
        self.with_read(|conn, ctx| reader::read(conn, ctx, resource_type, id))
    }

    async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version_id: i32,
    ) -> StorageResult<StoredVersion> {
        self.with_read(|conn, ctx| reader::vread(conn, ctx, resource_type, id, version_id))
    }

    async fn history(
        &self,
        resource_type: &str,
        id: &str,
        offset: u64,
        limit: u64,
    ) -> StorageResult<Vec<StoredVersion>> {
        self.with_read(|conn, ctx| reader::history(conn, ctx, resource_type, id, offset, limit))
    }

    async fn resolve_identity(
        &self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<LogicalResourceIdent> {
        self.with_retry("resolve_identity", |conn, ctx, stage| {
            identity::resolve(conn, ctx, stage, resource_type, id)
        })
        .await
    }
}
