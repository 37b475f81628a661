//! Version reads.

use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;

use crate::error::{ResourceError, StorageResult};
use crate::store::{StoreContext, identity, validate_logical_id};
use crate::types::{StoredVersion, from_db_timestamp};

const VERSION_COLUMNS: &str = "r.resource_id, r.logical_resource_id, r.version_id, r.data, r.is_deleted, r.last_updated";

/// Reads the current version.
///
/// Returns `Ok(None)` if the logical resource does not exist and
/// [`ResourceError::Gone`] if its current version is a delete marker.
pub fn read(
    conn: &Connection,
    ctx: &StoreContext,
    resource_type: &str,
    logical_id: &str,
) -> StorageResult<Option<StoredVersion>> {
    let resource_type_id = ctx.resource_type_id(resource_type)?;
    validate_logical_id(resource_type, logical_id)?;

    let sql = format!(
        "SELECT {VERSION_COLUMNS}
           FROM logical_resources lr
           JOIN resources r ON r.resource_id = lr.current_resource_id
          WHERE lr.resource_type_id = ?1 AND lr.logical_id = ?2"
    );
    let version = conn
        .prepare_cached(&sql)?
        .query_row(params![resource_type_id, logical_id], RawVersion::from_row)
        .optional()?;

    match version {
        Some(raw) => {
            let version = raw.decode(resource_type, logical_id)?;
            if version.is_deleted() {
                return Err(ResourceError::Gone {
                    resource_type: resource_type.to_string(),
                    id: logical_id.to_string(),
                    version_id: version.version_id(),
                }
                .into());
            }
            Ok(Some(version))
        }
        None => Ok(None),
    }
}

/// Reads a specific version, including delete markers.
pub fn vread(
    conn: &Connection,
    ctx: &StoreContext,
    resource_type: &str,
    logical_id: &str,
    version_id: i32,
) -> StorageResult<StoredVersion> {
    let resource_type_id = ctx.resource_type_id(resource_type)?;
    validate_logical_id(resource_type, logical_id)?;

    let logical_resource_id = identity::lookup(conn, ctx, resource_type_id, logical_id)?
        .ok_or_else(|| ResourceError::NotFound {
            resource_type: resource_type.to_string(),
            id: logical_id.to_string(),
        })?;

    load_version(conn, resource_type, logical_id, logical_resource_id, version_id)?.ok_or_else(
        || {
            ResourceError::VersionNotFound {
                resource_type: resource_type.to_string(),
                id: logical_id.to_string(),
                version_id,
            }
            .into()
        },
    )
}

/// Lists versions oldest first.
pub fn history(
    conn: &Connection,
    ctx: &StoreContext,
    resource_type: &str,
    logical_id: &str,
    offset: u64,
    limit: u64,
) -> StorageResult<Vec<StoredVersion>> {
    let resource_type_id = ctx.resource_type_id(resource_type)?;
    validate_logical_id(resource_type, logical_id)?;

    let Some(logical_resource_id) = identity::lookup(conn, ctx, resource_type_id, logical_id)?
    else {
        return Err(ResourceError::NotFound {
            resource_type: resource_type.to_string(),
            id: logical_id.to_string(),
        }
        .into());
    };

    let sql = format!(
        "SELECT {VERSION_COLUMNS} FROM resources r
          WHERE r.logical_resource_id = ?1
          ORDER BY r.version_id{}",
        ctx.translator.pagination(offset, limit)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![logical_resource_id], RawVersion::from_row)?;

    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?.decode(resource_type, logical_id)?);
    }
    Ok(versions)
}

/// Loads one version row of a known logical resource.
pub(crate) fn load_version(
    conn: &Connection,
    resource_type: &str,
    logical_id: &str,
    logical_resource_id: i64,
    version_id: i32,
) -> StorageResult<Option<StoredVersion>> {
    let sql = format!(
        "SELECT {VERSION_COLUMNS} FROM resources r
          WHERE r.logical_resource_id = ?1 AND r.version_id = ?2"
    );
    let version = conn
        .prepare_cached(&sql)?
        .query_row(params![logical_resource_id, version_id], RawVersion::from_row)
        .optional()?;
    version
        .map(|raw| raw.decode(resource_type, logical_id))
        .transpose()
}

/// Loads a version row by its surrogate id.
pub(crate) fn load_by_resource_id(
    conn: &Connection,
    resource_type: &str,
    logical_id: &str,
    resource_id: i64,
) -> StorageResult<Option<StoredVersion>> {
    let sql = format!("SELECT {VERSION_COLUMNS} FROM resources r WHERE r.resource_id = ?1");
    let version = conn
        .prepare_cached(&sql)?
        .query_row(params![resource_id], RawVersion::from_row)
        .optional()?;
    version
        .map(|raw| raw.decode(resource_type, logical_id))
        .transpose()
}

/// Columns of a version row before decoding.
struct RawVersion {
    resource_id: i64,
    logical_resource_id: i64,
    version_id: i32,
    data: Option<Vec<u8>>,
    is_deleted: bool,
    last_updated: String,
}

impl RawVersion {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            resource_id: row.get(0)?,
            logical_resource_id: row.get(1)?,
            version_id: row.get(2)?,
            data: row.get(3)?,
            is_deleted: row.get(4)?,
            last_updated: row.get(5)?,
        })
    }

    fn decode(self, resource_type: &str, logical_id: &str) -> StorageResult<StoredVersion> {
        let content = match self.data {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => Value::Null,
        };
        Ok(StoredVersion::new(
            resource_type,
            logical_id,
            self.logical_resource_id,
            self.resource_id,
            self.version_id,
            content,
            self.is_deleted,
            from_db_timestamp(&self.last_updated)?,
        ))
    }
}
