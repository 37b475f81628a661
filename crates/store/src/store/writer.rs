//! The version-advance protocol.
//!
//! A write resolves the identity of its logical resource, locks the logical
//! resource row for the rest of the transaction, appends a version row and
//! moves the current pointer only when the new version supersedes the
//! current one. Parameter rows follow the current version: they are fully
//! replaced when the pointer moves and left alone otherwise.
//!
//! Creating a new logical resource can race with another writer doing the
//! same. The loser sees a duplicate on `logical_resources` and reports
//! [`ConcurrencyError::IdentityConflict`]; the caller restarts the whole
//! write, which then finds the row and takes the update path.

use chrono::{SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::cache::CacheStage;
use crate::dialect::FHIR_SEQUENCE;
use crate::error::{ConcurrencyError, ResourceError, StorageResult, data_access};
use crate::remote::ShardKey;
use crate::search::{IndexingUnit, ParameterPersister, parameter_hash};
use crate::store::{StoreContext, identity, reader, sequence};
use crate::types::{
    ExtractedParameterValue, LogicalResourceIdent, StoredVersion, WriteDisposition, WriteOutcome,
    WriteRequest, to_db_timestamp,
};

/// The locked state of an existing logical resource.
#[derive(Debug, Clone)]
struct CurrentPointer {
    resource_id: i64,
    version_id: i32,
    is_deleted: bool,
    shard_key: i16,
}

/// Persists one version. Must run inside a write transaction.
pub fn write(
    conn: &Connection,
    ctx: &StoreContext,
    stage: &mut CacheStage,
    request: &WriteRequest,
) -> StorageResult<WriteOutcome> {
    let resource_type = request.resource_type.as_str();
    let logical_id = request.logical_id.as_str();

    let ident = identity::resolve(conn, ctx, stage, resource_type, logical_id)?;
    let current = lock_current(conn, ctx, ident.logical_resource_id)?;

    if let Some(explicit) = request.explicit_version {
        if explicit < 1 {
            return Err(crate::error::ValidationError::InvalidResource {
                message: format!("version {} is not a valid version number", explicit),
            }
            .into());
        }
        if let Some(existing) = reader::load_version(
            conn,
            resource_type,
            logical_id,
            ident.logical_resource_id,
            explicit,
        )? {
            tracing::debug!(
                resource_type,
                logical_id,
                version = explicit,
                "Version already stored, skipping replay"
            );
            return Ok(WriteOutcome {
                version: existing,
                disposition: WriteDisposition::Unchanged,
                parameter_rows: 0,
            });
        }
    }

    if request.is_deleted {
        match &current {
            None => {
                return Err(ResourceError::NotFound {
                    resource_type: resource_type.to_string(),
                    id: logical_id.to_string(),
                }
                .into());
            }
            Some(pointer) if pointer.is_deleted && request.explicit_version.is_none() => {
                let version = reader::load_by_resource_id(
                    conn,
                    resource_type,
                    logical_id,
                    pointer.resource_id,
                )?
                .ok_or_else(|| data_access("current version row is missing"))?;
                return Ok(WriteOutcome {
                    version,
                    disposition: WriteDisposition::Unchanged,
                    parameter_rows: 0,
                });
            }
            Some(_) => {}
        }
    }

    let version_id = match (request.explicit_version, &current) {
        (Some(explicit), _) => explicit,
        (None, Some(pointer)) => pointer.version_id.checked_add(1).ok_or_else(|| {
            crate::error::ValidationError::InvalidResource {
                message: format!(
                    "{}/{} is at version {} and cannot take another version",
                    resource_type, logical_id, pointer.version_id
                ),
            }
        })?,
        (None, None) => 1,
    };
    let last_updated = request.last_updated.unwrap_or_else(Utc::now).trunc_subsecs(6);
    let data = if request.is_deleted {
        None
    } else {
        Some(serde_json::to_vec(&request.payload)?)
    };

    let resource_id = sequence::next_id(conn, ctx.translator.as_ref(), FHIR_SEQUENCE)?;

    let supersedes = match &current {
        None => {
            let shard_key = ShardKey::derive(resource_type, logical_id).value();
            insert_logical_resource(
                conn,
                &ident,
                resource_id,
                version_id,
                request.is_deleted,
                &to_db_timestamp(last_updated),
                shard_key,
            )?;
            true
        }
        Some(pointer) => version_id > pointer.version_id,
    };

    conn.prepare_cached(
        "INSERT INTO resources (resource_id, logical_resource_id, version_id, data, is_deleted, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        resource_id,
        ident.logical_resource_id,
        version_id,
        data,
        request.is_deleted,
        to_db_timestamp(last_updated),
    ])?;

    let version = StoredVersion::new(
        resource_type,
        logical_id,
        ident.logical_resource_id,
        resource_id,
        version_id,
        if request.is_deleted {
            serde_json::Value::Null
        } else {
            request.payload.clone()
        },
        request.is_deleted,
        last_updated,
    );

    if !supersedes {
        tracing::debug!(
            resource_type,
            logical_id,
            version = version_id,
            "Stored out-of-order version as history"
        );
        return Ok(WriteOutcome {
            version,
            disposition: WriteDisposition::HistoryOnly,
            parameter_rows: 0,
        });
    }

    if let Some(pointer) = &current {
        advance_pointer(conn, &ident, pointer, resource_id, version_id, request, last_updated)?;
    }

    let shard_key = match &current {
        Some(pointer) => pointer.shard_key,
        None => ShardKey::derive(resource_type, logical_id).value(),
    };
    let parameter_rows = replace_parameters(conn, ctx, stage, &ident, shard_key, request)?;

    let disposition = if request.is_deleted {
        WriteDisposition::Deleted
    } else if current.is_none() {
        WriteDisposition::Created
    } else {
        WriteDisposition::Updated
    };

    tracing::debug!(
        resource_type,
        logical_id,
        version = version_id,
        ?disposition,
        parameter_rows,
        "Persisted resource version"
    );

    Ok(WriteOutcome {
        version,
        disposition,
        parameter_rows,
    })
}

/// Reads the logical resource row under the row-scoped write lock.
fn lock_current(
    conn: &Connection,
    ctx: &StoreContext,
    logical_resource_id: i64,
) -> StorageResult<Option<CurrentPointer>> {
    let sql = format!(
        "SELECT current_resource_id, version_id, is_deleted, shard_key
           FROM logical_resources WHERE logical_resource_id = ?1{}",
        ctx.translator.for_update()
    );
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![logical_resource_id], |row| {
            Ok(CurrentPointer {
                resource_id: row.get(0)?,
                version_id: row.get(1)?,
                is_deleted: row.get(2)?,
                shard_key: row.get(3)?,
            })
        })
        .optional()?)
}

fn insert_logical_resource(
    conn: &Connection,
    ident: &LogicalResourceIdent,
    resource_id: i64,
    version_id: i32,
    is_deleted: bool,
    last_updated: &str,
    shard_key: i16,
) -> StorageResult<()> {
    let result = conn
        .prepare_cached(
            "INSERT INTO logical_resources
                (logical_resource_id, resource_type_id, logical_id, current_resource_id,
                 version_id, is_deleted, last_updated, shard_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?
        .execute(params![
            ident.logical_resource_id,
            ident.resource_type_id,
            ident.logical_id,
            resource_id,
            version_id,
            is_deleted,
            last_updated,
            shard_key,
        ]);

    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            let err = crate::error::StorageError::from(e);
            if err.is_duplicate() {
                tracing::debug!(
                    resource_type = %ident.resource_type,
                    logical_id = %ident.logical_id,
                    "Lost creation race for logical resource"
                );
                Err(ConcurrencyError::IdentityConflict {
                    resource_type: ident.resource_type.clone(),
                    id: ident.logical_id.clone(),
                }
                .into())
            } else {
                Err(err)
            }
        }
    }
}

fn advance_pointer(
    conn: &Connection,
    ident: &LogicalResourceIdent,
    pointer: &CurrentPointer,
    resource_id: i64,
    version_id: i32,
    request: &WriteRequest,
    last_updated: chrono::DateTime<Utc>,
) -> StorageResult<()> {
    let updated = conn
        .prepare_cached(
            "UPDATE logical_resources
                SET current_resource_id = ?1, version_id = ?2, is_deleted = ?3, last_updated = ?4
              WHERE logical_resource_id = ?5 AND version_id = ?6",
        )?
        .execute(params![
            resource_id,
            version_id,
            request.is_deleted,
            to_db_timestamp(last_updated),
            ident.logical_resource_id,
            pointer.version_id,
        ])?;

    if updated == 1 {
        return Ok(());
    }

    let actual: i32 = conn
        .query_row(
            "SELECT version_id FROM logical_resources WHERE logical_resource_id = ?1",
            params![ident.logical_resource_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    Err(ConcurrencyError::VersionConflict {
        resource_type: ident.resource_type.clone(),
        id: ident.logical_id.clone(),
        expected_version: pointer.version_id,
        actual_version: actual,
    }
    .into())
}

/// Replaces the parameter rows of a superseded resource and stores the new
/// parameter hash. Delete markers keep no parameters.
fn replace_parameters(
    conn: &Connection,
    ctx: &StoreContext,
    stage: &mut CacheStage,
    ident: &LogicalResourceIdent,
    shard_key: i16,
    request: &WriteRequest,
) -> StorageResult<usize> {
    let persister = ParameterPersister::new(conn, ctx);

    if request.is_deleted {
        persister.delete_all(&ident.resource_type, ident.logical_resource_id)?;
        store_hash(conn, ident.logical_resource_id, None)?;
        return Ok(0);
    }

    let extracted = match &request.parameters {
        Some(parameters) => parameters.clone(),
        None => ctx.extractor.extract(&ident.resource_type, &request.payload),
    };
    let parameters = ExtractedParameterValue::flatten(extracted);
    let hash = parameter_hash(&parameters);

    let unit = IndexingUnit {
        logical_resource_id: ident.logical_resource_id,
        resource_type: ident.resource_type.clone(),
        resource_type_id: ident.resource_type_id,
        shard_key,
        parameters,
    };
    let rows = persister.replace(stage, std::slice::from_ref(&unit))?;
    store_hash(conn, ident.logical_resource_id, Some(&hash))?;
    Ok(rows)
}

pub(crate) fn store_hash(
    conn: &Connection,
    logical_resource_id: i64,
    hash: Option<&str>,
) -> StorageResult<usize> {
    let updated = conn
        .prepare_cached(
            "UPDATE logical_resources SET parameter_hash = ?1 WHERE logical_resource_id = ?2",
        )?
        .execute(params![hash, logical_resource_id])?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::test_support::memory_context;
    use serde_json::json;

    fn patient(id: &str, family: &str) -> WriteRequest {
        WriteRequest::upsert(
            "Patient",
            id,
            json!({"resourceType": "Patient", "id": id, "name": [{"family": family}]}),
        )
    }

    fn run(
        conn: &Connection,
        ctx: &StoreContext,
        request: &WriteRequest,
    ) -> StorageResult<WriteOutcome> {
        let mut stage = CacheStage::new();
        let outcome = write(conn, ctx, &mut stage, request)?;
        ctx.caches.publish(stage);
        Ok(outcome)
    }

    #[test]
    fn test_create_then_update() {
        let (conn, ctx) = memory_context();

        let created = run(&conn, &ctx, &patient("p1", "Smith")).unwrap();
        assert_eq!(created.disposition, WriteDisposition::Created);
        assert_eq!(created.version.version_id(), 1);
        assert!(created.parameter_rows > 0);

        let updated = run(&conn, &ctx, &patient("p1", "Jones")).unwrap();
        assert_eq!(updated.disposition, WriteDisposition::Updated);
        assert_eq!(updated.version.version_id(), 2);
        assert_eq!(
            updated.version.logical_resource_id(),
            created.version.logical_resource_id()
        );

        let current = reader::read(&conn, &ctx, "Patient", "p1").unwrap().unwrap();
        assert_eq!(current.version_id(), 2);
        assert_eq!(current.content()["name"][0]["family"], "Jones");
    }

    #[test]
    fn test_explicit_version_replay_is_unchanged() {
        let (conn, ctx) = memory_context();
        run(&conn, &ctx, &patient("p1", "Smith").with_version(1)).unwrap();
        let replay = run(&conn, &ctx, &patient("p1", "Other").with_version(1)).unwrap();
        assert_eq!(replay.disposition, WriteDisposition::Unchanged);
        assert_eq!(replay.version.content()["name"][0]["family"], "Smith");
    }

    #[test]
    fn test_older_explicit_version_is_history_only() {
        let (conn, ctx) = memory_context();
        run(&conn, &ctx, &patient("p1", "Three").with_version(3)).unwrap();
        let older = run(&conn, &ctx, &patient("p1", "Two").with_version(2)).unwrap();
        assert_eq!(older.disposition, WriteDisposition::HistoryOnly);

        let current = reader::read(&conn, &ctx, "Patient", "p1").unwrap().unwrap();
        assert_eq!(current.version_id(), 3);
        assert_eq!(reader::vread(&conn, &ctx, "Patient", "p1", 2).unwrap().version_id(), 2);
    }

    #[test]
    fn test_delete_semantics() {
        let (conn, ctx) = memory_context();

        let missing = run(&conn, &ctx, &WriteRequest::delete("Patient", "ghost"));
        assert!(matches!(
            missing,
            Err(StorageError::Resource(ResourceError::NotFound { .. }))
        ));

        run(&conn, &ctx, &patient("p1", "Smith")).unwrap();
        let deleted = run(&conn, &ctx, &WriteRequest::delete("Patient", "p1")).unwrap();
        assert_eq!(deleted.disposition, WriteDisposition::Deleted);
        assert_eq!(deleted.parameter_rows, 0);

        let again = run(&conn, &ctx, &WriteRequest::delete("Patient", "p1")).unwrap();
        assert_eq!(again.disposition, WriteDisposition::Unchanged);
        assert_eq!(again.version.version_id(), 2);

        assert!(matches!(
            reader::read(&conn, &ctx, "Patient", "p1"),
            Err(StorageError::Resource(ResourceError::Gone { version_id: 2, .. }))
        ));

        let revived = run(&conn, &ctx, &patient("p1", "Back")).unwrap();
        assert_eq!(revived.disposition, WriteDisposition::Updated);
        assert_eq!(revived.version.version_id(), 3);
    }

    #[test]
    fn test_rejects_invalid_explicit_version() {
        let (conn, ctx) = memory_context();
        assert!(run(&conn, &ctx, &patient("p1", "Smith").with_version(0)).is_err());
    }

    #[test]
    fn test_write_after_max_version_is_rejected() {
        let (conn, ctx) = memory_context();
        let top = run(&conn, &ctx, &patient("p1", "Smith").with_version(i32::MAX)).unwrap();
        assert_eq!(top.version.version_id(), i32::MAX);

        let next = run(&conn, &ctx, &patient("p1", "Jones"));
        assert!(matches!(
            next,
            Err(StorageError::Validation(
                crate::error::ValidationError::InvalidResource { .. }
            ))
        ));

        let current = reader::read(&conn, &ctx, "Patient", "p1").unwrap().unwrap();
        assert_eq!(current.version_id(), i32::MAX);
        assert_eq!(current.content()["name"][0]["family"], "Smith");
    }
}
