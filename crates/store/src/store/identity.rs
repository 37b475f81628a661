//! Logical resource identity resolution.
//!
//! A logical resource is identified by `(resource type, logical id)` and
//! mapped to a `logical_resource_id` exactly once. Concurrent writers of the
//! same new identity race on the unique key of `logical_resource_ident`; the
//! loser inserts nothing and reads back the winner's row.

use std::collections::{BTreeSet, HashMap};

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::cache::{CacheStage, IdentKey};
use crate::dialect::FHIR_SEQUENCE;
use crate::error::{StorageResult, data_access};
use crate::store::{StoreContext, sequence, validate_logical_id};
use crate::types::LogicalResourceIdent;

/// Keys per bulk select statement.
pub const IDENT_SELECT_CHUNK: usize = 256;

/// Resolves a single identity, creating it if needed.
pub fn resolve(
    conn: &Connection,
    ctx: &StoreContext,
    stage: &mut CacheStage,
    resource_type: &str,
    logical_id: &str,
) -> StorageResult<LogicalResourceIdent> {
    let resource_type_id = ctx.resource_type_id(resource_type)?;
    validate_logical_id(resource_type, logical_id)?;

    let key = IdentKey::new(resource_type_id, logical_id);
    let ident = |logical_resource_id| LogicalResourceIdent {
        resource_type: resource_type.to_string(),
        logical_id: logical_id.to_string(),
        logical_resource_id,
        resource_type_id,
    };

    if let Some(id) = stage.logical_resource_id(&ctx.caches, &key) {
        return Ok(ident(id));
    }

    let select = format!(
        "SELECT logical_resource_id FROM logical_resource_ident
          WHERE resource_type_id = ?1 AND logical_id = ?2{}",
        ctx.translator.for_update()
    );

    if let Some(id) = select_one(conn, &select, resource_type_id, logical_id)? {
        stage.logical_resource_idents.insert(key, id);
        return Ok(ident(id));
    }

    let candidate = sequence::next_id(conn, ctx.translator.as_ref(), FHIR_SEQUENCE)?;
    let inserted = insert_ident(conn, ctx, candidate, resource_type_id, logical_id)?;

    let id = if inserted {
        tracing::debug!(resource_type, logical_id, id = candidate, "Created logical resource identity");
        candidate
    } else {
        // Lost the race; the row is now visible.
        select_one(conn, &select, resource_type_id, logical_id)?.ok_or_else(|| {
            data_access(format!(
                "identity {}/{} vanished after conflicting insert",
                resource_type, logical_id
            ))
        })?
    };

    stage.logical_resource_idents.insert(key, id);
    Ok(ident(id))
}

/// Looks up an identity without creating it.
pub fn lookup(
    conn: &Connection,
    ctx: &StoreContext,
    resource_type_id: i32,
    logical_id: &str,
) -> StorageResult<Option<i64>> {
    let key = IdentKey::new(resource_type_id, logical_id);
    if let Some(id) = ctx.caches.logical_resource_idents().get(&key) {
        return Ok(Some(id));
    }
    select_one(
        conn,
        "SELECT logical_resource_id FROM logical_resource_ident
          WHERE resource_type_id = ?1 AND logical_id = ?2",
        resource_type_id,
        logical_id,
    )
}

/// Resolves many identities at once, creating the missing ones.
///
/// Keys are looked up in the caches first, then in bulk. Missing keys are
/// inserted in sorted order so concurrent batches take locks in the same
/// order, and finally read back. A key that is still missing afterwards is
/// a fatal error.
pub fn resolve_many(
    conn: &Connection,
    ctx: &StoreContext,
    stage: &mut CacheStage,
    keys: &BTreeSet<IdentKey>,
) -> StorageResult<HashMap<IdentKey, i64>> {
    let mut resolved = HashMap::with_capacity(keys.len());
    let mut missing: Vec<IdentKey> = Vec::new();
    for key in keys {
        match stage.logical_resource_id(&ctx.caches, key) {
            Some(id) => {
                resolved.insert(key.clone(), id);
            }
            None => missing.push(key.clone()),
        }
    }
    if missing.is_empty() {
        return Ok(resolved);
    }

    let found = bulk_select(conn, &missing)?;
    let mut to_create: Vec<IdentKey> = missing
        .iter()
        .filter(|k| !found.contains_key(*k))
        .cloned()
        .collect();
    to_create.sort();

    for key in &to_create {
        let candidate = sequence::next_id(conn, ctx.translator.as_ref(), FHIR_SEQUENCE)?;
        insert_ident(conn, ctx, candidate, key.resource_type_id, &key.logical_id)?;
    }

    let created = if to_create.is_empty() {
        HashMap::new()
    } else {
        bulk_select(conn, &to_create)?
    };
    if created.len() != to_create.len() {
        return Err(data_access(format!(
            "failed to create all logical resource ident values: {} of {}",
            created.len(),
            to_create.len()
        )));
    }

    tracing::debug!(
        requested = keys.len(),
        selected = found.len(),
        created = created.len(),
        "Resolved logical resource identities"
    );

    for (key, id) in found.into_iter().chain(created) {
        stage.logical_resource_idents.insert(key.clone(), id);
        resolved.insert(key, id);
    }
    Ok(resolved)
}

fn select_one(
    conn: &Connection,
    sql: &str,
    resource_type_id: i32,
    logical_id: &str,
) -> StorageResult<Option<i64>> {
    Ok(conn
        .prepare_cached(sql)?
        .query_row(params![resource_type_id, logical_id], |row| row.get(0))
        .optional()?)
}

fn insert_ident(
    conn: &Connection,
    ctx: &StoreContext,
    logical_resource_id: i64,
    resource_type_id: i32,
    logical_id: &str,
) -> StorageResult<bool> {
    let sql = format!(
        "INSERT INTO logical_resource_ident (logical_resource_id, resource_type_id, logical_id)
         VALUES (?1, ?2, ?3){}",
        ctx.translator.on_conflict_do_nothing()
    );
    let rows = conn
        .prepare_cached(&sql)?
        .execute(params![logical_resource_id, resource_type_id, logical_id])?;
    Ok(rows == 1)
}

fn bulk_select(conn: &Connection, keys: &[IdentKey]) -> StorageResult<HashMap<IdentKey, i64>> {
    let mut found = HashMap::with_capacity(keys.len());
    for chunk in keys.chunks(IDENT_SELECT_CHUNK) {
        let markers: Vec<String> = (0..chunk.len())
            .map(|i| format!("(?{}, ?{})", i * 2 + 1, i * 2 + 2))
            .collect();
        let sql = format!(
            "SELECT resource_type_id, logical_id, logical_resource_id FROM logical_resource_ident
              WHERE (resource_type_id, logical_id) IN (VALUES {})",
            markers.join(", ")
        );
        let values: Vec<Value> = chunk
            .iter()
            .flat_map(|k| {
                [
                    Value::Integer(k.resource_type_id as i64),
                    Value::Text(k.logical_id.clone()),
                ]
            })
            .collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((IdentKey::new(row.get(0)?, row.get::<_, String>(1)?), row.get(2)?))
        })?;
        for row in rows {
            let (key, id) = row?;
            found.insert(key, id);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_context;

    #[test]
    fn test_resolve_creates_once() {
        let (conn, ctx) = memory_context();
        let mut stage = CacheStage::new();

        let first = resolve(&conn, &ctx, &mut stage, "Patient", "p1").unwrap();
        let mut fresh = CacheStage::new();
        let second = resolve(&conn, &ctx, &mut fresh, "Patient", "p1").unwrap();

        assert_eq!(first.logical_resource_id, second.logical_resource_id);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM logical_resource_ident", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_resolve_rejects_unknown_type_and_bad_id() {
        let (conn, ctx) = memory_context();
        let mut stage = CacheStage::new();
        assert!(resolve(&conn, &ctx, &mut stage, "Basic", "x").is_err());
        assert!(resolve(&conn, &ctx, &mut stage, "Patient", "bad id").is_err());
        assert!(stage.is_empty());
    }

    #[test]
    fn test_resolve_many_mixes_existing_and_new() {
        let (conn, ctx) = memory_context();
        let mut stage = CacheStage::new();
        let existing = resolve(&conn, &ctx, &mut stage, "Patient", "p1").unwrap();
        ctx.caches.publish(stage);

        let patient = ctx.caches.resource_type_id("Patient").unwrap();
        let observation = ctx.caches.resource_type_id("Observation").unwrap();
        let keys: BTreeSet<IdentKey> = [
            IdentKey::new(patient, "p1"),
            IdentKey::new(patient, "p2"),
            IdentKey::new(observation, "o1"),
        ]
        .into_iter()
        .collect();

        let mut stage = CacheStage::new();
        let ids = resolve_many(&conn, &ctx, &mut stage, &keys).unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[&IdentKey::new(patient, "p1")], existing.logical_resource_id);
        assert_eq!(stage.logical_resource_idents.len(), 2);

        let again = resolve_many(&conn, &ctx, &mut CacheStage::new(), &keys).unwrap();
        assert_eq!(ids, again);
    }

    #[test]
    fn test_lookup_does_not_create() {
        let (conn, ctx) = memory_context();
        let patient = ctx.caches.resource_type_id("Patient").unwrap();
        assert_eq!(lookup(&conn, &ctx, patient, "nobody").unwrap(), None);
    }
}
