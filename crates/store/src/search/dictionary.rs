//! Dictionary id resolution.
//!
//! Parameter names and code systems are few, so they are resolved one value
//! at a time with read-or-create. Token values and canonical URLs are many:
//! they are resolved per batch with bulk selects, sorted conflict-tolerant
//! inserts and a final re-select, so concurrent batches that introduce the
//! same values converge on one row each.
//!
//! Every id found or created here is staged in the caller's
//! [`CacheStage`] and becomes visible to other threads only after commit.

use std::collections::{BTreeSet, HashMap};

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::cache::{CacheStage, TokenKey};
use crate::config::SchemaType;
use crate::dialect::FHIR_REF_SEQUENCE;
use crate::error::{StorageResult, data_access};
use crate::store::{StoreContext, sequence};

/// Code system recorded for tokens without a system.
pub const DEFAULT_TOKEN_SYSTEM: &str = "default-token-system";

/// Token values per bulk select statement.
pub const TOKEN_SELECT_CHUNK: usize = 256;

/// Canonical values per bulk select statement.
pub const CANONICAL_SELECT_CHUNK: usize = 256;

/// Code systems per bulk select statement.
pub const CODE_SYSTEM_SELECT_CHUNK: usize = 512;

/// A dictionary with a single text key.
struct TextDictionary {
    table: &'static str,
    id_column: &'static str,
    value_column: &'static str,
    label: &'static str,
}

const PARAMETER_NAMES: TextDictionary = TextDictionary {
    table: "parameter_names",
    id_column: "parameter_name_id",
    value_column: "parameter_name",
    label: "parameter name",
};

const CODE_SYSTEMS: TextDictionary = TextDictionary {
    table: "code_systems",
    id_column: "code_system_id",
    value_column: "code_system_name",
    label: "code system",
};

const CANONICALS: TextDictionary = TextDictionary {
    table: "common_canonical_values",
    id_column: "canonical_id",
    value_column: "url",
    label: "common canonical",
};

/// Resolves dictionary ids within one transaction.
pub struct DictionaryResolver<'c> {
    conn: &'c Connection,
    ctx: &'c StoreContext,
}

impl<'c> DictionaryResolver<'c> {
    /// Creates a resolver over an open transaction.
    pub fn new(conn: &'c Connection, ctx: &'c StoreContext) -> Self {
        Self { conn, ctx }
    }

    fn distributed(&self) -> bool {
        self.ctx.config.schema_type == SchemaType::Distributed
    }

    /// Resolves parameter names, creating missing ones in sorted order.
    pub fn parameter_name_ids(
        &self,
        stage: &mut CacheStage,
        names: &BTreeSet<String>,
    ) -> StorageResult<HashMap<String, i32>> {
        let mut ids = HashMap::with_capacity(names.len());
        for name in names {
            let id = match stage.parameter_name_id(&self.ctx.caches, name) {
                Some(id) => id,
                None => {
                    let id = self.small_id(self.read_or_create(&PARAMETER_NAMES, name)?, &PARAMETER_NAMES)?;
                    stage.parameter_names.insert(name.clone(), id);
                    id
                }
            };
            ids.insert(name.clone(), id);
        }
        Ok(ids)
    }

    /// Resolves code systems: one bulk select for the misses, then
    /// read-or-create for what is still missing, in sorted order.
    pub fn code_system_ids(
        &self,
        stage: &mut CacheStage,
        systems: &BTreeSet<String>,
    ) -> StorageResult<HashMap<String, i32>> {
        let mut ids = HashMap::with_capacity(systems.len());
        let mut missing = Vec::new();
        for system in systems {
            match stage.code_system_id(&self.ctx.caches, system) {
                Some(id) => {
                    ids.insert(system.clone(), id);
                }
                None => missing.push(system.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(ids);
        }

        let found = self.bulk_select_text(&CODE_SYSTEMS, &missing, CODE_SYSTEM_SELECT_CHUNK)?;
        for system in missing {
            let id = match found.get(&system) {
                Some(id) => *id,
                None => self.read_or_create(&CODE_SYSTEMS, &system)?,
            };
            let id = self.small_id(id, &CODE_SYSTEMS)?;
            stage.code_systems.insert(system.clone(), id);
            ids.insert(system, id);
        }
        Ok(ids)
    }

    /// Resolves common token values for a batch.
    pub fn token_value_ids(
        &self,
        stage: &mut CacheStage,
        keys: &BTreeSet<TokenKey>,
    ) -> StorageResult<HashMap<TokenKey, i64>> {
        let (mut ids, missing) = stage.partition_token_values(&self.ctx.caches, keys);
        if missing.is_empty() {
            return Ok(ids);
        }

        let found = self.bulk_select_tokens(&missing)?;
        // BTreeSet iteration already yields sorted keys.
        let to_create: Vec<TokenKey> = missing
            .into_iter()
            .filter(|k| !found.contains_key(k))
            .collect();

        let created = if to_create.is_empty() {
            HashMap::new()
        } else {
            for key in &to_create {
                self.insert_token(key)?;
            }
            self.bulk_select_tokens(&to_create)?
        };
        if created.len() != to_create.len() {
            return Err(data_access(format!(
                "failed to create all common token values: {} of {}",
                created.len(),
                to_create.len()
            )));
        }

        tracing::debug!(
            cached = ids.len(),
            selected = found.len(),
            created = created.len(),
            "Resolved common token values"
        );

        for (key, id) in found.into_iter().chain(created) {
            stage.common_token_values.insert(key.clone(), id);
            ids.insert(key, id);
        }
        Ok(ids)
    }

    /// Resolves common canonical values for a batch.
    pub fn canonical_ids(
        &self,
        stage: &mut CacheStage,
        urls: &BTreeSet<String>,
    ) -> StorageResult<HashMap<String, i64>> {
        let (mut ids, missing) = stage.partition_canonicals(&self.ctx.caches, urls);
        if missing.is_empty() {
            return Ok(ids);
        }

        let found = self.bulk_select_text(&CANONICALS, &missing, CANONICAL_SELECT_CHUNK)?;
        let to_create: Vec<String> = missing
            .into_iter()
            .filter(|u| !found.contains_key(u))
            .collect();

        let created = if to_create.is_empty() {
            HashMap::new()
        } else {
            for url in &to_create {
                self.insert_text(&CANONICALS, url)?;
            }
            self.bulk_select_text(&CANONICALS, &to_create, CANONICAL_SELECT_CHUNK)?
        };
        if created.len() != to_create.len() {
            return Err(data_access(format!(
                "failed to create all common canonical values: {} of {}",
                created.len(),
                to_create.len()
            )));
        }

        for (url, id) in found.into_iter().chain(created) {
            stage.common_canonical_values.insert(url.clone(), id);
            ids.insert(url, id);
        }
        Ok(ids)
    }

    fn read_or_create(&self, dict: &TextDictionary, value: &str) -> StorageResult<i64> {
        let select = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            dict.id_column, dict.table, dict.value_column
        );
        let read = |conn: &Connection| -> StorageResult<Option<i64>> {
            Ok(conn
                .prepare_cached(&select)?
                .query_row(params![value], |row| row.get(0))
                .optional()?)
        };

        if let Some(id) = read(self.conn)? {
            return Ok(id);
        }
        self.insert_text(dict, value)?;
        read(self.conn)?.ok_or_else(|| {
            data_access(format!("failed to create {} value '{}'", dict.label, value))
        })
    }

    /// Conflict-tolerant insert. Returns false if another writer won.
    fn insert_text(&self, dict: &TextDictionary, value: &str) -> StorageResult<bool> {
        let on_conflict = self.ctx.translator.on_conflict_do_nothing();
        let rows = if self.distributed() {
            let id = sequence::next_id(self.conn, self.ctx.translator.as_ref(), FHIR_REF_SEQUENCE)?;
            let sql = format!(
                "INSERT INTO {} ({}, {}) VALUES (?1, ?2){}",
                dict.table, dict.id_column, dict.value_column, on_conflict
            );
            self.conn.prepare_cached(&sql)?.execute(params![id, value])?
        } else {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES (?1){}",
                dict.table, dict.value_column, on_conflict
            );
            self.conn.prepare_cached(&sql)?.execute(params![value])?
        };
        Ok(rows == 1)
    }

    fn insert_token(&self, key: &TokenKey) -> StorageResult<bool> {
        let on_conflict = self.ctx.translator.on_conflict_do_nothing();
        let rows = if self.distributed() {
            let id = sequence::next_id(self.conn, self.ctx.translator.as_ref(), FHIR_REF_SEQUENCE)?;
            let sql = format!(
                "INSERT INTO common_token_values (common_token_value_id, shard_key, code_system_id, token_value)
                 VALUES (?1, ?2, ?3, ?4){}",
                on_conflict
            );
            self.conn.prepare_cached(&sql)?.execute(params![
                id,
                key.shard_key,
                key.code_system_id,
                key.token_value
            ])?
        } else {
            let sql = format!(
                "INSERT INTO common_token_values (shard_key, code_system_id, token_value)
                 VALUES (?1, ?2, ?3){}",
                on_conflict
            );
            self.conn.prepare_cached(&sql)?.execute(params![
                key.shard_key,
                key.code_system_id,
                key.token_value
            ])?
        };
        Ok(rows == 1)
    }

    fn bulk_select_text(
        &self,
        dict: &TextDictionary,
        values: &[String],
        chunk_size: usize,
    ) -> StorageResult<HashMap<String, i64>> {
        let mut found = HashMap::with_capacity(values.len());
        for chunk in values.chunks(chunk_size) {
            let markers: Vec<String> = (1..=chunk.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT {}, {} FROM {} WHERE {} IN ({})",
                dict.value_column,
                dict.id_column,
                dict.table,
                dict.value_column,
                markers.join(", ")
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (value, id) = row?;
                found.insert(value, id);
            }
        }
        Ok(found)
    }

    fn bulk_select_tokens(&self, keys: &[TokenKey]) -> StorageResult<HashMap<TokenKey, i64>> {
        let mut found = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(TOKEN_SELECT_CHUNK) {
            let markers: Vec<String> = (0..chunk.len())
                .map(|i| format!("(?{}, ?{}, ?{})", i * 3 + 1, i * 3 + 2, i * 3 + 3))
                .collect();
            let sql = format!(
                "SELECT shard_key, code_system_id, token_value, common_token_value_id
                   FROM common_token_values
                  WHERE (shard_key, code_system_id, token_value) IN (VALUES {})",
                markers.join(", ")
            );
            let values: Vec<Value> = chunk
                .iter()
                .flat_map(|k| {
                    [
                        Value::Integer(k.shard_key as i64),
                        Value::Integer(k.code_system_id as i64),
                        Value::Text(k.token_value.clone()),
                    ]
                })
                .collect();

            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), |row| {
                Ok((
                    TokenKey::new(row.get(0)?, row.get(1)?, row.get::<_, String>(2)?),
                    row.get::<_, i64>(3)?,
                ))
            })?;
            for row in rows {
                let (key, id) = row?;
                found.insert(key, id);
            }
        }
        Ok(found)
    }

    fn small_id(&self, id: i64, dict: &TextDictionary) -> StorageResult<i32> {
        i32::try_from(id).map_err(|_| data_access(format!("{} id {} exceeds 32 bits", dict.label, id)))
    }
}
