//! Parameter row persistence.
//!
//! [`ParameterPersister::replace`] is the single place parameter rows are
//! written, for the local write path, reindexing and remote index messages
//! alike. It deletes the existing rows of every unit, resolves dictionary
//! ids once for the whole batch and inserts the new rows through a
//! [`ParameterBatcher`].

use std::collections::{BTreeSet, HashMap};

use rusqlite::types::Value;
use rusqlite::{Connection, params};

use crate::cache::{CacheStage, IdentKey, TokenKey};
use crate::config::SchemaType;
use crate::error::StorageResult;
use crate::store::{StoreContext, identity, validate_logical_id};
use crate::types::{ExtractedParameterValue, ParameterValue, to_db_timestamp};

use super::batch::ParameterBatcher;
use super::dictionary::{DEFAULT_TOKEN_SYSTEM, DictionaryResolver};
use super::tables::{ParameterTable, TableTarget, WholeSystemTable};

/// The parameters of one logical resource, ready to persist.
#[derive(Debug, Clone)]
pub struct IndexingUnit {
    /// The resource the rows belong to.
    pub logical_resource_id: i64,
    /// Its type name.
    pub resource_type: String,
    /// Its type id.
    pub resource_type_id: i32,
    /// Its shard; selects the token value partition in the distributed schema.
    pub shard_key: i16,
    /// Flattened parameter values.
    pub parameters: Vec<ExtractedParameterValue>,
}

/// Dictionary ids for one batch.
#[derive(Default)]
struct ResolvedIds {
    names: HashMap<String, i32>,
    systems: HashMap<String, i32>,
    tokens: HashMap<TokenKey, i64>,
    canonicals: HashMap<String, i64>,
    refs: HashMap<IdentKey, i64>,
}

/// Writes and deletes parameter rows within one transaction.
pub struct ParameterPersister<'c> {
    conn: &'c Connection,
    ctx: &'c StoreContext,
}

impl<'c> ParameterPersister<'c> {
    /// Creates a persister over an open transaction.
    pub fn new(conn: &'c Connection, ctx: &'c StoreContext) -> Self {
        Self { conn, ctx }
    }

    /// Deletes every parameter row of a logical resource.
    pub fn delete_all(&self, resource_type: &str, logical_resource_id: i64) -> StorageResult<usize> {
        let mut deleted = 0;
        for table in ParameterTable::ALL {
            let sql = format!(
                "DELETE FROM {} WHERE logical_resource_id = ?1",
                table.for_type(resource_type)
            );
            deleted += self
                .conn
                .prepare_cached(&sql)?
                .execute(params![logical_resource_id])?;
        }
        for table in WholeSystemTable::ALL {
            let sql = format!("DELETE FROM {} WHERE logical_resource_id = ?1", table.name());
            deleted += self
                .conn
                .prepare_cached(&sql)?
                .execute(params![logical_resource_id])?;
        }
        Ok(deleted)
    }

    /// Replaces the parameter rows of every unit. Returns the number of
    /// rows inserted.
    pub fn replace(&self, stage: &mut CacheStage, units: &[IndexingUnit]) -> StorageResult<usize> {
        for unit in units {
            self.delete_all(&unit.resource_type, unit.logical_resource_id)?;
        }

        let ids = self.resolve_ids(stage, units)?;

        let mut batcher = ParameterBatcher::new(self.conn, self.ctx.config.parameter_batch_size);
        for unit in units {
            for parameter in &unit.parameters {
                self.add_rows(&mut batcher, &ids, unit, parameter)?;
            }
        }
        let rows = batcher.finish()?;

        tracing::debug!(units = units.len(), rows, "Replaced parameter rows");
        Ok(rows)
    }

    fn token_shard(&self, unit: &IndexingUnit) -> i16 {
        match self.ctx.config.schema_type {
            SchemaType::Plain => 0,
            SchemaType::Distributed => unit.shard_key,
        }
    }

    fn ref_key(&self, resource_type: &str, logical_id: &str) -> Option<IdentKey> {
        let resource_type_id = match self.ctx.resource_type_id(resource_type) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(resource_type, logical_id, error = %e, "Skipping reference target");
                return None;
            }
        };
        if let Err(e) = validate_logical_id(resource_type, logical_id) {
            tracing::warn!(resource_type, logical_id, error = %e, "Skipping reference target");
            return None;
        }
        Some(IdentKey::new(resource_type_id, logical_id))
    }

    fn resolve_ids(&self, stage: &mut CacheStage, units: &[IndexingUnit]) -> StorageResult<ResolvedIds> {
        let mut names = BTreeSet::new();
        let mut systems = BTreeSet::new();
        let mut canonicals = BTreeSet::new();
        let mut refs = BTreeSet::new();

        for unit in units {
            for parameter in &unit.parameters {
                match &parameter.value {
                    ParameterValue::Tag { system, .. } | ParameterValue::Security { system, .. } => {
                        systems.insert(system.clone().unwrap_or_else(|| DEFAULT_TOKEN_SYSTEM.to_string()));
                        continue;
                    }
                    ParameterValue::Profile { url, .. } => {
                        canonicals.insert(url.clone());
                        continue;
                    }
                    ParameterValue::Token { system, .. } => {
                        systems.insert(system.clone().unwrap_or_else(|| DEFAULT_TOKEN_SYSTEM.to_string()));
                    }
                    ParameterValue::Quantity {
                        system: Some(system),
                        ..
                    } => {
                        systems.insert(system.clone());
                    }
                    ParameterValue::Reference {
                        resource_type,
                        logical_id,
                        ..
                    } => {
                        if let Some(key) = self.ref_key(resource_type, logical_id) {
                            refs.insert(key);
                        }
                    }
                    _ => {}
                }
                names.insert(parameter.name.clone());
            }
        }

        let resolver = DictionaryResolver::new(self.conn, self.ctx);
        let mut ids = ResolvedIds {
            names: resolver.parameter_name_ids(stage, &names)?,
            systems: resolver.code_system_ids(stage, &systems)?,
            canonicals: resolver.canonical_ids(stage, &canonicals)?,
            ..ResolvedIds::default()
        };

        let mut token_keys = BTreeSet::new();
        for unit in units {
            let shard = self.token_shard(unit);
            for parameter in &unit.parameters {
                if let Some((system, code)) = token_of(&parameter.value) {
                    if let Some(system_id) = ids.systems.get(system) {
                        token_keys.insert(TokenKey::new(shard, *system_id, code));
                    }
                }
            }
        }
        ids.tokens = resolver.token_value_ids(stage, &token_keys)?;
        ids.refs = identity::resolve_many(self.conn, self.ctx, stage, &refs)?;
        Ok(ids)
    }

    fn add_rows(
        &self,
        batcher: &mut ParameterBatcher<'_>,
        ids: &ResolvedIds,
        unit: &IndexingUnit,
        parameter: &ExtractedParameterValue,
    ) -> StorageResult<()> {
        let lrid = Value::Integer(unit.logical_resource_id);
        let rtid = Value::Integer(unit.resource_type_id as i64);
        let composite = opt_int(parameter.composite_id.map(i64::from));
        let per_type = |table| TableTarget::PerType(table, unit.resource_type.clone());
        let name_id = || -> Value {
            opt_int(ids.names.get(&parameter.name).map(|id| *id as i64))
        };
        let token_id = |system: &str, code: &str| -> Option<i64> {
            let system_id = ids.systems.get(system)?;
            ids.tokens
                .get(&TokenKey::new(self.token_shard(unit), *system_id, code))
                .copied()
        };

        match &parameter.value {
            ParameterValue::String { value } => {
                let lower = value.to_lowercase();
                batcher.add(
                    per_type(ParameterTable::StrValues),
                    vec![
                        name_id(),
                        Value::Text(value.clone()),
                        Value::Text(lower.clone()),
                        lrid.clone(),
                        composite,
                    ],
                )?;
                if parameter.whole_system {
                    batcher.add(
                        TableTarget::WholeSystem(WholeSystemTable::StrValues),
                        vec![name_id(), Value::Text(value.clone()), Value::Text(lower), lrid, rtid],
                    )?;
                }
            }
            ParameterValue::Number { value, low, high } => {
                batcher.add(
                    per_type(ParameterTable::NumberValues),
                    vec![
                        name_id(),
                        Value::Real(*value),
                        opt_real(*low),
                        opt_real(*high),
                        lrid,
                        composite,
                    ],
                )?;
            }
            ParameterValue::Date { start, end } => {
                let (start, end) = (to_db_timestamp(*start), to_db_timestamp(*end));
                batcher.add(
                    per_type(ParameterTable::DateValues),
                    vec![
                        name_id(),
                        Value::Text(start.clone()),
                        Value::Text(end.clone()),
                        lrid.clone(),
                        composite,
                    ],
                )?;
                if parameter.whole_system {
                    batcher.add(
                        TableTarget::WholeSystem(WholeSystemTable::DateValues),
                        vec![name_id(), Value::Text(start), Value::Text(end), lrid, rtid],
                    )?;
                }
            }
            ParameterValue::Quantity {
                value,
                low,
                high,
                code,
                system,
            } => {
                let system_id = system
                    .as_ref()
                    .and_then(|s| ids.systems.get(s))
                    .map(|id| *id as i64);
                batcher.add(
                    per_type(ParameterTable::QuantityValues),
                    vec![
                        name_id(),
                        opt_text(code.clone()),
                        Value::Real(*value),
                        opt_real(*low),
                        opt_real(*high),
                        opt_int(system_id),
                        lrid,
                        composite,
                    ],
                )?;
            }
            ParameterValue::Location {
                latitude,
                longitude,
            } => {
                batcher.add(
                    per_type(ParameterTable::LatlngValues),
                    vec![
                        name_id(),
                        Value::Real(*latitude),
                        Value::Real(*longitude),
                        lrid,
                        composite,
                    ],
                )?;
            }
            ParameterValue::Token { system, code } => {
                let system = system.as_deref().unwrap_or(DEFAULT_TOKEN_SYSTEM);
                let Some(token) = token_id(system, code) else {
                    return Ok(());
                };
                batcher.add(
                    per_type(ParameterTable::ResourceTokenRefs),
                    vec![name_id(), Value::Integer(token), lrid.clone(), composite],
                )?;
                if parameter.whole_system {
                    batcher.add(
                        TableTarget::WholeSystem(WholeSystemTable::ResourceTokenRefs),
                        vec![name_id(), Value::Integer(token), lrid, rtid],
                    )?;
                }
            }
            ParameterValue::Reference {
                resource_type,
                logical_id,
                version,
            } => {
                let target = self
                    .ref_key(resource_type, logical_id)
                    .and_then(|key| ids.refs.get(&key).copied());
                let Some(target) = target else {
                    return Ok(());
                };
                batcher.add(
                    per_type(ParameterTable::RefValues),
                    vec![
                        name_id(),
                        Value::Integer(target),
                        opt_int(version.map(i64::from)),
                        lrid,
                        composite,
                    ],
                )?;
            }
            ParameterValue::Tag { system, code } | ParameterValue::Security { system, code } => {
                let is_tag = matches!(parameter.value, ParameterValue::Tag { .. });
                let system = system.as_deref().unwrap_or(DEFAULT_TOKEN_SYSTEM);
                let Some(token) = token_id(system, code) else {
                    return Ok(());
                };
                let (table, whole) = if is_tag {
                    (ParameterTable::Tags, WholeSystemTable::Tags)
                } else {
                    (ParameterTable::Security, WholeSystemTable::Security)
                };
                batcher.add(per_type(table), vec![Value::Integer(token), lrid.clone()])?;
                if parameter.whole_system {
                    batcher.add(
                        TableTarget::WholeSystem(whole),
                        vec![Value::Integer(token), lrid, rtid],
                    )?;
                }
            }
            ParameterValue::Profile {
                url,
                version,
                fragment,
            } => {
                let Some(canonical) = ids.canonicals.get(url).copied() else {
                    return Ok(());
                };
                batcher.add(
                    per_type(ParameterTable::Profiles),
                    vec![
                        Value::Integer(canonical),
                        opt_text(version.clone()),
                        opt_text(fragment.clone()),
                        lrid.clone(),
                    ],
                )?;
                if parameter.whole_system {
                    batcher.add(
                        TableTarget::WholeSystem(WholeSystemTable::Profiles),
                        vec![
                            Value::Integer(canonical),
                            opt_text(version.clone()),
                            opt_text(fragment.clone()),
                            lrid,
                            rtid,
                        ],
                    )?;
                }
            }
            ParameterValue::Composite { .. } => {
                tracing::warn!(
                    parameter = %parameter.name,
                    "Skipping composite that was not flattened"
                );
            }
        }
        Ok(())
    }
}

/// The (system, code) pair of values stored as common token values.
fn token_of(value: &ParameterValue) -> Option<(&str, &str)> {
    match value {
        ParameterValue::Token { system, code }
        | ParameterValue::Tag { system, code }
        | ParameterValue::Security { system, code } => {
            Some((system.as_deref().unwrap_or(DEFAULT_TOKEN_SYSTEM), code.as_str()))
        }
        _ => None,
    }
}

fn opt_int(value: Option<i64>) -> Value {
    value.map(Value::Integer).unwrap_or(Value::Null)
}

fn opt_real(value: Option<f64>) -> Value {
    value.map(Value::Real).unwrap_or(Value::Null)
}

fn opt_text(value: Option<String>) -> Value {
    value.map(Value::Text).unwrap_or(Value::Null)
}
