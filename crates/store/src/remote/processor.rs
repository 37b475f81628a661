//! Index message batch processing.

use std::collections::{BTreeSet, HashMap};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheStage, IdentKey};
use crate::error::{MessageError, StorageResult};
use crate::search::{IndexingUnit, ParameterPersister, parameter_hash};
use crate::store::writer::store_hash;
use crate::store::{StoreContext, identity, validate_logical_id};

use super::message::IndexMessage;
use super::shard::ShardKey;

/// What happened to the messages of a committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Messages whose parameters were stored.
    pub accepted: usize,
    /// Messages dropped as malformed, unsupported or misdirected.
    pub dropped: usize,
    /// Messages skipped because a newer version is already indexed.
    pub stale: usize,
    /// Raw messages whose resource version isn't committed yet. The caller
    /// should redeliver them.
    pub deferred: Vec<String>,
    /// Parameter rows inserted.
    pub parameter_rows: usize,
}

/// A parsed message that passed the per-message checks.
struct Candidate<'m> {
    raw: &'m str,
    message: IndexMessage,
    key: IdentKey,
}

impl Candidate<'_> {
    fn version(&self) -> i32 {
        self.message.data.version_id.unwrap_or(0)
    }
}

const READINESS_SQL: &str = "SELECT version_id, parameter_hash FROM logical_resources
  WHERE resource_type_id = ?1 AND logical_id = ?2";

enum Readiness {
    Ready,
    Stale,
    NotReady,
}

/// Processes index message batches within one transaction.
pub struct MessageProcessor<'c> {
    conn: &'c Connection,
    ctx: &'c StoreContext,
}

impl<'c> MessageProcessor<'c> {
    /// Creates a processor over an open transaction.
    pub fn new(conn: &'c Connection, ctx: &'c StoreContext) -> Self {
        Self { conn, ctx }
    }

    /// Processes a batch of raw messages. Problems with single messages
    /// drop that message; any other error fails the whole batch.
    pub fn process(&self, stage: &mut CacheStage, messages: &[String]) -> StorageResult<BatchReport> {
        let mut report = BatchReport::default();

        // Latest message per resource, in arrival order of first sight.
        let mut order: Vec<IdentKey> = Vec::new();
        let mut latest: HashMap<IdentKey, Candidate<'_>> = HashMap::new();
        for raw in messages {
            let Some(candidate) = self.admit(raw) else {
                report.dropped += 1;
                continue;
            };
            match latest.get(&candidate.key).map(Candidate::version) {
                Some(existing) if existing > candidate.version() => {
                    report.stale += 1;
                }
                Some(_) => {
                    report.stale += 1;
                    latest.insert(candidate.key.clone(), candidate);
                }
                None => {
                    order.push(candidate.key.clone());
                    latest.insert(candidate.key.clone(), candidate);
                }
            }
        }

        let mut ready = Vec::new();
        for key in order {
            let Some(candidate) = latest.remove(&key) else {
                continue;
            };
            match self.readiness(&candidate)? {
                Readiness::Ready => ready.push(candidate),
                Readiness::Stale => report.stale += 1,
                Readiness::NotReady => report.deferred.push(candidate.raw.to_string()),
            }
        }

        let subjects: BTreeSet<IdentKey> = ready.iter().map(|c| c.key.clone()).collect();
        let resolved = identity::resolve_many(self.conn, self.ctx, stage, &subjects)?;

        let mut units = Vec::with_capacity(ready.len());
        let mut hashes = Vec::with_capacity(ready.len());
        for candidate in ready {
            let Some(&lrid) = resolved.get(&candidate.key) else {
                report.dropped += 1;
                continue;
            };
            let data = &candidate.message.data;
            if data.logical_resource_id != 0 && data.logical_resource_id != lrid {
                tracing::warn!(
                    resource_type = %data.resource_type,
                    logical_id = %data.logical_id,
                    expected = lrid,
                    actual = data.logical_resource_id,
                    "Dropping message with mismatched logical resource id"
                );
                report.dropped += 1;
                continue;
            }

            let parameters = data.to_parameters();
            let hash = data
                .parameter_hash
                .clone()
                .unwrap_or_else(|| parameter_hash(&parameters));
            let shard =
                ShardKey::for_message(&data.resource_type, &data.logical_id, data.request_shard.as_deref());
            hashes.push((lrid, hash));
            units.push(IndexingUnit {
                logical_resource_id: lrid,
                resource_type: data.resource_type.clone(),
                resource_type_id: candidate.key.resource_type_id,
                shard_key: shard.value(),
                parameters,
            });
        }

        report.parameter_rows = ParameterPersister::new(self.conn, self.ctx).replace(stage, &units)?;
        for (lrid, hash) in &hashes {
            if store_hash(self.conn, *lrid, Some(hash))? == 0 {
                tracing::warn!(
                    logical_resource_id = lrid,
                    "No committed version to record the parameter hash on"
                );
            }
        }
        report.accepted = units.len();

        tracing::debug!(
            accepted = report.accepted,
            dropped = report.dropped,
            stale = report.stale,
            deferred = report.deferred.len(),
            rows = report.parameter_rows,
            "Processed index message batch"
        );
        Ok(report)
    }

    /// Parses and checks one message. Returns None if it must be dropped.
    fn admit<'m>(&self, raw: &'m str) -> Option<Candidate<'m>> {
        let message = match IndexMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "Dropping unparsable index message");
                return None;
            }
        };

        let config = &self.ctx.config;
        if message.message_version < config.min_message_version {
            let e = MessageError::UnsupportedVersion {
                version: message.message_version,
                minimum: config.min_message_version,
            };
            tracing::warn!(error = %e, "Dropping index message");
            return None;
        }
        if !config.tenant_id.matches(&message.tenant_id) {
            let e = MessageError::TenantMismatch {
                expected: config.tenant_id.as_str().to_string(),
                actual: message.tenant_id.clone(),
            };
            tracing::warn!(error = %e, "Dropping index message");
            return None;
        }

        let data = &message.data;
        let checked = self
            .ctx
            .resource_type_id(&data.resource_type)
            .and_then(|rtid| validate_logical_id(&data.resource_type, &data.logical_id).map(|_| rtid));
        let resource_type_id = match checked {
            Ok(rtid) => rtid,
            Err(e) => {
                tracing::warn!(
                    resource_type = %data.resource_type,
                    logical_id = %data.logical_id,
                    error = %e,
                    "Dropping index message"
                );
                return None;
            }
        };

        let key = IdentKey::new(resource_type_id, data.logical_id.clone());
        Some(Candidate { raw, message, key })
    }

    /// Compares the message version with the committed logical resource.
    fn readiness(&self, candidate: &Candidate<'_>) -> StorageResult<Readiness> {
        let data = &candidate.message.data;
        let Some(version) = data.version_id else {
            return Ok(Readiness::Ready);
        };

        let current: Option<(i32, Option<String>)> = self
            .conn
            .prepare_cached(READINESS_SQL)?
            .query_row(
                params![candidate.key.resource_type_id, candidate.key.logical_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((db_version, db_hash)) = current else {
            return Ok(Readiness::NotReady);
        };

        if db_version > version {
            return Ok(Readiness::Stale);
        }
        if db_version < version {
            return Ok(Readiness::NotReady);
        }
        match (&db_hash, &data.parameter_hash) {
            (Some(stored), Some(sent)) if stored != sent => {
                tracing::warn!(
                    resource_type = %data.resource_type,
                    logical_id = %data.logical_id,
                    version,
                    "Parameter hash differs from the committed version, skipping"
                );
                Ok(Readiness::Stale)
            }
            // Without both hashes there is nothing to compare; the version
            // match alone decides.
            _ => Ok(Readiness::Ready),
        }
    }
}
