//! Claim-based reindexing.
//!
//! Every logical resource carries a `reindex_tstamp`. A reindex pass picks a
//! cutoff and repeatedly claims one resource whose timestamp is older than
//! the cutoff, stamping it with the cutoff in the same statement. The claim,
//! the re-extraction and the parameter replacement share one transaction, so
//! a worker that fails leaves the resource due for the next claim.
//!
//! Any number of workers can run the same pass. Claims skip rows locked by
//! other sessions where the engine supports it; on SQLite the write lock
//! serializes claims instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::CacheStage;
use crate::error::{StorageResult, ValidationError, data_access};
use crate::store::writer::store_hash;
use crate::store::{StoreContext, reader};
use crate::types::{ExtractedParameterValue, to_db_timestamp};

use super::hash::parameter_hash;
use super::persist::{IndexingUnit, ParameterPersister};

/// A logical resource claimed for reindexing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexClaim {
    /// The claimed resource.
    pub logical_resource_id: i64,
    /// Its type name.
    pub resource_type: String,
    /// Its type id.
    pub resource_type_id: i32,
    /// Its business id.
    pub logical_id: String,
    /// Surrogate id of its current version.
    pub current_resource_id: i64,
    /// Its current version.
    pub version_id: i32,
    /// Its shard.
    pub shard_key: i16,
    /// Parameter hash stored before this claim.
    pub parameter_hash: Option<String>,
    /// How often the resource has been claimed, including this claim.
    pub reindex_txid: i64,
}

/// Result of reindexing one claimed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexResult {
    /// What was claimed.
    pub claim: ReindexClaim,
    /// Whether the parameter rows were replaced.
    pub replaced: bool,
}

/// Claims the next due resource, if any.
pub fn claim_next(
    conn: &Connection,
    ctx: &StoreContext,
    cutoff: DateTime<Utc>,
) -> StorageResult<Option<ReindexClaim>> {
    let sql = format!(
        "UPDATE logical_resources
            SET reindex_tstamp = ?1, reindex_txid = reindex_txid + 1
          WHERE logical_resource_id = (
                SELECT logical_resource_id FROM logical_resources
                 WHERE reindex_tstamp < ?1 AND is_deleted = 0
                 ORDER BY reindex_tstamp, logical_resource_id{}{})
         RETURNING logical_resource_id, resource_type_id, logical_id, current_resource_id,
                   version_id, shard_key, parameter_hash, reindex_txid",
        ctx.translator.limit(1),
        ctx.translator.for_update_skip_locked()
    );

    let row = conn
        .prepare_cached(&sql)?
        .query_row(params![to_db_timestamp(cutoff)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i32>(4)?,
                row.get::<_, i16>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })
        .optional()?;

    let Some((lrid, rtid, logical_id, current_resource_id, version_id, shard_key, hash, txid)) = row
    else {
        return Ok(None);
    };

    let resource_type = ctx.caches.resource_type_name(rtid).ok_or_else(|| {
        data_access(format!("unknown resource type id {} on resource {}", rtid, lrid))
    })?;

    Ok(Some(ReindexClaim {
        logical_resource_id: lrid,
        resource_type: resource_type.to_string(),
        resource_type_id: rtid,
        logical_id,
        current_resource_id,
        version_id,
        shard_key,
        parameter_hash: hash,
        reindex_txid: txid,
    }))
}

/// Claims one resource and rebuilds its parameters. Must run inside a write
/// transaction.
///
/// Rows are only replaced when the re-extracted parameters hash differently
/// from what is stored, or when `force` is set.
pub fn reindex_next(
    conn: &Connection,
    ctx: &StoreContext,
    stage: &mut CacheStage,
    cutoff: DateTime<Utc>,
    force: bool,
) -> StorageResult<Option<ReindexResult>> {
    let cutoff = cutoff.trunc_subsecs(6);
    if cutoff > Utc::now() {
        return Err(ValidationError::InvalidCutoff {
            cutoff: to_db_timestamp(cutoff),
        }
        .into());
    }

    let Some(claim) = claim_next(conn, ctx, cutoff)? else {
        return Ok(None);
    };

    if !ctx.config.supports_resource_type(&claim.resource_type) {
        tracing::warn!(
            resource_type = %claim.resource_type,
            logical_id = %claim.logical_id,
            "Claimed resource of an unconfigured type; leaving its parameters"
        );
        return Ok(Some(ReindexResult {
            claim,
            replaced: false,
        }));
    }

    let version = reader::load_by_resource_id(
        conn,
        &claim.resource_type,
        &claim.logical_id,
        claim.current_resource_id,
    )?
    .ok_or_else(|| {
        data_access(format!(
            "current version {} of {}/{} is missing",
            claim.version_id, claim.resource_type, claim.logical_id
        ))
    })?;

    let parameters = ExtractedParameterValue::flatten(
        ctx.extractor.extract(&claim.resource_type, version.content()),
    );
    let hash = parameter_hash(&parameters);

    if !force && claim.parameter_hash.as_deref() == Some(hash.as_str()) {
        tracing::debug!(
            resource_type = %claim.resource_type,
            logical_id = %claim.logical_id,
            "Parameters unchanged, skipping"
        );
        return Ok(Some(ReindexResult {
            claim,
            replaced: false,
        }));
    }

    let unit = IndexingUnit {
        logical_resource_id: claim.logical_resource_id,
        resource_type: claim.resource_type.clone(),
        resource_type_id: claim.resource_type_id,
        shard_key: claim.shard_key,
        parameters,
    };
    let rows = ParameterPersister::new(conn, ctx).replace(stage, std::slice::from_ref(&unit))?;
    store_hash(conn, claim.logical_resource_id, Some(&hash))?;

    tracing::debug!(
        resource_type = %claim.resource_type,
        logical_id = %claim.logical_id,
        rows,
        "Reindexed resource"
    );
    Ok(Some(ReindexResult {
        claim,
        replaced: true,
    }))
}

/// Something reindex workers can pull claims from.
#[async_trait]
pub trait ReindexQueue: Send + Sync {
    /// Claims and reindexes the next due resource in its own transaction.
    async fn reindex_next(
        &self,
        cutoff: DateTime<Utc>,
        force: bool,
    ) -> StorageResult<Option<ReindexResult>>;
}

/// Totals of a reindex sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexProgress {
    /// Unique sweep identifier.
    pub job_id: String,

    /// Resources claimed.
    pub claimed: u64,

    /// Resources whose parameter rows were replaced.
    pub replaced: u64,

    /// Resources whose parameters were already current.
    pub unchanged: u64,

    /// Workers stopped by a non-retryable error.
    pub failed: u64,

    /// When the sweep started.
    pub started_at: Option<String>,

    /// When the sweep completed.
    pub completed_at: Option<String>,
}

impl ReindexProgress {
    fn merge(&mut self, other: &ReindexProgress) {
        self.claimed += other.claimed;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

/// Runs reindex workers until nothing older than the cutoff is left.
#[derive(Debug, Clone)]
pub struct ReindexSweep {
    cutoff: DateTime<Utc>,
    workers: usize,
    force: bool,
    max_retries: u32,
}

impl ReindexSweep {
    /// Creates a sweep with a single worker.
    pub fn new(cutoff: DateTime<Utc>) -> Self {
        Self {
            cutoff,
            workers: 1,
            force: false,
            max_retries: 3,
        }
    }

    /// Sets the number of concurrent workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Replaces parameter rows even when their hash is unchanged.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Sets how often a worker retries a transient failure in a row.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Runs the sweep to completion.
    pub async fn run<Q>(&self, queue: Arc<Q>) -> StorageResult<ReindexProgress>
    where
        Q: ReindexQueue + ?Sized + 'static,
    {
        let mut progress = ReindexProgress {
            job_id: Uuid::new_v4().to_string(),
            started_at: Some(Utc::now().to_rfc3339()),
            ..ReindexProgress::default()
        };
        tracing::info!(
            job_id = %progress.job_id,
            workers = self.workers,
            force = self.force,
            cutoff = %self.cutoff,
            "Starting reindex sweep"
        );

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let queue = Arc::clone(&queue);
            let sweep = self.clone();
            handles.push(tokio::spawn(async move { sweep.work(worker, queue).await }));
        }

        for handle in handles {
            let worker_progress = handle
                .await
                .map_err(|e| data_access(format!("reindex worker panicked: {}", e)))?;
            progress.merge(&worker_progress);
        }

        progress.completed_at = Some(Utc::now().to_rfc3339());
        tracing::info!(
            job_id = %progress.job_id,
            claimed = progress.claimed,
            replaced = progress.replaced,
            unchanged = progress.unchanged,
            failed = progress.failed,
            "Reindex sweep finished"
        );
        Ok(progress)
    }

    async fn work<Q>(&self, worker: usize, queue: Arc<Q>) -> ReindexProgress
    where
        Q: ReindexQueue + ?Sized,
    {
        let mut progress = ReindexProgress::default();
        let mut retries = 0;
        loop {
            match queue.reindex_next(self.cutoff, self.force).await {
                Ok(Some(result)) => {
                    retries = 0;
                    progress.claimed += 1;
                    if result.replaced {
                        progress.replaced += 1;
                    } else {
                        progress.unchanged += 1;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    tracing::debug!(worker, retries, error = %e, "Retrying reindex claim");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(retries))).await;
                }
                Err(e) => {
                    tracing::error!(worker, error = %e, "Reindex worker stopped");
                    progress.failed += 1;
                    break;
                }
            }
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConcurrencyError, StorageError};
    use crate::store::writer;
    use crate::test_support::memory_context;
    use crate::types::WriteRequest;
    use parking_lot::Mutex;
    use serde_json::json;

    fn write_patient(conn: &Connection, ctx: &StoreContext, id: &str) {
        let mut stage = CacheStage::new();
        writer::write(
            conn,
            ctx,
            &mut stage,
            &WriteRequest::upsert(
                "Patient",
                id,
                json!({"resourceType": "Patient", "id": id, "gender": "female"}),
            ),
        )
        .unwrap();
        ctx.caches.publish(stage);
    }

    #[test]
    fn test_claims_each_resource_once_per_cutoff() {
        let (conn, ctx) = memory_context();
        write_patient(&conn, &ctx, "a");
        write_patient(&conn, &ctx, "b");

        let cutoff = Utc::now();
        let first = claim_next(&conn, &ctx, cutoff).unwrap().unwrap();
        let second = claim_next(&conn, &ctx, cutoff).unwrap().unwrap();
        assert_ne!(first.logical_resource_id, second.logical_resource_id);
        assert_eq!(first.reindex_txid, 1);
        assert_eq!(first.resource_type, "Patient");
        assert!(claim_next(&conn, &ctx, cutoff).unwrap().is_none());

        // A later cutoff makes everything due again.
        let later = cutoff + chrono::Duration::milliseconds(1);
        let again = claim_next(&conn, &ctx, later).unwrap().unwrap();
        assert_eq!(again.reindex_txid, 2);
    }

    #[test]
    fn test_deleted_resources_are_not_claimed() {
        let (conn, ctx) = memory_context();
        write_patient(&conn, &ctx, "a");
        let mut stage = CacheStage::new();
        writer::write(&conn, &ctx, &mut stage, &WriteRequest::delete("Patient", "a")).unwrap();
        assert!(claim_next(&conn, &ctx, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn test_unchanged_hash_skips_replacement() {
        let (conn, ctx) = memory_context();
        write_patient(&conn, &ctx, "a");

        let mut stage = CacheStage::new();
        let result = reindex_next(&conn, &ctx, &mut stage, Utc::now(), false)
            .unwrap()
            .unwrap();
        assert!(!result.replaced);

        let later = Utc::now() + chrono::Duration::microseconds(1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let forced = reindex_next(&conn, &ctx, &mut stage, later, true)
            .unwrap()
            .unwrap();
        assert!(forced.replaced);
    }

    #[test]
    fn test_changed_hash_replaces_rows() {
        let (conn, ctx) = memory_context();
        write_patient(&conn, &ctx, "a");
        conn.execute("UPDATE logical_resources SET parameter_hash = 'stale'", [])
            .unwrap();
        conn.execute("DELETE FROM patient_resource_token_refs", []).unwrap();

        let mut stage = CacheStage::new();
        let result = reindex_next(&conn, &ctx, &mut stage, Utc::now(), false)
            .unwrap()
            .unwrap();
        assert!(result.replaced);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM patient_resource_token_refs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_future_cutoff_is_rejected() {
        let (conn, ctx) = memory_context();
        let mut stage = CacheStage::new();
        let err = reindex_next(
            &conn,
            &ctx,
            &mut stage,
            Utc::now() + chrono::Duration::hours(1),
            false,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Validation(ValidationError::InvalidCutoff { .. })
        ));
    }

    /// Hands out a fixed number of claims, failing transiently first.
    struct ScriptedQueue {
        remaining: Mutex<u32>,
        transient_failures: Mutex<u32>,
    }

    #[async_trait]
    impl ReindexQueue for ScriptedQueue {
        async fn reindex_next(
            &self,
            _cutoff: DateTime<Utc>,
            _force: bool,
        ) -> StorageResult<Option<ReindexResult>> {
            {
                let mut failures = self.transient_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(ConcurrencyError::LockTimeout {
                        message: "busy".to_string(),
                    }
                    .into());
                }
            }
            let mut remaining = self.remaining.lock();
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
            Ok(Some(ReindexResult {
                claim: ReindexClaim {
                    logical_resource_id: i64::from(*remaining),
                    resource_type: "Patient".to_string(),
                    resource_type_id: 1,
                    logical_id: format!("p{}", remaining),
                    current_resource_id: 1,
                    version_id: 1,
                    shard_key: 0,
                    parameter_hash: None,
                    reindex_txid: 1,
                },
                replaced: *remaining % 2 == 0,
            }))
        }
    }

    #[tokio::test]
    async fn test_sweep_aggregates_workers() {
        let queue = Arc::new(ScriptedQueue {
            remaining: Mutex::new(10),
            transient_failures: Mutex::new(2),
        });
        let progress = ReindexSweep::new(Utc::now())
            .with_workers(3)
            .run(queue)
            .await
            .unwrap();

        assert_eq!(progress.claimed, 10);
        assert_eq!(progress.replaced + progress.unchanged, 10);
        assert_eq!(progress.failed, 0);
        assert!(!progress.job_id.is_empty());
        assert!(progress.completed_at.is_some());
    }
}
