//! SQLite backend implementation.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheStage, IdentityCache};
use crate::config::StoreConfig;
use crate::core::{Backend, BackendKind};
use crate::dialect::translator_for;
use crate::error::{BackendError, StorageError, StorageResult};
use crate::remote::{BatchReport, IndexMessageConsumer, MessageProcessor};
use crate::search::reindex::{self, ReindexQueue, ReindexResult};
use crate::search::{ParameterExtractor, PathExtractor};
use crate::store::StoreContext;

use super::schema;

const BACKEND_NAME: &str = "sqlite";

/// SQLite backend for the resource store.
pub struct SqliteBackend {
    pool: Pool<SqliteConnectionManager>,
    is_memory: bool,
    context: StoreContext,
}

impl Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("tenant", &self.context.config.tenant_id)
            .field("schema_type", &self.context.config.schema_type)
            .field("is_memory", &self.is_memory)
            .field("pool_size", &self.pool.max_size())
            .finish_non_exhaustive()
    }
}

/// Configuration for the SQLite backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteBackendConfig {
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of idle connections.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u32,

    /// Enable WAL mode so readers do not block the writer.
    #[serde(default = "default_true")]
    pub enable_wal: bool,

    /// Enable foreign key constraints.
    #[serde(default = "default_true")]
    pub enable_foreign_keys: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout_ms() -> u64 {
    30000
}

fn default_busy_timeout_ms() -> u32 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for SqliteBackendConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
            enable_foreign_keys: true,
        }
    }
}

fn connection_failed(message: impl Into<String>) -> StorageError {
    StorageError::Backend(BackendError::ConnectionFailed {
        backend_name: BACKEND_NAME.to_string(),
        message: message.into(),
    })
}

impl SqliteBackend {
    /// Creates a new in-memory SQLite backend with the default configuration.
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_config(":memory:", StoreConfig::default())
    }

    /// Opens or creates a file-based SQLite database.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::with_config(path, StoreConfig::default())
    }

    /// Creates a backend with custom configuration and initializes its schema.
    pub fn with_config<P: AsRef<Path>>(path: P, config: StoreConfig) -> StorageResult<Self> {
        config.ensure_valid()?;

        let path_str = path.as_ref().to_string_lossy();
        let is_memory = path_str == ":memory:";
        let sqlite = config.sqlite.clone();

        let manager = if is_memory {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path.as_ref())
        };
        let manager = manager.with_init(move |conn| configure_connection(conn, &sqlite, is_memory));

        // Every in-memory connection is its own database, so the pool holds
        // exactly one and never recycles it.
        let builder = if is_memory {
            Pool::builder()
                .max_size(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            Pool::builder()
                .max_size(config.sqlite.max_connections)
                .min_idle(Some(config.sqlite.min_connections))
        };
        let pool = builder
            .connection_timeout(Duration::from_millis(config.sqlite.connection_timeout_ms))
            .build(manager)
            .map_err(|e| connection_failed(e.to_string()))?;

        let context = StoreContext {
            caches: Arc::new(IdentityCache::new(config.cache_warn_entries)),
            translator: translator_for(BackendKind::Sqlite),
            extractor: Arc::new(PathExtractor::builtin()),
            config: Arc::new(config),
        };

        let backend = Self {
            pool,
            is_memory,
            context,
        };
        backend.init_schema()?;

        info!(
            tenant = %backend.context.config.tenant_id,
            schema_type = ?backend.context.config.schema_type,
            memory = is_memory,
            "SQLite backend ready"
        );
        Ok(backend)
    }

    /// Replaces the parameter extractor used by writes and reindexing.
    pub fn with_extractor(mut self, extractor: Arc<dyn ParameterExtractor>) -> Self {
        self.context.extractor = extractor;
        self
    }

    /// Creates missing tables and loads the resource type dictionary into
    /// the caches. Idempotent.
    pub fn init_schema(&self) -> StorageResult<()> {
        let conn = self.get_connection()?;
        schema::initialize_schema(&conn, &self.context.config.resource_types)?;
        let types = schema::load_resource_types(&conn)?;
        debug!(count = types.len(), "Loaded resource types");
        self.context.caches.prefill_resource_types(types);
        Ok(())
    }

    /// Get a connection from the pool.
    pub(crate) fn get_connection(
        &self,
    ) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| connection_failed(e.to_string()))
    }

    /// Runs `f` in an immediate transaction.
    ///
    /// Ids staged by `f` are published to the shared caches only after the
    /// commit succeeds; on any error they are discarded and the transaction
    /// rolls back.
    pub(crate) fn with_write_tx<T>(
        &self,
        f: impl FnOnce(&Connection, &StoreContext, &mut CacheStage) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut stage = CacheStage::new();

        match f(&*tx, &self.context, &mut stage) {
            Ok(value) => {
                tx.commit()?;
                self.context.caches.publish(stage);
                Ok(value)
            }
            Err(e) => {
                stage.clear();
                if let Err(rollback) = tx.rollback() {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Runs `f` in a fresh transaction per attempt, retrying transient
    /// failures up to `max_write_attempts` times.
    pub(crate) async fn with_retry<T, F>(&self, operation: &'static str, f: F) -> StorageResult<T>
    where
        F: Fn(&Connection, &StoreContext, &mut CacheStage) -> StorageResult<T> + Send + Sync,
        T: Send,
    {
        let attempts = self.context.config.max_write_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.with_write_tx(&f) {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(operation, attempt, error = %e, "Retrying transaction");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Runs a read-only closure on a pooled connection.
    pub(crate) fn with_read<T>(
        &self,
        f: impl FnOnce(&Connection, &StoreContext) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let conn = self.get_connection()?;
        f(&*conn, &self.context)
    }

    /// Returns whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.is_memory
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.context.config
    }

    /// Returns the context shared by every unit of work on this backend.
    pub fn context(&self) -> &StoreContext {
        &self.context
    }
}

fn configure_connection(
    conn: &mut Connection,
    config: &SqliteBackendConfig,
    is_memory: bool,
) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(Duration::from_millis(u64::from(config.busy_timeout_ms)))?;
    if config.enable_foreign_keys {
        conn.pragma_update(None, "foreign_keys", true)?;
    }
    if config.enable_wal && !is_memory {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    }
    Ok(())
}

#[async_trait]
impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        let conn = self
            .get_connection()
            .map_err(|_| BackendError::PoolExhausted {
                backend_name: BACKEND_NAME.to_string(),
            })?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| BackendError::ConnectionFailed {
                backend_name: BACKEND_NAME.to_string(),
                message: format!("health check failed: {}", e),
            })?;
        Ok(())
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.init_schema().map_err(|e| BackendError::DataAccess {
            message: format!("failed to initialize schema: {}", e),
            source: None,
        })
    }
}

#[async_trait]
impl ReindexQueue for SqliteBackend {
    async fn reindex_next(
        &self,
        cutoff: DateTime<Utc>,
        force: bool,
    ) -> StorageResult<Option<ReindexResult>> {
        self.with_write_tx(|conn, ctx, stage| reindex::reindex_next(conn, ctx, stage, cutoff, force))
    }
}

#[async_trait]
impl IndexMessageConsumer for SqliteBackend {
    async fn process_batch(&self, messages: Vec<String>) -> StorageResult<BatchReport> {
        let report = self
            .with_retry("process_batch", |conn, ctx, stage| {
                MessageProcessor::new(conn, ctx).process(stage, &messages)
            })
            .await?;
        info!(
            accepted = report.accepted,
            dropped = report.dropped,
            stale = report.stale,
            deferred = report.deferred.len(),
            rows = report.parameter_rows,
            "Processed index message batch"
        );
        Ok(report)
    }
}
