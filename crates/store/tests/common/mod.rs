//! Test infrastructure for the index store.
//!
//! Concurrency tests need several pooled connections, so they run against a
//! WAL database in a temporary directory instead of `:memory:`.

#![allow(dead_code)]

pub mod fixtures;

use std::path::PathBuf;
use std::sync::Arc;

use helios_index_store::StoreConfig;
use helios_index_store::backends::sqlite::SqliteBackend;
use rusqlite::Connection;
use tempfile::TempDir;

pub use fixtures::*;

/// A file-backed store that lives as long as its directory.
pub struct TestStore {
    /// The backend under test.
    pub backend: Arc<SqliteBackend>,
    path: PathBuf,
    _dir: TempDir,
}

impl TestStore {
    /// Creates a store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates a store with a custom configuration.
    pub fn with_config(config: StoreConfig) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("store.db");
        let backend = Arc::new(
            SqliteBackend::with_config(&path, config).expect("Failed to create SQLite backend"),
        );
        Self {
            backend,
            path,
            _dir: dir,
        }
    }

    /// Opens a separate connection for inspecting tables.
    pub fn inspect(&self) -> Connection {
        Connection::open(&self.path).expect("Failed to open inspection connection")
    }

    /// Runs a `SELECT COUNT(*)` style query.
    pub fn count(&self, sql: &str) -> i64 {
        self.inspect()
            .query_row(sql, [], |row| row.get(0))
            .expect("count query failed")
    }
}
