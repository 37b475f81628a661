//! SQLite backend implementation.
//!
//! Supports in-memory databases (for tests) and file-based databases in WAL
//! mode. SQLite allows one writer at a time, so every write transaction is
//! opened `IMMEDIATE`: it takes the write lock up front and waits up to the
//! busy timeout for it instead of failing on upgrade.
//!
//! # Example
//!
//! ```no_run
//! use helios_index_store::backends::sqlite::SqliteBackend;
//! use helios_index_store::config::StoreConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StoreConfig::default();
//! let backend = SqliteBackend::with_config("store.db", config)?;
//! assert!(!backend.is_memory());
//! # Ok(())
//! # }
//! ```
//!
//! # Schema
//!
//! ```sql
//! -- One row per (type, id), created before the resource itself
//! CREATE TABLE logical_resource_ident (...);
//! -- Current version pointer, parameter hash and reindex stamp
//! CREATE TABLE logical_resources (...);
//! -- Every version, including delete markers
//! CREATE TABLE resources (...);
//! -- Per-type and whole-system parameter tables
//! CREATE TABLE str_values (...);
//! ```

mod backend;
pub mod schema;
mod storage;

pub use backend::{SqliteBackend, SqliteBackendConfig};
