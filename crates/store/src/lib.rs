//! Helios FHIR Server Index Store
//!
//! This crate is the storage substrate under a FHIR server: it keeps every
//! version of every resource, maintains the search-parameter index tables
//! that queries run against, and keeps both consistent under concurrent
//! writers.
//!
//! # Features
//!
//! - **Identity**: race-safe mapping of `(resource type, logical id)` to a
//!   surrogate id, shared by resources and by references to them
//! - **Versioning**: strictly increasing versions per logical resource,
//!   idempotent replay of explicit versions, delete markers
//! - **Search index**: extraction of parameter values, dictionary ids for
//!   names, systems, tokens and canonicals, batched full replacement
//! - **Reindex**: claim-based rebuilding with any number of workers
//! - **Distributed indexing**: applying index messages produced elsewhere,
//!   with stale and early messages detected per version
//!
//! # Architecture
//!
//! - [`config`] - store configuration
//! - [`error`] - error types for all operations
//! - [`types`] - versions, write requests and parameter values
//! - [`cache`] - process-wide dictionary caches with staged publication
//! - [`dialect`] - SQL differences between engines
//! - [`store`] - identity resolution, the version writer and readers
//! - [`search`] - parameter extraction, dictionaries, persistence, reindex
//! - [`remote`] - index message processing
//! - [`core`] - storage traits
//! - [`backends`] - backend implementations (SQLite)
//! - [`tenant`] - tenant identity
//!
//! # Quick Start
//!
//! ```no_run
//! use helios_index_store::backends::sqlite::SqliteBackend;
//! use helios_index_store::core::ResourceStorage;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), helios_index_store::StorageError> {
//! let backend = SqliteBackend::in_memory()?;
//!
//! let outcome = backend
//!     .upsert(
//!         "Patient",
//!         "patient-123",
//!         json!({
//!             "resourceType": "Patient",
//!             "id": "patient-123",
//!             "name": [{"family": "Smith", "given": ["John"]}]
//!         }),
//!     )
//!     .await?;
//!
//! assert_eq!(outcome.version.version_id(), 1);
//! assert_eq!(outcome.version.url(), "Patient/patient-123");
//! # Ok(())
//! # }
//! ```
//!
//! # Reindexing
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chrono::Utc;
//! use helios_index_store::backends::sqlite::SqliteBackend;
//! use helios_index_store::search::ReindexSweep;
//!
//! # async fn example() -> Result<(), helios_index_store::StorageError> {
//! let backend = Arc::new(SqliteBackend::open("store.db")?);
//! let progress = ReindexSweep::new(Utc::now())
//!     .with_workers(4)
//!     .run(backend)
//!     .await?;
//! println!("{} resources reindexed", progress.replaced);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backends;
pub mod cache;
pub mod config;
pub mod core;
pub mod dialect;
pub mod error;
pub mod remote;
pub mod search;
pub mod store;
pub mod tenant;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{SchemaType, StoreConfig};
pub use error::{StorageError, StorageResult};
pub use tenant::TenantId;
pub use types::{StoredVersion, WriteDisposition, WriteOutcome, WriteRequest};

// Re-export core traits
pub use core::{Backend, BackendKind, ResourceStorage};
pub use remote::IndexMessageConsumer;
pub use search::ReindexQueue;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
