//! SQL dialect translation.
//!
//! The store issues the same statements against every relational engine and
//! asks a [`DatabaseTranslator`] for the few fragments that differ: the
//! conflict-tolerant insert clause, locking reads, locked-row skipping,
//! pagination and sequence access. Engine error codes are mapped onto an
//! [`ErrorCategory`] so nothing above this layer sees raw engine codes.
//!
//! One translator is chosen at startup from [`BackendKind`] via
//! [`translator_for`].

mod postgres;
mod sqlite;

use std::fmt::Debug;
use std::sync::Arc;

pub use postgres::PostgresTranslator;
pub use sqlite::SqliteTranslator;

use crate::core::BackendKind;

/// Name of the sequence that issues logical resource and resource ids.
pub const FHIR_SEQUENCE: &str = "fhir_sequence";

/// Name of the sequence that issues dictionary ids in the distributed schema.
pub const FHIR_REF_SEQUENCE: &str = "fhir_ref_sequence";

/// Engine-independent classification of a failed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Unique or primary key violation.
    DuplicateValue,
    /// Timed out waiting for a lock.
    LockTimeout,
    /// Deadlock or serialization failure.
    Deadlock,
    /// Missing table, column, sequence or function.
    UndefinedObject,
    /// The connection is gone.
    ConnectionLost,
    /// Anything else.
    Other,
}

impl ErrorCategory {
    /// Returns true for categories worth retrying as a whole operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::LockTimeout | ErrorCategory::Deadlock | ErrorCategory::ConnectionLost
        )
    }
}

/// Supplies dialect-specific SQL fragments and error classification.
pub trait DatabaseTranslator: Send + Sync + Debug {
    /// The engine this translator speaks for.
    fn kind(&self) -> BackendKind;

    /// Clause appended to an `INSERT` so that a unique conflict inserts nothing.
    fn on_conflict_do_nothing(&self) -> &'static str {
        " ON CONFLICT DO NOTHING"
    }

    /// Suffix for a locking read of a single row.
    fn for_update(&self) -> &'static str;

    /// Suffix for a locking read that skips rows locked by other sessions.
    fn for_update_skip_locked(&self) -> &'static str;

    /// A row limit clause.
    fn limit(&self, rows: u64) -> String {
        format!(" LIMIT {}", rows)
    }

    /// An offset/limit pagination clause.
    fn pagination(&self, offset: u64, rows: u64) -> String {
        format!(" LIMIT {} OFFSET {}", rows, offset)
    }

    /// A statement returning a single row with the next value of `sequence`.
    fn next_value_sql(&self, sequence: &str) -> String;

    /// Whether the engine can assign surrogate ids itself. Sharded engines
    /// can't, so the distributed schema always supplies them explicitly.
    fn supports_identity_columns(&self) -> bool {
        true
    }

    /// Classifies an engine error code (and its message) into a category.
    fn classify_code(&self, code: &str, message: &str) -> ErrorCategory;
}

/// Returns the translator for the configured engine.
pub fn translator_for(kind: BackendKind) -> Arc<dyn DatabaseTranslator> {
    match kind {
        BackendKind::Sqlite => Arc::new(SqliteTranslator),
        BackendKind::Postgres => Arc::new(PostgresTranslator),
    }
}
