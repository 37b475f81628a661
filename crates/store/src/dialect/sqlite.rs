//! SQLite dialect.

use super::{DatabaseTranslator, ErrorCategory};
use crate::core::BackendKind;

// Extended result codes, see https://www.sqlite.org/rescode.html
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CANTOPEN: i32 = 14;
const SQLITE_NOTADB: i32 = 26;
const SQLITE_ERROR: i32 = 1;
const SQLITE_BUSY_SNAPSHOT: i32 = 517;
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

/// Translator for SQLite.
///
/// SQLite has no row locks: an `IMMEDIATE` transaction holds the database
/// write lock, so locking reads and skip-locked suffixes are empty. Sequences
/// are rows in `id_sequences`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteTranslator;

impl SqliteTranslator {
    /// Classifies a rusqlite error.
    pub fn classify_sqlite(&self, err: &rusqlite::Error) -> ErrorCategory {
        match err {
            rusqlite::Error::SqliteFailure(failure, message) => self.classify_code(
                &failure.extended_code.to_string(),
                message.as_deref().unwrap_or_default(),
            ),
            _ => ErrorCategory::Other,
        }
    }
}

impl DatabaseTranslator for SqliteTranslator {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn for_update(&self) -> &'static str {
        ""
    }

    fn for_update_skip_locked(&self) -> &'static str {
        ""
    }

    fn next_value_sql(&self, sequence: &str) -> String {
        format!(
            "UPDATE id_sequences SET last_value = last_value + 1 WHERE sequence_name = '{}' RETURNING last_value",
            sequence
        )
    }

    fn classify_code(&self, code: &str, message: &str) -> ErrorCategory {
        let Ok(extended) = code.parse::<i32>() else {
            return ErrorCategory::Other;
        };

        match extended {
            SQLITE_CONSTRAINT_UNIQUE | SQLITE_CONSTRAINT_PRIMARYKEY => {
                return ErrorCategory::DuplicateValue;
            }
            // A WAL read snapshot can't be upgraded to a write; the
            // transaction has to start over.
            SQLITE_BUSY_SNAPSHOT => return ErrorCategory::Deadlock,
            _ => {}
        }

        match extended & 0xff {
            SQLITE_BUSY => ErrorCategory::LockTimeout,
            SQLITE_LOCKED => ErrorCategory::Deadlock,
            SQLITE_CANTOPEN | SQLITE_NOTADB => ErrorCategory::ConnectionLost,
            SQLITE_ERROR
                if message.starts_with("no such table")
                    || message.starts_with("no such column") =>
            {
                ErrorCategory::UndefinedObject
            }
            _ => ErrorCategory::Other,
        }
    }
}
