//! Sequence access.

use rusqlite::Connection;

use crate::dialect::DatabaseTranslator;
use crate::error::{StorageResult, data_access};

/// Draws the next value from `sequence`.
pub fn next_id(
    conn: &Connection,
    translator: &dyn DatabaseTranslator,
    sequence: &str,
) -> StorageResult<i64> {
    let sql = translator.next_value_sql(sequence);
    let value: Option<i64> = conn
        .prepare_cached(&sql)?
        .query_row([], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    value.ok_or_else(|| data_access(format!("sequence '{}' does not exist", sequence)))
}
