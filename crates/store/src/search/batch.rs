//! Batched parameter inserts.

use std::collections::BTreeMap;

use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};

use crate::error::{StorageResult, data_access};

use super::tables::TableTarget;

/// Collects parameter rows per table and inserts them in batches.
///
/// Rows are flushed once `threshold` rows are pending, and on
/// [`finish`](Self::finish). Tables are flushed in a fixed order so that
/// concurrent batches acquire engine locks in the same order.
pub struct ParameterBatcher<'c> {
    conn: &'c Connection,
    threshold: usize,
    pending: BTreeMap<TableTarget, Vec<Vec<Value>>>,
    pending_rows: usize,
    written: usize,
}

impl<'c> ParameterBatcher<'c> {
    /// Creates a batcher that flushes every `threshold` rows.
    pub fn new(conn: &'c Connection, threshold: usize) -> Self {
        Self {
            conn,
            threshold: threshold.max(1),
            pending: BTreeMap::new(),
            pending_rows: 0,
            written: 0,
        }
    }

    /// Queues one row, flushing if the threshold is reached.
    pub fn add(&mut self, target: TableTarget, row: Vec<Value>) -> StorageResult<()> {
        if row.len() != target.columns().len() {
            return Err(data_access(format!(
                "row for {} has {} values, expected {}",
                target.name(),
                row.len(),
                target.columns().len()
            )));
        }
        self.pending.entry(target).or_default().push(row);
        self.pending_rows += 1;
        if self.pending_rows >= self.threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Number of rows queued but not yet inserted.
    pub fn pending(&self) -> usize {
        self.pending_rows
    }

    /// Inserts everything pending.
    pub fn flush(&mut self) -> StorageResult<()> {
        if self.pending_rows == 0 {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        for (target, rows) in pending {
            let mut stmt = self.conn.prepare_cached(&target.insert_sql())?;
            for row in &rows {
                stmt.execute(params_from_iter(row.iter()))?;
            }
            tracing::trace!(table = %target.name(), rows = rows.len(), "Flushed parameter rows");
            self.written += rows.len();
        }
        self.pending_rows = 0;
        Ok(())
    }

    /// Flushes and returns the total number of rows inserted.
    pub fn finish(mut self) -> StorageResult<usize> {
        self.flush()?;
        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::tables::{ParameterTable, WholeSystemTable};
    use crate::test_support::memory_context;

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    fn str_row(lrid: i64, value: &str) -> Vec<Value> {
        vec![
            Value::Integer(1),
            Value::Text(value.to_string()),
            Value::Text(value.to_lowercase()),
            Value::Integer(lrid),
            Value::Null,
        ]
    }

    #[test]
    fn test_flushes_at_threshold() {
        let (conn, _ctx) = memory_context();
        conn.execute("INSERT INTO parameter_names (parameter_name) VALUES ('name')", [])
            .unwrap();
        let target = TableTarget::PerType(ParameterTable::StrValues, "Patient".to_string());

        let mut batcher = ParameterBatcher::new(&conn, 2);
        batcher.add(target.clone(), str_row(1, "A")).unwrap();
        assert_eq!(batcher.pending(), 1);
        assert_eq!(count(&conn, "patient_str_values"), 0);

        batcher.add(target.clone(), str_row(1, "B")).unwrap();
        assert_eq!(batcher.pending(), 0);
        assert_eq!(count(&conn, "patient_str_values"), 2);

        batcher.add(target, str_row(2, "C")).unwrap();
        assert_eq!(batcher.finish().unwrap(), 3);
        assert_eq!(count(&conn, "patient_str_values"), 3);
    }

    #[test]
    fn test_rejects_wrong_arity() {
        let (conn, _ctx) = memory_context();
        let mut batcher = ParameterBatcher::new(&conn, 10);
        let err = batcher
            .add(
                TableTarget::WholeSystem(WholeSystemTable::Tags),
                vec![Value::Integer(1)],
            )
            .unwrap_err();
        assert!(err.to_string().contains("logical_resource_tags"));
    }
}
