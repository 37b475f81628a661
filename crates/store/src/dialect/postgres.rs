//! PostgreSQL dialect.

use super::{DatabaseTranslator, ErrorCategory};
use crate::core::BackendKind;

/// Translator for PostgreSQL (and PostgreSQL-compatible sharded engines).
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresTranslator;

impl DatabaseTranslator for PostgresTranslator {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn for_update(&self) -> &'static str {
        " FOR UPDATE"
    }

    fn for_update_skip_locked(&self) -> &'static str {
        " FOR UPDATE SKIP LOCKED"
    }

    fn next_value_sql(&self, sequence: &str) -> String {
        format!("SELECT nextval('{}')", sequence)
    }

    fn supports_identity_columns(&self) -> bool {
        false
    }

    /// `code` is the five character SQLSTATE.
    fn classify_code(&self, code: &str, _message: &str) -> ErrorCategory {
        match code {
            "23505" => ErrorCategory::DuplicateValue,
            "55P03" | "57014" => ErrorCategory::LockTimeout,
            "40P01" | "40001" => ErrorCategory::Deadlock,
            "42P01" | "42703" | "42883" => ErrorCategory::UndefinedObject,
            "57P01" | "57P02" | "57P03" => ErrorCategory::ConnectionLost,
            c if c.starts_with("08") => ErrorCategory::ConnectionLost,
            _ => ErrorCategory::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_classification() {
        let t = PostgresTranslator;
        assert_eq!(t.classify_code("23505", ""), ErrorCategory::DuplicateValue);
        assert_eq!(t.classify_code("55P03", ""), ErrorCategory::LockTimeout);
        assert_eq!(t.classify_code("40P01", ""), ErrorCategory::Deadlock);
        assert_eq!(t.classify_code("42P01", ""), ErrorCategory::UndefinedObject);
        assert_eq!(t.classify_code("08006", ""), ErrorCategory::ConnectionLost);
        assert_eq!(t.classify_code("22001", ""), ErrorCategory::Other);
    }

    #[test]
    fn test_locking_fragments() {
        let t = PostgresTranslator;
        assert_eq!(t.for_update(), " FOR UPDATE");
        assert_eq!(t.for_update_skip_locked(), " FOR UPDATE SKIP LOCKED");
        assert_eq!(
            t.next_value_sql("fhir_ref_sequence"),
            "SELECT nextval('fhir_ref_sequence')"
        );
        assert!(!t.supports_identity_columns());
    }
}
