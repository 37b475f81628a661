//! Core types for the index store.
//!
//! - [`StoredVersion`] - one immutable version of a resource
//! - [`WriteRequest`], [`WriteOutcome`] - input and result of a write
//! - [`LogicalResourceIdent`] - the durable identity of a logical resource
//! - [`ExtractedParameterValue`], [`ParameterValue`] - search index entries

mod parameter;
mod stored_resource;

pub use parameter::{ExtractedParameterValue, ParameterKind, ParameterValue};
pub use stored_resource::{
    LogicalResourceIdent, StoredVersion, WriteDisposition, WriteOutcome, WriteRequest,
};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{StorageResult, data_access};

/// Formats a timestamp the way it is stored. The fixed width keeps text
/// comparison in the database consistent with time order.
pub(crate) fn to_db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp.
pub(crate) fn from_db_timestamp(value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| data_access(format!("invalid stored timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_db_timestamp_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        let (sa, sb) = (to_db_timestamp(a), to_db_timestamp(b));
        assert_eq!(sa, "2024-01-02T03:04:05.000000Z");
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
        assert_eq!(from_db_timestamp(&sa).unwrap(), a);
    }
}
