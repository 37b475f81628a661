//! Search-specific error types.
//!
//! Extraction errors never fail a write. The extractor logs them and skips
//! the offending value.

use thiserror::Error;

/// Errors that occur while extracting values from a resource.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The resource is not shaped like a resource.
    #[error("invalid resource: {message}")]
    InvalidResource { message: String },

    /// A value could not be converted to the parameter's kind.
    #[error("cannot convert value for '{param_name}' to {expected_type}: {actual_value}")]
    ConversionFailed {
        param_name: String,
        expected_type: String,
        actual_value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_failed_display() {
        let err = ExtractionError::ConversionFailed {
            param_name: "length".to_string(),
            expected_type: "number".to_string(),
            actual_value: "abc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "cannot convert value for 'length' to number: abc"
        );
    }
}
