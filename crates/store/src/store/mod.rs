//! Engine-independent write and read paths.
//!
//! The functions in this module run over an open `rusqlite` connection or
//! transaction and never manage transactions themselves. Backends own the
//! transaction boundary: they open it, call into here, commit, and only then
//! publish the ids staged in a [`CacheStage`](crate::cache::CacheStage).

pub mod identity;
pub mod reader;
pub mod sequence;
pub mod writer;

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::cache::IdentityCache;
use crate::config::StoreConfig;
use crate::dialect::DatabaseTranslator;
use crate::error::{StorageResult, ValidationError};
use crate::search::ParameterExtractor;

static RESOURCE_TYPE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][A-Za-z0-9]{0,63}$").expect("resource type pattern is valid")
});

static LOGICAL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9\-\.]{1,64}$").expect("logical id pattern is valid")
});

/// Everything a unit of work needs besides its connection.
#[derive(Debug, Clone)]
pub struct StoreContext {
    /// Store configuration.
    pub config: Arc<StoreConfig>,
    /// SQL dialect of the connected engine.
    pub translator: Arc<dyn DatabaseTranslator>,
    /// Shared dictionary caches.
    pub caches: Arc<IdentityCache>,
    /// Search parameter extraction.
    pub extractor: Arc<dyn ParameterExtractor>,
}

impl StoreContext {
    /// Returns the id of a configured resource type.
    pub fn resource_type_id(&self, resource_type: &str) -> StorageResult<i32> {
        if !self.config.supports_resource_type(resource_type) {
            return Err(unsupported(resource_type));
        }
        self.caches
            .resource_type_id(resource_type)
            .ok_or_else(|| unsupported(resource_type))
    }
}

fn unsupported(resource_type: &str) -> crate::error::StorageError {
    ValidationError::UnsupportedResourceType {
        resource_type: resource_type.to_string(),
    }
    .into()
}

/// Checks that a resource type name is safe to use in a table name.
pub fn validate_resource_type_name(resource_type: &str) -> StorageResult<()> {
    if RESOURCE_TYPE_NAME.is_match(resource_type) {
        Ok(())
    } else {
        Err(unsupported(resource_type))
    }
}

/// Checks a logical id against the allowed id syntax.
pub fn validate_logical_id(resource_type: &str, logical_id: &str) -> StorageResult<()> {
    if LOGICAL_ID.is_match(logical_id) {
        Ok(())
    } else {
        Err(ValidationError::InvalidLogicalId {
            resource_type: resource_type.to_string(),
            id: logical_id.to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_names() {
        assert!(validate_resource_type_name("Patient").is_ok());
        assert!(validate_resource_type_name("MedicationRequest").is_ok());
        assert!(validate_resource_type_name("patient").is_err());
        assert!(validate_resource_type_name("Patient_x").is_err());
        assert!(validate_resource_type_name("").is_err());
    }

    #[test]
    fn test_logical_ids() {
        assert!(validate_logical_id("Patient", "p-1.a").is_ok());
        assert!(validate_logical_id("Patient", &"a".repeat(64)).is_ok());
        assert!(validate_logical_id("Patient", &"a".repeat(65)).is_err());
        assert!(validate_logical_id("Patient", "").is_err());
        assert!(validate_logical_id("Patient", "a/b").is_err());
        assert!(validate_logical_id("Patient", "a_b").is_err());
    }
}
