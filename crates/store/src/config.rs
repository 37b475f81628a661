//! Store configuration.
//!
//! [`StoreConfig`] is plain serde data with per-field defaults, so a partial
//! JSON document (or `{}`) is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::backends::sqlite::SqliteBackendConfig;
use crate::core::BackendKind;
use crate::error::{StorageResult, ValidationError};
use crate::tenant::TenantId;

/// Layout of the dictionary tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    /// Engine-assigned dictionary ids, token values shared by all shards.
    #[default]
    Plain,
    /// Dictionary ids drawn from `fhir_ref_sequence`, token values keyed
    /// by shard.
    Distributed,
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaType::Plain => write!(f, "plain"),
            SchemaType::Distributed => write!(f, "distributed"),
        }
    }
}

impl std::str::FromStr for SchemaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(SchemaType::Plain),
            "distributed" | "sharded" => Ok(SchemaType::Distributed),
            other => Err(format!("unknown schema type: {}", other)),
        }
    }
}

/// Configuration for a store instance. One instance serves one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Tenant served by this instance.
    #[serde(default = "default_tenant")]
    pub tenant_id: TenantId,

    /// Dictionary layout.
    #[serde(default)]
    pub schema_type: SchemaType,

    /// SQL dialect.
    #[serde(default)]
    pub dialect: BackendKind,

    /// Resource types with parameter tables.
    #[serde(default = "default_resource_types")]
    pub resource_types: Vec<String>,

    /// Pending parameter rows that trigger a flush.
    #[serde(default = "default_parameter_batch_size")]
    pub parameter_batch_size: usize,

    /// Attempts for a write that hits a transient conflict.
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,

    /// Lowest index message version accepted.
    #[serde(default = "default_min_message_version")]
    pub min_message_version: u32,

    /// Cache size at which growth is logged as a capacity warning.
    #[serde(default = "default_cache_warn_entries")]
    pub cache_warn_entries: usize,

    /// SQLite engine settings.
    #[serde(default)]
    pub sqlite: SqliteBackendConfig,
}

fn default_tenant() -> TenantId {
    TenantId::new(TenantId::DEFAULT)
}

fn default_resource_types() -> Vec<String> {
    [
        "Patient",
        "Observation",
        "Encounter",
        "Organization",
        "Practitioner",
        "Location",
        "Condition",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_parameter_batch_size() -> usize {
    500
}

fn default_max_write_attempts() -> u32 {
    3
}

fn default_min_message_version() -> u32 {
    crate::remote::MESSAGE_VERSION
}

fn default_cache_warn_entries() -> usize {
    1_000_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            tenant_id: default_tenant(),
            schema_type: SchemaType::default(),
            dialect: BackendKind::default(),
            resource_types: default_resource_types(),
            parameter_batch_size: default_parameter_batch_size(),
            max_write_attempts: default_max_write_attempts(),
            min_message_version: default_min_message_version(),
            cache_warn_entries: default_cache_warn_entries(),
            sqlite: SqliteBackendConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Parses a configuration from JSON.
    pub fn from_json_str(json: &str) -> StorageResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the tenant.
    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Sets the schema type.
    pub fn with_schema_type(mut self, schema_type: SchemaType) -> Self {
        self.schema_type = schema_type;
        self
    }

    /// Sets the parameter flush threshold.
    pub fn with_parameter_batch_size(mut self, size: usize) -> Self {
        self.parameter_batch_size = size;
        self
    }

    /// Returns true if `resource_type` is configured.
    pub fn supports_resource_type(&self, resource_type: &str) -> bool {
        self.resource_types.iter().any(|t| t == resource_type)
    }

    /// Checks the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.resource_types.is_empty() {
            errors.push("resource_types must not be empty".to_string());
        }
        for resource_type in &self.resource_types {
            if crate::store::validate_resource_type_name(resource_type).is_err() {
                errors.push(format!("invalid resource type name: {}", resource_type));
            }
        }
        if self.parameter_batch_size == 0 {
            errors.push("parameter_batch_size must be greater than 0".to_string());
        }
        if self.max_write_attempts == 0 {
            errors.push("max_write_attempts must be greater than 0".to_string());
        }
        if self.dialect != BackendKind::Sqlite {
            errors.push(format!(
                "dialect '{}' has no executing backend in this build",
                self.dialect
            ));
        }
        if self.sqlite.max_connections == 0 {
            errors.push("sqlite.max_connections must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Like [`validate`](Self::validate), folded into a storage error.
    pub(crate) fn ensure_valid(&self) -> StorageResult<()> {
        self.validate().map_err(|errors| {
            ValidationError::InvalidResource {
                message: format!("invalid store configuration: {}", errors.join("; ")),
            }
            .into()
        })
    }
}
