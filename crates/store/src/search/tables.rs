//! Names of the search parameter tables.
//!
//! Every configured resource type has its own set of per-kind tables
//! (`patient_str_values`, `patient_resource_token_refs`, ...). A few kinds
//! also have a type-agnostic whole-system table for entries that are
//! searched across all resource types.

/// A per-resource-type parameter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterTable {
    StrValues,
    NumberValues,
    DateValues,
    QuantityValues,
    LatlngValues,
    ResourceTokenRefs,
    RefValues,
    Profiles,
    Tags,
    Security,
}

impl ParameterTable {
    /// All per-type tables.
    pub const ALL: [ParameterTable; 10] = [
        ParameterTable::StrValues,
        ParameterTable::NumberValues,
        ParameterTable::DateValues,
        ParameterTable::QuantityValues,
        ParameterTable::LatlngValues,
        ParameterTable::ResourceTokenRefs,
        ParameterTable::RefValues,
        ParameterTable::Profiles,
        ParameterTable::Tags,
        ParameterTable::Security,
    ];

    /// Suffix after the lowercased resource type.
    pub fn suffix(&self) -> &'static str {
        match self {
            ParameterTable::StrValues => "str_values",
            ParameterTable::NumberValues => "number_values",
            ParameterTable::DateValues => "date_values",
            ParameterTable::QuantityValues => "quantity_values",
            ParameterTable::LatlngValues => "latlng_values",
            ParameterTable::ResourceTokenRefs => "resource_token_refs",
            ParameterTable::RefValues => "ref_values",
            ParameterTable::Profiles => "profiles",
            ParameterTable::Tags => "tags",
            ParameterTable::Security => "security",
        }
    }

    /// Full table name for a resource type.
    ///
    /// The resource type must already have been validated as a plain
    /// identifier; it is interpolated into SQL.
    pub fn for_type(&self, resource_type: &str) -> String {
        format!("{}_{}", resource_type.to_ascii_lowercase(), self.suffix())
    }

    /// Insert column list, in bind order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            ParameterTable::StrValues => &[
                "parameter_name_id",
                "str_value",
                "str_value_lcase",
                "logical_resource_id",
                "composite_id",
            ],
            ParameterTable::NumberValues => &[
                "parameter_name_id",
                "number_value",
                "number_value_low",
                "number_value_high",
                "logical_resource_id",
                "composite_id",
            ],
            ParameterTable::DateValues => &[
                "parameter_name_id",
                "date_start",
                "date_end",
                "logical_resource_id",
                "composite_id",
            ],
            ParameterTable::QuantityValues => &[
                "parameter_name_id",
                "code",
                "quantity_value",
                "quantity_value_low",
                "quantity_value_high",
                "code_system_id",
                "logical_resource_id",
                "composite_id",
            ],
            ParameterTable::LatlngValues => &[
                "parameter_name_id",
                "latitude_value",
                "longitude_value",
                "logical_resource_id",
                "composite_id",
            ],
            ParameterTable::ResourceTokenRefs => &[
                "parameter_name_id",
                "common_token_value_id",
                "logical_resource_id",
                "composite_id",
            ],
            ParameterTable::RefValues => &[
                "parameter_name_id",
                "ref_logical_resource_id",
                "ref_version_id",
                "logical_resource_id",
                "composite_id",
            ],
            ParameterTable::Profiles => &["canonical_id", "version", "fragment", "logical_resource_id"],
            ParameterTable::Tags | ParameterTable::Security => {
                &["common_token_value_id", "logical_resource_id"]
            }
        }
    }
}

/// A type-agnostic whole-system table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WholeSystemTable {
    StrValues,
    DateValues,
    ResourceTokenRefs,
    Tags,
    Profiles,
    Security,
}

impl WholeSystemTable {
    /// All whole-system tables.
    pub const ALL: [WholeSystemTable; 6] = [
        WholeSystemTable::StrValues,
        WholeSystemTable::DateValues,
        WholeSystemTable::ResourceTokenRefs,
        WholeSystemTable::Tags,
        WholeSystemTable::Profiles,
        WholeSystemTable::Security,
    ];

    /// Table name.
    pub fn name(&self) -> &'static str {
        match self {
            WholeSystemTable::StrValues => "str_values",
            WholeSystemTable::DateValues => "date_values",
            WholeSystemTable::ResourceTokenRefs => "resource_token_refs",
            WholeSystemTable::Tags => "logical_resource_tags",
            WholeSystemTable::Profiles => "logical_resource_profiles",
            WholeSystemTable::Security => "logical_resource_security",
        }
    }

    /// Insert column list, in bind order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            WholeSystemTable::StrValues => &[
                "parameter_name_id",
                "str_value",
                "str_value_lcase",
                "logical_resource_id",
                "resource_type_id",
            ],
            WholeSystemTable::DateValues => &[
                "parameter_name_id",
                "date_start",
                "date_end",
                "logical_resource_id",
                "resource_type_id",
            ],
            WholeSystemTable::ResourceTokenRefs => &[
                "parameter_name_id",
                "common_token_value_id",
                "logical_resource_id",
                "resource_type_id",
            ],
            WholeSystemTable::Tags | WholeSystemTable::Security => &[
                "common_token_value_id",
                "logical_resource_id",
                "resource_type_id",
            ],
            WholeSystemTable::Profiles => &[
                "canonical_id",
                "version",
                "fragment",
                "logical_resource_id",
                "resource_type_id",
            ],
        }
    }
}

/// Destination of a parameter row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableTarget {
    /// Per-type table of the given resource type.
    PerType(ParameterTable, String),
    /// Whole-system table.
    WholeSystem(WholeSystemTable),
}

impl TableTarget {
    /// Table name.
    pub fn name(&self) -> String {
        match self {
            TableTarget::PerType(table, resource_type) => table.for_type(resource_type),
            TableTarget::WholeSystem(table) => table.name().to_string(),
        }
    }

    /// Insert column list, in bind order.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TableTarget::PerType(table, _) => table.columns(),
            TableTarget::WholeSystem(table) => table.columns(),
        }
    }

    /// Single-row insert statement.
    pub fn insert_sql(&self) -> String {
        let columns = self.columns();
        let markers: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.name(),
            columns.join(", "),
            markers.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_type_names() {
        assert_eq!(
            ParameterTable::ResourceTokenRefs.for_type("Patient"),
            "patient_resource_token_refs"
        );
        assert_eq!(ParameterTable::Tags.for_type("Observation"), "observation_tags");
    }

    #[test]
    fn test_insert_sql() {
        let target = TableTarget::PerType(ParameterTable::LatlngValues, "Location".to_string());
        assert_eq!(
            target.insert_sql(),
            "INSERT INTO location_latlng_values (parameter_name_id, latitude_value, longitude_value, logical_resource_id, composite_id) VALUES (?1, ?2, ?3, ?4, ?5)"
        );

        let target = TableTarget::WholeSystem(WholeSystemTable::Tags);
        assert_eq!(
            target.insert_sql(),
            "INSERT INTO logical_resource_tags (common_token_value_id, logical_resource_id, resource_type_id) VALUES (?1, ?2, ?3)"
        );
    }
}
