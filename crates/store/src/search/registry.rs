//! Search parameter registry.
//!
//! The registry holds the parameter definitions the extractor applies,
//! indexed by the resource type they are defined on. Definitions on the
//! `Resource` base apply to every type.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::ParameterKind;

/// The base that applies a definition to every resource type.
pub const RESOURCE_BASE: &str = "Resource";

/// Component of a composite search parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeComponentDef {
    /// Name the component is indexed under.
    pub code: String,
    /// Kind of the component value.
    pub kind: ParameterKind,
    /// Path of the component, relative to the resource root.
    pub path: String,
}

/// Definition of one search parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParameterDefinition {
    /// Parameter code, e.g. `name` or `identifier`.
    pub code: String,

    /// The kind values are indexed as.
    pub kind: ParameterKind,

    /// Dotted JSON path, e.g. `name` or `meta.tag`. Arrays fan out and a
    /// trailing segment also matches polymorphic `value[x]` fields.
    pub path: String,

    /// Resource types this parameter applies to.
    pub base: Vec<String>,

    /// Whether values also go to the whole-system tables.
    #[serde(default)]
    pub whole_system: bool,

    /// Components (for composite parameters).
    #[serde(default)]
    pub components: Vec<CompositeComponentDef>,
}

impl SearchParameterDefinition {
    /// Creates a definition.
    pub fn new(code: impl Into<String>, kind: ParameterKind, path: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            kind,
            path: path.into(),
            base: Vec::new(),
            whole_system: false,
            components: Vec::new(),
        }
    }

    /// Sets the base resource types.
    pub fn with_base<I, S>(mut self, base: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = base.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the parameter as searched across all resource types.
    pub fn whole_system(mut self) -> Self {
        self.whole_system = true;
        self
    }

    /// Adds a composite component.
    pub fn with_component(
        mut self,
        code: impl Into<String>,
        kind: ParameterKind,
        path: impl Into<String>,
    ) -> Self {
        self.components.push(CompositeComponentDef {
            code: code.into(),
            kind,
            path: path.into(),
        });
        self
    }

    /// Returns whether this is a composite parameter.
    pub fn is_composite(&self) -> bool {
        self.kind == ParameterKind::Composite && !self.components.is_empty()
    }

    /// Returns whether this parameter applies to the given resource type.
    pub fn applies_to(&self, resource_type: &str) -> bool {
        self.base
            .iter()
            .any(|b| b == resource_type || b == RESOURCE_BASE)
    }
}

/// In-memory registry of search parameter definitions.
#[derive(Debug, Default)]
pub struct SearchParameterRegistry {
    params_by_type: HashMap<String, Vec<Arc<SearchParameterDefinition>>>,
}

impl SearchParameterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in definitions.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for definition in builtin_definitions() {
            registry.register(definition);
        }
        registry
    }

    /// Returns the number of registered definitions.
    pub fn len(&self) -> usize {
        self.params_by_type.values().map(Vec::len).sum()
    }

    /// Returns true if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.params_by_type.is_empty()
    }

    /// Registers a definition under each of its base types. A definition
    /// with the same code on the same base replaces the old one.
    pub fn register(&mut self, definition: SearchParameterDefinition) {
        let definition = Arc::new(definition);
        for base in &definition.base {
            let params = self.params_by_type.entry(base.clone()).or_default();
            params.retain(|p| p.code != definition.code);
            params.push(definition.clone());
        }
    }

    /// Definitions that apply to `resource_type`, type-specific ones first.
    /// A type-specific definition hides a `Resource` one with the same code.
    pub fn params_for(&self, resource_type: &str) -> Vec<Arc<SearchParameterDefinition>> {
        let mut params: Vec<_> = self
            .params_by_type
            .get(resource_type)
            .cloned()
            .unwrap_or_default();
        if resource_type != RESOURCE_BASE {
            if let Some(common) = self.params_by_type.get(RESOURCE_BASE) {
                for param in common {
                    if !params.iter().any(|p| p.code == param.code) {
                        params.push(param.clone());
                    }
                }
            }
        }
        params
    }

    /// Gets a specific definition by resource type and code.
    pub fn get_param(&self, resource_type: &str, code: &str) -> Option<Arc<SearchParameterDefinition>> {
        self.params_for(resource_type)
            .into_iter()
            .find(|p| p.code == code)
    }
}

fn def(code: &str, kind: ParameterKind, path: &str, base: &str) -> SearchParameterDefinition {
    SearchParameterDefinition::new(code, kind, path).with_base([base])
}

/// The definitions every store starts with.
pub fn builtin_definitions() -> Vec<SearchParameterDefinition> {
    use ParameterKind::*;

    vec![
        // Resource
        def("_tag", Tag, "meta.tag", RESOURCE_BASE).whole_system(),
        def("_profile", Profile, "meta.profile", RESOURCE_BASE).whole_system(),
        def("_security", Security, "meta.security", RESOURCE_BASE).whole_system(),
        def("_lastUpdated", Date, "meta.lastUpdated", RESOURCE_BASE).whole_system(),
        def("_source", Uri, "meta.source", RESOURCE_BASE).whole_system(),
        // Patient
        def("name", String, "name", "Patient"),
        def("family", String, "name.family", "Patient"),
        def("given", String, "name.given", "Patient"),
        def("identifier", Token, "identifier", "Patient"),
        def("gender", Token, "gender", "Patient"),
        def("birthdate", Date, "birthDate", "Patient"),
        def("active", Token, "active", "Patient"),
        def("address", String, "address", "Patient"),
        def("telecom", Token, "telecom", "Patient"),
        def("general-practitioner", Reference, "generalPractitioner", "Patient"),
        def("organization", Reference, "managingOrganization", "Patient"),
        // Observation
        def("code", Token, "code", "Observation"),
        def("status", Token, "status", "Observation"),
        def("category", Token, "category", "Observation"),
        def("subject", Reference, "subject", "Observation"),
        def("encounter", Reference, "encounter", "Observation"),
        def("performer", Reference, "performer", "Observation"),
        def("date", Date, "effective", "Observation"),
        def("value-quantity", Quantity, "valueQuantity", "Observation"),
        def("value-concept", Token, "valueCodeableConcept", "Observation"),
        def("value-string", String, "valueString", "Observation"),
        def("code-value-quantity", Composite, "", "Observation")
            .with_component("code", Token, "code")
            .with_component("value-quantity", Quantity, "valueQuantity"),
        // Encounter
        def("status", Token, "status", "Encounter"),
        def("class", Token, "class", "Encounter"),
        def("type", Token, "type", "Encounter"),
        def("subject", Reference, "subject", "Encounter"),
        def("date", Date, "period", "Encounter"),
        def("location", Reference, "location.location", "Encounter"),
        def("service-provider", Reference, "serviceProvider", "Encounter"),
        // Organization
        def("name", String, "name", "Organization"),
        def("identifier", Token, "identifier", "Organization"),
        def("type", Token, "type", "Organization"),
        def("active", Token, "active", "Organization"),
        def("partof", Reference, "partOf", "Organization"),
        // Practitioner
        def("name", String, "name", "Practitioner"),
        def("family", String, "name.family", "Practitioner"),
        def("identifier", Token, "identifier", "Practitioner"),
        def("gender", Token, "gender", "Practitioner"),
        def("active", Token, "active", "Practitioner"),
        // Location
        def("name", String, "name", "Location"),
        def("identifier", Token, "identifier", "Location"),
        def("status", Token, "status", "Location"),
        def("near", Location, "position", "Location"),
        def("organization", Reference, "managingOrganization", "Location"),
        // Condition
        def("code", Token, "code", "Condition"),
        def("clinical-status", Token, "clinicalStatus", "Condition"),
        def("category", Token, "category", "Condition"),
        def("subject", Reference, "subject", "Condition"),
        def("onset-date", Date, "onset", "Condition"),
        def("recorded-date", Date, "recordedDate", "Condition"),
    ]
}
