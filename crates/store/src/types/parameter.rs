//! Extracted search parameter values.
//!
//! An [`ExtractedParameterValue`] is one index entry for one record version:
//! a parameter name, a typed [`ParameterValue`], and two flags: whether the
//! entry also lands in the type-agnostic whole-system tables, and which
//! composite (if any) it is a component of.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of a search parameter, used by the extraction registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    /// Free text, case-insensitive matching.
    String,
    /// A plain number.
    Number,
    /// A date or date range.
    Date,
    /// A value with a unit.
    Quantity,
    /// A code with an optional system.
    Token,
    /// A reference to another resource.
    Reference,
    /// A URI, indexed as an exact string.
    Uri,
    /// A latitude/longitude pair.
    Location,
    /// A group of component parameters matched together.
    Composite,
    /// A `meta.tag` coding.
    Tag,
    /// A `meta.profile` canonical.
    Profile,
    /// A `meta.security` coding.
    Security,
}

impl std::fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParameterKind::String => "string",
            ParameterKind::Number => "number",
            ParameterKind::Date => "date",
            ParameterKind::Quantity => "quantity",
            ParameterKind::Token => "token",
            ParameterKind::Reference => "reference",
            ParameterKind::Uri => "uri",
            ParameterKind::Location => "location",
            ParameterKind::Composite => "composite",
            ParameterKind::Tag => "tag",
            ParameterKind::Profile => "profile",
            ParameterKind::Security => "security",
        };
        write!(f, "{}", s)
    }
}

/// A typed search parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ParameterValue {
    /// String value, stored as-is and lowercased.
    String { value: String },

    /// Number with optional implicit range.
    Number {
        value: f64,
        low: Option<f64>,
        high: Option<f64>,
    },

    /// Date range; a point in time has `start == end`.
    Date {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// Quantity with optional implicit range.
    Quantity {
        value: f64,
        low: Option<f64>,
        high: Option<f64>,
        code: Option<String>,
        system: Option<String>,
    },

    /// Token (code with optional system).
    Token { system: Option<String>, code: String },

    /// Geographic position.
    Location { latitude: f64, longitude: f64 },

    /// Reference to another logical resource.
    Reference {
        resource_type: String,
        logical_id: String,
        version: Option<i32>,
    },

    /// Components of one composite value.
    Composite {
        components: Vec<ExtractedParameterValue>,
    },

    /// Resource tag.
    Tag { system: Option<String>, code: String },

    /// Profile the resource claims conformance to.
    Profile {
        url: String,
        version: Option<String>,
        fragment: Option<String>,
    },

    /// Security label.
    Security { system: Option<String>, code: String },
}

impl ParameterValue {
    /// The kind this value is persisted as.
    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterValue::String { .. } => ParameterKind::String,
            ParameterValue::Number { .. } => ParameterKind::Number,
            ParameterValue::Date { .. } => ParameterKind::Date,
            ParameterValue::Quantity { .. } => ParameterKind::Quantity,
            ParameterValue::Token { .. } => ParameterKind::Token,
            ParameterValue::Location { .. } => ParameterKind::Location,
            ParameterValue::Reference { .. } => ParameterKind::Reference,
            ParameterValue::Composite { .. } => ParameterKind::Composite,
            ParameterValue::Tag { .. } => ParameterKind::Tag,
            ParameterValue::Profile { .. } => ParameterKind::Profile,
            ParameterValue::Security { .. } => ParameterKind::Security,
        }
    }
}

/// One extracted index entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedParameterValue {
    /// Search parameter code, e.g. `identifier`.
    pub name: String,

    /// Also index in the type-agnostic whole-system tables.
    #[serde(default)]
    pub whole_system: bool,

    /// Composite this entry is a component of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,

    /// The value.
    pub value: ParameterValue,
}

impl ExtractedParameterValue {
    /// Creates a per-type entry.
    pub fn new(name: impl Into<String>, value: ParameterValue) -> Self {
        Self {
            name: name.into(),
            whole_system: false,
            composite_id: None,
            value,
        }
    }

    /// Marks the entry as searchable across all resource types.
    pub fn whole_system(mut self) -> Self {
        self.whole_system = true;
        self
    }

    /// Sets the composite the entry belongs to.
    pub fn with_composite_id(mut self, composite_id: i32) -> Self {
        self.composite_id = Some(composite_id);
        self
    }

    /// Shorthand for a string entry.
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(
            name,
            ParameterValue::String {
                value: value.into(),
            },
        )
    }

    /// Shorthand for a token entry.
    pub fn token(name: impl Into<String>, system: Option<&str>, code: impl Into<String>) -> Self {
        Self::new(
            name,
            ParameterValue::Token {
                system: system.map(String::from),
                code: code.into(),
            },
        )
    }

    /// Shorthand for a point-in-time date entry.
    pub fn instant(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(name, ParameterValue::Date { start: at, end: at })
    }

    /// Shorthand for a reference entry.
    pub fn reference(
        name: impl Into<String>,
        resource_type: impl Into<String>,
        logical_id: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            ParameterValue::Reference {
                resource_type: resource_type.into(),
                logical_id: logical_id.into(),
                version: None,
            },
        )
    }

    /// Expands composites into their components, numbering each composite
    /// from 1 upwards. Components keep their own names. Nested composites
    /// are not supported and are dropped.
    pub fn flatten(values: Vec<ExtractedParameterValue>) -> Vec<ExtractedParameterValue> {
        let mut out = Vec::with_capacity(values.len());
        let mut next_composite = 0;
        for value in values {
            match value.value {
                ParameterValue::Composite { components } => {
                    next_composite += 1;
                    for component in components {
                        if matches!(component.value, ParameterValue::Composite { .. }) {
                            tracing::warn!(
                                "Dropping nested composite component '{}' of '{}'",
                                component.name,
                                value.name
                            );
                            continue;
                        }
                        out.push(component.with_composite_id(next_composite));
                    }
                }
                _ => out.push(value),
            }
        }
        out
    }
}
