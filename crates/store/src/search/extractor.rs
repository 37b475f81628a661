//! Search parameter value extraction.
//!
//! [`PathExtractor`] walks the dotted path of every applicable definition
//! and converts what it finds with [`ValueConverter`]. Values that can't be
//! converted are logged and skipped; extraction never fails a write.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::types::{ExtractedParameterValue, ParameterValue};

use super::converters::ValueConverter;
use super::errors::ExtractionError;
use super::registry::{SearchParameterDefinition, SearchParameterRegistry};

/// Derives the index entries of a resource.
pub trait ParameterExtractor: Send + Sync + std::fmt::Debug {
    /// Extracts all entries for `resource`, which is of `resource_type`.
    fn extract(&self, resource_type: &str, resource: &Value) -> Vec<ExtractedParameterValue>;
}

/// Extracts values by following simple JSON paths.
pub struct PathExtractor {
    registry: Arc<RwLock<SearchParameterRegistry>>,
}

impl PathExtractor {
    /// Creates an extractor over the given registry.
    pub fn new(registry: Arc<RwLock<SearchParameterRegistry>>) -> Self {
        Self { registry }
    }

    /// Creates an extractor over the built-in definitions.
    pub fn builtin() -> Self {
        Self::new(Arc::new(RwLock::new(SearchParameterRegistry::builtin())))
    }

    /// Returns the registry, e.g. to register additional definitions.
    pub fn registry(&self) -> &Arc<RwLock<SearchParameterRegistry>> {
        &self.registry
    }

    fn try_extract(
        &self,
        resource_type: &str,
        resource: &Value,
    ) -> Result<Vec<ExtractedParameterValue>, ExtractionError> {
        let obj = resource
            .as_object()
            .ok_or_else(|| ExtractionError::InvalidResource {
                message: "resource must be a JSON object".to_string(),
            })?;

        if let Some(rt) = obj.get("resourceType").and_then(|v| v.as_str()) {
            if rt != resource_type {
                return Err(ExtractionError::InvalidResource {
                    message: format!(
                        "resource type mismatch: expected {}, got {}",
                        resource_type, rt
                    ),
                });
            }
        }

        let params = self.registry.read().params_for(resource_type);

        let mut results = Vec::new();
        for param in &params {
            let extracted = if param.is_composite() {
                self.extract_composite(resource, param)
            } else {
                self.extract_for_param(resource, param)
            };
            match extracted {
                Ok(values) => results.extend(values),
                Err(e) => {
                    tracing::warn!(
                        resource_type,
                        parameter = %param.code,
                        error = %e,
                        "Skipping value that could not be extracted"
                    );
                }
            }
        }
        Ok(results)
    }

    /// Extracts values for a single definition.
    pub fn extract_for_param(
        &self,
        resource: &Value,
        param: &SearchParameterDefinition,
    ) -> Result<Vec<ExtractedParameterValue>, ExtractionError> {
        if param.path.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for value in navigate_path(resource, &parse_path(&param.path)) {
            for converted in ValueConverter::convert(value, param.kind, &param.code)? {
                let mut entry = ExtractedParameterValue::new(&param.code, converted);
                entry.whole_system = param.whole_system;
                results.push(entry);
            }
        }
        Ok(results)
    }

    /// Builds one composite per combination of component values.
    fn extract_composite(
        &self,
        resource: &Value,
        param: &SearchParameterDefinition,
    ) -> Result<Vec<ExtractedParameterValue>, ExtractionError> {
        let mut combinations: Vec<Vec<ExtractedParameterValue>> = vec![Vec::new()];

        for component in &param.components {
            let mut values = Vec::new();
            for found in navigate_path(resource, &parse_path(&component.path)) {
                for converted in ValueConverter::convert(found, component.kind, &component.code)? {
                    values.push(ExtractedParameterValue::new(
                        format!("{}-{}", param.code, component.code),
                        converted,
                    ));
                }
            }
            if values.is_empty() {
                return Ok(Vec::new());
            }

            combinations = combinations
                .into_iter()
                .flat_map(|partial| {
                    values.iter().map(move |v| {
                        let mut next = partial.clone();
                        next.push(v.clone());
                        next
                    })
                })
                .collect();
        }

        Ok(combinations
            .into_iter()
            .map(|components| {
                ExtractedParameterValue::new(&param.code, ParameterValue::Composite { components })
            })
            .collect())
    }
}

impl ParameterExtractor for PathExtractor {
    fn extract(&self, resource_type: &str, resource: &Value) -> Vec<ExtractedParameterValue> {
        match self.try_extract(resource_type, resource) {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(resource_type, error = %e, "Resource yielded no search parameters");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for PathExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathExtractor")
            .field("definitions", &self.registry.read().len())
            .finish()
    }
}

/// A segment of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    /// A field name to navigate to.
    Field(String),
}

fn parse_path(path: &str) -> Vec<PathSegment> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(|s| PathSegment::Field(s.to_string()))
        .collect()
}

/// Collects the values at `segments`, fanning out over arrays.
fn navigate_path<'a>(value: &'a Value, segments: &[PathSegment]) -> Vec<&'a Value> {
    let Some((segment, remaining)) = segments.split_first() else {
        return match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
    };

    match value {
        Value::Object(obj) => {
            let PathSegment::Field(name) = segment;
            if let Some(child) = obj.get(name) {
                return navigate_path(child, remaining);
            }
            // Polymorphic field, e.g. "effective" -> "effectiveDateTime"
            let candidates: Vec<_> = obj
                .iter()
                .filter(|(k, _)| {
                    k.strip_prefix(name.as_str())
                        .and_then(|rest| rest.chars().next())
                        .map(|c| c.is_ascii_uppercase())
                        .unwrap_or(false)
                })
                .collect();
            if candidates.len() == 1 {
                navigate_path(candidates[0].1, remaining)
            } else {
                Vec::new()
            }
        }
        Value::Array(items) => items
            .iter()
            .flat_map(|item| navigate_path(item, segments))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParameterKind;
    use serde_json::json;

    fn names<'a>(values: &'a [ExtractedParameterValue], code: &str) -> Vec<&'a ParameterValue> {
        values
            .iter()
            .filter(|v| v.name == code)
            .map(|v| &v.value)
            .collect()
    }

    #[test]
    fn test_extract_patient() {
        let extractor = PathExtractor::builtin();
        let patient = json!({
            "resourceType": "Patient",
            "id": "123",
            "meta": {"tag": [{"system": "http://example.org/tags", "code": "vip"}]},
            "name": [{"family": "Smith", "given": ["John", "James"]}],
            "identifier": [{"system": "http://hospital.org/mrn", "value": "12345"}],
            "gender": "male",
            "birthDate": "1970-01-01"
        });

        let values = extractor.extract("Patient", &patient);

        assert_eq!(names(&values, "name").len(), 3);
        assert_eq!(names(&values, "given").len(), 2);
        assert_eq!(
            names(&values, "identifier"),
            vec![&ParameterValue::Token {
                system: Some("http://hospital.org/mrn".to_string()),
                code: "12345".to_string()
            }]
        );
        assert_eq!(names(&values, "birthdate").len(), 1);

        let tag = values.iter().find(|v| v.name == "_tag").unwrap();
        assert!(tag.whole_system);
        assert_eq!(tag.value.kind(), ParameterKind::Tag);
    }

    #[test]
    fn test_extract_observation_polymorphic_and_composite() {
        let extractor = PathExtractor::builtin();
        let observation = json!({
            "resourceType": "Observation",
            "id": "obs1",
            "status": "final",
            "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4"}]},
            "subject": {"reference": "Patient/123"},
            "effectiveDateTime": "2024-01-15T10:00:00Z",
            "valueQuantity": {"value": 72, "unit": "beats/min", "system": "http://unitsofmeasure.org", "code": "/min"}
        });

        let values = extractor.extract("Observation", &observation);

        assert_eq!(names(&values, "date").len(), 1);
        assert_eq!(
            names(&values, "subject"),
            vec![&ParameterValue::Reference {
                resource_type: "Patient".to_string(),
                logical_id: "123".to_string(),
                version: None
            }]
        );

        let composite = names(&values, "code-value-quantity");
        assert_eq!(composite.len(), 1);
        let ParameterValue::Composite { components } = composite[0] else {
            panic!("expected a composite");
        };
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].name, "code-value-quantity-code");
    }

    #[test]
    fn test_bad_values_are_skipped() {
        let extractor = PathExtractor::builtin();
        let patient = json!({
            "resourceType": "Patient",
            "birthDate": "not-a-date",
            "gender": "female"
        });
        let values = extractor.extract("Patient", &patient);
        assert!(names(&values, "birthdate").is_empty());
        assert_eq!(names(&values, "gender").len(), 1);
    }

    #[test]
    fn test_invalid_resource_yields_nothing() {
        let extractor = PathExtractor::builtin();
        assert!(extractor.extract("Patient", &json!("string")).is_empty());
        assert!(
            extractor
                .extract("Observation", &json!({"resourceType": "Patient", "gender": "male"}))
                .is_empty()
        );
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("name.family"),
            vec![
                PathSegment::Field("name".to_string()),
                PathSegment::Field("family".to_string())
            ]
        );
    }
}
