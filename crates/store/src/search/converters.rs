//! Value converters for the search index.
//!
//! Converts the JSON values found at a parameter's path into typed
//! [`ParameterValue`]s. Each FHIR data type is mapped onto the columns of
//! the parameter kind it is indexed as.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::types::{ParameterKind, ParameterValue};

use super::errors::ExtractionError;

/// Converter for transforming JSON values to index values.
pub struct ValueConverter;

impl ValueConverter {
    /// Converts a JSON value to index values of the given kind.
    ///
    /// May return multiple values for arrays or complex types.
    pub fn convert(
        value: &Value,
        kind: ParameterKind,
        param_name: &str,
    ) -> Result<Vec<ParameterValue>, ExtractionError> {
        match value {
            Value::Array(arr) => {
                let mut results = Vec::new();
                for item in arr {
                    results.extend(Self::convert_single(item, kind, param_name)?);
                }
                Ok(results)
            }
            _ => Self::convert_single(value, kind, param_name),
        }
    }

    fn convert_single(
        value: &Value,
        kind: ParameterKind,
        param_name: &str,
    ) -> Result<Vec<ParameterValue>, ExtractionError> {
        match kind {
            ParameterKind::String => Ok(Self::convert_to_string(value)),
            ParameterKind::Uri => Ok(Self::convert_to_uri(value)),
            ParameterKind::Token => Ok(Self::convert_to_token(value)),
            ParameterKind::Date => Self::convert_to_date(value, param_name),
            ParameterKind::Number => Self::convert_to_number(value, param_name),
            ParameterKind::Quantity => Ok(Self::convert_to_quantity(value)),
            ParameterKind::Reference => Ok(Self::convert_to_reference(value)),
            ParameterKind::Location => Ok(Self::convert_to_location(value)),
            ParameterKind::Tag => Ok(Self::convert_to_coding(value)
                .into_iter()
                .map(|(system, code)| ParameterValue::Tag { system, code })
                .collect()),
            ParameterKind::Security => Ok(Self::convert_to_coding(value)
                .into_iter()
                .map(|(system, code)| ParameterValue::Security { system, code })
                .collect()),
            ParameterKind::Profile => Ok(Self::convert_to_profile(value)),
            // Composites are assembled by the extractor from their components.
            ParameterKind::Composite => Ok(Vec::new()),
        }
    }

    fn convert_to_string(value: &Value) -> Vec<ParameterValue> {
        let mut results = Vec::new();
        let mut push = |s: &str| {
            if !s.is_empty() {
                results.push(ParameterValue::String {
                    value: s.to_string(),
                });
            }
        };

        match value {
            Value::String(s) => push(s),
            Value::Object(obj) => {
                // HumanName and Address
                for field in ["family", "text", "city", "district", "state", "postalCode", "country"] {
                    if let Some(s) = obj.get(field).and_then(|v| v.as_str()) {
                        push(s);
                    }
                }
                for field in ["given", "prefix", "suffix", "line"] {
                    if let Some(items) = obj.get(field).and_then(|v| v.as_array()) {
                        for s in items.iter().filter_map(|v| v.as_str()) {
                            push(s);
                        }
                    }
                }
            }
            _ => {}
        }

        results
    }

    fn convert_to_uri(value: &Value) -> Vec<ParameterValue> {
        match value {
            Value::String(s) if !s.is_empty() => vec![ParameterValue::String { value: s.clone() }],
            _ => Vec::new(),
        }
    }

    fn convert_to_token(value: &Value) -> Vec<ParameterValue> {
        let mut results = Vec::new();

        match value {
            Value::String(s) if !s.is_empty() => {
                results.push(ParameterValue::Token {
                    system: None,
                    code: s.clone(),
                });
            }
            Value::Bool(b) => {
                results.push(ParameterValue::Token {
                    system: None,
                    code: b.to_string(),
                });
            }
            Value::Object(obj) => {
                // Coding and CodeableConcept
                for (system, code) in Self::convert_to_coding(value) {
                    results.push(ParameterValue::Token { system, code });
                }

                // Identifier and ContactPoint
                if !obj.contains_key("code") && !obj.contains_key("coding") {
                    if let Some(v) = obj.get("value").and_then(|v| v.as_str()) {
                        if !v.is_empty() {
                            let system = obj.get("system").and_then(|v| v.as_str()).map(String::from);
                            results.push(ParameterValue::Token {
                                system,
                                code: v.to_string(),
                            });
                        }
                    }
                }
            }
            _ => {}
        }

        results
    }

    /// Reads `(system, code)` pairs from a Coding or CodeableConcept.
    fn convert_to_coding(value: &Value) -> Vec<(Option<String>, String)> {
        let Value::Object(obj) = value else {
            return Vec::new();
        };

        let mut pairs = Vec::new();
        if let Some(code) = obj.get("code").and_then(|v| v.as_str()) {
            if !code.is_empty() && !obj.contains_key("coding") {
                let system = obj.get("system").and_then(|v| v.as_str()).map(String::from);
                pairs.push((system, code.to_string()));
            }
        }
        if let Some(coding) = obj.get("coding").and_then(|v| v.as_array()) {
            for c in coding {
                if let Some(code) = c.get("code").and_then(|v| v.as_str()) {
                    let system = c.get("system").and_then(|v| v.as_str()).map(String::from);
                    pairs.push((system, code.to_string()));
                }
            }
        }
        pairs
    }

    fn convert_to_date(
        value: &Value,
        param_name: &str,
    ) -> Result<Vec<ParameterValue>, ExtractionError> {
        let range = |s: &str| {
            date_range(s).ok_or_else(|| ExtractionError::ConversionFailed {
                param_name: param_name.to_string(),
                expected_type: "date".to_string(),
                actual_value: s.to_string(),
            })
        };

        match value {
            Value::String(s) => {
                let (start, end) = range(s)?;
                Ok(vec![ParameterValue::Date { start, end }])
            }
            Value::Object(obj) => {
                // Period: an open bound takes the other bound's extent.
                let start = obj.get("start").and_then(|v| v.as_str()).map(range).transpose()?;
                let end = obj.get("end").and_then(|v| v.as_str()).map(range).transpose()?;
                match (start, end) {
                    (Some((start, _)), Some((_, end))) => {
                        Ok(vec![ParameterValue::Date { start, end }])
                    }
                    (Some((start, end)), None) | (None, Some((start, end))) => {
                        Ok(vec![ParameterValue::Date { start, end }])
                    }
                    (None, None) => Ok(Vec::new()),
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    fn convert_to_number(
        value: &Value,
        param_name: &str,
    ) -> Result<Vec<ParameterValue>, ExtractionError> {
        let failed = |actual: String| ExtractionError::ConversionFailed {
            param_name: param_name.to_string(),
            expected_type: "number".to_string(),
            actual_value: actual,
        };

        let number = match value {
            Value::Number(n) => n.as_f64().ok_or_else(|| failed(n.to_string()))?,
            Value::String(s) => s.parse::<f64>().map_err(|_| failed(s.clone()))?,
            _ => return Ok(Vec::new()),
        };
        Ok(vec![ParameterValue::Number {
            value: number,
            low: None,
            high: None,
        }])
    }

    fn convert_to_quantity(value: &Value) -> Vec<ParameterValue> {
        let Value::Object(obj) = value else {
            return Vec::new();
        };
        let Some(number) = obj.get("value").and_then(|v| v.as_f64()) else {
            return Vec::new();
        };

        let code = obj
            .get("code")
            .or_else(|| obj.get("unit"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let system = obj.get("system").and_then(|v| v.as_str()).map(String::from);

        vec![ParameterValue::Quantity {
            value: number,
            low: None,
            high: None,
            code,
            system,
        }]
    }

    fn convert_to_reference(value: &Value) -> Vec<ParameterValue> {
        let reference = match value {
            Value::String(s) => s.as_str(),
            Value::Object(obj) => match obj.get("reference").and_then(|v| v.as_str()) {
                Some(r) => r,
                None => return Vec::new(),
            },
            _ => return Vec::new(),
        };

        match parse_reference(reference) {
            Some((resource_type, logical_id, version)) => vec![ParameterValue::Reference {
                resource_type,
                logical_id,
                version,
            }],
            None => {
                tracing::debug!(reference, "Skipping reference that is not a resource link");
                Vec::new()
            }
        }
    }

    fn convert_to_location(value: &Value) -> Vec<ParameterValue> {
        let Value::Object(obj) = value else {
            return Vec::new();
        };
        match (
            obj.get("latitude").and_then(|v| v.as_f64()),
            obj.get("longitude").and_then(|v| v.as_f64()),
        ) {
            (Some(latitude), Some(longitude)) => vec![ParameterValue::Location {
                latitude,
                longitude,
            }],
            _ => Vec::new(),
        }
    }

    fn convert_to_profile(value: &Value) -> Vec<ParameterValue> {
        let Value::String(canonical) = value else {
            return Vec::new();
        };
        let (rest, fragment) = match canonical.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment.to_string())),
            None => (canonical.as_str(), None),
        };
        let (url, version) = match rest.split_once('|') {
            Some((url, version)) => (url, Some(version.to_string())),
            None => (rest, None),
        };
        if url.is_empty() {
            return Vec::new();
        }
        vec![ParameterValue::Profile {
            url: url.to_string(),
            version,
            fragment,
        }]
    }
}

/// Parses `Type/id`, `Type/id/_history/n` or an absolute URL ending in one
/// of those. Contained (`#x`) and other non-resource links yield `None`.
pub fn parse_reference(reference: &str) -> Option<(String, String, Option<i32>)> {
    if reference.starts_with('#') || reference.starts_with("urn:") {
        return None;
    }

    let parts: Vec<&str> = reference.trim_end_matches('/').split('/').collect();
    let (type_idx, version) = match parts.len() {
        n if n >= 4 && parts[n - 2] == "_history" => (n - 4, parts[n - 1].parse::<i32>().ok()),
        n if n >= 2 => (n - 2, None),
        _ => return None,
    };

    let resource_type = parts[type_idx];
    let logical_id = parts[type_idx + 1];
    let looks_like_type = resource_type
        .chars()
        .next()
        .map(|c| c.is_ascii_uppercase())
        .unwrap_or(false);
    if !looks_like_type || logical_id.is_empty() {
        return None;
    }
    Some((resource_type.to_string(), logical_id.to_string(), version))
}

/// Converts a FHIR date, dateTime or instant into the range it covers.
///
/// `2024` covers the whole year, `2024-03` the month, `2024-03-15` the day.
/// Values with a time component are points, or cover the whole second when
/// fractional seconds are absent.
pub fn date_range(value: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let last_micro = Duration::microseconds(1);

    if value.contains('T') {
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            let start = dt.with_timezone(&Utc);
            let end = if value.contains('.') {
                start
            } else {
                start + Duration::seconds(1) - last_micro
            };
            return Some((start, end));
        }
        // Local time without an offset is taken as UTC.
        let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        let start = naive.and_utc();
        let end = if value.contains('.') {
            start
        } else {
            start + Duration::seconds(1) - last_micro
        };
        return Some((start, end));
    }

    let parts: Vec<&str> = value.split('-').collect();
    let (start, next) = match parts.as_slice() {
        [y] => {
            let year: i32 = y.parse().ok()?;
            (
                NaiveDate::from_ymd_opt(year, 1, 1)?,
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?,
            )
        }
        [y, m] => {
            let year: i32 = y.parse().ok()?;
            let month: u32 = m.parse().ok()?;
            let start = NaiveDate::from_ymd_opt(year, month, 1)?;
            let next = if month == 12 {
                NaiveDate::from_ymd_opt(year + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(start.year(), month + 1, 1)?
            };
            (start, next)
        }
        [_, _, _] => {
            let day = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
            (day, day.succ_opt()?)
        }
        _ => return None,
    };

    let start = start.and_hms_opt(0, 0, 0)?.and_utc();
    let end = next.and_hms_opt(0, 0, 0)?.and_utc() - last_micro;
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use serde_json::json;

    #[test]
    fn test_parse_reference() {
        assert_eq!(
            parse_reference("Patient/123"),
            Some(("Patient".to_string(), "123".to_string(), None))
        );
        assert_eq!(
            parse_reference("http://example.com/fhir/Patient/456/_history/2"),
            Some(("Patient".to_string(), "456".to_string(), Some(2)))
        );
        assert_eq!(parse_reference("#contained"), None);
        assert_eq!(parse_reference("urn:uuid:1234"), None);
        assert_eq!(parse_reference("justanid"), None);
    }

    #[test]
    fn test_convert_human_name() {
        let value = json!({"family": "Smith", "given": ["John", "Jane"]});
        let results = ValueConverter::convert(&value, ParameterKind::String, "name").unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(
            results[0],
            ParameterValue::String {
                value: "Smith".to_string()
            }
        );
    }

    #[test]
    fn test_convert_codeable_concept() {
        let value = json!({
            "coding": [
                {"system": "http://loinc.org", "code": "8867-4"},
                {"code": "local"}
            ],
            "text": "Heart rate"
        });
        let results = ValueConverter::convert(&value, ParameterKind::Token, "code").unwrap();
        assert_eq!(
            results,
            vec![
                ParameterValue::Token {
                    system: Some("http://loinc.org".to_string()),
                    code: "8867-4".to_string()
                },
                ParameterValue::Token {
                    system: None,
                    code: "local".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_convert_identifier_and_boolean() {
        let value = json!({"system": "http://hospital.org/mrn", "value": "12345"});
        let results = ValueConverter::convert(&value, ParameterKind::Token, "identifier").unwrap();
        assert_eq!(results.len(), 1);

        let results = ValueConverter::convert(&json!(true), ParameterKind::Token, "active").unwrap();
        assert_eq!(
            results,
            vec![ParameterValue::Token {
                system: None,
                code: "true".to_string()
            }]
        );
    }

    #[test]
    fn test_date_precision_ranges() {
        let (start, end) = date_range("2024").unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(
            end,
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() - Duration::microseconds(1)
        );

        let (start, end) = date_range("2024-02").unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(end.day(), 29);

        let (start, end) = date_range("2024-12-31").unwrap();
        assert_eq!(start.day(), 31);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() - Duration::microseconds(1));

        let (start, end) = date_range("2024-03-15T10:30:00.250+02:00").unwrap();
        assert_eq!(start, end);
        assert_eq!(start.hour(), 8);

        assert!(date_range("not a date").is_none());
        assert!(date_range("2024-13").is_none());
    }

    #[test]
    fn test_convert_period() {
        let value = json!({"start": "2024-01-01", "end": "2024-01-31"});
        let results = ValueConverter::convert(&value, ParameterKind::Date, "period").unwrap();
        let ParameterValue::Date { start, end } = &results[0] else {
            panic!("expected a date");
        };
        assert_eq!(start.day(), 1);
        assert_eq!(end.day(), 31);
    }

    #[test]
    fn test_convert_number_failure() {
        let result = ValueConverter::convert(&json!("abc"), ParameterKind::Number, "length");
        assert!(result.is_err());
    }

    #[test]
    fn test_convert_quantity_and_location() {
        let value = json!({"value": 120.5, "unit": "mmHg", "system": "http://unitsofmeasure.org", "code": "mm[Hg]"});
        let results = ValueConverter::convert(&value, ParameterKind::Quantity, "value-quantity").unwrap();
        assert_eq!(
            results,
            vec![ParameterValue::Quantity {
                value: 120.5,
                low: None,
                high: None,
                code: Some("mm[Hg]".to_string()),
                system: Some("http://unitsofmeasure.org".to_string()),
            }]
        );

        let value = json!({"latitude": 52.1, "longitude": 4.3});
        let results = ValueConverter::convert(&value, ParameterKind::Location, "near").unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_convert_profile_canonical() {
        let value = json!("http://example.org/StructureDefinition/vitals|1.2#part");
        let results = ValueConverter::convert(&value, ParameterKind::Profile, "_profile").unwrap();
        assert_eq!(
            results,
            vec![ParameterValue::Profile {
                url: "http://example.org/StructureDefinition/vitals".to_string(),
                version: Some("1.2".to_string()),
                fragment: Some("part".to_string()),
            }]
        );
    }
}
