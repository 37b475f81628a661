//! Index message format.
//!
//! Messages are JSON with camelCase field names. Every value list is
//! optional and defaults to empty.

// Field names mirror the wire format
#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MessageError, StorageResult};
use crate::types::{ExtractedParameterValue, ParameterValue};

/// One index message: the parameters of one version of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMessage {
    /// Format version of the message.
    pub message_version: u32,
    /// Tenant the resource belongs to.
    pub tenant_id: String,
    /// Instance that produced the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_identifier: Option<String>,
    /// The resource and its values.
    pub data: ResourceIndexData,
}

impl IndexMessage {
    /// Parses a message.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        serde_json::from_str(raw).map_err(|e| {
            MessageError::Malformed {
                message: e.to_string(),
            }
            .into()
        })
    }
}

/// The resource a message indexes and its parameter values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIndexData {
    pub resource_type: String,
    pub logical_id: String,
    /// Id assigned by the producer; 0 when unknown.
    #[serde(default)]
    pub logical_resource_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_shard: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_hash: Option<String>,

    #[serde(default)]
    pub string_values: Vec<StringValue>,
    #[serde(default)]
    pub number_values: Vec<NumberValue>,
    #[serde(default)]
    pub date_values: Vec<DateValue>,
    #[serde(default)]
    pub quantity_values: Vec<QuantityValue>,
    #[serde(default)]
    pub token_values: Vec<TokenValue>,
    #[serde(default)]
    pub location_values: Vec<LocationValue>,
    #[serde(default)]
    pub ref_values: Vec<ReferenceValue>,
    #[serde(default)]
    pub tag_values: Vec<TagValue>,
    #[serde(default)]
    pub profile_values: Vec<ProfileValue>,
    #[serde(default)]
    pub security_values: Vec<TagValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StringValue {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub whole_system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberValue {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateValue {
    pub name: String,
    pub value_date_start: DateTime<Utc>,
    pub value_date_end: DateTime<Utc>,
    #[serde(default)]
    pub whole_system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantityValue {
    pub name: String,
    pub value_number: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_number_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_number_high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_system: Option<String>,
    pub value_code: String,
    #[serde(default)]
    pub whole_system: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationValue {
    pub name: String,
    pub value_latitude: f64,
    pub value_longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceValue {
    pub name: String,
    pub ref_resource_type: String,
    pub ref_logical_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_version_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_id: Option<i32>,
}

/// A tag or security label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_system: Option<String>,
    pub value_code: String,
    #[serde(default = "default_true")]
    pub whole_system: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileValue {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
    #[serde(default = "default_true")]
    pub whole_system: bool,
}

fn default_true() -> bool {
    true
}

fn entry(
    name: &str,
    value: ParameterValue,
    whole_system: bool,
    composite_id: Option<i32>,
) -> ExtractedParameterValue {
    ExtractedParameterValue {
        name: name.to_string(),
        whole_system,
        composite_id,
        value,
    }
}

impl ResourceIndexData {
    /// Converts the message values into flattened parameter values.
    pub fn to_parameters(&self) -> Vec<ExtractedParameterValue> {
        let mut out = Vec::new();

        for v in &self.string_values {
            out.push(entry(
                &v.name,
                ParameterValue::String {
                    value: v.value.clone(),
                },
                v.whole_system,
                v.composite_id,
            ));
        }
        for v in &self.number_values {
            out.push(entry(
                &v.name,
                ParameterValue::Number {
                    value: v.value,
                    low: v.value_low,
                    high: v.value_high,
                },
                false,
                v.composite_id,
            ));
        }
        for v in &self.date_values {
            out.push(entry(
                &v.name,
                ParameterValue::Date {
                    start: v.value_date_start,
                    end: v.value_date_end,
                },
                v.whole_system,
                v.composite_id,
            ));
        }
        for v in &self.quantity_values {
            out.push(entry(
                &v.name,
                ParameterValue::Quantity {
                    value: v.value_number,
                    low: v.value_number_low,
                    high: v.value_number_high,
                    code: v.value_code.clone(),
                    system: v.value_system.clone(),
                },
                false,
                v.composite_id,
            ));
        }
        for v in &self.token_values {
            out.push(entry(
                &v.name,
                ParameterValue::Token {
                    system: v.value_system.clone(),
                    code: v.value_code.clone(),
                },
                v.whole_system,
                v.composite_id,
            ));
        }
        for v in &self.location_values {
            out.push(entry(
                &v.name,
                ParameterValue::Location {
                    latitude: v.value_latitude,
                    longitude: v.value_longitude,
                },
                false,
                v.composite_id,
            ));
        }
        for v in &self.ref_values {
            out.push(entry(
                &v.name,
                ParameterValue::Reference {
                    resource_type: v.ref_resource_type.clone(),
                    logical_id: v.ref_logical_id.clone(),
                    version: v.ref_version_id,
                },
                false,
                v.composite_id,
            ));
        }
        for v in &self.tag_values {
            out.push(entry(
                "_tag",
                ParameterValue::Tag {
                    system: v.value_system.clone(),
                    code: v.value_code.clone(),
                },
                v.whole_system,
                None,
            ));
        }
        for v in &self.profile_values {
            out.push(entry(
                "_profile",
                ParameterValue::Profile {
                    url: v.url.clone(),
                    version: v.version.clone(),
                    fragment: v.fragment.clone(),
                },
                v.whole_system,
                None,
            ));
        }
        for v in &self.security_values {
            out.push(entry(
                "_security",
                ParameterValue::Security {
                    system: v.value_system.clone(),
                    code: v.value_code.clone(),
                },
                v.whole_system,
                None,
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::types::ParameterKind;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_message() {
        let raw = json!({
            "messageVersion": 1,
            "tenantId": "default",
            "data": {"resourceType": "Patient", "logicalId": "p1"}
        })
        .to_string();
        let message = IndexMessage::parse(&raw).unwrap();
        assert_eq!(message.data.logical_resource_id, 0);
        assert!(message.data.version_id.is_none());
        assert!(message.data.to_parameters().is_empty());
    }

    #[test]
    fn test_values_convert() {
        let raw = json!({
            "messageVersion": 1,
            "tenantId": "default",
            "data": {
                "resourceType": "Observation",
                "logicalId": "o1",
                "versionId": 2,
                "requestShard": "ward-7",
                "tokenValues": [
                    {"name": "code", "valueSystem": "http://loinc.org", "valueCode": "8480-6", "compositeId": 1}
                ],
                "quantityValues": [
                    {"name": "value-quantity", "valueNumber": 120.0, "valueCode": "mm[Hg]", "compositeId": 1}
                ],
                "refValues": [
                    {"name": "subject", "refResourceType": "Patient", "refLogicalId": "p1"}
                ],
                "tagValues": [{"valueCode": "vip"}],
                "dateValues": [{
                    "name": "date",
                    "valueDateStart": "2024-01-15T10:00:00Z",
                    "valueDateEnd": "2024-01-15T10:00:00Z"
                }]
            }
        })
        .to_string();

        let message = IndexMessage::parse(&raw).unwrap();
        assert_eq!(message.data.request_shard.as_deref(), Some("ward-7"));
        let params = message.data.to_parameters();
        assert_eq!(params.len(), 5);
        assert_eq!(params.iter().filter(|p| p.composite_id == Some(1)).count(), 2);

        let tag = params.iter().find(|p| p.name == "_tag").unwrap();
        assert!(tag.whole_system);
        assert_eq!(tag.value.kind(), ParameterKind::Tag);
    }

    #[test]
    fn test_malformed_message() {
        let err = IndexMessage::parse("{\"messageVersion\": \"x\"}").unwrap_err();
        assert!(matches!(
            err,
            StorageError::Message(MessageError::Malformed { .. })
        ));
    }
}
