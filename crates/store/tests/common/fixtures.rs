//! Resource fixtures for store tests.

use serde_json::{Value, json};

/// A patient fixture for testing.
#[derive(Debug, Clone)]
pub struct PatientFixture {
    /// Patient ID.
    pub id: String,
    /// Patient family name.
    pub family: String,
    /// Patient gender.
    pub gender: Option<String>,
    /// Patient identifiers (system, value pairs).
    pub identifiers: Vec<(String, String)>,
    /// Reference to managing organization.
    pub organization_ref: Option<String>,
    /// Tags (system, code pairs).
    pub tags: Vec<(String, String)>,
}

impl PatientFixture {
    /// Creates a new patient fixture with minimal required fields.
    pub fn new(id: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            family: family.into(),
            gender: None,
            identifiers: vec![],
            organization_ref: None,
            tags: vec![],
        }
    }

    /// Sets gender.
    pub fn with_gender(mut self, gender: impl Into<String>) -> Self {
        self.gender = Some(gender.into());
        self
    }

    /// Adds an identifier.
    pub fn with_identifier(mut self, system: impl Into<String>, value: impl Into<String>) -> Self {
        self.identifiers.push((system.into(), value.into()));
        self
    }

    /// Sets managing organization reference.
    pub fn with_organization(mut self, org_ref: impl Into<String>) -> Self {
        self.organization_ref = Some(org_ref.into());
        self
    }

    /// Adds a tag.
    pub fn with_tag(mut self, system: impl Into<String>, code: impl Into<String>) -> Self {
        self.tags.push((system.into(), code.into()));
        self
    }

    /// Converts to FHIR JSON.
    pub fn to_json(&self) -> Value {
        let mut patient = json!({
            "resourceType": "Patient",
            "id": self.id,
            "name": [{"family": self.family}],
        });

        if let Some(gender) = &self.gender {
            patient["gender"] = json!(gender);
        }

        if !self.identifiers.is_empty() {
            patient["identifier"] = json!(
                self.identifiers
                    .iter()
                    .map(|(system, value)| json!({"system": system, "value": value}))
                    .collect::<Vec<_>>()
            );
        }

        if let Some(org_ref) = &self.organization_ref {
            patient["managingOrganization"] = json!({"reference": org_ref});
        }

        if !self.tags.is_empty() {
            patient["meta"] = json!({
                "tag": self
                    .tags
                    .iter()
                    .map(|(system, code)| json!({"system": system, "code": code}))
                    .collect::<Vec<_>>()
            });
        }

        patient
    }
}

/// An observation with a LOINC code and a subject.
pub fn observation(id: &str, loinc: &str, subject: &str) -> Value {
    json!({
        "resourceType": "Observation",
        "id": id,
        "status": "final",
        "code": {"coding": [{"system": "http://loinc.org", "code": loinc}]},
        "subject": {"reference": subject},
    })
}

/// An index message for a patient with one family name and one gender token.
pub fn patient_message(id: &str, version: Option<i32>, family: &str, gender: &str) -> String {
    let mut data = json!({
        "resourceType": "Patient",
        "logicalId": id,
        "stringValues": [{"name": "family", "value": family}],
        "tokenValues": [{"name": "gender", "valueCode": gender}],
    });
    if let Some(version) = version {
        data["versionId"] = json!(version);
    }
    json!({"messageVersion": 1, "tenantId": "default", "data": data}).to_string()
}
