//! `Patient/$match` request building and response interpretation.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::demographics::PatientDemographics;
use crate::error::{ConnectorError, Result};
use crate::resource::{Resource, is_fhir_resource};

/// Text an upstream server puts in `issue.details.text` when it found
/// candidates but none it would call certain
pub const UNCERTAIN_MATCH_TEXT: &str = "did not find a certain match";

/// Per-server `$match` settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatientMatchConfiguration {
    pub enabled: bool,
    pub only_single_match: bool,
    pub only_certain_matches: bool,
    pub match_count: u32,
    pub supports_match: bool,
}

/// Result of patient discovery
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryResult {
    Patients(Vec<Resource>),
    /// The server matched candidates but none with certainty
    UncertainMatch,
}

impl DiscoveryResult {
    pub fn patients(&self) -> &[Resource] {
        match self {
            DiscoveryResult::Patients(p) => p,
            DiscoveryResult::UncertainMatch => &[],
        }
    }
}

/// Build the `Parameters` body for `POST /Patient/$match`.
///
/// Fails before any network call when there is nothing to match on.
pub fn build_match_parameters(
    demographics: &PatientDemographics,
    config: &PatientMatchConfiguration,
) -> Result<Value> {
    if !demographics.has_identifiers() {
        return Err(ConnectorError::MissingIdentifiers(
            "Cannot run $match: Patient resource has no identifying fields".to_string(),
        ));
    }

    let mut parameter = vec![json!({
        "name": "resource",
        "resource": demographics.to_patient_resource(),
    })];
    if config.match_count > 0 {
        parameter.push(json!({"name": "count", "valueInteger": config.match_count}));
    }
    parameter.push(json!({
        "name": "onlyCertainMatches",
        "valueBoolean": config.only_certain_matches,
    }));
    parameter.push(json!({
        "name": "onlySingleMatch",
        "valueBoolean": config.only_single_match,
    }));

    Ok(json!({
        "resourceType": "Parameters",
        "parameter": parameter,
    }))
}

/// True for an OperationOutcome whose issue details say no certain match
pub fn is_uncertain_match(body: &Value) -> bool {
    if body.get("resourceType").and_then(Value::as_str) != Some("OperationOutcome") {
        return false;
    }
    body.get("issue")
        .and_then(Value::as_array)
        .is_some_and(|issues| {
            issues.iter().any(|issue| {
                issue
                    .pointer("/details/text")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.contains(UNCERTAIN_MATCH_TEXT))
            })
        })
}

/// Patient resources from the entries of a search or `$match` Bundle
pub fn patients_from_bundle(body: &Value) -> Vec<Resource> {
    body.get("entry")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get("resource"))
                .filter(|r| is_fhir_resource(r))
                .filter_map(|r| Resource::from_value(r.clone()))
                .filter(|r| r.resource_type == "Patient")
                .collect()
        })
        .unwrap_or_default()
}

/// Interpret a `$match` response body
pub fn interpret_match_response(body: &Value) -> DiscoveryResult {
    if is_uncertain_match(body) {
        return DiscoveryResult::UncertainMatch;
    }
    DiscoveryResult::Patients(patients_from_bundle(body))
}
