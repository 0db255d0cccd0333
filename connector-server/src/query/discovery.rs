use connector_core::patient_match::{
    build_match_parameters, interpret_match_response, is_uncertain_match, patients_from_bundle,
};
use connector_core::{DiscoveryResult, Result};
use serde_json::Value;
use tracing::{debug, info};

use super::{PATIENT_DISCOVERY, PatientDiscoveryRequest, QueryEngine};
use crate::fhir_client::{FhirClient, FhirResponse};
use crate::pipeline::Pipeline;

pub const MATCH_PATH: &str = "/Patient/$match";

impl QueryEngine {
    /// Find candidate patients for the request's demographics.
    ///
    /// Servers with `$match` enabled get a Parameters resource; everything
    /// else gets a deterministic `/Patient?` search.
    pub async fn patient_discovery_query(
        &self,
        pipeline: &Pipeline<'_>,
        request: &PatientDiscoveryRequest,
    ) -> Result<DiscoveryResult> {
        let input = serde_json::to_value(request)?;
        pipeline
            .run(&PATIENT_DISCOVERY, input, || async move {
                let client = self.prepare_client(&request.fhir_server).await?;
                discover(&client, request).await
            })
            .await
    }
}

async fn discover(client: &FhirClient, request: &PatientDiscoveryRequest) -> Result<DiscoveryResult> {
    let demographics = &request.demographics;

    if let Some(settings) = client.server().match_settings() {
        let parameters = build_match_parameters(demographics, settings)?;
        debug!(server = %request.fhir_server, "Running Patient $match");
        let response = client.post_json(MATCH_PATH, &parameters).await?;
        return Ok(interpret(&response, true));
    }

    let response = client.get(&demographics.patient_search_path()).await?;
    Ok(interpret(&response, false))
}

/// Normalize a discovery response.
///
/// The uncertain-match outcome is recognized whatever the status code, since
/// servers report it on 200 and on 4xx alike. Any other non-200 is an empty
/// result.
fn interpret(response: &FhirResponse, is_match: bool) -> DiscoveryResult {
    let body: Option<Value> = serde_json::from_str(&response.body).ok();

    if let Some(ref body) = body
        && is_uncertain_match(body)
    {
        info!(url = %response.url, "Patient $match did not find a certain match");
        return DiscoveryResult::UncertainMatch;
    }

    if !response.is_ok() {
        response.log_unusable("Patient search failed");
        return DiscoveryResult::Patients(Vec::new());
    }

    match body {
        Some(body) if is_match => interpret_match_response(&body),
        Some(body) => DiscoveryResult::Patients(patients_from_bundle(&body)),
        None => {
            response.log_unusable("Patient search returned a non-JSON body");
            DiscoveryResult::Patients(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use reqwest::header::HeaderMap;
    use serde_json::json;

    fn response(status: StatusCode, body: Value) -> FhirResponse {
        FhirResponse {
            status,
            url: "https://fhir.example.org/Patient".to_string(),
            headers: HeaderMap::new(),
            body: body.to_string(),
        }
    }

    fn uncertain() -> Value {
        json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": "information",
                "code": "informational",
                "details": {"text": "did not find a certain match"}
            }]
        })
    }

    #[test]
    fn test_uncertain_match_on_error_status() {
        let result = interpret(&response(StatusCode::UNPROCESSABLE_ENTITY, uncertain()), true);
        assert_eq!(result, DiscoveryResult::UncertainMatch);
    }

    #[test]
    fn test_error_status_is_empty() {
        let body = json!({"resourceType": "OperationOutcome", "issue": []});
        let result = interpret(&response(StatusCode::INTERNAL_SERVER_ERROR, body), false);
        assert_eq!(result, DiscoveryResult::Patients(vec![]));
    }

    #[test]
    fn test_search_bundle() {
        let body = json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [{"resource": {"resourceType": "Patient", "id": "p1"}}]
        });
        let result = interpret(&response(StatusCode::OK, body), false);
        assert_eq!(result.patients().len(), 1);
        assert_eq!(result.patients()[0].id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_non_json_body() {
        let mut resp = response(StatusCode::OK, Value::Null);
        resp.body = "<html>".to_string();
        assert_eq!(interpret(&resp, false), DiscoveryResult::Patients(vec![]));
    }
}
