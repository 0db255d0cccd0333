//! `/api/query`: the full patient query for external callers.
//!
//! Demographics arrive as query parameters (GET) or as a FHIR Patient or HL7
//! v2 message body (POST). Validation failures answer with an
//! OperationOutcome whose diagnostics carry one of the messages below.

use axum::{
    Extension,
    extract::{Query, Request, State},
    http::StatusCode,
    response::Response,
};
use connector_core::{ConnectorError, DiscoveryResult, OperationOutcome, PatientDemographics};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use super::{ApiError, error_response, fhir_json, outcome, read_body, read_json};
use crate::AppState;
use crate::auth::SessionUser;
use crate::query::{FullPatientRequest, PatientDiscoveryRequest, PatientRecordsRequest};

pub const INVALID_QUERY: &str = "Query identified in the id param not found in the set of saved queries. Please provide an ID that exists in the saved set of queries.";
pub const INVALID_FHIR_SERVERS: &str = "Invalid fhir_server. Please provide a valid fhir_server.";
pub const RESPONSE_BODY_IS_NOT_PATIENT_RESOURCE: &str = "Request body is not a Patient resource.";
pub const MISSING_API_QUERY_PARAM: &str = "Missing id or fhir_server.";
pub const INVALID_MESSAGE_FORMAT: &str =
    "Invalid message format. Format parameter needs to be either 'HL7' or 'FHIR'";
pub const MISSING_PATIENT_IDENTIFIERS: &str = "No patient identifiers to parse from requestBody.";

/// Saved query ids behind the retired `use_case` parameter
const DEPRECATED_USE_CASES: &[(&str, &str)] = &[
    ("newborn-screening", "c025a247-0129-4f0c-a2c6-7f3af08e06b4"),
    ("syphilis", "facfefc1-dd39-4f84-9d91-e924e860ad1c"),
    ("gonorrhea", "73e1a777-49cb-4e19-bc71-8c3fd3ffda64"),
    ("chlamydia", "6edd14a2-ef78-4d8e-8509-0f87a7228d67"),
    ("cancer", "cf580d8d-cc7b-4eae-8a0d-96c36f9222e3"),
    ("immunization", "e858cba3-59f6-4bc8-9a1e-28fac21c5813"),
];

pub fn map_deprecated_use_case_to_id(use_case: &str) -> Option<&'static str> {
    DEPRECATED_USE_CASES
        .iter()
        .find(|(name, _)| *name == use_case)
        .map(|(_, id)| *id)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    pub id: Option<String>,
    /// Deprecated in favor of `id`
    pub use_case: Option<String>,
    pub fhir_server: Option<String>,
    pub message_format: Option<String>,
    pub given: Option<String>,
    pub family: Option<String>,
    pub dob: Option<String>,
    pub mrn: Option<String>,
    pub phone: Option<String>,
    pub street1: Option<String>,
    pub street2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub email: Option<String>,
}

impl QueryParams {
    fn query_id(&self) -> Option<String> {
        match self.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => Some(id.to_string()),
            None => self
                .use_case
                .as_deref()
                .and_then(map_deprecated_use_case_to_id)
                .map(String::from),
        }
    }

    fn demographics(&self) -> PatientDemographics {
        PatientDemographics {
            first_name: self.given.clone(),
            last_name: self.family.clone(),
            dob: self.dob.clone(),
            mrn: self.mrn.clone(),
            phone: self.phone.clone(),
            street1: self.street1.clone(),
            street2: self.street2.clone(),
            city: self.city.clone(),
            state: self.state.clone(),
            zip: self.zip.clone(),
            email: self.email.clone(),
        }
    }
}

fn invalid(status: StatusCode, message: &str) -> ApiError {
    outcome(status, OperationOutcome::invalid(message))
}

/// Query id and server name, checked in that order against the request and
/// the configuration
async fn resolve_target(
    state: &AppState,
    user: &SessionUser,
    params: &QueryParams,
) -> Result<(String, String), ApiError> {
    let (Some(query_id), Some(fhir_server)) = (
        params.query_id(),
        params.fhir_server.clone().filter(|s| !s.is_empty()),
    ) else {
        return Err(invalid(StatusCode::INTERNAL_SERVER_ERROR, MISSING_API_QUERY_PARAM));
    };

    let names = state
        .fhir_servers
        .server_names(&state.pipeline(user))
        .await
        .map_err(|e| error_response(&e))?;
    if !names.contains(&fhir_server) {
        return Err(invalid(StatusCode::INTERNAL_SERVER_ERROR, INVALID_FHIR_SERVERS));
    }

    match state.engine.saved_query(&query_id) {
        Ok(_) => Ok((query_id, fhir_server)),
        Err(ConnectorError::QueryNotFound(_)) => {
            Err(invalid(StatusCode::INTERNAL_SERVER_ERROR, INVALID_QUERY))
        }
        Err(e) => Err(error_response(&e)),
    }
}

async fn run_full_query(
    state: &AppState,
    user: &SessionUser,
    query_id: String,
    fhir_server: String,
    demographics: PatientDemographics,
) -> Result<Response, ApiError> {
    let request = FullPatientRequest {
        fhir_server,
        query_id,
        demographics,
    };
    let response = state
        .engine
        .full_patient_query(&state.pipeline(user), &request)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(fhir_json(StatusCode::OK, response.to_bundle()))
}

/// Full patient query (GET /api/query)
pub async fn get_query(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    let (query_id, fhir_server) = resolve_target(&state, &user, &params).await?;

    let demographics = params.demographics();
    if !demographics.has_identifiers() {
        return Err(invalid(StatusCode::BAD_REQUEST, MISSING_PATIENT_IDENTIFIERS));
    }

    run_full_query(&state, &user, query_id, fhir_server, demographics).await
}

/// Full patient query from a FHIR Patient or HL7 v2 body (POST /api/query)
pub async fn post_query(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Query(params): Query<QueryParams>,
    request: Request,
) -> Result<Response, ApiError> {
    let (query_id, fhir_server) = resolve_target(&state, &user, &params).await?;

    let demographics = match params.message_format.as_deref().unwrap_or("FHIR") {
        "HL7" => {
            let body = read_body(request).await?;
            PatientDemographics::from_hl7(&String::from_utf8_lossy(&body))
        }
        "FHIR" => {
            let body = read_body(request).await?;
            let patient: Value = serde_json::from_slice(&body)
                .map_err(|e| error_response(&ConnectorError::InvalidJson(e)))?;
            if let Some(resource_type) = patient.get("resourceType")
                && resource_type != "Patient"
            {
                return Err(invalid(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    RESPONSE_BODY_IS_NOT_PATIENT_RESOURCE,
                ));
            }
            PatientDemographics::from_patient(&patient)
        }
        _ => {
            return Err(invalid(StatusCode::INTERNAL_SERVER_ERROR, INVALID_MESSAGE_FORMAT));
        }
    };

    if !demographics.has_identifiers() {
        return Err(invalid(StatusCode::BAD_REQUEST, MISSING_PATIENT_IDENTIFIERS));
    }

    run_full_query(&state, &user, query_id, fhir_server, demographics).await
}

/// Candidate search only (POST /api/patient-discovery).
///
/// An uncertain `$match` is reported as `uncertainMatch: true` with no
/// patients, so callers can tell it apart from an empty search.
pub async fn patient_discovery(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    request: Request,
) -> Result<Response, ApiError> {
    let request: PatientDiscoveryRequest = read_json(request).await?;
    let result = state
        .engine
        .patient_discovery_query(&state.pipeline(&user), &request)
        .await
        .map_err(|e| error_response(&e))?;

    let body = match result {
        DiscoveryResult::Patients(patients) => json!({
            "uncertainMatch": false,
            "patients": patients,
        }),
        DiscoveryResult::UncertainMatch => json!({
            "uncertainMatch": true,
            "patients": [],
        }),
    };
    Ok(fhir_json(StatusCode::OK, body))
}

/// Records of an already identified patient (POST /api/patient-records)
pub async fn patient_records(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    request: Request,
) -> Result<Response, ApiError> {
    let request: PatientRecordsRequest = read_json(request).await?;
    let response = state
        .engine
        .patient_records_query(&state.pipeline(&user), &request)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(fhir_json(StatusCode::OK, response.to_bundle()))
}
