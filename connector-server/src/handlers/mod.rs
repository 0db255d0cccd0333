pub mod fhir_servers;
pub mod metadata;
pub mod query;
pub mod saved_queries;

use axum::{
    body::Bytes,
    extract::Request,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use connector_core::{ConnectorError, OperationOutcome};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

/// Error half of every handler result: a status and an OperationOutcome body
pub type ApiError = (StatusCode, Json<Value>);

pub fn outcome(status: StatusCode, outcome: OperationOutcome) -> ApiError {
    (status, Json(json!(outcome)))
}

/// Map an engine or service failure to the status the API reports
pub fn error_response(error: &ConnectorError) -> ApiError {
    match error {
        ConnectorError::Authorization(_) => {
            outcome(StatusCode::FORBIDDEN, OperationOutcome::forbidden(error.to_string()))
        }
        ConnectorError::InvalidRequest(message) | ConnectorError::MissingIdentifiers(message) => {
            outcome(StatusCode::BAD_REQUEST, OperationOutcome::invalid(message.as_str()))
        }
        ConnectorError::PatientNotFound => outcome(
            StatusCode::INTERNAL_SERVER_ERROR,
            OperationOutcome::invalid(error.to_string()),
        ),
        _ => {
            tracing::error!("Request failed: {}", error);
            outcome(
                StatusCode::INTERNAL_SERVER_ERROR,
                OperationOutcome::from_error(error),
            )
        }
    }
}

/// JSON response with the FHIR media type
pub fn fhir_json(status: StatusCode, body: Value) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/fhir+json; charset=utf-8"),
    );
    response
}

/// Collect the request body
pub async fn read_body(request: Request) -> Result<Bytes, ApiError> {
    request
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| outcome(StatusCode::BAD_REQUEST, OperationOutcome::invalid(e.to_string())))
}

/// Collect and deserialize a JSON request body
pub async fn read_json<T: DeserializeOwned>(request: Request) -> Result<T, ApiError> {
    let bytes = read_body(request).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| outcome(StatusCode::BAD_REQUEST, OperationOutcome::invalid(e.to_string())))
}
