use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use connector_core::OperationOutcome;
use serde_json::{Value, json};
use std::sync::Arc;

use super::{ApiError, outcome};
use crate::AppState;

/// Health check (GET /health)
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "fhirVersion": "4.0.1"
    }))
}

/// Public key set backing SMART client assertions (GET /.well-known/jwks.json)
///
/// FHIR servers using `SMART` auth fetch this from the assertion's `jku`.
pub async fn jwks(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let path = &state.config.smart.jwks_file;
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        tracing::warn!(path = %path.display(), "JWKS not available: {}", e);
        outcome(
            StatusCode::NOT_FOUND,
            OperationOutcome::exception("No JWKS has been configured"),
        )
    })?;

    serde_json::from_str(&content).map(Json).map_err(|e| {
        tracing::error!(path = %path.display(), "JWKS is not valid JSON: {}", e);
        outcome(
            StatusCode::INTERNAL_SERVER_ERROR,
            OperationOutcome::exception("Configured JWKS is not valid JSON"),
        )
    })
}
