//! FHIR server names for every user, configuration routes for super admins

use axum::{
    Extension,
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use connector_core::{FhirServerInput, OperationOutcome};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use super::{ApiError, error_response, outcome, read_json};
use crate::AppState;
use crate::auth::SessionUser;
use crate::services::ConnectionTestRequest;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub was_successful: bool,
}

/// Configured server names, default first (GET /api/fhir-servers)
pub async fn server_names(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
) -> Result<Json<Vec<String>>, ApiError> {
    state
        .fhir_servers
        .server_names(&state.pipeline(&user))
        .await
        .map(Json)
        .map_err(|e| error_response(&e))
}

/// GET /api/admin/fhir-servers
pub async fn list_configs(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
) -> Result<Response, ApiError> {
    let configs = state
        .fhir_servers
        .list_configs(&state.pipeline(&user))
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(configs).into_response())
}

/// GET /api/admin/fhir-servers/by-name/{name}
pub async fn config_by_name(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    match state
        .fhir_servers
        .config_by_name(&state.pipeline(&user), &name)
        .await
        .map_err(|e| error_response(&e))?
    {
        Some(config) => Ok(Json(config).into_response()),
        None => Err(outcome(
            StatusCode::NOT_FOUND,
            OperationOutcome::invalid(format!("FHIR server {} is not configured", name)),
        )),
    }
}

/// POST /api/admin/fhir-servers
pub async fn insert(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    request: Request,
) -> Result<Response, ApiError> {
    let input: FhirServerInput = read_json(request).await?;
    let config = state
        .fhir_servers
        .insert(&state.pipeline(&user), input)
        .await
        .map_err(|e| error_response(&e))?;
    Ok((StatusCode::CREATED, Json(config)).into_response())
}

/// PUT /api/admin/fhir-servers/{id}
pub async fn update(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(id): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let input: FhirServerInput = read_json(request).await?;
    let config = state
        .fhir_servers
        .update(&state.pipeline(&user), &id, input)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(config).into_response())
}

/// DELETE /api/admin/fhir-servers/{id}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .fhir_servers
        .delete(&state.pipeline(&user), &id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/admin/fhir-servers/by-name/{name}/connection-status
pub async fn update_connection_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let status: ConnectionStatus = read_json(request).await?;
    let config = state
        .fhir_servers
        .update_connection_status(&state.pipeline(&user), &name, status.was_successful)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(config).into_response())
}

/// POST /api/admin/fhir-servers/test-connection
///
/// A failed connection is a 200 with `success: false`; the error text is
/// meant for the administrator.
pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let test: ConnectionTestRequest = read_json(request).await?;
    let result = state
        .fhir_servers
        .test_connection(&state.pipeline(&user), &test)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!(result)))
}

/// POST /api/admin/fhir-servers/check-match
pub async fn check_supports_match(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let test: ConnectionTestRequest = read_json(request).await?;
    let support = state
        .fhir_servers
        .check_supports_match(&state.pipeline(&user), &test)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(json!(support)))
}
