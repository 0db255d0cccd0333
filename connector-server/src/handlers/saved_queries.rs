//! Saved query and time window routes

use axum::{
    Extension,
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use connector_core::{ConceptType, OperationOutcome, SavedQuery, TimeboxSetting};
use std::sync::Arc;

use super::{ApiError, error_response, outcome, read_json};
use crate::AppState;
use crate::auth::SessionUser;

fn not_found(what: &str, id: &str) -> ApiError {
    outcome(
        StatusCode::NOT_FOUND,
        OperationOutcome::invalid(format!("{} {} not found", what, id)),
    )
}

fn concept_type(raw: &str) -> Result<ConceptType, ApiError> {
    match ConceptType::parse(raw) {
        ConceptType::Unknown => Err(outcome(
            StatusCode::BAD_REQUEST,
            OperationOutcome::invalid(format!("Unknown concept type {}", raw)),
        )),
        concept_type => Ok(concept_type),
    }
}

/// GET /api/queries
pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
) -> Result<Response, ApiError> {
    let queries = state
        .saved_queries
        .get_saved_queries(&state.pipeline(&user))
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(queries).into_response())
}

/// POST /api/queries: insert, or update when `queryId` names an existing query
pub async fn save(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    request: Request,
) -> Result<Response, ApiError> {
    let query: SavedQuery = read_json(request).await?;
    let saved = state
        .saved_queries
        .save_query(&state.pipeline(&user), query)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(saved).into_response())
}

/// GET /api/queries/{id}
pub async fn by_id(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state
        .saved_queries
        .get_saved_query_by_id(&state.pipeline(&user), &id)
        .await
        .map_err(|e| error_response(&e))?
        .map(|query| Json(query).into_response())
        .ok_or_else(|| not_found("Saved query", &id))
}

/// GET /api/queries/by-name/{name}
pub async fn by_name(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state
        .saved_queries
        .get_saved_query_by_name(&state.pipeline(&user), &name)
        .await
        .map_err(|e| error_response(&e))?
        .map(|query| Json(query).into_response())
        .ok_or_else(|| not_found("Saved query", &name))
}

/// DELETE /api/queries/{id}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .saved_queries
        .delete_query(&state.pipeline(&user), &id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/queries/{id}/groups/{group_id}
pub async fn link_to_group(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path((id, group_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .saved_queries
        .link_query_to_group(&state.pipeline(&user), &group_id, &id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/queries/{id}/timebox: every window, resolved against now
pub async fn resolved_timebox(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let timebox = state
        .saved_queries
        .link_timebox_ranges_to_query(&state.pipeline(&user), &id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(timebox).into_response())
}

/// PUT /api/queries/{id}/timebox
pub async fn update_timebox(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(id): Path<String>,
    request: Request,
) -> Result<StatusCode, ApiError> {
    let setting: TimeboxSetting = read_json(request).await?;
    concept_type(setting.concept_type.as_str())?;
    state
        .saved_queries
        .update_timebox_settings(&state.pipeline(&user), &id, &setting)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/queries/{id}/timebox/{concept_type}: the window as stored
pub async fn timebox_range(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path((id, raw_concept_type)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let concept_type = concept_type(&raw_concept_type)?;
    state
        .saved_queries
        .get_timebox_ranges(&state.pipeline(&user), &id, concept_type)
        .await
        .map_err(|e| error_response(&e))?
        .map(|window| Json(window).into_response())
        .ok_or_else(|| not_found("Time window", &raw_concept_type))
}

/// DELETE /api/queries/{id}/timebox/{concept_type}
pub async fn delete_timebox(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path((id, raw_concept_type)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let concept_type = concept_type(&raw_concept_type)?;
    let deleted = state
        .saved_queries
        .delete_timebox_settings(&state.pipeline(&user), &id, concept_type)
        .await
        .map_err(|e| error_response(&e))?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Time window", &raw_concept_type))
    }
}
