use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use super::error::ApiError;
use super::AppState;
use crate::session::{SessionId, SessionSummary};

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.registry.len(),
    })
}

/// `GET /runspaces/{id}/sessions`: live sessions, most recently active first.
pub(super) async fn list_sessions(
    State(state): State<AppState>,
    Path(runspace_id): Path<String>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    if !state.registry.runspace_exists(&runspace_id) {
        return Err(ApiError::RunspaceNotFound(runspace_id));
    }
    Ok(Json(state.registry.list_active(&runspace_id)))
}

pub(super) async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let id = parse_session_id(&id)?;
    state
        .registry
        .lookup_by_id(id)
        .filter(|s| !s.is_terminated())
        .map(|s| Json(s.summary()))
        .ok_or_else(|| ApiError::SessionNotFound(id.to_string()))
}

/// `DELETE /sessions/{id}`: administrative close. Closing an unknown or
/// already-ended session still answers 204.
pub(super) async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_session_id(&id)?;
    if state.registry.close(id).await {
        tracing::info!(session_id = %id, "session closed by request");
    }
    Ok(StatusCode::NO_CONTENT)
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::InvalidRequest(format!("'{}' is not a session id", raw)))
}
