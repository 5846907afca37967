use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 404 - The runspace id is unknown to the provider.
    RunspaceNotFound(String),
    /// 404 - No live session has this id.
    SessionNotFound(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 403 - WebSocket upgrade from a foreign browser origin.
    OriginNotAllowed,
    /// 503 - The server is shutting down.
    ShuttingDown,
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::RunspaceNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::RunspaceNotFound(_) => "runspace_not_found",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::ShuttingDown => "shutting_down",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::RunspaceNotFound(id) => format!("No runspace exists with id '{}'.", id),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::OriginNotAllowed => {
                "WebSocket connections from this origin are not allowed.".to_string()
            }
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
