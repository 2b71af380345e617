use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::cluster::ClusterError;
use crate::portforward::ForwardError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 403 - WebSocket upgrade from a foreign browser origin.
    OriginNotAllowed,
    /// 404 - No port-forward session with these coordinates.
    SessionNotFound(String),
    /// 404 - The target pod does not exist.
    PodNotFound(String),
    /// 409 - A live port-forward session already has these coordinates.
    SessionConflict(String),
    /// 409 - The session was stopped while it was still starting.
    SessionStopped(String),
    /// 409 - The local end of a forward could not be bound.
    LocalPortUnavailable(String),
    /// 502 - The cluster refused or broke the upgraded stream.
    UpstreamFailed(String),
    /// 503 - The configured port-forward session cap is reached.
    SessionLimitReached(usize),
    /// 503 - The server is draining connections.
    ShuttingDown,
    /// 504 - A port-forward session did not become ready in time.
    StartTimeout(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PodNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionConflict(_) => StatusCode::CONFLICT,
            ApiError::SessionStopped(_) => StatusCode::CONFLICT,
            ApiError::LocalPortUnavailable(_) => StatusCode::CONFLICT,
            ApiError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::SessionLimitReached(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::StartTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::PodNotFound(_) => "pod_not_found",
            ApiError::SessionConflict(_) => "session_conflict",
            ApiError::SessionStopped(_) => "session_stopped",
            ApiError::LocalPortUnavailable(_) => "local_port_unavailable",
            ApiError::UpstreamFailed(_) => "upstream_failed",
            ApiError::SessionLimitReached(_) => "session_limit_reached",
            ApiError::ShuttingDown => "shutting_down",
            ApiError::StartTimeout(_) => "start_timeout",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::OriginNotAllowed => {
                "WebSocket connections from this origin are not allowed.".to_string()
            }
            ApiError::SessionNotFound(id) => format!("Port-forward session not found: {}.", id),
            ApiError::PodNotFound(pod) => format!("Pod not found: {}.", pod),
            ApiError::SessionConflict(id) => {
                format!("Port-forward session already exists: {}.", id)
            }
            ApiError::SessionStopped(id) => {
                format!("Port-forward session was stopped before it became ready: {}.", id)
            }
            ApiError::LocalPortUnavailable(detail) => {
                format!("Local port unavailable: {}.", detail)
            }
            ApiError::UpstreamFailed(detail) => format!("Cluster stream failed: {}.", detail),
            ApiError::SessionLimitReached(max) => {
                format!("Maximum number of port-forward sessions reached ({}).", max)
            }
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
            ApiError::StartTimeout(id) => {
                format!("Port-forward session did not become ready in time: {}.", id)
            }
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<ForwardError> for ApiError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::Invalid(detail) => ApiError::InvalidRequest(detail),
            ForwardError::Duplicate(id) => ApiError::SessionConflict(id),
            ForwardError::NotFound(id) => ApiError::SessionNotFound(id),
            ForwardError::LimitReached(max) => ApiError::SessionLimitReached(max),
            ForwardError::Timeout { id, .. } => ApiError::StartTimeout(id),
            ForwardError::Listen { addr, source } => {
                ApiError::LocalPortUnavailable(format!("{addr}: {source}"))
            }
            ForwardError::Stopped(id) => ApiError::SessionStopped(id),
            ForwardError::Abandoned(id) => {
                ApiError::InternalError(format!("session {id} exited during startup"))
            }
            ForwardError::Cluster(err) => err.into(),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::PodNotFound(pod) => ApiError::PodNotFound(pod),
            other => ApiError::UpstreamFailed(other.to_string()),
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
