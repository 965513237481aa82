use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::executor::ExecutorError;
use crate::session::PollError;
use crate::sim::SimError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 404 - Generic not-found.
    NotFound,
    /// 404 - No car with this guid.
    CarNotFound(String),
    /// 404 - The car exists but has no remote controller.
    NotControllable(String),
    /// 404 - Junction index out of range or not a number.
    JunctionNotFound(String),
    /// 404 - No job with this id.
    JobNotFound(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - Session id failed validation.
    InvalidSessionId(String),
    /// 400 - Locomotive command had an unknown key or non-numeric value.
    InvalidCommand,
    /// 500 - A pending tag has no registered resolver.
    UnresolvableTag(String),
    /// 500 - A resolver returned an error.
    ResolverFailed(String),
    /// 503 - The simulation thread is gone.
    SimulationUnavailable,
    /// 500 - Work submitted to the simulation thread panicked.
    SimulationPanicked(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::CarNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotControllable(_) => StatusCode::NOT_FOUND,
            ApiError::JunctionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidSessionId(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidCommand => StatusCode::BAD_REQUEST,
            ApiError::UnresolvableTag(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ResolverFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::SimulationUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::SimulationPanicked(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound => "not_found",
            ApiError::CarNotFound(_) => "car_not_found",
            ApiError::NotControllable(_) => "not_controllable",
            ApiError::JunctionNotFound(_) => "junction_not_found",
            ApiError::JobNotFound(_) => "job_not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidSessionId(_) => "invalid_session_id",
            ApiError::InvalidCommand => "invalid_command",
            ApiError::UnresolvableTag(_) => "unresolvable_tag",
            ApiError::ResolverFailed(_) => "resolver_failed",
            ApiError::SimulationUnavailable => "simulation_unavailable",
            ApiError::SimulationPanicked(_) => "simulation_panicked",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::CarNotFound(guid) => format!("No car exists with guid '{}'.", guid),
            ApiError::NotControllable(guid) => {
                format!("Car '{}' cannot be remotely controlled.", guid)
            }
            ApiError::JunctionNotFound(id) => format!("No junction exists with id '{}'.", id),
            ApiError::JobNotFound(id) => format!("No job exists with id '{}'.", id),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::InvalidSessionId(detail) => format!("Invalid session id: {}.", detail),
            ApiError::InvalidCommand => {
                "Unknown control or non-numeric value; nothing was applied.".to_string()
            }
            ApiError::UnresolvableTag(tag) => format!("No resolver registered for tag '{}'.", tag),
            ApiError::ResolverFailed(detail) => format!("Failed to resolve update: {}.", detail),
            ApiError::SimulationUnavailable => "Simulation is not running.".to_string(),
            ApiError::SimulationPanicked(detail) => {
                format!("Simulation task failed: {}.", detail)
            }
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
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

impl From<PollError> for ApiError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::InvalidSessionId(detail) => ApiError::InvalidSessionId(detail),
            PollError::Unresolvable(tag) => ApiError::UnresolvableTag(tag.to_string()),
            PollError::ResolverFailed { tag, source } => {
                ApiError::ResolverFailed(format!("{tag}: {source}"))
            }
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Closed => ApiError::SimulationUnavailable,
            ExecutorError::Panicked(msg) => ApiError::SimulationPanicked(msg),
        }
    }
}

impl From<SimError> for ApiError {
    fn from(err: SimError) -> Self {
        match err {
            SimError::UnknownCar(guid) => ApiError::CarNotFound(guid),
            SimError::NotALocomotive(guid) => ApiError::NotControllable(guid),
            SimError::UnknownJunction(index) => ApiError::JunctionNotFound(index.to_string()),
            SimError::UnknownJob(id) => ApiError::JobNotFound(id),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}
