// src/error.rs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::engine::error::EngineError;

/// Global Application Error Enum.
/// Centralizes error handling and mapping to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    // 500 Internal Server Error
    InternalServerError(String),

    // 400 Bad Request
    BadRequest(String),

    // 401 Unauthorized
    AuthError(String),

    // 403 Forbidden (role, network allow-list, expired time window)
    Forbidden(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict (wrong instance state, another active instance, full term)
    Conflict(String),

    // 422 Unprocessable Entity (template cannot be satisfied from the pool)
    UnprocessableEntity(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for AppError {}

/// Implements `IntoResponse` for `AppError`.
/// Converts the error into a JSON response with appropriate HTTP status code.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InternalServerError(msg) => {
                tracing::error!("Internal Server Error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::AuthError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::UnprocessableEntity(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
        };
        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Converts `sqlx::Error` into `AppError::InternalServerError`.
/// Allows using `?` operator on database queries.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::InternalServerError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

/// Maps the engine taxonomy onto HTTP statuses.
///
/// * constraint-infeasible -> 422
/// * state-conflict -> 409
/// * access / time / network denied -> 403
/// * malformed input -> 400
impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::InvalidTemplate(_)
            | EngineError::InsufficientPool { .. }
            | EngineError::NotEnoughAnswers { .. }
            | EngineError::GenerationFailed { .. } => AppError::UnprocessableEntity(message),
            EngineError::InvalidState { .. }
            | EngineError::NotOnline
            | EngineError::AnotherInstanceActive
            | EngineError::NoAttemptsLeft { .. }
            | EngineError::CannotEvaluateActive => AppError::Conflict(message),
            EngineError::TimeExpired
            | EngineError::NetworkDenied { .. }
            | EngineError::NotJoined { .. }
            | EngineError::NotOwner => AppError::Forbidden(message),
            EngineError::UnknownQuestion(_)
            | EngineError::UnknownAnswer(_)
            | EngineError::InvalidPercentage(_)
            | EngineError::ReviewNotAllowed => AppError::BadRequest(message),
        }
    }
}
