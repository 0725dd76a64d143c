use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

/// Crate-wide error taxonomy (spec §7). Every subsystem-local error type
/// (`ParserError`, `PlatformError`, `PolicyError`, ...) converts into this
/// one at the boundary where it meets a job runner or an HTTP handler.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("platform request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid webhook signature")]
    SignatureInvalid,
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("circuit breaker open")]
    CircuitOpen,
    #[error("request queue full")]
    QueueFull,
    #[error("artifact url expired")]
    ArtifactExpired,
    #[error("permission denied")]
    PermissionDenied,
    #[error("not found")]
    NotFound,
    #[error("upstream service unavailable")]
    ServiceUnavailable,
    #[error("request timed out")]
    Timeout,
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True when the job runner should release the job for broker-managed
    /// retry rather than dead-lettering or completing it (spec §7).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::RateLimited { .. }
                | AppError::ServiceUnavailable
                | AppError::Timeout
                | AppError::CircuitOpen
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::SignatureInvalid => StatusCode::UNAUTHORIZED,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::PermissionDenied => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::QueueFull | AppError::CircuitOpen | AppError::ServiceUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::ArtifactExpired => StatusCode::GONE,
            AppError::Db(_) | AppError::Http(_) | AppError::ParseError(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        tracing::error!(error = %self, "request failed");
        let body: Value = json!({ "success": false, "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
