//! Error taxonomy for the Platform client (spec §4.6, values not names).

use thiserror::Error;

use crate::error::AppError;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("secondary rate limited, retry after {retry_after_secs}s")]
    SecondaryRateLimited { retry_after_secs: u64 },
    #[error("circuit breaker open")]
    CircuitBreakerOpen,
    #[error("request queue full")]
    QueueFull,
    #[error("artifact url expired")]
    ArtifactExpired,
    #[error("permission denied")]
    PermissionDenied,
    #[error("not found")]
    NotFound,
    #[error("unprocessable request: {0}")]
    Unprocessable(String),
    #[error("upstream service unavailable")]
    ServiceUnavailable,
    #[error("request timed out")]
    Timeout,
    #[error("webhook verification failed")]
    WebhookVerificationFailed,
    #[error("unknown platform error: {0}")]
    Unknown(String),
}

impl PlatformError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimited { .. }
                | PlatformError::SecondaryRateLimited { .. }
                | PlatformError::ServiceUnavailable
                | PlatformError::Timeout
        )
    }

    /// Map an HTTP status code (and optional `retry-after`/abuse hint) from
    /// a Platform response into the client's own error taxonomy.
    pub fn from_status(status: u16, retry_after_secs: Option<u64>, is_secondary_abuse: bool) -> Option<Self> {
        match status {
            200..=299 => None,
            403 if is_secondary_abuse => {
                Some(PlatformError::SecondaryRateLimited { retry_after_secs: retry_after_secs.unwrap_or(60) })
            }
            403 => Some(PlatformError::PermissionDenied),
            404 => Some(PlatformError::NotFound),
            408 => Some(PlatformError::Timeout),
            410 => Some(PlatformError::ArtifactExpired),
            422 => Some(PlatformError::Unprocessable("validation failed".into())),
            429 => Some(PlatformError::RateLimited { retry_after_secs: retry_after_secs.unwrap_or(60) }),
            500..=504 => Some(PlatformError::ServiceUnavailable),
            other => Some(PlatformError::Unknown(format!("unexpected status {other}"))),
        }
    }
}

impl From<PlatformError> for AppError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::RateLimited { retry_after_secs }
            | PlatformError::SecondaryRateLimited { retry_after_secs } => {
                AppError::RateLimited { retry_after_secs }
            }
            PlatformError::CircuitBreakerOpen => AppError::CircuitOpen,
            PlatformError::QueueFull => AppError::QueueFull,
            PlatformError::ArtifactExpired => AppError::ArtifactExpired,
            PlatformError::PermissionDenied => AppError::PermissionDenied,
            PlatformError::NotFound => AppError::NotFound,
            PlatformError::ServiceUnavailable => AppError::ServiceUnavailable,
            PlatformError::Timeout => AppError::Timeout,
            PlatformError::WebhookVerificationFailed => AppError::SignatureInvalid,
            PlatformError::Unprocessable(msg) => AppError::ValidationError(msg),
            PlatformError::Unknown(msg) => AppError::Internal(msg),
        }
    }
}
