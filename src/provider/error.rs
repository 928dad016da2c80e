//! Provider error taxonomy.
//!
//! Everything that talks to the telematics API returns `ApiError` so the
//! retry executor and the workers can classify failures without string
//! matching on status codes.

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// Connection reset, DNS, timeout, body read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// 429. `retry_after` is the provider's wait hint when one was sent.
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// 401 on a data call. Handled by the token layer before it reaches retry.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Any other non-success status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// No usable token could be obtained (refresh and login both failed).
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<ApiError> },

    #[error("rate limit not cleared after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },
}

impl ApiError {
    /// Network failures, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::RateLimited { .. } => true,
            ApiError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Errors that mean no call can succeed until credentials are fixed.
    pub fn is_fatal_auth(&self) -> bool {
        match self {
            ApiError::Authentication(_) => true,
            ApiError::Exhausted { last, .. } => last.is_fatal_auth(),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::RateLimited { .. } => Some(429),
            ApiError::Unauthorized(_) => Some(401),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ApiError::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Decode(e.to_string())
    }
}

/// Longest wait honoured from a `retry-after` hint.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Parse a `retry-after` header value given in seconds, capped at
/// `MAX_RETRY_AFTER`.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::from_secs_f64(secs.min(MAX_RETRY_AFTER.as_secs_f64())))
}
