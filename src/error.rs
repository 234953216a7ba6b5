//! # Error Handling
//!
//! Typed errors for the three failure domains of the orchestrator:
//!
//! - [`SessionError`]: registry rejections (duplicate id, capacity, a
//!   compare-and-set status conflict, a busy session).
//! - [`UpstreamError`]: the outbound real-time transport (not connected,
//!   handshake timeout, retry budget exhausted).
//! - [`ProviderError`]: an external capability call (generation, synthesis,
//!   transcription) that failed; the pipeline degrades instead of surfacing
//!   these to the client.
//! - [`AppError`]: the HTTP surface, converted to JSON error responses via
//!   actix's `ResponseError`.

use crate::session::SessionStatus;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Rejections produced by the session registry.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// A session with this id already exists.
    Duplicate(String),

    /// No session with this id.
    NotFound(String),

    /// A compare-and-set transition found a different current status.
    /// The session is left untouched.
    Conflict {
        session_id: String,
        expected: SessionStatus,
        actual: SessionStatus,
    },

    /// The requested edge is not part of the session state machine.
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// A pipeline run is already in flight for this session. The caller may
    /// retry once the current turn completes.
    Busy(String),

    /// The concurrent session cap was reached.
    LimitReached(usize),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Duplicate(id) => write!(f, "session '{}' already exists", id),
            SessionError::NotFound(id) => write!(f, "session '{}' not found", id),
            SessionError::Conflict { session_id, expected, actual } => write!(
                f,
                "session '{}' is {}, expected {}",
                session_id,
                actual.as_str(),
                expected.as_str()
            ),
            SessionError::InvalidTransition { from, to } => {
                write!(f, "no transition from {} to {}", from.as_str(), to.as_str())
            }
            SessionError::Busy(id) => {
                write!(f, "session '{}' is still processing the previous message", id)
            }
            SessionError::LimitReached(max) => {
                write!(f, "maximum concurrent sessions ({}) reached", max)
            }
        }
    }
}

impl std::error::Error for SessionError {}

/// Failures of the outbound link to the upstream real-time AI transport.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// `send` was called while the link is down. Nothing is queued.
    NotConnected,

    /// The transport did not open within the configured window.
    Timeout(u64),

    /// The WebSocket handshake or an in-flight write failed.
    Transport(String),

    /// All reconnect attempts were spent. The link stays down until an
    /// explicit `connect` call.
    Unavailable(u32),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::NotConnected => write!(f, "upstream transport is not connected"),
            UpstreamError::Timeout(secs) => {
                write!(f, "upstream connect timed out after {}s", secs)
            }
            UpstreamError::Transport(msg) => write!(f, "upstream transport error: {}", msg),
            UpstreamError::Unavailable(attempts) => write!(
                f,
                "upstream unavailable after {} reconnect attempts",
                attempts
            ),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// A failed call to an external capability (generator, synthesizer,
/// normalizer). Carries the operation name for log correlation.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub operation: &'static str,
    pub detail: String,
}

impl ProviderError {
    pub fn new(operation: &'static str, detail: impl Into<String>) -> Self {
        Self { operation, detail: detail.into() }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.detail)
    }
}

impl std::error::Error for ProviderError {}

/// Errors surfaced through the REST endpoints.
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

/// Maps each error variant to an HTTP status and a stable machine-readable
/// type tag, mirrored in the JSON body.
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => AppError::NotFound(err.to_string()),
            SessionError::Duplicate(_) | SessionError::Busy(_) => {
                AppError::BadRequest(err.to_string())
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_display_names_both_statuses() {
        let err = SessionError::Conflict {
            session_id: "s1".to_string(),
            expected: SessionStatus::Idle,
            actual: SessionStatus::Processing,
        };
        let text = err.to_string();
        assert!(text.contains("processing"));
        assert!(text.contains("idle"));
    }

    #[test]
    fn session_not_found_maps_to_http_not_found() {
        let app: AppError = SessionError::NotFound("s1".to_string()).into();
        assert!(matches!(app, AppError::NotFound(_)));
    }
}
