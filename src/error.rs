//! # Error Handling
//!
//! This module defines the error types used across the voice backend and how
//! they're converted to HTTP responses on the REST surface.
//!
//! ## Error Categories:
//! - **ConfigurationMissing**: the upstream credential is absent at boot — the
//!   relay refuses every upgrade with a server error instead of failing mid-call
//! - **UpstreamUnavailable**: the upstream voice service handshake or socket
//!   failed — the session is torn down and the client is notified
//! - **DeviceUnavailable**: an audio capture/playback device could not be
//!   acquired — the call never begins
//! - **MalformedEnvelope**: a payload failed to parse as the expected message
//!   structure — logged and dropped, never fatal for the session
//! - **BadRequest / Internal**: the conventional HTTP 400/500 buckets
//!
//! ## Why custom errors:
//! Each failure class has a distinct blast radius (reject one handshake, tear
//! down one session, drop one message), so the type makes the handling
//! decision explicit at every call site instead of collapsing everything into
//! a string.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Error type covering the relay, the audio pipelines, and the HTTP surface.
///
/// ## Usage Example:
/// ```rust
/// use neuro_voice_backend::error::AppError;
/// fn check(key: &str) -> Result<(), AppError> {
///     if key.is_empty() {
///         return Err(AppError::ConfigurationMissing("upstream api key".to_string()));
///     }
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Upstream credential (or other required configuration) absent at startup
    ConfigurationMissing(String),

    /// Upstream voice-service handshake or mid-call socket failure
    UpstreamUnavailable(String),

    /// Audio input/output device could not be acquired or started
    DeviceUnavailable(String),

    /// Received payload does not parse as the expected envelope structure
    MalformedEnvelope(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Internal server errors (lock poisoning, I/O failures, etc.)
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ConfigurationMissing(msg) => write!(f, "Configuration missing: {}", msg),
            AppError::UpstreamUnavailable(msg) => write!(f, "Upstream unavailable: {}", msg),
            AppError::DeviceUnavailable(msg) => write!(f, "Audio device unavailable: {}", msg),
            AppError::MalformedEnvelope(msg) => write!(f, "Malformed envelope: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Conversion of errors into HTTP responses for the REST endpoints.
///
/// ## HTTP Status Code Mapping:
/// - ConfigurationMissing/Internal → 500 (Internal Server Error)
/// - UpstreamUnavailable → 502 (Bad Gateway)
/// - DeviceUnavailable → 503 (Service Unavailable)
/// - MalformedEnvelope/BadRequest → 400 (Bad Request)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "upstream_unavailable",
///     "message": "connection refused",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::ConfigurationMissing(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_missing",
                msg.clone(),
            ),
            AppError::UpstreamUnavailable(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                msg.clone(),
            ),
            AppError::DeviceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "device_unavailable",
                msg.clone(),
            ),
            AppError::MalformedEnvelope(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "malformed_envelope",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
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

/// JSON parse failures are envelope problems, not server faults: the session
/// logs and drops the offending payload rather than terminating.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::MalformedEnvelope(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Internal(format!("configuration: {}", err))
    }
}

/// Upstream socket errors (connect, TLS, protocol) all collapse into the
/// retryable-from-the-user's-side `UpstreamUnavailable` class.
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::UpstreamUnavailable(err.to_string())
    }
}

/// Type alias for Results that use our error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_category_and_message() {
        let err = AppError::UpstreamUnavailable("connection refused".to_string());
        let rendered = err.to_string();
        assert!(rendered.contains("Upstream unavailable"));
        assert!(rendered.contains("connection refused"));
    }

    #[test]
    fn test_status_code_mapping() {
        use actix_web::http::StatusCode;

        let cases = [
            (AppError::ConfigurationMissing("k".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (AppError::UpstreamUnavailable("u".into()), StatusCode::BAD_GATEWAY),
            (AppError::DeviceUnavailable("d".into()), StatusCode::SERVICE_UNAVAILABLE),
            (AppError::MalformedEnvelope("m".into()), StatusCode::BAD_REQUEST),
            (AppError::BadRequest("b".into()), StatusCode::BAD_REQUEST),
            (AppError::Internal("i".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(err.error_response().status(), expected, "wrong status for {:?}", err);
        }
    }

    #[test]
    fn test_json_parse_errors_become_malformed_envelope() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: AppError = parse_err.into();
        assert!(matches!(err, AppError::MalformedEnvelope(_)));
    }
}
