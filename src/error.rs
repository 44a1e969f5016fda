//! Error types for Driftwood
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//! The federation subsystems carry their own taxonomies
//! (`ResolutionError`, `VerificationError`, `ProcessingError`,
//! `DeliveryError`) so callers can distinguish failure classes before
//! the boundary flattens them into an HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Identifier-to-actor resolution failures.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The identifier does not resolve to any actor.
    #[error("actor not found: {0}")]
    NotFound(String),

    /// The remote host could not be reached (network, timeout, non-2xx).
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// The remote returned a document we could not interpret.
    #[error("malformed remote document: {0}")]
    MalformedDocument(String),
}

/// Inbound HTTP signature verification failures.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// No Signature header on the request.
    #[error("request is unsigned")]
    Unsigned,

    /// The claimed signer could not be resolved to a public key.
    #[error("signing actor unresolvable: {0}")]
    ActorUnresolvable(#[from] ResolutionError),

    /// Cryptographic verification failed, including after a key refresh.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Date header outside the clock-skew tolerance window.
    #[error("stale signature timestamp")]
    StaleTimestamp,

    /// Digest header does not match a hash of the body.
    #[error("body digest mismatch")]
    DigestMismatch,
}

/// Inbox activity processing failures.
///
/// These are recorded and acknowledged with 2xx at the HTTP boundary;
/// peers must not retry permanently-unprocessable input.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Activity type we do not handle.
    #[error("unsupported activity type: {0}")]
    UnsupportedType(String),

    /// Activity is missing required fields or has the wrong shape.
    #[error("malformed activity: {0}")]
    MalformedActivity(String),

    /// The activity targets an object that does not belong to this server.
    #[error("target object is not local: {0}")]
    TargetNotLocal(String),
}

/// Outbound delivery failures, per task.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Network error or timeout; the task is rescheduled.
    #[error("transient delivery failure: {0}")]
    TransientNetwork(String),

    /// The recipient rejected the request with a non-2xx status.
    #[error("delivery rejected: HTTP {0}")]
    PermanentRejection(u16),

    /// The task ran out of attempts and is terminal.
    #[error("delivery retries exhausted after {0} attempts")]
    ExhaustedRetries(u32),
}

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Identifier resolution failed (see `ResolutionError`)
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    /// Signature verification failed (401)
    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    /// Inbox processing failed (recorded, acknowledged 2xx by the handler)
    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    /// Outbound delivery failed (retried per-task, never user-visible)
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), "unauthorized"),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string(), "forbidden"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::Verification(VerificationError::ActorUnresolvable(_)) => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "actor_unresolvable",
            ),
            AppError::Verification(_) => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "invalid_signature",
            ),
            AppError::Resolution(ResolutionError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, self.to_string(), "resolution")
            }
            AppError::Resolution(_) => (StatusCode::BAD_GATEWAY, self.to_string(), "resolution"),
            // Processing errors that reach the boundary unhandled are
            // client errors; the inbox handler normally records and
            // acknowledges them before this mapping applies.
            AppError::Processing(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string(), "processing")
            }
            AppError::Delivery(_) => (StatusCode::BAD_GATEWAY, self.to_string(), "delivery"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string(), "http_client"),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
