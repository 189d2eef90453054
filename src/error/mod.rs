//! Error types for the security gateway

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::config::Environment;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Message shown instead of the real error in production
pub const REDACTED_MESSAGE: &str = "An error occurred";

/// Main error type for the security gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Origin not allowed")]
    OriginNotAllowed(String),

    #[error("{0}")]
    RateLimit(#[from] crate::middleware::RateLimitError),

    #[error("{0}")]
    Csrf(crate::middleware::CsrfError),

    #[error("{0}")]
    Auth(#[from] crate::middleware::AuthError),

    #[error("{0}")]
    Validation(#[from] crate::middleware::ValidationError),

    #[error("Request body too large: {size} bytes (max: {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad classes of failure, used for logging and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Origin, CSRF, auth or rate limit; the client can retry correctly
    SecurityRejection,
    /// Malformed input; the client can correct it
    ValidationFailure,
    /// Anything else
    Unexpected,
}

impl GatewayError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::OriginNotAllowed(_)
            | GatewayError::RateLimit(_)
            | GatewayError::Csrf(_)
            | GatewayError::Auth(_) => ErrorKind::SecurityRejection,
            GatewayError::Validation(_) | GatewayError::PayloadTooLarge { .. } => {
                ErrorKind::ValidationFailure
            }
            GatewayError::Config(_) | GatewayError::Internal(_) => ErrorKind::Unexpected,
        }
    }

    /// HTTP status for the rejection
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::OriginNotAllowed(_) | GatewayError::Csrf(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short label used for metrics and logs
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::OriginNotAllowed(_) => "origin",
            GatewayError::RateLimit(_) => "rate_limit",
            GatewayError::Csrf(_) => "csrf",
            GatewayError::Auth(_) => "auth",
            GatewayError::Validation(_) | GatewayError::PayloadTooLarge { .. } => "validation",
            GatewayError::Config(_) | GatewayError::Internal(_) => "internal",
        }
    }

    /// Convert into a JSON error response, redacting the message in production
    pub fn to_response(&self, environment: Environment) -> Response {
        let body = ErrorBody::new(self, environment);

        match self.kind() {
            ErrorKind::Unexpected => error!(
                error_id = %body.error_id,
                timestamp = %body.timestamp,
                reason = self.reason(),
                "Unexpected error: {}", self
            ),
            _ => warn!(
                error_id = %body.error_id,
                timestamp = %body.timestamp,
                reason = self.reason(),
                "Security violation: {}", self
            ),
        }

        let mut response = (self.status_code(), Json(body)).into_response();
        if let GatewayError::RateLimit(crate::middleware::RateLimitError::LimitExceeded {
            retry_after,
            ..
        }) = self
        {
            // Round up so clients never retry inside the window
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.to_response(Environment::Production)
    }
}

/// JSON body for every rejection: `{ error, errorId, timestamp }`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub error_id: String,
    pub timestamp: String,
}

impl ErrorBody {
    /// Build a body with a fresh correlation id
    pub fn new(err: &GatewayError, environment: Environment) -> Self {
        let error = match environment {
            Environment::Production => REDACTED_MESSAGE.to_string(),
            Environment::Development => err.to_string(),
        };

        Self {
            error,
            error_id: correlation_id(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Random short id tying a response to its log line
fn correlation_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

impl From<crate::middleware::CsrfError> for GatewayError {
    fn from(err: crate::middleware::CsrfError) -> Self {
        match err {
            crate::middleware::CsrfError::Secret(msg) => {
                GatewayError::Internal(format!("CSRF signing failed: {}", msg))
            }
            other => GatewayError::Csrf(other),
        }
    }
}

impl From<crate::middleware::CorsError> for GatewayError {
    fn from(err: crate::middleware::CorsError) -> Self {
        match err {
            crate::middleware::CorsError::OriginNotAllowed(origin) => {
                GatewayError::OriginNotAllowed(origin)
            }
            other => GatewayError::Config(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}
