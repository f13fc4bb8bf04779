//! # Error Handling Module
//!
//! All failures surfaced by the gateway flow through [`GatewayError`], built with
//! `thiserror`. Each variant maps onto the HTTP status returned to the client and a
//! stable `type` key used in the JSON error body.
//!
//! ## Failure classes
//! - **Configuration**: rejected at deployment time, the API is not activated
//! - **Condition evaluation**: never reaches the client, the candidate is dropped
//! - **No endpoint**: the selected group is empty, answered with 503
//! - **Protocol misuse**: a write attempted on a synthetic connection
//! - **Timeout**: whole-request deadline exceeded, answered with 504

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Invalid configuration or API definition (bad selector, unknown group, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No deployed API accepts the request path
    #[error("No API deployed for path: {path}")]
    ApiNotFound { path: String },

    /// The API declares plans but none of them accepted the request
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// A flow step interrupted the request with an explicit status
    #[error("Request interrupted ({status}): {message}")]
    Interrupted { status: u16, message: String },

    /// The endpoint group has no available member
    #[error("No endpoint available in group: {group}")]
    NoEndpoint { group: String },

    /// Upstream endpoint could not be reached or failed mid-exchange
    #[error("Service unavailable: {service} - {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// A body exceeded the configured size while being buffered
    #[error("Body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// Request timeout errors
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A condition expression could not be compiled or evaluated
    #[error("Condition evaluation failed for '{expression}': {message}")]
    ConditionEvaluation { expression: String, message: String },

    /// An operation was attempted that the connection does not support
    #[error("Protocol misuse: {message}")]
    ProtocolMisuse { message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, body streams, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors when talking to upstream endpoints
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn api_not_found<S: Into<String>>(path: S) -> Self {
        Self::ApiNotFound { path: path.into() }
    }

    pub fn unauthorized<S: Into<String>>(reason: S) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Create an interruption raised by a flow step
    pub fn interrupted<S: Into<String>>(status: u16, message: S) -> Self {
        Self::Interrupted {
            status,
            message: message.into(),
        }
    }

    /// Create an error for an endpoint group with nothing to select
    pub fn no_endpoint<S: Into<String>>(group: S) -> Self {
        Self::NoEndpoint {
            group: group.into(),
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable<S: Into<String>, R: Into<String>>(service: S, reason: R) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create a condition evaluation error
    pub fn condition<E: Into<String>, M: Into<String>>(expression: E, message: M) -> Self {
        Self::ConditionEvaluation {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn protocol_misuse<S: Into<String>>(message: S) -> Self {
        Self::ProtocolMisuse {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code returned to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ApiNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Interrupted { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::NoEndpoint { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. }
            | Self::ConditionEvaluation { .. }
            | Self::ProtocolMisuse { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Json { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::ApiNotFound { .. } => "api_not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Interrupted { .. } => "request_interrupted",
            Self::NoEndpoint { .. } => "no_endpoint_available",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::Timeout { .. } => "request_timeout",
            Self::ConditionEvaluation { .. } => "condition_evaluation_error",
            Self::ProtocolMisuse { .. } => "protocol_misuse",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }

    /// Whether the message can be shown to the client as-is
    fn is_client_facing(&self) -> bool {
        matches!(
            self,
            Self::ApiNotFound { .. }
                | Self::Unauthorized { .. }
                | Self::Interrupted { .. }
                | Self::NoEndpoint { .. }
                | Self::BodyTooLarge { .. }
                | Self::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::service_unavailable(
                err.url().map(|u| u.to_string()).unwrap_or_default(),
                "upstream timed out",
            );
        }
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl From<tera::Error> for GatewayError {
    fn from(err: tera::Error) -> Self {
        // tera nests the useful part in the source chain
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(inner) = source {
            message = format!("{}: {}", message, inner);
            source = inner.source();
        }
        Self::ConditionEvaluation {
            expression: String::new(),
            message,
        }
    }
}

/// Converts errors into the JSON error body returned to clients.
///
/// Internal details are replaced by the canonical reason phrase so upstream
/// addresses or file paths never leak.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_json())).into_response()
    }
}

impl GatewayError {
    /// JSON error body sent to clients
    pub fn to_json(&self) -> serde_json::Value {
        let status = self.status_code();
        let message = if self.is_client_facing() {
            self.to_string()
        } else {
            status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string()
        };

        json!({
            "error": {
                "code": status.as_u16(),
                "message": message,
                "type": self.error_type(),
            }
        })
    }
}
