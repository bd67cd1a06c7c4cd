//! Error taxonomy for route operations and JSON error responses for the API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Result type for route operations
pub type Result<T> = std::result::Result<T, RouteError>;

/// Errors surfaced by the reconciler to its callers
#[derive(Debug, Error)]
pub enum RouteError {
    /// Malformed route id, target or metadata
    #[error("invalid route: {0}")]
    Validation(String),

    /// Remove of a route this process does not know about
    #[error("route not found: {0}")]
    NotFound(String),

    /// Version conflicts persisted through the whole retry budget
    #[error("route '{id}' could not be reconciled after {attempts} attempts (version conflict)")]
    Conflict {
        /// Route being applied or removed
        id: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Backend never became ready within the warm-up window
    #[error("target '{target}' did not become ready within {timeout:?}")]
    WarmupTimeout {
        /// Target that was probed
        target: String,
        /// Warm-up window
        timeout: Duration,
    },

    /// Remote store unreachable or failing
    #[error("routing store unavailable: {0}")]
    Unavailable(String),

    /// Caller went away or the process is shutting down
    #[error("operation cancelled")]
    Cancelled,
}

impl RouteError {
    /// Create a Validation error
    #[inline]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a NotFound error
    #[inline]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Error code used in API responses
    pub fn code(&self) -> ErrorCode {
        match self {
            RouteError::Validation(_) => ErrorCode::InvalidRoute,
            RouteError::NotFound(_) => ErrorCode::RouteNotFound,
            RouteError::Conflict { .. } => ErrorCode::VersionConflict,
            RouteError::WarmupTimeout { .. } => ErrorCode::WarmupTimeout,
            RouteError::Unavailable(_) => ErrorCode::StoreUnavailable,
            RouteError::Cancelled => ErrorCode::Cancelled,
        }
    }
}

/// Error codes for API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Route id, target or body failed validation
    InvalidRoute,
    /// Route is not registered
    RouteNotFound,
    /// Retry budget exhausted on version conflicts
    VersionConflict,
    /// Backend warm-up timed out
    WarmupTimeout,
    /// Routing store unreachable
    StoreUnavailable,
    /// Operation aborted before completion
    Cancelled,
    /// Missing or wrong API token
    Unauthorized,
    /// Verb not supported on this path
    MethodNotAllowed,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRoute => StatusCode::BAD_REQUEST,
            ErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ErrorCode::VersionConflict => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::WarmupTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Get the error code as a string for the X-Route-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRoute => "INVALID_ROUTE",
            ErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ErrorCode::VersionConflict => "VERSION_CONFLICT",
            ErrorCode::WarmupTimeout => "WARMUP_TIMEOUT",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Route-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Route-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

impl From<&RouteError> for Response<Full<Bytes>> {
    fn from(err: &RouteError) -> Self {
        json_error_response(err.code(), err.to_string())
    }
}
