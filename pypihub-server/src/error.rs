//! # Error Handling and Response Types
//!
//! Every fallible operation in the index engine returns [`AppResult`]. The
//! variants of [`AppError`] follow the engine's failure taxonomy:
//!
//! - **Upstream** (502): upstream unreachable, non-success or unparseable.
//!   Recoverable; the cache manager falls back to stale data where it can.
//! - **NotFound** (404): no such package or artifact in any source.
//! - **Conflict** (409): an upload collided with an existing artifact.
//! - **InvalidInput** (400): malformed names or paths, rejected before storage
//!   is touched.
//! - **Internal** (500): I/O and other server-side failures.
//!
//! The HTTP layer renders errors as:
//!
//! ```json
//! {
//!   "error": "Human-readable error message",
//!   "code": "machine_readable_error_code",
//!   "details": null,
//!   "timestamp": "2024-01-01T12:00:00Z"
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::validation::ValidationError;

/// Standardized error response structure for consistent API error handling
#[derive(Serialize, Debug)]
pub struct ApiErrorResponse {
    pub error: String,          // Human-readable error message
    pub code: String,           // Machine-readable error code
    pub details: Option<Value>, // Additional error details
    pub timestamp: String,      // ISO 8601 timestamp
}

/// Error code classification for machine-readable error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationError, // Malformed names, filenames or uploads
    NotFound,        // Missing packages or artifacts
    Conflict,        // Artifact already exists
    UpstreamError,   // Upstream index unreachable or unusable
    InternalError,   // Server-side failures
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::UpstreamError => "upstream_error",
            ErrorCode::InternalError => "internal_error",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Application-specific error types with error codes
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Multipart form parsing error: {0}")]
    Multipart(#[from] axum::extract::multipart::MultipartError),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

impl AppError {
    /// Get the appropriate error code for this error type
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AppError::InvalidInput(_) | AppError::Multipart(_) => ErrorCode::ValidationError,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::Conflict(_) => ErrorCode::Conflict,
            AppError::Upstream(_) => ErrorCode::UpstreamError,
            AppError::Io(_) | AppError::Json(_) | AppError::InternalError(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// Rebuild an error observed through a shared in-flight operation.
    ///
    /// Each waiter gets its own owned error of the same kind. Ambient failures
    /// that cannot be cloned collapse into [`AppError::InternalError`] with the
    /// original message.
    pub fn from_shared(err: &AppError) -> Self {
        match err {
            AppError::Upstream(msg) => AppError::Upstream(msg.clone()),
            AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
            AppError::Conflict(msg) => AppError::Conflict(msg.clone()),
            AppError::InvalidInput(msg) => AppError::InvalidInput(msg.clone()),
            AppError::InternalError(msg) => AppError::InternalError(msg.clone()),
            other => AppError::InternalError(other.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    /// Get additional error details if available
    pub fn details(&self) -> Option<Value> {
        match self {
            AppError::Io(e) => Some(json!({ "kind": e.kind().to_string() })),
            _ => None,
        }
    }

    /// Create a standardized error response
    pub fn to_error_response(&self) -> ApiErrorResponse {
        let code = self.error_code();
        ApiErrorResponse {
            error: self.to_string(),
            code: code.as_str().to_string(),
            details: self.details(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let status = code.http_status();

        if code == ErrorCode::InternalError {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::warn!(error = %self, code = code.as_str(), "Request rejected");
        }

        let error_response = self.to_error_response();
        tracing::debug!(status = %status, code = %error_response.code, "Returning standardized error response");

        (status, axum::Json(error_response)).into_response()
    }
}

/// Convenient result type for application operations.
pub type AppResult<T> = Result<T, AppError>;
