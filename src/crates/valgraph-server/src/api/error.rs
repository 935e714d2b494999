//! API error types and HTTP response conversion.
//!
//! Every error body is `{"detail": ...}` where detail is a string or a
//! list of `{loc, msg, type}` field errors. Registry and runtime errors
//! map onto 400/404/409/422 by their stable kind.

use crate::registry::RegistryError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// A single field validation error
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    /// Path to the offending field
    pub loc: Vec<String>,
    /// Human-readable message
    pub msg: String,
    /// Machine-readable error type
    #[serde(rename = "type")]
    pub error_type: String,
}

/// Boundary error
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request (missing input, version mismatch)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Unknown thread, checkpoint or artifact
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already running or not suspended
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Schema validation failure
    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Validation error for a single field
    pub fn field(loc: &str, msg: impl Into<String>, error_type: &str) -> Self {
        ApiError::Validation(vec![FieldError {
            loc: loc.split('.').map(str::to_string).collect(),
            msg: msg.into(),
            error_type: error_type.to_string(),
        }])
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Validation(fields) => json!({ "detail": fields }),
            other => json!({ "detail": other.to_string() }),
        };
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        match error.kind() {
            "already_running" | "not_suspended" | "conflict" => {
                ApiError::Conflict(error.to_string())
            }
            "not_found" => ApiError::NotFound(error.to_string()),
            "validation" => ApiError::BadRequest(error.to_string()),
            _ => ApiError::Internal(error.to_string()),
        }
    }
}
