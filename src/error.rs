//! Request-level error type.
//!
//! Handlers and middleware return `Result<T, ApiError>`; the
//! [`IntoResponse`] impl turns every variant into a JSON body of the form
//! `{"error": "..."}` with the matching status code.
//!
//! Operator-facing detail (upstream credential problems, internal faults) is
//! logged here and replaced by a generic message in the response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::llm::LlmError;

/// One violated field of a request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing, malformed or unverifiable credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The credential was valid once but has expired.
    #[error("token expired")]
    TokenExpired,

    /// Authenticated, but the account may not use the service.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Field-level validation failures, all of them.
    #[error("validation failed on {} field(s)", .0.len())]
    Validation(Vec<FieldError>),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A failure reported by the LLM provider.
    #[error(transparent)]
    Upstream(#[from] LlmError),

    /// An unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Status and caller-facing message for an upstream LLM failure.
pub fn upstream_status(err: &LlmError) -> (StatusCode, String) {
    match err {
        LlmError::RateLimited => (
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded. Please try again later.".to_string(),
        ),
        LlmError::Unauthorized { status } => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::UNAUTHORIZED),
            "Invalid API key configuration".to_string(),
        ),
        LlmError::Provider { status, message } => (
            status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message.clone(),
        ),
        LlmError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            "Upstream request timed out".to_string(),
        ),
        LlmError::Malformed(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Upstream returned an unreadable response".to_string(),
        ),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, json!({ "error": m })),
            ApiError::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": "Token expired. Please login again.",
                    "reason": "token_expired",
                }),
            ),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, json!({ "error": m })),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, json!({ "error": m })),
            ApiError::Validation(fields) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Validation failed", "details": fields }),
            ),
            ApiError::PayloadTooLarge(m) => {
                (StatusCode::PAYLOAD_TOO_LARGE, json!({ "error": m }))
            }
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, json!({ "error": m })),
            ApiError::Upstream(e) => {
                if matches!(e, LlmError::Unauthorized { .. } | LlmError::Malformed(_)) {
                    error!(error = %e, "LLM provider fault");
                }
                let (status, message) = upstream_status(e);
                (status, json!({ "error": message }))
            }
            ApiError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
