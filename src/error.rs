//! Error taxonomy for the API server.
//!
//! Request-scoped errors render as the standard response envelope
//! `{"code": N, "data": null, "error": "..."}` with a matching HTTP status.
//! Accelerator exhaustion is not recoverable in-process: it is logged at
//! error level and reported as a 500 so the operator can reconfigure
//! (smaller model, offload flags, `ACESTEP_INIT_LLM=false`) and restart.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result type alias using [`ApiError`].
pub type Result<T> = std::result::Result<T, ApiError>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Missing or malformed request fields.
    #[error("{0}")]
    Validation(String),

    /// Missing or incorrect API key.
    #[error("unauthorized: invalid or missing API key")]
    Unauthorized,

    /// Unknown job id or path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Generation queue is full.
    #[error("queue is full ({capacity} pending requests), retry later")]
    Capacity { capacity: usize },

    /// Language model endpoints called while the LM is not initialized.
    #[error("language model is not initialized (set ACESTEP_INIT_LLM=true)")]
    LmNotReady,

    /// Accelerator out-of-memory during load or generation.
    #[error("accelerator out of memory: {0}")]
    ResourceExhausted(String),

    /// Invalid configuration at startup.
    #[error("config: {0}")]
    Config(String),

    /// Everything else.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error (audio spooling, model paths).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// HTTP status code this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Capacity { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::LmNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ResourceExhausted(_)
            | ApiError::Config(_)
            | ApiError::Internal(_)
            | ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        ApiError::Internal(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if matches!(self, ApiError::ResourceExhausted(_)) {
            tracing::error!(error = %self, "accelerator exhausted, reconfigure and restart");
        }

        let body = json!({
            "code": status.as_u16(),
            "data": null,
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::validation("missing query").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::LmNotReady.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Capacity { capacity: 200 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
