//! Wire types for the HTTP API.
//!
//! Every response uses the envelope `{"code": N, "data": ..., "error": ...}`
//! with the HTTP status mirrored in `code`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::model::manager::ModelState;
use crate::queue::JobSnapshot;

/// Standard response envelope.
#[derive(Debug, Serialize)]
pub struct ApiEnvelope<T: Serialize> {
    pub code: u16,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiEnvelope<T> {
    pub fn ok(data: T) -> Response {
        Self::with_status(StatusCode::OK, data)
    }

    pub fn accepted(data: T) -> Response {
        Self::with_status(StatusCode::ACCEPTED, data)
    }

    fn with_status(status: StatusCode, data: T) -> Response {
        let envelope = ApiEnvelope {
            code: status.as_u16(),
            data: Some(data),
            error: None,
        };
        (status, Json(envelope)).into_response()
    }
}

/// Body for `POST /lm/inspire`.
#[derive(Debug, Default, Deserialize)]
pub struct InspireRequest {
    pub query: Option<String>,
    #[serde(default)]
    pub instrumental: bool,
    pub vocal_language: Option<String>,
    pub temperature: Option<f64>,
    pub seed: Option<u64>,
}

/// Body for `POST /lm/format`. `prompt` and `caption` are aliases; at
/// least one of prompt/caption/lyrics must be present.
#[derive(Debug, Default, Deserialize)]
pub struct FormatRequest {
    pub prompt: Option<String>,
    pub caption: Option<String>,
    pub lyrics: Option<String>,
    pub bpm: Option<u32>,
    pub duration: Option<u32>,
    pub key_scale: Option<String>,
    pub time_signature: Option<String>,
    pub language: Option<String>,
    pub temperature: Option<f64>,
    pub seed: Option<u64>,
}

/// JSON body for `POST /lm/understand` (the multipart variant carries an
/// `audio` file field instead).
#[derive(Debug, Default, Deserialize)]
pub struct UnderstandJsonRequest {
    pub audio_path: Option<String>,
    pub temperature: Option<f64>,
    pub seed: Option<u64>,
}

/// Body for the generation submission endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    pub caption: Option<String>,
    pub prompt: Option<String>,
    pub lyrics: Option<String>,
    pub duration: Option<u32>,
    pub bpm: Option<u32>,
    pub seed: Option<u64>,
    /// Source track for cover and repaint.
    pub audio_path: Option<String>,
    /// Repaint window in seconds.
    pub repaint_start: Option<f64>,
    pub repaint_end: Option<f64>,
}

/// Response for an accepted generation submission.
#[derive(Debug, Serialize)]
pub struct JobSubmitted {
    pub job_id: String,
    pub queue_position: usize,
}

/// Response for `GET /jobs/{id}`.
pub type JobStatusResponse = JobSnapshot;

/// Response for `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub queue: QueueHealth,
    pub models: ModelHealth,
}

#[derive(Debug, Serialize)]
pub struct QueueHealth {
    pub depth: usize,
    pub capacity: usize,
    pub workers: usize,
}

#[derive(Debug, Serialize)]
pub struct ModelHealth {
    pub dit: ModelState,
    pub lm: ModelState,
}
