//! Route handlers and router assembly.
//!
//! LM endpoints check model readiness before validating the body: a call
//! while the language model is unloaded yields 503 no matter what the
//! request contains. Validation failures return 400 without ever touching
//! the model. Generation endpoints enqueue and return a pollable job id.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::RngCore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::model::dit::{GenerationTask, TaskKind};
use crate::model::lm::{AudioInput, FormatParams, InspireParams, UnderstandParams};
use crate::model::manager::ModelManager;
use crate::queue::GenerationQueue;
use crate::server::auth::{form_token_matches, headers_authorized, require_api_key};
use crate::server::types::{
    ApiEnvelope, FormatRequest, GenerateRequest, HealthResponse, InspireRequest, JobSubmitted,
    ModelHealth, QueueHealth, UnderstandJsonRequest,
};

/// Maximum accepted request body (audio uploads included).
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<ModelManager>,
    pub queue: GenerationQueue,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
///
/// `/health` is unauthenticated. `/lm/understand` performs its own key
/// check so multipart uploads can carry the key as an `ai_token` field.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/lm/inspire", post(lm_inspire))
        .route("/lm/format", post(lm_format))
        .route("/generate", post(submit_text2music))
        .route("/cover", post(submit_cover))
        .route("/repaint", post(submit_repaint))
        .route("/jobs/{id}", get(job_status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/lm/understand", post(lm_understand))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    let (dit, lm) = state.manager.states().await;
    ApiEnvelope::ok(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        queue: QueueHealth {
            depth: state.queue.depth(),
            capacity: state.queue.capacity(),
            workers: state.config.queue_workers,
        },
        models: ModelHealth { dit, lm },
    })
}

async fn lm_inspire(
    State(state): State<AppState>,
    Json(req): Json<InspireRequest>,
) -> Result<Response> {
    if !state.manager.lm_ready().await {
        return Err(ApiError::LmNotReady);
    }

    let query = req
        .query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::validation("query is required"))?;

    let output = state
        .manager
        .lm_inspire(&InspireParams {
            query: query.to_string(),
            instrumental: req.instrumental,
            vocal_language: req.vocal_language,
            temperature: req.temperature,
            seed: req.seed,
        })
        .await?;

    Ok(ApiEnvelope::ok(output))
}

async fn lm_format(
    State(state): State<AppState>,
    Json(req): Json<FormatRequest>,
) -> Result<Response> {
    if !state.manager.lm_ready().await {
        return Err(ApiError::LmNotReady);
    }

    let caption = req
        .caption
        .or(req.prompt)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    let lyrics = req
        .lyrics
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());

    if caption.is_none() && lyrics.is_none() {
        return Err(ApiError::validation(
            "at least one of prompt, caption or lyrics is required",
        ));
    }

    let output = state
        .manager
        .lm_format(&FormatParams {
            caption,
            lyrics,
            bpm: req.bpm,
            duration: req.duration,
            key_scale: req.key_scale,
            time_signature: req.time_signature,
            language: req.language,
            temperature: req.temperature,
            seed: req.seed,
        })
        .await?;

    Ok(ApiEnvelope::ok(output))
}

async fn lm_understand(State(state): State<AppState>, request: Request) -> Result<Response> {
    let headers = request.headers().clone();
    let header_ok = headers_authorized(&state, &headers);
    let is_multipart = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);

    // Non-multipart requests can only authenticate via the header.
    if !header_ok && !is_multipart {
        return Err(ApiError::Unauthorized);
    }

    let params = if is_multipart {
        // The key may arrive as an ai_token form field, so the body has to
        // be read before the request can be rejected as unauthorized. Auth
        // still resolves before the readiness check, same as the
        // middleware-gated routes.
        let fields = read_understand_fields(&state, request).await?;
        if !header_ok && !form_token_matches(&state, fields.ai_token.as_deref()) {
            return Err(ApiError::Unauthorized);
        }
        if !state.manager.lm_ready().await {
            return Err(ApiError::LmNotReady);
        }
        spool_understand_audio(&state, fields)?
    } else {
        if !state.manager.lm_ready().await {
            return Err(ApiError::LmNotReady);
        }
        parse_understand_json(request).await?
    };

    let output = state.manager.lm_understand(&params).await;

    // Spooled uploads are only needed for the duration of the analysis.
    if let AudioInput::Spooled { path, .. } = &params.audio {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove spooled upload");
        }
    }

    Ok(ApiEnvelope::ok(output?))
}

async fn parse_understand_json(request: Request) -> Result<UnderstandParams> {
    use axum::extract::FromRequest;

    let Json(req): Json<UnderstandJsonRequest> = Json::from_request(request, &())
        .await
        .map_err(|e| ApiError::validation(format!("invalid JSON body: {e}")))?;

    let path = req
        .audio_path
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::validation("either an audio file or audio_path is required"))?;

    Ok(UnderstandParams {
        audio: AudioInput::ServerPath(path.into()),
        temperature: req.temperature,
        seed: req.seed,
    })
}

/// Raw fields of a multipart understand request, read before any auth or
/// readiness decision is made.
#[derive(Default)]
struct UnderstandFields {
    audio: Option<(String, bytes::Bytes)>,
    temperature: Option<f64>,
    seed: Option<u64>,
    ai_token: Option<String>,
}

async fn read_understand_fields(state: &AppState, request: Request) -> Result<UnderstandFields> {
    use axum::extract::FromRequest;

    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| ApiError::validation(format!("invalid multipart body: {e}")))?;

    let mut fields = UnderstandFields::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("invalid multipart field: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "audio" => {
                let name = field
                    .file_name()
                    .unwrap_or("upload.wav")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("failed to read audio field: {e}")))?;
                fields.audio = Some((name, data));
            }
            "temperature" => {
                fields.temperature = field.text().await.ok().and_then(|t| t.parse::<f64>().ok());
            }
            "seed" => {
                fields.seed = field.text().await.ok().and_then(|s| s.parse::<u64>().ok());
            }
            "ai_token" => {
                fields.ai_token = field.text().await.ok();
            }
            _ => {}
        }
    }

    Ok(fields)
}

fn spool_understand_audio(state: &AppState, fields: UnderstandFields) -> Result<UnderstandParams> {
    let (original_name, data) = fields
        .audio
        .filter(|(_, data)| !data.is_empty())
        .ok_or_else(|| ApiError::validation("either an audio file or audio_path is required"))?;

    let spool_dir = state.config.spool_dir();
    std::fs::create_dir_all(&spool_dir)?;
    let mut spooled = tempfile::Builder::new()
        .prefix("acestep_upload_")
        .tempfile_in(&spool_dir)?;
    spooled.write_all(&data)?;
    let (_, path) = spooled
        .keep()
        .map_err(|e| ApiError::internal(format!("failed to persist upload: {e}")))?;

    info!(file = %original_name, bytes = data.len(), spooled = %path.display(), "audio upload spooled");

    Ok(UnderstandParams {
        audio: AudioInput::Spooled {
            original_name,
            path,
        },
        temperature: fields.temperature,
        seed: fields.seed,
    })
}

async fn submit_text2music(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response> {
    submit(state, TaskKind::Text2Music, req).await
}

async fn submit_cover(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response> {
    submit(state, TaskKind::Cover, req).await
}

async fn submit_repaint(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response> {
    submit(state, TaskKind::Repaint, req).await
}

async fn submit(state: AppState, kind: TaskKind, req: GenerateRequest) -> Result<Response> {
    let task = build_task(kind, req)?;
    let (job_id, queue_position) = state.queue.submit(task).await?;
    Ok(ApiEnvelope::accepted(JobSubmitted {
        job_id,
        queue_position,
    }))
}

fn build_task(kind: TaskKind, req: GenerateRequest) -> Result<GenerationTask> {
    let caption = req
        .caption
        .or(req.prompt)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    let lyrics = req
        .lyrics
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());

    if kind == TaskKind::Text2Music && caption.is_none() && lyrics.is_none() {
        return Err(ApiError::validation(
            "at least one of caption, prompt or lyrics is required",
        ));
    }

    let source_audio = req
        .audio_path
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .map(std::path::PathBuf::from);

    if matches!(kind, TaskKind::Cover | TaskKind::Repaint) && source_audio.is_none() {
        return Err(ApiError::validation("audio_path is required"));
    }

    let repaint_window = match (req.repaint_start, req.repaint_end) {
        (Some(start), Some(end)) => Some((start, end)),
        (None, None) => None,
        _ => {
            return Err(ApiError::validation(
                "repaint_start and repaint_end must be given together",
            ))
        }
    };

    if kind == TaskKind::Repaint {
        match repaint_window {
            Some((start, end)) if start >= 0.0 && end > start => {}
            _ => {
                return Err(ApiError::validation(
                    "repaint requires repaint_start and repaint_end with 0 <= start < end",
                ))
            }
        }
    }

    Ok(GenerationTask {
        kind,
        caption: caption.unwrap_or_default(),
        lyrics: lyrics.unwrap_or_else(|| "[inst]".to_string()),
        duration: req.duration.unwrap_or(120),
        bpm: req.bpm,
        seed: req.seed.unwrap_or_else(|| rand::thread_rng().next_u64()),
        source_audio,
        repaint_window,
    })
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response> {
    match state.queue.status(&job_id).await {
        Some(snapshot) => Ok(ApiEnvelope::ok(snapshot)),
        None => Err(ApiError::NotFound(format!("job {job_id}"))),
    }
}
