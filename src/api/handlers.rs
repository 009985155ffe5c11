//! API request handlers

use super::models::{
    AudioQuery, CompletionChoice, CompletionRequest, CompletionResponse, DashboardStatus,
    HealthResponse, LoadRequest, RegistryStatus, TokenStatus, TokenUpdate, Usage,
};
use super::routes::AppState;
use crate::error::{ApiError, RegistryError};
use crate::models::{InferInput, ManagedModel, ModelTask, list_cached_models};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde_json::{Value, json};
use std::sync::Arc;

/// System prompt wrapped around plain-text completion prompts
const COMPLETION_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// GET /health - Gateway health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /api/admin/status - GPUs, host utilization and every model slot
pub async fn get_status(State(state): State<AppState>) -> Result<Json<DashboardStatus>, ApiError> {
    let detect = state.gpu_detector.clone();
    let gpus = tokio::task::spawn_blocking(move || detect())
        .await
        .map_err(|e| ApiError::Internal(format!("GPU detection failed: {}", e)))?;

    let system_sampler = state.system_sampler.clone();
    let system = tokio::task::spawn_blocking(move || system_sampler())
        .await
        .unwrap_or_default();

    let cache_dir = state.registry.cache_dir().await;
    let cached_models = tokio::task::spawn_blocking(move || list_cached_models(&cache_dir))
        .await
        .unwrap_or_default();

    Ok(Json(DashboardStatus {
        gpus: gpus.devices,
        system,
        models: state.registry.status().await,
        cached_models,
        timestamp: chrono::Utc::now(),
    }))
}

/// POST /api/admin/models/{key}/load - Load a model, optionally onto specific GPUs
pub async fn load_model(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<Json<RegistryStatus>, ApiError> {
    let request = parse_load_request(&body)?;

    tracing::info!(
        model = %key,
        gpu_device_ids = ?request.gpu_device_ids,
        "Load requested"
    );

    state
        .registry
        .ensure_loaded(&key, request.gpu_device_ids.as_deref())
        .await?;

    Ok(Json(RegistryStatus {
        models: state.registry.status().await,
    }))
}

/// POST /api/admin/models/{key}/download - Fetch artifacts without loading
pub async fn download_model(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<RegistryStatus>, ApiError> {
    tracing::info!(model = %key, "Download requested");

    state.registry.ensure_downloaded(&key).await?;

    Ok(Json(RegistryStatus {
        models: state.registry.status().await,
    }))
}

/// POST /api/admin/models/{key}/unload - Release a model's runtime
pub async fn unload_model(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<RegistryStatus>, ApiError> {
    tracing::info!(model = %key, "Unload requested");

    state.registry.unload(&key).await?;

    Ok(Json(RegistryStatus {
        models: state.registry.status().await,
    }))
}

/// GET /api/admin/huggingface/token - Whether a credential is configured
pub async fn get_token(State(state): State<AppState>) -> Json<TokenStatus> {
    let has_token = state.registry.hf_token().await.is_some() || state.token_store.has_token().await;
    Json(TokenStatus { has_token })
}

/// POST /api/admin/huggingface/token - Persist or clear the credential
pub async fn set_token(
    State(state): State<AppState>,
    Json(update): Json<TokenUpdate>,
) -> Result<Json<TokenStatus>, ApiError> {
    let token = update
        .token
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());

    match &token {
        Some(token) => state.token_store.save(token).await?,
        None => state.token_store.clear().await?,
    }
    state.registry.set_hf_token(token.clone()).await;

    tracing::info!(has_token = token.is_some(), "Hugging Face token updated");

    Ok(Json(TokenStatus {
        has_token: token.is_some(),
    }))
}

/// POST /api/models/{key}/infer - Forward a JSON payload to a model
pub async fn infer_model(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let model = state.registry.get(&key).await?;
    let output = model.infer(InferInput::Json(payload)).await?;
    Ok(Json(output))
}

/// POST /v1/chat/completions - OpenAI-style chat completion
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let requested = payload.get("model").and_then(Value::as_str);
    let model = resolve_chat_model(&state, requested).await?;
    let output = model.infer(InferInput::Json(payload)).await?;
    Ok(Json(output))
}

/// POST /v1/completions - OpenAI-style text completion served by a chat model
pub async fn completions(
    State(state): State<AppState>,
    Json(request): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, ApiError> {
    let model = resolve_chat_model(&state, request.model.as_deref()).await?;
    let identifier = model.metadata().identifier.clone();

    let output = model
        .infer(InferInput::Json(json!({
            "model": identifier,
            "messages": [
                { "role": "system", "content": COMPLETION_SYSTEM_PROMPT },
                { "role": "user", "content": request.prompt },
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
        })))
        .await?;

    let text = completion_text(&output)
        .ok_or_else(|| ApiError::Internal("Chat model response has no message content".to_string()))?
        .to_string();
    let usage = Usage::from_texts(&request.prompt, &text);

    Ok(Json(CompletionResponse {
        id: format!("cmpl-{}", uuid::Uuid::new_v4()),
        object: "text_completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: identifier,
        choices: vec![CompletionChoice {
            text,
            index: 0,
            finish_reason: "stop".to_string(),
        }],
        usage,
    }))
}

/// Named model (slot key or identifier), else the chat-completion slot
async fn resolve_chat_model(
    state: &AppState,
    requested: Option<&str>,
) -> Result<Arc<ManagedModel>, ApiError> {
    let model = match requested {
        Some(name) => {
            let key = state
                .registry
                .resolve_key(name)
                .await
                .ok_or_else(|| RegistryError::UnknownKey {
                    key: name.to_string(),
                })?;
            state.registry.get(&key).await?
        }
        None => {
            state
                .registry
                .get_by_task(&ModelTask::ChatCompletion)
                .await?
        }
    };
    Ok(model)
}

/// Assistant text from an OpenAI chat response, or a bare `content` field
fn completion_text(output: &Value) -> Option<&str> {
    output
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .or_else(|| output.get("content").and_then(Value::as_str))
}

/// POST /api/audio/transcriptions - Speech to text over a raw audio body
pub async fn transcribe(
    State(state): State<AppState>,
    Query(query): Query<AudioQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    infer_audio(&state, ModelTask::SpeechToText, query, body).await
}

/// POST /api/diarization/process - Speaker diarization over a raw audio body
pub async fn diarize(
    State(state): State<AppState>,
    Query(query): Query<AudioQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    infer_audio(&state, ModelTask::SpeakerDiarization, query, body).await
}

async fn infer_audio(
    state: &AppState,
    task: ModelTask,
    query: AudioQuery,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("Audio payload is required".to_string()));
    }

    let model = state.registry.get_by_task(&task).await?;
    let output = model
        .infer(InferInput::Audio {
            bytes: body.to_vec(),
            sampling_rate: query.sampling_rate,
        })
        .await?;
    Ok(Json(output))
}

/// An absent or empty body means "keep the current device preference"
fn parse_load_request(body: &[u8]) -> Result<LoadRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(LoadRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid load request: {}", e)))
}
