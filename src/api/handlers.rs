//! Endpoint handlers for the OpenAI-compatible API.

use super::{ApiError, ApiResult, AppState};
use crate::backends::Capability;
use crate::error::GatewayError;
use crate::paths;
use crate::registry::hf::PullProgress;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

/// Wrap an SSE byte stream as a response.
pub(crate) fn sse_response(rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn is_streaming(request: &Value) -> bool {
    request
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

async fn dispatch(
    state: &AppState,
    capability: Capability,
    request: Value,
) -> ApiResult<Response> {
    if is_streaming(&request) {
        let rx = state.router.forward_stream(capability, request).await?;
        Ok(sse_response(rx))
    } else {
        let response = state.router.forward(capability, request).await?;
        Ok(Json(response).into_response())
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(state.router.health())
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(state.router.stats())
}

pub async fn system_info(State(state): State<AppState>) -> Json<Value> {
    let config = state.router.config();
    let oracle = state.router.oracle();
    let hw = oracle.info();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
        "cpu": hw.cpu_name,
        "gpus": hw.gpu_names,
        "npu_available": oracle.npu_available(),
        "ctx_size": config.ctx_size,
        "llamacpp_backend": config.llamacpp_backend,
    }))
}

pub async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let show_all = query
        .get("show_all")
        .is_some_and(|v| v == "true" || v == "1");

    let registry = state.router.registry();
    let downloaded = registry.get_downloaded_models().await;
    let source = if show_all {
        registry.get_supported_models()
    } else {
        downloaded.clone()
    };

    let data: Vec<Value> = source
        .values()
        .map(|entry| {
            json!({
                "id": entry.name,
                "object": "model",
                "created": 0,
                "owned_by": "lemonade",
                "checkpoint": entry.checkpoint,
                "recipe": entry.recipe,
                "labels": entry.labels,
                "suggested": entry.suggested,
                "downloaded": downloaded.contains_key(&entry.name),
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

pub async fn model_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let registry = state.router.registry();
    let entry = registry
        .get_model(&id)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown model: {id}")))?;
    let downloaded = registry.is_model_downloaded(&id).await;
    Ok(Json(json!({
        "id": entry.name,
        "object": "model",
        "created": 0,
        "owned_by": "lemonade",
        "checkpoint": entry.checkpoint,
        "recipe": entry.recipe,
        "labels": entry.labels,
        "suggested": entry.suggested,
        "mmproj": entry.mmproj,
        "downloaded": downloaded,
        "loaded": state.router.get_loaded(&id).is_some(),
    })))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Response> {
    dispatch(&state, Capability::ChatCompletion, request).await
}

pub async fn completions(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Response> {
    dispatch(&state, Capability::Completion, request).await
}

pub async fn responses(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Response> {
    dispatch(&state, Capability::Responses, request).await
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    let response = state.router.forward(Capability::Embeddings, request).await?;
    Ok(Json(response))
}

pub async fn reranking(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    let response = state.router.forward(Capability::Reranking, request).await?;
    Ok(Json(response))
}

pub async fn image_generations(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    let response = state
        .router
        .forward(Capability::ImageGenerations, request)
        .await?;
    Ok(Json(response))
}

pub async fn audio_transcriptions(
    State(state): State<AppState>,
    multipart: axum::extract::Multipart,
) -> ApiResult<Json<Value>> {
    let upload = super::audio::parse_transcription_upload(multipart).await?;
    let response = state
        .router
        .audio_transcriptions(
            upload.model.as_deref(),
            upload.file_bytes,
            &upload.filename,
            &upload.params,
        )
        .await?;
    Ok(Json(response))
}

pub async fn audio_speech(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Response> {
    let mut rx = state.router.audio_speech(request).await?;

    // Surface pre-stream failures (connect refused, backend error) as a
    // proper error response instead of an empty 200.
    let first = rx.recv().await;
    let first = match first {
        Some(Ok(bytes)) => Some(bytes),
        Some(Err(e)) => return Err(ApiError(e)),
        None => None,
    };

    let head = futures_util::stream::iter(first.map(Ok::<_, GatewayError>));
    let tail = ReceiverStream::new(rx);
    let body = Body::from_stream(head.chain(tail));

    Response::builder()
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .body(body)
        .map_err(|e| ApiError(GatewayError::Internal(format!("response build failed: {e}"))))
}

/// `POST pull`: download (and register) a model. With `stream: true`, an
/// SSE stream reports per-file progress; otherwise the call blocks.
pub async fn pull(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Response> {
    let model = request
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("missing required field: model".into()))?
        .to_owned();
    let checkpoint = request
        .get("checkpoint")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let recipe = request
        .get("recipe")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let mmproj = request
        .get("mmproj")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let labels = pull_labels(&request);

    // A local directory checkpoint is an import, not a download.
    if let Some(cp) = &checkpoint {
        let path = std::path::Path::new(cp);
        if path.is_absolute() && path.is_dir() {
            let recipe = recipe.as_deref().unwrap_or("llamacpp");
            state
                .router
                .registry()
                .add_local_model(&model, recipe, path)?;
            return Ok(Json(json!({ "status": "success", "model": model })).into_response());
        }
    }

    if is_streaming(&request) {
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
        let router = std::sync::Arc::clone(&state.router);
        tokio::spawn(async move {
            let progress_tx = tx.clone();
            let progress = move |p: PullProgress| {
                let percent = if p.bytes_total > 0 {
                    p.bytes_downloaded * 100 / p.bytes_total
                } else {
                    0
                };
                let event = sse_event(
                    "progress",
                    &json!({
                        "file": p.file,
                        "file_index": p.file_index,
                        "total_files": p.total_files,
                        "bytes_downloaded": p.bytes_downloaded,
                        "bytes_total": p.bytes_total,
                        "percent": percent,
                    }),
                );
                let _ = progress_tx.try_send(event);
            };

            let result = router
                .registry()
                .download_model(
                    &model,
                    checkpoint.as_deref(),
                    recipe.as_deref(),
                    &labels,
                    mmproj.as_deref(),
                    false,
                    Some(&progress),
                )
                .await;

            let final_event = match result {
                Ok(()) => sse_event("complete", &json!({ "model": model })),
                Err(e) => {
                    warn!(model = %model, error = %e, "pull failed");
                    sse_event("error", &e.to_envelope())
                }
            };
            let _ = tx.send(final_event).await;
        });
        return Ok(sse_response(rx));
    }

    state
        .router
        .registry()
        .download_model(
            &model,
            checkpoint.as_deref(),
            recipe.as_deref(),
            &labels,
            mmproj.as_deref(),
            false,
            None,
        )
        .await?;
    Ok(Json(json!({ "status": "success", "model": model })).into_response())
}

fn pull_labels(request: &Value) -> Vec<String> {
    let mut labels = Vec::new();
    for (flag, label) in [
        ("reasoning", "reasoning"),
        ("vision", "vision"),
        ("embedding", "embeddings"),
        ("embeddings", "embeddings"),
        ("reranking", "reranking"),
        ("image", "image"),
    ] {
        if request.get(flag).and_then(Value::as_bool).unwrap_or(false)
            && !labels.iter().any(|l| l == label)
        {
            labels.push(label.to_owned());
        }
    }
    labels
}

fn sse_event(event: &str, data: &Value) -> Bytes {
    Bytes::from(format!("event: {event}\ndata: {data}\n\n"))
}

/// `POST load`: blocks until the model's backend reports ready.
pub async fn load(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    let name = request
        .get("model_name")
        .or_else(|| request.get("model"))
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("missing required field: model_name".into()))?;

    let model = state.router.load_model(name, true).await?;
    Ok(Json(json!({
        "status": "success",
        "model": model.name(),
        "backend_url": model.backend.base_url(),
    })))
}

/// `POST unload`: one model when named, every model otherwise.
pub async fn unload(
    State(state): State<AppState>,
    body: Option<Json<Value>>,
) -> Json<Value> {
    let name = body
        .as_ref()
        .and_then(|Json(v)| v.get("model_name").or_else(|| v.get("model")))
        .and_then(Value::as_str)
        .map(str::to_owned);

    match name {
        Some(name) => state.router.unload_model(&name).await,
        None => state.router.unload_all().await,
    }
    Json(json!({ "status": "success" }))
}

pub async fn delete(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    let name = request
        .get("model_name")
        .or_else(|| request.get("model"))
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("missing required field: model_name".into()))?;

    state.router.unload_model(name).await;
    state.router.registry().delete_model(name)?;
    Ok(Json(json!({ "status": "success" })))
}

/// `POST params`: store per-model load-parameter overrides.
pub async fn params(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    let name = request
        .get("model_name")
        .or_else(|| request.get("model"))
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("missing required field: model_name".into()))?
        .to_owned();
    let mut params = request.clone();
    if let Some(map) = params.as_object_mut() {
        map.remove("model_name");
        map.remove("model");
    }
    state.router.set_model_params(&name, params);
    Ok(Json(json!({ "status": "success" })))
}

pub async fn add_local_model(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    let name = request
        .get("model_name")
        .or_else(|| request.get("model"))
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("missing required field: model_name".into()))?;
    let checkpoint = request
        .get("checkpoint")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("missing required field: checkpoint".into()))?;
    let recipe = request
        .get("recipe")
        .and_then(Value::as_str)
        .unwrap_or("llamacpp");

    state
        .router
        .registry()
        .add_local_model(name, recipe, std::path::Path::new(checkpoint))?;
    Ok(Json(json!({ "status": "success" })))
}

/// `GET logs/stream`: SSE tail of the server log file.
pub async fn logs_stream(State(_state): State<AppState>) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let path = paths::log_file();
        let mut offset = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        loop {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            let len = match tokio::fs::metadata(&path).await {
                Ok(meta) => meta.len(),
                Err(_) => continue,
            };
            if len < offset {
                // Rotated or truncated; restart from the top.
                offset = 0;
            }
            if len == offset {
                continue;
            }
            let Ok(content) = tokio::fs::read(&path).await else {
                continue;
            };
            if content.len() < offset as usize {
                offset = 0;
                continue;
            }
            let new = &content[offset as usize..];
            offset = content.len() as u64;
            for line in String::from_utf8_lossy(new).lines() {
                let event = Bytes::from(format!("data: {line}\n\n"));
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    });
    sse_response(rx)
}

/// `POST /internal/shutdown`: stop the server process.
pub async fn internal_shutdown(State(state): State<AppState>) -> Json<Value> {
    info!("shutdown requested via /internal/shutdown");
    state.shutdown.notify_waiters();
    Json(json!({ "status": "ok" }))
}
