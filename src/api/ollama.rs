//! Ollama-compatible API: request/response translation onto the OpenAI
//! routing plane.
//!
//! Ollama clients speak NDJSON streams where OpenAI clients speak SSE, so
//! streaming endpoints run the backend's SSE stream through a per-chunk
//! converter and append a final `done` line carrying the token counts.

use super::{ApiResult, AppState};
use crate::backends::Capability;
use crate::error::GatewayError;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/generate", post(generate))
        .route("/api/tags", get(tags))
        .route("/api/show", post(show))
        .route("/api/delete", post(delete))
        .route("/api/pull", post(pull))
        .route("/api/embed", post(embed))
        .route("/api/embeddings", post(embeddings))
        .route("/api/ps", get(ps))
        .route("/api/version", get(version))
}

/// Ollama model names often carry a `:latest` suffix the registry does
/// not know about.
fn normalize_model_name(name: &str) -> &str {
    name.strip_suffix(":latest").unwrap_or(name)
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ── Ollama → OpenAI request conversion ──────────────────────────────────

/// Convert an Ollama chat request into an OpenAI chat-completions body.
pub fn ollama_chat_to_openai(request: &Value) -> Value {
    let mut openai = json!({
        "model": normalize_model_name(
            request.get("model").and_then(Value::as_str).unwrap_or_default()
        ),
        "messages": request.get("messages").cloned().unwrap_or_else(|| json!([])),
    });
    apply_options(&mut openai, request);
    openai
}

/// Convert an Ollama generate request into an OpenAI completions body.
pub fn ollama_generate_to_openai(request: &Value) -> Value {
    let mut openai = json!({
        "model": normalize_model_name(
            request.get("model").and_then(Value::as_str).unwrap_or_default()
        ),
        "prompt": request.get("prompt").cloned().unwrap_or_else(|| json!("")),
    });
    apply_options(&mut openai, request);
    openai
}

fn apply_options(openai: &mut Value, request: &Value) {
    let Some(options) = request.get("options") else {
        return;
    };
    if let Some(v) = options.get("temperature") {
        openai["temperature"] = v.clone();
    }
    if let Some(v) = options.get("top_p") {
        openai["top_p"] = v.clone();
    }
    if let Some(v) = options.get("num_predict") {
        openai["max_tokens"] = v.clone();
    }
}

// ── OpenAI → Ollama response conversion ─────────────────────────────────

/// Final (non-streaming) chat response.
pub fn openai_chat_to_ollama(response: &Value, model: &str) -> Value {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    json!({
        "model": model,
        "created_at": timestamp(),
        "message": { "role": "assistant", "content": content },
        "done": true,
        "prompt_eval_count": response.pointer("/usage/prompt_tokens").cloned().unwrap_or(json!(0)),
        "eval_count": response.pointer("/usage/completion_tokens").cloned().unwrap_or(json!(0)),
    })
}

/// One streamed chat delta.
pub fn openai_chunk_to_ollama_chat(chunk: &Value, model: &str) -> Option<Value> {
    let content = chunk
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)?;
    Some(json!({
        "model": model,
        "created_at": timestamp(),
        "message": { "role": "assistant", "content": content },
        "done": false,
    }))
}

/// Final (non-streaming) generate response.
pub fn openai_completion_to_ollama(response: &Value, model: &str) -> Value {
    let text = response
        .pointer("/choices/0/text")
        .and_then(Value::as_str)
        .unwrap_or_default();
    json!({
        "model": model,
        "created_at": timestamp(),
        "response": text,
        "done": true,
        "prompt_eval_count": response.pointer("/usage/prompt_tokens").cloned().unwrap_or(json!(0)),
        "eval_count": response.pointer("/usage/completion_tokens").cloned().unwrap_or(json!(0)),
    })
}

/// One streamed generate delta.
pub fn openai_chunk_to_ollama_generate(chunk: &Value, model: &str) -> Option<Value> {
    let text = chunk.pointer("/choices/0/text").and_then(Value::as_str)?;
    Some(json!({
        "model": model,
        "created_at": timestamp(),
        "response": text,
        "done": false,
    }))
}

// ── SSE → NDJSON adapter ────────────────────────────────────────────────

/// Adapt an upstream SSE byte stream into an NDJSON stream.
///
/// `convert` maps each OpenAI chunk to an Ollama line (returning `None`
/// drops the chunk); `build_done` produces the terminal line from the
/// token counts seen in the stream's `usage` object. The `[DONE]`
/// sentinel is filtered out.
pub fn sse_to_ndjson<C, D>(
    mut sse_rx: mpsc::Receiver<Bytes>,
    convert: C,
    build_done: D,
) -> mpsc::Receiver<Bytes>
where
    C: Fn(&Value) -> Option<Value> + Send + 'static,
    D: FnOnce(u64, u64) -> Value + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        let mut line_buffer = String::new();
        let mut prompt_eval_count = 0u64;
        let mut eval_count = 0u64;

        while let Some(chunk) = sse_rx.recv().await {
            line_buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = line_buffer.find('\n') {
                let line: String = line_buffer.drain(..=pos).collect();
                let line = line.trim_end();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                if let Some(n) = parsed.pointer("/usage/prompt_tokens").and_then(Value::as_u64) {
                    prompt_eval_count = n;
                }
                if let Some(n) = parsed
                    .pointer("/usage/completion_tokens")
                    .and_then(Value::as_u64)
                {
                    eval_count = n;
                }
                if let Some(converted) = convert(&parsed) {
                    let ndjson = Bytes::from(format!("{converted}\n"));
                    if tx.send(ndjson).await.is_err() {
                        return;
                    }
                }
            }
        }

        let done = build_done(prompt_eval_count, eval_count);
        let _ = tx.send(Bytes::from(format!("{done}\n"))).await;
    });
    rx
}

fn ndjson_response(rx: mpsc::Receiver<Bytes>) -> Response {
    use futures_util::StreamExt;
    let stream =
        tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Response::builder()
        .header(axum::http::header::CONTENT_TYPE, "application/x-ndjson")
        .body(axum::body::Body::from_stream(stream))
        .unwrap_or_else(|_| axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ── Handlers ────────────────────────────────────────────────────────────

/// Ollama streams by default; `"stream": false` opts out.
fn wants_stream(request: &Value) -> bool {
    request.get("stream").and_then(Value::as_bool).unwrap_or(true)
}

async fn chat(State(state): State<AppState>, Json(request): Json<Value>) -> ApiResult<Response> {
    let model = normalize_model_name(
        request.get("model").and_then(Value::as_str).unwrap_or(""),
    )
    .to_owned();
    let mut openai = ollama_chat_to_openai(&request);

    if wants_stream(&request) {
        openai["stream"] = json!(true);
        openai["stream_options"] = json!({ "include_usage": true });
        let sse = state
            .router
            .forward_stream(Capability::ChatCompletion, openai)
            .await?;
        let convert_model = model.clone();
        let done_model = model;
        let rx = sse_to_ndjson(
            sse,
            move |chunk| openai_chunk_to_ollama_chat(chunk, &convert_model),
            move |prompt_eval_count, eval_count| {
                json!({
                    "model": done_model,
                    "created_at": timestamp(),
                    "message": { "role": "assistant", "content": "" },
                    "done": true,
                    "prompt_eval_count": prompt_eval_count,
                    "eval_count": eval_count,
                })
            },
        );
        return Ok(ndjson_response(rx));
    }

    let response = state
        .router
        .forward(Capability::ChatCompletion, openai)
        .await?;
    Ok(Json(openai_chat_to_ollama(&response, &model)).into_response())
}

async fn generate(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Response> {
    let model = normalize_model_name(
        request.get("model").and_then(Value::as_str).unwrap_or(""),
    )
    .to_owned();
    let mut openai = ollama_generate_to_openai(&request);

    if wants_stream(&request) {
        openai["stream"] = json!(true);
        openai["stream_options"] = json!({ "include_usage": true });
        let sse = state
            .router
            .forward_stream(Capability::Completion, openai)
            .await?;
        let convert_model = model.clone();
        let done_model = model;
        let rx = sse_to_ndjson(
            sse,
            move |chunk| openai_chunk_to_ollama_generate(chunk, &convert_model),
            move |prompt_eval_count, eval_count| {
                json!({
                    "model": done_model,
                    "created_at": timestamp(),
                    "response": "",
                    "done": true,
                    "prompt_eval_count": prompt_eval_count,
                    "eval_count": eval_count,
                })
            },
        );
        return Ok(ndjson_response(rx));
    }

    let response = state.router.forward(Capability::Completion, openai).await?;
    Ok(Json(openai_completion_to_ollama(&response, &model)).into_response())
}

async fn tags(State(state): State<AppState>) -> Json<Value> {
    let downloaded = state.router.registry().get_downloaded_models().await;
    let models: Vec<Value> = downloaded
        .values()
        .map(|entry| {
            json!({
                "name": entry.name,
                "model": entry.name,
                "modified_at": timestamp(),
                "size": 0,
                "digest": "",
                "details": {
                    "format": if entry.recipe == "llamacpp" { "gguf" } else { entry.recipe.as_str() },
                    "family": entry.recipe,
                    "parameter_size": "",
                    "quantization_level": "",
                },
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

async fn show(State(state): State<AppState>, Json(request): Json<Value>) -> ApiResult<Json<Value>> {
    let name = request
        .get("model")
        .or_else(|| request.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("missing required field: model".into()))?;
    let name = normalize_model_name(name);

    let entry = state
        .router
        .registry()
        .get_model(name)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown model: {name}")))?;

    Ok(Json(json!({
        "license": "",
        "modelfile": "",
        "parameters": "",
        "template": "",
        "details": {
            "format": if entry.recipe == "llamacpp" { "gguf" } else { entry.recipe.as_str() },
            "family": entry.recipe,
            "parameter_size": "",
            "quantization_level": "",
        },
        "model_info": {
            "checkpoint": entry.checkpoint,
            "labels": entry.labels,
        },
    })))
}

async fn delete(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    let name = request
        .get("model")
        .or_else(|| request.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("missing required field: model".into()))?;
    let name = normalize_model_name(name).to_owned();

    state.router.unload_model(&name).await;
    state.router.registry().delete_model(&name)?;
    Ok(Json(json!({ "status": "success" })))
}

async fn pull(State(state): State<AppState>, Json(request): Json<Value>) -> ApiResult<Response> {
    let name = request
        .get("model")
        .or_else(|| request.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidRequest("missing required field: model".into()))?;
    let name = normalize_model_name(name).to_owned();

    if wants_stream(&request) {
        let (tx, rx) = mpsc::channel::<Bytes>(32);
        let router = std::sync::Arc::clone(&state.router);
        tokio::spawn(async move {
            let _ = tx
                .send(Bytes::from(format!(
                    "{}\n",
                    json!({ "status": "pulling manifest" })
                )))
                .await;
            let progress_tx = tx.clone();
            let progress = move |p: crate::registry::hf::PullProgress| {
                let line = json!({
                    "status": format!("downloading {}", p.file),
                    "completed": p.bytes_downloaded,
                    "total": p.bytes_total,
                });
                let _ = progress_tx.try_send(Bytes::from(format!("{line}\n")));
            };
            let result = router
                .registry()
                .download_model(&name, None, None, &[], None, false, Some(&progress))
                .await;
            let final_line = match result {
                Ok(()) => json!({ "status": "success" }),
                Err(e) => {
                    warn!(model = %name, error = %e, "ollama pull failed");
                    json!({ "error": e.to_string() })
                }
            };
            let _ = tx.send(Bytes::from(format!("{final_line}\n"))).await;
        });
        return Ok(ndjson_response(rx));
    }

    state
        .router
        .registry()
        .download_model(&name, None, None, &[], None, false, None)
        .await?;
    Ok(Json(json!({ "status": "success" })).into_response())
}

async fn embed(State(state): State<AppState>, Json(request): Json<Value>) -> ApiResult<Json<Value>> {
    let model = normalize_model_name(
        request.get("model").and_then(Value::as_str).unwrap_or(""),
    )
    .to_owned();
    let openai = json!({
        "model": model,
        "input": request.get("input").cloned().unwrap_or(json!("")),
    });
    let response = state.router.forward(Capability::Embeddings, openai).await?;

    let embeddings: Vec<Value> = response
        .get("data")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get("embedding").cloned())
                .collect()
        })
        .unwrap_or_default();
    Ok(Json(json!({ "model": model, "embeddings": embeddings })))
}

/// Legacy single-prompt embeddings shape.
async fn embeddings(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> ApiResult<Json<Value>> {
    let model = normalize_model_name(
        request.get("model").and_then(Value::as_str).unwrap_or(""),
    )
    .to_owned();
    let openai = json!({
        "model": model,
        "input": request.get("prompt").cloned().unwrap_or(json!("")),
    });
    let response = state.router.forward(Capability::Embeddings, openai).await?;
    let embedding = response
        .pointer("/data/0/embedding")
        .cloned()
        .unwrap_or_else(|| json!([]));
    Ok(Json(json!({ "embedding": embedding })))
}

async fn ps(State(state): State<AppState>) -> Json<Value> {
    let models: Vec<Value> = state
        .router
        .loaded_models()
        .iter()
        .map(|m| {
            json!({
                "name": m.name(),
                "model": m.name(),
                "size": 0,
                "digest": "",
                "expires_at": Value::Null,
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_translation() {
        let ollama = json!({
            "model": "Llama-3.2-1B-Instruct-GGUF:latest",
            "messages": [{"role": "user", "content": "hi"}],
            "options": {"temperature": 0.2, "top_p": 0.9, "num_predict": 128}
        });
        let openai = ollama_chat_to_openai(&ollama);
        assert_eq!(openai["model"], "Llama-3.2-1B-Instruct-GGUF");
        assert_eq!(openai["messages"][0]["content"], "hi");
        assert_eq!(openai["temperature"], 0.2);
        assert_eq!(openai["top_p"], 0.9);
        assert_eq!(openai["max_tokens"], 128);
    }

    #[test]
    fn generate_request_translation() {
        let ollama = json!({"model": "m", "prompt": "tell me", "options": {"num_predict": 7}});
        let openai = ollama_generate_to_openai(&ollama);
        assert_eq!(openai["prompt"], "tell me");
        assert_eq!(openai["max_tokens"], 7);
        assert!(openai.get("temperature").is_none());
    }

    #[test]
    fn chat_response_translation() {
        let openai = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello there"}}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3}
        });
        let ollama = openai_chat_to_ollama(&openai, "m");
        assert_eq!(ollama["message"]["content"], "hello there");
        assert_eq!(ollama["done"], true);
        assert_eq!(ollama["prompt_eval_count"], 9);
        assert_eq!(ollama["eval_count"], 3);
    }

    #[test]
    fn chunk_translation_skips_non_content() {
        let with_content = json!({"choices": [{"delta": {"content": "to"}}]});
        let converted =
            openai_chunk_to_ollama_chat(&with_content, "m").expect("content converts");
        assert_eq!(converted["message"]["content"], "to");
        assert_eq!(converted["done"], false);

        let without = json!({"choices": [{"delta": {}}], "usage": {"prompt_tokens": 1}});
        assert!(openai_chunk_to_ollama_chat(&without, "m").is_none());
    }

    #[tokio::test]
    async fn ndjson_adapter_converts_and_appends_done() {
        let (sse_tx, sse_rx) = mpsc::channel::<Bytes>(8);
        let rx = sse_to_ndjson(
            sse_rx,
            |chunk| openai_chunk_to_ollama_chat(chunk, "m"),
            |prompt, eval| json!({"done": true, "prompt_eval_count": prompt, "eval_count": eval}),
        );

        sse_tx
            .send(Bytes::from(
                "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
            ))
            .await
            .expect("send");
        sse_tx
            .send(Bytes::from(
                "data: {\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2}}\n\n",
            ))
            .await
            .expect("send");
        sse_tx
            .send(Bytes::from("data: [DONE]\n\n"))
            .await
            .expect("send");
        drop(sse_tx);

        let mut lines = Vec::new();
        let mut rx = rx;
        while let Some(chunk) = rx.recv().await {
            lines.push(String::from_utf8_lossy(&chunk).into_owned());
        }

        assert_eq!(lines.len(), 2, "one delta + one done line: {lines:?}");
        let delta: Value = serde_json::from_str(lines[0].trim()).expect("valid json");
        assert_eq!(delta["message"]["content"], "hi");
        let done: Value = serde_json::from_str(lines[1].trim()).expect("valid json");
        assert_eq!(done["done"], true);
        assert_eq!(done["prompt_eval_count"], 4);
        assert_eq!(done["eval_count"], 2);
    }

    #[test]
    fn normalize_strips_latest_tag() {
        assert_eq!(normalize_model_name("m:latest"), "m");
        assert_eq!(normalize_model_name("gemma3:4b"), "gemma3:4b");
    }
}
