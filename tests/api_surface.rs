//! End-to-end HTTP surface tests against an in-process gateway.
//!
//! The server runs with an offline registry and no backends, which is
//! enough to verify routing, error envelopes, the catalogue endpoints,
//! and the Ollama compatibility layer.

use lemonade::api::{build_app, AppState};
use lemonade::config::ServerConfig;
use lemonade::hardware::{HardwareInfo, HardwareOracle, StaticOracle};
use lemonade::realtime::RealtimeSessionManager;
use lemonade::registry::ModelRegistry;
use lemonade::router::Router;
use serde_json::{json, Value};
use std::sync::Arc;

async fn spawn_gateway() -> String {
    let oracle: Arc<dyn HardwareOracle> = Arc::new(StaticOracle(HardwareInfo {
        cpu_name: "AMD Ryzen AI 9 HX 370".into(),
        gpu_names: vec![],
        npu_available: true,
    }));
    let registry = Arc::new(
        ModelRegistry::new(Arc::clone(&oracle), None, true).expect("catalogue parses"),
    );
    let config = ServerConfig {
        offline: true,
        ..ServerConfig::default()
    };
    let router = Arc::new(Router::new(registry, oracle, config));
    let sessions = Arc::new(RealtimeSessionManager::new(Arc::clone(&router)));
    let state = AppState {
        router,
        sessions,
        shutdown: Arc::new(tokio::sync::Notify::new()),
    };

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_answers_on_both_api_versions() {
    let base = spawn_gateway().await;
    for version in ["v0", "v1"] {
        let body: Value = reqwest::get(format!("{base}/api/{version}/health"))
            .await
            .expect("request succeeds")
            .json()
            .await
            .expect("json body");
        assert_eq!(body["status"], "ok", "api/{version}");
        assert_eq!(body["all_models_loaded"], json!([]));
    }
}

#[tokio::test]
async fn models_show_all_includes_catalogue() {
    let base = spawn_gateway().await;
    let body: Value = reqwest::get(format!("{base}/api/v1/models?show_all=true"))
        .await
        .expect("request succeeds")
        .json()
        .await
        .expect("json body");

    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().expect("data array");
    assert!(!data.is_empty(), "catalogue must not be empty");
    let ids: Vec<&str> = data.iter().filter_map(|m| m["id"].as_str()).collect();
    assert!(ids.contains(&"Llama-3.2-1B-Instruct-GGUF"), "ids: {ids:?}");
}

#[tokio::test]
async fn models_default_lists_only_downloaded() {
    let base = spawn_gateway().await;
    let body: Value = reqwest::get(format!("{base}/api/v1/models"))
        .await
        .expect("request succeeds")
        .json()
        .await
        .expect("json body");
    for model in body["data"].as_array().expect("data array") {
        assert_eq!(model["downloaded"], json!(true));
    }
}

#[tokio::test]
async fn model_detail_known_and_unknown() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let known: Value = client
        .get(format!("{base}/api/v1/models/Llama-3.2-1B-Instruct-GGUF"))
        .send()
        .await
        .expect("request succeeds")
        .json()
        .await
        .expect("json body");
    assert_eq!(known["recipe"], "llamacpp");
    assert_eq!(known["loaded"], json!(false));

    let unknown = client
        .get(format!("{base}/api/v1/models/No-Such-Model"))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(unknown.status().as_u16(), 400);
    let body: Value = unknown.json().await.expect("json body");
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn chat_without_loaded_model_returns_envelope() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/api/v1/chat/completions"))
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status().as_u16(), 404);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["error"]["type"], "model_not_loaded");
    assert!(body["error"]["message"].is_string());
}

#[tokio::test]
async fn load_unknown_model_is_rejected() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/api/v1/load"))
        .json(&json!({"model_name": "Does-Not-Exist"}))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn pull_requires_model_field() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/api/v1/pull"))
        .json(&json!({"stream": false}))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status().as_u16(), 400);
}

#[tokio::test]
async fn unload_without_body_succeeds() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/api/v1/unload"))
        .json(&json!({}))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["status"], "success");
}

#[tokio::test]
async fn stats_empty_before_any_request() {
    let base = spawn_gateway().await;
    let body: Value = reqwest::get(format!("{base}/api/v1/stats"))
        .await
        .expect("request succeeds")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["models"], json!({}));
}

#[tokio::test]
async fn system_info_reports_version_and_platform() {
    let base = spawn_gateway().await;
    let body: Value = reqwest::get(format!("{base}/api/v1/system-info"))
        .await
        .expect("request succeeds")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["platform"], std::env::consts::OS);
    assert_eq!(body["npu_available"], json!(true));
}

#[tokio::test]
async fn ollama_version_and_tags() {
    let base = spawn_gateway().await;
    let version: Value = reqwest::get(format!("{base}/api/version"))
        .await
        .expect("request succeeds")
        .json()
        .await
        .expect("json body");
    assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));

    let tags: Value = reqwest::get(format!("{base}/api/tags"))
        .await
        .expect("request succeeds")
        .json()
        .await
        .expect("json body");
    assert!(tags["models"].is_array());
}

#[tokio::test]
async fn ollama_ps_lists_nothing_when_idle() {
    let base = spawn_gateway().await;
    let body: Value = reqwest::get(format!("{base}/api/ps"))
        .await
        .expect("request succeeds")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["models"], json!([]));
}

#[tokio::test]
async fn transcription_rejects_unsupported_format() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(vec![1u8; 32]).file_name("document.pdf"),
    );
    let resp = client
        .post(format!("{base}/api/v1/audio/transcriptions"))
        .multipart(form)
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["error"]["type"], "audio_format_unsupported");
}

#[tokio::test]
async fn transcription_requires_file_field() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let form = reqwest::multipart::Form::new().text("model", "Whisper-Large-v3");
    let resp = client
        .post(format!("{base}/api/v1/audio/transcriptions"))
        .multipart(form)
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["error"]["type"], "invalid_request");
}
