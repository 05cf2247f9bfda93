//! Router / load manager.
//!
//! Owns every loaded model: enforces per-class caps with LRU eviction,
//! serializes loads so concurrent requests for the same model spawn one
//! subprocess, and dispatches requests by capability so an unsupported
//! operation is refused before any work starts.

use crate::backends::{self, Capability, LoadOptions, ServerBackend};
use crate::config::{ModelCaps, ServerConfig};
use crate::error::{GatewayError, Result};
use crate::hardware::HardwareOracle;
use crate::registry::{ModelEntry, ModelRegistry, ModelType};
use crate::streaming;
use crate::telemetry::Telemetry;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A model with a live backend subprocess behind it.
#[derive(Debug)]
pub struct LoadedModel {
    pub entry: ModelEntry,
    pub model_type: ModelType,
    pub capabilities: Vec<Capability>,
    pub backend: ServerBackend,
    pub telemetry: Arc<Mutex<Telemetry>>,
    last_used: Mutex<Instant>,
    /// Monotonic load sequence, for reverse-order shutdown.
    seq: u64,
}

impl LoadedModel {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_used.lock() {
            *guard = Instant::now();
        }
    }

    fn last_used(&self) -> Instant {
        self.last_used
            .lock()
            .map(|g| *g)
            .unwrap_or_else(|e| *e.into_inner())
    }
}

/// The request-routing and model-lifecycle plane.
pub struct Router {
    registry: Arc<ModelRegistry>,
    oracle: Arc<dyn HardwareOracle>,
    config: ServerConfig,
    caps: ModelCaps,
    state: Mutex<HashMap<String, Arc<LoadedModel>>>,
    /// Serializes load work; a second `load(A)` waits here, then finds A
    /// already loaded and returns without spawning.
    load_lock: tokio::sync::Mutex<()>,
    load_seq: AtomicU64,
    /// Per-model load parameter overrides (`POST params`).
    model_params: Mutex<HashMap<String, Value>>,
}

impl Router {
    pub fn new(
        registry: Arc<ModelRegistry>,
        oracle: Arc<dyn HardwareOracle>,
        config: ServerConfig,
    ) -> Self {
        let caps = config.caps;
        Self {
            registry,
            oracle,
            config,
            caps,
            state: Mutex::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
            load_seq: AtomicU64::new(0),
            model_params: Mutex::new(HashMap::new()),
        }
    }

    /// All currently loaded models, unordered.
    pub fn loaded_models(&self) -> Vec<Arc<LoadedModel>> {
        lock(&self.state).values().cloned().collect()
    }

    /// A loaded model by name, refreshing its LRU timestamp.
    pub fn get_loaded(&self, name: &str) -> Option<Arc<LoadedModel>> {
        let model = lock(&self.state).get(name).cloned();
        if let Some(model) = &model {
            model.touch();
        }
        model
    }

    /// Store load-parameter overrides for a model (`POST params`).
    pub fn set_model_params(&self, model: &str, params: Value) {
        lock(&self.model_params).insert(model.to_owned(), params);
    }

    /// Load a model, evicting least-recently-used models of the same
    /// class when the cap requires it. Already-loaded models only get
    /// their timestamp refreshed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for unknown names and
    /// propagates install/download/spawn failures. On failure no state is
    /// left behind: a partially constructed backend is unloaded.
    pub async fn load_model(&self, name: &str, do_not_upgrade: bool) -> Result<Arc<LoadedModel>> {
        let _guard = self.load_lock.lock().await;

        if let Some(model) = self.get_loaded(name) {
            return Ok(model);
        }

        let entry = self.registry.get_model(name).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("model '{name}' is not registered"))
        })?;
        let model_type = entry.model_type();

        self.evict_for(model_type).await;

        info!(
            model = name,
            recipe = %entry.recipe,
            class = model_type.as_str(),
            "loading model"
        );

        let telemetry = Arc::new(Mutex::new(Telemetry::default()));
        let opts = self.load_options(name, Arc::clone(&telemetry));
        let mut backend = ServerBackend::for_recipe(&entry.recipe, Arc::clone(&self.registry))?;

        let loaded = async {
            backend.install(&opts).await?;
            backend.download_model(&entry, do_not_upgrade).await?;
            // The download may have materialized new files; re-resolve.
            let entry = self.registry.get_model(name).unwrap_or(entry);
            backend.load(&entry, &opts, do_not_upgrade).await?;
            Ok::<ModelEntry, GatewayError>(entry)
        }
        .await;

        let entry = match loaded {
            Ok(entry) => entry,
            Err(e) => {
                warn!(model = name, error = %e, "load failed, tearing down");
                backend.unload().await;
                return Err(e);
            }
        };

        let model = Arc::new(LoadedModel {
            capabilities: backends::capabilities_for(&entry),
            model_type,
            backend,
            telemetry,
            last_used: Mutex::new(Instant::now()),
            seq: self.load_seq.fetch_add(1, Ordering::Relaxed),
            entry,
        });

        lock(&self.state).insert(name.to_owned(), Arc::clone(&model));
        info!(model = name, url = %model.backend.base_url(), "model loaded");
        Ok(model)
    }

    /// Evict LRU members of `class` until a new load fits under the cap.
    async fn evict_for(&self, class: ModelType) {
        let cap = self.cap_for(class);
        loop {
            let victim = {
                let state = lock(&self.state);
                let mut in_class: Vec<&Arc<LoadedModel>> = state
                    .values()
                    .filter(|m| m.model_type == class)
                    .collect();
                if in_class.len() < cap {
                    break;
                }
                in_class.sort_by_key(|m| m.last_used());
                in_class.first().map(|m| m.name().to_owned())
            };
            let Some(victim) = victim else {
                break;
            };
            info!(model = %victim, class = class.as_str(), "evicting LRU model");
            self.unload_model(&victim).await;
        }
    }

    fn cap_for(&self, class: ModelType) -> usize {
        match class {
            ModelType::Llm => self.caps.llm,
            ModelType::Embedding => self.caps.embedding,
            ModelType::Reranking => self.caps.reranking,
            ModelType::Audio | ModelType::AudioOut => self.caps.audio,
            ModelType::Image => self.caps.image,
        }
    }

    fn load_options(&self, model: &str, telemetry: Arc<Mutex<Telemetry>>) -> LoadOptions {
        let params = lock(&self.model_params).get(model).cloned();
        let ctx_size = params
            .as_ref()
            .and_then(|p| p.get("ctx_size"))
            .and_then(Value::as_u64)
            .map_or(self.config.ctx_size, |v| v as u32);
        LoadOptions {
            ctx_size,
            llamacpp_variant: self.config.llamacpp_backend.clone(),
            llamacpp_args: self.config.llamacpp_args.clone(),
            debug: self.config.is_debug(),
            oracle: Arc::clone(&self.oracle),
            telemetry,
        }
    }

    /// Unload one model. Idempotent: unknown names are a no-op.
    pub async fn unload_model(&self, name: &str) {
        let model = lock(&self.state).remove(name);
        if let Some(model) = model {
            model.backend.unload().await;
            info!(model = name, "model unloaded");
        }
    }

    /// Unload everything, in reverse load order.
    pub async fn unload_all(&self) {
        let mut models: Vec<Arc<LoadedModel>> = {
            let mut state = lock(&self.state);
            state.drain().map(|(_, m)| m).collect()
        };
        models.sort_by_key(|m| std::cmp::Reverse(m.seq));
        for model in models {
            model.backend.unload().await;
            info!(model = %model.name(), "model unloaded");
        }
    }

    /// Resolve the model a request addresses: the named model (loading it
    /// on demand) or, when unnamed, the single loaded model.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ModelNotLoaded`] when nothing applies.
    pub async fn ensure_loaded(&self, model: Option<&str>) -> Result<Arc<LoadedModel>> {
        match model {
            Some(name) => {
                if let Some(loaded) = self.get_loaded(name) {
                    return Ok(loaded);
                }
                self.load_model(name, true).await
            }
            None => {
                let mut loaded = self.loaded_models();
                if loaded.len() > 1 {
                    return Err(GatewayError::InvalidRequest(
                        "multiple models are loaded; specify `model` in the request".to_owned(),
                    ));
                }
                loaded
                    .pop()
                    .ok_or_else(|| GatewayError::ModelNotLoaded(String::new()))
            }
        }
    }

    fn check_capability(model: &LoadedModel, capability: Capability) -> Result<()> {
        if model.supports(capability) {
            return Ok(());
        }
        Err(GatewayError::unsupported(
            capability.operation_name(),
            model.backend.family(),
        ))
    }

    fn timeout_for(capability: Capability) -> std::time::Duration {
        match capability {
            Capability::ImageGenerations => backends::IMAGE_TIMEOUT,
            Capability::AudioTranscriptions => backends::TRANSCRIBE_TIMEOUT,
            _ => backends::FORWARD_TIMEOUT,
        }
    }

    /// Forward a non-streaming JSON request for `capability`.
    ///
    /// # Errors
    ///
    /// `unsupported_operation` before any backend contact when the loaded
    /// model lacks the capability; otherwise backend/network errors.
    pub async fn forward(&self, capability: Capability, request: Value) -> Result<Value> {
        let model_name = request.get("model").and_then(Value::as_str).map(str::to_owned);
        let model = self.ensure_loaded(model_name.as_deref()).await?;
        Self::check_capability(&model, capability)?;
        model.touch();

        let endpoint = model.backend.json_endpoint(capability).ok_or_else(|| {
            GatewayError::unsupported(capability.operation_name(), model.backend.family())
        })?;
        let request = model.backend.prepare_request(capability, request);
        let response = model
            .backend
            .process()
            .forward_json(endpoint, &request, Self::timeout_for(capability))
            .await?;

        if let Some(usage) = Telemetry::from_terminal_chunk(&response) {
            if let Ok(mut telemetry) = model.telemetry.lock() {
                telemetry.merge(&usage);
            }
        }
        Ok(response)
    }

    /// Forward a streaming request for `capability`, returning the raw
    /// SSE byte stream. Telemetry lands on the model when the terminal
    /// chunk carries it.
    ///
    /// # Errors
    ///
    /// Same pre-flight errors as [`Router::forward`].
    pub async fn forward_stream(
        &self,
        capability: Capability,
        request: Value,
    ) -> Result<mpsc::Receiver<Bytes>> {
        let model_name = request.get("model").and_then(Value::as_str).map(str::to_owned);
        let model = self.ensure_loaded(model_name.as_deref()).await?;
        Self::check_capability(&model, capability)?;
        model.touch();

        let endpoint = model.backend.json_endpoint(capability).ok_or_else(|| {
            GatewayError::unsupported(capability.operation_name(), model.backend.family())
        })?;
        let request = model.backend.prepare_request(capability, request);

        let telemetry = Arc::clone(&model.telemetry);
        let on_complete: streaming::OnComplete = Box::new(move |parsed| {
            if let Some(parsed) = parsed {
                if let Ok(mut guard) = telemetry.lock() {
                    guard.merge(&parsed);
                }
            }
        });

        Ok(model.backend.process().forward_sse(
            endpoint,
            request,
            Self::timeout_for(capability),
            Some(on_complete),
        ))
    }

    /// Forward a speech request as a raw byte stream (TTS audio).
    ///
    /// # Errors
    ///
    /// Same pre-flight errors as [`Router::forward`].
    pub async fn audio_speech(
        &self,
        request: Value,
    ) -> Result<mpsc::Receiver<std::result::Result<Bytes, GatewayError>>> {
        let model_name = request.get("model").and_then(Value::as_str).map(str::to_owned);
        let model = self.ensure_loaded(model_name.as_deref()).await?;
        Self::check_capability(&model, Capability::AudioSpeech)?;
        model.touch();

        let request = model.backend.prepare_request(Capability::AudioSpeech, request);
        Ok(model.backend.process().forward_bytes(
            "/v1/audio/speech",
            request,
            backends::FORWARD_TIMEOUT,
        ))
    }

    /// Forward an audio transcription (multipart) request.
    ///
    /// # Errors
    ///
    /// Audio pre-flight errors, `unsupported_operation`, or backend
    /// errors.
    pub async fn audio_transcriptions(
        &self,
        model: Option<&str>,
        file_bytes: Vec<u8>,
        filename: &str,
        params: &Value,
    ) -> Result<Value> {
        let loaded = match model {
            Some(name) => self.ensure_loaded(Some(name)).await?,
            None => self
                .loaded_models()
                .into_iter()
                .find(|m| m.supports(Capability::AudioTranscriptions))
                .ok_or_else(|| GatewayError::ModelNotLoaded("no audio model loaded".into()))?,
        };
        Self::check_capability(&loaded, Capability::AudioTranscriptions)?;
        loaded.touch();
        loaded
            .backend
            .audio_transcriptions(file_bytes, filename, params)
            .await
    }

    /// `GET health` payload.
    pub fn health(&self) -> Value {
        let mut models = self.loaded_models();
        models.sort_by_key(|m| std::cmp::Reverse(m.last_used()));
        let names: Vec<&str> = models.iter().map(|m| m.name()).collect();
        json!({
            "status": "ok",
            "model_loaded": names.first(),
            "all_models_loaded": names,
        })
    }

    /// `GET stats` payload: most-recent telemetry per loaded model, with
    /// the most recently used model's numbers flattened at the top level.
    pub fn stats(&self) -> Value {
        let mut models = self.loaded_models();
        models.sort_by_key(|m| std::cmp::Reverse(m.last_used()));

        let mut per_model = serde_json::Map::new();
        for model in &models {
            let telemetry = model
                .telemetry
                .lock()
                .map(|t| t.clone())
                .unwrap_or_default();
            per_model.insert(
                model.name().to_owned(),
                serde_json::to_value(telemetry).unwrap_or(Value::Null),
            );
        }

        let mut out = match models.first() {
            Some(model) => {
                let telemetry = model
                    .telemetry
                    .lock()
                    .map(|t| t.clone())
                    .unwrap_or_default();
                serde_json::to_value(telemetry).unwrap_or_else(|_| json!({}))
            }
            None => json!({}),
        };
        out["models"] = Value::Object(per_model);
        out
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn oracle(&self) -> &Arc<dyn HardwareOracle> {
        &self.oracle
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareInfo, StaticOracle};

    fn test_router(caps: ModelCaps) -> Router {
        let oracle: Arc<dyn HardwareOracle> = Arc::new(StaticOracle(HardwareInfo::default()));
        let registry = Arc::new(
            ModelRegistry::new(Arc::clone(&oracle), None, true).expect("registry"),
        );
        let config = ServerConfig {
            caps,
            offline: true,
            ..ServerConfig::default()
        };
        Router::new(registry, oracle, config)
    }

    fn fake_loaded(router: &Router, name: &str, model_type: ModelType, seq: u64) {
        let entry = ModelEntry {
            name: name.to_owned(),
            checkpoint: "org/repo:Q4_0".to_owned(),
            recipe: "llamacpp".to_owned(),
            labels: vec![],
            suggested: false,
            mmproj: None,
            source: None,
            resolved_path: None,
        };
        let backend =
            ServerBackend::for_recipe("llamacpp", Arc::clone(&router.registry)).expect("backend");
        let model = Arc::new(LoadedModel {
            capabilities: backends::capabilities_for(&entry),
            model_type,
            backend,
            telemetry: Arc::new(Mutex::new(Telemetry::default())),
            last_used: Mutex::new(Instant::now()),
            seq,
            entry,
        });
        lock(&router.state).insert(name.to_owned(), model);
    }

    #[tokio::test]
    async fn eviction_removes_lru_within_class() {
        let router = test_router(ModelCaps {
            llm: 1,
            ..ModelCaps::default()
        });
        fake_loaded(&router, "old", ModelType::Llm, 0);

        // Make "old" the LRU by touching nothing else; eviction for a new
        // LLM load must remove it. (No real subprocess: unload is a no-op
        // on a never-spawned backend.)
        router.evict_for(ModelType::Llm).await;
        assert!(router.get_loaded("old").is_none());
    }

    #[tokio::test]
    async fn eviction_spares_other_classes() {
        let router = test_router(ModelCaps {
            llm: 1,
            ..ModelCaps::default()
        });
        fake_loaded(&router, "embedder", ModelType::Embedding, 0);
        router.evict_for(ModelType::Llm).await;
        assert!(router.get_loaded("embedder").is_some());
    }

    #[tokio::test]
    async fn eviction_picks_least_recently_used() {
        let router = test_router(ModelCaps {
            llm: 2,
            ..ModelCaps::default()
        });
        fake_loaded(&router, "a", ModelType::Llm, 0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        fake_loaded(&router, "b", ModelType::Llm, 1);
        // Touch "a" so "b" becomes the LRU.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _ = router.get_loaded("a");

        router.evict_for(ModelType::Llm).await;
        assert!(router.get_loaded("a").is_some());
        assert!(router.get_loaded("b").is_none());
    }

    #[tokio::test]
    async fn unsupported_capability_is_refused_before_forwarding() {
        let router = test_router(ModelCaps::default());
        let entry = ModelEntry {
            name: "E".to_owned(),
            checkpoint: "org/embed:Q4_0".to_owned(),
            recipe: "llamacpp".to_owned(),
            labels: vec!["embeddings".to_owned()],
            suggested: false,
            mmproj: None,
            source: None,
            resolved_path: None,
        };
        let backend =
            ServerBackend::for_recipe("llamacpp", Arc::clone(&router.registry)).expect("backend");
        let model = Arc::new(LoadedModel {
            capabilities: backends::capabilities_for(&entry),
            model_type: ModelType::Embedding,
            backend,
            telemetry: Arc::new(Mutex::new(Telemetry::default())),
            last_used: Mutex::new(Instant::now()),
            seq: 0,
            entry,
        });
        lock(&router.state).insert("E".to_owned(), model);

        let err = router
            .forward(
                Capability::ChatCompletion,
                json!({"model": "E", "messages": []}),
            )
            .await
            .expect_err("embedding model cannot chat");
        assert_eq!(err.kind(), "unsupported_operation");
    }

    #[tokio::test]
    async fn request_without_model_and_nothing_loaded() {
        let router = test_router(ModelCaps::default());
        let err = router
            .forward(Capability::ChatCompletion, json!({"messages": []}))
            .await
            .expect_err("nothing loaded");
        assert_eq!(err.kind(), "model_not_loaded");
    }

    #[tokio::test]
    async fn unknown_model_is_invalid_request() {
        let router = test_router(ModelCaps::default());
        let err = router
            .load_model("Totally-Unknown-Model", true)
            .await
            .expect_err("unknown model");
        assert_eq!(err.kind(), "invalid_request");
    }

    #[tokio::test]
    async fn health_reports_loaded_models() {
        let router = test_router(ModelCaps {
            llm: 2,
            ..ModelCaps::default()
        });
        fake_loaded(&router, "a", ModelType::Llm, 0);
        let health = router.health();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["all_models_loaded"], json!(["a"]));
        assert_eq!(health["model_loaded"], "a");
    }

    #[tokio::test]
    async fn stats_flattens_most_recent_model() {
        let router = test_router(ModelCaps::default());
        fake_loaded(&router, "a", ModelType::Llm, 0);
        if let Some(model) = router.get_loaded("a") {
            if let Ok(mut t) = model.telemetry.lock() {
                t.input_tokens = 12;
                t.output_tokens = 34;
            }
        }
        let stats = router.stats();
        assert_eq!(stats["input_tokens"], 12);
        assert_eq!(stats["models"]["a"]["output_tokens"], 34);
    }

    #[tokio::test]
    async fn unload_is_idempotent() {
        let router = test_router(ModelCaps::default());
        fake_loaded(&router, "a", ModelType::Llm, 0);
        router.unload_model("a").await;
        router.unload_model("a").await;
        assert!(router.loaded_models().is_empty());
    }
}
