//! Wrapped backend servers.
//!
//! Every backend family (llama.cpp, FastFlowLM, RyzenAI/OGA, whisper.cpp,
//! Kokoro, stable-diffusion.cpp) wraps a native HTTP server subprocess
//! behind one tagged type with a uniform lifecycle: `install` the binary,
//! `download_model` the weights, `load` (spawn + readiness gate), and
//! `unload`. What a loaded backend can do is data (a capability set),
//! so an unsupported request is answered without touching the subprocess.

pub mod common;
pub mod flm;
pub mod kokoro;
pub mod llamacpp;
pub mod ryzenai;
pub mod sd;
pub mod whisper;

use crate::error::{GatewayError, Result};
use crate::hardware::HardwareOracle;
use crate::registry::{ModelEntry, ModelRegistry, ModelType};
use common::BackendProcess;
use std::sync::Arc;
use std::time::Duration;

pub use common::{FORWARD_TIMEOUT, READY_TIMEOUT};

/// Timeout for image generation requests.
pub const IMAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for audio transcription requests.
pub const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(300);

/// What a loaded backend can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ChatCompletion,
    Completion,
    Responses,
    Embeddings,
    Reranking,
    AudioTranscriptions,
    AudioSpeech,
    ImageGenerations,
}

impl Capability {
    /// Operation name used in `unsupported_operation` messages.
    pub fn operation_name(self) -> &'static str {
        match self {
            Self::ChatCompletion => "Chat completion",
            Self::Completion => "Text completion",
            Self::Responses => "Responses API",
            Self::Embeddings => "Embeddings",
            Self::Reranking => "Reranking",
            Self::AudioTranscriptions => "Audio transcription",
            Self::AudioSpeech => "Audio speech",
            Self::ImageGenerations => "Image generation",
        }
    }
}

/// Capability set for a model entry: the backend family bounds what is
/// possible, the model's class narrows it (an embeddings GGUF loaded
/// under llama-server serves embeddings, not chat).
pub fn capabilities_for(entry: &ModelEntry) -> Vec<Capability> {
    match entry.recipe.as_str() {
        "whispercpp" => return vec![Capability::AudioTranscriptions],
        "kokoro" => return vec![Capability::AudioSpeech],
        "sd-cpp" => return vec![Capability::ImageGenerations],
        _ => {}
    }
    match entry.model_type() {
        ModelType::Embedding => vec![Capability::Embeddings],
        ModelType::Reranking => vec![Capability::Reranking],
        _ => {
            let mut caps = vec![Capability::ChatCompletion, Capability::Completion];
            if entry.recipe.starts_with("oga-") {
                caps.push(Capability::Responses);
            }
            caps
        }
    }
}

/// Settings a load needs beyond the model entry itself.
#[derive(Clone)]
pub struct LoadOptions {
    pub ctx_size: u32,
    /// llama.cpp backend variant (vulkan/rocm/metal/cpu).
    pub llamacpp_variant: String,
    /// Extra raw llama-server arguments from configuration.
    pub llamacpp_args: Vec<String>,
    /// Inherit subprocess output (debug logging).
    pub debug: bool,
    pub oracle: Arc<dyn HardwareOracle>,
    /// Telemetry sink shared with the router's loaded-model record;
    /// backends that report timings on stdout write into it.
    pub telemetry: Arc<std::sync::Mutex<crate::telemetry::Telemetry>>,
}

/// A wrapped backend server, one variant per family.
#[derive(Debug)]
pub enum ServerBackend {
    LlamaCpp(llamacpp::LlamaCppServer),
    Flm(flm::FlmServer),
    Ryzenai(ryzenai::RyzenaiServer),
    Whisper(whisper::WhisperServer),
    Kokoro(kokoro::KokoroServer),
    Sd(sd::SdServer),
}

impl ServerBackend {
    /// Construct the backend for a recipe.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for an unknown recipe.
    pub fn for_recipe(recipe: &str, registry: Arc<ModelRegistry>) -> Result<Self> {
        match recipe {
            "llamacpp" => Ok(Self::LlamaCpp(llamacpp::LlamaCppServer::new(registry))),
            "flm" => Ok(Self::Flm(flm::FlmServer::new(registry))),
            "oga-npu" | "oga-hybrid" | "oga-cpu" => Ok(Self::Ryzenai(
                ryzenai::RyzenaiServer::new(registry, ryzenai::execution_mode(recipe)),
            )),
            "whispercpp" => Ok(Self::Whisper(whisper::WhisperServer::new(registry))),
            "kokoro" => Ok(Self::Kokoro(kokoro::KokoroServer::new(registry))),
            "sd-cpp" => Ok(Self::Sd(sd::SdServer::new(registry))),
            other => Err(GatewayError::InvalidRequest(format!(
                "unknown recipe: {other}"
            ))),
        }
    }

    /// Recipe family name, for error messages.
    pub fn family(&self) -> &'static str {
        match self {
            Self::LlamaCpp(_) => "llamacpp",
            Self::Flm(_) => "flm",
            Self::Ryzenai(_) => "oga",
            Self::Whisper(_) => "whispercpp",
            Self::Kokoro(_) => "kokoro",
            Self::Sd(_) => "sd-cpp",
        }
    }

    pub(crate) fn process(&self) -> &BackendProcess {
        match self {
            Self::LlamaCpp(s) => &s.process,
            Self::Flm(s) => &s.process,
            Self::Ryzenai(s) => &s.process,
            Self::Whisper(s) => &s.process,
            Self::Kokoro(s) => &s.process,
            Self::Sd(s) => &s.process,
        }
    }

    /// Backend base URL (meaningful only after a successful load).
    pub fn base_url(&self) -> String {
        self.process().base_url()
    }

    pub fn port(&self) -> u16 {
        self.process().port()
    }

    /// Ensure the backend binary is installed; idempotent.
    ///
    /// # Errors
    ///
    /// Propagates installer errors; the install dir is rolled back.
    pub async fn install(&mut self, opts: &LoadOptions) -> Result<()> {
        match self {
            Self::LlamaCpp(s) => s.install(opts).await,
            Self::Flm(s) => s.install().await,
            Self::Ryzenai(s) => s.install().await,
            Self::Whisper(s) => s.install().await,
            Self::Kokoro(s) => s.install().await,
            Self::Sd(s) => s.install().await,
        }
    }

    /// Fetch the model artifacts; returns once they are resolvable.
    ///
    /// # Errors
    ///
    /// Propagates registry/download errors.
    pub async fn download_model(&self, entry: &ModelEntry, do_not_upgrade: bool) -> Result<()> {
        match self {
            Self::Flm(s) => s.download_model(entry, do_not_upgrade).await,
            _ => {
                self.registry()
                    .download_model(
                        &entry.name,
                        Some(&entry.checkpoint),
                        Some(&entry.recipe),
                        &entry.labels,
                        entry.mmproj.as_deref(),
                        do_not_upgrade,
                        None,
                    )
                    .await
            }
        }
    }

    fn registry(&self) -> &Arc<ModelRegistry> {
        match self {
            Self::LlamaCpp(s) => &s.registry,
            Self::Flm(s) => &s.registry,
            Self::Ryzenai(s) => &s.registry,
            Self::Whisper(s) => &s.registry,
            Self::Kokoro(s) => &s.registry,
            Self::Sd(s) => &s.registry,
        }
    }

    /// Spawn the backend for `entry` and gate on readiness.
    ///
    /// # Errors
    ///
    /// Propagates install/spawn/readiness failures; the subprocess is
    /// stopped on a failed readiness wait.
    pub async fn load(
        &mut self,
        entry: &ModelEntry,
        opts: &LoadOptions,
        do_not_upgrade: bool,
    ) -> Result<()> {
        match self {
            Self::LlamaCpp(s) => s.load(entry, opts, do_not_upgrade).await,
            Self::Flm(s) => s.load(entry, opts, do_not_upgrade).await,
            Self::Ryzenai(s) => s.load(entry, opts, do_not_upgrade).await,
            Self::Whisper(s) => s.load(entry, opts, do_not_upgrade).await,
            Self::Kokoro(s) => s.load(entry, opts, do_not_upgrade).await,
            Self::Sd(s) => s.load(entry, opts, do_not_upgrade).await,
        }
    }

    /// Stop the subprocess and release the port. Idempotent.
    pub async fn unload(&self) {
        self.process().stop().await;
    }

    /// Endpoint path for a JSON-forwarded capability, `None` when this
    /// family does not expose it over plain JSON.
    pub fn json_endpoint(&self, capability: Capability) -> Option<&'static str> {
        match capability {
            Capability::ChatCompletion => Some("/v1/chat/completions"),
            Capability::Completion => Some("/v1/completions"),
            Capability::Responses => Some("/v1/responses"),
            Capability::Embeddings => Some("/v1/embeddings"),
            Capability::Reranking => Some("/v1/rerank"),
            Capability::ImageGenerations => Some("/v1/images/generations"),
            Capability::AudioSpeech => Some("/v1/audio/speech"),
            Capability::AudioTranscriptions => None,
        }
    }

    /// Apply backend-specific request rewrites before forwarding.
    pub fn prepare_request(
        &self,
        capability: Capability,
        request: serde_json::Value,
    ) -> serde_json::Value {
        match (self, capability) {
            (Self::Sd(_), Capability::ImageGenerations) => sd::embed_extra_args(request),
            (Self::Kokoro(_), Capability::AudioSpeech) => kokoro::prepare_speech_request(request),
            _ => request,
        }
    }

    /// Multipart audio transcription (whisper only).
    ///
    /// # Errors
    ///
    /// Returns `unsupported_operation` for non-audio backends.
    pub async fn audio_transcriptions(
        &self,
        file_bytes: Vec<u8>,
        filename: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match self {
            Self::Whisper(s) => s.transcribe(file_bytes, filename, params).await,
            _ => Err(GatewayError::unsupported(
                Capability::AudioTranscriptions.operation_name(),
                self.family(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(recipe: &str, labels: &[&str]) -> ModelEntry {
        ModelEntry {
            name: "m".to_owned(),
            checkpoint: "org/repo:Q4_0".to_owned(),
            recipe: recipe.to_owned(),
            labels: labels.iter().map(|s| (*s).to_owned()).collect(),
            suggested: false,
            mmproj: None,
            source: None,
            resolved_path: None,
        }
    }

    #[test]
    fn llm_capabilities() {
        let caps = capabilities_for(&entry("llamacpp", &[]));
        assert!(caps.contains(&Capability::ChatCompletion));
        assert!(caps.contains(&Capability::Completion));
        assert!(!caps.contains(&Capability::Embeddings));
    }

    #[test]
    fn embedding_model_has_no_chat() {
        let caps = capabilities_for(&entry("llamacpp", &["embeddings"]));
        assert_eq!(caps, vec![Capability::Embeddings]);
    }

    #[test]
    fn reranking_model_only_reranks() {
        let caps = capabilities_for(&entry("llamacpp", &["reranking"]));
        assert_eq!(caps, vec![Capability::Reranking]);
    }

    #[test]
    fn oga_gains_responses() {
        let caps = capabilities_for(&entry("oga-hybrid", &[]));
        assert!(caps.contains(&Capability::Responses));
    }

    #[test]
    fn audio_backends_are_single_capability() {
        assert_eq!(
            capabilities_for(&entry("whispercpp", &["audio"])),
            vec![Capability::AudioTranscriptions]
        );
        assert_eq!(
            capabilities_for(&entry("kokoro", &["audio"])),
            vec![Capability::AudioSpeech]
        );
        assert_eq!(
            capabilities_for(&entry("sd-cpp", &["image"])),
            vec![Capability::ImageGenerations]
        );
    }

    #[test]
    fn unknown_recipe_is_invalid() {
        let registry = test_registry();
        let err = ServerBackend::for_recipe("vllm", registry).expect_err("unknown recipe");
        assert_eq!(err.kind(), "invalid_request");
    }

    #[test]
    fn recipe_constructs_matching_family() {
        let registry = test_registry();
        for (recipe, family) in [
            ("llamacpp", "llamacpp"),
            ("flm", "flm"),
            ("oga-npu", "oga"),
            ("whispercpp", "whispercpp"),
            ("kokoro", "kokoro"),
            ("sd-cpp", "sd-cpp"),
        ] {
            let backend = ServerBackend::for_recipe(recipe, Arc::clone(&registry))
                .expect("recipe constructs");
            assert_eq!(backend.family(), family);
        }
    }

    fn test_registry() -> Arc<ModelRegistry> {
        use crate::hardware::{HardwareInfo, StaticOracle};
        Arc::new(
            ModelRegistry::new(
                Arc::new(StaticOracle(HardwareInfo::default())),
                None,
                true,
            )
            .expect("registry"),
        )
    }
}
