//! whisper.cpp backend: `whisper-server` for speech-to-text.
//!
//! Audio arrives as multipart uploads; the gateway validates size and
//! shape, writes the payload to a scratch file, rebuilds a multipart form
//! for the backend's `/inference` endpoint, and removes the scratch file
//! whether or not the request succeeded.

use super::common::{BackendProcess, READY_TIMEOUT};
use super::{LoadOptions, TRANSCRIBE_TIMEOUT};
use crate::error::{GatewayError, Result};
use crate::installer::{self, BackendSpec};
use crate::process::SpawnOptions;
use crate::registry::{ModelEntry, ModelRegistry};
use crate::{fetch, paths};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) const SPEC: BackendSpec = BackendSpec {
    recipe: "whispercpp",
    dir_name: "whisper",
    binary: "whisper-server",
    alt_binaries: &["server"],
    subdirs: &["Release", "bin", "build/bin"],
};

/// OpenAI's documented transcription upload limit.
pub const MAX_AUDIO_BYTES: u64 = 25 * 1024 * 1024;

#[derive(Debug)]
pub struct WhisperServer {
    pub(crate) process: BackendProcess,
    pub(crate) registry: Arc<ModelRegistry>,
    temp_dir: PathBuf,
}

impl WhisperServer {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            process: BackendProcess::new("whisper-server"),
            registry,
            temp_dir: paths::audio_temp_dir(),
        }
    }

    /// Install whisper-server from the ggml-org release archive.
    ///
    /// # Errors
    ///
    /// Propagates installer errors.
    pub async fn install(&mut self) -> Result<()> {
        let filename = if cfg!(target_os = "macos") {
            "whisper-bin-arm64.zip"
        } else {
            "whisper-bin-x64.zip"
        };
        installer::install_from_github(&SPEC, "", "ggml-org/whisper.cpp", filename).await?;
        Ok(())
    }

    /// Spawn whisper-server for the entry's resolved model file.
    ///
    /// # Errors
    ///
    /// Fails when the model file is missing, on spawn failure, or on
    /// readiness timeout.
    pub async fn load(
        &mut self,
        entry: &ModelEntry,
        opts: &LoadOptions,
        _do_not_upgrade: bool,
    ) -> Result<()> {
        self.install().await?;
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let model_path = entry
            .resolved_path
            .as_ref()
            .filter(|p| p.is_file())
            .ok_or_else(|| GatewayError::ModelInvalidated {
                model: entry.name.clone(),
                reason: format!("model file not found for checkpoint {}", entry.checkpoint),
            })?;

        let exe = SPEC
            .external_binary("")
            .or_else(|| SPEC.find_executable(&SPEC.install_dir("")))
            .ok_or_else(|| GatewayError::Installation("whisper-server not installed".into()))?;

        let port = self.process.choose_port()?;
        let args: Vec<String> = vec![
            "-m".into(),
            model_path.display().to_string(),
            "--port".into(),
            port.to_string(),
        ];

        self.process
            .spawn(
                &exe.display().to_string(),
                &args,
                SpawnOptions {
                    inherit_output: opts.debug,
                    ..SpawnOptions::default()
                },
            )
            .await?;

        if let Err(e) = self.process.wait_for_ready("/health", READY_TIMEOUT).await {
            self.process.stop().await;
            return Err(e);
        }
        info!(model = %entry.name, port, "whisper-server ready");
        Ok(())
    }

    /// Transcribe an audio payload.
    ///
    /// `params` carries the optional OpenAI fields (`language`, `prompt`,
    /// `temperature`, `response_format`).
    ///
    /// # Errors
    ///
    /// Returns the audio pre-flight errors for oversized/empty payloads,
    /// [`GatewayError::Backend`] for upstream failures.
    pub async fn transcribe(
        &self,
        file_bytes: Vec<u8>,
        filename: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        validate_audio(&file_bytes)?;

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let temp_path = self.temp_file_for(filename);
        tokio::fs::write(&temp_path, &file_bytes).await?;

        let result = self
            .forward_multipart(&temp_path, filename, params)
            .await;

        if let Err(e) = tokio::fs::remove_file(&temp_path).await {
            warn!(path = %temp_path.display(), error = %e, "could not remove audio temp file");
        }
        result
    }

    async fn forward_multipart(
        &self,
        path: &Path,
        filename: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let bytes = tokio::fs::read(path).await?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_owned())
            .mime_str(mime_for(filename))
            .map_err(|e| GatewayError::Internal(format!("bad MIME type: {e}")))?;

        let mut form = reqwest::multipart::Form::new().part("file", part);
        form = form.text(
            "response_format",
            params
                .get("response_format")
                .and_then(|v| v.as_str())
                .unwrap_or("json")
                .to_owned(),
        );
        form = form.text(
            "temperature",
            params
                .get("temperature")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                .to_string(),
        );
        if let Some(language) = params.get("language").and_then(|v| v.as_str()) {
            form = form.text("language", language.to_owned());
        }
        if let Some(prompt) = params.get("prompt").and_then(|v| v.as_str()) {
            form = form.text("prompt", prompt.to_owned());
        }

        debug!(url = %self.process.url("/inference"), "forwarding multipart audio");
        let resp = fetch::client()
            .post(self.process.url("/inference"))
            .multipart(form)
            .timeout(TRANSCRIBE_TIMEOUT)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp.text().await?;
        if status != 200 {
            return Err(GatewayError::Backend {
                backend: "whisper-server".to_owned(),
                message: body,
                status: Some(status),
            });
        }

        // Non-JSON response formats (text, srt, vtt) come back wrapped.
        match serde_json::from_str(&body) {
            Ok(json) => Ok(json),
            Err(_) => Ok(serde_json::json!({ "text": body })),
        }
    }

    fn temp_file_for(&self, filename: &str) -> PathBuf {
        let ext = Path::new(filename)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_owned());
        let tag: u32 = rand::thread_rng().gen_range(0..1_000_000);
        self.temp_dir.join(format!("audio_{tag:06}.{ext}"))
    }
}

fn validate_audio(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(GatewayError::AudioFileInvalid("audio file is empty".into()));
    }
    if bytes.len() as u64 > MAX_AUDIO_BYTES {
        return Err(GatewayError::AudioFileTooLarge(format!(
            "{} bytes exceeds the 25 MB limit",
            bytes.len()
        )));
    }
    Ok(())
}

fn mime_for(filename: &str) -> &'static str {
    let ext = Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => "audio/wav",
    }
}
