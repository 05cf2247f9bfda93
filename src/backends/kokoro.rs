//! Kokoro backend: the `koko` TTS server (OpenAI speech API mode).
//!
//! The model checkpoint resolves to a `model_index.json` naming the ONNX
//! weights and the voices tensor; both are passed on the command line.
//! The server ships its own espeak data and shared libraries next to the
//! executable, wired up through environment variables.

use super::common::{BackendProcess, READY_TIMEOUT};
use super::LoadOptions;
use crate::error::{GatewayError, Result};
use crate::installer::{self, BackendSpec};
use crate::process::SpawnOptions;
use crate::registry::{ModelEntry, ModelRegistry};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub(crate) const SPEC: BackendSpec = BackendSpec {
    recipe: "kokoro",
    dir_name: "kokoro",
    binary: "koko",
    alt_binaries: &[],
    subdirs: &[
        "kokoros-windows-x86_64",
        "windows-x86_64",
        "kokoros-linux-x86_64",
        "linux-x86_64",
    ],
};

/// The file the checkpoint's variant points at.
#[derive(Debug, Deserialize)]
struct ModelIndex {
    model: String,
    voices: String,
}

#[derive(Debug)]
pub struct KokoroServer {
    pub(crate) process: BackendProcess,
    pub(crate) registry: Arc<ModelRegistry>,
}

impl KokoroServer {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            process: BackendProcess::new("kokoro-server"),
            registry,
        }
    }

    /// Install the kokoros release tarball.
    ///
    /// # Errors
    ///
    /// Propagates installer errors.
    pub async fn install(&mut self) -> Result<()> {
        let filename = if cfg!(windows) {
            "kokoros-windows-x86_64.tar.gz"
        } else if cfg!(target_os = "linux") {
            "kokoros-linux-x86_64.tar.gz"
        } else {
            return Err(GatewayError::Installation(
                "kokoros is only supported on Windows and Linux".into(),
            ));
        };
        installer::install_from_github(&SPEC, "cpu", "lemonade-sdk/Kokoros", filename).await?;
        Ok(())
    }

    /// Spawn `koko` in OpenAI server mode.
    ///
    /// # Errors
    ///
    /// Fails when the model index is missing/unreadable, on spawn
    /// failure, or on readiness timeout.
    pub async fn load(
        &mut self,
        entry: &ModelEntry,
        opts: &LoadOptions,
        _do_not_upgrade: bool,
    ) -> Result<()> {
        self.install().await?;

        let index_path = entry
            .resolved_path
            .as_ref()
            .filter(|p| p.is_file())
            .ok_or_else(|| GatewayError::ModelInvalidated {
                model: entry.name.clone(),
                reason: format!("model index not found for checkpoint {}", entry.checkpoint),
            })?;
        let index_raw = tokio::fs::read_to_string(index_path).await?;
        let index: ModelIndex = serde_json::from_str(&index_raw).map_err(|e| {
            GatewayError::ModelInvalidated {
                model: entry.name.clone(),
                reason: format!("unreadable model index {}: {e}", index_path.display()),
            }
        })?;
        let model_dir = index_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let exe = SPEC
            .external_binary("cpu")
            .or_else(|| SPEC.find_executable(&SPEC.install_dir("cpu")))
            .ok_or_else(|| GatewayError::Installation("koko not installed".into()))?;

        let port = self.process.choose_port()?;
        let args: Vec<String> = vec![
            "-m".into(),
            model_dir.join(&index.model).display().to_string(),
            "-d".into(),
            model_dir.join(&index.voices).display().to_string(),
            "openai".into(),
            "--ip".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
        ];

        let mut env = Vec::new();
        if let Some(exe_dir) = exe.parent() {
            env.push((
                "ESPEAK_DATA_PATH".to_owned(),
                exe_dir.join("espeak-ng-data").display().to_string(),
            ));
            if !cfg!(windows) {
                let mut lib_path = exe_dir.display().to_string();
                if let Ok(existing) = std::env::var("LD_LIBRARY_PATH") {
                    if !existing.is_empty() {
                        lib_path = format!("{lib_path}:{existing}");
                    }
                }
                env.push(("LD_LIBRARY_PATH".to_owned(), lib_path));
            }
        }

        self.process
            .spawn(
                &exe.display().to_string(),
                &args,
                SpawnOptions {
                    inherit_output: opts.debug,
                    env,
                    ..SpawnOptions::default()
                },
            )
            .await?;

        // koko has no /health endpoint; its root answers once ready.
        if let Err(e) = self.process.wait_for_ready("/", READY_TIMEOUT).await {
            self.process.stop().await;
            return Err(e);
        }
        info!(model = %entry.name, port, "kokoro-server ready");
        Ok(())
    }
}

/// Shape a speech request for koko: it serves a fixed model name, and
/// needs an explicit `stream` boolean when the OpenAI `stream_format`
/// field is present.
pub fn prepare_speech_request(mut request: serde_json::Value) -> serde_json::Value {
    request["model"] = serde_json::json!("kokoro");
    if request.get("stream_format").is_some() {
        request["stream"] = serde_json::json!(true);
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn speech_request_forces_model_name() {
        let out = prepare_speech_request(json!({"model": "Kokoro-82M", "input": "hi"}));
        assert_eq!(out["model"], "kokoro");
        assert!(out.get("stream").is_none());
    }

    #[test]
    fn speech_request_sets_stream_for_stream_format() {
        let out = prepare_speech_request(json!({
            "model": "Kokoro-82M",
            "input": "hi",
            "stream_format": "sse"
        }));
        assert_eq!(out["stream"], json!(true));
    }

    #[test]
    fn model_index_parses() {
        let index: ModelIndex =
            serde_json::from_str(r#"{"model": "kokoro-v1.0.onnx", "voices": "voices-v1.0.bin"}"#)
                .expect("parses");
        assert_eq!(index.model, "kokoro-v1.0.onnx");
        assert_eq!(index.voices, "voices-v1.0.bin");
    }
}
