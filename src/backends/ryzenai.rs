//! RyzenAI (OGA) backend: `ryzenai-server` running ONNX GenAI model
//! folders on the NPU, the iGPU+NPU hybrid, or the CPU.

use super::common::{BackendProcess, READY_TIMEOUT};
use super::LoadOptions;
use crate::error::{GatewayError, Result};
use crate::installer::{self, BackendSpec};
use crate::process::SpawnOptions;
use crate::registry::{resolve, ModelEntry, ModelRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub(crate) const SPEC: BackendSpec = BackendSpec {
    recipe: "ryzenai",
    dir_name: "ryzenai-server",
    binary: "ryzenai-server",
    alt_binaries: &[],
    subdirs: &["bin"],
};

/// Map an OGA recipe to the server's `--mode` flag.
pub fn execution_mode(recipe: &str) -> &'static str {
    match recipe {
        "oga-npu" => "npu",
        "oga-hybrid" => "hybrid",
        "oga-cpu" => "cpu",
        _ => "auto",
    }
}

#[derive(Debug)]
pub struct RyzenaiServer {
    pub(crate) process: BackendProcess,
    pub(crate) registry: Arc<ModelRegistry>,
    mode: &'static str,
    executable: Option<PathBuf>,
}

impl RyzenaiServer {
    pub fn new(registry: Arc<ModelRegistry>, mode: &'static str) -> Self {
        Self {
            process: BackendProcess::new("ryzenai-server"),
            registry,
            mode,
            executable: None,
        }
    }

    /// Install ryzenai-server from its release archive.
    ///
    /// # Errors
    ///
    /// Propagates installer errors.
    pub async fn install(&mut self) -> Result<()> {
        let exe = installer::install_from_github(
            &SPEC,
            "",
            "lemonade-sdk/lemonade",
            "ryzenai-server.zip",
        )
        .await?;
        self.executable = Some(exe);
        Ok(())
    }

    /// Spawn ryzenai-server over the entry's GenAI model folder.
    ///
    /// # Errors
    ///
    /// Fails when the model folder is missing (`genai_config.json` not
    /// found), on spawn failure, or on readiness timeout.
    pub async fn load(
        &mut self,
        entry: &ModelEntry,
        opts: &LoadOptions,
        _do_not_upgrade: bool,
    ) -> Result<()> {
        self.install().await?;

        let model_dir = genai_model_dir(entry)?;
        info!(model = %entry.name, dir = %model_dir.display(), mode = self.mode, "loading OGA model");

        let exe = self
            .executable
            .clone()
            .ok_or_else(|| GatewayError::Installation("ryzenai-server not installed".into()))?;
        let port = self.process.choose_port()?;

        let mut args: Vec<String> = vec![
            "-m".into(),
            model_dir.display().to_string(),
            "--port".into(),
            port.to_string(),
            "--mode".into(),
            self.mode.to_owned(),
            "--ctx-size".into(),
            opts.ctx_size.to_string(),
        ];
        if opts.debug {
            args.push("--verbose".into());
        }

        self.process
            .spawn(
                &exe.display().to_string(),
                &args,
                SpawnOptions {
                    inherit_output: opts.debug,
                    filter_health_logs: true,
                    ..SpawnOptions::default()
                },
            )
            .await?;

        if let Err(e) = self.process.wait_for_ready("/health", READY_TIMEOUT).await {
            self.process.stop().await;
            return Err(e);
        }
        info!(model = %entry.name, port, "ryzenai-server ready");
        Ok(())
    }
}

fn genai_model_dir(entry: &ModelEntry) -> Result<PathBuf> {
    match &entry.resolved_path {
        Some(path) if path.join("genai_config.json").is_file() => Ok(path.clone()),
        Some(path) if path.is_dir() => {
            resolve::find_genai_config_dir(path).ok_or_else(|| GatewayError::ModelInvalidated {
                model: entry.name.clone(),
                reason: format!(
                    "no genai_config.json found under {} for checkpoint {}",
                    path.display(),
                    entry.checkpoint
                ),
            })
        }
        _ => Err(GatewayError::ModelInvalidated {
            model: entry.name.clone(),
            reason: format!("model folder not found for checkpoint {}", entry.checkpoint),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_mode_mapping() {
        assert_eq!(execution_mode("oga-npu"), "npu");
        assert_eq!(execution_mode("oga-hybrid"), "hybrid");
        assert_eq!(execution_mode("oga-cpu"), "cpu");
        assert_eq!(execution_mode("ryzenai"), "auto");
    }

    #[test]
    fn genai_dir_requires_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("snapshots/x");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let mut entry = ModelEntry {
            name: "m".into(),
            checkpoint: "amd/model-onnx".into(),
            recipe: "oga-npu".into(),
            labels: vec![],
            suggested: false,
            mmproj: None,
            source: None,
            resolved_path: Some(dir.path().to_path_buf()),
        };
        assert!(genai_model_dir(&entry).is_err());

        std::fs::write(nested.join("genai_config.json"), b"{}").expect("write");
        let found = genai_model_dir(&entry).expect("config found");
        assert_eq!(found, nested);

        entry.resolved_path = Some(nested.clone());
        assert_eq!(genai_model_dir(&entry).expect("direct dir"), nested);
    }
}
