//! stable-diffusion.cpp backend: `sd-server` for image generation.
//!
//! sd-server speaks the OpenAI images API, but its extra knobs (steps,
//! cfg_scale, seed, sampler, scheduler) travel embedded in the prompt as
//! an `<sd_cpp_extra_args>{json}</sd_cpp_extra_args>` suffix.

use super::common::{BackendProcess, READY_TIMEOUT};
use super::LoadOptions;
use crate::error::{GatewayError, Result};
use crate::installer::{self, BackendSpec};
use crate::process::SpawnOptions;
use crate::registry::{ModelEntry, ModelRegistry};
use std::sync::Arc;
use tracing::info;

pub(crate) const SPEC: BackendSpec = BackendSpec {
    recipe: "sd-cpp",
    dir_name: "sd-cpp",
    binary: "sd-server",
    alt_binaries: &[],
    subdirs: &["bin"],
};

#[derive(Debug)]
pub struct SdServer {
    pub(crate) process: BackendProcess,
    pub(crate) registry: Arc<ModelRegistry>,
}

impl SdServer {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            process: BackendProcess::new("sd-server"),
            registry,
        }
    }

    /// Install sd-server from the stable-diffusion.cpp release archive.
    ///
    /// # Errors
    ///
    /// Propagates installer errors.
    pub async fn install(&mut self) -> Result<()> {
        let version = installer::expected_version(SPEC.recipe, "cpu")?;
        // Release tags are `master-NNN-HASH`; asset names drop the run
        // number: `sd-master-HASH-bin-…`.
        let short_version = shorten_version(&version);
        let filename = if cfg!(windows) {
            format!("sd-{short_version}-bin-win-avx2-x64.zip")
        } else if cfg!(target_os = "linux") {
            format!("sd-{short_version}-bin-Linux-Ubuntu-24.04-x86_64.zip")
        } else if cfg!(target_os = "macos") {
            format!("sd-{short_version}-bin-Darwin-macOS-15.7.2-arm64.zip")
        } else {
            return Err(GatewayError::Installation(
                "stable-diffusion.cpp is not supported on this platform".into(),
            ));
        };
        installer::install_from_github(&SPEC, "cpu", "leejet/stable-diffusion.cpp", &filename)
            .await?;
        Ok(())
    }

    /// Spawn sd-server for the entry's resolved weights file.
    ///
    /// # Errors
    ///
    /// Fails when the weights file is missing, on spawn failure, or on
    /// readiness timeout.
    pub async fn load(
        &mut self,
        entry: &ModelEntry,
        opts: &LoadOptions,
        _do_not_upgrade: bool,
    ) -> Result<()> {
        self.install().await?;

        let model_path = entry
            .resolved_path
            .as_ref()
            .filter(|p| p.is_file())
            .ok_or_else(|| GatewayError::ModelInvalidated {
                model: entry.name.clone(),
                reason: format!("weights file not found for checkpoint {}", entry.checkpoint),
            })?;

        let exe = SPEC
            .external_binary("cpu")
            .or_else(|| SPEC.find_executable(&SPEC.install_dir("cpu")))
            .ok_or_else(|| GatewayError::Installation("sd-server not installed".into()))?;

        let port = self.process.choose_port()?;
        let mut args: Vec<String> = vec![
            "-m".into(),
            model_path.display().to_string(),
            "--listen-port".into(),
            port.to_string(),
        ];
        if opts.debug {
            args.push("-v".into());
        }

        let mut env = Vec::new();
        if !cfg!(windows) {
            if let Some(exe_dir) = exe.parent() {
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

        // sd-server has no /health endpoint; probe the root.
        if let Err(e) = self.process.wait_for_ready("/", READY_TIMEOUT).await {
            self.process.stop().await;
            return Err(e);
        }
        info!(model = %entry.name, port, "sd-server ready");
        Ok(())
    }
}

/// `master-696-87f2bfc` → `master-87f2bfc`.
fn shorten_version(version: &str) -> String {
    let mut parts = version.splitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(prefix), Some(_run), Some(hash)) => format!("{prefix}-{hash}"),
        _ => version.to_owned(),
    }
}

/// Move sd-server's extra generation parameters into the prompt suffix it
/// expects.
pub fn embed_extra_args(mut request: serde_json::Value) -> serde_json::Value {
    let mut extra = serde_json::Map::new();
    for key in ["steps", "cfg_scale", "seed", "sample_method", "scheduler"] {
        if let Some(value) = request.get(key) {
            extra.insert(key.to_owned(), value.clone());
        }
    }
    if extra.is_empty() {
        return request;
    }

    let suffix = format!(
        " <sd_cpp_extra_args>{}</sd_cpp_extra_args>",
        serde_json::Value::Object(extra)
    );
    let prompt = request
        .get("prompt")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned();
    request["prompt"] = serde_json::json!(format!("{prompt}{suffix}"));
    request
}
