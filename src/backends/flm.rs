//! FastFlowLM backend: the `flm` CLI serving NPU-resident models.
//!
//! FLM manages its own model registry (`flm pull` / `flm list`), installs
//! through an Inno Setup installer rather than a release archive, and has
//! no `/health` endpoint, so readiness is probed via `/api/tags`.

use super::common::{BackendProcess, READY_TIMEOUT};
use super::LoadOptions;
use crate::error::{GatewayError, Result};
use crate::installer;
use crate::process::SpawnOptions;
use crate::registry::{ModelEntry, ModelRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct FlmServer {
    pub(crate) process: BackendProcess,
    pub(crate) registry: Arc<ModelRegistry>,
    executable: Option<PathBuf>,
}

impl FlmServer {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            process: BackendProcess::new("flm-server"),
            registry,
            executable: None,
        }
    }

    /// Ensure the FLM CLI is installed and current.
    ///
    /// # Errors
    ///
    /// Propagates installer errors (FLM installs only on Windows; an
    /// existing PATH binary is accepted anywhere).
    pub async fn install(&mut self) -> Result<()> {
        if let Some(existing) = installer::find_flm_binary() {
            self.executable = Some(existing);
            return Ok(());
        }
        let exe = installer::install_or_upgrade_flm().await?;
        self.executable = Some(exe);
        Ok(())
    }

    /// Pull the model through the FLM CLI's own registry.
    ///
    /// # Errors
    ///
    /// Propagates `flm pull` failures.
    pub async fn download_model(&self, entry: &ModelEntry, do_not_upgrade: bool) -> Result<()> {
        if do_not_upgrade {
            let installed = self.registry.flm_installed_models().await;
            if installed.iter().any(|m| *m == entry.checkpoint) {
                info!(model = %entry.checkpoint, "FLM model already installed");
                return Ok(());
            }
        }
        self.registry
            .download_model(
                &entry.name,
                Some(&entry.checkpoint),
                Some("flm"),
                &entry.labels,
                None,
                do_not_upgrade,
                None,
            )
            .await
    }

    /// Start `flm serve` and wait for `/api/tags` to answer.
    ///
    /// # Errors
    ///
    /// Fails on spawn or readiness-timeout; the subprocess is stopped on
    /// a failed wait.
    pub async fn load(
        &mut self,
        entry: &ModelEntry,
        opts: &LoadOptions,
        _do_not_upgrade: bool,
    ) -> Result<()> {
        self.install().await?;

        let exe = self
            .executable
            .clone()
            .ok_or_else(|| GatewayError::Installation("flm not installed".into()))?;
        let port = self.process.choose_port()?;

        let args: Vec<String> = vec![
            "serve".into(),
            entry.checkpoint.clone(),
            "--ctx-len".into(),
            opts.ctx_size.to_string(),
            "--port".into(),
            port.to_string(),
        ];

        // FLM spams its stdout with an interactive banner and health-poll
        // log lines; always filter.
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

        if let Err(e) = self.process.wait_for_ready("/api/tags", READY_TIMEOUT).await {
            self.process.stop().await;
            return Err(e);
        }
        info!(model = %entry.name, port, "flm-server ready");
        Ok(())
    }
}
