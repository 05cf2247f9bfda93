//! llama.cpp backend: `llama-server` wrapping GGUF checkpoints.
//!
//! Serves chat/completions, and embeddings/reranking when the model's
//! labels say so. Release archives come from `ggml-org/llama.cpp`
//! (vulkan/metal) or `lemonade-sdk/llamacpp-rocm` (ROCm, per-architecture
//! assets).

use super::common::{BackendProcess, READY_TIMEOUT};
use super::LoadOptions;
use crate::error::{GatewayError, Result};
use crate::installer::{self, BackendSpec};
use crate::process::SpawnOptions;
use crate::registry::{resolve, ModelEntry, ModelRegistry};
use crate::telemetry::Telemetry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub(crate) const SPEC: BackendSpec = BackendSpec {
    recipe: "llamacpp",
    dir_name: "llamacpp",
    binary: "llama-server",
    alt_binaries: &[],
    subdirs: &["build/bin", "bin"],
};

#[derive(Debug)]
pub struct LlamaCppServer {
    pub(crate) process: BackendProcess,
    pub(crate) registry: Arc<ModelRegistry>,
    executable: Option<PathBuf>,
}

impl LlamaCppServer {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            process: BackendProcess::new("llama-server"),
            registry,
            executable: None,
        }
    }

    /// Install the llama-server build for the configured variant.
    ///
    /// # Errors
    ///
    /// Propagates installer errors.
    pub async fn install(&mut self, opts: &LoadOptions) -> Result<()> {
        let variant = opts.llamacpp_variant.as_str();
        let version = installer::expected_version(SPEC.recipe, variant)?;
        let (repo, filename) = release_asset(variant, &version, opts)?;
        let exe = installer::install_from_github(&SPEC, variant, &repo, &filename).await?;
        self.executable = Some(exe);
        Ok(())
    }

    /// Spawn llama-server for the entry's resolved GGUF.
    ///
    /// # Errors
    ///
    /// Fails when no GGUF is resolvable, the spawn fails, or the server
    /// never reports healthy.
    pub async fn load(
        &mut self,
        entry: &ModelEntry,
        opts: &LoadOptions,
        _do_not_upgrade: bool,
    ) -> Result<()> {
        self.install(opts).await?;

        let gguf_path = resolved_gguf(entry)?;
        info!(model = %entry.name, gguf = %gguf_path.display(), "loading GGUF");

        let port = self.process.choose_port()?;
        let mut args: Vec<String> = vec![
            "-m".into(),
            gguf_path.display().to_string(),
            "--ctx-size".into(),
            opts.ctx_size.to_string(),
            "--port".into(),
            port.to_string(),
            "--jinja".into(),
        ];

        // Context shift is unsupported on Metal.
        if opts.llamacpp_variant == "vulkan" || opts.llamacpp_variant == "rocm" {
            args.push("--context-shift".into());
        }
        args.push("--keep".into());
        args.push("16".into());
        args.push("--reasoning-format".into());
        args.push("auto".into());

        if entry.has_label("embeddings") || entry.has_label("embedding") {
            args.push("--embeddings".into());
        }
        if entry.has_label("reranking") {
            args.push("--reranking".into());
        }

        if let Some(mmproj) = &entry.mmproj {
            if let Some(mmproj_path) = find_mmproj(&gguf_path, mmproj) {
                args.push("--mmproj".into());
                args.push(mmproj_path.display().to_string());
            }
        }

        args.push("-ngl".into());
        args.push("99".into());
        args.extend(opts.llamacpp_args.iter().cloned());

        let exe = self
            .executable
            .clone()
            .ok_or_else(|| GatewayError::Installation("llama-server not installed".into()))?;

        // llama-server prints prompt/eval timing statistics per request;
        // the observer folds them into the model's telemetry.
        let telemetry = std::sync::Arc::clone(&opts.telemetry);
        let observer: crate::process::LineObserver = std::sync::Arc::new(move |line: &str| {
            if let Ok(mut guard) = telemetry.lock() {
                parse_stdout_telemetry(line, &mut guard);
            }
        });

        self.process
            .spawn(
                &exe.display().to_string(),
                &args,
                SpawnOptions {
                    inherit_output: opts.debug,
                    filter_health_logs: opts.debug,
                    line_observer: Some(observer),
                    ..SpawnOptions::default()
                },
            )
            .await?;

        if let Err(e) = self.process.wait_for_ready("/health", READY_TIMEOUT).await {
            self.process.stop().await;
            return Err(e);
        }
        info!(model = %entry.name, port, "llama-server ready");
        Ok(())
    }
}

fn resolved_gguf(entry: &ModelEntry) -> Result<PathBuf> {
    match &entry.resolved_path {
        Some(path) if path.is_file() => Ok(path.clone()),
        Some(path) if path.is_dir() => {
            // Entry resolved before the download landed; rescan.
            let (_, variant) = resolve::split_checkpoint(&entry.checkpoint);
            let files = resolve::collect_gguf_files(path);
            resolve::select_gguf(&files, path, variant)
                .ok_or_else(|| gguf_missing(entry))
        }
        _ => Err(gguf_missing(entry)),
    }
}

fn gguf_missing(entry: &ModelEntry) -> GatewayError {
    GatewayError::ModelInvalidated {
        model: entry.name.clone(),
        reason: format!("no GGUF file found for checkpoint {}", entry.checkpoint),
    }
}

/// Locate the multimodal projector next to the resolved weights.
fn find_mmproj(gguf_path: &Path, mmproj: &str) -> Option<PathBuf> {
    let dir = gguf_path.parent()?;
    let direct = dir.join(mmproj);
    if direct.is_file() {
        return Some(direct);
    }
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        if entry
            .file_name()
            .to_string_lossy()
            .eq_ignore_ascii_case(mmproj)
        {
            return Some(entry.path());
        }
    }
    None
}

/// GitHub repo and asset filename for a llama-server release.
fn release_asset(variant: &str, version: &str, opts: &LoadOptions) -> Result<(String, String)> {
    match variant {
        "rocm" => {
            let arch = installer::identify_rocm_arch(opts.oracle.as_ref());
            let os = if cfg!(windows) {
                "windows"
            } else if cfg!(target_os = "linux") {
                "ubuntu"
            } else {
                return Err(GatewayError::Installation(
                    "ROCm llama.cpp is only supported on Windows and Linux".into(),
                ));
            };
            Ok((
                "lemonade-sdk/llamacpp-rocm".to_owned(),
                format!("llama-{version}-{os}-rocm-{arch}-x64.zip"),
            ))
        }
        "metal" => {
            if !cfg!(target_os = "macos") {
                return Err(GatewayError::Installation(
                    "Metal llama.cpp is only supported on macOS".into(),
                ));
            }
            Ok((
                "ggml-org/llama.cpp".to_owned(),
                format!("llama-{version}-bin-macos-arm64.zip"),
            ))
        }
        _ => {
            let filename = if cfg!(windows) {
                format!("llama-{version}-bin-win-vulkan-x64.zip")
            } else if cfg!(target_os = "linux") {
                format!("llama-{version}-bin-ubuntu-vulkan-x64.zip")
            } else {
                return Err(GatewayError::Installation(
                    "Vulkan llama.cpp is only supported on Windows and Linux".into(),
                ));
            };
            Ok(("ggml-org/llama.cpp".to_owned(), filename))
        }
    }
}

/// Parse llama-server stdout timing lines into telemetry.
///
/// The server prints, per request:
/// `prompt eval time =    250.00 ms /     8 tokens (...)  32.00 tokens per second`
/// `       eval time =   1523.00 ms /    64 tokens (...)  42.01 tokens per second`
pub fn parse_stdout_telemetry(line: &str, telemetry: &mut Telemetry) {
    if let Some(parsed) = parse_timing_line(line, "prompt eval time") {
        telemetry.input_tokens = parsed.tokens;
        telemetry.time_to_first_token = parsed.millis / 1000.0;
    } else if let Some(parsed) = parse_timing_line(line, "eval time") {
        telemetry.output_tokens = parsed.tokens;
        telemetry.tokens_per_second = parsed.tokens_per_second;
    }
}

struct TimingLine {
    millis: f64,
    tokens: u64,
    tokens_per_second: f64,
}

fn parse_timing_line(line: &str, marker: &str) -> Option<TimingLine> {
    let idx = line.find(marker)?;
    // "prompt eval time" also contains "eval time"; require the marker to
    // start the statistic, not sit inside a longer one.
    if marker == "eval time" && line[..idx].trim_end().ends_with("prompt") {
        return None;
    }
    let rest = line[idx + marker.len()..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();

    let (millis_str, rest) = rest.split_once("ms")?;
    let millis: f64 = millis_str.trim().parse().ok()?;

    let rest = rest.trim_start().strip_prefix('/')?;
    let (tokens_str, rest) = rest.trim_start().split_once("tokens")?;
    let tokens: u64 = tokens_str.trim().parse().ok()?;

    let tokens_per_second = rest
        .rfind("tokens per second")
        .and_then(|end| {
            let before = rest[..end].trim_end();
            let start = before.rfind(|c: char| !(c.is_ascii_digit() || c == '.'))?;
            before[start + 1..].parse::<f64>().ok()
        })
        .unwrap_or(0.0);

    Some(TimingLine {
        millis,
        tokens,
        tokens_per_second,
    })
}
