//! Server configuration.
//!
//! Values flow from CLI flags, with `LEMONADE_*` environment variables as
//! fallbacks (the flag wins when both are present; clap's `env` attribute
//! handles that in the binary; this module holds the resolved state).

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};

/// Default context size passed to text backends.
pub const DEFAULT_CTX_SIZE: u32 = 4096;

/// Per-class caps on concurrently loaded models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCaps {
    /// Max loaded chat/completion models.
    pub llm: usize,
    /// Max loaded embedding models.
    pub embedding: usize,
    /// Max loaded reranking models.
    pub reranking: usize,
    /// Max loaded audio models (speech-to-text and text-to-speech share
    /// this cap).
    pub audio: usize,
    /// Max loaded image generation models.
    pub image: usize,
}

impl Default for ModelCaps {
    fn default() -> Self {
        Self {
            llm: 1,
            embedding: 1,
            reranking: 1,
            audio: 1,
            image: 1,
        }
    }
}

impl ModelCaps {
    /// Parse the `--max-loaded-models N [E] [R] [A] [I]` value list.
    ///
    /// Accepts 1, 3, 4, or 5 positive integers. Two values are rejected:
    /// a caller supplying embedding limits must also state reranking.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for an invalid count or a
    /// non-positive value.
    pub fn from_values(values: &[usize]) -> Result<Self> {
        if values.len() == 2 || values.is_empty() || values.len() > 5 {
            return Err(GatewayError::InvalidRequest(format!(
                "--max-loaded-models takes 1, 3, 4, or 5 values (got {})",
                values.len()
            )));
        }
        if let Some(bad) = values.iter().find(|v| **v == 0) {
            return Err(GatewayError::InvalidRequest(format!(
                "--max-loaded-models values must be positive integers (got {bad})"
            )));
        }

        let defaults = Self::default();
        Ok(Self {
            llm: values[0],
            embedding: values.get(1).copied().unwrap_or(defaults.embedding),
            reranking: values.get(2).copied().unwrap_or(defaults.reranking),
            audio: values.get(3).copied().unwrap_or(defaults.audio),
            image: values.get(4).copied().unwrap_or(defaults.image),
        })
    }
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: String,
    /// Port to serve on.
    pub port: u16,
    /// Log level: critical | error | warning | info | debug | trace.
    pub log_level: String,
    /// Context size for text backends.
    pub ctx_size: u32,
    /// llama.cpp backend variant: vulkan | rocm | metal | cpu.
    pub llamacpp_backend: String,
    /// Extra raw arguments appended to the llama-server command line.
    pub llamacpp_args: Vec<String>,
    /// Optional secondary directory scanned for loose GGUF files.
    pub extra_models_dir: Option<String>,
    /// Skip all network access; only cached artifacts are used.
    pub offline: bool,
    /// Disable UDP presence broadcasting on private networks.
    pub no_broadcast: bool,
    /// Per-class loaded-model caps.
    pub caps: ModelCaps,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8000,
            log_level: "info".to_owned(),
            ctx_size: DEFAULT_CTX_SIZE,
            llamacpp_backend: default_llamacpp_backend().to_owned(),
            llamacpp_args: Vec::new(),
            extra_models_dir: None,
            offline: false,
            no_broadcast: false,
            caps: ModelCaps::default(),
        }
    }
}

impl ServerConfig {
    /// Apply `LEMONADE_*` environment variables on top of the defaults.
    /// CLI flags are layered on afterwards by the binary.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("LEMONADE_HOST") {
            if !v.is_empty() {
                config.host = v;
            }
        }
        if let Ok(v) = std::env::var("LEMONADE_PORT") {
            if let Ok(port) = v.parse() {
                config.port = port;
            }
        }
        if let Ok(v) = std::env::var("LEMONADE_LOG_LEVEL") {
            if !v.is_empty() {
                config.log_level = v;
            }
        }
        if let Ok(v) = std::env::var("LEMONADE_CTX_SIZE") {
            if let Ok(ctx) = v.parse() {
                config.ctx_size = ctx;
            }
        }
        if let Ok(v) = std::env::var("LEMONADE_LLAMACPP") {
            if !v.is_empty() {
                config.llamacpp_backend = v;
            }
        }
        if let Ok(v) = std::env::var("LEMONADE_LLAMACPP_ARGS") {
            config.llamacpp_args = v.split_whitespace().map(str::to_owned).collect();
        }
        if let Ok(v) = std::env::var("LEMONADE_EXTRA_MODELS_DIR") {
            if !v.is_empty() {
                config.extra_models_dir = Some(v);
            }
        }
        config.offline = env_flag("LEMONADE_OFFLINE");
        config.no_broadcast = env_flag("LEMONADE_NO_BROADCAST");
        config
    }

    /// Whether subprocess output should be inherited by the gateway's
    /// stdout (debug and trace levels only).
    pub fn is_debug(&self) -> bool {
        self.log_level == "debug" || self.log_level == "trace"
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// Platform-default llama.cpp variant: metal on macOS, vulkan elsewhere.
pub fn default_llamacpp_backend() -> &'static str {
    if cfg!(target_os = "macos") {
        "metal"
    } else {
        "vulkan"
    }
}
