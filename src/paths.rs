//! Well-known directories: gateway cache, HuggingFace hub cache, backend
//! install root, and the server log file.
//!
//! Everything here is computable without touching the network, so model
//! paths can be resolved in offline mode.

use std::env;
use std::path::PathBuf;

/// Gateway cache directory.
///
/// `LEMONADE_CACHE_DIR` wins; otherwise `~/.cache/lemonade`
/// (`%USERPROFILE%\.cache\lemonade` on Windows).
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = env::var("LEMONADE_CACHE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    home_dir().join(".cache").join("lemonade")
}

/// Path of the mutable user model catalogue.
pub fn user_models_file() -> PathBuf {
    cache_dir().join("user_models.json")
}

/// Path of the cached hardware probe result.
pub fn system_info_file() -> PathBuf {
    cache_dir().join("system_info.json")
}

/// HuggingFace hub cache: `HF_HUB_CACHE`, then `HF_HOME` (+ `/hub`), then
/// the platform default `~/.cache/huggingface/hub`.
pub fn hf_cache_dir() -> PathBuf {
    if let Ok(dir) = env::var("HF_HUB_CACHE") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(dir) = env::var("HF_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("hub");
        }
    }
    home_dir().join(".cache").join("huggingface").join("hub")
}

/// HF cache subdirectory for a repo: `models--{org}--{name}`.
pub fn hf_repo_cache_dir(repo_id: &str) -> PathBuf {
    let dir_name = format!("models--{}", repo_id.replace('/', "--"));
    hf_cache_dir().join(dir_name)
}

/// Root under which backend binaries are installed:
/// `{exe_dir}/downloaded_bin/{recipe}[/{variant}]`.
pub fn downloaded_bin_dir() -> PathBuf {
    exe_dir().join("downloaded_bin")
}

/// Directory containing the running executable, falling back to the current
/// working directory when it cannot be determined.
pub fn exe_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
        .or_else(|| env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// The server log file, tailed by the `logs/stream` endpoint.
pub fn log_file() -> PathBuf {
    env::temp_dir().join("lemonade-server.log")
}

/// Scratch directory for audio uploads in transit to whisper-server.
pub fn audio_temp_dir() -> PathBuf {
    env::temp_dir().join("lemonade_audio")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hf_repo_cache_dir_replaces_slashes() {
        let dir = hf_repo_cache_dir("unsloth/Qwen3-4B-GGUF");
        let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
        assert_eq!(name, "models--unsloth--Qwen3-4B-GGUF");
    }

    #[test]
    fn hf_repo_cache_dir_single_segment() {
        let dir = hf_repo_cache_dir("gpt2");
        let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
        assert_eq!(name, "models--gpt2");
    }

    #[test]
    fn cache_dir_ends_with_lemonade_by_default() {
        // Only meaningful when the override is unset, which is the common
        // test environment.
        if env::var("LEMONADE_CACHE_DIR").is_err() {
            assert!(cache_dir().ends_with(".cache/lemonade") || cfg!(windows));
        }
    }
}
