//! HuggingFace Hub REST access: repo file listing and snapshot downloads.
//!
//! Files land in the standard hub cache layout
//! (`models--{org}--{repo}/snapshots/main/…`) so path resolution works the
//! same for files we fetched and files another tool fetched.

use crate::error::{GatewayError, Result};
use crate::fetch::{self, DownloadOptions};
use crate::paths;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const HF_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-file progress for the `pull` endpoint's SSE events.
#[derive(Debug, Clone)]
pub struct PullProgress {
    pub file: String,
    pub file_index: usize,
    pub total_files: usize,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
}

/// Callback for [`download_repo_files`] progress.
pub type PullProgressFn<'a> = &'a (dyn Fn(PullProgress) + Send + Sync);

#[derive(Debug, Deserialize)]
struct RepoInfoWire {
    #[serde(default)]
    siblings: Vec<SiblingWire>,
}

#[derive(Debug, Deserialize)]
struct SiblingWire {
    rfilename: String,
}

fn auth_headers() -> Vec<(String, String)> {
    match std::env::var("HF_TOKEN") {
        Ok(token) if !token.is_empty() => {
            vec![("Authorization".to_owned(), format!("Bearer {token}"))]
        }
        _ => Vec::new(),
    }
}

/// List the filenames in a HuggingFace repo.
///
/// # Errors
///
/// Returns [`GatewayError::Network`] on connect failure and
/// [`GatewayError::Download`] when the API rejects the repo.
pub async fn list_repo_files(repo_id: &str) -> Result<Vec<String>> {
    let url = format!(
        "https://huggingface.co/api/models/{}",
        urlencoding::encode(repo_id).replace("%2F", "/")
    );
    let resp = fetch::get(&url, &auth_headers(), HF_API_TIMEOUT).await?;
    if resp.status != 200 {
        return Err(GatewayError::Download(format!(
            "HuggingFace API returned {} for {repo_id}",
            resp.status
        )));
    }
    let info: RepoInfoWire = serde_json::from_str(&resp.body)
        .map_err(|e| GatewayError::Download(format!("bad repo listing for {repo_id}: {e}")))?;
    Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
}

/// Download URL for one file of a repo at the `main` revision.
pub fn file_url(repo_id: &str, filename: &str) -> String {
    format!("https://huggingface.co/{repo_id}/resolve/main/{filename}")
}

/// Snapshot directory files are placed in for `repo_id`.
pub fn snapshot_dir(repo_id: &str) -> PathBuf {
    paths::hf_repo_cache_dir(repo_id)
        .join("snapshots")
        .join("main")
}

/// Download the given repo files into the hub cache, resumable, with
/// per-file progress. Returns the snapshot directory.
///
/// # Errors
///
/// Returns [`GatewayError::Download`] when any file fails after retries.
pub async fn download_repo_files(
    repo_id: &str,
    files: &[String],
    progress: Option<PullProgressFn<'_>>,
) -> Result<PathBuf> {
    let snapshot = snapshot_dir(repo_id);
    tokio::fs::create_dir_all(&snapshot).await?;
    let headers = auth_headers();
    let total_files = files.len();

    for (index, file) in files.iter().enumerate() {
        let target = snapshot.join(file);
        info!(repo = repo_id, file, "fetching model file");

        let file_progress = progress.map(|cb| {
            let file = file.clone();
            move |done: u64, total: u64| {
                cb(PullProgress {
                    file: file.clone(),
                    file_index: index + 1,
                    total_files,
                    bytes_downloaded: done,
                    bytes_total: total,
                });
            }
        });
        let file_progress_ref: Option<&(dyn Fn(u64, u64) + Send + Sync)> =
            file_progress.as_ref().map(|f| f as _);

        fetch::download_file(
            &file_url(repo_id, file),
            &target,
            &DownloadOptions::default(),
            file_progress_ref,
            &headers,
        )
        .await
        .map_err(|e| GatewayError::Download(format!("{repo_id}/{file}: {e}")))?;
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_url_shape() {
        assert_eq!(
            file_url("unsloth/Qwen3-8B-GGUF", "qwen3-8b-Q4_1.gguf"),
            "https://huggingface.co/unsloth/Qwen3-8B-GGUF/resolve/main/qwen3-8b-Q4_1.gguf"
        );
    }

    #[test]
    fn snapshot_dir_under_repo_cache() {
        let dir = snapshot_dir("org/repo");
        assert!(dir.ends_with("models--org--repo/snapshots/main"));
    }

    #[test]
    fn repo_listing_parses_siblings() {
        let body = r#"{"id":"org/repo","siblings":[{"rfilename":"a.gguf"},{"rfilename":"README.md"}]}"#;
        let wire: RepoInfoWire = serde_json::from_str(body).expect("parses");
        let names: Vec<String> = wire.siblings.into_iter().map(|s| s.rfilename).collect();
        assert_eq!(names, vec!["a.gguf", "README.md"]);
    }

    #[test]
    fn repo_listing_tolerates_missing_siblings() {
        let wire: RepoInfoWire = serde_json::from_str(r#"{"id":"org/repo"}"#).expect("parses");
        assert!(wire.siblings.is_empty());
    }
}
