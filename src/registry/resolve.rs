//! Checkpoint-to-path resolution and GGUF variant selection.
//!
//! A checkpoint names a HuggingFace repo plus an optional `:variant` that
//! selects a file inside it. The variant can be a full filename, a
//! quantization tag, a folder of shards, or the wildcard `*`. Resolution
//! is pure over `(checkpoint, cache contents)` so the same inputs always
//! produce the same path.

use std::path::{Path, PathBuf};

/// Split `repo_id[:variant]`. Only the first colon separates; Windows
/// drive letters never reach this function (local uploads resolve
/// elsewhere).
pub fn split_checkpoint(checkpoint: &str) -> (&str, Option<&str>) {
    match checkpoint.split_once(':') {
        Some((repo, variant)) => (repo, Some(variant)),
        None => (checkpoint, None),
    }
}

/// Collect every `.gguf` under `root`, excluding multimodal projector
/// files, sorted ascending for stable tie-breaks.
pub fn collect_gguf_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect_recursive(root, &mut |path| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".gguf") && !name.contains("mmproj") {
            files.push(path.to_path_buf());
        }
    });
    files.sort();
    files
}

/// Find the directory containing `genai_config.json` (OGA model layout).
pub fn find_genai_config_dir(root: &Path) -> Option<PathBuf> {
    let mut found = None;
    collect_recursive(root, &mut |path| {
        if found.is_none() && path.file_name().is_some_and(|n| n == "genai_config.json") {
            found = path.parent().map(Path::to_path_buf);
        }
    });
    found
}

fn collect_recursive(dir: &Path, visit: &mut dyn FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_recursive(&path, visit);
        } else {
            visit(&path);
        }
    }
}

/// Select one GGUF from `files` (already sorted) for `variant`, relative
/// to the repo cache `root`.
///
/// Selection rules, case-insensitive:
/// 1. `*` or empty → first file (the backend auto-loads shards).
/// 2. `…​.gguf` → basename equality, falling back to the first file.
/// 3. Quantization tag → first file whose basename ends with
///    `{variant}.gguf`.
/// 4. Folder tag → first file whose path contains `{variant}/`.
/// 5. Fallback → first file.
pub fn select_gguf(files: &[PathBuf], root: &Path, variant: Option<&str>) -> Option<PathBuf> {
    let first = files.first()?.clone();

    let variant = match variant {
        None | Some("") | Some("*") => return Some(first),
        Some(v) => v,
    };
    let variant_lower = variant.to_lowercase();

    if variant_lower.ends_with(".gguf") {
        return Some(
            files
                .iter()
                .find(|f| {
                    f.file_name()
                        .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(variant))
                })
                .cloned()
                .unwrap_or(first),
        );
    }

    let suffix = format!("{variant_lower}.gguf");
    if let Some(by_suffix) = files.iter().find(|f| {
        f.file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .is_some_and(|n| n.ends_with(&suffix))
    }) {
        return Some(by_suffix.clone());
    }

    let folder = format!("{variant_lower}/");
    if let Some(by_folder) = files.iter().find(|f| {
        f.strip_prefix(root)
            .map(|rel| rel.to_string_lossy().to_lowercase().contains(&folder))
            .unwrap_or(false)
    }) {
        return Some(by_folder.clone());
    }

    Some(first)
}

/// The set of repo files a download needs, chosen from an HF file listing
/// with the same variant rules as local resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    /// Repo-relative filenames to fetch, primary file first.
    pub files: Vec<String>,
}

/// Plan which repo files to download for a GGUF checkpoint.
///
/// Mirrors [`select_gguf`] against a remote file listing, with two
/// differences required for fetching: the wildcard and folder variants
/// pull *all* matching shards, and a named `mmproj` file is appended.
///
/// # Errors
///
/// Returns a description of the mismatch when no file satisfies the
/// variant or the `mmproj` file is absent.
pub fn plan_gguf_download(
    checkpoint: &str,
    repo_files: &[String],
    mmproj: Option<&str>,
) -> std::result::Result<DownloadPlan, String> {
    let (_, variant) = split_checkpoint(checkpoint);
    let ggufs = |exclude_mmproj: bool| {
        let mut v: Vec<&String> = repo_files
            .iter()
            .filter(|f| {
                let lower = f.to_lowercase();
                lower.ends_with(".gguf") && (!exclude_mmproj || !lower.contains("mmproj"))
            })
            .collect();
        v.sort();
        v
    };

    let mut files: Vec<String> = match variant {
        Some("*") => {
            let all = ggufs(false);
            if all.is_empty() {
                return Err(format!("no .gguf files found in repository {checkpoint}"));
            }
            all.into_iter().cloned().collect()
        }
        Some(v) if v.to_lowercase().ends_with(".gguf") => {
            if !repo_files.iter().any(|f| f == v) {
                return Err(format!("file {v} not found in repository {checkpoint}"));
            }
            vec![v.to_owned()]
        }
        None | Some("") => {
            let all = ggufs(true);
            match all.first() {
                Some(first) => vec![(*first).clone()],
                None => {
                    return Err(format!("no .gguf files found in repository {checkpoint}"));
                }
            }
        }
        Some(v) => {
            let suffix = format!("{}.gguf", v.to_lowercase());
            let by_suffix: Vec<&String> = ggufs(true)
                .into_iter()
                .filter(|f| f.to_lowercase().ends_with(&suffix))
                .collect();
            match by_suffix.len() {
                1 => vec![by_suffix[0].clone()],
                n if n > 1 => {
                    return Err(format!(
                        "multiple .gguf files match variant {v}, but only one is allowed"
                    ));
                }
                _ => {
                    // Folder of shards.
                    let prefix = format!("{}/", v.to_lowercase());
                    let shards: Vec<String> = ggufs(false)
                        .into_iter()
                        .filter(|f| f.to_lowercase().starts_with(&prefix))
                        .cloned()
                        .collect();
                    if shards.is_empty() {
                        return Err(format!("no .gguf files found for variant {v}"));
                    }
                    shards
                }
            }
        }
    };

    if let Some(mmproj) = mmproj {
        if !mmproj.is_empty() {
            if !repo_files.iter().any(|f| f == mmproj) {
                return Err(format!(
                    "the provided mmproj file {mmproj} was not found in {checkpoint}"
                ));
            }
            files.push(mmproj.to_owned());
        }
    }

    Ok(DownloadPlan { files })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(root: &Path, names: &[&str]) -> Vec<PathBuf> {
        let mut v: Vec<PathBuf> = names.iter().map(|n| root.join(n)).collect();
        v.sort();
        v
    }

    #[test]
    fn split_checkpoint_forms() {
        assert_eq!(split_checkpoint("org/repo"), ("org/repo", None));
        assert_eq!(split_checkpoint("org/repo:Q4_0"), ("org/repo", Some("Q4_0")));
        assert_eq!(split_checkpoint("org/repo:*"), ("org/repo", Some("*")));
    }

    #[test]
    fn select_wildcard_returns_first_sorted() {
        let root = Path::new("/cache/models--o--r");
        let files = paths(root, &["b.gguf", "a.gguf"]);
        let chosen = select_gguf(&files, root, Some("*")).expect("non-empty");
        assert_eq!(chosen, root.join("a.gguf"));
    }

    #[test]
    fn select_empty_variant_returns_first() {
        let root = Path::new("/cache/m");
        let files = paths(root, &["model-q4.gguf", "model-q8.gguf"]);
        let chosen = select_gguf(&files, root, None).expect("non-empty");
        assert_eq!(chosen, root.join("model-q4.gguf"));
    }

    #[test]
    fn select_exact_filename_case_insensitive() {
        let root = Path::new("/cache/m");
        let files = paths(root, &["Model-Q4_K_M.gguf", "model-q8_0.gguf"]);
        let chosen =
            select_gguf(&files, root, Some("model-q4_k_m.gguf")).expect("non-empty");
        assert_eq!(chosen, root.join("Model-Q4_K_M.gguf"));
    }

    #[test]
    fn select_quant_suffix() {
        let root = Path::new("/cache/m");
        let files = paths(root, &["qwen3-8b-Q4_1.gguf", "qwen3-8b-Q8_0.gguf"]);
        let chosen = select_gguf(&files, root, Some("q4_1")).expect("non-empty");
        assert_eq!(chosen, root.join("qwen3-8b-Q4_1.gguf"));
    }

    #[test]
    fn select_folder_variant() {
        let root = Path::new("/cache/m");
        let mut files = vec![
            root.join("Q4_0/model-00001-of-00002.gguf"),
            root.join("Q4_0/model-00002-of-00002.gguf"),
            root.join("other.gguf"),
        ];
        files.sort();
        let chosen = select_gguf(&files, root, Some("q4_0")).expect("non-empty");
        assert_eq!(chosen, root.join("Q4_0/model-00001-of-00002.gguf"));
    }

    #[test]
    fn select_unknown_variant_falls_back_to_first() {
        let root = Path::new("/cache/m");
        let files = paths(root, &["only.gguf"]);
        let chosen = select_gguf(&files, root, Some("nonexistent")).expect("non-empty");
        assert_eq!(chosen, root.join("only.gguf"));
    }

    #[test]
    fn select_empty_file_list_is_none() {
        assert!(select_gguf(&[], Path::new("/cache/m"), Some("q4")).is_none());
    }

    #[test]
    fn resolution_is_deterministic() {
        let root = Path::new("/cache/m");
        let files = paths(root, &["z.gguf", "m.gguf", "a.gguf"]);
        let first = select_gguf(&files, root, Some("missing"));
        let second = select_gguf(&files, root, Some("missing"));
        assert_eq!(first, second);
    }

    #[test]
    fn plan_wildcard_downloads_all_shards() {
        let repo_files = vec![
            "model-00002-of-00002.gguf".to_owned(),
            "model-00001-of-00002.gguf".to_owned(),
            "README.md".to_owned(),
        ];
        let plan = plan_gguf_download("org/repo:*", &repo_files, None).expect("wildcard plans");
        assert_eq!(
            plan.files,
            vec!["model-00001-of-00002.gguf", "model-00002-of-00002.gguf"]
        );
    }

    #[test]
    fn plan_exact_file_must_exist() {
        let repo_files = vec!["model-q4.gguf".to_owned()];
        assert!(plan_gguf_download("org/repo:missing.gguf", &repo_files, None).is_err());
        let plan = plan_gguf_download("org/repo:model-q4.gguf", &repo_files, None)
            .expect("exact file plans");
        assert_eq!(plan.files, vec!["model-q4.gguf"]);
    }

    #[test]
    fn plan_ambiguous_quant_rejected() {
        let repo_files = vec!["a-Q4_0.gguf".to_owned(), "b-Q4_0.gguf".to_owned()];
        assert!(plan_gguf_download("org/repo:Q4_0", &repo_files, None).is_err());
    }

    #[test]
    fn plan_default_skips_mmproj_files() {
        let repo_files = vec!["mmproj-model.gguf".to_owned(), "weights.gguf".to_owned()];
        let plan = plan_gguf_download("org/repo", &repo_files, None).expect("plans");
        assert_eq!(plan.files, vec!["weights.gguf"]);
    }

    #[test]
    fn plan_appends_mmproj_when_named() {
        let repo_files = vec!["weights.gguf".to_owned(), "mmproj-f16.gguf".to_owned()];
        let plan = plan_gguf_download("org/repo", &repo_files, Some("mmproj-f16.gguf"))
            .expect("plans");
        assert_eq!(plan.files, vec!["weights.gguf", "mmproj-f16.gguf"]);
        assert!(plan_gguf_download("org/repo", &repo_files, Some("absent.gguf")).is_err());
    }

    #[test]
    fn genai_config_scan_finds_enclosing_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("snapshots/abc/cpu-int4");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(nested.join("genai_config.json"), b"{}").expect("write");
        let found = find_genai_config_dir(dir.path()).expect("found");
        assert_eq!(found, nested);
    }

    #[test]
    fn collect_gguf_excludes_mmproj() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("model.gguf"), b"x").expect("write");
        std::fs::write(dir.path().join("mmproj-model.gguf"), b"x").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"x").expect("write");
        let files = collect_gguf_files(dir.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("model.gguf"));
    }
}
