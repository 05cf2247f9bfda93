//! Model registry: the built-in catalogue, the per-user catalogue, and the
//! mapping from logical model names to on-disk artifacts.
//!
//! The built-in catalogue ships inside the binary; the user catalogue is a
//! JSON file in the gateway cache directory. Entries from the user scope
//! are addressed with a `user.` prefix so the two namespaces cannot
//! collide.

pub mod hf;
pub mod resolve;

use crate::error::{GatewayError, Result};
use crate::hardware::HardwareOracle;
use crate::paths;
use crate::process;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Built-in catalogue, embedded at compile time. A parse failure is fatal
/// at startup: the gateway cannot serve without it.
const SERVER_MODELS_JSON: &str = include_str!("../../resources/server_models.json");

/// All recipes the gateway understands.
pub const RECIPES: &[&str] = &[
    "llamacpp",
    "flm",
    "oga-cpu",
    "oga-npu",
    "oga-hybrid",
    "whispercpp",
    "kokoro",
    "sd-cpp",
];

/// Model class used for cap enforcement and LRU bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Llm,
    Embedding,
    Reranking,
    Audio,
    AudioOut,
    Image,
}

impl ModelType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Embedding => "embedding",
            Self::Reranking => "reranking",
            Self::Audio => "audio",
            Self::AudioOut => "audio_out",
            Self::Image => "image",
        }
    }

    /// Classify a model by recipe and labels.
    pub fn classify(recipe: &str, labels: &[String]) -> Self {
        match recipe {
            "kokoro" => return Self::AudioOut,
            "sd-cpp" => return Self::Image,
            "whispercpp" => return Self::Audio,
            _ => {}
        }
        for label in labels {
            match label.as_str() {
                "embeddings" | "embedding" => return Self::Embedding,
                "reranking" => return Self::Reranking,
                "audio" => return Self::Audio,
                "image" => return Self::Image,
                _ => {}
            }
        }
        Self::Llm
    }
}

/// Catalogue entry shape shared by both JSON documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogueEntry {
    #[serde(default)]
    pub checkpoint: String,
    #[serde(default)]
    pub recipe: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub suggested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A fully resolved model entry.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    /// Logical name, unique across built-in and user scopes.
    pub name: String,
    pub checkpoint: String,
    pub recipe: String,
    pub labels: Vec<String>,
    pub suggested: bool,
    pub mmproj: Option<String>,
    pub source: Option<String>,
    /// Computed on-disk artifact location. `None` for FLM entries, whose
    /// download state lives in the FLM CLI's own registry.
    pub resolved_path: Option<PathBuf>,
}

impl ModelEntry {
    pub fn model_type(&self) -> ModelType {
        ModelType::classify(&self.recipe, &self.labels)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// The model registry.
#[derive(Debug)]
pub struct ModelRegistry {
    server_models: BTreeMap<String, CatalogueEntry>,
    user_models: Mutex<BTreeMap<String, CatalogueEntry>>,
    /// Positive download-state cache; invalidated on delete and download.
    downloaded_cache: Mutex<HashMap<String, bool>>,
    oracle: Arc<dyn HardwareOracle>,
    extra_models_dir: Option<PathBuf>,
    offline: bool,
}

impl ModelRegistry {
    /// Load both catalogues.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::File`] when the built-in catalogue does not
    /// parse (a broken build; fatal at startup). A broken user catalogue
    /// only logs a warning and starts empty.
    pub fn new(
        oracle: Arc<dyn HardwareOracle>,
        extra_models_dir: Option<PathBuf>,
        offline: bool,
    ) -> Result<Self> {
        let server_models: BTreeMap<String, CatalogueEntry> =
            serde_json::from_str(SERVER_MODELS_JSON).map_err(|e| {
                GatewayError::File(format!("embedded server_models.json is invalid: {e}"))
            })?;

        let user_models = match load_user_catalogue(&paths::user_models_file()) {
            Ok(models) => models,
            Err(e) => {
                warn!(error = %e, "could not load user_models.json, starting empty");
                BTreeMap::new()
            }
        };

        Ok(Self {
            server_models,
            user_models: Mutex::new(user_models),
            downloaded_cache: Mutex::new(HashMap::new()),
            oracle,
            extra_models_dir,
            offline,
        })
    }

    /// Union of built-in and user entries, filtered by backend
    /// availability, with resolved paths attached.
    pub fn get_supported_models(&self) -> BTreeMap<String, ModelEntry> {
        let mut models = BTreeMap::new();

        for (name, entry) in &self.server_models {
            models.insert(name.clone(), self.build_entry(name.clone(), entry));
        }

        let user = lock_or_recover(&self.user_models);
        for (name, entry) in user.iter() {
            let full_name = format!("user.{name}");
            models.insert(full_name.clone(), self.build_entry(full_name, entry));
        }
        drop(user);

        for entry in self.scan_extra_models_dir() {
            models.entry(entry.name.clone()).or_insert(entry);
        }

        self.filter_by_backend(models)
    }

    /// Supported models whose artifacts are present on disk. FLM entries
    /// consult the FLM CLI's installed list instead of the filesystem.
    pub async fn get_downloaded_models(&self) -> BTreeMap<String, ModelEntry> {
        let supported = self.get_supported_models();
        let needs_flm = supported.values().any(|m| m.recipe == "flm");
        let flm_installed = if needs_flm {
            self.flm_installed_models().await
        } else {
            Vec::new()
        };

        supported
            .into_iter()
            .filter(|(_, entry)| self.entry_downloaded(entry, &flm_installed))
            .collect()
    }

    /// Look up one model by logical name.
    pub fn get_model(&self, name: &str) -> Option<ModelEntry> {
        self.get_supported_models().remove(name)
    }

    /// Whether a model's artifacts are present locally.
    pub async fn is_model_downloaded(&self, name: &str) -> bool {
        let Some(entry) = self.get_model(name) else {
            return false;
        };
        let flm_installed = if entry.recipe == "flm" {
            self.flm_installed_models().await
        } else {
            Vec::new()
        };
        self.entry_downloaded(&entry, &flm_installed)
    }

    fn entry_downloaded(&self, entry: &ModelEntry, flm_installed: &[String]) -> bool {
        if let Some(cached) = lock_or_recover(&self.downloaded_cache)
            .get(&entry.name)
            .copied()
        {
            return cached;
        }

        let downloaded = if entry.recipe == "flm" {
            flm_installed.iter().any(|m| *m == entry.checkpoint)
        } else {
            entry
                .resolved_path
                .as_deref()
                .is_some_and(Path::exists)
        };

        if downloaded {
            // Artifacts do not vanish behind our back often enough to
            // justify rescanning the HF cache on every listing.
            lock_or_recover(&self.downloaded_cache).insert(entry.name.clone(), true);
        }
        downloaded
    }

    /// Persist a user model entry. Labels always start with `custom`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for a name without the
    /// `user.` prefix, and I/O errors from persisting the catalogue.
    pub fn register_user_model(
        &self,
        name: &str,
        checkpoint: &str,
        recipe: &str,
        extra_labels: &[String],
        mmproj: Option<&str>,
        source: Option<&str>,
    ) -> Result<()> {
        let short_name = name.strip_prefix("user.").ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "user model names must start with `user.` (got {name})"
            ))
        })?;
        if !RECIPES.contains(&recipe) {
            return Err(GatewayError::InvalidRequest(format!(
                "unknown recipe '{recipe}' (expected one of {RECIPES:?})"
            )));
        }

        let mut labels = vec!["custom".to_owned()];
        for label in extra_labels {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }

        let entry = CatalogueEntry {
            checkpoint: checkpoint.to_owned(),
            recipe: recipe.to_owned(),
            labels,
            suggested: true,
            mmproj: mmproj.map(str::to_owned),
            source: source.map(str::to_owned),
        };

        let mut user = lock_or_recover(&self.user_models);
        user.insert(short_name.to_owned(), entry);
        persist_user_catalogue(&user)?;
        drop(user);

        lock_or_recover(&self.downloaded_cache).remove(name);
        info!(model = name, "registered user model");
        Ok(())
    }

    /// Remove a model: drops the user catalogue entry, forgets the
    /// download state, and removes copied local-upload directories.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for unknown models.
    pub fn delete_model(&self, name: &str) -> Result<()> {
        let entry = self
            .get_model(name)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown model: {name}")))?;

        if entry.source.as_deref() == Some("local_upload") {
            if let Some(path) = &entry.resolved_path {
                if path.exists() {
                    std::fs::remove_dir_all(path).map_err(|e| {
                        GatewayError::File(format!(
                            "could not remove local upload {}: {e}",
                            path.display()
                        ))
                    })?;
                }
            }
        }

        if let Some(short_name) = name.strip_prefix("user.") {
            let mut user = lock_or_recover(&self.user_models);
            user.remove(short_name);
            persist_user_catalogue(&user)?;
        }

        lock_or_recover(&self.downloaded_cache).remove(name);
        info!(model = name, "deleted model");
        Ok(())
    }

    /// Download a model's artifacts, registering a user entry when the
    /// name is new. Idempotent: with `do_not_upgrade` set and artifacts
    /// present the call returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for unregistered names
    /// without checkpoint/recipe or GGUF checkpoints lacking a variant;
    /// [`GatewayError::Download`] for network failures.
    #[allow(clippy::too_many_arguments)]
    pub async fn download_model(
        &self,
        name: &str,
        checkpoint: Option<&str>,
        recipe: Option<&str>,
        extra_labels: &[String],
        mmproj: Option<&str>,
        do_not_upgrade: bool,
        progress: Option<hf::PullProgressFn<'_>>,
    ) -> Result<()> {
        let registered = self.get_model(name);
        let (checkpoint, recipe) = match (&registered, checkpoint, recipe) {
            (Some(entry), None, _) => (entry.checkpoint.clone(), entry.recipe.clone()),
            (Some(entry), Some(cp), rec) => (
                cp.to_owned(),
                rec.map_or_else(|| entry.recipe.clone(), str::to_owned),
            ),
            (None, Some(cp), Some(rec)) => {
                if !name.starts_with("user.") {
                    return Err(GatewayError::InvalidRequest(format!(
                        "when registering a new model, the model name must include the \
                         `user` namespace, for example `user.Phi-4-Mini-GGUF` (got {name})"
                    )));
                }
                validate_gguf_variant(rec, cp)?;
                (cp.to_owned(), rec.to_owned())
            }
            (None, _, _) => {
                return Err(GatewayError::InvalidRequest(format!(
                    "model {name} is not registered; provide `checkpoint` and `recipe` \
                     to register and install it"
                )));
            }
        };

        if self.offline {
            info!(model = name, "offline mode, skipping download");
            return Ok(());
        }

        if do_not_upgrade && self.is_model_downloaded(name).await {
            info!(model = name, "already downloaded and do_not_upgrade set");
            return Ok(());
        }

        let (repo_id, variant) = resolve::split_checkpoint(&checkpoint);
        info!(model = name, repo = repo_id, ?variant, "downloading model");

        match recipe.as_str() {
            "flm" => self.flm_pull(&checkpoint).await?,
            "llamacpp" => {
                let repo_files = hf::list_repo_files(repo_id).await?;
                let plan = resolve::plan_gguf_download(&checkpoint, &repo_files, mmproj)
                    .map_err(GatewayError::InvalidRequest)?;
                hf::download_repo_files(repo_id, &plan.files, progress).await?;
            }
            _ => {
                // Non-GGUF recipes: a file variant selects a single file,
                // otherwise the whole repo is mirrored (OGA model folders).
                let repo_files = hf::list_repo_files(repo_id).await?;
                let files: Vec<String> = match variant {
                    Some(v) if repo_files.iter().any(|f| f == v) => vec![v.to_owned()],
                    _ => repo_files
                        .into_iter()
                        .filter(|f| !f.starts_with(".git"))
                        .collect(),
                };
                if files.is_empty() {
                    return Err(GatewayError::Download(format!(
                        "repository {repo_id} has no downloadable files"
                    )));
                }
                hf::download_repo_files(repo_id, &files, progress).await?;
            }
        }

        lock_or_recover(&self.downloaded_cache).remove(name);

        if name.starts_with("user.") {
            self.register_user_model(name, &checkpoint, &recipe, extra_labels, mmproj, None)?;
        }
        Ok(())
    }

    /// Copy a local model directory into the HF cache and register it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] when the source is not a
    /// directory and I/O errors from the copy.
    pub fn add_local_model(&self, name: &str, recipe: &str, src_dir: &Path) -> Result<()> {
        if !src_dir.is_dir() {
            return Err(GatewayError::InvalidRequest(format!(
                "checkpoint path {} is not a directory",
                src_dir.display()
            )));
        }
        let short_name = name.strip_prefix("user.").unwrap_or(name);
        let relative = format!("local_uploads/{short_name}");
        let dest = paths::hf_cache_dir().join(&relative);
        copy_dir_recursive(src_dir, &dest)?;

        let full_name = format!("user.{short_name}");
        self.register_user_model(&full_name, &relative, recipe, &[], None, Some("local_upload"))
    }

    /// Models the FLM CLI reports as installed. Missing CLI means an
    /// empty list, not an error.
    pub async fn flm_installed_models(&self) -> Vec<String> {
        if which::which("flm").is_err() {
            return Vec::new();
        }
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let run = process::run_with_output(
            "flm",
            &["list".to_owned()],
            None,
            move |line| {
                lock_or_recover(&sink).push(line.to_owned());
                true
            },
            Some(Duration::from_secs(30)),
        )
        .await;
        if run.is_err() {
            return Vec::new();
        }
        let lines = lock_or_recover(&lines);
        parse_flm_list(&lines)
    }

    async fn flm_pull(&self, checkpoint: &str) -> Result<()> {
        let exit = process::run_with_output(
            "flm",
            &["pull".to_owned(), checkpoint.to_owned()],
            None,
            |line| {
                info!(target: "flm", "{line}");
                true
            },
            Some(Duration::from_secs(3600)),
        )
        .await?;
        if exit != 0 {
            return Err(GatewayError::Download(format!(
                "flm pull {checkpoint} exited with code {exit}"
            )));
        }
        Ok(())
    }

    fn build_entry(&self, name: String, entry: &CatalogueEntry) -> ModelEntry {
        let mut model = ModelEntry {
            name,
            checkpoint: entry.checkpoint.clone(),
            recipe: entry.recipe.clone(),
            labels: entry.labels.clone(),
            suggested: entry.suggested,
            mmproj: entry.mmproj.clone(),
            source: entry.source.clone(),
            resolved_path: None,
        };
        model.resolved_path = resolve_model_path(&model, &paths::hf_cache_dir());
        model
    }

    fn scan_extra_models_dir(&self) -> Vec<ModelEntry> {
        let Some(dir) = &self.extra_models_dir else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            warn!(dir = %dir.display(), "extra models dir is not readable");
            return Vec::new();
        };
        let mut models = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_gguf = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"));
            if !is_gguf {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            models.push(ModelEntry {
                name: stem,
                checkpoint: path.display().to_string(),
                recipe: "llamacpp".to_owned(),
                labels: Vec::new(),
                suggested: false,
                mmproj: None,
                source: Some("extra_dir".to_owned()),
                resolved_path: Some(path),
            });
        }
        models
    }

    fn filter_by_backend(
        &self,
        models: BTreeMap<String, ModelEntry>,
    ) -> BTreeMap<String, ModelEntry> {
        let npu = self.oracle.npu_available();
        let is_macos = cfg!(target_os = "macos");

        models
            .into_iter()
            .filter(|(_, entry)| {
                let recipe = entry.recipe.as_str();
                if recipe == "oga-igpu" {
                    return false;
                }
                if matches!(recipe, "flm" | "oga-npu" | "oga-hybrid" | "oga-cpu") && !npu {
                    return false;
                }
                if is_macos && recipe != "llamacpp" {
                    return false;
                }
                true
            })
            .collect()
    }
}

/// Resolve an entry's on-disk artifact path against the given HF cache.
///
/// Pure over `(entry, cache contents)`; see the selection rules on
/// [`resolve::select_gguf`].
pub fn resolve_model_path(entry: &ModelEntry, hf_cache: &Path) -> Option<PathBuf> {
    // FLM models live in the FLM CLI's own registry.
    if entry.recipe == "flm" {
        return None;
    }

    // Local uploads: checkpoint is a path relative to the HF cache.
    if entry.source.as_deref() == Some("local_upload") {
        let normalized = entry.checkpoint.replace('\\', "/");
        return Some(hf_cache.join(normalized));
    }

    // Extra-dir entries carry an absolute checkpoint path.
    if entry.source.as_deref() == Some("extra_dir") {
        return Some(PathBuf::from(&entry.checkpoint));
    }

    let (repo_id, variant) = resolve::split_checkpoint(&entry.checkpoint);
    let repo_cache = hf_cache.join(format!("models--{}", repo_id.replace('/', "--")));

    if entry.recipe.starts_with("oga-") {
        return Some(
            resolve::find_genai_config_dir(&repo_cache).unwrap_or(repo_cache),
        );
    }

    if entry.recipe == "llamacpp" {
        let files = resolve::collect_gguf_files(&repo_cache);
        return Some(
            resolve::select_gguf(&files, &repo_cache, variant).unwrap_or(repo_cache),
        );
    }

    // whispercpp / kokoro / sd-cpp: a file variant selects one artifact.
    if let Some(filename) = variant {
        if let Some(found) = find_file_by_name(&repo_cache, filename) {
            return Some(found);
        }
    }
    Some(repo_cache)
}

fn find_file_by_name(root: &Path, filename: &str) -> Option<PathBuf> {
    let mut found = None;
    let mut visit = |path: &Path| {
        if found.is_none()
            && path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(filename))
        {
            found = Some(path.to_path_buf());
        }
    };
    walk(root, &mut visit);
    found
}

fn walk(dir: &Path, visit: &mut dyn FnMut(&Path)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, visit);
        } else {
            visit(&path);
        }
    }
}

/// Reject GGUF checkpoints registered without a `:variant`.
fn validate_gguf_variant(recipe: &str, checkpoint: &str) -> Result<()> {
    if recipe == "llamacpp"
        && checkpoint.to_lowercase().contains("gguf")
        && !checkpoint.contains(':')
    {
        return Err(GatewayError::InvalidRequest(
            "a 'variant' is required in the checkpoint field when registering a GGUF \
             model, as CHECKPOINT:VARIANT, for example \
             Qwen/Qwen2.5-Coder-3B-Instruct-GGUF:Q4_0"
                .to_owned(),
        ));
    }
    Ok(())
}

/// Parse `flm list` output: installed models are listed as `- name ✅`.
fn parse_flm_list(lines: &[String]) -> Vec<String> {
    let mut installed = Vec::new();
    for line in lines {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("- ") else {
            continue;
        };
        if let Some(idx) = rest.find(" \u{2705}") {
            let name = rest[..idx].trim();
            if !name.is_empty() {
                installed.push(name.to_owned());
            }
        }
    }
    installed
}

fn load_user_catalogue(path: &Path) -> Result<BTreeMap<String, CatalogueEntry>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn persist_user_catalogue(models: &BTreeMap<String, CatalogueEntry>) -> Result<()> {
    let path = paths::user_models_file();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(models)
        .map_err(|e| GatewayError::File(format!("could not serialize user catalogue: {e}")))?;
    std::fs::write(&path, body)?;
    Ok(())
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareInfo, StaticOracle};

    fn oracle(npu: bool) -> Arc<dyn HardwareOracle> {
        Arc::new(StaticOracle(HardwareInfo {
            cpu_name: String::new(),
            gpu_names: Vec::new(),
            npu_available: npu,
        }))
    }

    fn entry(name: &str, checkpoint: &str, recipe: &str) -> ModelEntry {
        ModelEntry {
            name: name.to_owned(),
            checkpoint: checkpoint.to_owned(),
            recipe: recipe.to_owned(),
            labels: Vec::new(),
            suggested: false,
            mmproj: None,
            source: None,
            resolved_path: None,
        }
    }

    #[test]
    fn builtin_catalogue_parses() {
        let registry = ModelRegistry::new(oracle(true), None, false).expect("catalogue parses");
        assert!(!registry.server_models.is_empty());
        for (name, entry) in &registry.server_models {
            assert!(
                RECIPES.contains(&entry.recipe.as_str()),
                "{name} has unknown recipe {}",
                entry.recipe
            );
            assert!(!entry.checkpoint.is_empty(), "{name} lacks a checkpoint");
        }
    }

    #[test]
    fn classify_covers_all_classes() {
        assert_eq!(ModelType::classify("llamacpp", &[]), ModelType::Llm);
        assert_eq!(
            ModelType::classify("llamacpp", &["embeddings".into()]),
            ModelType::Embedding
        );
        assert_eq!(
            ModelType::classify("llamacpp", &["reranking".into()]),
            ModelType::Reranking
        );
        assert_eq!(ModelType::classify("whispercpp", &[]), ModelType::Audio);
        assert_eq!(ModelType::classify("kokoro", &[]), ModelType::AudioOut);
        assert_eq!(ModelType::classify("sd-cpp", &[]), ModelType::Image);
    }

    #[test]
    fn npu_filter_hides_flm_and_oga() {
        let registry = ModelRegistry::new(oracle(false), None, false).expect("registry");
        let models = registry.get_supported_models();
        for (name, entry) in &models {
            assert!(
                !matches!(
                    entry.recipe.as_str(),
                    "flm" | "oga-npu" | "oga-hybrid" | "oga-cpu"
                ),
                "{name} should be hidden without an NPU"
            );
        }
    }

    #[test]
    fn npu_present_exposes_flm_and_oga() {
        if cfg!(target_os = "macos") {
            return;
        }
        let registry = ModelRegistry::new(oracle(true), None, false).expect("registry");
        let models = registry.get_supported_models();
        assert!(models.values().any(|m| m.recipe == "flm"));
        assert!(models.values().any(|m| m.recipe.starts_with("oga-")));
    }

    #[test]
    fn resolve_flm_has_no_path() {
        let e = entry("m", "gemma3:4b", "flm");
        assert!(resolve_model_path(&e, Path::new("/cache")).is_none());
    }

    #[test]
    fn resolve_local_upload_joins_cache() {
        let mut e = entry("user.m", "local_uploads/m", "llamacpp");
        e.source = Some("local_upload".to_owned());
        let path = resolve_model_path(&e, Path::new("/hf")).expect("path");
        assert_eq!(path, PathBuf::from("/hf/local_uploads/m"));
    }

    #[test]
    fn resolve_llamacpp_selects_variant_in_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = dir.path().join("models--org--repo/snapshots/main");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("model-Q4_0.gguf"), b"x").expect("write");
        std::fs::write(repo.join("model-Q8_0.gguf"), b"x").expect("write");

        let e = entry("m", "org/repo:Q8_0", "llamacpp");
        let path = resolve_model_path(&e, dir.path()).expect("path");
        assert!(path.ends_with("model-Q8_0.gguf"));
    }

    #[test]
    fn resolve_whisper_file_variant() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = dir.path().join("models--ggml-org--whisper.cpp/snapshots/main");
        std::fs::create_dir_all(&repo).expect("mkdir");
        std::fs::write(repo.join("ggml-large-v3.bin"), b"x").expect("write");

        let e = entry("w", "ggml-org/whisper.cpp:ggml-large-v3.bin", "whispercpp");
        let path = resolve_model_path(&e, dir.path()).expect("path");
        assert!(path.ends_with("ggml-large-v3.bin"));
    }

    #[test]
    fn gguf_variant_validation() {
        assert!(validate_gguf_variant("llamacpp", "org/My-Model-GGUF").is_err());
        assert!(validate_gguf_variant("llamacpp", "org/My-Model-GGUF:Q4_0").is_ok());
        assert!(validate_gguf_variant("oga-cpu", "org/model-onnx").is_ok());
    }

    #[test]
    fn flm_list_parse() {
        let lines = vec![
            "FastFlowLM models:".to_owned(),
            "- gemma3:4b \u{2705}".to_owned(),
            "- llama3.2:1b".to_owned(),
            "  - qwen3:8b \u{2705}".to_owned(),
        ];
        let installed = parse_flm_list(&lines);
        assert_eq!(installed, vec!["gemma3:4b", "qwen3:8b"]);
    }

    #[test]
    fn user_model_requires_prefix() {
        let registry = ModelRegistry::new(oracle(true), None, false).expect("registry");
        let err = registry
            .register_user_model("NoPrefix", "org/repo:Q4_0", "llamacpp", &[], None, None)
            .expect_err("prefix required");
        assert_eq!(err.kind(), "invalid_request");
    }
}
