//! Versioned, atomic installation of backend server binaries.
//!
//! Installed state for a backend variant is two marker files next to the
//! executable: `version.txt` (exact version string) and, for variantful
//! backends, `backend.txt` (vulkan/rocm/metal). The executable existing
//! alone proves nothing: a half-extracted archive leaves executables
//! behind. Any failure after the old install is removed rolls the whole
//! directory back so the next attempt starts clean.

use crate::error::{GatewayError, Result};
use crate::hardware::HardwareOracle;
use crate::{archive, fetch, paths, process};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Pinned backend versions, embedded at compile time.
const BACKEND_VERSIONS_JSON: &str = include_str!("../resources/backend_versions.json");

/// Downloaded archives smaller than this are treated as corrupt (GitHub
/// error pages are a few KB).
const MIN_ARCHIVE_SIZE: u64 = 1024 * 1024;

/// Identity and layout of an installable backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendSpec {
    /// Recipe family, as it appears in `backend_versions.json`.
    pub recipe: &'static str,
    /// Directory name under `downloaded_bin/`.
    pub dir_name: &'static str,
    /// Executable base name, without the `.exe` suffix.
    pub binary: &'static str,
    /// Alternate executable names some releases use.
    pub alt_binaries: &'static [&'static str],
    /// Subdirectories releases extract their binaries into.
    pub subdirs: &'static [&'static str],
}

impl BackendSpec {
    /// Install directory for a variant (empty variant → no subdirectory).
    pub fn install_dir(&self, variant: &str) -> PathBuf {
        let base = paths::downloaded_bin_dir().join(self.dir_name);
        if variant.is_empty() {
            base
        } else {
            base.join(variant)
        }
    }

    /// Environment variable that overrides the binary path:
    /// `LEMONADE_<RECIPE>_<VARIANT>_BIN` (`LEMONADE_<RECIPE>_BIN` without
    /// a variant). Dashes become underscores.
    pub fn env_override_var(&self, variant: &str) -> String {
        let recipe = self.recipe.to_uppercase().replace('-', "_");
        if variant.is_empty() {
            format!("LEMONADE_{recipe}_BIN")
        } else {
            let variant = variant.to_uppercase().replace('-', "_");
            format!("LEMONADE_{recipe}_{variant}_BIN")
        }
    }

    /// Binary path from the env override, when set and existing.
    pub fn external_binary(&self, variant: &str) -> Option<PathBuf> {
        let var = self.env_override_var(variant);
        let value = std::env::var(var).ok()?;
        if value.is_empty() {
            return None;
        }
        let path = PathBuf::from(value);
        path.exists().then_some(path)
    }

    /// Search the install directory (and its known subdirectories) for the
    /// executable.
    pub fn find_executable(&self, install_dir: &Path) -> Option<PathBuf> {
        let mut names: Vec<String> = Vec::new();
        for base in std::iter::once(&self.binary).chain(self.alt_binaries.iter()) {
            if cfg!(windows) {
                names.push(format!("{base}.exe"));
            }
            names.push((*base).to_owned());
        }

        for subdir in std::iter::once(&"").chain(self.subdirs.iter()) {
            for name in &names {
                let candidate = if subdir.is_empty() {
                    install_dir.join(name)
                } else {
                    install_dir.join(subdir).join(name)
                };
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

/// Expected version for `(recipe, variant)` from the shipped pin file.
///
/// # Errors
///
/// Returns [`GatewayError::Installation`] when the pin file lacks an
/// entry, which is a build defect rather than a runtime condition.
pub fn expected_version(recipe: &str, variant: &str) -> Result<String> {
    let versions: serde_json::Value = serde_json::from_str(BACKEND_VERSIONS_JSON)
        .map_err(|e| GatewayError::Installation(format!("backend_versions.json invalid: {e}")))?;
    let entry = versions.get(recipe).ok_or_else(|| {
        GatewayError::Installation(format!("backend_versions.json has no entry for {recipe}"))
    })?;
    match entry {
        serde_json::Value::String(v) => Ok(v.clone()),
        serde_json::Value::Object(map) => map
            .get(variant)
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                GatewayError::Installation(format!(
                    "backend_versions.json has no {recipe} version for variant '{variant}'"
                ))
            }),
        _ => Err(GatewayError::Installation(format!(
            "backend_versions.json entry for {recipe} has an unexpected shape"
        ))),
    }
}

/// Ensure the backend binary for `variant` is installed at the expected
/// version, downloading `filename` from the GitHub release when needed.
/// Returns the executable path.
///
/// # Errors
///
/// Returns [`GatewayError::Download`] / [`GatewayError::Installation`] on
/// failure; in both cases the install directory has been rolled back.
pub async fn install_from_github(
    spec: &BackendSpec,
    variant: &str,
    repo: &str,
    filename: &str,
) -> Result<PathBuf> {
    // 1. Explicit override wins; no version management applies.
    if let Some(external) = spec.external_binary(variant) {
        info!(binary = %external.display(), "using externally provided backend binary");
        return Ok(external);
    }

    let install_dir = spec.install_dir(variant);
    let version = expected_version(spec.recipe, variant)?;
    let version_file = install_dir.join("version.txt");
    let backend_file = install_dir.join("backend.txt");

    // 2. Current install is good iff executable + markers all agree.
    if let Some(exe) = spec.find_executable(&install_dir) {
        let installed_version = read_trimmed(&version_file);
        let installed_variant = read_trimmed(&backend_file);
        let variant_ok = variant.is_empty() || installed_variant.as_deref() == Some(variant);
        if installed_version.as_deref() == Some(version.as_str()) && variant_ok {
            return Ok(exe);
        }
        info!(
            recipe = spec.recipe,
            from = ?installed_version,
            to = %version,
            "upgrading backend"
        );
    }

    // 3. Anything on disk is stale; remove it wholesale.
    if install_dir.exists() {
        tokio::fs::remove_dir_all(&install_dir).await?;
    }
    tokio::fs::create_dir_all(&install_dir).await?;

    let url = format!("https://github.com/{repo}/releases/download/{version}/{filename}");
    let result = download_and_extract(spec, &install_dir, &url, filename).await;
    match result {
        Ok(exe) => {
            tokio::fs::write(&version_file, &version).await?;
            if !variant.is_empty() {
                tokio::fs::write(&backend_file, variant).await?;
            }
            set_executable(&exe)?;
            info!(recipe = spec.recipe, exe = %exe.display(), "backend installed");
            Ok(exe)
        }
        Err(e) => {
            // Roll back so the next call performs a clean install.
            if let Err(cleanup) = tokio::fs::remove_dir_all(&install_dir).await {
                warn!(error = %cleanup, "could not roll back install dir");
            }
            Err(e)
        }
    }
}

async fn download_and_extract(
    spec: &BackendSpec,
    install_dir: &Path,
    url: &str,
    filename: &str,
) -> Result<PathBuf> {
    let archive_path = install_dir.join(filename);

    info!(url = %url, "downloading backend archive");
    let progress = |done: u64, total: u64| {
        if total > 0 {
            info!(
                recipe = spec.recipe,
                percent = done * 100 / total,
                "backend download progress"
            );
        }
    };
    fetch::download_file(
        url,
        &archive_path,
        &fetch::DownloadOptions::default(),
        Some(&progress),
        &[],
    )
    .await?;

    let size = tokio::fs::metadata(&archive_path).await.map(|m| m.len())?;
    if size < MIN_ARCHIVE_SIZE {
        return Err(GatewayError::Download(format!(
            "downloaded archive is only {size} bytes (< 1 MB), likely corrupt: {url}"
        )));
    }

    archive::extract_archive(&archive_path, install_dir).await?;
    let _ = tokio::fs::remove_file(&archive_path).await;

    spec.find_executable(install_dir).ok_or_else(|| {
        GatewayError::Installation(format!(
            "extraction finished but {} was not found under {}",
            spec.binary,
            install_dir.display()
        ))
    })
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_owned())
}

/// ROCm architecture tag for the installed AMD GPU, used to pick the
/// right llama-server release asset.
pub fn identify_rocm_arch(oracle: &dyn HardwareOracle) -> String {
    for name in oracle.info().gpu_names {
        if let Some(arch) = rocm_arch_from_name(&name) {
            return arch.to_owned();
        }
    }
    "gfx110X".to_owned()
}

fn rocm_arch_from_name(device_name: &str) -> Option<&'static str> {
    let name = device_name.to_lowercase();
    if !name.contains("radeon") {
        return None;
    }
    // STX Halo iGPUs.
    if name.contains("8050s") || name.contains("8060s") {
        return Some("gfx1151");
    }
    // RDNA4.
    if name.contains("r9700") || name.contains("9060") || name.contains("9070") {
        return Some("gfx120X");
    }
    // RDNA3.
    if name.contains("7700")
        || name.contains("7800")
        || name.contains("7900")
        || name.contains("v710")
    {
        return Some("gfx110X");
    }
    None
}

/// Locate the FLM CLI: PATH first, then the standard install locations.
pub fn find_flm_binary() -> Option<PathBuf> {
    if let Ok(path) = which::which("flm") {
        return Some(path);
    }
    let candidates: &[&str] = if cfg!(windows) {
        &[
            "C:\\Program Files\\FastFlowLM\\flm.exe",
            "C:\\Program Files (x86)\\FastFlowLM\\flm.exe",
        ]
    } else {
        &["/usr/local/bin/flm", "/usr/bin/flm"]
    };
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Install or upgrade FLM via its Inno Setup installer (Windows only; the
/// installer is silent for upgrades, interactive for first installs).
///
/// # Errors
///
/// Returns [`GatewayError::Installation`] off Windows or when the
/// installer exits non-zero, [`GatewayError::Download`] when the setup
/// binary cannot be fetched.
pub async fn install_or_upgrade_flm() -> Result<PathBuf> {
    if let Some(existing) = find_flm_binary() {
        let current = flm_version(&existing).await;
        let expected = expected_version("flm", "")?;
        if current.as_deref() == Some(expected.as_str()) {
            return Ok(existing);
        }
        info!(from = ?current, to = %expected, "upgrading FLM");
        run_flm_installer(true).await?;
        return find_flm_binary().ok_or_else(|| {
            GatewayError::Installation("FLM installer finished but flm was not found".to_owned())
        });
    }

    run_flm_installer(false).await?;
    find_flm_binary().ok_or_else(|| {
        GatewayError::Installation(
            "FLM installation failed: flm not found on PATH. Install it manually from \
             https://github.com/FastFlowLM/FastFlowLM/releases/latest and restart."
                .to_owned(),
        )
    })
}

async fn run_flm_installer(upgrade: bool) -> Result<()> {
    if !cfg!(windows) {
        return Err(GatewayError::Installation(
            "FLM is only installable on Windows (requires the Ryzen AI NPU driver stack)"
                .to_owned(),
        ));
    }

    let url =
        "https://github.com/FastFlowLM/FastFlowLM/releases/latest/download/flm-setup.exe";
    let setup_path = std::env::temp_dir().join("flm-setup.exe");
    fetch::download_file(
        url,
        &setup_path,
        &fetch::DownloadOptions::default(),
        None,
        &[],
    )
    .await?;

    let mut args = Vec::new();
    if upgrade {
        args.push("/VERYSILENT".to_owned());
    }
    let exit = process::run_with_output(
        &setup_path.display().to_string(),
        &args,
        None,
        |_| true,
        Some(Duration::from_secs(900)),
    )
    .await?;
    let _ = tokio::fs::remove_file(&setup_path).await;
    if exit != 0 {
        return Err(GatewayError::Installation(format!(
            "FLM installer exited with code {exit}"
        )));
    }
    Ok(())
}

async fn flm_version(flm: &Path) -> Option<String> {
    let output = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
    let sink = std::sync::Arc::clone(&output);
    let run = process::run_with_output(
        &flm.display().to_string(),
        &["version".to_owned()],
        None,
        move |line| {
            if let Ok(mut out) = sink.lock() {
                if out.is_empty() {
                    *out = line.to_owned();
                }
            }
            true
        },
        Some(Duration::from_secs(15)),
    )
    .await;
    if run.is_err() {
        return None;
    }
    let out = output.lock().ok()?;
    let trimmed = out.trim();
    if trimmed.is_empty() {
        None
    } else {
        // `flm version` prints e.g. "flm version v0.9.10"; keep the tag.
        Some(
            trimmed
                .split_whitespace()
                .last()
                .unwrap_or(trimmed)
                .to_owned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{HardwareInfo, StaticOracle};

    const TEST_SPEC: BackendSpec = BackendSpec {
        recipe: "whispercpp",
        dir_name: "whisper",
        binary: "whisper-server",
        alt_binaries: &["server"],
        subdirs: &["Release", "bin", "build/bin"],
    };

    #[test]
    fn version_pin_lookup_flat_and_nested() {
        assert_eq!(
            expected_version("whispercpp", "").expect("pin exists"),
            "v1.8.2"
        );
        assert_eq!(
            expected_version("llamacpp", "rocm").expect("pin exists"),
            "b1066"
        );
        assert!(expected_version("llamacpp", "cuda").is_err());
        assert!(expected_version("nonexistent", "").is_err());
    }

    #[test]
    fn env_override_var_naming() {
        assert_eq!(TEST_SPEC.env_override_var(""), "LEMONADE_WHISPERCPP_BIN");
        let llama = BackendSpec {
            recipe: "llamacpp",
            dir_name: "llamacpp",
            binary: "llama-server",
            alt_binaries: &[],
            subdirs: &[],
        };
        assert_eq!(
            llama.env_override_var("vulkan"),
            "LEMONADE_LLAMACPP_VULKAN_BIN"
        );
        let kokoro = BackendSpec {
            recipe: "kokoro",
            dir_name: "kokoro",
            binary: "koko",
            alt_binaries: &[],
            subdirs: &[],
        };
        assert_eq!(kokoro.env_override_var("cpu"), "LEMONADE_KOKORO_CPU_BIN");
    }

    #[test]
    fn find_executable_probes_subdirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let release = dir.path().join("Release");
        std::fs::create_dir_all(&release).expect("mkdir");
        std::fs::write(release.join("whisper-server"), b"#!").expect("write");

        let found = TEST_SPEC.find_executable(dir.path()).expect("found");
        assert!(found.ends_with("Release/whisper-server"));
    }

    #[test]
    fn find_executable_accepts_alt_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("server"), b"#!").expect("write");
        let found = TEST_SPEC.find_executable(dir.path()).expect("found");
        assert!(found.ends_with("server"));
    }

    #[test]
    fn find_executable_missing_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(TEST_SPEC.find_executable(dir.path()).is_none());
    }

    #[test]
    fn rocm_arch_mapping() {
        assert_eq!(
            rocm_arch_from_name("AMD Radeon 8060S Graphics"),
            Some("gfx1151")
        );
        assert_eq!(
            rocm_arch_from_name("AMD Radeon RX 9070 XT"),
            Some("gfx120X")
        );
        assert_eq!(
            rocm_arch_from_name("AMD Radeon RX 7900 XTX"),
            Some("gfx110X")
        );
        assert_eq!(rocm_arch_from_name("NVIDIA GeForce RTX 4090"), None);
    }

    #[test]
    fn rocm_arch_defaults_when_no_gpu_matches() {
        let oracle = StaticOracle(HardwareInfo::default());
        assert_eq!(identify_rocm_arch(&oracle), "gfx110X");
    }

    #[tokio::test]
    async fn corrupt_archive_is_rejected_before_extraction() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        // GitHub serves an HTML error page instead of the asset: a few
        // hundred bytes. The size gate must refuse it.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/release.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 512]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let err = download_and_extract(
            &TEST_SPEC,
            dir.path(),
            &format!("{}/release.zip", server.uri()),
            "release.zip",
        )
        .await
        .expect_err("tiny archive rejected");
        assert_eq!(err.kind(), "download_error");
        assert!(err.to_string().contains("512 bytes"));
    }

    #[tokio::test]
    async fn missing_executable_after_extract_is_an_error() {
        if cfg!(windows) {
            return;
        }
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        // Serve a >1 MB zip that extracts fine but contains no
        // whisper-server executable.
        let dir = tempfile::tempdir().expect("tempdir");
        let payload_dir = dir.path().join("payload");
        std::fs::create_dir_all(&payload_dir).expect("mkdir");
        std::fs::write(payload_dir.join("filler.bin"), vec![7u8; 2 * 1024 * 1024])
            .expect("write filler");
        let zip_path = dir.path().join("asset.zip");
        let zipped = crate::process::run_with_output(
            "zip",
            &[
                "-j".into(),
                zip_path.display().to_string(),
                payload_dir.join("filler.bin").display().to_string(),
            ],
            None,
            |_| true,
            Some(std::time::Duration::from_secs(60)),
        )
        .await;
        let Ok(0) = zipped else {
            // zip tool not available here; nothing to assert.
            return;
        };
        let body = std::fs::read(&zip_path).expect("zip readable");

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/asset.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let install_dir = dir.path().join("install");
        let err = download_and_extract(
            &TEST_SPEC,
            &install_dir,
            &format!("{}/asset.zip", server.uri()),
            "asset.zip",
        )
        .await
        .expect_err("no executable in archive");
        assert_eq!(err.kind(), "installation_error");
    }
}
