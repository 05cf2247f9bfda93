//! Hardware capability oracle.
//!
//! The gateway treats hardware probing as an opaque oracle: it needs three
//! answers (is an NPU present, which GPUs exist, which OS is this) to
//! filter the catalogue and pick archive assets. The probe runs once and
//! is cached to `{cache_dir}/system_info.json`; the cache is invalidated
//! when the gateway version changes.

use crate::paths;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Answers the oracle provides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// CPU model string, when known.
    pub cpu_name: String,
    /// Names of detected GPUs (integrated and discrete).
    pub gpu_names: Vec<String>,
    /// Whether an AI accelerator (NPU) is present.
    pub npu_available: bool,
}

/// Cached probe result with a version stamp for invalidation.
#[derive(Debug, Serialize, Deserialize)]
struct CachedProbe {
    version: String,
    hardware: HardwareInfo,
}

/// Capability oracle consulted by the registry's availability filter and
/// the installer's ROCm asset selection.
pub trait HardwareOracle: Send + Sync + std::fmt::Debug {
    /// Probe (or return the cached) hardware description.
    fn info(&self) -> HardwareInfo;

    /// NPU gate used for FLM/OGA availability.
    ///
    /// `RYZENAI_SKIP_PROCESSOR_CHECK=1|true|yes` bypasses the hardware
    /// check entirely.
    fn npu_available(&self) -> bool {
        if matches!(
            std::env::var("RYZENAI_SKIP_PROCESSOR_CHECK").as_deref(),
            Ok("1") | Ok("true") | Ok("yes")
        ) {
            return true;
        }
        self.info().npu_available
    }
}

/// Default oracle: probes the running system once, persisting the result.
#[derive(Debug, Default)]
pub struct SystemOracle {
    cached: OnceLock<HardwareInfo>,
}

impl SystemOracle {
    pub fn new() -> Self {
        Self::default()
    }

    fn load_or_probe(&self) -> HardwareInfo {
        if let Some(info) = load_cache() {
            debug!("using cached hardware probe");
            return info;
        }
        let info = probe_system();
        save_cache(&info);
        info
    }
}

impl HardwareOracle for SystemOracle {
    fn info(&self) -> HardwareInfo {
        self.cached.get_or_init(|| self.load_or_probe()).clone()
    }
}

/// Fixed-answer oracle for tests and forced configurations.
#[derive(Debug)]
pub struct StaticOracle(pub HardwareInfo);

impl HardwareOracle for StaticOracle {
    fn info(&self) -> HardwareInfo {
        self.0.clone()
    }
}

fn load_cache() -> Option<HardwareInfo> {
    let path = paths::system_info_file();
    let raw = std::fs::read_to_string(path).ok()?;
    let cached: CachedProbe = serde_json::from_str(&raw).ok()?;
    if cached.version != env!("CARGO_PKG_VERSION") {
        debug!("hardware cache is from another version, re-probing");
        return None;
    }
    Some(cached.hardware)
}

fn save_cache(info: &HardwareInfo) {
    let path = paths::system_info_file();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let cached = CachedProbe {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        hardware: info.clone(),
    };
    match serde_json::to_string_pretty(&cached) {
        Ok(body) => {
            if let Err(e) = std::fs::write(&path, body) {
                warn!(error = %e, "could not persist hardware probe");
            }
        }
        Err(e) => warn!(error = %e, "could not serialize hardware probe"),
    }
}

/// One-shot system probe. Deliberately shallow: CPU model string, GPU names
/// from the platform's device listing, NPU presence inferred from the CPU
/// generation.
fn probe_system() -> HardwareInfo {
    let cpu_name = probe_cpu_name();
    let gpu_names = probe_gpu_names();
    let npu_available = cpu_has_npu(&cpu_name);
    HardwareInfo {
        cpu_name,
        gpu_names,
        npu_available,
    }
}

fn probe_cpu_name() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(cpuinfo) = std::fs::read_to_string("/proc/cpuinfo") {
            for line in cpuinfo.lines() {
                if let Some(rest) = line.strip_prefix("model name") {
                    if let Some((_, name)) = rest.split_once(':') {
                        return name.trim().to_owned();
                    }
                }
            }
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(output) = std::process::Command::new("sysctl")
            .args(["-n", "machdep.cpu.brand_string"])
            .output()
        {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("PROCESSOR_IDENTIFIER").unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn probe_gpu_names() -> Vec<String> {
    // DRM exposes one card per render device; device/label (when present)
    // names the product.
    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/sys/class/drm") {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("card") || name.contains('-') {
                continue;
            }
            let label_path = entry.path().join("device/label");
            if let Ok(label) = std::fs::read_to_string(label_path) {
                let label = label.trim();
                if !label.is_empty() {
                    names.push(label.to_owned());
                }
            }
        }
    }
    names
}

#[cfg(not(target_os = "linux"))]
fn probe_gpu_names() -> Vec<String> {
    Vec::new()
}

/// Ryzen AI 300-series ("Strix") and later parts carry the XDNA NPU.
fn cpu_has_npu(cpu_name: &str) -> bool {
    let name = cpu_name.to_lowercase();
    name.contains("ryzen ai")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_oracle_reports_fixed_info() {
        let oracle = StaticOracle(HardwareInfo {
            cpu_name: "Test CPU".into(),
            gpu_names: vec!["Radeon 8060S Graphics".into()],
            npu_available: true,
        });
        assert!(oracle.info().npu_available);
        assert_eq!(oracle.info().gpu_names.len(), 1);
    }

    #[test]
    fn npu_detection_from_cpu_name() {
        assert!(cpu_has_npu("AMD Ryzen AI 9 HX 370 w/ Radeon 890M"));
        assert!(!cpu_has_npu("AMD Ryzen 7 5800X 8-Core Processor"));
        assert!(!cpu_has_npu(""));
    }

    #[test]
    fn cache_roundtrip_shape() {
        let cached = CachedProbe {
            version: "9.9.9".into(),
            hardware: HardwareInfo {
                cpu_name: "cpu".into(),
                gpu_names: vec![],
                npu_available: false,
            },
        };
        let raw = serde_json::to_string(&cached).expect("serializes");
        let back: CachedProbe = serde_json::from_str(&raw).expect("deserializes");
        assert_eq!(back.version, "9.9.9");
        assert!(!back.hardware.npu_available);
    }
}
