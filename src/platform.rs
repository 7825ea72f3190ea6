use serde::{Deserialize, Serialize};
use tracing::debug;

pub const ENV_FORCE_CPU: &str = "SPEECH_FORCE_CPU";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuBackend {
    Cuda,
    Rocm,
    Metal,
}

/// What the host actually is, as opposed to what the user asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformFacts {
    pub os: String,
    pub arch: String,
    pub gpu: Option<GpuBackend>,
}

impl PlatformFacts {
    pub fn detect() -> Self {
        let forced_cpu = std::env::var(ENV_FORCE_CPU)
            .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let gpu = if forced_cpu { None } else { probe_gpu() };
        let facts = Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            gpu,
        };
        debug!(os = %facts.os, arch = %facts.arch, gpu = ?facts.gpu, "detected platform");
        facts
    }

    pub fn new(os: impl Into<String>, arch: impl Into<String>, gpu: Option<GpuBackend>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            gpu,
        }
    }

    #[must_use]
    pub fn has_gpu(&self) -> bool {
        self.gpu.is_some()
    }
}

/// Maps the spellings build pipelines commonly use onto `std::env::consts`.
#[must_use]
pub fn canonical_os(value: &str) -> String {
    match value.trim().to_ascii_lowercase().as_str() {
        "darwin" | "osx" | "mac" => "macos".into(),
        "win" | "win32" | "win64" => "windows".into(),
        other => other.into(),
    }
}

#[must_use]
pub fn canonical_arch(value: &str) -> String {
    match value.trim().to_ascii_lowercase().as_str() {
        "amd64" | "x64" | "x86-64" => "x86_64".into(),
        "arm64" => "aarch64".into(),
        "i386" | "i686" => "x86".into(),
        other => other.into(),
    }
}

#[cfg(target_os = "macos")]
fn probe_gpu() -> Option<GpuBackend> {
    if std::env::consts::ARCH == "aarch64" {
        Some(GpuBackend::Metal)
    } else {
        None
    }
}

#[cfg(target_os = "linux")]
fn probe_gpu() -> Option<GpuBackend> {
    use std::path::Path;

    if Path::new("/proc/driver/nvidia/version").exists() || Path::new("/dev/nvidia0").exists() {
        Some(GpuBackend::Cuda)
    } else if Path::new("/dev/kfd").exists() {
        Some(GpuBackend::Rocm)
    } else {
        None
    }
}

#[cfg(target_os = "windows")]
fn probe_gpu() -> Option<GpuBackend> {
    use std::path::Path;

    let system_root = std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".into());
    let nvcuda = Path::new(&system_root).join("System32").join("nvcuda.dll");
    nvcuda.exists().then_some(GpuBackend::Cuda)
}

#[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
fn probe_gpu() -> Option<GpuBackend> {
    None
}
