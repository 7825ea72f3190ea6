//! Artifact selection policy.
//!
//! Platform matching is exact. Device and variant resolution are separate
//! policy functions returning tagged decisions so the caller can tell an
//! explicit request apart from an `auto` fallback.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{InstallError, Result};
use crate::manifest::{Artifact, Component, Device, Manifest};
use crate::platform::PlatformFacts;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DevicePreference::Auto => "auto",
            DevicePreference::Cpu => "cpu",
            DevicePreference::Gpu => "gpu",
        })
    }
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "gpu" => Ok(DevicePreference::Gpu),
            other => Err(format!("unknown device preference {other:?}; expected cpu|gpu|auto")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuReason {
    NoGpuDetected,
    NoGpuArtifact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "kebab-case")]
pub enum DeviceDecision {
    /// Explicit `cpu` or `gpu`; never falls back.
    Requested { device: Device },
    /// `auto` on a GPU host with a gpu artifact available.
    AutoGpu,
    /// `auto` settled on cpu.
    AutoCpu { reason: CpuReason },
}

impl DeviceDecision {
    #[must_use]
    pub fn device(&self) -> Device {
        match self {
            DeviceDecision::Requested { device } => *device,
            DeviceDecision::AutoGpu => Device::Gpu,
            DeviceDecision::AutoCpu { .. } => Device::Cpu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", content = "variant", rename_all = "kebab-case")]
pub enum VariantDecision {
    Requested(String),
    ManifestDefault(String),
}

impl VariantDecision {
    #[must_use]
    pub fn variant(&self) -> &str {
        match self {
            VariantDecision::Requested(variant) | VariantDecision::ManifestDefault(variant) => {
                variant
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "kebab-case")]
pub enum SelectionWarning {
    /// The manifest lists the resolved key more than once; the largest was
    /// kept.
    DuplicateCandidates { key: String, count: usize },
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub artifact: Artifact,
    pub device: DeviceDecision,
    pub variant: VariantDecision,
    pub warnings: Vec<SelectionWarning>,
}

pub fn select(
    manifest: &Manifest,
    facts: &PlatformFacts,
    component: Component,
    want_device: DevicePreference,
    want_variant: &str,
) -> Result<Selection> {
    let on_platform: Vec<&Artifact> = manifest
        .artifacts_for(component)
        .filter(|artifact| artifact.os == facts.os && artifact.arch == facts.arch)
        .collect();
    if on_platform.is_empty() {
        return Err(InstallError::NoArtifactForPlatform {
            component: component.to_string(),
            os: facts.os.clone(),
            arch: facts.arch.clone(),
        });
    }

    let variant = resolve_variant(&on_platform, component, want_variant)?;
    let for_variant: Vec<&Artifact> = on_platform
        .into_iter()
        .filter(|artifact| artifact.variant == variant.variant())
        .collect();

    let device = resolve_device(&for_variant, facts, component, &variant, want_device)?;
    let finalists: Vec<&Artifact> = for_variant
        .into_iter()
        .filter(|artifact| artifact.device == device.device())
        .collect();

    let (artifact, warnings) = break_tie(&finalists);
    debug!(
        key = %artifact.key(),
        device = ?device,
        variant = ?variant,
        "artifact selected"
    );
    Ok(Selection {
        artifact: artifact.clone(),
        device,
        variant,
        warnings,
    })
}

pub fn resolve_variant(
    candidates: &[&Artifact],
    component: Component,
    wanted: &str,
) -> Result<VariantDecision> {
    let wanted = wanted.trim();
    if !wanted.is_empty() {
        return if candidates.iter().any(|artifact| artifact.variant == wanted) {
            Ok(VariantDecision::Requested(wanted.to_string()))
        } else {
            Err(InstallError::VariantNotFound {
                component: component.to_string(),
                variant: wanted.to_string(),
            })
        };
    }

    if let Some(marked) = candidates.iter().find(|artifact| artifact.default) {
        return Ok(VariantDecision::ManifestDefault(marked.variant.clone()));
    }
    if candidates.iter().any(|artifact| artifact.variant.is_empty()) {
        return Ok(VariantDecision::ManifestDefault(String::new()));
    }
    match candidates.first() {
        Some(first) if candidates.iter().all(|a| a.variant == first.variant) => {
            Ok(VariantDecision::ManifestDefault(first.variant.clone()))
        }
        _ => Err(InstallError::VariantNotFound {
            component: component.to_string(),
            variant: "<default>".into(),
        }),
    }
}

pub fn resolve_device(
    candidates: &[&Artifact],
    facts: &PlatformFacts,
    component: Component,
    variant: &VariantDecision,
    wanted: DevicePreference,
) -> Result<DeviceDecision> {
    let has = |device: Device| candidates.iter().any(|artifact| artifact.device == device);
    let unavailable = |device: &str| InstallError::DeviceUnavailable {
        component: component.to_string(),
        variant: variant.variant().to_string(),
        device: device.to_string(),
    };

    match wanted {
        DevicePreference::Cpu if has(Device::Cpu) => Ok(DeviceDecision::Requested {
            device: Device::Cpu,
        }),
        DevicePreference::Gpu if has(Device::Gpu) => Ok(DeviceDecision::Requested {
            device: Device::Gpu,
        }),
        DevicePreference::Cpu | DevicePreference::Gpu => Err(unavailable(&wanted.to_string())),
        DevicePreference::Auto => {
            if facts.has_gpu() && has(Device::Gpu) {
                Ok(DeviceDecision::AutoGpu)
            } else if has(Device::Cpu) {
                let reason = if facts.has_gpu() {
                    CpuReason::NoGpuArtifact
                } else {
                    CpuReason::NoGpuDetected
                };
                Ok(DeviceDecision::AutoCpu { reason })
            } else {
                Err(unavailable("auto"))
            }
        }
    }
}

/// Largest declared size wins; manifest order breaks equal sizes.
fn break_tie<'a>(finalists: &[&'a Artifact]) -> (&'a Artifact, Vec<SelectionWarning>) {
    let mut best = finalists[0];
    for candidate in &finalists[1..] {
        if candidate.size_bytes > best.size_bytes {
            best = *candidate;
        }
    }
    let mut warnings = Vec::new();
    if finalists.len() > 1 {
        let key = best.key().to_string();
        warn!(%key, count = finalists.len(), "ambiguous manifest entry, keeping the largest");
        warnings.push(SelectionWarning::DuplicateCandidates {
            key,
            count: finalists.len(),
        });
    }
    (best, warnings)
}
