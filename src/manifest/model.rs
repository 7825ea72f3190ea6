use std::{collections::HashMap, fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{InstallError, Result};
use crate::install::metadata::{Digest, DigestError};
use crate::platform::{canonical_arch, canonical_os};

pub const SUPPORTED_SCHEMA_VERSIONS: &[u32] = &[1];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Stt,
    Tts,
}

impl Component {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Component::Stt => "stt",
            Component::Tts => "tts",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stt" => Ok(Component::Stt),
            "tts" => Ok(Component::Tts),
            other => Err(format!("unknown component {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
}

impl Device {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" => Ok(Device::Gpu),
            other => Err(format!("unknown device {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarBz2,
}

impl ArchiveFormat {
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
        }
    }

    fn infer(url: &str) -> Option<Self> {
        let name = filename_from_uri(url)?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            Some(ArchiveFormat::TarBz2)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Unpack {
    File,
    Archive {
        format: ArchiveFormat,
        strip_components: u8,
    },
}

/// One downloadable unit. The primary payload of an artifact has an empty
/// `name`; companions are published under a subdirectory named `name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub name: String,
    pub url: String,
    pub size_bytes: u64,
    pub digest: Digest,
    pub unpack: Unpack,
}

impl Payload {
    /// File name used when the payload is published as a plain file.
    #[must_use]
    pub fn file_name(&self) -> String {
        filename_from_uri(&self.url).unwrap_or_else(|| "payload.bin".into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub component: Component,
    pub os: String,
    pub arch: String,
    pub device: Device,
    pub variant: String,
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.component, self.os, self.arch, self.device, self.variant
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub component: Component,
    pub os: String,
    pub arch: String,
    pub device: Device,
    pub variant: String,
    pub default: bool,
    pub url: String,
    pub size_bytes: u64,
    pub digest: Digest,
    pub unpack: Unpack,
    pub entrypoints: Vec<String>,
    pub companions: Vec<Payload>,
}

impl Artifact {
    #[must_use]
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey {
            component: self.component,
            os: self.os.clone(),
            arch: self.arch.clone(),
            device: self.device,
            variant: self.variant.clone(),
        }
    }

    #[must_use]
    pub fn primary_payload(&self) -> Payload {
        Payload {
            name: String::new(),
            url: self.url.clone(),
            size_bytes: self.size_bytes,
            digest: self.digest.clone(),
            unpack: self.unpack,
        }
    }

    /// Primary payload first, then companions in manifest order.
    #[must_use]
    pub fn payloads(&self) -> Vec<Payload> {
        let mut payloads = Vec::with_capacity(1 + self.companions.len());
        payloads.push(self.primary_payload());
        payloads.extend(self.companions.iter().cloned());
        payloads
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.size_bytes + self.companions.iter().map(|c| c.size_bytes).sum::<u64>()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub release_version: String,
    pub artifacts: Vec<Artifact>,
}

impl Manifest {
    /// Parses a manifest document. The schema version is checked before any
    /// artifact is interpreted.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|err| InstallError::InvalidManifest(err.to_string()))?;
        if !SUPPORTED_SCHEMA_VERSIONS.contains(&envelope.schema_version) {
            return Err(InstallError::UnsupportedManifest(format!(
                "schema version {} (supported: {:?})",
                envelope.schema_version, SUPPORTED_SCHEMA_VERSIONS
            )));
        }

        let raw: RawManifest = serde_json::from_slice(bytes)
            .map_err(|err| InstallError::InvalidManifest(err.to_string()))?;
        if raw.release_version.trim().is_empty() {
            return Err(InstallError::InvalidManifest("empty releaseVersion".into()));
        }

        let mut artifacts = Vec::with_capacity(raw.artifacts.len());
        for (index, entry) in raw.artifacts.into_iter().enumerate() {
            if let Some(artifact) = entry.into_artifact(index)? {
                artifacts.push(artifact);
            }
        }

        Ok(Self {
            schema_version: envelope.schema_version,
            release_version: raw.release_version,
            artifacts,
        })
    }

    pub fn artifacts_for(&self, component: Component) -> impl Iterator<Item = &Artifact> {
        self.artifacts
            .iter()
            .filter(move |artifact| artifact.component == component)
    }

    /// Keys that appear more than once, in first-seen order.
    #[must_use]
    pub fn duplicate_keys(&self) -> Vec<ArtifactKey> {
        let mut seen: HashMap<ArtifactKey, usize> = HashMap::new();
        let mut order = Vec::new();
        for artifact in &self.artifacts {
            let count = seen.entry(artifact.key()).or_insert(0);
            *count += 1;
            if *count == 2 {
                order.push(artifact.key());
            }
        }
        order
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    schema_version: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    release_version: String,
    #[serde(default)]
    artifacts: Vec<RawArtifact>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum UnpackKind {
    File,
    Archive,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    #[serde(default)]
    name: String,
    url: String,
    #[serde(default)]
    size_bytes: u64,
    digest: String,
    unpack_kind: UnpackKind,
    #[serde(default)]
    archive_format: Option<ArchiveFormat>,
    #[serde(default)]
    strip_components: u8,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArtifact {
    component: String,
    os: String,
    arch: String,
    device: String,
    #[serde(default)]
    variant: String,
    #[serde(default)]
    default: bool,
    #[serde(flatten)]
    payload: RawPayload,
    #[serde(default)]
    entrypoints: Vec<String>,
    #[serde(default)]
    companions: Vec<RawPayload>,
}

impl RawArtifact {
    /// `Ok(None)` for entries this engine does not know how to install.
    fn into_artifact(self, index: usize) -> Result<Option<Artifact>> {
        let Ok(component) = self.component.parse::<Component>() else {
            debug!(index, component = %self.component, "skipping unknown component");
            return Ok(None);
        };
        let Ok(device) = self.device.parse::<Device>() else {
            debug!(index, device = %self.device, "skipping unknown device");
            return Ok(None);
        };

        let context = format!("artifacts[{index}]");
        let primary = self.payload.into_payload(&context)?;
        let mut companions = Vec::with_capacity(self.companions.len());
        for (position, raw) in self.companions.into_iter().enumerate() {
            let context = format!("{context}.companions[{position}]");
            let companion = raw.into_payload(&context)?;
            if !is_plain_component(&companion.name) {
                return Err(InstallError::InvalidManifest(format!(
                    "{context}: companion name {:?} must be a single path component",
                    companion.name
                )));
            }
            if companions.iter().any(|c: &Payload| c.name == companion.name) {
                return Err(InstallError::InvalidManifest(format!(
                    "{context}: duplicate companion name {:?}",
                    companion.name
                )));
            }
            companions.push(companion);
        }
        for entrypoint in &self.entrypoints {
            if !is_safe_relative(entrypoint) {
                return Err(InstallError::InvalidManifest(format!(
                    "{context}: entrypoint {entrypoint:?} must be a relative path"
                )));
            }
        }

        Ok(Some(Artifact {
            component,
            os: canonical_os(&self.os),
            arch: canonical_arch(&self.arch),
            device,
            variant: self.variant.trim().to_string(),
            default: self.default,
            url: primary.url,
            size_bytes: primary.size_bytes,
            digest: primary.digest,
            unpack: primary.unpack,
            entrypoints: self.entrypoints,
            companions,
        }))
    }
}

impl RawPayload {
    fn into_payload(self, context: &str) -> Result<Payload> {
        if self.url.trim().is_empty() {
            return Err(InstallError::InvalidManifest(format!("{context}: empty url")));
        }
        let digest = Digest::parse(&self.digest).map_err(|err| match err {
            DigestError::UnknownAlgorithm(_) => {
                InstallError::UnsupportedManifest(format!("{context}: {err}"))
            }
            DigestError::Malformed(_) => InstallError::InvalidManifest(format!("{context}: {err}")),
        })?;
        let unpack = match self.unpack_kind {
            UnpackKind::File => Unpack::File,
            UnpackKind::Archive => {
                let format = self
                    .archive_format
                    .or_else(|| ArchiveFormat::infer(&self.url))
                    .ok_or_else(|| {
                        InstallError::InvalidManifest(format!(
                            "{context}: cannot infer archive format from {}",
                            self.url
                        ))
                    })?;
                Unpack::Archive {
                    format,
                    strip_components: self.strip_components,
                }
            }
        };
        Ok(Payload {
            name: self.name.trim().to_string(),
            url: self.url.trim().to_string(),
            size_bytes: self.size_bytes,
            digest,
            unpack,
        })
    }
}

fn is_plain_component(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && name != ".."
}

fn is_safe_relative(path: &str) -> bool {
    use std::path::Component as PathComponent;
    let path = Path::new(path);
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, PathComponent::Normal(_)))
}

pub(crate) fn filename_from_uri(uri: &str) -> Option<String> {
    let last_segment = uri.split('/').last()?;
    let clean = last_segment.split('?').next()?.split('#').next()?.trim();
    if clean.is_empty() {
        None
    } else {
        Some(clean.to_string())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    use crate::install::metadata::digest_of;

    pub fn artifact(
        component: &str,
        device: &str,
        variant: &str,
        url: &str,
        body: &[u8],
    ) -> Value {
        json!({
            "component": component,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "device": device,
            "variant": variant,
            "url": url,
            "sizeBytes": body.len(),
            "digest": digest_of(body).to_string(),
            "unpackKind": "file",
        })
    }

    pub fn manifest(release: &str, artifacts: Vec<Value>) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "schemaVersion": 1,
            "releaseVersion": release,
            "artifacts": artifacts,
        }))
        .unwrap()
    }
}
