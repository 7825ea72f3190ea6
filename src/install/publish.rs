use std::{
    fs,
    path::{Component as PathComponent, Path, PathBuf},
};

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::download::DownloadOutcome;
use super::metadata::MARKER_FILE;
use super::store::{write_atomic, InstallRecord};
use crate::cancel::CancelToken;
use crate::error::{InstallError, IoContext, Result};
use crate::manifest::{Artifact, Component};

/// Directory name used for a variant on disk. The manifest default variant
/// is the empty string.
#[must_use]
pub fn variant_dir_name(variant: &str) -> &str {
    if variant.is_empty() {
        "default"
    } else {
        variant
    }
}

#[must_use]
pub fn variant_root(root: &Path, component: Component, variant: &str) -> PathBuf {
    root.join(component.as_str()).join(variant_dir_name(variant))
}

/// Assembles verified payloads into one tree, writes the install marker and
/// renames the tree into a fresh versioned directory under `root`. Nothing
/// already published is modified; the caller commits by recording the
/// returned record and then retires the superseded directory.
pub fn publish(
    root: &Path,
    bin_dir: &Path,
    artifact: &Artifact,
    release_version: &str,
    outcomes: &[DownloadOutcome],
    cancel: &CancelToken,
) -> Result<InstallRecord> {
    let (primary, companions) = outcomes
        .split_first()
        .ok_or_else(|| {
            InstallError::io(
                "publish",
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no verified payloads"),
            )
        })?;
    let tree = &primary.ready_path;

    for (payload, outcome) in artifact.companions.iter().zip(companions) {
        cancel.check()?;
        let target = tree.join(&payload.name);
        if target.exists() {
            return Err(InstallError::InvalidManifest(format!(
                "companion {:?} collides with a path in the primary payload",
                payload.name
            )));
        }
        fs::rename(&outcome.ready_path, &target)
            .io_context(|| format!("place companion {}", payload.name))?;
    }

    for entrypoint in &artifact.entrypoints {
        let path = tree.join(entrypoint);
        if !path.is_file() {
            return Err(InstallError::InvalidManifest(format!(
                "entrypoint {entrypoint:?} missing from {}",
                artifact.url
            )));
        }
        make_executable(&path)?;
    }

    let parent = variant_root(root, artifact.component, &artifact.variant);
    fs::create_dir_all(&parent).io_context(|| format!("create {}", parent.display()))?;
    let install_path = parent.join(format!(
        "{}-{}",
        artifact.digest.short(),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    ));

    let record = InstallRecord {
        component: artifact.component,
        variant: artifact.variant.clone(),
        release_version: release_version.to_string(),
        digest: artifact.digest.clone(),
        install_path: install_path.clone(),
        installed_at: OffsetDateTime::now_utc(),
        device: artifact.device,
        size_bytes: artifact.total_size(),
        entrypoints: artifact
            .entrypoints
            .iter()
            .filter_map(|entrypoint| link_name(entrypoint).map(|name| bin_dir.join(name)))
            .collect(),
    };
    let marker = serde_json::to_vec_pretty(&record)
        .map_err(|err| InstallError::io("encode install marker", err.into()))?;
    write_atomic(&tree.join(MARKER_FILE), &marker)?;

    cancel.check()?;
    fs::rename(tree, &install_path)
        .io_context(|| format!("publish {}", install_path.display()))?;
    info!(
        component = %artifact.component,
        variant = %artifact.variant,
        path = %install_path.display(),
        "published"
    );
    Ok(record)
}

/// Points each entry point link in the binaries directory at the published
/// file, replacing whatever link was there. Returns the links it had to
/// create or update.
pub fn ensure_links(record: &InstallRecord, entrypoints: &[String]) -> Result<Vec<PathBuf>> {
    let mut changed = Vec::new();
    for (entrypoint, link) in entrypoints.iter().zip(&record.entrypoints) {
        let target = record.install_path.join(entrypoint);
        if link_points_to(link, &target) {
            continue;
        }
        if let Some(dir) = link.parent() {
            fs::create_dir_all(dir).io_context(|| format!("create {}", dir.display()))?;
        }
        replace_link(&target, link)?;
        debug!(link = %link.display(), target = %target.display(), "linked entrypoint");
        changed.push(link.clone());
    }
    Ok(changed)
}

/// Removes a superseded install directory. Failure only leaves garbage behind
/// for `repair` to collect.
pub fn retire(path: &Path) {
    if !path.exists() {
        return;
    }
    match fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "removed superseded install"),
        Err(err) => warn!(path = %path.display(), "failed to remove superseded install: {err}"),
    }
}

/// Every entry point link that is missing or no longer leads into the
/// published directory.
#[must_use]
pub fn broken_links(record: &InstallRecord) -> Vec<PathBuf> {
    record
        .entrypoints
        .iter()
        .filter(|link| !link_is_live(link, &record.install_path))
        .cloned()
        .collect()
}

fn link_name(entrypoint: &str) -> Option<String> {
    Path::new(entrypoint)
        .components()
        .filter_map(|component| match component {
            PathComponent::Normal(name) => name.to_str(),
            _ => None,
        })
        .last()
        .map(str::to_string)
}

fn temp_sibling(link: &Path) -> PathBuf {
    let name = link
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("entrypoint");
    link.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

#[cfg(unix)]
fn link_points_to(link: &Path, target: &Path) -> bool {
    fs::read_link(link).is_ok_and(|current| current == target)
}

#[cfg(unix)]
fn link_is_live(link: &Path, install_path: &Path) -> bool {
    fs::read_link(link).is_ok_and(|target| target.starts_with(install_path) && target.is_file())
}

#[cfg(unix)]
fn replace_link(target: &Path, link: &Path) -> Result<()> {
    let tmp = temp_sibling(link);
    std::os::unix::fs::symlink(target, &tmp)
        .io_context(|| format!("link {}", tmp.display()))?;
    fs::rename(&tmp, link).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        InstallError::io(format!("replace {}", link.display()), err)
    })
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = fs::metadata(path)
        .io_context(|| format!("stat {}", path.display()))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions).io_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn link_points_to(link: &Path, target: &Path) -> bool {
    match (fs::read(link), fs::read(target)) {
        (Ok(current), Ok(wanted)) => current == wanted,
        _ => false,
    }
}

#[cfg(not(unix))]
fn link_is_live(link: &Path, _install_path: &Path) -> bool {
    link.is_file()
}

#[cfg(not(unix))]
fn replace_link(target: &Path, link: &Path) -> Result<()> {
    let tmp = temp_sibling(link);
    fs::copy(target, &tmp).io_context(|| format!("copy {}", target.display()))?;
    fs::rename(&tmp, link).map_err(|err| {
        let _ = fs::remove_file(&tmp);
        InstallError::io(format!("replace {}", link.display()), err)
    })
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::metadata::digest_of;
    use crate::manifest::{Device, Payload, Unpack};

    fn artifact(entrypoints: &[&str], companions: Vec<Payload>) -> Artifact {
        Artifact {
            component: Component::Stt,
            os: std::env::consts::OS.into(),
            arch: std::env::consts::ARCH.into(),
            device: Device::Cpu,
            variant: "base".into(),
            default: true,
            url: "https://cdn.example/stt.tar.gz".into(),
            size_bytes: 10,
            digest: digest_of(b"primary"),
            unpack: Unpack::File,
            entrypoints: entrypoints.iter().map(|e| e.to_string()).collect(),
            companions,
        }
    }

    fn ready(staging: &Path, name: &str, files: &[(&str, &[u8])]) -> DownloadOutcome {
        let dir = staging.join(name);
        for (path, body) in files {
            let path = dir.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        DownloadOutcome {
            ready_path: dir,
            bytes_downloaded: 0,
            resumed: false,
        }
    }

    #[test]
    fn publishes_tree_with_marker_and_companions() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("staging/stt-base");
        let companion = Payload {
            name: "runtime".into(),
            url: "https://cdn.example/ort.so".into(),
            size_bytes: 3,
            digest: digest_of(b"ort"),
            unpack: Unpack::File,
        };
        let artifact = artifact(&["bin/stt-runner"], vec![companion]);
        let outcomes = vec![
            ready(&staging, "primary", &[("bin/stt-runner", b"#!/bin/sh\n"), ("model.onnx", b"m")]),
            ready(&staging, "runtime", &[("ort.so", b"ort")]),
        ];
        let bin = root.path().join("bin");

        let record = publish(root.path(), &bin, &artifact, "2024.06.1", &outcomes, &CancelToken::new())
            .unwrap();
        assert!(record.install_path.starts_with(root.path().join("stt/base")));
        assert!(record
            .install_path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with(artifact.digest.short()));
        assert_eq!(fs::read(record.install_path.join("model.onnx")).unwrap(), b"m");
        assert_eq!(fs::read(record.install_path.join("runtime/ort.so")).unwrap(), b"ort");
        let marker: InstallRecord =
            serde_json::from_slice(&fs::read(record.install_path.join(MARKER_FILE)).unwrap()).unwrap();
        assert_eq!(marker.digest, artifact.digest);
        assert_eq!(record.entrypoints, vec![bin.join("stt-runner")]);
        assert!(!staging.join("primary").exists());
        assert_eq!(record.size_bytes, 13);
    }

    #[test]
    fn missing_entrypoint_is_rejected_before_publishing() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("staging");
        let artifact = artifact(&["bin/absent"], Vec::new());
        let outcomes = vec![ready(&staging, "primary", &[("model.onnx", b"m")])];
        let err = publish(
            root.path(),
            &root.path().join("bin"),
            &artifact,
            "1",
            &outcomes,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, InstallError::InvalidManifest(_)));
        assert!(!root.path().join("stt").exists());
    }

    #[test]
    fn links_are_created_and_repointed() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        let artifact = artifact(&["bin/stt-runner"], Vec::new());

        let first = publish(
            root.path(),
            &bin,
            &artifact,
            "1",
            &[ready(&root.path().join("s1"), "primary", &[("bin/stt-runner", b"v1")])],
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(ensure_links(&first, &artifact.entrypoints).unwrap().len(), 1);
        assert!(ensure_links(&first, &artifact.entrypoints).unwrap().is_empty());
        assert_eq!(fs::read(bin.join("stt-runner")).unwrap(), b"v1");

        let second = publish(
            root.path(),
            &bin,
            &artifact,
            "2",
            &[ready(&root.path().join("s2"), "primary", &[("bin/stt-runner", b"v2")])],
            &CancelToken::new(),
        )
        .unwrap();
        assert_ne!(first.install_path, second.install_path);
        assert_eq!(broken_links(&second), vec![bin.join("stt-runner")]);
        ensure_links(&second, &artifact.entrypoints).unwrap();
        retire(&first.install_path);
        assert!(!first.install_path.exists());
        assert_eq!(fs::read(bin.join("stt-runner")).unwrap(), b"v2");
        assert!(broken_links(&second).is_empty());
    }

    #[test]
    fn default_variant_uses_named_directory() {
        assert_eq!(variant_dir_name(""), "default");
        assert_eq!(
            variant_root(Path::new("/srv"), Component::Tts, "f1"),
            Path::new("/srv/tts/f1")
        );
    }
}
