use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Component, Path, PathBuf},
};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::debug;
use zip::read::ZipArchive;

use crate::cancel::CancelToken;
use crate::error::{InstallError, IoContext, Result};
use crate::manifest::ArchiveFormat;

/// Unpacks an already verified archive into `dest`.
///
/// Every entry path must stay inside `dest`: parent references, absolute or
/// rooted paths, and links pointing outside the tree fail with
/// `UnsafeArchiveEntry` before anything is written for that entry.
pub fn unpack(
    archive_path: &Path,
    format: ArchiveFormat,
    strip_components: u8,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    fs::create_dir_all(dest).io_context(|| format!("create {}", dest.display()))?;
    let file = File::open(archive_path)
        .io_context(|| format!("open archive {}", archive_path.display()))?;
    match format {
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(file), strip_components, dest, cancel),
        ArchiveFormat::TarBz2 => unpack_tar(BzDecoder::new(file), strip_components, dest, cancel),
        ArchiveFormat::Zip => unpack_zip(file, strip_components, dest, cancel),
    }
}

fn unpack_tar<R: Read>(
    reader: R,
    strip_components: u8,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let root = dest
        .canonicalize()
        .io_context(|| format!("resolve {}", dest.display()))?;
    // Symlinks written so far, relative to `dest`.
    let mut links: Vec<PathBuf> = Vec::new();
    let mut archive = Archive::new(reader);
    let entries = archive.entries().io_context(|| "iterate tar entries")?;
    for entry in entries {
        cancel.check()?;
        let mut entry = entry.io_context(|| "read tar entry")?;
        let raw = entry.path().io_context(|| "read entry path")?.into_owned();
        let relative = checked_relative(&raw)?;
        let Some(relative) = strip(&relative, strip_components) else {
            continue;
        };
        if through_link(&relative, &links) {
            return Err(unsafe_entry(&raw));
        }
        let target = dest.join(&relative);

        match entry.header().entry_type() {
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .io_context(|| "read symlink target")?
                    .ok_or_else(|| unsafe_entry(&raw))?
                    .into_owned();
                check_symlink(&relative, &link, &raw, &links)?;
                links.push(relative.clone());
            }
            EntryType::Link => {
                let link = entry
                    .link_name()
                    .io_context(|| "read hard link target")?
                    .ok_or_else(|| unsafe_entry(&raw))?
                    .into_owned();
                let source = strip(&checked_relative(&link)?, strip_components)
                    .ok_or_else(|| unsafe_entry(&raw))?;
                if through_link(&source, &links) {
                    return Err(unsafe_entry(&raw));
                }
                ensure_inside(&target, &root, &raw)?;
                fs::copy(dest.join(&source), &target)
                    .io_context(|| format!("materialise hard link {}", relative.display()))?;
                continue;
            }
            _ => {}
        }

        ensure_inside(&target, &root, &raw)?;
        entry
            .unpack(&target)
            .io_context(|| format!("unpack {}", relative.display()))?;
        debug!(entry = %relative.display(), "unpacked");
    }
    Ok(())
}

fn unpack_zip(file: File, strip_components: u8, dest: &Path, cancel: &CancelToken) -> Result<()> {
    let mut archive = ZipArchive::new(file)
        .map_err(|err| InstallError::io("open zip archive", io::Error::other(err)))?;
    for index in 0..archive.len() {
        cancel.check()?;
        let mut entry = archive
            .by_index(index)
            .map_err(|err| InstallError::io("read zip entry", io::Error::other(err)))?;
        let raw = PathBuf::from(entry.name());
        if entry.enclosed_name().is_none() {
            return Err(unsafe_entry(&raw));
        }
        let relative = checked_relative(&raw)?;
        let Some(relative) = strip(&relative, strip_components) else {
            continue;
        };
        let target = dest.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).io_context(|| format!("create {}", target.display()))?;
            continue;
        }
        ensure_parent(&target)?;
        let mut outfile =
            File::create(&target).io_context(|| format!("create {}", target.display()))?;
        io::copy(&mut entry, &mut outfile)
            .io_context(|| format!("write {}", relative.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .io_context(|| format!("set mode on {}", target.display()))?;
            }
        }
    }
    Ok(())
}

/// Normalises an entry path, rejecting anything that could leave the root.
fn checked_relative(raw: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_entry(raw));
            }
        }
    }
    Ok(clean)
}

/// Symlink targets resolve relative to the link's own directory. They may
/// not climb above the unpack root or pass through a link already unpacked.
fn check_symlink(relative: &Path, target: &Path, raw: &Path, links: &[PathBuf]) -> Result<()> {
    let mut resolved: PathBuf = relative.parent().map(Path::to_path_buf).unwrap_or_default();
    for component in target.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                if links.iter().any(|link| *link == resolved) {
                    return Err(unsafe_entry(raw));
                }
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(unsafe_entry(raw));
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(unsafe_entry(raw)),
        }
    }
    Ok(())
}

/// `true` when `path` is, or lies beneath, a symlink from the same archive.
fn through_link(path: &Path, links: &[PathBuf]) -> bool {
    links.iter().any(|link| path.starts_with(link))
}

/// Creates the parent of `target` and confirms it still resolves under `root`.
fn ensure_inside(target: &Path, root: &Path, raw: &Path) -> Result<()> {
    ensure_parent(target)?;
    let Some(parent) = target.parent() else {
        return Err(unsafe_entry(raw));
    };
    let resolved = parent
        .canonicalize()
        .io_context(|| format!("resolve {}", parent.display()))?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(unsafe_entry(raw))
    }
}

fn strip(path: &Path, count: u8) -> Option<PathBuf> {
    let stripped: PathBuf = path.components().skip(usize::from(count)).collect();
    if stripped.as_os_str().is_empty() {
        None
    } else {
        Some(stripped)
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).io_context(|| format!("create {}", parent.display()))?;
    }
    Ok(())
}

fn unsafe_entry(raw: &Path) -> InstallError {
    InstallError::UnsafeArchiveEntry {
        entry: raw.display().to_string(),
    }
}
