use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::lock::InstallLock;
use super::metadata::{Digest, MARKER_FILE};
use crate::cancel::CancelToken;
use crate::error::{InstallError, IoContext, Result};
use crate::manifest::{Component, Device};

pub const STORE_FILE: &str = "installs.json";
const STORE_VERSION: u32 = 1;
const STORE_LOCK_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstallRecord {
    pub component: Component,
    pub variant: String,
    pub release_version: String,
    pub digest: Digest,
    pub install_path: PathBuf,
    #[serde(with = "time::serde::rfc3339")]
    pub installed_at: OffsetDateTime,
    pub device: Device,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoints: Vec<PathBuf>,
}

impl InstallRecord {
    /// Same installed content, ignoring when it was recorded.
    #[must_use]
    pub fn same_install(&self, other: &InstallRecord) -> bool {
        self.component == other.component
            && self.variant == other.variant
            && self.release_version == other.release_version
            && self.digest == other.digest
            && self.install_path == other.install_path
            && self.device == other.device
            && self.entrypoints == other.entrypoints
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    records: Vec<InstallRecord>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_aside: Option<PathBuf>,
    pub recovered: Vec<InstallRecord>,
    pub removed_dirs: Vec<PathBuf>,
}

/// Durable record of what is installed under one root directory.
#[derive(Debug, Clone)]
pub struct InstallStore {
    root: PathBuf,
    file: PathBuf,
}

impl InstallStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .io_context(|| format!("create install root {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            file: root.join(STORE_FILE),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join("locks").join(format!("{name}.lock"))
    }

    pub fn list(&self) -> Result<Vec<InstallRecord>> {
        let mut records = self.load()?.records;
        records.sort_by(|a, b| (a.component, &a.variant).cmp(&(b.component, &b.variant)));
        Ok(records)
    }

    pub fn get(&self, component: Component, variant: &str) -> Result<Option<InstallRecord>> {
        Ok(self
            .load()?
            .records
            .into_iter()
            .find(|record| record.component == component && record.variant == variant))
    }

    /// Inserts or replaces the record for its (component, variant) and returns
    /// the record it replaced. Recording an identical install writes nothing.
    pub fn record(
        &self,
        record: InstallRecord,
        cancel: &CancelToken,
    ) -> Result<Option<InstallRecord>> {
        let _guard = InstallLock::acquire(&self.lock_path("store"), STORE_LOCK_WAIT, cancel)?;
        let mut state = self.load()?;
        let position = state
            .records
            .iter()
            .position(|r| r.component == record.component && r.variant == record.variant);

        let previous = match position {
            Some(index) if state.records[index].same_install(&record) => {
                debug!(component = %record.component, variant = %record.variant, "record unchanged");
                return Ok(Some(state.records[index].clone()));
            }
            Some(index) => Some(std::mem::replace(&mut state.records[index], record)),
            None => {
                state.records.push(record);
                None
            }
        };
        state.version = STORE_VERSION;
        self.write(&state)?;
        Ok(previous)
    }

    /// Moves an unreadable store aside and rebuilds it from the markers found
    /// in published directories. Published directories that no record points
    /// to are removed.
    pub fn repair(&self, cancel: &CancelToken) -> Result<RepairReport> {
        let _guard = InstallLock::acquire(&self.lock_path("store"), STORE_LOCK_WAIT, cancel)?;
        let mut report = RepairReport::default();

        let existing = match self.load() {
            Ok(state) => Some(state.records),
            Err(InstallError::StoreCorrupt { reason, .. }) => {
                let aside = self.root.join(format!(
                    "{STORE_FILE}.corrupt-{}",
                    OffsetDateTime::now_utc().unix_timestamp()
                ));
                warn!(store = %self.file.display(), %reason, aside = %aside.display(), "moving corrupt store aside");
                fs::rename(&self.file, &aside)
                    .io_context(|| format!("move aside {}", self.file.display()))?;
                report.moved_aside = Some(aside);
                None
            }
            Err(err) => return Err(err),
        };

        let markers = self.scan_markers(cancel)?;
        let mut active: BTreeMap<(Component, String), InstallRecord> = BTreeMap::new();
        match existing {
            Some(records) => {
                for record in records {
                    if record.install_path.join(MARKER_FILE).is_file() {
                        active.insert((record.component, record.variant.clone()), record);
                    } else {
                        warn!(component = %record.component, variant = %record.variant, "dropping record whose install is gone");
                    }
                }
                for marker in &markers {
                    let key = (marker.component, marker.variant.clone());
                    if !active.contains_key(&key) {
                        active.insert(key, marker.clone());
                        report.recovered.push(marker.clone());
                    }
                }
            }
            None => {
                for marker in &markers {
                    let key = (marker.component, marker.variant.clone());
                    let newer = active
                        .get(&key)
                        .map_or(true, |current| marker.installed_at > current.installed_at);
                    if newer {
                        active.insert(key, marker.clone());
                    }
                }
                report.recovered = active.values().cloned().collect();
            }
        }

        for marker in &markers {
            let live = active
                .values()
                .any(|record| record.install_path == marker.install_path);
            if !live {
                remove_dir_logged(&marker.install_path);
                report.removed_dirs.push(marker.install_path.clone());
            }
        }

        let staging = self.root.join("staging");
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .io_context(|| format!("clear staging {}", staging.display()))?;
        }

        self.write(&StoreFile {
            version: STORE_VERSION,
            records: active.into_values().collect(),
        })?;
        info!(
            recovered = report.recovered.len(),
            removed = report.removed_dirs.len(),
            "install store repaired"
        );
        Ok(report)
    }

    fn load(&self) -> Result<StoreFile> {
        let raw = match fs::read(&self.file) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreFile {
                    version: STORE_VERSION,
                    records: Vec::new(),
                })
            }
            Err(err) => {
                return Err(InstallError::io(
                    format!("read install store {}", self.file.display()),
                    err,
                ))
            }
        };
        let state: StoreFile =
            serde_json::from_slice(&raw).map_err(|err| InstallError::StoreCorrupt {
                path: self.file.clone(),
                reason: err.to_string(),
            })?;
        if state.version != STORE_VERSION {
            return Err(InstallError::StoreCorrupt {
                path: self.file.clone(),
                reason: format!("unknown store version {}", state.version),
            });
        }
        Ok(state)
    }

    fn write(&self, state: &StoreFile) -> Result<()> {
        let body = serde_json::to_vec_pretty(state)
            .map_err(|err| InstallError::io("encode install store", err.into()))?;
        write_atomic(&self.file, &body)
    }

    /// Reads every `<root>/<component>/<variant>/<dir>/MARKER_FILE`.
    fn scan_markers(&self, cancel: &CancelToken) -> Result<Vec<InstallRecord>> {
        let mut markers = Vec::new();
        for component in [Component::Stt, Component::Tts] {
            let component_dir = self.root.join(component.as_str());
            for variant_dir in read_dirs(&component_dir)? {
                for install_dir in read_dirs(&variant_dir)? {
                    cancel.check()?;
                    let marker_path = install_dir.join(MARKER_FILE);
                    let Ok(raw) = fs::read(&marker_path) else {
                        continue;
                    };
                    match serde_json::from_slice::<InstallRecord>(&raw) {
                        Ok(mut record) => {
                            record.install_path = install_dir.clone();
                            markers.push(record);
                        }
                        Err(err) => {
                            warn!(marker = %marker_path.display(), "ignoring unreadable marker: {err}");
                        }
                    }
                }
            }
        }
        Ok(markers)
    }
}

fn read_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(InstallError::io(format!("read {}", dir.display()), err)),
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn remove_dir_logged(path: &Path) {
    if let Err(err) = fs::remove_dir_all(path) {
        warn!(path = %path.display(), "failed to remove directory: {err}");
    }
}

/// Writes `bytes` to a sibling temp file, syncs it and renames it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("file");
    let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp).io_context(|| format!("create {}", tmp.display()))?;
        file.write_all(bytes)
            .io_context(|| format!("write {}", tmp.display()))?;
        file.sync_all()
            .io_context(|| format!("sync {}", tmp.display()))?;
        fs::rename(&tmp, path).io_context(|| format!("replace {}", path.display()))?;
        sync_dir(parent);
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}


#[cfg(test)]
mod tests {
    use super::fixtures::{publish_marker, record};
    use super::*;

    #[test]
    fn empty_store_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStore::open(dir.path()).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(store.get(Component::Stt, "").unwrap().is_none());
    }

    #[test]
    fn record_replaces_per_key_and_returns_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStore::open(dir.path()).unwrap();
        let cancel = CancelToken::new();

        let first = record(dir.path(), Component::Stt, "base", b"one");
        assert!(store.record(first.clone(), &cancel).unwrap().is_none());
        store
            .record(record(dir.path(), Component::Tts, "f1", b"voice"), &cancel)
            .unwrap();

        let second = record(dir.path(), Component::Stt, "base", b"two");
        let previous = store.record(second.clone(), &cancel).unwrap().unwrap();
        assert_eq!(previous.digest, first.digest);
        assert_eq!(store.get(Component::Stt, "base").unwrap().unwrap(), second);
        assert_eq!(store.list().unwrap().len(), 2);

        let on_disk: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk["version"], 1);
        assert_eq!(on_disk["records"][0]["component"], "stt");
    }

    #[test]
    fn identical_record_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStore::open(dir.path()).unwrap();
        let cancel = CancelToken::new();
        let rec = record(dir.path(), Component::Stt, "", b"one");
        store.record(rec.clone(), &cancel).unwrap();
        let before = fs::metadata(store.path()).unwrap().modified().unwrap();
        let raw_before = fs::read(store.path()).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let mut again = rec.clone();
        again.installed_at = OffsetDateTime::now_utc();
        store.record(again, &cancel).unwrap();
        assert_eq!(fs::read(store.path()).unwrap(), raw_before);
        assert_eq!(fs::metadata(store.path()).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn corrupt_store_is_reported_not_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStore::open(dir.path()).unwrap();
        fs::write(store.path(), b"{\"version\": 1, \"records\": [").unwrap();

        assert!(matches!(store.list(), Err(InstallError::StoreCorrupt { .. })));
        let rec = record(dir.path(), Component::Stt, "", b"x");
        assert!(matches!(
            store.record(rec, &CancelToken::new()),
            Err(InstallError::StoreCorrupt { .. })
        ));
        assert_eq!(
            fs::read(store.path()).unwrap(),
            b"{\"version\": 1, \"records\": ["
        );
    }

    #[test]
    fn repair_rebuilds_from_markers() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStore::open(dir.path()).unwrap();
        let stt = record(dir.path(), Component::Stt, "base", b"stt");
        let tts = record(dir.path(), Component::Tts, "f1", b"tts");
        publish_marker(&stt);
        publish_marker(&tts);
        fs::write(store.path(), b"not json").unwrap();
        fs::create_dir_all(dir.path().join("staging/stt-base")).unwrap();

        let report = store.repair(&CancelToken::new()).unwrap();
        let aside = report.moved_aside.unwrap();
        assert_eq!(fs::read(aside).unwrap(), b"not json");
        assert_eq!(report.recovered.len(), 2);
        assert!(!dir.path().join("staging").exists());

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].digest, stt.digest);
        assert_eq!(listed[1].install_path, tts.install_path);
    }

    #[test]
    fn repair_keeps_newest_marker_and_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStore::open(dir.path()).unwrap();
        let mut old = record(dir.path(), Component::Stt, "base", b"old");
        old.installed_at = OffsetDateTime::UNIX_EPOCH;
        let new = record(dir.path(), Component::Stt, "base", b"new");
        publish_marker(&old);
        publish_marker(&new);
        fs::write(store.path(), b"{").unwrap();

        let report = store.repair(&CancelToken::new()).unwrap();
        assert_eq!(report.removed_dirs, vec![old.install_path.clone()]);
        assert!(!old.install_path.exists());
        assert_eq!(
            store.get(Component::Stt, "base").unwrap().unwrap().digest,
            new.digest
        );
    }

    #[test]
    fn repair_on_healthy_store_drops_missing_installs() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstallStore::open(dir.path()).unwrap();
        let cancel = CancelToken::new();
        let kept = record(dir.path(), Component::Stt, "", b"kept");
        publish_marker(&kept);
        store.record(kept.clone(), &cancel).unwrap();
        store
            .record(record(dir.path(), Component::Tts, "", b"gone"), &cancel)
            .unwrap();

        let report = store.repair(&cancel).unwrap();
        assert!(report.moved_aside.is_none());
        assert!(report.recovered.is_empty());
        assert_eq!(store.list().unwrap(), vec![kept]);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("installs.json");
        write_atomic(&target, b"{}").unwrap();
        write_atomic(&target, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"{\"a\":1}");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
