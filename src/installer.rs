use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::core::settings::Settings;
use crate::error::{InstallError, Result};
use crate::install::{
    metadata::{Digest, MARKER_FILE},
    publish::{self, variant_dir_name},
    InstallLock, InstallRecord, InstallStore, RepairReport, TransferPool,
};
use crate::manifest::{
    Artifact, Component, Device, Manifest, ManifestCache, ManifestFetcher, ManifestSource,
};
use crate::platform::PlatformFacts;
use crate::selector::{self, DeviceDecision, DevicePreference, Selection, SelectionWarning, VariantDecision};
use crate::transport::{HttpTransport, Transport};

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub component: Component,
    /// Install root; the configured models directory when unset.
    pub dest: Option<PathBuf>,
    pub device: DevicePreference,
    /// Model or voice name; empty selects the manifest default.
    pub variant: String,
    /// Manifest URL or path; the configured manifest when unset.
    pub manifest: Option<String>,
    pub offline: bool,
    pub upgrade: bool,
}

impl InstallRequest {
    pub fn new(component: Component) -> Self {
        Self {
            component,
            dest: None,
            device: DevicePreference::Auto,
            variant: String::new(),
            manifest: None,
            offline: false,
            upgrade: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallPhase {
    Idle,
    ManifestResolved,
    ArtifactSelected,
    UpToDate,
    Downloading,
    Verifying,
    Publishing,
    Done,
    Failed,
}

impl InstallPhase {
    #[must_use]
    pub fn can_advance_to(self, next: InstallPhase) -> bool {
        use InstallPhase::*;
        match next {
            Failed => !matches!(self, Done | Failed),
            _ => matches!(
                (self, next),
                (Idle, ManifestResolved)
                    | (ManifestResolved, ArtifactSelected)
                    | (ArtifactSelected, UpToDate)
                    | (ArtifactSelected, Downloading)
                    | (Downloading, Verifying)
                    | (Verifying, Publishing)
                    | (Publishing, Done)
                    | (UpToDate, Done)
            ),
        }
    }
}

struct PhaseLog {
    component: Component,
    history: Vec<InstallPhase>,
}

impl PhaseLog {
    fn new(component: Component) -> Self {
        Self {
            component,
            history: vec![InstallPhase::Idle],
        }
    }

    fn current(&self) -> InstallPhase {
        self.history
            .last()
            .copied()
            .unwrap_or(InstallPhase::Idle)
    }

    fn advance(&mut self, next: InstallPhase) {
        let from = self.current();
        debug_assert!(from.can_advance_to(next), "{from:?} -> {next:?}");
        debug!(component = %self.component, ?from, to = ?next, "install phase");
        self.history.push(next);
    }

    fn fail(&mut self, err: &InstallError) {
        let from = self.current();
        if from.can_advance_to(InstallPhase::Failed) {
            warn!(component = %self.component, ?from, kind = ?err.kind(), "install failed: {err}");
            self.history.push(InstallPhase::Failed);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStatus {
    UpToDate,
    Installed,
    Upgraded,
    Reinstalled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    pub status: InstallStatus,
    pub component: Component,
    pub variant: String,
    pub version: String,
    pub digest: Digest,
    pub device: Device,
    pub installed_path: PathBuf,
    pub device_decision: DeviceDecision,
    pub variant_decision: VariantDecision,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SelectionWarning>,
    pub bytes_downloaded: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub linked: Vec<PathBuf>,
    pub phases: Vec<InstallPhase>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentCheck {
    pub component: Component,
    pub variant: String,
    pub version: String,
    pub device: Device,
    pub path: PathBuf,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub root: PathBuf,
    pub ok: bool,
    pub components: Vec<ComponentCheck>,
}

/// Drives one install, check, list or repair against an install root.
pub struct Installer {
    settings: Settings,
    transport: Box<dyn Transport>,
    facts: PlatformFacts,
}

impl Installer {
    pub fn new(settings: Settings) -> Result<Self> {
        let transport = HttpTransport::new(&settings.user_agent(), settings.connect_timeout)?;
        Ok(Self::with_transport(
            settings,
            Box::new(transport),
            PlatformFacts::detect(),
        ))
    }

    pub fn with_transport(
        settings: Settings,
        transport: Box<dyn Transport>,
        facts: PlatformFacts,
    ) -> Self {
        Self {
            settings,
            transport,
            facts,
        }
    }

    fn root<'a>(&'a self, dest: Option<&'a Path>) -> &'a Path {
        dest.unwrap_or(self.settings.models_dir.as_path())
    }

    pub fn install(&self, request: &InstallRequest, cancel: &CancelToken) -> Result<InstallOutcome> {
        self.install_with_progress(request, cancel, &|_, _| {})
    }

    pub fn install_with_progress(
        &self,
        request: &InstallRequest,
        cancel: &CancelToken,
        progress: &(dyn Fn(u64, u64) + Sync),
    ) -> Result<InstallOutcome> {
        let root = self.root(request.dest.as_deref());
        let mut phases = PhaseLog::new(request.component);
        let result = InstallStore::open(root)
            .and_then(|store| self.run(request, &store, &mut phases, cancel, progress));
        match result {
            Ok(mut outcome) => {
                outcome.phases = phases.history;
                Ok(outcome)
            }
            Err(err) => {
                phases.fail(&err);
                Err(err)
            }
        }
    }

    fn run(
        &self,
        request: &InstallRequest,
        store: &InstallStore,
        phases: &mut PhaseLog,
        cancel: &CancelToken,
        progress: &(dyn Fn(u64, u64) + Sync),
    ) -> Result<InstallOutcome> {
        let source = request
            .manifest
            .clone()
            .unwrap_or_else(|| self.settings.manifest_url.clone());
        let cache = ManifestCache::new(store.root());

        if !request.upgrade {
            if let Some(outcome) = self.cached_up_to_date(request, store, &cache, &source, phases)? {
                return Ok(outcome);
            }
        }

        let fetcher = ManifestFetcher::new(self.transport.as_ref(), self.settings.retry);
        let (manifest, document) = fetcher.fetch_document(&source, request.offline, cancel)?;
        if ManifestSource::parse(&source).requires_network() {
            if let Err(err) = cache.save(&source, &document) {
                warn!("failed to cache manifest: {err}");
            }
        }
        phases.advance(InstallPhase::ManifestResolved);

        let selection = self.select(&manifest, request)?;
        phases.advance(InstallPhase::ArtifactSelected);

        if !request.upgrade {
            if let Some(record) = current_install(store, &selection)? {
                return self.up_to_date(record, selection, phases);
            }
        }

        let variant = selection.variant.variant().to_string();
        let key = format!("{}-{}", request.component, variant_dir_name(&variant));
        let started = OffsetDateTime::now_utc();
        let _lock = InstallLock::acquire(&store.lock_path(&key), self.settings.lock_wait, cancel)?;

        // Another installer may have published the same artifact while we waited.
        if let Some(record) = current_install(store, &selection)? {
            if !request.upgrade || record.installed_at >= started {
                info!(component = %request.component, %variant, "installed concurrently by another process");
                return self.up_to_date(record, selection, phases);
            }
        }

        let staging = store.root().join("staging").join(&key);
        let result = self.download_and_publish(
            store,
            &manifest,
            selection,
            &staging,
            phases,
            cancel,
            progress,
        );
        if staging.exists() {
            if let Err(err) = fs::remove_dir_all(&staging) {
                warn!(staging = %staging.display(), "failed to clean staging: {err}");
            }
        }
        result
    }

    fn select(&self, manifest: &Manifest, request: &InstallRequest) -> Result<Selection> {
        let selection = selector::select(
            manifest,
            &self.facts,
            request.component,
            request.device,
            &request.variant,
        )?;
        if let DeviceDecision::AutoCpu { reason } = selection.device {
            info!(component = %request.component, ?reason, "using cpu artifact");
        }
        Ok(selection)
    }

    /// Confirms from a recent cached manifest that nothing needs downloading.
    /// Offline runs accept a cache of any age. Any doubt falls through to a
    /// fresh manifest.
    fn cached_up_to_date(
        &self,
        request: &InstallRequest,
        store: &InstallStore,
        cache: &ManifestCache,
        source: &str,
        phases: &mut PhaseLog,
    ) -> Result<Option<InstallOutcome>> {
        if !ManifestSource::parse(source).requires_network() {
            return Ok(None);
        }
        let max_age = (!request.offline).then_some(self.settings.manifest_cache_ttl);
        let Some(manifest) = cache.load(source, max_age) else {
            return Ok(None);
        };
        let Ok(selection) = self.select(&manifest, request) else {
            return Ok(None);
        };
        let Some(record) = current_install(store, &selection)? else {
            return Ok(None);
        };
        phases.advance(InstallPhase::ManifestResolved);
        phases.advance(InstallPhase::ArtifactSelected);
        self.up_to_date(record, selection, phases).map(Some)
    }

    fn up_to_date(
        &self,
        record: InstallRecord,
        selection: Selection,
        phases: &mut PhaseLog,
    ) -> Result<InstallOutcome> {
        phases.advance(InstallPhase::UpToDate);
        let linked = publish::ensure_links(&record, &selection.artifact.entrypoints)?;
        phases.advance(InstallPhase::Done);
        info!(
            component = %record.component,
            variant = %record.variant,
            version = %record.release_version,
            "already up to date"
        );
        Ok(InstallOutcome {
            status: InstallStatus::UpToDate,
            component: record.component,
            variant: record.variant,
            version: record.release_version,
            digest: record.digest,
            device: record.device,
            installed_path: record.install_path,
            device_decision: selection.device,
            variant_decision: selection.variant,
            warnings: selection.warnings,
            bytes_downloaded: 0,
            linked,
            phases: Vec::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn download_and_publish(
        &self,
        store: &InstallStore,
        manifest: &Manifest,
        selection: Selection,
        staging: &Path,
        phases: &mut PhaseLog,
        cancel: &CancelToken,
        progress: &(dyn Fn(u64, u64) + Sync),
    ) -> Result<InstallOutcome> {
        let artifact: &Artifact = &selection.artifact;
        phases.advance(InstallPhase::Downloading);
        info!(
            key = %artifact.key(),
            version = %manifest.release_version,
            bytes = artifact.total_size(),
            "downloading"
        );
        let pool = TransferPool::new(
            self.transport.as_ref(),
            self.settings.retry,
            self.settings.max_parallel_transfers,
        );
        let outcomes = pool.fetch_all(&artifact.payloads(), staging, cancel, progress)?;
        let bytes_downloaded = outcomes.iter().map(|outcome| outcome.bytes_downloaded).sum();

        phases.advance(InstallPhase::Verifying);
        for outcome in &outcomes {
            if !outcome.ready_path.exists() {
                return Err(InstallError::io(
                    format!("verified payload vanished from {}", outcome.ready_path.display()),
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ));
            }
        }

        phases.advance(InstallPhase::Publishing);
        let bin_dir = self.settings.bin_dir_for(store.root());
        let record = publish::publish(
            store.root(),
            &bin_dir,
            artifact,
            &manifest.release_version,
            &outcomes,
            cancel,
        )?;
        let previous = match store.record(record.clone(), cancel) {
            Ok(previous) => previous,
            Err(err) => {
                publish::retire(&record.install_path);
                return Err(err);
            }
        };
        if let Some(previous) = &previous {
            if previous.install_path != record.install_path {
                publish::retire(&previous.install_path);
            }
        }
        let linked = publish::ensure_links(&record, &artifact.entrypoints)?;
        phases.advance(InstallPhase::Done);

        let status = match &previous {
            None => InstallStatus::Installed,
            Some(previous) if previous.digest == record.digest => InstallStatus::Reinstalled,
            Some(_) => InstallStatus::Upgraded,
        };
        info!(
            component = %record.component,
            variant = %record.variant,
            version = %record.release_version,
            path = %record.install_path.display(),
            ?status,
            "install complete"
        );
        Ok(InstallOutcome {
            status,
            component: record.component,
            variant: record.variant,
            version: record.release_version,
            digest: record.digest,
            device: record.device,
            installed_path: record.install_path,
            device_decision: selection.device,
            variant_decision: selection.variant,
            warnings: selection.warnings,
            bytes_downloaded,
            linked,
            phases: Vec::new(),
        })
    }

    /// Verifies every recorded install against its published directory.
    pub fn check(&self, dest: Option<&Path>) -> Result<CheckReport> {
        let root = self.root(dest);
        let store = InstallStore::open(root)?;
        let components: Vec<ComponentCheck> = store.list()?.into_iter().map(check_record).collect();
        Ok(CheckReport {
            root: root.to_path_buf(),
            ok: components.iter().all(|check| check.ok),
            components,
        })
    }

    pub fn list(&self, dest: Option<&Path>) -> Result<Vec<InstallRecord>> {
        InstallStore::open(self.root(dest))?.list()
    }

    pub fn repair(&self, dest: Option<&Path>, cancel: &CancelToken) -> Result<RepairReport> {
        InstallStore::open(self.root(dest))?.repair(cancel)
    }
}

/// The stored record for the selection when it is current and its published
/// directory is still present.
fn current_install(store: &InstallStore, selection: &Selection) -> Result<Option<InstallRecord>> {
    let artifact = &selection.artifact;
    Ok(store
        .get(artifact.component, &artifact.variant)?
        .filter(|record| record.digest == artifact.digest)
        .filter(|record| record.install_path.join(MARKER_FILE).is_file()))
}

fn check_record(record: InstallRecord) -> ComponentCheck {
    let detail = if !record.install_path.is_dir() {
        Some("install directory missing".to_string())
    } else {
        match fs::read(record.install_path.join(MARKER_FILE))
            .ok()
            .and_then(|raw| serde_json::from_slice::<InstallRecord>(&raw).ok())
        {
            None => Some("install marker missing or unreadable".to_string()),
            Some(marker) if marker.digest != record.digest => Some(format!(
                "marker digest {} does not match recorded {}",
                marker.digest, record.digest
            )),
            Some(_) => publish::broken_links(&record)
                .first()
                .map(|link| format!("entrypoint link {} is missing or stale", link.display())),
        }
    };
    ComponentCheck {
        component: record.component,
        variant: record.variant,
        version: record.release_version,
        device: record.device,
        path: record.install_path,
        ok: detail.is_none(),
        detail,
    }
}
