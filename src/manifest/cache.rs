use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::model::Manifest;
use crate::error::{InstallError, Result};
use crate::install::store::write_atomic;

pub const CACHE_FILE: &str = "manifest-cache.json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedManifest {
    source: String,
    #[serde(with = "time::serde::rfc3339")]
    fetched_at: OffsetDateTime,
    document: serde_json::Value,
}

/// Last remote manifest seen under an install root. Only ever used to
/// confirm that an install is current; anything that needs a download
/// resolves a fresh manifest first.
///
/// Entries older than the caller's `max_age` are ignored so a new release is
/// picked up once the cache goes stale.
#[derive(Debug, Clone)]
pub struct ManifestCache {
    path: PathBuf,
}

impl ManifestCache {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(CACHE_FILE),
        }
    }

    /// The cached manifest for `source`, if any. `None` for `max_age` accepts
    /// an entry of any age.
    pub fn load(&self, source: &str, max_age: Option<Duration>) -> Option<Manifest> {
        let raw = fs::read(&self.path).ok()?;
        let cached: CachedManifest = match serde_json::from_slice(&raw) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(cache = %self.path.display(), "ignoring unreadable manifest cache: {err}");
                return None;
            }
        };
        if cached.source != source {
            debug!(cached = %cached.source, requested = source, "manifest cache is for another source");
            return None;
        }
        if let Some(max_age) = max_age {
            let age = OffsetDateTime::now_utc() - cached.fetched_at;
            if age.is_negative() || age >= max_age {
                debug!(source, fetched_at = %cached.fetched_at, "cached manifest is stale");
                return None;
            }
        }
        let bytes = serde_json::to_vec(&cached.document).ok()?;
        match Manifest::parse(&bytes) {
            Ok(manifest) => {
                debug!(source, fetched_at = %cached.fetched_at, "using cached manifest");
                Some(manifest)
            }
            Err(err) => {
                warn!(cache = %self.path.display(), "ignoring cached manifest: {err}");
                None
            }
        }
    }

    pub fn save(&self, source: &str, document: &[u8]) -> Result<()> {
        let document = serde_json::from_slice(document)
            .map_err(|err| InstallError::InvalidManifest(err.to_string()))?;
        let cached = CachedManifest {
            source: source.to_string(),
            fetched_at: OffsetDateTime::now_utc(),
            document,
        };
        let body = serde_json::to_vec(&cached)
            .map_err(|err| InstallError::io("encode manifest cache", err.into()))?;
        write_atomic(&self.path, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::model::fixtures;

    #[test]
    fn cache_is_keyed_by_source() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManifestCache::new(dir.path());
        assert!(cache.load("https://a/m.json", None).is_none());

        let document = fixtures::manifest(
            "2024.06.1",
            vec![fixtures::artifact("stt", "cpu", "", "https://a/stt.bin", b"s")],
        );
        cache.save("https://a/m.json", &document).unwrap();

        let manifest = cache.load("https://a/m.json", None).unwrap();
        assert_eq!(manifest.release_version, "2024.06.1");
        assert!(cache.load("https://b/m.json", None).is_none());
    }

    #[test]
    fn stale_entries_are_skipped_unless_age_is_unbounded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManifestCache::new(dir.path());
        let document = fixtures::manifest(
            "2024.06.1",
            vec![fixtures::artifact("stt", "cpu", "", "https://a/stt.bin", b"s")],
        );
        cache.save("https://a/m.json", &document).unwrap();

        assert!(cache
            .load("https://a/m.json", Some(Duration::from_secs(3600)))
            .is_some());
        assert!(cache.load("https://a/m.json", Some(Duration::ZERO)).is_none());
        assert!(cache.load("https://a/m.json", None).is_some());
    }

    #[test]
    fn unreadable_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CACHE_FILE), b"garbage").unwrap();
        assert!(ManifestCache::new(dir.path())
            .load("https://a/m.json", None)
            .is_none());
    }
}
