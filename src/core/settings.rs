use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use crate::error::{InstallError, Result};

pub const ENV_MODELS_DIR: &str = "SPEECH_MODELS_DIR";
pub const ENV_BIN_DIR: &str = "SPEECH_BIN_DIR";
pub const ENV_MANIFEST_URL: &str = "SPEECH_MANIFEST_URL";

pub const DEFAULT_MANIFEST_URL: &str =
    "https://github.com/speechctl/speech-assets/releases/latest/download/speech-manifest.json";

const CONFIG_FILE: &str = "config.json";
const DEFAULT_PARALLEL_TRANSFERS: usize = 3;
const DEFAULT_MANIFEST_CACHE_TTL_SECS: u64 = 300;

/// Optional overrides read from `config.json` in the user config directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct FileSettings {
    pub models_dir: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
    pub manifest_url: Option<String>,
    pub retry_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub max_parallel_transfers: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub lock_wait_secs: Option<u64>,
    pub manifest_cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub models_dir: PathBuf,
    /// Explicit binaries directory; `<root>/bin` when unset.
    pub bin_dir: Option<PathBuf>,
    pub manifest_url: String,
    pub retry: RetryPolicy,
    pub max_parallel_transfers: usize,
    pub connect_timeout: Duration,
    pub lock_wait: Duration,
    /// How long a cached manifest may stand in for a fresh fetch. Offline
    /// runs ignore the limit.
    pub manifest_cache_ttl: Duration,
    pub client_version: String,
}

impl Settings {
    /// Resolves defaults, then `config.json`, then the environment.
    pub fn load(client_version: &str) -> Result<Self> {
        let dirs = ProjectDirs::from("dev", "speechctl", "speechctl")
            .ok_or_else(|| InstallError::Config("missing project directories".into()))?;
        let file = load_file_settings(&dirs.config_dir().join(CONFIG_FILE))?;
        Ok(Self::resolve(
            dirs.data_dir().join("speech"),
            file,
            |key| std::env::var(key).ok(),
            client_version,
        ))
    }

    pub fn resolve<F>(
        default_models_dir: PathBuf,
        file: FileSettings,
        env: F,
        client_version: &str,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let models_dir = non_empty(ENV_MODELS_DIR)
            .map(PathBuf::from)
            .or(file.models_dir)
            .unwrap_or(default_models_dir);
        let bin_dir = non_empty(ENV_BIN_DIR).map(PathBuf::from).or(file.bin_dir);
        let manifest_url = non_empty(ENV_MANIFEST_URL)
            .or(file.manifest_url)
            .unwrap_or_else(|| DEFAULT_MANIFEST_URL.to_string());

        let mut retry = RetryPolicy::default();
        if let Some(attempts) = file.retry_attempts {
            retry.attempts = attempts.max(1);
        }
        if let Some(base) = file.retry_base_delay_ms {
            retry.base_delay = Duration::from_millis(base);
        }

        Self {
            models_dir,
            bin_dir,
            manifest_url,
            retry,
            max_parallel_transfers: file
                .max_parallel_transfers
                .unwrap_or(DEFAULT_PARALLEL_TRANSFERS)
                .max(1),
            connect_timeout: Duration::from_secs(file.connect_timeout_secs.unwrap_or(30)),
            lock_wait: Duration::from_secs(file.lock_wait_secs.unwrap_or(600)),
            manifest_cache_ttl: Duration::from_secs(
                file.manifest_cache_ttl_secs
                    .unwrap_or(DEFAULT_MANIFEST_CACHE_TTL_SECS),
            ),
            client_version: client_version.to_string(),
        }
    }

    /// Settings rooted at `root` with no environment or file input.
    pub fn for_root(root: &Path, client_version: &str) -> Self {
        Self::resolve(
            root.to_path_buf(),
            FileSettings::default(),
            |_| None,
            client_version,
        )
    }

    #[must_use]
    pub fn bin_dir_for(&self, root: &Path) -> PathBuf {
        self.bin_dir.clone().unwrap_or_else(|| root.join("bin"))
    }

    #[must_use]
    pub fn user_agent(&self) -> String {
        format!("speechctl/{}", self.client_version)
    }
}

fn load_file_settings(path: &Path) -> Result<FileSettings> {
    if !path.exists() {
        return Ok(FileSettings::default());
    }
    let bytes = fs::read(path)
        .map_err(|err| InstallError::Config(format!("failed reading {path:?}: {err}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| InstallError::Config(format!("{path:?} could not be parsed: {err}")))
}
