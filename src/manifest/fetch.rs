use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use super::model::Manifest;
use crate::cancel::CancelToken;
use crate::core::retry::RetryPolicy;
use crate::error::{InstallError, IoContext, Result};
use crate::transport::{Transport, TransportError};

const MAX_MANIFEST_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    Remote(String),
    Local(PathBuf),
}

impl ManifestSource {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("file://") {
            return ManifestSource::Local(PathBuf::from(path));
        }
        let lower = raw.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ManifestSource::Remote(raw.to_string())
        } else {
            ManifestSource::Local(PathBuf::from(raw))
        }
    }

    #[must_use]
    pub fn requires_network(&self) -> bool {
        matches!(self, ManifestSource::Remote(_))
    }
}

pub struct ManifestFetcher<'a> {
    transport: &'a dyn Transport,
    retry: RetryPolicy,
}

impl<'a> ManifestFetcher<'a> {
    pub fn new(transport: &'a dyn Transport, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    pub fn fetch(&self, source: &str, offline: bool, cancel: &CancelToken) -> Result<Manifest> {
        self.fetch_document(source, offline, cancel)
            .map(|(manifest, _)| manifest)
    }

    /// Like [`fetch`](Self::fetch), also returning the document bytes.
    pub fn fetch_document(
        &self,
        source: &str,
        offline: bool,
        cancel: &CancelToken,
    ) -> Result<(Manifest, Vec<u8>)> {
        cancel.check()?;
        let source = ManifestSource::parse(source);
        let bytes = match &source {
            ManifestSource::Remote(url) if offline => {
                return Err(InstallError::OfflineRequired {
                    source_url: url.clone(),
                });
            }
            ManifestSource::Remote(url) => self.fetch_remote(url, cancel)?,
            ManifestSource::Local(path) => read_local(path)?,
        };
        let manifest = Manifest::parse(&bytes)?;

        for key in manifest.duplicate_keys() {
            warn!(%key, "manifest lists the same artifact key more than once");
        }
        info!(
            release = %manifest.release_version,
            artifacts = manifest.artifacts.len(),
            "manifest resolved"
        );
        Ok((manifest, bytes))
    }

    fn fetch_remote(&self, url: &str, cancel: &CancelToken) -> Result<Vec<u8>> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            cancel.check()?;
            let failure = match self.transport.get(url, None) {
                Ok(response) => {
                    let mut bytes = Vec::new();
                    match response.body.take(MAX_MANIFEST_BYTES).read_to_end(&mut bytes) {
                        Ok(_) => return Ok(bytes),
                        Err(err) => TransportError::Transient(err.to_string()),
                    }
                }
                Err(err) => err,
            };

            if !failure.is_retryable() {
                return Err(match failure {
                    TransportError::Status(status) => InstallError::Http {
                        url: url.to_string(),
                        status,
                    },
                    TransportError::Transient(message) => InstallError::Network {
                        url: url.to_string(),
                        attempts: attempt,
                        message,
                    },
                });
            }
            if attempt >= attempts {
                return Err(InstallError::Network {
                    url: url.to_string(),
                    attempts: attempt,
                    message: failure.to_string(),
                });
            }
            let delay = self.retry.delay_after(attempt);
            debug!(url, attempt, ?delay, error = %failure, "retrying manifest fetch");
            cancel.sleep(delay)?;
        }
    }
}

fn read_local(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).io_context(|| format!("read manifest {}", path.display()))
}
