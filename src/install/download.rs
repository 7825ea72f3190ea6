use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use super::{archive, metadata::StreamHasher};
use crate::cancel::CancelToken;
use crate::core::retry::RetryPolicy;
use crate::error::{InstallError, IoContext, Result};
use crate::manifest::{Payload, Unpack};
use crate::transport::{Transport, TransportError};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub struct DownloadOutcome {
    /// Verified content: a directory holding the file, or the unpacked tree.
    pub ready_path: PathBuf,
    pub bytes_downloaded: u64,
    pub resumed: bool,
}

pub struct Downloader<'a> {
    transport: &'a dyn Transport,
    retry: RetryPolicy,
}

enum AttemptError {
    Retryable(String),
    Fatal(InstallError),
}

impl From<InstallError> for AttemptError {
    fn from(value: InstallError) -> Self {
        AttemptError::Fatal(value)
    }
}

impl<'a> Downloader<'a> {
    pub fn new(transport: &'a dyn Transport, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    pub fn fetch_artifact(
        &self,
        payload: &Payload,
        staging_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<DownloadOutcome> {
        self.fetch_artifact_with_progress(payload, staging_dir, cancel, &mut |_| {})
    }

    /// Downloads `payload` into `staging_dir`, verifies it and, for archives,
    /// unpacks it. Nothing outside `staging_dir` is touched. On any error the
    /// partial download and the unpack directory are removed.
    pub fn fetch_artifact_with_progress(
        &self,
        payload: &Payload,
        staging_dir: &Path,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(u64),
    ) -> Result<DownloadOutcome> {
        fs::create_dir_all(staging_dir)
            .io_context(|| format!("create staging directory {}", staging_dir.display()))?;
        let part = part_path(payload, staging_dir);
        let ready = ready_path(payload, staging_dir);

        let result = self
            .download_with_retries(payload, &part, cancel, progress)
            .and_then(|(bytes_downloaded, resumed)| {
                cancel.check()?;
                finalize(payload, &part, &ready, cancel)?;
                Ok(DownloadOutcome {
                    ready_path: ready.clone(),
                    bytes_downloaded,
                    resumed,
                })
            });

        if result.is_err() {
            let _ = fs::remove_file(&part);
            let _ = fs::remove_dir_all(&ready);
        }
        result
    }

    fn download_with_retries(
        &self,
        payload: &Payload,
        part: &Path,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(u64),
    ) -> Result<(u64, bool)> {
        let attempts = self.retry.attempts.max(1);
        let mut bytes_downloaded = 0u64;
        let mut resumed = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            cancel.check()?;
            match self.attempt(payload, part, cancel, progress, &mut bytes_downloaded) {
                Ok(step) => {
                    resumed |= step.resumed;
                    verify(payload, part, step.hasher)?;
                    return Ok((bytes_downloaded, resumed));
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Retryable(message)) => {
                    if attempt >= attempts {
                        return Err(InstallError::Network {
                            url: payload.url.clone(),
                            attempts: attempt,
                            message,
                        });
                    }
                    let delay = self.retry.delay_after(attempt);
                    warn!(url = %payload.url, attempt, ?delay, error = %message, "download interrupted, retrying");
                    cancel.sleep(delay)?;
                }
            }
        }
    }

    fn attempt(
        &self,
        payload: &Payload,
        part: &Path,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(u64),
        fetched: &mut u64,
    ) -> std::result::Result<Step, AttemptError> {
        let mut existing = fs::metadata(part).map(|meta| meta.len()).unwrap_or(0);
        if payload.size_bytes > 0 && existing >= payload.size_bytes {
            existing = 0;
        }
        let range_from = (existing > 0).then_some(existing);

        let response = match self.transport.get(&payload.url, range_from) {
            Ok(response) => response,
            Err(TransportError::Status(416)) if range_from.is_some() => {
                let _ = fs::remove_file(part);
                return Err(AttemptError::Retryable("range not satisfiable".into()));
            }
            Err(err) if err.is_retryable() => return Err(AttemptError::Retryable(err.to_string())),
            Err(TransportError::Status(status)) => {
                return Err(AttemptError::Fatal(InstallError::Http {
                    url: payload.url.clone(),
                    status,
                }))
            }
            Err(TransportError::Transient(message)) => return Err(AttemptError::Retryable(message)),
        };

        let resumed = range_from.is_some() && response.partial;
        let start = if resumed { existing } else { 0 };
        if let Some(announced) = response.content_length {
            if payload.size_bytes > 0 && start + announced != payload.size_bytes {
                let _ = fs::remove_file(part);
                return Err(AttemptError::Fatal(InstallError::IntegrityCheckFailed {
                    url: payload.url.clone(),
                    expected: format!("{} bytes", payload.size_bytes),
                    actual: format!("{} bytes announced", start + announced),
                }));
            }
        }

        let mut hasher = StreamHasher::new();
        let mut file = if resumed {
            hasher.update_from_file(part)?;
            debug!(url = %payload.url, offset = existing, "resuming download");
            OpenOptions::new()
                .append(true)
                .open(part)
                .io_context(|| format!("open {}", part.display()))?
        } else {
            File::create(part).io_context(|| format!("create {}", part.display()))?
        };

        let mut body = response.body;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            cancel.check()?;
            let read = match body.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    file.flush().ok();
                    return Err(AttemptError::Retryable(err.to_string()));
                }
            };
            file.write_all(&buffer[..read])
                .io_context(|| format!("write {}", part.display()))?;
            hasher.update(&buffer[..read]);
            *fetched += read as u64;
            progress(hasher.bytes());
        }
        file.sync_all()
            .io_context(|| format!("sync {}", part.display()))?;

        Ok(Step { hasher, resumed })
    }
}

struct Step {
    hasher: StreamHasher,
    resumed: bool,
}

fn verify(payload: &Payload, part: &Path, hasher: StreamHasher) -> Result<()> {
    let total = hasher.bytes();
    let actual = hasher.finish();
    if payload.size_bytes > 0 && total != payload.size_bytes {
        let _ = fs::remove_file(part);
        return Err(InstallError::IntegrityCheckFailed {
            url: payload.url.clone(),
            expected: format!("{} bytes", payload.size_bytes),
            actual: format!("{total} bytes"),
        });
    }
    if actual != payload.digest {
        let _ = fs::remove_file(part);
        return Err(InstallError::IntegrityCheckFailed {
            url: payload.url.clone(),
            expected: payload.digest.to_string(),
            actual: actual.to_string(),
        });
    }
    info!(url = %payload.url, digest = %actual, bytes = total, "payload verified");
    Ok(())
}

/// Moves verified bytes into the ready directory, unpacking archives.
fn finalize(payload: &Payload, part: &Path, ready: &Path, cancel: &CancelToken) -> Result<()> {
    if ready.exists() {
        fs::remove_dir_all(ready).io_context(|| format!("clear {}", ready.display()))?;
    }
    match payload.unpack {
        Unpack::File => {
            fs::create_dir_all(ready).io_context(|| format!("create {}", ready.display()))?;
            fs::rename(part, ready.join(payload.file_name()))
                .io_context(|| format!("move verified {}", part.display()))?;
        }
        Unpack::Archive {
            format,
            strip_components,
        } => {
            archive::unpack(part, format, strip_components, ready, cancel)?;
            fs::remove_file(part).io_context(|| format!("remove {}", part.display()))?;
        }
    }
    Ok(())
}

fn label(payload: &Payload) -> &str {
    if payload.name.is_empty() {
        "primary"
    } else {
        &payload.name
    }
}

fn part_path(payload: &Payload, staging_dir: &Path) -> PathBuf {
    staging_dir.join(format!("{}-{}.part", label(payload), payload.digest.hex()))
}

fn ready_path(payload: &Payload, staging_dir: &Path) -> PathBuf {
    staging_dir.join(format!("{}-{}.ready", label(payload), payload.digest.short()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::archive::fixtures;
    use crate::install::metadata::digest_of;
    use crate::manifest::ArchiveFormat;
    use crate::transport::testing::MemoryTransport;

    const URL: &str = "https://cdn.example/stt/model.bin";

    fn payload(url: &str, body: &[u8], unpack: Unpack) -> Payload {
        Payload {
            name: String::new(),
            url: url.into(),
            size_bytes: body.len() as u64,
            digest: digest_of(body),
            unpack,
        }
    }

    fn body() -> Vec<u8> {
        (0..200_000u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn verified_file_lands_in_ready_dir() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let bytes = body();
        transport.serve(URL, bytes.clone());

        let downloader = Downloader::new(&transport, RetryPolicy::immediate(3));
        let outcome = downloader
            .fetch_artifact(&payload(URL, &bytes, Unpack::File), dir.path(), &CancelToken::new())
            .unwrap();
        assert_eq!(fs::read(outcome.ready_path.join("model.bin")).unwrap(), bytes);
        assert_eq!(outcome.bytes_downloaded, bytes.len() as u64);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn one_corrupted_byte_fails_integrity_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let bytes = body();
        let mut corrupted = bytes.clone();
        corrupted[1234] ^= 0xff;
        transport.serve(URL, corrupted);

        let downloader = Downloader::new(&transport, RetryPolicy::immediate(3));
        let err = downloader
            .fetch_artifact(&payload(URL, &bytes, Unpack::File), dir.path(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, InstallError::IntegrityCheckFailed { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn truncated_body_is_an_integrity_failure() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let bytes = body();
        transport.serve(URL, bytes[..1000].to_vec());

        let downloader = Downloader::new(&transport, RetryPolicy::immediate(1));
        let err = downloader
            .fetch_artifact(&payload(URL, &bytes, Unpack::File), dir.path(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, InstallError::IntegrityCheckFailed { .. }));
    }

    #[test]
    fn announced_length_mismatch_fails_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let bytes = body();
        let mut longer = bytes.clone();
        longer.extend_from_slice(b"trailing");
        transport.serve(URL, longer);

        let mut written = 0u64;
        let downloader = Downloader::new(&transport, RetryPolicy::immediate(3));
        let err = downloader
            .fetch_artifact_with_progress(
                &payload(URL, &bytes, Unpack::File),
                dir.path(),
                &CancelToken::new(),
                &mut |bytes| written = bytes,
            )
            .unwrap_err();
        assert!(matches!(err, InstallError::IntegrityCheckFailed { .. }));
        assert_eq!(written, 0);
        assert_eq!(transport.request_count(), 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn interrupted_download_resumes_with_range() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let bytes = body();
        transport.serve(URL, bytes.clone());
        transport.with_ranges(URL);
        transport.cut_next_after(URL, 70_000);

        let downloader = Downloader::new(&transport, RetryPolicy::immediate(3));
        let outcome = downloader
            .fetch_artifact(&payload(URL, &bytes, Unpack::File), dir.path(), &CancelToken::new())
            .unwrap();
        assert!(outcome.resumed);
        assert_eq!(fs::read(outcome.ready_path.join("model.bin")).unwrap(), bytes);
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].1, None);
        assert_eq!(requests[1].1, Some(70_000));
        assert_eq!(outcome.bytes_downloaded, bytes.len() as u64);
    }

    #[test]
    fn server_without_ranges_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let bytes = body();
        transport.serve(URL, bytes.clone());
        transport.cut_next_after(URL, 50_000);

        let downloader = Downloader::new(&transport, RetryPolicy::immediate(3));
        let outcome = downloader
            .fetch_artifact(&payload(URL, &bytes, Unpack::File), dir.path(), &CancelToken::new())
            .unwrap();
        assert!(!outcome.resumed);
        assert_eq!(fs::read(outcome.ready_path.join("model.bin")).unwrap(), bytes);
    }

    #[test]
    fn leftover_partial_from_crashed_run_is_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let bytes = body();
        transport.serve(URL, bytes.clone());
        transport.with_ranges(URL);

        let payload = payload(URL, &bytes, Unpack::File);
        fs::write(part_path(&payload, dir.path()), &bytes[..12_345]).unwrap();

        let downloader = Downloader::new(&transport, RetryPolicy::immediate(1));
        let outcome = downloader
            .fetch_artifact(&payload, dir.path(), &CancelToken::new())
            .unwrap();
        assert!(outcome.resumed);
        assert_eq!(outcome.bytes_downloaded, (bytes.len() - 12_345) as u64);
        assert_eq!(transport.requests()[0].1, Some(12_345));
    }

    #[test]
    fn archives_are_unpacked_only_after_verification() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let url = "https://cdn.example/tts/voice.tar.gz";
        let archive = fixtures::tar_gz(&[("voice/F1.onnx", b"voice weights")]);
        transport.serve(url, archive.clone());

        let unpack = Unpack::Archive {
            format: ArchiveFormat::TarGz,
            strip_components: 1,
        };
        let downloader = Downloader::new(&transport, RetryPolicy::immediate(1));
        let outcome = downloader
            .fetch_artifact(&payload(url, &archive, unpack), dir.path(), &CancelToken::new())
            .unwrap();
        assert_eq!(
            fs::read(outcome.ready_path.join("F1.onnx")).unwrap(),
            b"voice weights"
        );

        let mut tampered = archive.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        transport.serve(url, tampered);
        let staging = dir.path().join("second");
        let err = downloader
            .fetch_artifact(&payload(url, &archive, unpack), &staging, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, InstallError::IntegrityCheckFailed { .. }));
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn unsafe_archive_is_rejected_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let url = "https://cdn.example/tts/evil.tar.gz";
        let archive = fixtures::tar_gz(&[("../../escape", b"x")]);
        transport.serve(url, archive.clone());

        let unpack = Unpack::Archive {
            format: ArchiveFormat::TarGz,
            strip_components: 0,
        };
        let downloader = Downloader::new(&transport, RetryPolicy::immediate(1));
        let err = downloader
            .fetch_artifact(&payload(url, &archive, unpack), dir.path(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, InstallError::UnsafeArchiveEntry { .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn cancellation_deletes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let bytes = body();
        transport.serve(URL, bytes.clone());

        let cancel = CancelToken::new();
        let downloader = Downloader::new(&transport, RetryPolicy::immediate(3));
        let trigger = cancel.clone();
        let err = downloader
            .fetch_artifact_with_progress(
                &payload(URL, &bytes, Unpack::File),
                dir.path(),
                &cancel,
                &mut |done| {
                    if done > 100_000 {
                        trigger.cancel();
                    }
                },
            )
            .unwrap_err();
        assert!(matches!(err, InstallError::Cancelled));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn not_found_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let bytes = body();
        let downloader = Downloader::new(&transport, RetryPolicy::immediate(3));
        let err = downloader
            .fetch_artifact(&payload(URL, &bytes, Unpack::File), dir.path(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, InstallError::Http { status: 404, .. }));
        assert_eq!(transport.request_count(), 1);
    }
}
