use std::{path::Path, thread};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::download::{DownloadOutcome, Downloader};
use crate::cancel::CancelToken;
use crate::core::retry::RetryPolicy;
use crate::error::{InstallError, Result};
use crate::manifest::Payload;
use crate::transport::Transport;

/// Runs the payloads of one logical install on a bounded set of workers.
pub struct TransferPool<'a> {
    transport: &'a dyn Transport,
    retry: RetryPolicy,
    workers: usize,
}

impl<'a> TransferPool<'a> {
    pub fn new(transport: &'a dyn Transport, retry: RetryPolicy, workers: usize) -> Self {
        Self {
            transport,
            retry,
            workers: workers.max(1),
        }
    }

    /// Downloads every payload into `staging_dir`, returning outcomes in input
    /// order. The first failure cancels the remaining transfers; the caller's
    /// token is left untouched.
    pub fn fetch_all(
        &self,
        payloads: &[Payload],
        staging_dir: &Path,
        cancel: &CancelToken,
        progress: &(dyn Fn(u64, u64) + Sync),
    ) -> Result<Vec<DownloadOutcome>> {
        let total: u64 = payloads.iter().map(|payload| payload.size_bytes).sum();
        let seen = Mutex::new(vec![0u64; payloads.len()]);
        let batch = cancel.child();

        let (job_tx, job_rx) = unbounded::<(usize, &Payload)>();
        for job in payloads.iter().enumerate() {
            let _ = job_tx.send(job);
        }
        drop(job_tx);
        let (done_tx, done_rx) = unbounded::<(usize, Result<DownloadOutcome>)>();

        let workers = self.workers.min(payloads.len()).max(1);
        debug!(payloads = payloads.len(), workers, "starting transfers");
        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let batch = &batch;
                let seen = &seen;
                scope.spawn(move || {
                    let downloader = Downloader::new(self.transport, self.retry);
                    for (index, payload) in job_rx.iter() {
                        if batch.is_cancelled() {
                            let _ = done_tx.send((index, Err(InstallError::Cancelled)));
                            continue;
                        }
                        let result = downloader.fetch_artifact_with_progress(
                            payload,
                            staging_dir,
                            batch,
                            &mut |bytes| {
                                let done: u64 = {
                                    let mut seen = seen.lock();
                                    seen[index] = bytes;
                                    seen.iter().sum()
                                };
                                progress(done, total);
                            },
                        );
                        if let Err(err) = &result {
                            if !matches!(err, InstallError::Cancelled) {
                                warn!(url = %payload.url, error = %err, "transfer failed, stopping siblings");
                            }
                            batch.cancel();
                        }
                        let _ = done_tx.send((index, result));
                    }
                });
            }
        });
        drop(done_tx);

        let mut outcomes: Vec<Option<DownloadOutcome>> = payloads.iter().map(|_| None).collect();
        let mut failure: Option<InstallError> = None;
        for (index, result) in done_rx.iter() {
            match result {
                Ok(outcome) => outcomes[index] = Some(outcome),
                Err(err) => {
                    let replace = match &failure {
                        None => true,
                        Some(InstallError::Cancelled) => !matches!(err, InstallError::Cancelled),
                        Some(_) => false,
                    };
                    if replace {
                        failure = Some(err);
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        if let Some(err) = failure {
            return Err(err);
        }
        outcomes
            .into_iter()
            .map(|outcome| outcome.ok_or(InstallError::Cancelled))
            .collect()
    }
}

/// Completed fraction in `[0, 1]`; zero when the total is unknown.
#[must_use]
pub fn progress_fraction(downloaded: u64, expected: u64) -> f32 {
    if expected > 0 {
        return ((downloaded as f64 / expected as f64).clamp(0.0, 1.0)) as f32;
    }
    0.0
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::install::metadata::digest_of;
    use crate::manifest::Unpack;
    use crate::transport::{testing::MemoryTransport, TransportError, TransportResponse};

    fn payload(name: &str, url: &str, body: &[u8]) -> Payload {
        Payload {
            name: name.into(),
            url: url.into(),
            size_bytes: body.len() as u64,
            digest: digest_of(body),
            unpack: Unpack::File,
        }
    }

    struct CountingTransport {
        inner: MemoryTransport,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Transport for CountingTransport {
        fn get(
            &self,
            url: &str,
            range_from: Option<u64>,
        ) -> std::result::Result<TransportResponse, TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(40));
            let response = self.inner.get(url, range_from);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            response
        }
    }

    #[test]
    fn concurrency_is_bounded_and_order_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let inner = MemoryTransport::new();
        let payloads: Vec<Payload> = (0..6)
            .map(|i| {
                let url = format!("https://cdn.example/part{i}.bin");
                let body = vec![i as u8; 1000 + i];
                inner.serve(&url, body.clone());
                payload(&format!("part{i}"), &url, &body)
            })
            .collect();
        let transport = CountingTransport {
            inner,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };

        let pool = TransferPool::new(&transport, RetryPolicy::immediate(1), 2);
        let outcomes = pool
            .fetch_all(&payloads, dir.path(), &CancelToken::new(), &|_, _| {})
            .unwrap();
        assert_eq!(outcomes.len(), 6);
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
        for (i, outcome) in outcomes.iter().enumerate() {
            let bytes = fs::read(outcome.ready_path.join(format!("part{i}.bin"))).unwrap();
            assert_eq!(bytes.len(), 1000 + i);
        }
    }

    #[test]
    fn first_failure_is_reported_without_cancelling_caller() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        transport.serve("https://cdn.example/good.bin", b"good".to_vec());
        transport.serve("https://cdn.example/bad.bin", b"tampered".to_vec());
        let payloads = vec![
            payload("good", "https://cdn.example/good.bin", b"good"),
            payload("bad", "https://cdn.example/bad.bin", b"original"),
        ];

        let pool = TransferPool::new(&transport, RetryPolicy::immediate(1), 1);
        let cancel = CancelToken::new();
        let err = pool
            .fetch_all(&payloads, dir.path(), &cancel, &|_, _| {})
            .unwrap_err();
        assert!(matches!(err, InstallError::IntegrityCheckFailed { .. }));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn failure_stops_queued_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        transport.serve("https://cdn.example/c.bin", b"c".to_vec());
        let payloads = vec![
            payload("a", "https://cdn.example/missing.bin", b"a"),
            payload("c", "https://cdn.example/c.bin", b"c"),
        ];

        let pool = TransferPool::new(&transport, RetryPolicy::immediate(1), 1);
        let err = pool
            .fetch_all(&payloads, dir.path(), &CancelToken::new(), &|_, _| {})
            .unwrap_err();
        assert!(matches!(err, InstallError::Http { status: 404, .. }));
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn progress_reports_aggregate_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        transport.serve("https://cdn.example/a.bin", vec![1u8; 300]);
        transport.serve("https://cdn.example/b.bin", vec![2u8; 700]);
        let payloads = vec![
            payload("a", "https://cdn.example/a.bin", &[1u8; 300]),
            payload("b", "https://cdn.example/b.bin", &[2u8; 700]),
        ];
        let last = Mutex::new((0u64, 0u64));
        let pool = TransferPool::new(&transport, RetryPolicy::immediate(1), 2);
        pool.fetch_all(&payloads, dir.path(), &CancelToken::new(), &|done, total| {
            let mut last = last.lock();
            if done >= last.0 {
                *last = (done, total);
            }
        })
        .unwrap();
        assert_eq!(*last.lock(), (1000, 1000));
    }

    #[test]
    fn fraction_is_clamped() {
        assert_eq!(progress_fraction(50, 100), 0.5);
        assert_eq!(progress_fraction(150, 100), 1.0);
        assert_eq!(progress_fraction(10, 0), 0.0);
    }
}
