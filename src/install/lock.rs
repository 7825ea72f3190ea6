use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{InstallError, IoContext, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const UNPARSED_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockOwner {
    pid: u32,
    #[serde(with = "time::serde::rfc3339")]
    acquired_at: OffsetDateTime,
    /// Distinguishes guards within one process and across reclaims.
    #[serde(default)]
    token: String,
}

/// Exclusive, cross-process lock backed by a file created with `create_new`.
/// The file is removed when the guard is dropped, provided it still names
/// this guard as owner.
#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
    token: String,
}

impl InstallLock {
    pub fn acquire(path: &Path, wait: Duration, cancel: &CancelToken) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("create lock directory {}", parent.display()))?;
        }

        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut announced = false;
        loop {
            cancel.check()?;
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let owner = LockOwner {
                        pid: std::process::id(),
                        acquired_at: OffsetDateTime::now_utc(),
                        token: uuid::Uuid::new_v4().simple().to_string(),
                    };
                    let body = serde_json::to_vec(&owner)
                        .map_err(|err| InstallError::io("encode lock owner", err.into()))?;
                    if let Err(err) = file.write_all(&body) {
                        let _ = fs::remove_file(path);
                        return Err(InstallError::io(
                            format!("write lock {}", path.display()),
                            err,
                        ));
                    }
                    debug!(lock = %path.display(), "lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token: owner.token,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if reclaim_if_stale(path) {
                        continue;
                    }
                }
                Err(err) => {
                    return Err(InstallError::io(
                        format!("create lock {}", path.display()),
                        err,
                    ))
                }
            }

            if started.elapsed() >= wait {
                return Err(InstallError::LockTimeout {
                    path: path.to_path_buf(),
                });
            }
            if !announced {
                info!(lock = %path.display(), "waiting for another install to finish");
                announced = true;
            }
            let remaining = wait.saturating_sub(started.elapsed());
            cancel.sleep(backoff.min(remaining))?;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let owner = fs::read(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<LockOwner>(&raw).ok());
        match owner {
            Some(owner) if owner.token == self.token => {
                if let Err(err) = fs::remove_file(&self.path) {
                    if err.kind() != ErrorKind::NotFound {
                        warn!(lock = %self.path.display(), "failed to release lock: {err}");
                    }
                }
            }
            Some(_) => warn!(lock = %self.path.display(), "lock was taken over; leaving it"),
            None => {}
        }
    }
}

/// Removes a lock whose owner process no longer exists. A lock file that
/// cannot be parsed is only reclaimed once it is older than
/// `UNPARSED_GRACE`, since its writer may still be mid-write.
fn reclaim_if_stale(path: &Path) -> bool {
    let Ok(raw) = fs::read(path) else {
        return false;
    };
    let Ok(owner) = serde_json::from_slice::<LockOwner>(&raw) else {
        let old = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age >= UNPARSED_GRACE);
        if old {
            warn!(lock = %path.display(), "reclaiming unreadable lock");
            return take_over(path, &raw);
        }
        return false;
    };
    if owner.pid == std::process::id() || process_alive(owner.pid) {
        return false;
    }
    warn!(
        lock = %path.display(),
        pid = owner.pid,
        since = %owner.acquired_at,
        "reclaiming lock left by a process that is gone"
    );
    take_over(path, &raw)
}

/// Removes the lock only if it still holds the bytes judged stale. The check
/// and removal run under a `.reclaim` guard created with `create_new`, so two
/// reclaimers can never both remove a lock, and a live installer's fresh lock
/// is left alone. Returns `true` when the caller should retry creating the
/// lock right away.
fn take_over(path: &Path, judged: &[u8]) -> bool {
    let guard = path.with_extension("reclaim");
    match OpenOptions::new().write(true).create_new(true).open(&guard) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let abandoned = fs::metadata(&guard)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= UNPARSED_GRACE);
            if abandoned {
                warn!(guard = %guard.display(), "removing abandoned reclaim guard");
                let _ = fs::remove_file(&guard);
            }
            return false;
        }
        Err(err) => {
            warn!(lock = %path.display(), "failed to create reclaim guard: {err}");
            return false;
        }
    }

    let reclaimed = match fs::read(path) {
        Ok(current) if current == judged => fs::remove_file(path).is_ok(),
        Ok(_) => {
            debug!(lock = %path.display(), "lock changed hands while reclaiming");
            false
        }
        Err(_) => true,
    };
    let _ = fs::remove_file(&guard);
    reclaimed
}

fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}
