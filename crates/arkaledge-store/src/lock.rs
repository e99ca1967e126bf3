//! Advisory file lock guarding the kanban state file.
//!
//! The lock is a sidecar file created with `O_CREAT | O_EXCL`: when two
//! processes race, exactly one wins the create. The holder's PID is
//! recorded in the file so a lock left behind by a crashed process can be
//! reclaimed once the PID is dead.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How many times acquisition is attempted before giving up.
pub const LOCK_ATTEMPTS: u32 = 5;

/// Minimum spacing between acquisition attempts.
pub const LOCK_RETRY_SPACING: Duration = Duration::from_millis(100);

/// Errors that can occur while acquiring the lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live holder kept the lock through the whole retry budget.
    #[error("failed to acquire lock {path} after {attempts} attempts (held by pid {holder_pid:?})")]
    Exhausted {
        path: PathBuf,
        attempts: u32,
        holder_pid: Option<u32>,
    },

    /// Filesystem error while creating or inspecting the lock file.
    #[error("lock I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Record written into the lock file so other processes can identify the
/// holder.
#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// An acquired advisory lock. Released (file removed) on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock at `path`, retrying up to [`LOCK_ATTEMPTS`] times
    /// with [`LOCK_RETRY_SPACING`] between attempts.
    ///
    /// A lock file whose recorded PID is no longer alive is treated as
    /// stale: it is removed and the attempt is retried immediately.
    pub async fn acquire(path: &Path) -> Result<Self, LockError> {
        let mut last_holder_pid = None;

        for attempt in 0..LOCK_ATTEMPTS {
            match Self::try_create(path) {
                Ok(()) => return Ok(Self { path: path.to_path_buf() }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match read_holder(path) {
                        Some(holder) if pid_alive(holder.pid) => {
                            last_holder_pid = Some(holder.pid);
                        }
                        _ => {
                            // Stale or unreadable holder record. Reclaim and
                            // retry without burning the spacing delay.
                            tracing::warn!(path = %path.display(), "removing stale kanban lock");
                            let _ = std::fs::remove_file(path);
                            continue;
                        }
                    }
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }

            if attempt + 1 < LOCK_ATTEMPTS {
                tokio::time::sleep(LOCK_RETRY_SPACING).await;
            }
        }

        Err(LockError::Exhausted {
            path: path.to_path_buf(),
            attempts: LOCK_ATTEMPTS,
            holder_pid: last_holder_pid,
        })
    }

    /// One atomic create attempt.
    fn try_create(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string(&holder)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Check whether a process with the given PID is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without signalling.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Without a portable liveness probe, assume the holder is alive so we
    // never reclaim a lock that is actually held.
    true
}
