//! Advisory file locks for cross-process read-modify-write cycles.
//!
//! Data files (the graph, the merge queue) are replaced by rename on every
//! write, so the lock lives on a sidecar `<file>.lock` that is never renamed.
//! Locks are cooperative: every writer must go through [`FileLock`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use relay_types::{RelayError, Result};

use crate::retry::LockPolicy;

/// An exclusive advisory lock, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Sidecar lock path for a data file: `graph.dot` -> `graph.dot.lock`.
    pub fn path_for(data_path: &Path) -> PathBuf {
        let mut name = data_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        data_path.with_file_name(name)
    }

    /// Acquire the lock at `lock_path`, trying up to `policy.attempts` times.
    pub fn acquire(lock_path: &Path, policy: &LockPolicy) -> Result<Self> {
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let attempts = policy.attempts.max(1);
        for attempt in 0..attempts {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!(path = %lock_path.display(), attempt, "Lock acquired");
                    return Ok(Self {
                        file,
                        path: lock_path.to_path_buf(),
                    });
                }
                Err(e) if is_contended(&e) => {
                    if attempt + 1 < attempts {
                        let delay = policy.backoff.delay_for_attempt(attempt);
                        tracing::debug!(
                            path = %lock_path.display(),
                            attempt,
                            delay_ms = %delay.as_millis(),
                            "Lock busy, backing off"
                        );
                        std::thread::sleep(delay);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(path = %lock_path.display(), attempts, "Lock contention");
        Err(RelayError::LockContention {
            path: lock_path.display().to_string(),
            attempts,
        })
    }

    /// Lock the sidecar of `data_path`.
    pub fn acquire_for(data_path: &Path, policy: &LockPolicy) -> Result<Self> {
        Self::acquire(&Self::path_for(data_path), policy)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
