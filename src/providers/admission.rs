// ABOUTME: Cross-process admission gate for outbound provider calls.
// ABOUTME: An advisory file lock held by a scoped slot, plus a randomized post-acquire delay.

use rand::Rng;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Cannot open admission lock {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Admission lock task failed: {0}")]
    Join(String),
}

/// Serializes provider calls across every process that shares `path`.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    path: PathBuf,
    jitter: Duration,
}

/// A held admission slot. The lock is released when the slot is dropped,
/// so every exit path of the caller releases it.
#[derive(Debug)]
pub struct AdmissionSlot {
    file: File,
    path: PathBuf,
}

impl AdmissionGate {
    pub fn new(path: impl Into<PathBuf>, jitter: Duration) -> Self {
        Self {
            path: path.into(),
            jitter,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the slot is free, then wait a random delay of up to the
    /// configured jitter before returning it.
    pub async fn acquire(&self) -> Result<AdmissionSlot, AdmissionError> {
        let path = self.path.clone();
        let slot = tokio::task::spawn_blocking(move || lock_exclusive(path))
            .await
            .map_err(|e| AdmissionError::Join(e.to_string()))??;

        let max_ms = self.jitter.as_millis() as u64;
        if max_ms > 0 {
            let delay = {
                let mut rng = rand::rng();
                rng.random_range(0..=max_ms)
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(slot)
    }
}

fn lock_exclusive(path: PathBuf) -> Result<AdmissionSlot, AdmissionError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| AdmissionError::Open {
                path: path.clone(),
                source,
            })?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|source| AdmissionError::Open {
            path: path.clone(),
            source,
        })?;

    flock(&file, true).map_err(|source| AdmissionError::Lock {
        path: path.clone(),
        source,
    })?;
    log::debug!("[Admission] Acquired {}", path.display());
    Ok(AdmissionSlot { file, path })
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, false) {
            log::warn!("[Admission] Failed to unlock {}: {}", self.path.display(), e);
        } else {
            log::debug!("[Admission] Released {}", self.path.display());
        }
    }
}

#[cfg(unix)]
fn flock(file: &File, exclusive: bool) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let op = if exclusive {
        libc::LOCK_EX
    } else {
        libc::LOCK_UN
    };
    loop {
        // SAFETY: the descriptor belongs to `file`, which outlives this call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn flock(_file: &File, _exclusive: bool) -> std::io::Result<()> {
    // TODO: use LockFileEx on Windows; until then the gate only creates the file.
    Ok(())
}
