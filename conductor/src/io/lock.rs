//! Per-stream exclusive locks.
//!
//! A lock is a JSON file named after the stream id, created with
//! create-if-absent semantics so two simultaneous acquisition attempts
//! resolve to exactly one winner. The file names its owning process; a lock
//! whose owner is no longer alive is stale and may be forcibly reclaimed.
//! The namespace directory is a constructor parameter, never ambient state,
//! so tests run against isolated temp directories.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Liveness check for lock owners, fakeable in tests.
pub trait ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool;
}

impl<P: ProcessProbe + ?Sized> ProcessProbe for &P {
    fn is_alive(&self, pid: u32) -> bool {
        (**self).is_alive(pid)
    }
}

/// Probe using signal 0: delivery permission implies existence.
pub struct SignalProbe;

impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Another live loop owns the stream. Never retried; the caller must choose a
/// different stream or wait.
#[derive(Debug)]
pub struct LockBusyError {
    pub stream_id: u32,
    pub owner_pid: u32,
}

impl fmt::Display for LockBusyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream {} is locked by live process {}",
            self.stream_id, self.owner_pid
        )
    }
}

impl std::error::Error for LockBusyError {}

/// Releases the lock file on drop, so every exit path of the loop (normal
/// completion, escalation, cancellation, panic unwind) releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Explicit release, reporting any filesystem error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        fs::remove_file(&self.path).with_context(|| format!("remove lock {}", self.path.display()))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release lock on drop");
        }
    }
}

/// Exclusive-access primitive over a lock-file directory.
pub struct LockManager<P: ProcessProbe> {
    dir: PathBuf,
    probe: P,
}

impl<P: ProcessProbe> LockManager<P> {
    pub fn new(dir: impl Into<PathBuf>, probe: P) -> Self {
        Self {
            dir: dir.into(),
            probe,
        }
    }

    /// Acquire the stream's lock for this process.
    ///
    /// Fails with a downcastable [`LockBusyError`] when a live owner holds
    /// it. A stale lock (dead owner, or unreadable contents) is reclaimed:
    /// removed, then re-created atomically. Losing that race to another
    /// claimant also reports Busy.
    pub fn acquire(&self, stream_id: u32) -> Result<LockGuard> {
        let path = self.lock_path(stream_id);
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create lock dir {}", self.dir.display()))?;

        match self.try_create(&path) {
            Ok(guard) => return Ok(guard),
            Err(err) if !is_already_exists(&err) => return Err(err),
            Err(_) => {}
        }

        match self.read(stream_id)? {
            Some(info) if self.probe.is_alive(info.pid) => {
                debug!(stream_id, owner_pid = info.pid, "lock busy");
                return Err(LockBusyError {
                    stream_id,
                    owner_pid: info.pid,
                }
                .into());
            }
            Some(info) => {
                warn!(stream_id, owner_pid = info.pid, "reclaiming stale lock");
            }
            None => {
                warn!(stream_id, "reclaiming unreadable lock file");
            }
        }

        // Force-reclaim: delete and retry the atomic create exactly once.
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("remove stale lock {}", path.display()));
            }
        }
        self.try_create(&path).map_err(|err| {
            if is_already_exists(&err) {
                let owner_pid = self
                    .read(stream_id)
                    .ok()
                    .flatten()
                    .map(|info| info.pid)
                    .unwrap_or_default();
                LockBusyError {
                    stream_id,
                    owner_pid,
                }
                .into()
            } else {
                err
            }
        })
    }

    /// Remove the lock file if present. Used by operator-level recovery; the
    /// loop itself releases through [`LockGuard`].
    pub fn release(&self, stream_id: u32) -> Result<()> {
        let path = self.lock_path(stream_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove lock {}", path.display())),
        }
    }

    /// Read the lock contents, if a lock file exists.
    ///
    /// An unreadable or unparsable file reads as `None`: it still blocks the
    /// atomic create, but is treated as stale.
    pub fn read(&self, stream_id: u32) -> Result<Option<LockInfo>> {
        let path = self.lock_path(stream_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read lock {}", path.display()));
            }
        };
        match serde_json::from_str(&contents) {
            Ok(info) => Ok(Some(info)),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "unparsable lock file");
                Ok(None)
            }
        }
    }

    /// True when a lock file exists and its owner is not alive.
    pub fn is_stale(&self, stream_id: u32) -> Result<bool> {
        if !self.lock_path(stream_id).exists() {
            return Ok(false);
        }
        match self.read(stream_id)? {
            Some(info) => Ok(!self.probe.is_alive(info.pid)),
            None => Ok(true),
        }
    }

    /// True when a lock file exists and its owner is alive.
    pub fn is_held_by_live_process(&self, stream_id: u32) -> Result<bool> {
        match self.read(stream_id)? {
            Some(info) => Ok(self.probe.is_alive(info.pid)),
            None => Ok(false),
        }
    }

    fn lock_path(&self, stream_id: u32) -> PathBuf {
        self.dir.join(format!("{stream_id}.lock"))
    }

    /// Atomic create-if-absent with full contents: the payload is staged in a
    /// temp file and hard-linked into place, so no reader can ever observe a
    /// half-written lock.
    fn try_create(&self, path: &Path) -> Result<LockGuard> {
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let mut buf = serde_json::to_string_pretty(&info)?;
        buf.push('\n');

        let staged = path.with_extension(format!("staged-{}", info.pid));
        fs::write(&staged, buf)
            .with_context(|| format!("write staged lock {}", staged.display()))?;
        let linked = fs::hard_link(&staged, path);
        if let Err(err) = fs::remove_file(&staged) {
            warn!(path = %staged.display(), err = %err, "failed to remove staged lock");
        }
        linked.with_context(|| format!("create lock {}", path.display()))?;
        debug!(path = %path.display(), pid = info.pid, "lock acquired");
        Ok(LockGuard {
            path: path.to_path_buf(),
            released: false,
        })
    }
}

fn is_already_exists(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::AlreadyExists)
}
