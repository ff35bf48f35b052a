//! Exclusive maintenance lock.
//!
//! Maintenance operations (garbage collection, flush) across every
//! process sharing a cache directory are serialized through one lock
//! file. Presence of the file is the lock: acquisition is a
//! create-exclusive open, so exactly one contender wins no matter how
//! many race. The file body carries advisory diagnostics only.
//!
//! A holder that crashes leaves the file behind; acquisition treats a
//! lock older than the staleness threshold as abandoned, clears it, and
//! retries once. Ordinary reads and writes never touch the lock.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::entry::unix_now;

/// Lock result type.
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another process holds the lock. Retry later.
    #[error("maintenance lock held by another process")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Diagnostic body written into the lock file.
///
/// The locking protocol is file presence alone; a truncated or garbled
/// body still counts as a held lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    /// Acquisition time, Unix seconds.
    pub acquired_at: u64,
    /// Owning process, `pid@host`.
    pub owner: String,
}

/// Acquires and clears the maintenance lock for one cache directory.
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    lock_path: PathBuf,
    stale_after: Duration,
}

impl LockCoordinator {
    /// Lock file name inside the cache directory.
    pub const LOCK_FILENAME: &'static str = ".maintenance.lock";

    /// Age past which a lock is presumed abandoned by a dead holder.
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(180);

    /// Coordinator for the given cache directory.
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            lock_path: cache_dir.join(Self::LOCK_FILENAME),
            stale_after: Self::DEFAULT_STALE_AFTER,
        }
    }

    /// Override the staleness threshold.
    pub fn with_staleness(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Path of the lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Try to take the lock without blocking.
    ///
    /// A held lock older than the staleness threshold is cleared and
    /// the acquisition retried exactly once; losing that retry means
    /// another contender won the race and the result is [`LockError::Busy`].
    pub fn try_acquire(&self) -> LockResult<MaintenanceGuard> {
        match self.create_lock_file() {
            Ok(()) => Ok(self.guard()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match self.lock_age() {
                    Some(age) if age > self.stale_after => {
                        warn!(
                            path = %self.lock_path.display(),
                            age_secs = age.as_secs(),
                            "clearing stale maintenance lock"
                        );
                        let _ = fs::remove_file(&self.lock_path);
                        match self.create_lock_file() {
                            Ok(()) => Ok(self.guard()),
                            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                                Err(LockError::Busy)
                            }
                            Err(e) => Err(LockError::Io(e)),
                        }
                    }
                    _ => Err(LockError::Busy),
                }
            }
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Remove the lock file unconditionally.
    ///
    /// Operator escape hatch for a wedged lock. Returns whether a lock
    /// file was present.
    pub fn clear(&self) -> LockResult<bool> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    fn guard(&self) -> MaintenanceGuard {
        debug!(path = %self.lock_path.display(), "maintenance lock acquired");
        MaintenanceGuard {
            lock_path: self.lock_path.clone(),
        }
    }

    /// Create the lock file, failing if it already exists.
    ///
    /// The diagnostic body is written best-effort through the same
    /// handle; a failed body write leaves a valid empty lock.
    fn create_lock_file(&self) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)?;

        let record = LockRecord {
            acquired_at: unix_now(),
            owner: owner_id(),
        };
        if let Ok(json) = serde_json::to_vec(&record) {
            let _ = file.write_all(&json);
        }
        Ok(())
    }

    /// Age of the held lock.
    ///
    /// Prefers the embedded acquisition time; falls back to file mtime
    /// when the body is unreadable. `None` means the age could not be
    /// determined, which acquisition treats as a fresh lock.
    fn lock_age(&self) -> Option<Duration> {
        if let Ok(contents) = fs::read_to_string(&self.lock_path) {
            if let Ok(record) = serde_json::from_str::<LockRecord>(&contents) {
                return Some(Duration::from_secs(
                    unix_now().saturating_sub(record.acquired_at),
                ));
            }
        }
        let metadata = fs::metadata(&self.lock_path).ok()?;
        metadata.modified().ok()?.elapsed().ok()
    }
}

/// Proof of holding the maintenance lock.
///
/// Removing the lock file on drop ties release to scope exit, covering
/// early returns and error paths alike.
#[derive(Debug)]
pub struct MaintenanceGuard {
    lock_path: PathBuf,
}

impl MaintenanceGuard {
    /// Path of the held lock file.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// `pid@host` identity for lock diagnostics.
fn owner_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    format!("{}@{}", std::process::id(), host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_coordinator(temp_dir: &TempDir) -> LockCoordinator {
        LockCoordinator::new(temp_dir.path())
    }

    #[test]
    fn test_acquire_creates_lock_with_diagnostics() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = make_coordinator(&temp_dir);

        let guard = coordinator.try_acquire().unwrap();
        assert!(guard.path().exists());

        let contents = fs::read_to_string(guard.path()).unwrap();
        let record: LockRecord = serde_json::from_str(&contents).unwrap();
        assert!(record.owner.starts_with(&std::process::id().to_string()));
        assert!(record.acquired_at > 0);
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = make_coordinator(&temp_dir);

        let _guard = coordinator.try_acquire().unwrap();
        assert!(matches!(coordinator.try_acquire(), Err(LockError::Busy)));
    }

    #[test]
    fn test_drop_releases_lock() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = make_coordinator(&temp_dir);

        {
            let _guard = coordinator.try_acquire().unwrap();
        }
        assert!(!coordinator.lock_path().exists());

        // Re-acquire succeeds immediately after release
        let _guard = coordinator.try_acquire().unwrap();
    }

    #[test]
    fn test_stale_lock_is_force_cleared() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = make_coordinator(&temp_dir);

        let abandoned = LockRecord {
            acquired_at: unix_now() - 3600,
            owner: "999999@dead-host".to_string(),
        };
        fs::write(
            coordinator.lock_path(),
            serde_json::to_vec(&abandoned).unwrap(),
        )
        .unwrap();

        let guard = coordinator.try_acquire().unwrap();

        // The replacement lock belongs to us now
        let contents = fs::read_to_string(guard.path()).unwrap();
        let record: LockRecord = serde_json::from_str(&contents).unwrap();
        assert!(record.owner.starts_with(&std::process::id().to_string()));
    }

    #[test]
    fn test_fresh_lock_is_respected() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = make_coordinator(&temp_dir);

        let live = LockRecord {
            acquired_at: unix_now(),
            owner: "12345@other-host".to_string(),
        };
        fs::write(coordinator.lock_path(), serde_json::to_vec(&live).unwrap()).unwrap();

        assert!(matches!(coordinator.try_acquire(), Err(LockError::Busy)));
    }

    #[test]
    fn test_garbled_body_falls_back_to_mtime() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = make_coordinator(&temp_dir);

        // Fresh mtime, unparseable body: still a held lock
        fs::write(coordinator.lock_path(), b"not json at all").unwrap();
        assert!(matches!(coordinator.try_acquire(), Err(LockError::Busy)));
    }

    #[test]
    fn test_custom_staleness_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = make_coordinator(&temp_dir).with_staleness(Duration::from_secs(10));

        let abandoned = LockRecord {
            acquired_at: unix_now() - 60,
            owner: "1@host".to_string(),
        };
        fs::write(
            coordinator.lock_path(),
            serde_json::to_vec(&abandoned).unwrap(),
        )
        .unwrap();

        assert!(coordinator.try_acquire().is_ok());
    }

    #[test]
    fn test_clear_reports_presence() {
        let temp_dir = TempDir::new().unwrap();
        let coordinator = make_coordinator(&temp_dir);

        assert!(!coordinator.clear().unwrap());

        let guard = coordinator.try_acquire().unwrap();
        assert!(coordinator.clear().unwrap());
        assert!(!coordinator.lock_path().exists());

        // Guard drop after an operator clear must not error
        drop(guard);
    }

    #[test]
    fn test_contention_across_threads() {
        use std::sync::mpsc;
        use std::thread;

        let temp_dir = TempDir::new().unwrap();
        let coordinator = make_coordinator(&temp_dir);
        let dir = temp_dir.path().to_path_buf();

        let _guard = coordinator.try_acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let other = LockCoordinator::new(&dir);
            tx.send(matches!(other.try_acquire(), Err(LockError::Busy)))
                .unwrap();
        });

        assert!(rx.recv().unwrap(), "second contender should observe Busy");
        handle.join().unwrap();
    }
}
