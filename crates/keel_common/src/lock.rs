//! Advisory, host-local locking for mutating lifecycle operations
//!
//! Ensures only one destructive operation runs at a time using:
//! - An exclusive `flock` on a per-resource marker file, held for the
//!   lifetime of the `LockHandle`
//! - Holder info (PID, operation, timestamp) written into the marker for
//!   the conflict message
//! - Release on drop; the kernel releases the lock of a dead process
//!
//! Acquisition never waits: it is granted immediately or fails immediately.
//! The marker file is never removed, so every contender locks the same inode.

use crate::error::{KeelError, Result};
use chrono::{DateTime, Utc};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, warn};

/// Lock name shared by update, rollback, restore and volume backups
pub const MUTATION_LOCK: &str = "lifecycle";

/// Lock file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID holding the lock
    pub pid: u32,
    /// Operation that took the lock (update, rollback, ...)
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
    pub hostname: String,
}

impl LockInfo {
    fn new(operation: &str) -> Self {
        let hostname = fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            pid: process::id(),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
            hostname,
        }
    }
}

/// Hands out named locks under one directory
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn lock_path(&self, resource: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", resource))
    }

    /// Try to take `resource` for `operation`; fails immediately if held
    pub fn acquire(&self, resource: &str, operation: &str) -> Result<LockHandle> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(resource);
        let mut file = open_marker(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                return Err(match read_info(&path) {
                    Some(holder) => self.conflict(resource, &path, &holder),
                    // Holder is between taking the lock and writing its info
                    None => KeelError::conflict(
                        format!("Lock '{}' ({}) is being acquired by another process", resource, path.display()),
                        "Another lifecycle operation just started; wait for it to finish",
                    ),
                });
            }
            Err(e) => return Err(e.into()),
        }

        // Leftover info means the previous holder exited without releasing
        if let Some(previous) = read_info(&path) {
            warn!(
                "Recovering lock {} left by process {} ({})",
                path.display(),
                previous.pid,
                previous.operation
            );
        }

        let info = LockInfo::new(operation);
        let content = serde_json::to_string_pretty(&info)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        debug!("Lock {} acquired for {}", path.display(), operation);
        Ok(LockHandle {
            resource: resource.to_string(),
            path,
            info,
            file,
        })
    }

    /// Current holder, if the lock is held. Read-only.
    pub fn holder(&self, resource: &str) -> Option<LockInfo> {
        if !self.is_locked(resource) {
            return None;
        }
        read_info(&self.lock_path(resource))
    }

    /// Whether some handle currently holds `resource`
    pub fn is_locked(&self, resource: &str) -> bool {
        let file = match File::open(self.lock_path(resource)) {
            Ok(file) => file,
            Err(_) => return false,
        };
        // A shared lock attempt fails while anyone holds it exclusively
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                if let Err(e) = FileExt::unlock(&file) {
                    debug!("Releasing shared lock check failed: {}", e);
                }
                false
            }
            Err(e) => is_contended(&e),
        }
    }

    fn conflict(&self, resource: &str, path: &Path, holder: &LockInfo) -> KeelError {
        KeelError::conflict(
            format!(
                "Lock '{}' ({}) is held by PID {} for {} since {}",
                resource,
                path.display(),
                holder.pid,
                holder.operation,
                holder.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            format!("Wait for the running {} (PID {}) to finish", holder.operation, holder.pid),
        )
    }
}

fn open_marker(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn read_info(path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// A held lock; released when dropped
#[derive(Debug)]
pub struct LockHandle {
    resource: String,
    path: PathBuf,
    info: LockInfo,
    file: File,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn holder(&self) -> &LockInfo {
        &self.info
    }

    /// Whether the marker on disk still names this handle
    pub fn is_valid(&self) -> bool {
        read_info(&self.path).map(|info| info == self.info).unwrap_or(false)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // Clear the holder info while still locked; closing the file unlocks
        if let Err(e) = self.file.set_len(0) {
            warn!("Failed to clear lock marker {}: {}", self.path.display(), e);
        }
        match FileExt::unlock(&self.file) {
            Ok(()) => debug!("Lock {} released", self.path.display()),
            Err(e) => warn!("Failed to release lock {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        let handle = locks.acquire(MUTATION_LOCK, "update").unwrap();
        assert!(locks.is_locked(MUTATION_LOCK));
        assert_eq!(handle.holder().operation, "update");
        assert_eq!(handle.resource(), MUTATION_LOCK);

        drop(handle);
        assert!(!locks.is_locked(MUTATION_LOCK));
    }

    #[test]
    fn test_second_acquire_fails_immediately() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        let _held = locks.acquire(MUTATION_LOCK, "rollback").unwrap();
        let err = locks.acquire(MUTATION_LOCK, "update").unwrap_err();

        match &err {
            KeelError::StateConflict { message, .. } => {
                assert!(message.contains("rollback"));
                assert!(message.contains("lifecycle.lock"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(err.remediation().is_some());
    }

    fn write_dead_holder(locks: &LockManager) {
        let mut stale = LockInfo::new("update");
        stale.pid = 999_999_999;
        fs::write(
            locks.lock_path(MUTATION_LOCK),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_dead_holder_is_recovered() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());
        write_dead_holder(&locks);

        assert!(!locks.is_locked(MUTATION_LOCK));
        assert!(locks.holder(MUTATION_LOCK).is_none());

        let handle = locks.acquire(MUTATION_LOCK, "rollback").unwrap();
        assert_eq!(handle.holder().pid, process::id());
        assert!(handle.is_valid());
        assert_eq!(locks.holder(MUTATION_LOCK).unwrap().operation, "rollback");
    }

    #[test]
    fn test_dead_holder_recovery_has_one_winner() {
        for _ in 0..200 {
            let temp = TempDir::new().unwrap();
            let locks = LockManager::new(temp.path());
            write_dead_holder(&locks);
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<Option<LockHandle>> = thread::scope(|scope| {
                let racers: Vec<_> = (0..2)
                    .map(|i| {
                        let locks = locks.clone();
                        let barrier = Arc::clone(&barrier);
                        scope.spawn(move || {
                            barrier.wait();
                            locks.acquire(MUTATION_LOCK, &format!("op-{}", i)).ok()
                        })
                    })
                    .collect();
                racers.into_iter().map(|h| h.join().unwrap()).collect()
            });

            // Both handles are still alive here, so a double grant would show
            assert_eq!(handles.iter().filter(|h| h.is_some()).count(), 1);
        }
    }

    #[test]
    fn test_release_keeps_marker_and_clears_holder() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        drop(locks.acquire(MUTATION_LOCK, "update").unwrap());
        assert!(locks.lock_path(MUTATION_LOCK).exists());
        assert!(read_info(&locks.lock_path(MUTATION_LOCK)).is_none());

        let again = locks.acquire(MUTATION_LOCK, "backup").unwrap();
        assert_eq!(again.holder().operation, "backup");
    }

    #[test]
    fn test_different_resources_do_not_conflict() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());

        let _a = locks.acquire("lifecycle", "update").unwrap();
        let _b = locks.acquire("install", "install").unwrap();
    }

    #[test]
    fn test_concurrent_acquire_exactly_one_wins() {
        let temp = TempDir::new().unwrap();
        let locks = LockManager::new(temp.path());
        let barrier = Arc::new(Barrier::new(8));

        let results: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let locks = locks.clone();
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        let result = locks.acquire(MUTATION_LOCK, &format!("op-{}", i));
                        // Hold briefly so losers observe the marker
                        let won = result.is_ok();
                        thread::sleep(std::time::Duration::from_millis(50));
                        won
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|won| **won).count(), 1);
    }
}
