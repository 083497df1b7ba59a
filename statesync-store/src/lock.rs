//! Sidecar lock files for destructive operations.
//!
//! A lock is a `<file>.lock` created with exclusive-create semantics. On
//! contention the caller waits `backoff` and retries up to `attempts` times;
//! after that the lock is presumed stale (its holder crashed) and is broken.
//!
//! This favours liveness over strict mutual exclusion: a holder that is
//! merely slow for longer than `attempts * backoff` can have its lock taken
//! away. Callers that need stricter exclusion raise `attempts`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use statesync_core::config::{DEFAULT_LOCK_ATTEMPTS, DEFAULT_LOCK_BACKOFF_MS};
use statesync_core::error::{io_err, StoreError};
use statesync_core::StoreConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_LOCK_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_LOCK_BACKOFF_MS),
        }
    }
}

impl From<&StoreConfig> for LockPolicy {
    fn from(config: &StoreConfig) -> Self {
        Self {
            attempts: config.lock_attempts,
            backoff: config.lock_backoff(),
        }
    }
}

/// Held lock; the lock file is removed on drop.
#[derive(Debug)]
pub struct DocumentLock {
    path: PathBuf,
    forced: bool,
}

impl DocumentLock {
    pub fn acquire(lock_path: &Path, policy: LockPolicy) -> Result<Self, StoreError> {
        for attempt in 1..=policy.attempts {
            match try_create(lock_path) {
                Ok(()) => {
                    return Ok(Self {
                        path: lock_path.to_path_buf(),
                        forced: false,
                    })
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!(lock = %lock_path.display(), attempt, "lock contended");
                    if attempt < policy.attempts {
                        sleep(policy.backoff);
                    }
                }
                Err(err) => return Err(io_err(lock_path, err)),
            }
        }

        tracing::warn!(
            lock = %lock_path.display(),
            attempts = policy.attempts,
            "breaking stale lock",
        );
        match fs::remove_file(lock_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(lock_path, err)),
        }
        match try_create(lock_path) {
            Ok(()) => {}
            // Another breaker won the race; take it over rather than wait again.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                fs::write(lock_path, lock_contents()).map_err(|e| io_err(lock_path, e))?;
            }
            Err(err) => return Err(io_err(lock_path, err)),
        }
        Ok(Self {
            path: lock_path.to_path_buf(),
            forced: true,
        })
    }

    /// True when the lock was obtained by breaking a stale one.
    pub fn was_forced(&self) -> bool {
        self.forced
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(lock = %self.path.display(), error = %err, "failed to release lock");
            }
        }
    }
}

fn try_create(lock_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    file.write_all(lock_contents().as_bytes())
}

fn lock_contents() -> String {
    json!({
        "pid": std::process::id(),
        "acquiredAt": Utc::now().to_rfc3339(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn quick() -> LockPolicy {
        LockPolicy {
            attempts: 3,
            backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn acquire_creates_and_drop_removes_lock_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json.lock");
        {
            let lock = DocumentLock::acquire(&path, quick()).unwrap();
            assert!(path.exists());
            assert!(!lock.was_forced());
            let contents: serde_json::Value =
                serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
            assert_eq!(contents["pid"], json!(std::process::id()));
        }
        assert!(!path.exists(), "lock must be released on drop");
    }

    #[test]
    fn stale_lock_is_broken_after_bounded_retries() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json.lock");
        fs::write(&path, "left behind by a crashed process").unwrap();

        let started = Instant::now();
        let lock = DocumentLock::acquire(&path, quick()).unwrap();
        assert!(lock.was_forced());
        assert!(started.elapsed() >= Duration::from_millis(10), "must back off between attempts");
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn released_lock_is_reacquired_without_force() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json.lock");
        drop(DocumentLock::acquire(&path, quick()).unwrap());
        let again = DocumentLock::acquire(&path, quick()).unwrap();
        assert!(!again.was_forced());
    }

    #[test]
    fn contended_lock_waits_for_holder_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.json.lock");
        let holder = DocumentLock::acquire(&path, quick()).unwrap();

        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            let policy = LockPolicy {
                attempts: 200,
                backoff: Duration::from_millis(5),
            };
            DocumentLock::acquire(&waiter_path, policy).map(|l| l.was_forced())
        });

        std::thread::sleep(Duration::from_millis(30));
        drop(holder);
        assert!(!waiter.join().unwrap().unwrap(), "waiter should get a clean lock");
    }
}
