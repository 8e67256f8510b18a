//! Content-addressed single-writer lock.
//!
//! Serializes writers of the same artifact (e.g. a scaler fit for one
//! `(ticker, config hash)`) both within the process, via a keyed set guarded by
//! a condvar, and across processes, via a `create_new` lock file under
//! `{root}/locks/`. The guard releases both on drop.

use super::artifact::{io_err, StoreError};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

struct Registry {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        held: Mutex::new(HashSet::new()),
        released: Condvar::new(),
    })
}

/// Held lock on one content key.
#[derive(Debug)]
pub struct KeyLock {
    key: String,
    path: PathBuf,
}

impl KeyLock {
    /// Block until the lock for `key` is held, or fail after `timeout`.
    ///
    /// Lock files older than `stale_after` are assumed to belong to a crashed
    /// process and are removed.
    pub fn acquire(
        root: &Path,
        key: &str,
        timeout: Duration,
        stale_after: Duration,
    ) -> Result<Self, StoreError> {
        let deadline = Instant::now() + timeout;
        let reg = registry();

        {
            let mut held = reg.held.lock().unwrap_or_else(|e| e.into_inner());
            while held.contains(key) {
                let now = Instant::now();
                if now >= deadline {
                    return Err(StoreError::LockTimeout { key: key.to_string() });
                }
                let (guard, _) = reg
                    .released
                    .wait_timeout(held, deadline - now)
                    .unwrap_or_else(|e| e.into_inner());
                held = guard;
            }
            held.insert(key.to_string());
        }

        let lock_dir = root.join("locks");
        let path = lock_dir.join(format!("{}.lock", blake3::hash(key.as_bytes()).to_hex()));
        if let Err(e) = acquire_file(&lock_dir, &path, deadline, stale_after) {
            release_key(key);
            return Err(match e {
                AcquireFailure::Timeout => StoreError::LockTimeout { key: key.to_string() },
                AcquireFailure::Io(err) => err,
            });
        }

        log::debug!("acquired lock {key}");
        Ok(Self {
            key: key.to_string(),
            path,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        release_key(&self.key);
    }
}

fn release_key(key: &str) {
    let reg = registry();
    let mut held = reg.held.lock().unwrap_or_else(|e| e.into_inner());
    held.remove(key);
    reg.released.notify_all();
}

enum AcquireFailure {
    Timeout,
    Io(StoreError),
}

fn acquire_file(
    dir: &Path,
    path: &Path,
    deadline: Instant,
    stale_after: Duration,
) -> Result<(), AcquireFailure> {
    fs::create_dir_all(dir).map_err(|e| AcquireFailure::Io(io_err(dir)(e)))?;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if is_stale(path, stale_after) {
                    log::warn!("removing stale lock file {}", path.display());
                    let _ = fs::remove_file(path);
                    continue;
                }
                if Instant::now() >= deadline {
                    return Err(AcquireFailure::Timeout);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(AcquireFailure::Io(io_err(path)(e))),
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}
