//! Advisory write locks for local resource files.
//!
//! Writers to the same file serialize on an exclusive lock over a sidecar
//! `<file>.lock`, keyed by the canonical absolute path of the data file so
//! that differently spelled paths to one file contend on one lock.
//!
//! Uses the `fs2` crate for cross-platform file locking (MSRV 1.75 compatible).
//! Note: std::fs::File::lock() requires Rust 1.89+, so we use fs2 instead.

use fs2::FileExt;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("File is locked by another writer: {0}")]
    Locked(PathBuf),

    #[error("Failed to resolve lock key for {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create lock file: {0}")]
    CreateFailed(#[source] io::Error),

    #[error("Failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

/// Coordination context shared by cooperating writers.
pub trait LockCoordinator: Send + Sync + fmt::Debug {
    /// Block until the exclusive lock for `key` is held.
    fn acquire(&self, key: &Path) -> Result<LockGuard, LockError>;
}

/// Holds an exclusive lock; released when dropped.
pub struct LockGuard {
    file: File,
    lock_path: PathBuf,
}

impl LockGuard {
    /// Get the path to the lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!("Releasing write lock: {}", self.lock_path.display());
        if let Err(e) = FileExt::unlock(&self.file) {
            // Closing the handle releases it anyway
            debug!("Failed to unlock {}: {}", self.lock_path.display(), e);
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// Get the lock file path for a data file.
///
/// Examples:
/// - `/data/x.jsonl` → `/data/x.jsonl.lock`
/// - `/data/x` → `/data/x.lock` (no double-dot)
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock_path = path.to_path_buf();
    match lock_path.extension() {
        Some(ext) => {
            let new_ext = format!("{}.lock", ext.to_string_lossy());
            lock_path.set_extension(new_ext);
        }
        None => {
            lock_path.set_extension("lock");
        }
    }
    lock_path
}

/// Canonical absolute path used as the lock key.
///
/// The file itself may not exist yet, so the parent directory is
/// canonicalized and the file name re-appended.
pub fn lock_key(path: &Path) -> Result<PathBuf, LockError> {
    let resolve = |source| LockError::Resolve {
        path: path.to_path_buf(),
        source,
    };
    if path.exists() {
        return path.canonicalize().map_err(resolve);
    }
    let file_name = path.file_name().ok_or_else(|| {
        resolve(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path has no file name",
        ))
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(parent.canonicalize().map_err(resolve)?.join(file_name))
}

/// File-based coordinator; works across threads and processes on one host.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLockCoordinator;

impl FileLockCoordinator {
    pub fn new() -> Self {
        Self
    }

    fn open_lock_file(key: &Path) -> Result<(File, PathBuf), LockError> {
        let lock_path = lock_path_for(key);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(LockError::CreateFailed)?;
        Ok((file, lock_path))
    }

    /// Non-blocking variant: `Err(LockError::Locked)` if another writer holds it.
    pub fn try_acquire(&self, key: &Path) -> Result<LockGuard, LockError> {
        let (file, lock_path) = Self::open_lock_file(key)?;
        // Fully qualified: std's File::try_lock_exclusive (1.89+) has a different error type
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(LockGuard { file, lock_path }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(LockError::Locked(key.to_path_buf()))
            }
            Err(e) => Err(LockError::AcquireFailed(e)),
        }
    }
}

impl LockCoordinator for FileLockCoordinator {
    fn acquire(&self, key: &Path) -> Result<LockGuard, LockError> {
        let (file, lock_path) = Self::open_lock_file(key)?;
        debug!("Waiting for write lock: {}", lock_path.display());
        FileExt::lock_exclusive(&file).map_err(LockError::AcquireFailed)?;
        debug!("Acquired write lock: {}", lock_path.display());
        Ok(LockGuard { file, lock_path })
    }
}

/// Scoped write lock around a local file's critical section.
///
/// Never fails: without a coordinator it is a no-op, and a failed
/// acquisition degrades to an unlocked write with a warning.
#[derive(Debug)]
pub struct WriteLock {
    key: PathBuf,
    guard: Option<LockGuard>,
}

impl WriteLock {
    pub fn acquire(path: &Path, coordinator: Option<&Arc<dyn LockCoordinator>>) -> Self {
        let Some(coordinator) = coordinator else {
            debug!("No lock coordinator for {}, writing unlocked", path.display());
            return Self {
                key: path.to_path_buf(),
                guard: None,
            };
        };

        let key = match lock_key(path) {
            Ok(key) => key,
            Err(e) => {
                warn!("Proceeding without write lock: {}", e);
                return Self {
                    key: path.to_path_buf(),
                    guard: None,
                };
            }
        };

        match coordinator.acquire(&key) {
            Ok(guard) => Self {
                key,
                guard: Some(guard),
            },
            Err(e) => {
                warn!(
                    "Proceeding without write lock on {}: {}",
                    key.display(),
                    e
                );
                Self { key, guard: None }
            }
        }
    }

    pub fn key(&self) -> &Path {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_for() {
        let lock = lock_path_for(Path::new("/data/test.jsonl"));
        assert_eq!(lock, PathBuf::from("/data/test.jsonl.lock"));

        let lock_no_ext = lock_path_for(Path::new("/data/mydb"));
        assert_eq!(lock_no_ext, PathBuf::from("/data/mydb.lock"));

        let lock_dots = lock_path_for(Path::new("/data/my.data.avro"));
        assert_eq!(lock_dots, PathBuf::from("/data/my.data.avro.lock"));
    }

    #[test]
    fn test_lock_key_canonicalizes_missing_file() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b")).unwrap();

        let direct = lock_key(&temp.path().join("a/x.jsonl")).unwrap();
        let roundabout = lock_key(&temp.path().join("a/b/../x.jsonl")).unwrap();
        assert_eq!(direct, roundabout);
        assert!(direct.is_absolute());
    }

    #[test]
    fn test_no_coordinator_is_noop() {
        let temp = TempDir::new().unwrap();
        let lock = WriteLock::acquire(&temp.path().join("x.jsonl"), None);
        assert!(!lock.is_held());
        assert!(!temp.path().join("x.jsonl.lock").exists());
    }

    #[test]
    fn test_missing_directory_degrades_to_unlocked() {
        let temp = TempDir::new().unwrap();
        let coordinator: Arc<dyn LockCoordinator> = Arc::new(FileLockCoordinator::new());
        let lock = WriteLock::acquire(&temp.path().join("nope/x.jsonl"), Some(&coordinator));
        assert!(!lock.is_held());
    }

    #[test]
    fn test_contention_and_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.jsonl");
        let coordinator: Arc<dyn LockCoordinator> = Arc::new(FileLockCoordinator::new());

        let held = WriteLock::acquire(&path, Some(&coordinator));
        assert!(held.is_held());

        let key = held.key().to_path_buf();
        let result = FileLockCoordinator::new().try_acquire(&key);
        assert!(matches!(result, Err(LockError::Locked(_))));

        drop(held);
        let _again = FileLockCoordinator::new().try_acquire(&key).unwrap();
    }

    #[test]
    fn test_blocking_acquire_waits_for_holder() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.jsonl");
        let coordinator: Arc<dyn LockCoordinator> = Arc::new(FileLockCoordinator::new());
        let released = Arc::new(AtomicBool::new(false));

        let held = WriteLock::acquire(&path, Some(&coordinator));

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            let released = Arc::clone(&released);
            let path = path.clone();
            thread::spawn(move || {
                let lock = WriteLock::acquire(&path, Some(&coordinator));
                assert!(lock.is_held());
                released.load(Ordering::SeqCst)
            })
        };

        thread::sleep(Duration::from_millis(200));
        released.store(true, Ordering::SeqCst);
        drop(held);

        assert!(waiter.join().unwrap(), "waiter entered before release");
    }
}
