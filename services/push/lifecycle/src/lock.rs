//! Cross-process advisory locks.
//!
//! Socket ownership crosses process boundaries, so it is coordinated with
//! lock files rather than in-process synchronization. Two locks exist per
//! session: the socket lock taken by whoever resumes a parked socket, and the
//! foreground lock held while a foreground connection is live.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{LifecycleError, Result};

/// Provider of the two per-session advisory locks
pub trait AdvisoryLocks: Send + Sync {
    /// Lock guarding resumption of the socket parked under `socket_id`
    fn try_acquire_socket_lock(&self, socket_id: &str) -> Result<Option<LockGuard>>;

    /// Lock held while a foreground connection for `session_name` is live
    fn try_acquire_foreground_lock(&self, session_name: &str) -> Result<Option<LockGuard>>;
}

/// Held advisory lock; released on drop
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            trace!("Unlocking {} failed: {}", self.path.display(), e);
        }
    }
}

/// Lock files inside a directory
#[derive(Debug, Clone)]
pub struct FileLocks {
    dir: PathBuf,
}

impl FileLocks {
    /// Use `dir` for lock files, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(LifecycleError::Lock)?;
        Ok(Self { dir })
    }

    fn try_acquire(&self, file_name: String) -> Result<Option<LockGuard>> {
        let path = self.dir.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(LifecycleError::Lock)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                trace!("Acquired {}", path.display());
                Ok(Some(LockGuard { file, path }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!("{} is held elsewhere", path.display());
                Ok(None)
            }
            Err(e) => Err(LifecycleError::Lock(e)),
        }
    }
}

impl AdvisoryLocks for FileLocks {
    fn try_acquire_socket_lock(&self, socket_id: &str) -> Result<Option<LockGuard>> {
        self.try_acquire(format!("{}.socket.lock", sanitize_key(socket_id)))
    }

    fn try_acquire_foreground_lock(&self, session_name: &str) -> Result<Option<LockGuard>> {
        self.try_acquire(format!("{}.sync.lock", sanitize_key(session_name)))
    }
}

/// Map a key onto a safe file name component
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
