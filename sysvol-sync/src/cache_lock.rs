//! Advisory lock on a cache directory, shared between engines and processes.
//!
//! Every synchronization pass holds the lock shared for its whole duration.
//! Removing staging or retired leftovers needs it exclusive, so a leftover
//! is only ever touched when no pass anywhere can still own it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{io_err, SyncError};

/// Lock file kept inside the cache directory.
pub const CACHE_LOCK_FILE: &str = ".sysvol.lock";

/// Held lock; released on drop.
#[derive(Debug)]
pub(crate) struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Block until no exclusive holder remains.
    pub(crate) fn shared(cache_dir: &Path) -> Result<Self, SyncError> {
        let lock = Self::open(cache_dir)?;
        lock.file
            .lock_shared()
            .map_err(|e| io_err(&lock.path, e))?;
        Ok(lock)
    }

    /// `None` when any other holder, shared or exclusive, is present.
    pub(crate) fn try_exclusive(cache_dir: &Path) -> Result<Option<Self>, SyncError> {
        let lock = Self::open(cache_dir)?;
        match lock.file.try_lock_exclusive() {
            Ok(()) => Ok(Some(lock)),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(io_err(&lock.path, err)),
        }
    }

    fn open(cache_dir: &Path) -> Result<Self, SyncError> {
        let path = cache_dir.join(CACHE_LOCK_FILE);
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path).map_err(|e| io_err(&path, e))?;
        Ok(Self { file, path })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %err, "cannot release cache lock");
        }
    }
}
