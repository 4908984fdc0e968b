//! Cross-process coordination through `<root>/.lock`.
//!
//! The first process ever to use a directory creates the lock file and is
//! its initializer; every later one opens the existing file and joins. The
//! file is never removed: processes that are still running hold it open, and
//! advisory locks only exclude each other on the same file. Index reads take
//! a shared advisory lock, structural mutations an exclusive one. Locks only
//! span a single cache operation.

use crate::Error;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".lock";

#[derive(Debug)]
pub struct ProcessLock {
    file: File,
    path: PathBuf,
    initializer: bool,
}

impl ProcessLock {
    /// Create or join the lock file inside `root`.
    pub fn acquire(root: &Path) -> Result<Self, Error> {
        let path = root.join(LOCK_FILE);

        let created = OpenOptions::new().read(true).write(true).create_new(true).open(&path);
        let (file, initializer) = match created {
            Ok(file) => (file, true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| Error::Init(format!("cannot open lock file {}: {e}", path.display())))?;
                (file, false)
            }
            Err(e) => return Err(Error::Init(format!("cannot create lock file {}: {e}", path.display()))),
        };

        if initializer {
            tracing::info!(path = %path.display(), "Initializing cache directory");
        } else {
            tracing::debug!("Joining cache directory locked by {}", path.display());
        }

        Ok(Self { file, path, initializer })
    }

    /// Whether this process created the lock file, which makes it the first
    /// process ever to use the directory, not merely the first one alive.
    pub fn is_initializer(&self) -> bool {
        self.initializer
    }

    /// Block until no other process is mutating the cache.
    pub fn shared(&self) -> Result<LockGuard<'_>, Error> {
        FileExt::lock_shared(&self.file).map_err(|e| Error::io(format!("locking {}", self.path.display()), e))?;
        Ok(LockGuard { file: &self.file })
    }

    /// Block until this process is the only one touching the cache.
    pub fn exclusive(&self) -> Result<LockGuard<'_>, Error> {
        FileExt::lock_exclusive(&self.file).map_err(|e| Error::io(format!("locking {}", self.path.display()), e))?;
        Ok(LockGuard { file: &self.file })
    }
}

/// Releases the advisory lock on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    file: &'a File,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            tracing::warn!(error = %e, "Failed to release cache lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_first_process_initializes() {
        let dir = TempDir::new().unwrap();
        let first = ProcessLock::acquire(dir.path()).unwrap();
        let second = ProcessLock::acquire(dir.path()).unwrap();
        assert!(first.is_initializer());
        assert!(!second.is_initializer());
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_lock_file_outlives_initializer() {
        let dir = TempDir::new().unwrap();
        let first = ProcessLock::acquire(dir.path()).unwrap();
        let joined = ProcessLock::acquire(dir.path()).unwrap();
        drop(first);
        assert!(dir.path().join(LOCK_FILE).exists());

        let later = ProcessLock::acquire(dir.path()).unwrap();
        assert!(!later.is_initializer());
        let _guard = joined.exclusive().unwrap();
        assert!(FileExt::try_lock_shared(&later.file).is_err());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let first = ProcessLock::acquire(dir.path()).unwrap();
        let second = ProcessLock::acquire(dir.path()).unwrap();
        let _a = first.shared().unwrap();
        let _b = second.shared().unwrap();
        assert!(FileExt::try_lock_exclusive(&second.file).is_err());
    }

    #[test]
    fn test_exclusive_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let first = ProcessLock::acquire(dir.path()).unwrap();
        let second = ProcessLock::acquire(dir.path()).unwrap();
        {
            let _guard = first.exclusive().unwrap();
            assert!(FileExt::try_lock_shared(&second.file).is_err());
        }
        let _guard = second.exclusive().unwrap();
    }

    #[test]
    fn test_missing_root_fails_init() {
        let dir = TempDir::new().unwrap();
        let err = ProcessLock::acquire(&dir.path().join("no/such/dir")).unwrap_err();
        assert!(matches!(err, Error::Init(_)));
    }
}
