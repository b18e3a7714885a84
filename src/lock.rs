//! Cross-process mutual exclusion over an agreed lock file.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Exclusive lock shared by every process attached to one table.
///
/// Each acquisition opens its own descriptor on the lock file, so the lock
/// excludes sibling threads of this process as well as other processes.
/// Acquisition blocks with no timeout. The lock does not nest: a thread
/// already holding a guard will block on itself if it acquires again.
///
/// The kernel releases the lock when the holding descriptor closes, so a
/// crashed holder cannot leave the table locked forever.
#[derive(Clone, Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
    }

    /// Blocks until the lock is held; the guard releases it on drop, on
    /// every exit path.
    pub fn acquire(&self) -> io::Result<FileLockGuard> {
        let file = self.open()?;
        match Flock::lock(file, FlockArg::LockExclusive) {
            Ok(flock) => Ok(FileLockGuard { _flock: flock }),
            Err((_, errno)) => Err(errno.into()),
        }
    }

    /// Non-blocking variant: `None` if another holder has the lock.
    pub fn try_acquire(&self) -> io::Result<Option<FileLockGuard>> {
        let file = self.open()?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(FileLockGuard { _flock: flock })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(errno.into()),
        }
    }
}

/// Holds the lock until dropped.
pub struct FileLockGuard {
    _flock: Flock<File>,
}

#[cfg(test)]
mod tests {
    use super::FileLock;

    /// Invariant: a held guard excludes a second acquisition (taken through
    /// a separate descriptor), and dropping the guard releases the lock.
    #[test]
    fn guard_excludes_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("table.lock"));

        let guard = lock.acquire().unwrap();
        assert!(lock.try_acquire().unwrap().is_none());

        drop(guard);
        assert!(lock.try_acquire().unwrap().is_some());
    }

    /// Invariant: reacquisition after release works repeatedly.
    #[test]
    fn sequential_acquisitions() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("table.lock"));
        for _ in 0..3 {
            let g = lock.acquire().unwrap();
            drop(g);
        }
    }
}
