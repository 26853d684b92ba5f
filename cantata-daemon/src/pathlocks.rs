// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Advisory path locks.
//!
//! Each path `<p>` is guarded by an exclusive `flock()` on `<p>.lock`.
//! Multi-path acquisition always locks in byte order, which rules out
//! lock-order deadlocks between cooperating processes. Lock files are
//! opened close-on-exec so builder subprocesses never inherit them.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

/// An exclusive lock on one path; released on drop.
pub struct PathLock {
    _flock: Flock<File>,
    lock_path: PathBuf,
}

impl PathLock {
    /// Acquire, blocking until the lock is free.
    pub fn lock(path: &Path) -> io::Result<Self> {
        Self::acquire(path, FlockArg::LockExclusive).map(|lock| lock.expect("blocking lock"))
    }

    /// Acquire without blocking; `Ok(None)` when the lock is held
    /// elsewhere.
    pub fn try_lock(path: &Path) -> io::Result<Option<Self>> {
        Self::acquire(path, FlockArg::LockExclusiveNonblock)
    }

    fn acquire(path: &Path, arg: FlockArg) -> io::Result<Option<Self>> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .custom_flags(libc::O_CLOEXEC)
            .open(&lock_path)?;
        match Flock::lock(file, arg) {
            Ok(flock) => {
                trace!(path = %lock_path.display(), "acquired path lock");
                Ok(Some(PathLock {
                    _flock: flock,
                    lock_path,
                }))
            }
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(io::Error::other(format!(
                "flock on {}: {errno}",
                lock_path.display()
            ))),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Locks over a set of paths, acquired in sorted order.
pub struct PathLocks {
    locks: Vec<PathLock>,
}

impl PathLocks {
    /// Lock every path. With `wait`, blocks per lock; without, returns
    /// `Ok(None)` as soon as one lock is contended (releasing those
    /// already taken).
    pub fn lock_paths<P: AsRef<Path>>(paths: &[P], wait: bool) -> io::Result<Option<Self>> {
        let mut sorted: Vec<&Path> = paths.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable_by(|a, b| a.as_os_str().as_encoded_bytes().cmp(
            b.as_os_str().as_encoded_bytes(),
        ));
        sorted.dedup();

        let mut locks = Vec::with_capacity(sorted.len());
        for path in sorted {
            let lock = if wait {
                Some(PathLock::lock(path)?)
            } else {
                PathLock::try_lock(path)?
            };
            match lock {
                Some(lock) => locks.push(lock),
                None => return Ok(None),
            }
        }
        Ok(Some(PathLocks { locks }))
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier, Mutex};

    use super::*;

    #[test]
    fn lock_creates_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("object");
        let lock = PathLock::lock(&path).unwrap();
        assert!(lock.lock_path().exists());
    }

    #[test]
    fn try_lock_reports_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contested");
        let _held = PathLock::lock(&path).unwrap();
        // flock is per open file description, so contention needs a
        // second process in real use; within one process a second open
        // file still conflicts.
        assert!(PathLock::try_lock(&path).unwrap().is_none());
    }

    #[test]
    fn released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped");
        {
            let _lock = PathLock::lock(&path).unwrap();
        }
        assert!(PathLock::try_lock(&path).unwrap().is_some());
    }

    #[test]
    fn multi_path_sorted_and_deduped() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("aa");
        let b = dir.path().join("bb");
        let locks = PathLocks::lock_paths(&[&b, &a, &b], true).unwrap().unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn multi_path_try_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("aa");
        let b = dir.path().join("bb");
        let _held = PathLock::lock(&b).unwrap();
        assert!(PathLocks::lock_paths(&[&a, &b], false).unwrap().is_none());
        // The failed attempt released the lock it did get.
        assert!(PathLock::try_lock(&a).unwrap().is_some());
    }

    #[test]
    fn exclusive_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thread-contested");
        let order = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let path = path.clone();
                let order = order.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let _lock = PathLock::lock(&path).unwrap();
                    order.lock().unwrap().push(i);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(order.lock().unwrap().len(), 2);
    }
}
