// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The build user pool.
//!
//! Each uid in the configured range is guarded by a lock file under
//! `<state>/userpool/<uid>`; holding the flock reserves the uid for one
//! build. A crashed daemon drops its locks with its file descriptors,
//! so uids come back on their own.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

/// A reserved build uid; released on drop.
pub struct UserLock {
    _flock: Flock<std::fs::File>,
    uid: u32,
}

impl UserLock {
    pub fn uid(&self) -> u32 {
        self.uid
    }
}

/// Reserve a uid from `[base, base + count)`, or `Ok(None)` when every
/// uid is busy.
pub fn acquire_build_user(
    userpool_dir: &Path,
    base: u32,
    count: u32,
) -> io::Result<Option<UserLock>> {
    for uid in base..base + count {
        let lock_path: PathBuf = userpool_dir.join(uid.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .custom_flags(libc::O_CLOEXEC)
            .open(&lock_path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                trace!(uid, "reserved build user");
                return Ok(Some(UserLock { _flock: flock, uid }));
            }
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => continue,
            Err((_, errno)) => {
                return Err(io::Error::other(format!(
                    "flock on {}: {errno}",
                    lock_path.display()
                )));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_distinct_uids() {
        let dir = tempfile::tempdir().unwrap();
        let a = acquire_build_user(dir.path(), 30000, 2).unwrap().unwrap();
        let b = acquire_build_user(dir.path(), 30000, 2).unwrap().unwrap();
        assert_ne!(a.uid(), b.uid());
        assert!(acquire_build_user(dir.path(), 30000, 2).unwrap().is_none());
    }

    #[test]
    fn uid_returns_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = acquire_build_user(dir.path(), 30000, 1).unwrap().unwrap();
            assert!(acquire_build_user(dir.path(), 30000, 1).unwrap().is_none());
        }
        assert!(acquire_build_user(dir.path(), 30000, 1).unwrap().is_some());
    }
}
