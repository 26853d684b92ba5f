// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Temporary GC roots.
//!
//! Every live root set owns one file under `<state>/temproots/` named
//! `<pid>-<n>`, holds a lock on it, and appends the paths it needs
//! protected. The collector reads every file whose writer still holds
//! its lock; files with no living writer are stale and pruned.
//!
//! File format, versioned so it can evolve: one `0x01` header byte,
//! then per entry a u32 LE length followed by that many path bytes.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read as _, Write as _};
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, trace};

const FORMAT_VERSION: u8 = 0x01;

/// Distinguishes concurrent root sets within one process.
static NEXT_SET: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// One live set of temp roots. Roots last until the value drops (or the
/// owning process dies).
pub struct TempRoots {
    flock: Flock<File>,
    path: PathBuf,
}

impl TempRoots {
    /// Open (and lock) a fresh temp root file for this process.
    pub fn open(temproots_dir: &Path) -> io::Result<Self> {
        let set = NEXT_SET.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let path = temproots_dir.join(format!("{}-{}", std::process::id(), set));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)?;
        let mut flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::other(format!("locking temp roots: {errno}")))?;
        flock.write_all(&[FORMAT_VERSION])?;
        flock.flush()?;
        trace!(path = %path.display(), "opened temp roots");
        Ok(TempRoots { flock, path })
    }

    /// Protect `path` until this handle drops.
    pub fn add(&mut self, path: &str) -> io::Result<()> {
        let bytes = path.as_bytes();
        self.flock.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.flock.write_all(bytes)?;
        self.flock.flush()?;
        trace!(path, "added temp root");
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempRoots {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn parse_roots(data: &[u8]) -> Option<BTreeSet<String>> {
    let (version, mut rest) = data.split_first()?;
    if *version != FORMAT_VERSION {
        return None;
    }
    let mut roots = BTreeSet::new();
    while !rest.is_empty() {
        if rest.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return None;
        }
        if let Ok(path) = std::str::from_utf8(&rest[..len]) {
            roots.insert(path.to_owned());
        }
        rest = &rest[len..];
    }
    Some(roots)
}

/// Read every live process's temp roots. Files whose writer no longer
/// holds the lock are stale and removed.
pub fn read_temp_roots(temproots_dir: &Path) -> io::Result<BTreeSet<String>> {
    let mut roots = BTreeSet::new();
    let entries = match std::fs::read_dir(temproots_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(roots),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(_) => continue,
        };
        // If we can take the writer's lock, the owner is gone.
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(_stale) => {
                debug!(path = %path.display(), "pruning stale temp root file");
                let _ = std::fs::remove_file(&path);
                continue;
            }
            Err((file, nix::errno::Errno::EWOULDBLOCK)) => {
                let mut data = Vec::new();
                let mut file = file;
                if file.read_to_end(&mut data).is_ok() {
                    match parse_roots(&data) {
                        Some(parsed) => roots.extend(parsed),
                        None => {
                            debug!(path = %path.display(), "unreadable temp root file version");
                        }
                    }
                }
            }
            Err((_, errno)) => {
                return Err(io::Error::other(format!("locking temp root file: {errno}")));
            }
        }
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut roots = TempRoots::open(dir.path()).unwrap();
        roots.add("/nix/store/aaaa-one").unwrap();
        roots.add("/nix/store/bbbb-two").unwrap();

        let read = read_temp_roots(dir.path()).unwrap();
        assert!(read.contains("/nix/store/aaaa-one"));
        assert!(read.contains("/nix/store/bbbb-two"));
    }

    #[test]
    fn file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let file_path;
        {
            let roots = TempRoots::open(dir.path()).unwrap();
            file_path = roots.file_path().to_path_buf();
            assert!(file_path.exists());
        }
        assert!(!file_path.exists());
    }

    #[test]
    fn stale_files_pruned() {
        let dir = tempfile::tempdir().unwrap();
        // A file whose writer is long gone: just bytes on disk.
        let stale = dir.path().join("99999999");
        std::fs::write(&stale, [FORMAT_VERSION]).unwrap();

        let read = read_temp_roots(dir.path()).unwrap();
        assert!(read.is_empty());
        assert!(!stale.exists());
    }

    #[test]
    fn unknown_version_ignored() {
        let data = [0x7F, 1, 0, 0, 0, b'x'];
        assert_eq!(parse_roots(&data), None);
    }
}
