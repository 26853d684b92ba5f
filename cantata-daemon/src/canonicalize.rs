// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Metadata canonicalization for store objects.
//!
//! Regular files end up 0444 (0555 when executable), directories 0555,
//! every mtime at epoch + 1 and, when running as root, ownership at
//! 0:0. Symlink targets are left alone; only the link's own timestamp
//! is touched.

use std::io;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use nix::sys::stat::UtimensatFlags;
use nix::sys::time::TimeSpec;
use nix::unistd::{Gid, Uid, geteuid};

fn set_epoch_timestamp(path: &Path, is_symlink: bool) -> io::Result<()> {
    let ts = TimeSpec::new(1, 0);
    let flags = if is_symlink {
        UtimensatFlags::NoFollowSymlink
    } else {
        UtimensatFlags::FollowSymlink
    };
    nix::sys::stat::utimensat(nix::fcntl::AT_FDCWD, path, &ts, &ts, flags)
        .map_err(|errno| io::Error::from(errno))
}

fn chown_to_root(path: &Path) -> io::Result<()> {
    if !geteuid().is_root() {
        return Ok(());
    }
    nix::unistd::fchownat(
        nix::fcntl::AT_FDCWD,
        path,
        Some(Uid::from_raw(0)),
        Some(Gid::from_raw(0)),
        nix::fcntl::AtFlags::AT_SYMLINK_NOFOLLOW,
    )
    .map_err(|errno| io::Error::from(errno))
}

/// Canonicalize everything under `path`, recursively.
pub fn canonicalize_path_metadata(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        chown_to_root(path)?;
        set_epoch_timestamp(path, true)?;
        return Ok(());
    }

    if file_type.is_dir() {
        // Children first: the directory goes read-only at the end.
        for entry in std::fs::read_dir(path)? {
            canonicalize_path_metadata(&entry?.path())?;
        }
        chown_to_root(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o555))?;
        set_epoch_timestamp(path, false)?;
        return Ok(());
    }

    let executable = meta.permissions().mode() & 0o111 != 0;
    let mode = if executable { 0o555 } else { 0o444 };
    chown_to_root(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    set_epoch_timestamp(path, false)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt as _;

    use super::*;

    #[test]
    fn canonicalizes_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("out");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("plain"), b"x").unwrap();
        std::fs::write(root.join("script"), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(
            &root.join("script"),
            std::fs::Permissions::from_mode(0o777),
        )
        .unwrap();
        std::os::unix::fs::symlink("plain", root.join("link")).unwrap();

        canonicalize_path_metadata(&root).unwrap();

        let plain = std::fs::metadata(root.join("plain")).unwrap();
        assert_eq!(plain.mode() & 0o7777, 0o444);
        assert_eq!(plain.mtime(), 1);

        let script = std::fs::metadata(root.join("script")).unwrap();
        assert_eq!(script.mode() & 0o7777, 0o555);

        let dir_meta = std::fs::metadata(&root).unwrap();
        assert_eq!(dir_meta.mode() & 0o7777, 0o555);
        assert_eq!(dir_meta.mtime(), 1);
    }
}
