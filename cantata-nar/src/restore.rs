// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Restoring a filesystem tree from a NAR.
//!
//! The restorer rejects malformed archives (bad magic, unknown node
//! types, oversized tokens, unsorted or duplicate directory entries) and
//! writes canonical metadata: files 0444 or 0555, directories 0555,
//! mtimes at epoch + 1.

use std::ffi::OsStr;
use std::future::Future;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::pin::Pin;

use nix::sys::stat::UtimensatFlags;
use nix::sys::time::TimeSpec;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};

use crate::wire::{expect_token, read_padding, read_token, read_u64};
use crate::{MAX_NAME_LEN, MAX_TARGET_LEN, NAR_VERSION_MAGIC, NarError};

const FILE_CHUNK: usize = 64 * 1024;

/// Restore the NAR read from `reader` to a fresh path `dest`.
///
/// `dest` must not exist yet; its parent must.
pub async fn restore_path<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    dest: &Path,
) -> Result<(), NarError> {
    let magic = read_token(reader, 64).await?;
    if magic != NAR_VERSION_MAGIC {
        return Err(NarError::BadMagic);
    }
    restore_node(reader, dest).await
}

fn restore_node<'a, R: AsyncRead + Unpin + Send>(
    reader: &'a mut R,
    dest: &'a Path,
) -> Pin<Box<dyn Future<Output = Result<(), NarError>> + Send + 'a>> {
    Box::pin(async move {
        expect_token(reader, b"(").await?;
        expect_token(reader, b"type").await?;
        let node_type = read_token(reader, 64).await?;
        match node_type.as_slice() {
            b"regular" => {
                let mut tag = read_token(reader, 64).await?;
                let executable = tag == b"executable";
                if executable {
                    expect_token(reader, b"").await?;
                    tag = read_token(reader, 64).await?;
                }
                if tag != b"contents" {
                    return Err(NarError::UnexpectedToken {
                        expected: "contents".into(),
                        got: String::from_utf8_lossy(&tag).into_owned(),
                    });
                }
                restore_contents(reader, dest, executable).await?;
                expect_token(reader, b")").await?;
            }
            b"symlink" => {
                expect_token(reader, b"target").await?;
                let target = read_token(reader, MAX_TARGET_LEN as u64).await?;
                fs::symlink(OsStr::from_bytes(&target), dest).await?;
                set_epoch_mtime(dest, true)?;
                expect_token(reader, b")").await?;
            }
            b"directory" => {
                fs::create_dir(dest).await?;
                let mut previous: Option<Vec<u8>> = None;
                loop {
                    let token = read_token(reader, 64).await?;
                    match token.as_slice() {
                        b")" => break,
                        b"entry" => {
                            expect_token(reader, b"(").await?;
                            expect_token(reader, b"name").await?;
                            let name = read_token(reader, MAX_NAME_LEN as u64).await?;
                            validate_entry_name(&name)?;
                            if let Some(prev) = &previous {
                                match prev.as_slice().cmp(name.as_slice()) {
                                    std::cmp::Ordering::Less => {}
                                    std::cmp::Ordering::Equal => {
                                        return Err(NarError::DuplicateEntry(
                                            String::from_utf8_lossy(&name).into_owned(),
                                        ));
                                    }
                                    std::cmp::Ordering::Greater => {
                                        return Err(NarError::UnsortedEntry(
                                            String::from_utf8_lossy(&name).into_owned(),
                                        ));
                                    }
                                }
                            }
                            previous = Some(name.clone());
                            expect_token(reader, b"node").await?;
                            restore_node(reader, &dest.join(OsStr::from_bytes(&name))).await?;
                            expect_token(reader, b")").await?;
                        }
                        other => {
                            return Err(NarError::UnexpectedToken {
                                expected: "entry or )".into(),
                                got: String::from_utf8_lossy(other).into_owned(),
                            });
                        }
                    }
                }
                // Children are in place; lock the directory down.
                fs::set_permissions(dest, std::fs::Permissions::from_mode(0o555)).await?;
                set_epoch_mtime(dest, false)?;
            }
            other => {
                return Err(NarError::UnknownNodeType(
                    String::from_utf8_lossy(other).into_owned(),
                ));
            }
        }
        Ok(())
    })
}

async fn restore_contents<R: AsyncRead + Unpin>(
    reader: &mut R,
    dest: &Path,
    executable: bool,
) -> Result<(), NarError> {
    let len = read_u64(reader).await?;
    let mut file = fs::File::create(dest).await?;
    let mut remaining = len;
    let mut buf = vec![0u8; FILE_CHUNK];
    while remaining > 0 {
        let chunk = remaining.min(FILE_CHUNK as u64) as usize;
        reader.read_exact(&mut buf[..chunk]).await?;
        file.write_all(&buf[..chunk]).await?;
        remaining -= chunk as u64;
    }
    file.flush().await?;
    drop(file);
    read_padding(reader, len).await?;

    let mode = if executable { 0o555 } else { 0o444 };
    fs::set_permissions(dest, std::fs::Permissions::from_mode(mode)).await?;
    set_epoch_mtime(dest, false)?;
    Ok(())
}

/// Set atime/mtime to epoch + 1 second.
fn set_epoch_mtime(path: &Path, is_symlink: bool) -> Result<(), NarError> {
    let ts = TimeSpec::new(1, 0);
    let flags = if is_symlink {
        UtimensatFlags::NoFollowSymlink
    } else {
        UtimensatFlags::FollowSymlink
    };
    nix::sys::stat::utimensat(nix::fcntl::AT_FDCWD, path, &ts, &ts, flags)
        .map_err(|errno| NarError::Io(std::io::Error::from(errno)))?;
    Ok(())
}

fn validate_entry_name(name: &[u8]) -> Result<(), NarError> {
    if name.is_empty()
        || name == b"."
        || name == b".."
        || name.contains(&b'/')
        || name.contains(&0)
    {
        return Err(NarError::InvalidEntryName(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt as _;

    use crate::dump_path;

    use super::*;

    async fn roundtrip(src: &Path, dest: &Path) {
        let mut nar = Vec::new();
        dump_path(src, &mut nar).await.unwrap();
        let mut reader = nar.as_slice();
        restore_path(&mut reader, dest).await.unwrap();
    }

    #[tokio::test]
    async fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::write(&src, b"payload").unwrap();

        let dest = dir.path().join("dest");
        roundtrip(&src, &dest).await;

        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        let meta = std::fs::metadata(&dest).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o444);
        assert_eq!(meta.mtime(), 1);
    }

    #[tokio::test]
    async fn tree_roundtrip_and_renormalization() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("a"), b"A").unwrap();
        std::fs::create_dir(src.join("sub")).unwrap();
        std::fs::write(src.join("sub").join("b"), b"B").unwrap();
        std::os::unix::fs::symlink("a", src.join("link")).unwrap();

        let dest = dir.path().join("dest");
        roundtrip(&src, &dest).await;

        assert_eq!(std::fs::read(dest.join("a")).unwrap(), b"A");
        assert_eq!(std::fs::read(dest.join("sub/b")).unwrap(), b"B");
        assert_eq!(
            std::fs::read_link(dest.join("link")).unwrap(),
            std::path::PathBuf::from("a")
        );
        let meta = std::fs::metadata(&dest).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o555);

        // Re-dumping the restored tree yields identical bytes.
        let mut first = Vec::new();
        dump_path(&src, &mut first).await.unwrap();
        let mut second = Vec::new();
        dump_path(&dest, &mut second).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn executable_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("script");
        std::fs::write(&src, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dest = dir.path().join("dest");
        roundtrip(&src, &dest).await;
        let meta = std::fs::metadata(&dest).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o555);
    }

    #[tokio::test]
    async fn bad_magic_rejected() {
        let mut nar = Vec::new();
        crate::wire::write_token(&mut nar, b"not-an-archive").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut reader = nar.as_slice();
        assert!(matches!(
            restore_path(&mut reader, &dir.path().join("x")).await,
            Err(NarError::BadMagic)
        ));
    }

    #[tokio::test]
    async fn unknown_type_rejected() {
        let mut nar = Vec::new();
        for token in [b"nix-archive-1".as_slice(), b"(", b"type", b"socket"] {
            crate::wire::write_token(&mut nar, token).await.unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let mut reader = nar.as_slice();
        assert!(matches!(
            restore_path(&mut reader, &dir.path().join("x")).await,
            Err(NarError::UnknownNodeType(_))
        ));
    }

    #[tokio::test]
    async fn unsorted_entries_rejected() {
        // Hand-build a directory NAR with entries out of order.
        let mut nar = Vec::new();
        for token in [
            b"nix-archive-1".as_slice(),
            b"(",
            b"type",
            b"directory",
        ] {
            crate::wire::write_token(&mut nar, token).await.unwrap();
        }
        for name in [b"zebra".as_slice(), b"alpha"] {
            for token in [b"entry".as_slice(), b"(", b"name", name, b"node", b"(", b"type", b"symlink", b"target", b"x", b")", b")"] {
                crate::wire::write_token(&mut nar, token).await.unwrap();
            }
        }
        crate::wire::write_token(&mut nar, b")").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut reader = nar.as_slice();
        assert!(matches!(
            restore_path(&mut reader, &dir.path().join("x")).await,
            Err(NarError::UnsortedEntry(_))
        ));
    }
}
