// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Serializing a filesystem tree into a NAR.

use std::future::Future;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::MetadataExt as _;
use std::path::Path;
use std::pin::Pin;

use tokio::fs;
use tokio::io::{AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::wire::{ZEROS, padding_len, write_token, write_u64};
use crate::{NAR_VERSION_MAGIC, NarError};

const FILE_CHUNK: usize = 64 * 1024;

/// Dump the tree rooted at `path` as a NAR into `writer`.
///
/// Returns the number of bytes written. Directory entries are visited in
/// byte-lexicographic order; hardlinked files are dumped as independent
/// copies; only the executable bit of regular files survives.
pub async fn dump_path<W: AsyncWrite + Unpin + Send>(
    path: &Path,
    writer: &mut W,
) -> Result<u64, NarError> {
    let mut written = write_token(writer, NAR_VERSION_MAGIC).await?;
    written += dump_node(path, writer).await?;
    writer.flush().await?;
    Ok(written)
}

fn dump_node<'a, W: AsyncWrite + Unpin + Send>(
    path: &'a Path,
    writer: &'a mut W,
) -> Pin<Box<dyn Future<Output = Result<u64, NarError>> + Send + 'a>> {
    Box::pin(async move {
        let meta = fs::symlink_metadata(path).await?;
        let mut written = write_token(writer, b"(").await?;
        written += write_token(writer, b"type").await?;

        if meta.file_type().is_symlink() {
            written += write_token(writer, b"symlink").await?;
            written += write_token(writer, b"target").await?;
            let target = fs::read_link(path).await?;
            written += write_token(writer, target.as_os_str().as_bytes()).await?;
        } else if meta.file_type().is_file() {
            written += write_token(writer, b"regular").await?;
            if meta.mode() & 0o100 != 0 {
                written += write_token(writer, b"executable").await?;
                written += write_token(writer, b"").await?;
            }
            written += write_token(writer, b"contents").await?;
            written += dump_contents(path, meta.len(), writer).await?;
        } else if meta.file_type().is_dir() {
            written += write_token(writer, b"directory").await?;

            let mut entries = Vec::new();
            let mut dir = fs::read_dir(path).await?;
            while let Some(entry) = dir.next_entry().await? {
                entries.push(entry.file_name());
            }
            entries.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

            for name in entries {
                written += write_token(writer, b"entry").await?;
                written += write_token(writer, b"(").await?;
                written += write_token(writer, b"name").await?;
                written += write_token(writer, name.as_bytes()).await?;
                written += write_token(writer, b"node").await?;
                written += dump_node(&path.join(&name), writer).await?;
                written += write_token(writer, b")").await?;
            }
        } else {
            return Err(NarError::UnsupportedFileType(path.to_path_buf()));
        }

        written += write_token(writer, b")").await?;
        Ok(written)
    })
}

/// Stream a regular file's contents as one token.
///
/// The length is taken from the metadata; a file that changes size while
/// being dumped yields an error rather than a corrupt archive.
async fn dump_contents<W: AsyncWrite + Unpin>(
    path: &Path,
    expected_len: u64,
    writer: &mut W,
) -> Result<u64, NarError> {
    let mut written = write_u64(writer, expected_len).await?;
    let mut file = fs::File::open(path).await?;
    let mut buf = vec![0u8; FILE_CHUNK];
    let mut copied: u64 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        copied += n as u64;
        if copied > expected_len {
            return Err(std::io::Error::other(format!(
                "file '{}' grew while being archived",
                path.display()
            ))
            .into());
        }
        writer.write_all(&buf[..n]).await?;
    }
    if copied != expected_len {
        return Err(std::io::Error::other(format!(
            "file '{}' shrank while being archived",
            path.display()
        ))
        .into());
    }
    written += copied;
    let pad = padding_len(copied);
    if pad > 0 {
        writer.write_all(&ZEROS[..pad]).await?;
        written += pad as u64;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt as _;

    use cantata_utils_hash::{Algorithm, HashSink};

    use super::*;

    #[tokio::test]
    async fn single_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello");
        std::fs::write(&file, b"hello\n").unwrap();

        let mut nar = Vec::new();
        let written = dump_path(&file, &mut nar).await.unwrap();
        assert_eq!(written, nar.len() as u64);

        // magic, "(", "type", "regular", "contents", contents, ")"
        let mut expected = Vec::new();
        for token in [
            b"nix-archive-1".as_slice(),
            b"(",
            b"type",
            b"regular",
            b"contents",
            b"hello\n",
            b")",
        ] {
            write_token(&mut expected, token).await.unwrap();
        }
        assert_eq!(nar, expected);
        assert_eq!(nar.len(), 120);
    }

    #[tokio::test]
    async fn executable_bit_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("script");
        std::fs::write(&file, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut nar = Vec::new();
        dump_path(&file, &mut nar).await.unwrap();
        let text = String::from_utf8_lossy(&nar);
        assert!(text.contains("executable"));
    }

    #[tokio::test]
    async fn directory_entries_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("zebra"), b"z").unwrap();
        std::fs::write(root.join("alpha"), b"a").unwrap();
        std::fs::create_dir(root.join("mid")).unwrap();

        let mut nar = Vec::new();
        dump_path(&root, &mut nar).await.unwrap();
        let text = String::from_utf8_lossy(&nar).into_owned();
        let alpha = text.find("alpha").unwrap();
        let mid = text.find("mid").unwrap();
        let zebra = text.find("zebra").unwrap();
        assert!(alpha < mid && mid < zebra);
    }

    #[tokio::test]
    async fn equal_trees_hash_equal() {
        let make_tree = |base: &Path| {
            std::fs::create_dir(base).unwrap();
            std::fs::write(base.join("data"), b"payload").unwrap();
            std::os::unix::fs::symlink("data", base.join("link")).unwrap();
        };
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        make_tree(&a);
        make_tree(&b);

        let mut sink_a = HashSink::new(Algorithm::SHA256);
        dump_path(&a, &mut sink_a).await.unwrap();
        let mut sink_b = HashSink::new(Algorithm::SHA256);
        dump_path(&b, &mut sink_b).await.unwrap();
        assert_eq!(sink_a.finish(), sink_b.finish());
    }

    #[tokio::test]
    async fn symlink_target_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("/nowhere/in/particular", &link).unwrap();

        let mut nar = Vec::new();
        dump_path(&link, &mut nar).await.unwrap();
        let text = String::from_utf8_lossy(&nar);
        assert!(text.contains("symlink"));
        assert!(text.contains("/nowhere/in/particular"));
    }
}
