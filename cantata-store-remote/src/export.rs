// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Closure export framing.
//!
//! A sequence of entries, each `1 nar magic path references deriver 0`,
//! terminated by a `0` word. Entries are closure-ordered (references
//! before referrers) so a linear import always produces a valid store.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tracing::trace;

use cantata_store_core::store_path::{StorePath, StorePathSet};
use cantata_utils_hash::{Algorithm, HashingReader, NarHash};

use crate::error::ProtocolError;
use crate::protocol::WireCtx;
use crate::serialization::{Deserialize, Serialize, read_opt_path, write_opt_path};

/// Magic separating the NAR from the entry's metadata (`NIXE`).
pub const EXPORT_MAGIC: u64 = 0x4558494e;

/// Write one export entry. `real_path` is the on-disk location of
/// `path`.
pub async fn export_path<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    ctx: &WireCtx,
    real_path: &Path,
    path: &StorePath,
    references: &StorePathSet,
    deriver: Option<&StorePath>,
) -> Result<(), ProtocolError> {
    1u64.serialize(writer, ctx).await?;
    cantata_nar::dump_path(real_path, writer)
        .await
        .map_err(|e| ProtocolError::custom(e.to_string()))?;
    EXPORT_MAGIC.serialize(writer, ctx).await?;
    path.serialize(writer, ctx).await?;
    references.serialize(writer, ctx).await?;
    write_opt_path(writer, ctx, deriver).await?;
    0u64.serialize(writer, ctx).await?;
    Ok(())
}

/// Terminate an export sequence.
pub async fn export_done<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    ctx: &WireCtx,
) -> Result<(), ProtocolError> {
    0u64.serialize(writer, ctx).await?;
    writer.flush().await?;
    Ok(())
}

/// One imported entry: the tree is already restored under `tree`, with
/// the NAR hash and size computed on the fly.
#[derive(Debug)]
pub struct ImportedEntry {
    pub path: StorePath,
    pub references: StorePathSet,
    pub deriver: Option<StorePath>,
    pub tree: PathBuf,
    pub nar_hash: NarHash,
    pub nar_size: u64,
}

/// Read an export sequence, restoring each NAR into a fresh directory
/// entry under `staging_dir`. Entries come back in stream order, i.e.
/// closure order.
pub async fn import_paths<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    ctx: &WireCtx,
    staging_dir: &Path,
) -> Result<Vec<ImportedEntry>, ProtocolError> {
    let mut entries = Vec::new();
    loop {
        let tag = u64::deserialize(reader, ctx).await?;
        match tag {
            0 => break,
            1 => {}
            other => {
                return Err(ProtocolError::invalid_field(
                    "export",
                    format!("bad entry tag {other}"),
                ));
            }
        }

        let tree = staging_dir.join(format!("import-{}", entries.len()));
        let (mut hashing, state) = HashingReader::new(&mut *reader, Algorithm::SHA256);
        cantata_nar::restore_path(&mut hashing, &tree)
            .await
            .map_err(|e| ProtocolError::custom(format!("restoring imported NAR: {e}")))?;
        drop(hashing);
        let state = std::sync::Arc::try_unwrap(state)
            .map_err(|_| ProtocolError::custom("hash state still shared"))?
            .into_inner()
            .map_err(|_| ProtocolError::custom("hash state poisoned"))?;
        let nar_size = state.bytes_read;
        let nar_hash = NarHash::try_from(state.finish())
            .map_err(|e| ProtocolError::custom(e.to_string()))?;

        let magic = u64::deserialize(reader, ctx).await?;
        if magic != EXPORT_MAGIC {
            return Err(ProtocolError::InvalidMagic {
                expected: EXPORT_MAGIC,
                actual: magic,
            });
        }
        let path = StorePath::deserialize(reader, ctx).await?;
        let references = StorePathSet::deserialize(reader, ctx).await?;
        let deriver = read_opt_path(reader, ctx).await?;
        let end = u64::deserialize(reader, ctx).await?;
        if end != 0 {
            return Err(ProtocolError::invalid_field(
                "export",
                format!("bad entry terminator {end}"),
            ));
        }
        trace!(%path, nar_size, "imported entry");
        entries.push(ImportedEntry {
            path,
            references,
            deriver,
            tree,
            nar_hash,
            nar_size,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use cantata_store_core::StoreDir;

    use crate::protocol::CURRENT_PROTOCOL_VERSION;

    use super::*;

    fn ctx() -> WireCtx {
        WireCtx::new(CURRENT_PROTOCOL_VERSION, StoreDir::default())
    }

    #[tokio::test]
    async fn export_import_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("file"), b"contents").unwrap();

        let path: StorePath = "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-thing".parse().unwrap();
        let dep: StorePath = "0sbwqgpi6jbqr710w5vn0b4s5w6z8n8n-dep".parse().unwrap();
        let references: StorePathSet = [dep.clone()].into_iter().collect();

        let mut buf = Vec::new();
        export_path(&mut buf, &ctx(), &src, &path, &references, None)
            .await
            .unwrap();
        export_done(&mut buf, &ctx()).await.unwrap();

        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        let mut reader = buf.as_slice();
        let entries = import_paths(&mut reader, &ctx(), &staging).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.path, path);
        assert!(entry.references.contains(&dep));
        assert_eq!(entry.deriver, None);
        assert_eq!(
            std::fs::read(entry.tree.join("file")).unwrap(),
            b"contents"
        );
        assert!(entry.nar_size > 0);
    }

    #[tokio::test]
    async fn bad_magic_fails() {
        let mut buf = Vec::new();
        1u64.serialize(&mut buf, &ctx()).await.unwrap();
        // A valid single-file NAR, then a wrong magic.
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        cantata_nar::dump_path(&file, &mut buf).await.unwrap();
        0xdeadbeefu64.serialize(&mut buf, &ctx()).await.unwrap();

        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        let mut reader = buf.as_slice();
        assert!(matches!(
            import_paths(&mut reader, &ctx(), &staging).await,
            Err(ProtocolError::InvalidMagic { .. })
        ));
    }
}
