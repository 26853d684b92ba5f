// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use num_enum::TryFromPrimitive;
use tokio::io::{AsyncRead, AsyncWrite};

use cantata_store_core::store_path::StorePathSet;

use crate::error::ProtocolError;
use crate::protocol::WireCtx;
use crate::serialization::{Deserialize, Serialize};

/// What a garbage collection run should do.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum GcAction {
    /// Report the paths reachable from the roots.
    ReturnLive = 0,
    /// Report the paths not reachable from the roots.
    ReturnDead = 1,
    /// Delete the unreachable paths.
    DeleteDead = 2,
    /// Delete the given paths, if dead.
    DeleteSpecific = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcOptions {
    pub action: GcAction,
    /// Skip the liveness check (the in-store referrer check still
    /// applies).
    pub ignore_liveness: bool,
    /// For [`GcAction::DeleteSpecific`].
    pub paths_to_delete: StorePathSet,
    /// Stop once at least this many bytes were freed; 0 means no limit.
    pub max_freed: u64,
}

impl GcOptions {
    pub fn delete_dead() -> Self {
        GcOptions {
            action: GcAction::DeleteDead,
            ignore_liveness: false,
            paths_to_delete: StorePathSet::new(),
            max_freed: 0,
        }
    }

    pub fn delete_specific(paths: StorePathSet) -> Self {
        GcOptions {
            action: GcAction::DeleteSpecific,
            ignore_liveness: false,
            paths_to_delete: paths,
            max_freed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GcResult {
    /// Live/dead/deleted paths, depending on the action. Rendered as
    /// full path strings; dead entries may already be gone from disk.
    pub paths: Vec<String>,
    pub bytes_freed: u64,
}

impl Serialize for GcOptions {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        (self.action as u64).serialize(writer, ctx).await?;
        self.paths_to_delete.serialize(writer, ctx).await?;
        self.ignore_liveness.serialize(writer, ctx).await?;
        self.max_freed.serialize(writer, ctx).await?;
        // Three obsolete fields.
        0u64.serialize(writer, ctx).await?;
        0u64.serialize(writer, ctx).await?;
        0u64.serialize(writer, ctx).await?;
        Ok(())
    }
}

impl Deserialize for GcOptions {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let raw = u64::deserialize(reader, ctx).await?;
        let action = GcAction::try_from(raw)
            .map_err(|_| ProtocolError::invalid_field("gcAction", format!("unknown action {raw}")))?;
        let paths_to_delete = StorePathSet::deserialize(reader, ctx).await?;
        let ignore_liveness = bool::deserialize(reader, ctx).await?;
        let max_freed = u64::deserialize(reader, ctx).await?;
        let _obsolete1 = u64::deserialize(reader, ctx).await?;
        let _obsolete2 = u64::deserialize(reader, ctx).await?;
        let _obsolete3 = u64::deserialize(reader, ctx).await?;
        Ok(GcOptions {
            action,
            ignore_liveness,
            paths_to_delete,
            max_freed,
        })
    }
}

impl Serialize for GcResult {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        self.paths.serialize(writer, ctx).await?;
        self.bytes_freed.serialize(writer, ctx).await?;
        // Obsolete field.
        0u64.serialize(writer, ctx).await?;
        Ok(())
    }
}

impl Deserialize for GcResult {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let paths = Vec::<String>::deserialize(reader, ctx).await?;
        let bytes_freed = u64::deserialize(reader, ctx).await?;
        let _obsolete = u64::deserialize(reader, ctx).await?;
        Ok(GcResult { paths, bytes_freed })
    }
}

#[cfg(test)]
mod tests {
    use cantata_store_core::StoreDir;
    use pretty_assertions::assert_eq;

    use crate::protocol::CURRENT_PROTOCOL_VERSION;

    use super::*;

    fn ctx() -> WireCtx {
        WireCtx::new(CURRENT_PROTOCOL_VERSION, StoreDir::default())
    }

    #[tokio::test]
    async fn options_roundtrip() {
        let mut paths = StorePathSet::new();
        paths.insert("00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-dead".parse().unwrap());
        let options = GcOptions {
            action: GcAction::DeleteSpecific,
            ignore_liveness: true,
            paths_to_delete: paths,
            max_freed: 1 << 30,
        };
        let mut buf = Vec::new();
        options.serialize(&mut buf, &ctx()).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(GcOptions::deserialize(&mut reader, &ctx()).await.unwrap(), options);
    }

    #[tokio::test]
    async fn result_roundtrip() {
        let result = GcResult {
            paths: vec!["/nix/store/00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-dead".into()],
            bytes_freed: 4096,
        };
        let mut buf = Vec::new();
        result.serialize(&mut buf, &ctx()).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(GcResult::deserialize(&mut reader, &ctx()).await.unwrap(), result);
    }
}
