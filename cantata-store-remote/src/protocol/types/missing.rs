// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use tokio::io::{AsyncRead, AsyncWrite};

use cantata_store_core::store_path::StorePathSet;

use crate::error::ProtocolError;
use crate::protocol::WireCtx;
use crate::serialization::{Deserialize, Serialize};

/// Reply to `QueryMissing`: what a build request would have to do.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Missing {
    pub will_build: StorePathSet,
    pub will_substitute: StorePathSet,
    pub unknown: StorePathSet,
    /// Estimated compressed download size for the substitutions.
    pub download_size: u64,
    /// Total NAR size of the substitutions.
    pub nar_size: u64,
}

impl Serialize for Missing {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        self.will_build.serialize(writer, ctx).await?;
        self.will_substitute.serialize(writer, ctx).await?;
        self.unknown.serialize(writer, ctx).await?;
        self.download_size.serialize(writer, ctx).await?;
        self.nar_size.serialize(writer, ctx).await?;
        Ok(())
    }
}

impl Deserialize for Missing {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        Ok(Missing {
            will_build: StorePathSet::deserialize(reader, ctx).await?,
            will_substitute: StorePathSet::deserialize(reader, ctx).await?,
            unknown: StorePathSet::deserialize(reader, ctx).await?,
            download_size: u64::deserialize(reader, ctx).await?,
            nar_size: u64::deserialize(reader, ctx).await?,
        })
    }
}
