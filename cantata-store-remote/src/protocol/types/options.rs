// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::WireCtx;
use crate::serialization::{Deserialize, Serialize};

/// Per-connection options sent by `SetOptions`. Most fields are kept
/// for wire compatibility; the daemon honours the ones it understands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientOptions {
    pub keep_failed: bool,
    pub keep_going: bool,
    pub try_fallback: bool,
    pub verbosity: u64,
    pub max_build_jobs: u64,
    pub max_silent_time: u64,
    pub verbose_build: bool,
    pub build_cores: u64,
    pub use_substitutes: bool,
    /// Free-form overrides, `name → value`.
    pub overrides: BTreeMap<String, String>,
}

impl Serialize for ClientOptions {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        self.keep_failed.serialize(writer, ctx).await?;
        self.keep_going.serialize(writer, ctx).await?;
        self.try_fallback.serialize(writer, ctx).await?;
        self.verbosity.serialize(writer, ctx).await?;
        self.max_build_jobs.serialize(writer, ctx).await?;
        self.max_silent_time.serialize(writer, ctx).await?;
        // Obsolete useBuildHook.
        1u64.serialize(writer, ctx).await?;
        self.verbose_build.serialize(writer, ctx).await?;
        // Obsolete logType and printBuildTrace.
        0u64.serialize(writer, ctx).await?;
        0u64.serialize(writer, ctx).await?;
        self.build_cores.serialize(writer, ctx).await?;
        self.use_substitutes.serialize(writer, ctx).await?;
        (self.overrides.len() as u64).serialize(writer, ctx).await?;
        for (name, value) in &self.overrides {
            name.serialize(writer, ctx).await?;
            value.serialize(writer, ctx).await?;
        }
        Ok(())
    }
}

impl Deserialize for ClientOptions {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let keep_failed = bool::deserialize(reader, ctx).await?;
        let keep_going = bool::deserialize(reader, ctx).await?;
        let try_fallback = bool::deserialize(reader, ctx).await?;
        let verbosity = u64::deserialize(reader, ctx).await?;
        let max_build_jobs = u64::deserialize(reader, ctx).await?;
        let max_silent_time = u64::deserialize(reader, ctx).await?;
        let _use_build_hook = u64::deserialize(reader, ctx).await?;
        let verbose_build = bool::deserialize(reader, ctx).await?;
        let _log_type = u64::deserialize(reader, ctx).await?;
        let _print_build_trace = u64::deserialize(reader, ctx).await?;
        let build_cores = u64::deserialize(reader, ctx).await?;
        let use_substitutes = bool::deserialize(reader, ctx).await?;
        let count = u64::deserialize(reader, ctx).await?;
        let mut overrides = BTreeMap::new();
        for _ in 0..count {
            let name = String::deserialize(reader, ctx).await?;
            let value = String::deserialize(reader, ctx).await?;
            overrides.insert(name, value);
        }
        Ok(ClientOptions {
            keep_failed,
            keep_going,
            try_fallback,
            verbosity,
            max_build_jobs,
            max_silent_time,
            verbose_build,
            build_cores,
            use_substitutes,
            overrides,
        })
    }
}

#[cfg(test)]
mod tests {
    use cantata_store_core::StoreDir;
    use pretty_assertions::assert_eq;

    use crate::protocol::CURRENT_PROTOCOL_VERSION;

    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let ctx = WireCtx::new(CURRENT_PROTOCOL_VERSION, StoreDir::default());
        let options = ClientOptions {
            keep_failed: true,
            max_build_jobs: 4,
            use_substitutes: true,
            overrides: [("narinfo-cache-ttl".to_string(), "0".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let mut buf = Vec::new();
        options.serialize(&mut buf, &ctx).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(
            ClientOptions::deserialize(&mut reader, &ctx).await.unwrap(),
            options
        );
    }
}
