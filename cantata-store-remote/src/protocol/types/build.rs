// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use std::collections::BTreeMap;

use num_enum::TryFromPrimitive;
use tokio::io::{AsyncRead, AsyncWrite};

use cantata_store_core::realisation::{DrvOutput, Realisation};

use crate::error::ProtocolError;
use crate::protocol::{ProtocolVersion, WireCtx};
use crate::serialization::{Deserialize, Serialize};

/// How a build request treats already-valid outputs.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive)]
pub enum BuildMode {
    /// Skip the build if the outputs are valid.
    #[default]
    Normal = 0,
    /// Rebuild and re-register even if valid.
    Repair = 1,
    /// Rebuild and compare against the valid outputs without replacing
    /// them.
    Check = 2,
}

impl Serialize for BuildMode {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        (*self as u64).serialize(writer, ctx).await
    }
}

impl Deserialize for BuildMode {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let raw = u64::deserialize(reader, ctx).await?;
        BuildMode::try_from(raw)
            .map_err(|_| ProtocolError::invalid_field("buildMode", format!("unknown mode {raw}")))
    }
}

/// Outcome classification of a build.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive)]
pub enum BuildStatus {
    Built = 0,
    Substituted = 1,
    AlreadyValid = 2,
    PermanentFailure = 3,
    InputRejected = 4,
    OutputRejected = 5,
    /// Possibly transient.
    TransientFailure = 6,
    CachedFailure = 7,
    TimedOut = 8,
    #[default]
    MiscFailure = 9,
    DependencyFailed = 10,
    LogLimitExceeded = 11,
    NotDeterministic = 12,
}

impl BuildStatus {
    pub fn success(&self) -> bool {
        matches!(
            self,
            BuildStatus::Built | BuildStatus::Substituted | BuildStatus::AlreadyValid
        )
    }
}

/// Result of building one derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub error_msg: String,
    /// How many times this build was performed.
    pub times_built: u64,
    /// Whether repeated builds produced differing output.
    pub is_non_deterministic: bool,
    pub start_time: u64,
    pub stop_time: u64,
    /// Realisations of content-addressed outputs.
    pub built_outputs: BTreeMap<DrvOutput, Realisation>,
}

impl BuildResult {
    pub fn new(status: BuildStatus, error_msg: String) -> Self {
        BuildResult {
            status,
            error_msg,
            times_built: 0,
            is_non_deterministic: false,
            start_time: 0,
            stop_time: 0,
            built_outputs: BTreeMap::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// `builtOutputs` joined the result in protocol 1.28, the timing and
/// determinism fields in 1.29.
const TIMING_SINCE: ProtocolVersion = ProtocolVersion::from_parts(1, 29);
const OUTPUTS_SINCE: ProtocolVersion = ProtocolVersion::from_parts(1, 28);

impl Serialize for BuildResult {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        (self.status as u64).serialize(writer, ctx).await?;
        self.error_msg.serialize(writer, ctx).await?;
        if ctx.version >= TIMING_SINCE {
            self.times_built.serialize(writer, ctx).await?;
            self.is_non_deterministic.serialize(writer, ctx).await?;
            self.start_time.serialize(writer, ctx).await?;
            self.stop_time.serialize(writer, ctx).await?;
        }
        if ctx.version >= OUTPUTS_SINCE {
            (self.built_outputs.len() as u64).serialize(writer, ctx).await?;
            for (id, realisation) in &self.built_outputs {
                id.serialize(writer, ctx).await?;
                realisation.serialize(writer, ctx).await?;
            }
        }
        Ok(())
    }
}

impl Deserialize for BuildResult {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let raw = u64::deserialize(reader, ctx).await?;
        let status = BuildStatus::try_from(raw)
            .map_err(|_| ProtocolError::invalid_field("status", format!("unknown status {raw}")))?;
        let error_msg = String::deserialize(reader, ctx).await?;
        let mut result = BuildResult::new(status, error_msg);
        if ctx.version >= TIMING_SINCE {
            result.times_built = u64::deserialize(reader, ctx).await?;
            result.is_non_deterministic = bool::deserialize(reader, ctx).await?;
            result.start_time = u64::deserialize(reader, ctx).await?;
            result.stop_time = u64::deserialize(reader, ctx).await?;
        }
        if ctx.version >= OUTPUTS_SINCE {
            let count = u64::deserialize(reader, ctx).await?;
            for _ in 0..count {
                let id = DrvOutput::deserialize(reader, ctx).await?;
                let realisation = Realisation::deserialize(reader, ctx).await?;
                result.built_outputs.insert(id, realisation);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use cantata_store_core::StoreDir;
    use pretty_assertions::assert_eq;

    use super::*;

    fn ctx_at(minor: u8) -> WireCtx {
        WireCtx::new(ProtocolVersion::from_parts(1, minor), StoreDir::default())
    }

    #[tokio::test]
    async fn roundtrip_current() {
        let result = BuildResult {
            status: BuildStatus::Built,
            error_msg: String::new(),
            times_built: 1,
            is_non_deterministic: false,
            start_time: 100,
            stop_time: 200,
            built_outputs: BTreeMap::new(),
        };
        let ctx = ctx_at(35);
        let mut buf = Vec::new();
        result.serialize(&mut buf, &ctx).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(BuildResult::deserialize(&mut reader, &ctx).await.unwrap(), result);
    }

    /// Old clients only get the status and message; the rest is zeroed
    /// on read-back.
    #[tokio::test]
    async fn old_version_drops_new_fields() {
        let result = BuildResult {
            status: BuildStatus::TimedOut,
            error_msg: "took too long".into(),
            times_built: 5,
            is_non_deterministic: true,
            start_time: 100,
            stop_time: 200,
            built_outputs: BTreeMap::new(),
        };
        let ctx = ctx_at(27);
        let mut buf = Vec::new();
        result.serialize(&mut buf, &ctx).await.unwrap();
        // Just status + message on the wire.
        let mut reader = buf.as_slice();
        let parsed = BuildResult::deserialize(&mut reader, &ctx).await.unwrap();
        assert_eq!(parsed.status, BuildStatus::TimedOut);
        assert_eq!(parsed.error_msg, "took too long");
        assert_eq!(parsed.times_built, 0);
    }

    #[test]
    fn status_success() {
        assert!(BuildStatus::Built.success());
        assert!(BuildStatus::AlreadyValid.success());
        assert!(!BuildStatus::MiscFailure.success());
        assert!(!BuildStatus::OutputRejected.success());
    }
}
