// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Daemon protocol client.
//!
//! Connects to a daemon (or any store speaking the protocol; this is
//! also the substituter interface), performs the handshake, and exposes
//! the operations. Between request and reply the server may pump
//! stderr frames; they are routed to `tracing` and an error frame
//! terminates the request as [`ProtocolError::Remote`].

use std::collections::BTreeMap;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader, BufWriter};
use tokio::net::UnixStream;
use tracing::{debug, trace};

use cantata_store_core::derivation::BasicDerivation;
use cantata_store_core::derived_path::{DerivedPath, OutputName};
use cantata_store_core::realisation::Realisation;
use cantata_store_core::store_path::{StorePath, StorePathSet};
use cantata_store_core::StoreDir;
use cantata_utils_hash::{Algorithm, HashingReader, NarHash};

use crate::error::ProtocolError;
use crate::framed::FramedSink;
use crate::protocol::types::{BuildMode, BuildResult, ClientOptions, GcOptions, GcResult, Missing};
use crate::protocol::{
    CURRENT_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, Msg, OpCode, ProtocolVersion, WORKER_MAGIC_1,
    WORKER_MAGIC_2, WireCtx,
};
use crate::serialization::{Deserialize, Serialize, UnkeyedPathInfo, read_opt_path, write_opt_path};

/// How far the remote side trusts us, from the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    Unknown,
    Trusted,
    NotTrusted,
}

pub struct DaemonClient<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    ctx: WireCtx,
    daemon_version: String,
    trust: TrustLevel,
}

impl DaemonClient<tokio::net::unix::OwnedReadHalf, tokio::net::unix::OwnedWriteHalf> {
    /// Connect to a daemon over its Unix socket.
    pub async fn connect(
        socket: &Path,
        store_dir: StoreDir,
    ) -> Result<Self, ProtocolError> {
        let stream = UnixStream::connect(socket).await?;
        let (read_half, write_half) = stream.into_split();
        Self::handshake(read_half, write_half, store_dir).await
    }
}

impl<R, W> DaemonClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Perform the client side of the handshake over an established
    /// transport.
    pub async fn handshake(
        reader: R,
        writer: W,
        store_dir: StoreDir,
    ) -> Result<Self, ProtocolError> {
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);
        let bootstrap = WireCtx::new(CURRENT_PROTOCOL_VERSION, store_dir.clone());

        WORKER_MAGIC_1.serialize(&mut writer, &bootstrap).await?;
        writer.flush().await?;

        let magic = u64::deserialize(&mut reader, &bootstrap).await?;
        if magic != WORKER_MAGIC_2 {
            return Err(ProtocolError::InvalidMagic {
                expected: WORKER_MAGIC_2,
                actual: magic,
            });
        }
        let server_version = ProtocolVersion::from(u64::deserialize(&mut reader, &bootstrap).await?);
        let version = server_version.min(CURRENT_PROTOCOL_VERSION);
        if version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                client: server_version,
                min: MIN_PROTOCOL_VERSION,
            });
        }
        u64::from(CURRENT_PROTOCOL_VERSION)
            .serialize(&mut writer, &bootstrap)
            .await?;
        let ctx = WireCtx::new(version, store_dir);

        // Obsolete CPU affinity and reserve-space fields.
        false.serialize(&mut writer, &ctx).await?;
        false.serialize(&mut writer, &ctx).await?;
        writer.flush().await?;

        let daemon_version = if version >= ProtocolVersion::from_parts(1, 33) {
            String::deserialize(&mut reader, &ctx).await?
        } else {
            String::new()
        };
        let trust = if version >= ProtocolVersion::from_parts(1, 35) {
            match u64::deserialize(&mut reader, &ctx).await? {
                1 => TrustLevel::Trusted,
                2 => TrustLevel::NotTrusted,
                _ => TrustLevel::Unknown,
            }
        } else {
            TrustLevel::Unknown
        };
        debug!(version = %version, daemon = %daemon_version, ?trust, "connected");

        Ok(DaemonClient {
            reader,
            writer,
            ctx,
            daemon_version,
            trust,
        })
    }

    pub fn version(&self) -> ProtocolVersion {
        self.ctx.version
    }

    pub fn daemon_version(&self) -> &str {
        &self.daemon_version
    }

    pub fn trust(&self) -> TrustLevel {
        self.trust
    }

    async fn write_op(&mut self, op: OpCode) -> Result<(), ProtocolError> {
        (op as u64).serialize(&mut self.writer, &self.ctx).await
    }

    /// Drain stderr frames until `Last`; an error frame fails the
    /// request.
    async fn process_stderr(&mut self) -> Result<(), ProtocolError> {
        self.writer.flush().await?;
        loop {
            let code = u64::deserialize(&mut self.reader, &self.ctx).await?;
            let msg = Msg::from_u64(code).ok_or(ProtocolError::InvalidMsgCode(code))?;
            match msg {
                Msg::Last => return Ok(()),
                Msg::Next | Msg::Write => {
                    let line = Vec::<u8>::deserialize(&mut self.reader, &self.ctx).await?;
                    trace!("daemon: {}", String::from_utf8_lossy(&line));
                }
                Msg::Read => {
                    // The daemon wants input; this client never streams
                    // request bodies this way.
                    let _len = u64::deserialize(&mut self.reader, &self.ctx).await?;
                    return Err(ProtocolError::Unsupported("stderr read request"));
                }
                Msg::Error => return Err(self.read_error_frame().await?),
                Msg::StartActivity => {
                    if self.ctx.version >= ProtocolVersion::from_parts(1, 20) {
                        let _id = u64::deserialize(&mut self.reader, &self.ctx).await?;
                        let _level = u64::deserialize(&mut self.reader, &self.ctx).await?;
                        let _activity = u64::deserialize(&mut self.reader, &self.ctx).await?;
                        let text = Vec::<u8>::deserialize(&mut self.reader, &self.ctx).await?;
                        self.skip_fields().await?;
                        let _parent = u64::deserialize(&mut self.reader, &self.ctx).await?;
                        trace!("daemon activity: {}", String::from_utf8_lossy(&text));
                    } else {
                        let line = Vec::<u8>::deserialize(&mut self.reader, &self.ctx).await?;
                        trace!("daemon: {}", String::from_utf8_lossy(&line));
                    }
                }
                Msg::StopActivity => {
                    let _id = u64::deserialize(&mut self.reader, &self.ctx).await?;
                }
                Msg::Result => {
                    let _id = u64::deserialize(&mut self.reader, &self.ctx).await?;
                    let _kind = u64::deserialize(&mut self.reader, &self.ctx).await?;
                    self.skip_fields().await?;
                }
            }
        }
    }

    async fn skip_fields(&mut self) -> Result<(), ProtocolError> {
        let count = u64::deserialize(&mut self.reader, &self.ctx).await?;
        for _ in 0..count {
            match u64::deserialize(&mut self.reader, &self.ctx).await? {
                0 => {
                    let _int = u64::deserialize(&mut self.reader, &self.ctx).await?;
                }
                _ => {
                    let _string = Vec::<u8>::deserialize(&mut self.reader, &self.ctx).await?;
                }
            }
        }
        Ok(())
    }

    async fn read_error_frame(&mut self) -> Result<ProtocolError, ProtocolError> {
        if self.ctx.version >= ProtocolVersion::from_parts(1, 26) {
            let _kind = String::deserialize(&mut self.reader, &self.ctx).await?;
            let _level = u64::deserialize(&mut self.reader, &self.ctx).await?;
            let _name = String::deserialize(&mut self.reader, &self.ctx).await?;
            let message = String::deserialize(&mut self.reader, &self.ctx).await?;
            let _have_pos = u64::deserialize(&mut self.reader, &self.ctx).await?;
            let traces = u64::deserialize(&mut self.reader, &self.ctx).await?;
            for _ in 0..traces {
                let _have_pos = u64::deserialize(&mut self.reader, &self.ctx).await?;
                let _trace = String::deserialize(&mut self.reader, &self.ctx).await?;
            }
            Ok(ProtocolError::Remote(message))
        } else {
            let message = String::deserialize(&mut self.reader, &self.ctx).await?;
            let _status = u64::deserialize(&mut self.reader, &self.ctx).await?;
            Ok(ProtocolError::Remote(message))
        }
    }

    pub async fn set_options(&mut self, options: &ClientOptions) -> Result<(), ProtocolError> {
        self.write_op(OpCode::SetOptions).await?;
        options.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await
    }

    pub async fn is_valid_path(&mut self, path: &StorePath) -> Result<bool, ProtocolError> {
        self.write_op(OpCode::IsValidPath).await?;
        path.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        bool::deserialize(&mut self.reader, &self.ctx).await
    }

    pub async fn query_valid_paths(
        &mut self,
        paths: &StorePathSet,
        substitute: bool,
    ) -> Result<StorePathSet, ProtocolError> {
        self.write_op(OpCode::QueryValidPaths).await?;
        paths.serialize(&mut self.writer, &self.ctx).await?;
        if self.ctx.version >= ProtocolVersion::from_parts(1, 27) {
            substitute.serialize(&mut self.writer, &self.ctx).await?;
        }
        self.process_stderr().await?;
        StorePathSet::deserialize(&mut self.reader, &self.ctx).await
    }

    pub async fn query_path_info(
        &mut self,
        path: &StorePath,
    ) -> Result<Option<UnkeyedPathInfo>, ProtocolError> {
        self.write_op(OpCode::QueryPathInfo).await?;
        path.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        if u64::deserialize(&mut self.reader, &self.ctx).await? == 0 {
            return Ok(None);
        }
        Ok(Some(
            UnkeyedPathInfo::deserialize(&mut self.reader, &self.ctx).await?,
        ))
    }

    pub async fn query_path_from_hash_part(
        &mut self,
        hash_part: &str,
    ) -> Result<Option<StorePath>, ProtocolError> {
        self.write_op(OpCode::QueryPathFromHashPart).await?;
        hash_part.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        read_opt_path(&mut self.reader, &self.ctx).await
    }

    pub async fn query_referrers(
        &mut self,
        path: &StorePath,
    ) -> Result<StorePathSet, ProtocolError> {
        self.write_op(OpCode::QueryReferrers).await?;
        path.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        StorePathSet::deserialize(&mut self.reader, &self.ctx).await
    }

    /// Fetch the NAR of `path` and restore it to `dest`, verifying
    /// nothing: the caller compares the returned hash and size against
    /// the expected metadata.
    pub async fn fetch_nar(
        &mut self,
        path: &StorePath,
        dest: &Path,
    ) -> Result<(NarHash, u64), ProtocolError> {
        self.write_op(OpCode::NarFromPath).await?;
        path.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;

        // Hash exactly the NAR bytes: the hashing wrapper sits above the
        // connection's buffer, so read-ahead never leaks into the digest.
        let (mut hashing, state) = HashingReader::new(&mut self.reader, Algorithm::SHA256);
        cantata_nar::restore_path(&mut hashing, dest)
            .await
            .map_err(|e| ProtocolError::custom(format!("restoring NAR: {e}")))?;
        drop(hashing);

        let state = std::sync::Arc::try_unwrap(state)
            .map_err(|_| ProtocolError::custom("hash state still shared"))?
            .into_inner()
            .map_err(|_| ProtocolError::custom("hash state poisoned"))?;
        let size = state.bytes_read;
        let hash = NarHash::try_from(state.finish())
            .map_err(|e| ProtocolError::custom(e.to_string()))?;
        Ok((hash, size))
    }

    /// Upload a NAR with its metadata.
    pub async fn add_to_store_nar<S: AsyncRead + Unpin + Send>(
        &mut self,
        path: &StorePath,
        info: &UnkeyedPathInfo,
        nar: &mut S,
        repair: bool,
        dont_check_sigs: bool,
    ) -> Result<(), ProtocolError> {
        self.write_op(OpCode::AddToStoreNar).await?;
        path.serialize(&mut self.writer, &self.ctx).await?;
        write_opt_path(&mut self.writer, &self.ctx, info.deriver.as_ref()).await?;
        info.nar_hash.serialize(&mut self.writer, &self.ctx).await?;
        info.references.serialize(&mut self.writer, &self.ctx).await?;
        info.registration_time.serialize(&mut self.writer, &self.ctx).await?;
        info.nar_size.serialize(&mut self.writer, &self.ctx).await?;
        info.ultimate.serialize(&mut self.writer, &self.ctx).await?;
        info.sigs.serialize(&mut self.writer, &self.ctx).await?;
        match &info.ca {
            Some(ca) => ca.serialize(&mut self.writer, &self.ctx).await?,
            None => "".serialize(&mut self.writer, &self.ctx).await?,
        }
        repair.serialize(&mut self.writer, &self.ctx).await?;
        dont_check_sigs.serialize(&mut self.writer, &self.ctx).await?;

        let mut sink = FramedSink::new(&mut self.writer);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = tokio::io::AsyncReadExt::read(nar, &mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write(&buf[..n]).await?;
        }
        sink.finish().await?;
        self.process_stderr().await
    }

    pub async fn build_paths(
        &mut self,
        targets: &[DerivedPath],
        mode: BuildMode,
    ) -> Result<(), ProtocolError> {
        self.write_op(OpCode::BuildPaths).await?;
        targets.to_vec().serialize(&mut self.writer, &self.ctx).await?;
        mode.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        let _ignored = u64::deserialize(&mut self.reader, &self.ctx).await?;
        Ok(())
    }

    pub async fn build_derivation(
        &mut self,
        drv_path: &StorePath,
        drv: &BasicDerivation,
        mode: BuildMode,
    ) -> Result<BuildResult, ProtocolError> {
        self.write_op(OpCode::BuildDerivation).await?;
        drv_path.serialize(&mut self.writer, &self.ctx).await?;
        drv.serialize(&mut self.writer, &self.ctx).await?;
        mode.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        BuildResult::deserialize(&mut self.reader, &self.ctx).await
    }

    pub async fn ensure_path(&mut self, path: &StorePath) -> Result<(), ProtocolError> {
        self.write_op(OpCode::EnsurePath).await?;
        path.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        let _ignored = u64::deserialize(&mut self.reader, &self.ctx).await?;
        Ok(())
    }

    pub async fn add_temp_root(&mut self, path: &StorePath) -> Result<(), ProtocolError> {
        self.write_op(OpCode::AddTempRoot).await?;
        path.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        let _ignored = u64::deserialize(&mut self.reader, &self.ctx).await?;
        Ok(())
    }

    pub async fn add_indirect_root(&mut self, link: &str) -> Result<(), ProtocolError> {
        self.write_op(OpCode::AddIndirectRoot).await?;
        link.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        let _ignored = u64::deserialize(&mut self.reader, &self.ctx).await?;
        Ok(())
    }

    pub async fn add_perm_root(
        &mut self,
        path: &StorePath,
        gc_root: &str,
    ) -> Result<String, ProtocolError> {
        self.write_op(OpCode::AddPermRoot).await?;
        path.serialize(&mut self.writer, &self.ctx).await?;
        gc_root.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        String::deserialize(&mut self.reader, &self.ctx).await
    }

    pub async fn find_roots(&mut self) -> Result<BTreeMap<String, StorePath>, ProtocolError> {
        self.write_op(OpCode::FindRoots).await?;
        self.process_stderr().await?;
        let count = u64::deserialize(&mut self.reader, &self.ctx).await?;
        let mut roots = BTreeMap::new();
        for _ in 0..count {
            let link = String::deserialize(&mut self.reader, &self.ctx).await?;
            let target = StorePath::deserialize(&mut self.reader, &self.ctx).await?;
            roots.insert(link, target);
        }
        Ok(roots)
    }

    pub async fn collect_garbage(&mut self, options: &GcOptions) -> Result<GcResult, ProtocolError> {
        self.write_op(OpCode::CollectGarbage).await?;
        options.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        GcResult::deserialize(&mut self.reader, &self.ctx).await
    }

    pub async fn query_missing(
        &mut self,
        targets: &[DerivedPath],
    ) -> Result<Missing, ProtocolError> {
        self.write_op(OpCode::QueryMissing).await?;
        targets.to_vec().serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        Missing::deserialize(&mut self.reader, &self.ctx).await
    }

    pub async fn query_derivation_output_map(
        &mut self,
        drv_path: &StorePath,
    ) -> Result<BTreeMap<OutputName, Option<StorePath>>, ProtocolError> {
        self.write_op(OpCode::QueryDerivationOutputMap).await?;
        drv_path.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        let count = u64::deserialize(&mut self.reader, &self.ctx).await?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let name = OutputName::deserialize(&mut self.reader, &self.ctx).await?;
            let path = read_opt_path(&mut self.reader, &self.ctx).await?;
            map.insert(name, path);
        }
        Ok(map)
    }

    pub async fn register_drv_output(
        &mut self,
        realisation: &Realisation,
    ) -> Result<(), ProtocolError> {
        self.write_op(OpCode::RegisterDrvOutput).await?;
        realisation.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await
    }

    pub async fn query_realisation(
        &mut self,
        drv_output: &str,
    ) -> Result<Vec<Realisation>, ProtocolError> {
        self.write_op(OpCode::QueryRealisation).await?;
        drv_output.serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        Vec::<Realisation>::deserialize(&mut self.reader, &self.ctx).await
    }

    pub async fn add_signatures(
        &mut self,
        path: &StorePath,
        sigs: &[String],
    ) -> Result<(), ProtocolError> {
        self.write_op(OpCode::AddSignatures).await?;
        path.serialize(&mut self.writer, &self.ctx).await?;
        sigs.to_vec().serialize(&mut self.writer, &self.ctx).await?;
        self.process_stderr().await?;
        let _ignored = u64::deserialize(&mut self.reader, &self.ctx).await?;
        Ok(())
    }
}
