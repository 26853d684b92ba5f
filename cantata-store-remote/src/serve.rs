// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The serve protocol: the thinner sibling of the daemon protocol used
//! for remote builders, usually spoken over an SSH channel's
//! stdin/stdout.

use std::future::Future;
use std::path::PathBuf;

use num_enum::TryFromPrimitive;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader, BufWriter};
use tracing::{debug, trace};

use cantata_store_core::derivation::BasicDerivation;
use cantata_store_core::store_path::{StorePath, StorePathSet};
use cantata_store_core::StoreDir;
use cantata_utils_hash::NarHash;

use crate::error::ProtocolError;
use crate::export::{self, ImportedEntry};
use crate::protocol::types::BuildResult;
use crate::protocol::{ProtocolVersion, WireCtx};
use crate::serialization::{
    Deserialize, Serialize, UnkeyedPathInfo, read_basic_derivation, read_opt_path,
};

pub const SERVE_MAGIC_1: u64 = 0x390c9deb;
pub const SERVE_MAGIC_2: u64 = 0x5452eecb;

pub const CURRENT_SERVE_VERSION: ProtocolVersion = ProtocolVersion::from_parts(2, 7);
pub const MIN_SERVE_VERSION: ProtocolVersion = ProtocolVersion::from_parts(2, 2);

/// Serve protocol commands.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum ServeCommand {
    QueryValidPaths = 1,
    QueryPathInfos = 2,
    DumpStorePath = 3,
    ImportPaths = 4,
    ExportPaths = 5,
    BuildPaths = 6,
    QueryClosure = 7,
    BuildDerivation = 8,
    AddToStoreNar = 9,
}

/// Build limits a scheduler ships with a remote build.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildOptions {
    pub max_silent_time: u64,
    pub build_timeout: u64,
    pub max_log_size: u64,
    pub nr_repeats: u64,
    pub enforce_determinism: bool,
    pub keep_failed: bool,
}

impl Serialize for BuildOptions {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        self.max_silent_time.serialize(writer, ctx).await?;
        self.build_timeout.serialize(writer, ctx).await?;
        if ctx.version >= ProtocolVersion::from_parts(2, 2) {
            self.max_log_size.serialize(writer, ctx).await?;
        }
        if ctx.version >= ProtocolVersion::from_parts(2, 3) {
            self.nr_repeats.serialize(writer, ctx).await?;
            self.enforce_determinism.serialize(writer, ctx).await?;
        }
        if ctx.version >= ProtocolVersion::from_parts(2, 7) {
            self.keep_failed.serialize(writer, ctx).await?;
        }
        Ok(())
    }
}

impl Deserialize for BuildOptions {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let mut options = BuildOptions {
            max_silent_time: u64::deserialize(reader, ctx).await?,
            build_timeout: u64::deserialize(reader, ctx).await?,
            ..Default::default()
        };
        if ctx.version >= ProtocolVersion::from_parts(2, 2) {
            options.max_log_size = u64::deserialize(reader, ctx).await?;
        }
        if ctx.version >= ProtocolVersion::from_parts(2, 3) {
            options.nr_repeats = u64::deserialize(reader, ctx).await?;
            options.enforce_determinism = bool::deserialize(reader, ctx).await?;
        }
        if ctx.version >= ProtocolVersion::from_parts(2, 7) {
            options.keep_failed = bool::deserialize(reader, ctx).await?;
        }
        Ok(options)
    }
}

/// The store surface a serve connection dispatches into.
#[allow(async_fn_in_trait)]
pub trait ServeHandler: Send + Sync {
    fn query_valid_paths(
        &self,
        _paths: StorePathSet,
        _lock: bool,
        _substitute: bool,
    ) -> impl Future<Output = Result<StorePathSet, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("query_valid_paths")) }
    }

    fn query_path_infos(
        &self,
        _paths: StorePathSet,
    ) -> impl Future<Output = Result<Vec<(StorePath, UnkeyedPathInfo)>, ProtocolError>> + Send
    {
        async { Err(ProtocolError::Unsupported("query_path_infos")) }
    }

    /// Real filesystem location for `DumpStorePath`.
    fn nar_source_path(
        &self,
        _path: StorePath,
    ) -> impl Future<Output = Result<PathBuf, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("dump_store_path")) }
    }

    fn query_closure(
        &self,
        _paths: StorePathSet,
        _include_outputs: bool,
    ) -> impl Future<Output = Result<StorePathSet, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("query_closure")) }
    }

    fn build_derivation(
        &self,
        _drv_path: StorePath,
        _drv: BasicDerivation,
        _options: BuildOptions,
    ) -> impl Future<Output = Result<BuildResult, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("build_derivation")) }
    }

    fn build_paths(
        &self,
        _paths: StorePathSet,
        _options: BuildOptions,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("build_paths")) }
    }

    /// Directory for restoring incoming NARs before registration.
    fn staging_dir(&self) -> PathBuf {
        std::env::temp_dir()
    }

    /// The closure of `paths` in references-first order, with metadata
    /// and on-disk locations, ready for export.
    fn export_closure(
        &self,
        _paths: StorePathSet,
    ) -> impl Future<Output = Result<Vec<(StorePath, UnkeyedPathInfo, PathBuf)>, ProtocolError>> + Send
    {
        async { Err(ProtocolError::Unsupported("export_paths")) }
    }

    /// Register entries restored from an import stream, in order.
    fn register_imported(
        &self,
        _entries: Vec<ImportedEntry>,
    ) -> impl Future<Output = Result<Vec<StorePath>, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("import_paths")) }
    }

    /// Register one NAR tree restored from `AddToStoreNar`; `got` is
    /// the hash and size of the NAR as transferred.
    fn add_restored_nar(
        &self,
        _path: StorePath,
        _info: UnkeyedPathInfo,
        _tree: PathBuf,
        _got: (NarHash, u64),
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("add_to_store_nar")) }
    }
}

/// Server side of the serve handshake.
pub async fn serve_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    store_dir: StoreDir,
) -> Result<WireCtx, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let bootstrap = WireCtx::new(CURRENT_SERVE_VERSION, store_dir.clone());
    let magic = u64::deserialize(reader, &bootstrap).await?;
    if magic != SERVE_MAGIC_1 {
        return Err(ProtocolError::InvalidMagic {
            expected: SERVE_MAGIC_1,
            actual: magic,
        });
    }
    SERVE_MAGIC_2.serialize(writer, &bootstrap).await?;
    u64::from(CURRENT_SERVE_VERSION)
        .serialize(writer, &bootstrap)
        .await?;
    writer.flush().await?;
    let client_version = ProtocolVersion::from(u64::deserialize(reader, &bootstrap).await?);
    let version = client_version.min(CURRENT_SERVE_VERSION);
    if version < MIN_SERVE_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            client: client_version,
            min: MIN_SERVE_VERSION,
        });
    }
    Ok(WireCtx::new(version, store_dir))
}

/// Client side of the serve handshake.
pub async fn connect_serve<R, W>(
    reader: &mut R,
    writer: &mut W,
    store_dir: StoreDir,
) -> Result<WireCtx, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let bootstrap = WireCtx::new(CURRENT_SERVE_VERSION, store_dir.clone());
    SERVE_MAGIC_1.serialize(writer, &bootstrap).await?;
    u64::from(CURRENT_SERVE_VERSION)
        .serialize(writer, &bootstrap)
        .await?;
    writer.flush().await?;
    let magic = u64::deserialize(reader, &bootstrap).await?;
    if magic != SERVE_MAGIC_2 {
        return Err(ProtocolError::InvalidMagic {
            expected: SERVE_MAGIC_2,
            actual: magic,
        });
    }
    let server_version = ProtocolVersion::from(u64::deserialize(reader, &bootstrap).await?);
    let version = server_version.min(CURRENT_SERVE_VERSION);
    if version < MIN_SERVE_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            client: server_version,
            min: MIN_SERVE_VERSION,
        });
    }
    Ok(WireCtx::new(version, store_dir))
}

/// Serve one connection until the peer hangs up.
pub async fn handle_serve_connection<R, W, H>(
    reader: R,
    writer: W,
    store_dir: StoreDir,
    handler: &H,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    H: ServeHandler,
{
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let ctx = serve_handshake(&mut reader, &mut writer, store_dir).await?;
    debug!(version = %ctx.version, "serve connection established");

    loop {
        writer.flush().await?;
        let raw = match u64::deserialize(&mut reader, &ctx).await {
            Ok(raw) => raw,
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let command = ServeCommand::try_from(raw)
            .map_err(|_| ProtocolError::InvalidOpCode(raw))?;
        trace!(?command, "serve request");
        match command {
            ServeCommand::QueryValidPaths => {
                let lock = bool::deserialize(&mut reader, &ctx).await?;
                let substitute = bool::deserialize(&mut reader, &ctx).await?;
                let paths = StorePathSet::deserialize(&mut reader, &ctx).await?;
                let valid = handler.query_valid_paths(paths, lock, substitute).await?;
                valid.serialize(&mut writer, &ctx).await?;
            }
            ServeCommand::QueryPathInfos => {
                let paths = StorePathSet::deserialize(&mut reader, &ctx).await?;
                let infos = handler.query_path_infos(paths).await?;
                // One entry per known path, terminated by an empty path
                // string.
                for (path, info) in infos {
                    path.serialize(&mut writer, &ctx).await?;
                    crate::serialization::write_opt_path(&mut writer, &ctx, info.deriver.as_ref())
                        .await?;
                    info.references.serialize(&mut writer, &ctx).await?;
                    // Download size; estimated by the NAR size here.
                    info.nar_size.serialize(&mut writer, &ctx).await?;
                    info.nar_size.serialize(&mut writer, &ctx).await?;
                }
                "".serialize(&mut writer, &ctx).await?;
            }
            ServeCommand::DumpStorePath => {
                let path = StorePath::deserialize(&mut reader, &ctx).await?;
                let source = handler.nar_source_path(path).await?;
                cantata_nar::dump_path(&source, &mut writer)
                    .await
                    .map_err(|e| ProtocolError::custom(e.to_string()))?;
            }
            ServeCommand::QueryClosure => {
                let include_outputs = bool::deserialize(&mut reader, &ctx).await?;
                let paths = StorePathSet::deserialize(&mut reader, &ctx).await?;
                let closure = handler.query_closure(paths, include_outputs).await?;
                closure.serialize(&mut writer, &ctx).await?;
            }
            ServeCommand::BuildDerivation => {
                let drv_path = StorePath::deserialize(&mut reader, &ctx).await?;
                let drv = read_basic_derivation(&mut reader, &ctx, &drv_path).await?;
                let options = BuildOptions::deserialize(&mut reader, &ctx).await?;
                let result = handler.build_derivation(drv_path, drv, options).await?;
                // The serve protocol sends the status and message, then
                // the newer guarded fields.
                (result.status as u64).serialize(&mut writer, &ctx).await?;
                result.error_msg.serialize(&mut writer, &ctx).await?;
                if ctx.version >= ProtocolVersion::from_parts(2, 3) {
                    result.times_built.serialize(&mut writer, &ctx).await?;
                    result.is_non_deterministic.serialize(&mut writer, &ctx).await?;
                    result.start_time.serialize(&mut writer, &ctx).await?;
                    result.stop_time.serialize(&mut writer, &ctx).await?;
                }
                if ctx.version >= ProtocolVersion::from_parts(2, 6) {
                    (result.built_outputs.len() as u64)
                        .serialize(&mut writer, &ctx)
                        .await?;
                    for (id, realisation) in &result.built_outputs {
                        id.serialize(&mut writer, &ctx).await?;
                        realisation.serialize(&mut writer, &ctx).await?;
                    }
                }
            }
            ServeCommand::BuildPaths => {
                let paths = StorePathSet::deserialize(&mut reader, &ctx).await?;
                let options = BuildOptions::deserialize(&mut reader, &ctx).await?;
                match handler.build_paths(paths, options).await {
                    Ok(()) => {
                        0u64.serialize(&mut writer, &ctx).await?;
                    }
                    Err(err) => {
                        1u64.serialize(&mut writer, &ctx).await?;
                        err.to_string().serialize(&mut writer, &ctx).await?;
                    }
                }
            }
            ServeCommand::ExportPaths => {
                // Obsolete sign-export flag.
                let _sign = u64::deserialize(&mut reader, &ctx).await?;
                let paths = StorePathSet::deserialize(&mut reader, &ctx).await?;
                let closure = handler.export_closure(paths).await?;
                for (path, info, real) in closure {
                    export::export_path(
                        &mut writer,
                        &ctx,
                        &real,
                        &path,
                        &info.references,
                        info.deriver.as_ref(),
                    )
                    .await?;
                }
                export::export_done(&mut writer, &ctx).await?;
            }
            ServeCommand::ImportPaths => {
                let staging = handler.staging_dir();
                let entries = export::import_paths(&mut reader, &ctx, &staging).await?;
                handler.register_imported(entries).await?;
                1u64.serialize(&mut writer, &ctx).await?;
            }
            ServeCommand::AddToStoreNar => {
                let path = StorePath::deserialize(&mut reader, &ctx).await?;
                let deriver = read_opt_path(&mut reader, &ctx).await?;
                let nar_hash = NarHash::deserialize(&mut reader, &ctx).await?;
                let references = StorePathSet::deserialize(&mut reader, &ctx).await?;
                let registration_time = u64::deserialize(&mut reader, &ctx).await?;
                let nar_size = u64::deserialize(&mut reader, &ctx).await?;
                let ultimate = bool::deserialize(&mut reader, &ctx).await?;
                let sigs = Vec::<String>::deserialize(&mut reader, &ctx).await?;
                let ca = String::deserialize(&mut reader, &ctx).await?;
                let info = UnkeyedPathInfo {
                    deriver,
                    nar_hash,
                    references,
                    registration_time,
                    nar_size,
                    ultimate,
                    sigs,
                    ca: if ca.is_empty() { None } else { Some(ca) },
                };

                // The NAR follows inline; the parser stops exactly at
                // its end, and the transferred bytes are hashed on the
                // way through.
                let tree = handler.staging_dir().join(format!(
                    "serve-add-{}-{}",
                    std::process::id(),
                    path.hash()
                ));
                let (mut hashing, state) = cantata_utils_hash::HashingReader::new(
                    &mut reader,
                    cantata_utils_hash::Algorithm::SHA256,
                );
                cantata_nar::restore_path(&mut hashing, &tree)
                    .await
                    .map_err(|e| ProtocolError::custom(e.to_string()))?;
                drop(hashing);
                let state = std::sync::Arc::try_unwrap(state)
                    .map_err(|_| ProtocolError::custom("hash state still shared"))?
                    .into_inner()
                    .map_err(|_| ProtocolError::custom("hash state poisoned"))?;
                let got_size = state.bytes_read;
                let got_hash = NarHash::try_from(state.finish())
                    .map_err(|e| ProtocolError::custom(e.to_string()))?;

                let result = handler
                    .add_restored_nar(path, info, tree.clone(), (got_hash, got_size))
                    .await;
                let _ = tokio::fs::remove_dir_all(&tree).await;
                let _ = tokio::fs::remove_file(&tree).await;
                result?;
                1u64.serialize(&mut writer, &ctx).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use cantata_store_core::StoreDir;
    use pretty_assertions::assert_eq;

    use super::*;

    fn ctx_at(minor: u8) -> WireCtx {
        WireCtx::new(ProtocolVersion::from_parts(2, minor), StoreDir::default())
    }

    #[tokio::test]
    async fn build_options_roundtrip_current() {
        let options = BuildOptions {
            max_silent_time: 60,
            build_timeout: 3600,
            max_log_size: 1 << 20,
            nr_repeats: 1,
            enforce_determinism: true,
            keep_failed: true,
        };
        let ctx = ctx_at(7);
        let mut buf = Vec::new();
        options.serialize(&mut buf, &ctx).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(
            BuildOptions::deserialize(&mut reader, &ctx).await.unwrap(),
            options
        );
    }

    /// Fields newer than the negotiated version are neither written nor
    /// read.
    #[tokio::test]
    async fn build_options_version_guard() {
        let options = BuildOptions {
            max_silent_time: 60,
            build_timeout: 3600,
            max_log_size: 1 << 20,
            nr_repeats: 7,
            enforce_determinism: true,
            keep_failed: true,
        };
        let ctx = ctx_at(2);
        let mut buf = Vec::new();
        options.serialize(&mut buf, &ctx).await.unwrap();
        assert_eq!(buf.len(), 3 * 8);
        let mut reader = buf.as_slice();
        let parsed = BuildOptions::deserialize(&mut reader, &ctx).await.unwrap();
        assert_eq!(parsed.max_log_size, 1 << 20);
        assert_eq!(parsed.nr_repeats, 0);
        assert!(!parsed.keep_failed);
    }

    #[tokio::test]
    async fn handshake_pair() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let server_task = tokio::spawn(async move {
            serve_handshake(&mut server_read, &mut server_write, StoreDir::default()).await
        });
        let client_ctx =
            connect_serve(&mut client_read, &mut client_write, StoreDir::default())
                .await
                .unwrap();
        let server_ctx = server_task.await.unwrap().unwrap();
        assert_eq!(client_ctx.version, server_ctx.version);
        assert_eq!(client_ctx.version, CURRENT_SERVE_VERSION);
    }
}
