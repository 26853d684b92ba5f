// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Daemon protocol server: handshake, request loop, dispatch.
//!
//! Store behaviour is supplied through [`RequestHandler`]; every method
//! defaults to an "unsupported" error so partial stores stay honest.
//! Recoverable errors travel to the client as stderr error frames; the
//! connection then continues with the next request.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader, BufWriter};
use tracing::{debug, error, trace};

use cantata_store_core::derivation::BasicDerivation;
use cantata_store_core::derived_path::{DerivedPath, OutputName};
use cantata_store_core::realisation::Realisation;
use cantata_store_core::store_path::{StorePath, StorePathSet};
use cantata_store_core::StoreDir;

use crate::error::ProtocolError;
use crate::framed::FramedSource;
use crate::protocol::types::{
    BuildMode, BuildResult, ClientOptions, GcOptions, GcResult, Missing,
};
use crate::protocol::{
    CURRENT_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, Msg, OpCode, ProtocolVersion, WORKER_MAGIC_1,
    WORKER_MAGIC_2, WireCtx,
};
use crate::serialization::{
    Deserialize, Serialize, UnkeyedPathInfo, read_basic_derivation, read_opt_path, write_opt_path,
};

/// Framed payloads become spool files before they reach the handler, so
/// arbitrarily large NARs never sit in memory.
#[derive(Debug)]
pub struct SpooledNar {
    pub file: PathBuf,
}

/// An `AddToStoreNar` request.
#[derive(Debug, Clone)]
pub struct AddToStoreNarRequest {
    pub path: StorePath,
    pub info: UnkeyedPathInfo,
    pub repair: bool,
    pub dont_check_sigs: bool,
}

/// An `AddToStore` (content-addressed ingestion) request.
#[derive(Debug, Clone)]
pub struct AddCaToStoreRequest {
    pub name: String,
    pub method_algorithm: String,
    pub references: StorePathSet,
    pub repair: bool,
}

/// The store surface a daemon connection dispatches into.
#[allow(async_fn_in_trait)]
pub trait RequestHandler: Send + Sync {
    /// Whether the connecting client is trusted (reported in the
    /// handshake).
    fn is_trusted(&self) -> bool {
        false
    }

    /// Directory to spool framed NAR payloads into.
    fn spool_dir(&self) -> PathBuf {
        std::env::temp_dir()
    }

    fn set_options(
        &self,
        _options: ClientOptions,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        async { Ok(()) }
    }

    fn is_valid_path(
        &self,
        _path: StorePath,
    ) -> impl Future<Output = Result<bool, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("is_valid_path")) }
    }

    fn query_valid_paths(
        &self,
        _paths: StorePathSet,
        _substitute: bool,
    ) -> impl Future<Output = Result<StorePathSet, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("query_valid_paths")) }
    }

    fn query_all_valid_paths(
        &self,
    ) -> impl Future<Output = Result<StorePathSet, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("query_all_valid_paths")) }
    }

    fn query_path_info(
        &self,
        _path: StorePath,
    ) -> impl Future<Output = Result<Option<UnkeyedPathInfo>, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("query_path_info")) }
    }

    fn query_path_from_hash_part(
        &self,
        _hash_part: String,
    ) -> impl Future<Output = Result<Option<StorePath>, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("query_path_from_hash_part")) }
    }

    fn query_referrers(
        &self,
        _path: StorePath,
    ) -> impl Future<Output = Result<StorePathSet, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("query_referrers")) }
    }

    fn query_valid_derivers(
        &self,
        _path: StorePath,
    ) -> impl Future<Output = Result<StorePathSet, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("query_valid_derivers")) }
    }

    /// The real filesystem location to dump for `NarFromPath`.
    fn nar_source_path(
        &self,
        _path: StorePath,
    ) -> impl Future<Output = Result<PathBuf, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("nar_from_path")) }
    }

    fn add_to_store_nar(
        &self,
        _request: AddToStoreNarRequest,
        _nar: SpooledNar,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("add_to_store_nar")) }
    }

    fn add_ca_to_store(
        &self,
        _request: AddCaToStoreRequest,
        _payload: SpooledNar,
    ) -> impl Future<Output = Result<(StorePath, UnkeyedPathInfo), ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("add_to_store")) }
    }

    fn build_paths(
        &self,
        _targets: Vec<DerivedPath>,
        _mode: BuildMode,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("build_paths")) }
    }

    fn build_derivation(
        &self,
        _drv_path: StorePath,
        _drv: BasicDerivation,
        _mode: BuildMode,
    ) -> impl Future<Output = Result<BuildResult, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("build_derivation")) }
    }

    fn ensure_path(
        &self,
        _path: StorePath,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("ensure_path")) }
    }

    fn add_temp_root(
        &self,
        _path: StorePath,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("add_temp_root")) }
    }

    fn add_indirect_root(
        &self,
        _link: String,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("add_indirect_root")) }
    }

    fn add_perm_root(
        &self,
        _path: StorePath,
        _gc_root: String,
    ) -> impl Future<Output = Result<String, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("add_perm_root")) }
    }

    fn find_roots(
        &self,
    ) -> impl Future<Output = Result<BTreeMap<String, StorePath>, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("find_roots")) }
    }

    fn collect_garbage(
        &self,
        _options: GcOptions,
    ) -> impl Future<Output = Result<GcResult, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("collect_garbage")) }
    }

    fn query_missing(
        &self,
        _targets: Vec<DerivedPath>,
    ) -> impl Future<Output = Result<Missing, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("query_missing")) }
    }

    fn query_derivation_output_map(
        &self,
        _drv_path: StorePath,
    ) -> impl Future<Output = Result<BTreeMap<OutputName, Option<StorePath>>, ProtocolError>> + Send
    {
        async { Err(ProtocolError::Unsupported("query_derivation_output_map")) }
    }

    fn register_drv_output(
        &self,
        _realisation: Realisation,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("register_drv_output")) }
    }

    fn query_realisation(
        &self,
        _drv_output: String,
    ) -> impl Future<Output = Result<Vec<Realisation>, ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("query_realisation")) }
    }

    fn add_signatures(
        &self,
        _path: StorePath,
        _sigs: Vec<String>,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send {
        async { Err(ProtocolError::Unsupported("add_signatures")) }
    }
}

/// Serve one daemon connection to completion.
pub async fn handle_connection<R, W, H>(
    reader: R,
    writer: W,
    store_dir: StoreDir,
    daemon_version: &str,
    handler: &H,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    H: RequestHandler,
{
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let ctx = handshake(&mut reader, &mut writer, store_dir, daemon_version, handler).await?;
    debug!(version = %ctx.version, "daemon connection established");

    loop {
        writer.flush().await?;
        let mut opcode_buf = [0u8; 8];
        match tokio::io::AsyncReadExt::read_exact(&mut reader, &mut opcode_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let op = OpCode::decode(u64::from_le_bytes(opcode_buf))?;
        trace!(?op, "request");

        if let Err(err) = dispatch(op, &mut reader, &mut writer, &ctx, handler).await {
            error!(?op, %err, "request failed");
            write_error_frame(&mut writer, &ctx, &err).await?;
        }
        writer.flush().await?;
    }
    debug!("daemon connection closed");
    Ok(())
}

async fn handshake<R, W, H>(
    reader: &mut R,
    writer: &mut W,
    store_dir: StoreDir,
    daemon_version: &str,
    handler: &H,
) -> Result<WireCtx, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    H: RequestHandler,
{
    let bootstrap = WireCtx::new(CURRENT_PROTOCOL_VERSION, store_dir.clone());

    let magic = u64::deserialize(reader, &bootstrap).await?;
    if magic != WORKER_MAGIC_1 {
        return Err(ProtocolError::InvalidMagic {
            expected: WORKER_MAGIC_1,
            actual: magic,
        });
    }
    WORKER_MAGIC_2.serialize(writer, &bootstrap).await?;
    u64::from(CURRENT_PROTOCOL_VERSION)
        .serialize(writer, &bootstrap)
        .await?;
    writer.flush().await?;

    let client_version =
        ProtocolVersion::from(u64::deserialize(reader, &bootstrap).await?);
    let version = client_version.min(CURRENT_PROTOCOL_VERSION);
    if version < MIN_PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            client: client_version,
            min: MIN_PROTOCOL_VERSION,
        });
    }
    let ctx = WireCtx::new(version, store_dir);

    // Obsolete CPU affinity.
    if bool::deserialize(reader, &ctx).await? {
        let _affinity = u64::deserialize(reader, &ctx).await?;
    }
    // Obsolete reserve-space flag.
    let _reserve_space = bool::deserialize(reader, &ctx).await?;

    if version >= ProtocolVersion::from_parts(1, 33) {
        daemon_version.serialize(writer, &ctx).await?;
    }
    if version >= ProtocolVersion::from_parts(1, 35) {
        let trust: u64 = if handler.is_trusted() { 1 } else { 2 };
        trust.serialize(writer, &ctx).await?;
    }
    writer.flush().await?;
    Ok(ctx)
}

/// Signal successful completion of the stderr pump.
async fn write_last<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    ctx: &WireCtx,
) -> Result<(), ProtocolError> {
    (Msg::Last as u64).serialize(writer, ctx).await
}

/// Emit a structured error frame; the client turns it into a failure
/// for the current request and the connection stays usable.
async fn write_error_frame<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    ctx: &WireCtx,
    err: &ProtocolError,
) -> Result<(), ProtocolError> {
    (Msg::Error as u64).serialize(writer, ctx).await?;
    if ctx.version >= ProtocolVersion::from_parts(1, 26) {
        "Error".serialize(writer, ctx).await?;
        0u64.serialize(writer, ctx).await?; // level
        "Error".serialize(writer, ctx).await?; // obsolete name
        err.to_string().serialize(writer, ctx).await?;
        0u64.serialize(writer, ctx).await?; // no position
        0u64.serialize(writer, ctx).await?; // no traces
    } else {
        err.to_string().serialize(writer, ctx).await?;
        1u64.serialize(writer, ctx).await?; // exit status
    }
    Ok(())
}

async fn spool_framed<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    spool_dir: &std::path::Path,
) -> Result<SpooledNar, ProtocolError> {
    let file = spool_dir.join(format!(
        "spool-{}-{:x}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));
    let mut out = tokio::fs::File::create(&file).await?;
    let mut source = FramedSource::new(reader);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).await?;
    }
    out.flush().await?;
    Ok(SpooledNar { file })
}

async fn dispatch<R, W, H>(
    op: OpCode,
    reader: &mut BufReader<R>,
    writer: &mut BufWriter<W>,
    ctx: &WireCtx,
    handler: &H,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    H: RequestHandler,
{
    match op {
        OpCode::SetOptions => {
            let options = ClientOptions::deserialize(reader, ctx).await?;
            handler.set_options(options).await?;
            write_last(writer, ctx).await?;
        }
        OpCode::IsValidPath => {
            let path = StorePath::deserialize(reader, ctx).await?;
            let valid = handler.is_valid_path(path).await?;
            write_last(writer, ctx).await?;
            valid.serialize(writer, ctx).await?;
        }
        OpCode::QueryValidPaths => {
            let paths = StorePathSet::deserialize(reader, ctx).await?;
            let substitute = if ctx.version >= ProtocolVersion::from_parts(1, 27) {
                bool::deserialize(reader, ctx).await?
            } else {
                false
            };
            let valid = handler.query_valid_paths(paths, substitute).await?;
            write_last(writer, ctx).await?;
            valid.serialize(writer, ctx).await?;
        }
        OpCode::QueryAllValidPaths => {
            let paths = handler.query_all_valid_paths().await?;
            write_last(writer, ctx).await?;
            paths.serialize(writer, ctx).await?;
        }
        OpCode::QueryPathInfo => {
            let path = StorePath::deserialize(reader, ctx).await?;
            let info = handler.query_path_info(path).await?;
            write_last(writer, ctx).await?;
            match info {
                Some(info) => {
                    1u64.serialize(writer, ctx).await?;
                    info.serialize(writer, ctx).await?;
                }
                None => 0u64.serialize(writer, ctx).await?,
            }
        }
        OpCode::QueryPathFromHashPart => {
            let hash_part = String::deserialize(reader, ctx).await?;
            let found = handler.query_path_from_hash_part(hash_part).await?;
            write_last(writer, ctx).await?;
            write_opt_path(writer, ctx, found.as_ref()).await?;
        }
        OpCode::QueryReferrers => {
            let path = StorePath::deserialize(reader, ctx).await?;
            let referrers = handler.query_referrers(path).await?;
            write_last(writer, ctx).await?;
            referrers.serialize(writer, ctx).await?;
        }
        OpCode::QueryValidDerivers => {
            let path = StorePath::deserialize(reader, ctx).await?;
            let derivers = handler.query_valid_derivers(path).await?;
            write_last(writer, ctx).await?;
            derivers.serialize(writer, ctx).await?;
        }
        OpCode::NarFromPath => {
            let path = StorePath::deserialize(reader, ctx).await?;
            let source = handler.nar_source_path(path).await?;
            write_last(writer, ctx).await?;
            cantata_nar::dump_path(&source, writer)
                .await
                .map_err(|e| ProtocolError::custom(e.to_string()))?;
        }
        OpCode::AddToStoreNar => {
            if ctx.version < ProtocolVersion::from_parts(1, 23) {
                return Err(ProtocolError::Unsupported("unframed add_to_store_nar"));
            }
            let path = StorePath::deserialize(reader, ctx).await?;
            let deriver = read_opt_path(reader, ctx).await?;
            let nar_hash = cantata_utils_hash::NarHash::deserialize(reader, ctx).await?;
            let references = StorePathSet::deserialize(reader, ctx).await?;
            let registration_time = u64::deserialize(reader, ctx).await?;
            let nar_size = u64::deserialize(reader, ctx).await?;
            let ultimate = bool::deserialize(reader, ctx).await?;
            let sigs = Vec::<String>::deserialize(reader, ctx).await?;
            let ca = String::deserialize(reader, ctx).await?;
            let repair = bool::deserialize(reader, ctx).await?;
            let dont_check_sigs = bool::deserialize(reader, ctx).await?;

            let nar = spool_framed(reader, &handler.spool_dir()).await?;
            let spool_file = nar.file.clone();
            let request = AddToStoreNarRequest {
                path,
                info: UnkeyedPathInfo {
                    deriver,
                    nar_hash,
                    references,
                    registration_time,
                    nar_size,
                    ultimate,
                    sigs,
                    ca: if ca.is_empty() { None } else { Some(ca) },
                },
                repair,
                dont_check_sigs,
            };
            let result = handler.add_to_store_nar(request, nar).await;
            let _ = tokio::fs::remove_file(&spool_file).await;
            result?;
            write_last(writer, ctx).await?;
        }
        OpCode::AddToStore => {
            let name = String::deserialize(reader, ctx).await?;
            let method_algorithm = String::deserialize(reader, ctx).await?;
            let references = StorePathSet::deserialize(reader, ctx).await?;
            let repair = bool::deserialize(reader, ctx).await?;
            let payload = spool_framed(reader, &handler.spool_dir()).await?;
            let spool_file = payload.file.clone();
            let result = handler
                .add_ca_to_store(
                    AddCaToStoreRequest {
                        name,
                        method_algorithm,
                        references,
                        repair,
                    },
                    payload,
                )
                .await;
            let _ = tokio::fs::remove_file(&spool_file).await;
            let (path, info) = result?;
            write_last(writer, ctx).await?;
            path.serialize(writer, ctx).await?;
            info.serialize(writer, ctx).await?;
        }
        OpCode::BuildPaths => {
            let targets = Vec::<DerivedPath>::deserialize(reader, ctx).await?;
            let mode = BuildMode::deserialize(reader, ctx).await?;
            handler.build_paths(targets, mode).await?;
            write_last(writer, ctx).await?;
            1u64.serialize(writer, ctx).await?;
        }
        OpCode::BuildDerivation => {
            let drv_path = StorePath::deserialize(reader, ctx).await?;
            let drv = read_basic_derivation(reader, ctx, &drv_path).await?;
            let mode = BuildMode::deserialize(reader, ctx).await?;
            let result = handler.build_derivation(drv_path, drv, mode).await?;
            write_last(writer, ctx).await?;
            result.serialize(writer, ctx).await?;
        }
        OpCode::EnsurePath => {
            let path = StorePath::deserialize(reader, ctx).await?;
            handler.ensure_path(path).await?;
            write_last(writer, ctx).await?;
            1u64.serialize(writer, ctx).await?;
        }
        OpCode::AddTempRoot => {
            let path = StorePath::deserialize(reader, ctx).await?;
            handler.add_temp_root(path).await?;
            write_last(writer, ctx).await?;
            1u64.serialize(writer, ctx).await?;
        }
        OpCode::AddIndirectRoot => {
            let link = String::deserialize(reader, ctx).await?;
            handler.add_indirect_root(link).await?;
            write_last(writer, ctx).await?;
            1u64.serialize(writer, ctx).await?;
        }
        OpCode::AddPermRoot => {
            let path = StorePath::deserialize(reader, ctx).await?;
            let gc_root = String::deserialize(reader, ctx).await?;
            let link = handler.add_perm_root(path, gc_root).await?;
            write_last(writer, ctx).await?;
            link.serialize(writer, ctx).await?;
        }
        OpCode::FindRoots => {
            let roots = handler.find_roots().await?;
            write_last(writer, ctx).await?;
            (roots.len() as u64).serialize(writer, ctx).await?;
            for (link, target) in &roots {
                link.serialize(writer, ctx).await?;
                target.serialize(writer, ctx).await?;
            }
        }
        OpCode::CollectGarbage => {
            let options = GcOptions::deserialize(reader, ctx).await?;
            let result = handler.collect_garbage(options).await?;
            write_last(writer, ctx).await?;
            result.serialize(writer, ctx).await?;
        }
        OpCode::QueryMissing => {
            let targets = Vec::<DerivedPath>::deserialize(reader, ctx).await?;
            let missing = handler.query_missing(targets).await?;
            write_last(writer, ctx).await?;
            missing.serialize(writer, ctx).await?;
        }
        OpCode::QueryDerivationOutputMap => {
            let drv_path = StorePath::deserialize(reader, ctx).await?;
            let map = handler.query_derivation_output_map(drv_path).await?;
            write_last(writer, ctx).await?;
            (map.len() as u64).serialize(writer, ctx).await?;
            for (name, path) in &map {
                name.serialize(writer, ctx).await?;
                write_opt_path(writer, ctx, path.as_ref()).await?;
            }
        }
        OpCode::RegisterDrvOutput => {
            let realisation = Realisation::deserialize(reader, ctx).await?;
            handler.register_drv_output(realisation).await?;
            write_last(writer, ctx).await?;
        }
        OpCode::QueryRealisation => {
            let drv_output = String::deserialize(reader, ctx).await?;
            let realisations = handler.query_realisation(drv_output).await?;
            write_last(writer, ctx).await?;
            realisations.serialize(writer, ctx).await?;
        }
        OpCode::AddSignatures => {
            let path = StorePath::deserialize(reader, ctx).await?;
            let sigs = Vec::<String>::deserialize(reader, ctx).await?;
            handler.add_signatures(path, sigs).await?;
            write_last(writer, ctx).await?;
            1u64.serialize(writer, ctx).await?;
        }
    }
    Ok(())
}
