// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The local store: the object directory, the metadata database, and
//! the operations the daemon exposes over them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, info};

use cantata_store_core::content_address::{
    ContentAddress, ContentAddressMethod, ContentAddressMethodAlgorithm,
};
use cantata_store_core::derivation::{self, BasicDerivation, Derivation};
use cantata_store_core::derived_path::DerivedPath;
use cantata_store_core::store_path::{StorePath, StorePathSet, StoreReferences};
use cantata_store_core::StoreDir;
use cantata_store_db::{OpenMode, RegisterPathParams, StoreDb};
use cantata_store_remote::export::{self, ImportedEntry};
use cantata_store_remote::protocol::types::{BuildMode, BuildResult, GcOptions, GcResult, Missing};
use cantata_store_remote::serialization::UnkeyedPathInfo;
use cantata_store_remote::WireCtx;
use cantata_utils_hash::fmt::{Any, Base16};
use cantata_utils_hash::{Algorithm, NarHash, Sha256};

use crate::build;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::gc::{self, AutoGc};
use crate::goal::Worker;
use crate::substituter::{DaemonSubstituter, verify_signature_policy};
use crate::temproots::TempRoots;

pub struct LocalStore {
    pub config: Arc<DaemonConfig>,
    pub db: Arc<Mutex<StoreDb>>,
    worker: Worker<DaemonSubstituter>,
    auto_gc: AutoGc,
    /// Temp roots registered through `AddTempRoot` live as long as the
    /// store (client connections share the daemon process).
    temp_roots: std::sync::Mutex<Option<TempRoots>>,
}

impl LocalStore {
    /// Open (creating if needed) the store described by `config`.
    pub fn open(config: DaemonConfig) -> DaemonResult<Arc<LocalStore>> {
        config.create_layout()?;
        let db = Arc::new(Mutex::new(StoreDb::open(config.db_path(), OpenMode::Create)?));
        let config = Arc::new(config);
        let substituters = Arc::new(DaemonSubstituter::from_config(&config));
        let worker = Worker::new(Arc::clone(&config), Arc::clone(&db), substituters);
        info!(store = %config.store_dir, "opened local store");
        Ok(Arc::new(LocalStore {
            config,
            db,
            worker,
            auto_gc: AutoGc::new(),
            temp_roots: std::sync::Mutex::new(None),
        }))
    }

    pub fn store_dir(&self) -> &StoreDir {
        &self.config.store_dir
    }

    fn wire_ctx(&self) -> WireCtx {
        WireCtx::new(
            cantata_store_remote::protocol::CURRENT_PROTOCOL_VERSION,
            self.config.store_dir.clone(),
        )
    }

    pub async fn is_valid_path(&self, path: &StorePath) -> DaemonResult<bool> {
        let full = self.config.store_dir.print_path(path);
        let db = self.db.lock().await;
        Ok(db.is_valid_path(&full)?)
    }

    /// Path metadata in wire form.
    pub async fn query_path_info(
        &self,
        path: &StorePath,
    ) -> DaemonResult<Option<UnkeyedPathInfo>> {
        let full = self.config.store_dir.print_path(path);
        let row = {
            let db = self.db.lock().await;
            db.query_path_info(&full)?
        };
        let Some(row) = row else {
            return Ok(None);
        };
        let nar_hash = row
            .hash
            .parse::<Any<NarHash>>()
            .map_err(|e| DaemonError::other(format!("corrupt hash for '{full}': {e}")))?
            .into_inner();
        let parse = |s: &String| self.config.store_dir.parse_path(s);
        Ok(Some(UnkeyedPathInfo {
            deriver: row.deriver.as_ref().and_then(|d| parse(d).ok()),
            nar_hash,
            references: row
                .references
                .iter()
                .filter_map(|r| parse(r).ok())
                .collect(),
            registration_time: row
                .registration_time
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            nar_size: row.nar_size.unwrap_or(0),
            ultimate: row.ultimate,
            sigs: row.signatures().iter().map(|s| s.to_string()).collect(),
            ca: row.ca,
        }))
    }

    /// The on-disk location to serve a NAR from; the path must be
    /// valid.
    pub async fn nar_source_path(&self, path: &StorePath) -> DaemonResult<PathBuf> {
        if !self.is_valid_path(path).await? {
            return Err(DaemonError::InvalidPath(
                self.config.store_dir.print_path(path),
            ));
        }
        Ok(self.config.store_dir.real_path(path))
    }

    /// Ingest a NAR with caller-supplied metadata, verifying the bytes
    /// against it.
    pub async fn add_to_store_nar(
        &self,
        path: &StorePath,
        info: &UnkeyedPathInfo,
        nar_file: &Path,
        repair: bool,
        dont_check_sigs: bool,
    ) -> DaemonResult<()> {
        let store_dir = &self.config.store_dir;
        let full = store_dir.print_path(path);

        if !dont_check_sigs {
            verify_signature_policy(&self.config, path, info)?;
        }

        {
            let db = self.db.lock().await;
            if db.is_valid_path(&full)? && !repair {
                return Ok(());
            }
        }

        let scratch = store_dir.to_path().join(format!(
            ".tmp-add-{}-{}",
            std::process::id(),
            path.hash()
        ));
        remove_any(&scratch).await;

        let file = tokio::fs::File::open(nar_file).await?;
        let (mut hashing, state) = cantata_utils_hash::HashingReader::new(
            tokio::io::BufReader::new(file),
            Algorithm::SHA256,
        );
        cantata_nar::restore_path(&mut hashing, &scratch).await?;
        drop(hashing);
        let state = Arc::try_unwrap(state)
            .map_err(|_| DaemonError::other("hash state still shared"))?
            .into_inner()
            .map_err(|_| DaemonError::other("hash state poisoned"))?;
        let got_size = state.bytes_read;
        let got_hash = NarHash::try_from(state.finish())
            .map_err(|e| DaemonError::other(e.to_string()))?;

        if got_hash != info.nar_hash {
            remove_any(&scratch).await;
            return Err(DaemonError::HashMismatch {
                path: full,
                expected: info.nar_hash,
                got: got_hash,
            });
        }
        if info.nar_size != 0 && got_size != info.nar_size {
            remove_any(&scratch).await;
            return Err(DaemonError::SizeMismatch {
                path: full,
                expected: info.nar_size,
                got: got_size,
            });
        }

        let real = store_dir.real_path(path);
        {
            let mut db = self.db.lock().await;
            if repair && db.is_valid_path(&full)? {
                let _ = db.invalidate_path(&full);
                remove_any(&real).await;
            }
        }
        if real.exists() {
            remove_any(&scratch).await;
        } else {
            tokio::fs::rename(&scratch, &real).await?;
        }

        let mut db = self.db.lock().await;
        if !db.is_valid_path(&full)? {
            db.register_valid_path(&RegisterPathParams {
                path: full.clone(),
                hash: format!("{}", Base16(got_hash)),
                registration_time: SystemTime::now(),
                deriver: info.deriver.as_ref().map(|d| store_dir.print_path(d)),
                nar_size: Some(got_size),
                ultimate: info.ultimate,
                sigs: if info.sigs.is_empty() {
                    None
                } else {
                    Some(info.sigs.join(" "))
                },
                ca: info.ca.clone(),
                references: info
                    .references
                    .iter()
                    .map(|r| store_dir.print_path(r))
                    .collect(),
            })?;
        }
        drop(db);
        debug!(path = %full, "added NAR to store");
        let _ = self.auto_gc.maybe_run(&self.config, &self.db).await;
        Ok(())
    }

    /// Ingest content-addressed bytes: a flat file, a NAR tree, or a
    /// stored text. Returns the computed path and its metadata.
    pub async fn add_ca_to_store(
        &self,
        name: &str,
        method_algorithm: ContentAddressMethodAlgorithm,
        references: &StorePathSet,
        repair: bool,
        payload: &Path,
    ) -> DaemonResult<(StorePath, UnkeyedPathInfo)> {
        let store_dir = &self.config.store_dir;

        let scratch = store_dir.to_path().join(format!(
            ".tmp-ca-{}-{}",
            std::process::id(),
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        remove_any(&scratch).await;

        let ca = match method_algorithm.method {
            ContentAddressMethod::Text | ContentAddressMethod::Flat => {
                let data = tokio::fs::read(payload).await?;
                let hash = method_algorithm.algorithm.digest(&data);
                tokio::fs::write(&scratch, &data).await?;
                crate::canonicalize::canonicalize_path_metadata(&scratch)?;
                if method_algorithm.method == ContentAddressMethod::Text {
                    ContentAddress::Text(Sha256::try_from(hash).map_err(|e| {
                        DaemonError::other(format!("text ingestion: {e}"))
                    })?)
                } else {
                    ContentAddress::Flat(hash)
                }
            }
            ContentAddressMethod::Recursive => {
                // The payload is a NAR serialization of the tree.
                let file = tokio::fs::File::open(payload).await?;
                let mut reader = tokio::io::BufReader::new(file);
                cantata_nar::restore_path(&mut reader, &scratch).await?;
                if method_algorithm.algorithm == Algorithm::SHA256 {
                    let (nar_hash, _, _) =
                        build::hash_and_scan(&scratch, &StorePathSet::new(), None).await?;
                    ContentAddress::Recursive(nar_hash.into())
                } else {
                    let mut hasher =
                        cantata_utils_hash::Context::new(method_algorithm.algorithm);
                    let mut stream =
                        cantata_nar::NarByteStream::new(scratch.clone());
                    use futures::StreamExt as _;
                    while let Some(chunk) = stream.next().await {
                        hasher.update(&chunk?);
                    }
                    ContentAddress::Recursive(hasher.finish())
                }
            }
        };

        let path = match &ca {
            ContentAddress::Text(digest) => store_dir.make_text_path(name, digest, references)?,
            other => store_dir.make_fixed_output_path(
                name,
                other,
                &StoreReferences {
                    others: references.clone(),
                    self_ref: false,
                },
            )?,
        };
        let full = store_dir.print_path(&path);
        let real = store_dir.real_path(&path);

        let already_valid = {
            let mut db = self.db.lock().await;
            let valid = db.is_valid_path(&full)?;
            if valid && repair {
                let _ = db.invalidate_path(&full);
            }
            valid && !repair
        };
        if already_valid {
            remove_any(&scratch).await;
            let info = self
                .query_path_info(&path)
                .await?
                .expect("valid path has info");
            return Ok((path, info));
        }
        if repair {
            remove_any(&real).await;
        }

        if real.exists() {
            remove_any(&scratch).await;
        } else {
            tokio::fs::rename(&scratch, &real).await?;
        }

        let (nar_hash, nar_size, _) =
            build::hash_and_scan(&real, &StorePathSet::new(), None).await?;
        {
            let mut db = self.db.lock().await;
            db.register_valid_path(&RegisterPathParams {
                path: full.clone(),
                hash: format!("{}", Base16(nar_hash)),
                registration_time: SystemTime::now(),
                deriver: None,
                nar_size: Some(nar_size),
                ultimate: true,
                sigs: None,
                ca: Some(ca.to_string()),
                references: references
                    .iter()
                    .map(|r| store_dir.print_path(r))
                    .collect(),
            })?;
        }

        info!(path = %full, "added content-addressed path");
        let info = self
            .query_path_info(&path)
            .await?
            .expect("freshly registered path has info");
        Ok((path, info))
    }

    /// Register a derivation's ATerm text as a store object.
    pub async fn add_derivation(&self, drv: &Derivation) -> DaemonResult<StorePath> {
        let store_dir = &self.config.store_dir;
        let text = derivation::aterm::unparse(store_dir, drv);
        let digest = Sha256::digest(&text);
        let references: StorePathSet = drv
            .input_srcs
            .iter()
            .chain(drv.input_drvs.keys())
            .cloned()
            .collect();
        let name = format!("{}.drv", drv.name);
        let path = store_dir.make_text_path(&name, &digest, &references)?;
        let full = store_dir.print_path(&path);
        let real = store_dir.real_path(&path);

        {
            let db = self.db.lock().await;
            if db.is_valid_path(&full)? {
                return Ok(path);
            }
        }
        if !real.exists() {
            tokio::fs::write(&real, &text).await?;
            crate::canonicalize::canonicalize_path_metadata(&real)?;
        }
        let (nar_hash, nar_size, _) =
            build::hash_and_scan(&real, &StorePathSet::new(), None).await?;
        let mut db = self.db.lock().await;
        db.register_valid_path(&RegisterPathParams {
            path: full,
            hash: format!("{}", Base16(nar_hash)),
            registration_time: SystemTime::now(),
            deriver: None,
            nar_size: Some(nar_size),
            ultimate: true,
            sigs: None,
            ca: Some(ContentAddress::Text(digest).to_string()),
            references: references
                .iter()
                .map(|r| self.config.store_dir.print_path(r))
                .collect(),
        })?;
        Ok(path)
    }

    pub async fn build_paths(
        &self,
        targets: &[DerivedPath],
        mode: BuildMode,
    ) -> DaemonResult<()> {
        self.worker.build_paths(targets, mode).await
    }

    /// Remote-build entry point: build a shipped basic derivation
    /// directly.
    pub async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv: &BasicDerivation,
        mode: BuildMode,
    ) -> DaemonResult<BuildResult> {
        let drv_hash = resolved_drv_hash(&self.config.store_dir, drv);
        build::build_derivation(&self.config, &self.db, drv_path, drv, mode, Some(drv_hash)).await
    }

    pub async fn ensure_path(&self, path: &StorePath) -> DaemonResult<()> {
        self.worker.ensure_path(path).await
    }

    pub async fn add_temp_root(&self, path: &StorePath) -> DaemonResult<()> {
        let full = self.config.store_dir.print_path(path);
        let mut guard = self
            .temp_roots
            .lock()
            .map_err(|_| DaemonError::other("temp roots poisoned"))?;
        if guard.is_none() {
            *guard = Some(TempRoots::open(&self.config.temproots_dir())?);
        }
        guard.as_mut().unwrap().add(&full)?;
        Ok(())
    }

    /// Register an indirect root: a symlink under `gcroots/auto`
    /// pointing at the user's own symlink.
    pub async fn add_indirect_root(&self, link: &str) -> DaemonResult<()> {
        let digest = Sha256::digest(link.as_bytes());
        let name = cantata_utils_hash::fmt::Bare(cantata_utils_hash::fmt::Base32(digest));
        let auto_link = self.config.auto_roots_dir().join(name.to_string());
        let _ = std::fs::remove_file(&auto_link);
        std::os::unix::fs::symlink(link, &auto_link)?;
        debug!(link, "added indirect root");
        Ok(())
    }

    /// Create a permanent root: `gc_root` becomes a symlink to the
    /// path, registered indirectly.
    pub async fn add_perm_root(&self, path: &StorePath, gc_root: &str) -> DaemonResult<String> {
        let target = self.config.store_dir.print_path(path);
        let root_path = Path::new(gc_root);
        if root_path.exists() {
            std::fs::remove_file(root_path)?;
        }
        std::os::unix::fs::symlink(&target, root_path)?;
        self.add_indirect_root(gc_root).await?;
        Ok(gc_root.to_owned())
    }

    pub async fn find_roots(&self) -> DaemonResult<BTreeMap<String, StorePath>> {
        let roots = gc::find_roots(&self.config, true).await?;
        let mut flattened = BTreeMap::new();
        for (path, links) in roots {
            for link in links {
                flattened.insert(link, path.clone());
            }
        }
        Ok(flattened)
    }

    pub async fn collect_garbage(&self, options: &GcOptions) -> DaemonResult<GcResult> {
        gc::collect_garbage(&self.config, &self.db, options).await
    }

    /// What realising `targets` would entail.
    pub async fn query_missing(&self, targets: &[DerivedPath]) -> DaemonResult<Missing> {
        let store_dir = &self.config.store_dir;
        let mut missing = Missing::default();
        let mut queue: Vec<DerivedPath> = targets.to_vec();
        let mut seen = StorePathSet::new();

        while let Some(target) = queue.pop() {
            match target {
                DerivedPath::Opaque(path) => {
                    if !seen.insert(path.clone()) {
                        continue;
                    }
                    if self.is_valid_path(&path).await? {
                        continue;
                    }
                    if let Some(info) = self.query_substituter_info(&path).await {
                        missing.nar_size += info.nar_size;
                        missing.download_size += info.nar_size;
                        missing.will_substitute.insert(path);
                    } else {
                        missing.unknown.insert(path);
                    }
                }
                DerivedPath::Built { drv_path, outputs } => {
                    if !seen.insert(drv_path.clone()) {
                        continue;
                    }
                    let real = store_dir.real_path(&drv_path);
                    let Ok(text) = tokio::fs::read_to_string(&real).await else {
                        missing.unknown.insert(drv_path);
                        continue;
                    };
                    let Ok(drv) =
                        derivation::aterm::parse(store_dir, &text, drv_path.derivation_name())
                    else {
                        missing.unknown.insert(drv_path);
                        continue;
                    };

                    let mut all_valid = true;
                    for (name, output) in &drv.outputs {
                        if !outputs.contains(name) {
                            continue;
                        }
                        match output.path(store_dir, &drv.name, name)? {
                            Some(path) if self.is_valid_path(&path).await? => {}
                            Some(path) => {
                                all_valid = false;
                                if self.query_substituter_info(&path).await.is_some() {
                                    missing.will_substitute.insert(path);
                                } else {
                                    missing.will_build.insert(drv_path.clone());
                                }
                            }
                            None => {
                                all_valid = false;
                                missing.will_build.insert(drv_path.clone());
                            }
                        }
                    }
                    if !all_valid {
                        for input_drv in drv.input_drvs.keys() {
                            queue.push(DerivedPath::Built {
                                drv_path: input_drv.clone(),
                                outputs: cantata_store_core::derived_path::OutputSpec::All,
                            });
                        }
                        for src in &drv.input_srcs {
                            queue.push(DerivedPath::Opaque(src.clone()));
                        }
                    }
                }
            }
        }
        Ok(missing)
    }

    async fn query_substituter_info(&self, path: &StorePath) -> Option<UnkeyedPathInfo> {
        use crate::substituter::SubstituterSource as _;
        let substituters = DaemonSubstituter::from_config(&self.config);
        for substituter in &substituters {
            if let Ok(Some(info)) = substituter.query_info(path).await {
                return Some(info);
            }
        }
        None
    }

    pub async fn query_closure(
        &self,
        paths: StorePathSet,
    ) -> DaemonResult<StorePathSet> {
        gc::compute_closure(&self.config, &self.db, paths).await
    }

    /// The closure of `paths`, references first, with metadata and
    /// on-disk locations.
    pub async fn export_closure_entries(
        &self,
        paths: &StorePathSet,
    ) -> DaemonResult<Vec<(StorePath, UnkeyedPathInfo, PathBuf)>> {
        let closure = self.query_closure(paths.clone()).await?;
        let ordered = topo_references_first(self, &closure).await?;
        let mut entries = Vec::with_capacity(ordered.len());
        for path in ordered {
            let info = self
                .query_path_info(&path)
                .await?
                .ok_or_else(|| DaemonError::InvalidPath(self.config.store_dir.print_path(&path)))?;
            let real = self.config.store_dir.real_path(&path);
            entries.push((path, info, real));
        }
        Ok(entries)
    }

    /// Export the closure of `paths` (references first) as a framed
    /// stream.
    pub async fn export_paths<W: AsyncWrite + Unpin + Send>(
        &self,
        paths: &StorePathSet,
        writer: &mut W,
    ) -> DaemonResult<()> {
        let ctx = self.wire_ctx();
        for (path, info, real) in self.export_closure_entries(paths).await? {
            export::export_path(
                writer,
                &ctx,
                &real,
                &path,
                &info.references,
                info.deriver.as_ref(),
            )
            .await?;
        }
        export::export_done(writer, &ctx).await?;
        Ok(())
    }

    /// Move an already-restored tree into place and register it.
    /// `got` is the hash and size of the NAR it was restored from,
    /// checked against `info` when that declares them.
    pub async fn register_restored_tree(
        &self,
        path: &StorePath,
        info: &UnkeyedPathInfo,
        tree: &Path,
        got: (NarHash, u64),
    ) -> DaemonResult<()> {
        let (got_hash, got_size) = got;
        let full = self.config.store_dir.print_path(path);
        if got_hash != info.nar_hash {
            return Err(DaemonError::HashMismatch {
                path: full,
                expected: info.nar_hash,
                got: got_hash,
            });
        }
        if info.nar_size != 0 && got_size != info.nar_size {
            return Err(DaemonError::SizeMismatch {
                path: full,
                expected: info.nar_size,
                got: got_size,
            });
        }

        {
            let db = self.db.lock().await;
            if db.is_valid_path(&full)? {
                return Ok(());
            }
        }
        let real = self.config.store_dir.real_path(path);
        if !real.exists() {
            tokio::fs::rename(tree, &real).await?;
        }
        let mut db = self.db.lock().await;
        if db.is_valid_path(&full)? {
            return Ok(());
        }
        db.register_valid_path(&RegisterPathParams {
            path: full,
            hash: format!("{}", Base16(got_hash)),
            registration_time: SystemTime::now(),
            deriver: info.deriver.as_ref().map(|d| self.config.store_dir.print_path(d)),
            nar_size: Some(got_size),
            ultimate: info.ultimate,
            sigs: if info.sigs.is_empty() {
                None
            } else {
                Some(info.sigs.join(" "))
            },
            ca: info.ca.clone(),
            references: info
                .references
                .iter()
                .map(|r| self.config.store_dir.print_path(r))
                .collect(),
        })?;
        Ok(())
    }

    /// Import a framed closure stream; entries register in stream
    /// order so references never dangle.
    pub async fn import_paths<R: AsyncRead + Unpin + Send>(
        &self,
        reader: &mut R,
    ) -> DaemonResult<Vec<StorePath>> {
        let ctx = self.wire_ctx();
        let staging = tempfile::Builder::new()
            .prefix("cantata-import-")
            .tempdir_in(self.config.builds_dir())?;
        let entries = export::import_paths(reader, &ctx, staging.path()).await?;

        let mut imported = Vec::new();
        for ImportedEntry {
            path,
            references,
            deriver,
            tree,
            nar_hash,
            nar_size,
        } in entries
        {
            let full = self.config.store_dir.print_path(&path);
            let real = self.config.store_dir.real_path(&path);
            {
                let db = self.db.lock().await;
                if db.is_valid_path(&full)? {
                    imported.push(path);
                    continue;
                }
            }
            if !real.exists() {
                tokio::fs::rename(&tree, &real).await?;
            }
            let mut db = self.db.lock().await;
            db.register_valid_path(&RegisterPathParams {
                path: full,
                hash: format!("{}", Base16(nar_hash)),
                registration_time: SystemTime::now(),
                deriver: deriver.map(|d| self.config.store_dir.print_path(&d)),
                nar_size: Some(nar_size),
                ultimate: false,
                sigs: None,
                ca: None,
                references: references
                    .iter()
                    .map(|r| self.config.store_dir.print_path(r))
                    .collect(),
            })?;
            imported.push(path);
        }
        Ok(imported)
    }
}

/// The stable hash of a resolved derivation, keying realisations.
pub fn resolved_drv_hash(store_dir: &StoreDir, drv: &BasicDerivation) -> Sha256 {
    let as_derivation = Derivation {
        name: drv.name.clone(),
        outputs: drv.outputs.clone(),
        input_srcs: drv.inputs.clone(),
        input_drvs: BTreeMap::new(),
        platform: drv.platform.clone(),
        builder: drv.builder.clone(),
        args: drv.args.clone(),
        env: drv.env.clone(),
    };
    Sha256::digest(derivation::aterm::unparse(store_dir, &as_derivation))
}

/// Order a closure so every path's references come before it.
async fn topo_references_first(
    store: &LocalStore,
    closure: &StorePathSet,
) -> DaemonResult<Vec<StorePath>> {
    let db = store.db.lock().await;
    let mut order = Vec::with_capacity(closure.len());
    let mut visited = StorePathSet::new();

    fn visit(
        store: &LocalStore,
        db: &StoreDb,
        closure: &StorePathSet,
        path: &StorePath,
        visited: &mut StorePathSet,
        order: &mut Vec<StorePath>,
    ) -> DaemonResult<()> {
        if !visited.insert(path.clone()) {
            return Ok(());
        }
        let full = store.config.store_dir.print_path(path);
        for reference in db.query_references(&full)? {
            if let Ok(parsed) = store.config.store_dir.parse_path(&reference) {
                if closure.contains(&parsed) && parsed != *path {
                    visit(store, db, closure, &parsed, visited, order)?;
                }
            }
        }
        order.push(path.clone());
        Ok(())
    }

    for path in closure {
        visit(store, &db, closure, path, &mut visited, &mut order)?;
    }
    Ok(order)
}

async fn remove_any(path: &Path) {
    let _ = tokio::fs::remove_dir_all(path).await;
    let _ = tokio::fs::remove_file(path).await;
}
