// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Wire protocol bindings for [`LocalStore`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use cantata_store_core::derivation::BasicDerivation;
use cantata_store_core::derived_path::{DerivedPath, OutputName};
use cantata_store_core::realisation::Realisation;
use cantata_store_core::store_path::{StorePath, StorePathSet};
use cantata_store_remote::error::ProtocolError;
use cantata_store_remote::protocol::types::{
    BuildMode, BuildResult, ClientOptions, GcOptions, GcResult, Missing,
};
use cantata_store_remote::serialization::UnkeyedPathInfo;
use cantata_store_remote::server::{
    AddCaToStoreRequest, AddToStoreNarRequest, RequestHandler, SpooledNar,
};
use cantata_store_remote::serve::{BuildOptions, ServeHandler};

use crate::local_store::LocalStore;

/// The daemon protocol surface of a local store.
#[derive(Clone)]
pub struct LocalStoreHandler {
    store: Arc<LocalStore>,
    trusted: bool,
}

impl LocalStoreHandler {
    pub fn new(store: Arc<LocalStore>, trusted: bool) -> Self {
        LocalStoreHandler { store, trusted }
    }
}

impl RequestHandler for LocalStoreHandler {
    fn is_trusted(&self) -> bool {
        self.trusted
    }

    fn spool_dir(&self) -> PathBuf {
        self.store.config.builds_dir()
    }

    async fn set_options(&self, _options: ClientOptions) -> Result<(), ProtocolError> {
        // Per-connection options are accepted for compatibility; the
        // daemon's own configuration governs builds.
        Ok(())
    }

    async fn is_valid_path(&self, path: StorePath) -> Result<bool, ProtocolError> {
        Ok(self.store.is_valid_path(&path).await?)
    }

    async fn query_valid_paths(
        &self,
        paths: StorePathSet,
        substitute: bool,
    ) -> Result<StorePathSet, ProtocolError> {
        let mut valid = StorePathSet::new();
        for path in paths {
            if substitute && !self.store.is_valid_path(&path).await? {
                let _ = self.store.ensure_path(&path).await;
            }
            if self.store.is_valid_path(&path).await? {
                valid.insert(path);
            }
        }
        Ok(valid)
    }

    async fn query_all_valid_paths(&self) -> Result<StorePathSet, ProtocolError> {
        let all = {
            let db = self.store.db.lock().await;
            db.query_all_valid_paths()
                .map_err(crate::error::DaemonError::from)?
        };
        Ok(all
            .iter()
            .filter_map(|p| self.store.store_dir().parse_path(p).ok())
            .collect())
    }

    async fn query_path_info(
        &self,
        path: StorePath,
    ) -> Result<Option<UnkeyedPathInfo>, ProtocolError> {
        Ok(self.store.query_path_info(&path).await?)
    }

    async fn query_path_from_hash_part(
        &self,
        hash_part: String,
    ) -> Result<Option<StorePath>, ProtocolError> {
        let found = {
            let db = self.store.db.lock().await;
            db.query_path_from_hash_part(self.store.store_dir().to_str(), &hash_part)
                .map_err(crate::error::DaemonError::from)?
        };
        Ok(found.and_then(|p| self.store.store_dir().parse_path(&p).ok()))
    }

    async fn query_referrers(&self, path: StorePath) -> Result<StorePathSet, ProtocolError> {
        let referrers = {
            let db = self.store.db.lock().await;
            db.query_referrers(&self.store.store_dir().print_path(&path))
                .map_err(crate::error::DaemonError::from)?
        };
        Ok(referrers
            .iter()
            .filter_map(|p| self.store.store_dir().parse_path(p).ok())
            .collect())
    }

    async fn query_valid_derivers(
        &self,
        path: StorePath,
    ) -> Result<StorePathSet, ProtocolError> {
        let derivers = {
            let db = self.store.db.lock().await;
            db.query_valid_derivers(&self.store.store_dir().print_path(&path))
                .map_err(crate::error::DaemonError::from)?
        };
        Ok(derivers
            .iter()
            .filter_map(|p| self.store.store_dir().parse_path(p).ok())
            .collect())
    }

    async fn nar_source_path(&self, path: StorePath) -> Result<PathBuf, ProtocolError> {
        Ok(self.store.nar_source_path(&path).await?)
    }

    async fn add_to_store_nar(
        &self,
        request: AddToStoreNarRequest,
        nar: SpooledNar,
    ) -> Result<(), ProtocolError> {
        self.store
            .add_to_store_nar(
                &request.path,
                &request.info,
                &nar.file,
                request.repair,
                request.dont_check_sigs || self.trusted,
            )
            .await?;
        Ok(())
    }

    async fn add_ca_to_store(
        &self,
        request: AddCaToStoreRequest,
        payload: SpooledNar,
    ) -> Result<(StorePath, UnkeyedPathInfo), ProtocolError> {
        let method_algorithm = request
            .method_algorithm
            .parse()
            .map_err(|e| ProtocolError::invalid_field("camStr", format!("{e}")))?;
        Ok(self
            .store
            .add_ca_to_store(
                &request.name,
                method_algorithm,
                &request.references,
                request.repair,
                &payload.file,
            )
            .await?)
    }

    async fn build_paths(
        &self,
        targets: Vec<DerivedPath>,
        mode: BuildMode,
    ) -> Result<(), ProtocolError> {
        Ok(self.store.build_paths(&targets, mode).await?)
    }

    async fn build_derivation(
        &self,
        drv_path: StorePath,
        drv: BasicDerivation,
        mode: BuildMode,
    ) -> Result<BuildResult, ProtocolError> {
        Ok(self.store.build_derivation(&drv_path, &drv, mode).await?)
    }

    async fn ensure_path(&self, path: StorePath) -> Result<(), ProtocolError> {
        Ok(self.store.ensure_path(&path).await?)
    }

    async fn add_temp_root(&self, path: StorePath) -> Result<(), ProtocolError> {
        Ok(self.store.add_temp_root(&path).await?)
    }

    async fn add_indirect_root(&self, link: String) -> Result<(), ProtocolError> {
        Ok(self.store.add_indirect_root(&link).await?)
    }

    async fn add_perm_root(
        &self,
        path: StorePath,
        gc_root: String,
    ) -> Result<String, ProtocolError> {
        Ok(self.store.add_perm_root(&path, &gc_root).await?)
    }

    async fn find_roots(&self) -> Result<BTreeMap<String, StorePath>, ProtocolError> {
        Ok(self.store.find_roots().await?)
    }

    async fn collect_garbage(&self, options: GcOptions) -> Result<GcResult, ProtocolError> {
        Ok(self.store.collect_garbage(&options).await?)
    }

    async fn query_missing(
        &self,
        targets: Vec<DerivedPath>,
    ) -> Result<Missing, ProtocolError> {
        Ok(self.store.query_missing(&targets).await?)
    }

    async fn query_derivation_output_map(
        &self,
        drv_path: StorePath,
    ) -> Result<BTreeMap<OutputName, Option<StorePath>>, ProtocolError> {
        let store_dir = self.store.store_dir().clone();
        let real = store_dir.real_path(&drv_path);
        let text = tokio::fs::read_to_string(&real)
            .await
            .map_err(|e| ProtocolError::custom(format!("reading '{drv_path}': {e}")))?;
        let drv = cantata_store_core::derivation::aterm::parse(
            &store_dir,
            &text,
            drv_path.derivation_name(),
        )
        .map_err(|e| ProtocolError::custom(format!("parsing '{drv_path}': {e}")))?;

        let mut map = BTreeMap::new();
        let recorded = {
            let db = self.store.db.lock().await;
            db.query_derivation_outputs(&store_dir.print_path(&drv_path))
                .map_err(crate::error::DaemonError::from)?
        };
        for (name, output) in &drv.outputs {
            let path = match output
                .path(&store_dir, &drv.name, name)
                .map_err(crate::error::DaemonError::from)?
            {
                Some(path) => Some(path),
                None => recorded
                    .iter()
                    .find(|row| row.output_name == name.as_str())
                    .and_then(|row| store_dir.parse_path(&row.path).ok()),
            };
            map.insert(name.clone(), path);
        }
        Ok(map)
    }

    async fn register_drv_output(
        &self,
        realisation: Realisation,
    ) -> Result<(), ProtocolError> {
        let db = self.store.db.lock().await;
        db.register_realisation(
            &realisation.id.to_string(),
            &self.store.store_dir().print_path(&realisation.out_path),
            None,
        )
        .map_err(crate::error::DaemonError::from)?;
        Ok(())
    }

    async fn query_realisation(
        &self,
        drv_output: String,
    ) -> Result<Vec<Realisation>, ProtocolError> {
        let row = {
            let db = self.store.db.lock().await;
            db.query_realisation(&drv_output)
                .map_err(crate::error::DaemonError::from)?
        };
        let Some(row) = row else {
            return Ok(Vec::new());
        };
        let id = row
            .drv_output
            .parse()
            .map_err(|e| ProtocolError::custom(format!("corrupt realisation id: {e}")))?;
        let out_path = self
            .store
            .store_dir()
            .parse_path(&row.output_path)
            .map_err(|e| ProtocolError::custom(format!("corrupt realisation path: {e}")))?;
        Ok(vec![Realisation {
            id,
            out_path,
            signatures: row
                .signatures
                .as_deref()
                .map(|s| s.split_whitespace().filter_map(|x| x.parse().ok()).collect())
                .unwrap_or_default(),
            dependent_realisations: BTreeMap::new(),
        }])
    }

    async fn add_signatures(
        &self,
        path: StorePath,
        sigs: Vec<String>,
    ) -> Result<(), ProtocolError> {
        let db = self.store.db.lock().await;
        db.add_signatures(&self.store.store_dir().print_path(&path), &sigs)
            .map_err(crate::error::DaemonError::from)?;
        Ok(())
    }
}

impl ServeHandler for LocalStoreHandler {
    async fn query_valid_paths(
        &self,
        paths: StorePathSet,
        _lock: bool,
        substitute: bool,
    ) -> Result<StorePathSet, ProtocolError> {
        RequestHandler::query_valid_paths(self, paths, substitute).await
    }

    async fn query_path_infos(
        &self,
        paths: StorePathSet,
    ) -> Result<Vec<(StorePath, UnkeyedPathInfo)>, ProtocolError> {
        let mut infos = Vec::new();
        for path in paths {
            if let Some(info) = self.store.query_path_info(&path).await? {
                infos.push((path, info));
            }
        }
        Ok(infos)
    }

    async fn nar_source_path(&self, path: StorePath) -> Result<PathBuf, ProtocolError> {
        Ok(self.store.nar_source_path(&path).await?)
    }

    async fn query_closure(
        &self,
        paths: StorePathSet,
        _include_outputs: bool,
    ) -> Result<StorePathSet, ProtocolError> {
        Ok(self.store.query_closure(paths).await?)
    }

    async fn build_derivation(
        &self,
        drv_path: StorePath,
        drv: BasicDerivation,
        _options: BuildOptions,
    ) -> Result<BuildResult, ProtocolError> {
        Ok(self
            .store
            .build_derivation(&drv_path, &drv, BuildMode::Normal)
            .await?)
    }

    async fn build_paths(
        &self,
        paths: StorePathSet,
        _options: BuildOptions,
    ) -> Result<(), ProtocolError> {
        let targets: Vec<DerivedPath> = paths
            .into_iter()
            .map(|path| {
                if path.is_derivation() {
                    DerivedPath::Built {
                        drv_path: path,
                        outputs: cantata_store_core::derived_path::OutputSpec::All,
                    }
                } else {
                    DerivedPath::Opaque(path)
                }
            })
            .collect();
        Ok(self.store.build_paths(&targets, BuildMode::Normal).await?)
    }

    fn staging_dir(&self) -> PathBuf {
        self.store.config.builds_dir()
    }

    async fn export_closure(
        &self,
        paths: StorePathSet,
    ) -> Result<Vec<(StorePath, cantata_store_remote::serialization::UnkeyedPathInfo, PathBuf)>, ProtocolError>
    {
        Ok(self.store.export_closure_entries(&paths).await?)
    }

    async fn register_imported(
        &self,
        entries: Vec<cantata_store_remote::export::ImportedEntry>,
    ) -> Result<Vec<StorePath>, ProtocolError> {
        let mut imported = Vec::with_capacity(entries.len());
        for entry in entries {
            let info = cantata_store_remote::serialization::UnkeyedPathInfo {
                deriver: entry.deriver,
                nar_hash: entry.nar_hash,
                references: entry.references,
                registration_time: 0,
                nar_size: entry.nar_size,
                ultimate: false,
                sigs: Vec::new(),
                ca: None,
            };
            self.store
                .register_restored_tree(
                    &entry.path,
                    &info,
                    &entry.tree,
                    (entry.nar_hash, entry.nar_size),
                )
                .await?;
            imported.push(entry.path);
        }
        Ok(imported)
    }

    async fn add_restored_nar(
        &self,
        path: StorePath,
        info: cantata_store_remote::serialization::UnkeyedPathInfo,
        tree: PathBuf,
        got: (cantata_utils_hash::NarHash, u64),
    ) -> Result<(), ProtocolError> {
        Ok(self
            .store
            .register_restored_tree(&path, &info, &tree, got)
            .await?)
    }
}
