// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! A scratch store for tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use cantata_store_core::derivation::{Derivation, DerivationOutput, hash_modulo};
use cantata_store_core::derived_path::OutputName;
use cantata_store_core::store_path::{StorePath, StorePathSet};
use cantata_store_core::ByteString;

use crate::config::DaemonConfig;
use crate::local_store::LocalStore;

pub(crate) struct TestStore {
    pub store: Arc<LocalStore>,
    // Keeps the scratch directory alive for the store's lifetime.
    _dir: tempfile::TempDir,
}

impl TestStore {
    pub fn new() -> TestStore {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::test_config(dir.path());
        let store = LocalStore::open(config).unwrap();
        TestStore { store, _dir: dir }
    }

    /// Add a flat file with the given contents, sha256
    /// content-addressed.
    pub async fn add_flat_file(&self, name: &str, contents: &[u8]) -> StorePath {
        let payload = self._dir.path().join("payload");
        tokio::fs::write(&payload, contents).await.unwrap();
        let (path, _info) = self
            .store
            .add_ca_to_store(
                name,
                "sha256".parse().unwrap(),
                &StorePathSet::new(),
                false,
                &payload,
            )
            .await
            .unwrap();
        path
    }

    /// A single-output input-addressed derivation running
    /// `/bin/sh -c <script>`, with its output path filled in and the
    /// `.drv` registered in the store.
    pub async fn shell_derivation(&self, name: &str, script: &str) -> (StorePath, Derivation) {
        let store_dir = self.store.store_dir().clone();
        let out = OutputName::default();
        let mut env = BTreeMap::new();
        env.insert(ByteString::from_static(b"out"), ByteString::new());

        let mut drv = Derivation {
            name: name.parse().unwrap(),
            outputs: [(out.clone(), DerivationOutput::Deferred)].into_iter().collect(),
            input_srcs: Default::default(),
            input_drvs: Default::default(),
            platform: ByteString::from(DaemonConfig::host_platform()),
            builder: ByteString::from_static(b"/bin/sh"),
            args: vec![
                ByteString::from_static(b"-c"),
                ByteString::from(script.to_owned()),
            ],
            env,
        };

        let modulo = hash_modulo(&store_dir, &drv, &BTreeMap::new()).unwrap();
        let out_path = drv.compute_output_path(&store_dir, &modulo, &out).unwrap();
        drv.outputs
            .insert(out.clone(), DerivationOutput::InputAddressed(out_path.clone()));
        drv.env.insert(
            ByteString::from_static(b"out"),
            ByteString::from(store_dir.print_path(&out_path)),
        );

        let drv_path = self.store.add_derivation(&drv).await.unwrap();
        (drv_path, drv)
    }

    /// The declared output path of a single-output derivation.
    pub fn out_path(&self, drv: &Derivation) -> StorePath {
        match drv.outputs.values().next().unwrap() {
            DerivationOutput::InputAddressed(path) => path.clone(),
            DerivationOutput::CAFixed(ca) => self
                .store
                .store_dir()
                .make_fixed_output_path(&drv.name, ca, &Default::default())
                .unwrap(),
            _ => panic!("output path not known before the build"),
        }
    }
}
