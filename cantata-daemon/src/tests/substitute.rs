// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Substituter fallback behaviour.

use std::collections::BTreeMap;
use std::path::Path;

use cantata_store_core::store_path::{StorePath, StorePathSet};
use cantata_store_remote::serialization::UnkeyedPathInfo;
use cantata_utils_hash::NarHash;

use crate::error::{DaemonError, DaemonResult};
use crate::substituter::{SubstituterSource, substitute_path};

use super::TestStore;

/// An in-memory substituter: a map from path to (declared info, source
/// tree). Fetching dumps the tree; a lying entry declares a hash that
/// does not match its tree.
struct MockSubstituter {
    url: String,
    entries: BTreeMap<StorePath, (UnkeyedPathInfo, std::path::PathBuf)>,
}

impl MockSubstituter {
    fn empty(url: &str) -> Self {
        MockSubstituter {
            url: url.to_owned(),
            entries: BTreeMap::new(),
        }
    }
}

impl SubstituterSource for MockSubstituter {
    fn url(&self) -> &str {
        &self.url
    }

    async fn query_info(&self, path: &StorePath) -> DaemonResult<Option<UnkeyedPathInfo>> {
        Ok(self.entries.get(path).map(|(info, _)| info.clone()))
    }

    async fn fetch_nar(&self, path: &StorePath, dest: &Path) -> DaemonResult<(NarHash, u64)> {
        let (_, tree) = self
            .entries
            .get(path)
            .ok_or_else(|| DaemonError::NoSubstituters(path.clone()))?;
        let mut nar = Vec::new();
        cantata_nar::dump_path(tree, &mut nar).await.unwrap();
        let mut reader = nar.as_slice();
        cantata_nar::restore_path(&mut reader, dest).await?;
        let hash = NarHash::try_from(cantata_utils_hash::Algorithm::SHA256.digest(&nar))
            .unwrap();
        Ok((hash, nar.len() as u64))
    }
}

/// Build an entry whose declared metadata matches (or deliberately does
/// not match) the tree contents.
async fn entry(
    store: &TestStore,
    dir: &Path,
    name: &str,
    contents: &[u8],
    lie: bool,
) -> (StorePath, UnkeyedPathInfo, std::path::PathBuf) {
    let file = dir.join(name);
    std::fs::write(&file, contents).unwrap();
    let mut nar = Vec::new();
    cantata_nar::dump_path(&file, &mut nar).await.unwrap();
    let true_hash =
        NarHash::try_from(cantata_utils_hash::Algorithm::SHA256.digest(&nar)).unwrap();
    let declared = if lie {
        NarHash::try_from(cantata_utils_hash::Algorithm::SHA256.digest(b"something else"))
            .unwrap()
    } else {
        true_hash
    };
    let digest = cantata_utils_hash::Sha256::digest(contents);
    let path = store
        .store
        .store_dir()
        .make_source_path(name, &digest, &Default::default())
        .unwrap();
    let info = UnkeyedPathInfo {
        deriver: None,
        nar_hash: declared,
        references: StorePathSet::new(),
        registration_time: 0,
        nar_size: nar.len() as u64,
        ultimate: false,
        sigs: Vec::new(),
        // Self-authenticating, so the signature policy stays out of the
        // way of these tests.
        ca: Some(
            cantata_store_core::content_address::ContentAddress::Recursive(
                cantata_utils_hash::Hash::from(true_hash),
            )
            .to_string(),
        ),
    };
    (path, info, file)
}

/// The first substituter does not know the path; the second supplies
/// it, and its copy registers.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fallback_to_second_substituter() {
    let ts = TestStore::new();
    let dir = tempfile::tempdir().unwrap();
    let (path, info, tree) = entry(&ts, dir.path(), "wanted", b"substituted\n", false).await;

    let first = MockSubstituter::empty("mock://first");
    let mut second = MockSubstituter::empty("mock://second");
    second.entries.insert(path.clone(), (info, tree));

    substitute_path(&ts.store.config, &ts.store.db, &[first, second], &path)
        .await
        .unwrap();

    assert!(ts.store.is_valid_path(&path).await.unwrap());
    let real = ts.store.store_dir().real_path(&path);
    assert_eq!(std::fs::read(&real).unwrap(), b"substituted\n");
}

/// A substituter delivering bytes that do not match its declared hash
/// fails the request, and nothing registers.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hash_mismatch_is_fatal() {
    let ts = TestStore::new();
    let dir = tempfile::tempdir().unwrap();
    let (path, info, tree) = entry(&ts, dir.path(), "liar", b"bad bytes\n", true).await;

    let first = MockSubstituter::empty("mock://first");
    let mut second = MockSubstituter::empty("mock://second");
    second.entries.insert(path.clone(), (info, tree));

    let err = substitute_path(&ts.store.config, &ts.store.db, &[first, second], &path)
        .await
        .unwrap_err();
    assert!(
        matches!(err, DaemonError::HashMismatch { .. }),
        "got: {err}"
    );
    assert!(!ts.store.is_valid_path(&path).await.unwrap());
    assert!(!ts.store.store_dir().real_path(&path).exists());
}

/// "Nobody knows the path" is distinct from "substituters failed".
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_path_reported() {
    let ts = TestStore::new();
    let path: StorePath = "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-nowhere".parse().unwrap();
    let subs = [MockSubstituter::empty("mock://only")];
    let err = substitute_path(&ts.store.config, &ts.store.db, &subs, &path)
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::NoSubstituters(_)), "got: {err}");
}

/// References are pulled in before the path that needs them.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn references_substituted_first() {
    let ts = TestStore::new();
    let dir = tempfile::tempdir().unwrap();
    let (dep_path, dep_info, dep_tree) =
        entry(&ts, dir.path(), "dep", b"dep contents\n", false).await;
    let (top_path, mut top_info, top_tree) =
        entry(&ts, dir.path(), "top", b"top contents\n", false).await;
    top_info.references.insert(dep_path.clone());

    let mut sub = MockSubstituter::empty("mock://all");
    sub.entries.insert(dep_path.clone(), (dep_info, dep_tree));
    sub.entries.insert(top_path.clone(), (top_info, top_tree));

    substitute_path(&ts.store.config, &ts.store.db, &[sub], &top_path)
        .await
        .unwrap();

    assert!(ts.store.is_valid_path(&dep_path).await.unwrap());
    let info = ts.store.query_path_info(&top_path).await.unwrap().unwrap();
    assert!(info.references.contains(&dep_path));
}
