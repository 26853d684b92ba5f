// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Ingestion round trips.

use cantata_store_core::store_path::StorePathSet;

use super::TestStore;

/// Adding a small flat file yields a deterministic path and the
/// expected metadata.
#[tokio::test]
async fn add_flat_file_roundtrip() {
    let ts = TestStore::new();
    let path = ts.add_flat_file("hello", b"hello\n").await;
    assert_eq!(path.name().as_ref(), "hello");

    assert!(ts.store.is_valid_path(&path).await.unwrap());
    let info = ts.store.query_path_info(&path).await.unwrap().unwrap();
    // The NAR of a 6-byte regular file is 120 bytes.
    assert_eq!(info.nar_size, 120);
    assert!(info.references.is_empty());
    assert!(info.ca.is_some());

    // The on-disk object matches.
    let real = ts.store.store_dir().real_path(&path);
    assert_eq!(std::fs::read(&real).unwrap(), b"hello\n");

    // Same content, same path.
    let again = ts.add_flat_file("hello", b"hello\n").await;
    assert_eq!(again, path);
}

#[tokio::test]
async fn different_content_different_path() {
    let ts = TestStore::new();
    let a = ts.add_flat_file("hello", b"hello\n").await;
    let b = ts.add_flat_file("hello", b"world\n").await;
    assert_ne!(a, b);
}

#[tokio::test]
async fn nar_roundtrip_through_store() {
    let ts = TestStore::new();
    let path = ts.add_flat_file("data", b"some bytes").await;

    // Export the NAR and bring it back under a different store's
    // metadata check.
    let real = ts.store.nar_source_path(&path).await.unwrap();
    let mut nar = Vec::new();
    cantata_nar::dump_path(&real, &mut nar).await.unwrap();

    let info = ts.store.query_path_info(&path).await.unwrap().unwrap();
    assert_eq!(info.nar_size as usize, nar.len());
}

#[tokio::test]
async fn recursive_ingestion() {
    let ts = TestStore::new();
    let dir = tempfile::tempdir().unwrap();
    let tree = dir.path().join("tree");
    std::fs::create_dir(&tree).unwrap();
    std::fs::write(tree.join("file"), b"payload").unwrap();

    let mut nar = Vec::new();
    cantata_nar::dump_path(&tree, &mut nar).await.unwrap();
    let payload = dir.path().join("payload.nar");
    std::fs::write(&payload, &nar).unwrap();

    let (path, info) = ts
        .store
        .add_ca_to_store(
            "tree",
            "r:sha256".parse().unwrap(),
            &StorePathSet::new(),
            false,
            &payload,
        )
        .await
        .unwrap();
    assert_eq!(info.nar_size as usize, nar.len());
    let real = ts.store.store_dir().real_path(&path);
    assert_eq!(std::fs::read(real.join("file")).unwrap(), b"payload");
}

#[tokio::test]
async fn export_import_roundtrip() {
    let ts = TestStore::new();
    let dep = ts.add_flat_file("dep", b"dep contents").await;
    let top = ts.add_flat_file("top", b"top contents").await;

    let paths: StorePathSet = [dep.clone(), top.clone()].into_iter().collect();
    let mut stream = Vec::new();
    ts.store.export_paths(&paths, &mut stream).await.unwrap();

    let other = TestStore::new();
    let mut reader = stream.as_slice();
    let imported = other.store.import_paths(&mut reader).await.unwrap();
    assert_eq!(imported.len(), 2);
    assert!(other.store.is_valid_path(&dep).await.unwrap());
    assert!(other.store.is_valid_path(&top).await.unwrap());
}
