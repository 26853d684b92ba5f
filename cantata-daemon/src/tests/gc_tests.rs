// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Garbage collection scenarios.

use cantata_store_core::store_path::StorePathSet;
use cantata_store_remote::protocol::types::{GcAction, GcOptions};

use crate::gc;
use crate::temproots::TempRoots;

use super::TestStore;

/// A permanent root keeps a path (and nothing protects it once the
/// root is gone).
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gc_respects_permanent_roots() {
    let ts = TestStore::new();
    let path = ts.add_flat_file("rooted", b"keep me\n").await;
    let real = ts.store.store_dir().real_path(&path);

    let root_link = ts.store.config.gcroots_dir().join("my-root");
    std::os::unix::fs::symlink(&real, &root_link).unwrap();

    let result = ts
        .store
        .collect_garbage(&GcOptions::delete_dead())
        .await
        .unwrap();
    assert!(result.paths.is_empty(), "rooted path must survive: {:?}", result.paths);
    assert!(ts.store.is_valid_path(&path).await.unwrap());
    assert!(real.exists());

    std::fs::remove_file(&root_link).unwrap();
    let result = ts
        .store
        .collect_garbage(&GcOptions::delete_dead())
        .await
        .unwrap();
    assert_eq!(result.paths.len(), 1);
    assert!(!ts.store.is_valid_path(&path).await.unwrap());
    assert!(!real.exists());
}

/// Liveness follows references: a rooted referrer keeps its references
/// alive.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gc_keeps_closure() {
    let ts = TestStore::new();
    let dep = ts.add_flat_file("dep", b"dep\n").await;

    // Build a referrer whose contents embed dep's hash part.
    let payload = format!("points at {}\n", ts.store.store_dir().print_path(&dep));
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f");
    std::fs::write(&file, payload).unwrap();
    let (top, _info) = ts
        .store
        .add_ca_to_store(
            "top",
            "sha256".parse().unwrap(),
            &[dep.clone()].into_iter().collect(),
            false,
            &file,
        )
        .await
        .unwrap();

    let root_link = ts.store.config.gcroots_dir().join("top-root");
    std::os::unix::fs::symlink(ts.store.store_dir().real_path(&top), &root_link).unwrap();

    ts.store
        .collect_garbage(&GcOptions::delete_dead())
        .await
        .unwrap();
    assert!(ts.store.is_valid_path(&dep).await.unwrap());
    assert!(ts.store.is_valid_path(&top).await.unwrap());
}

/// Deleting a chain of specific paths works referrers-first.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_specific_in_reference_order() {
    let ts = TestStore::new();
    let c = ts.add_flat_file("c-leaf", b"c\n").await;

    let dir = tempfile::tempdir().unwrap();
    let file_b = dir.path().join("b");
    std::fs::write(&file_b, format!("ref {}", ts.store.store_dir().print_path(&c))).unwrap();
    let (b, _) = ts
        .store
        .add_ca_to_store(
            "b-mid",
            "sha256".parse().unwrap(),
            &[c.clone()].into_iter().collect(),
            false,
            &file_b,
        )
        .await
        .unwrap();

    let file_a = dir.path().join("a");
    std::fs::write(&file_a, format!("ref {}", ts.store.store_dir().print_path(&b))).unwrap();
    let (a, _) = ts
        .store
        .add_ca_to_store(
            "a-top",
            "sha256".parse().unwrap(),
            &[b.clone()].into_iter().collect(),
            false,
            &file_a,
        )
        .await
        .unwrap();

    let targets: StorePathSet = [a.clone(), b.clone(), c.clone()].into_iter().collect();
    let result = ts
        .store
        .collect_garbage(&GcOptions::delete_specific(targets))
        .await
        .unwrap();

    // All three went, referrers before referents.
    let full = |p| ts.store.store_dir().print_path(p);
    assert_eq!(result.paths, vec![full(&a), full(&b), full(&c)]);
    for path in [&a, &b, &c] {
        assert!(!ts.store.is_valid_path(path).await.unwrap());
    }
}

/// A live path cannot be deleted specifically unless liveness is
/// ignored; and a referenced path survives regardless.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_specific_respects_liveness() {
    let ts = TestStore::new();
    let path = ts.add_flat_file("pinned", b"pinned\n").await;
    let root_link = ts.store.config.gcroots_dir().join("pin");
    std::os::unix::fs::symlink(ts.store.store_dir().real_path(&path), &root_link).unwrap();

    let err = ts
        .store
        .collect_garbage(&GcOptions::delete_specific(
            [path.clone()].into_iter().collect(),
        ))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("still alive"), "got: {err}");

    let mut options = GcOptions::delete_specific([path.clone()].into_iter().collect());
    options.ignore_liveness = true;
    let result = ts.store.collect_garbage(&options).await.unwrap();
    assert_eq!(result.paths.len(), 1);
}

/// Temp roots of a live handle protect paths from DeleteDead.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn temp_roots_protect() {
    let ts = TestStore::new();
    let path = ts.add_flat_file("ephemeral", b"hold\n").await;

    let mut temp = TempRoots::open(&ts.store.config.temproots_dir()).unwrap();
    temp.add(&ts.store.store_dir().print_path(&path)).unwrap();

    ts.store
        .collect_garbage(&GcOptions::delete_dead())
        .await
        .unwrap();
    assert!(ts.store.is_valid_path(&path).await.unwrap());

    drop(temp);
    ts.store
        .collect_garbage(&GcOptions::delete_dead())
        .await
        .unwrap();
    assert!(!ts.store.is_valid_path(&path).await.unwrap());
}

/// Indirect roots protect through two symlink hops and vanish with the
/// user link.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn indirect_roots() {
    let ts = TestStore::new();
    let path = ts.add_flat_file("indirect", b"x\n").await;
    let real = ts.store.store_dir().real_path(&path);

    let dir = tempfile::tempdir().unwrap();
    let user_link = dir.path().join("result");
    std::os::unix::fs::symlink(&real, &user_link).unwrap();
    ts.store
        .add_indirect_root(user_link.to_str().unwrap())
        .await
        .unwrap();

    ts.store
        .collect_garbage(&GcOptions::delete_dead())
        .await
        .unwrap();
    assert!(ts.store.is_valid_path(&path).await.unwrap());

    // Removing the user link kills the root.
    std::fs::remove_file(&user_link).unwrap();
    ts.store
        .collect_garbage(&GcOptions::delete_dead())
        .await
        .unwrap();
    assert!(!ts.store.is_valid_path(&path).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn return_live_and_dead() {
    let ts = TestStore::new();
    let live = ts.add_flat_file("live", b"live\n").await;
    let dead = ts.add_flat_file("dead", b"dead\n").await;
    let root_link = ts.store.config.gcroots_dir().join("live-root");
    std::os::unix::fs::symlink(ts.store.store_dir().real_path(&live), &root_link).unwrap();

    let live_result = ts
        .store
        .collect_garbage(&GcOptions {
            action: GcAction::ReturnLive,
            ignore_liveness: false,
            paths_to_delete: Default::default(),
            max_freed: 0,
        })
        .await
        .unwrap();
    assert!(live_result
        .paths
        .contains(&ts.store.store_dir().print_path(&live)));

    let dead_result = ts
        .store
        .collect_garbage(&GcOptions {
            action: GcAction::ReturnDead,
            ignore_liveness: false,
            paths_to_delete: Default::default(),
            max_freed: 0,
        })
        .await
        .unwrap();
    assert!(dead_result
        .paths
        .contains(&ts.store.store_dir().print_path(&dead)));
    // Nothing was deleted by the reporting modes.
    assert!(ts.store.is_valid_path(&dead).await.unwrap());

    let roots = gc::find_roots(&ts.store.config, true).await.unwrap();
    assert!(roots.contains_key(&live));
}
