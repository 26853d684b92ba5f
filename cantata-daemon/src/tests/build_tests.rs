// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! End-to-end builds through the goal engine.

use std::collections::BTreeMap;

use cantata_store_core::content_address::ContentAddress;
use cantata_store_core::derivation::{Derivation, DerivationOutput};
use cantata_store_core::derived_path::{DerivedPath, OutputSpec};
use cantata_store_core::ByteString;
use cantata_store_remote::protocol::types::{BuildMode, BuildStatus};
use cantata_utils_hash::Algorithm;

use crate::config::DaemonConfig;

use super::TestStore;

fn built(drv_path: &cantata_store_core::StorePath) -> DerivedPath {
    DerivedPath::Built {
        drv_path: drv_path.clone(),
        outputs: OutputSpec::All,
    }
}

/// A trivial shell derivation builds, its output is registered with the
/// right contents, metadata and deriver linkage.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trivial_build() {
    let ts = TestStore::new();
    let (drv_path, drv) = ts.shell_derivation("trivial", "echo foo > $out").await;
    let out = ts.out_path(&drv);

    ts.store
        .build_paths(&[built(&drv_path)], BuildMode::Normal)
        .await
        .unwrap();

    assert!(ts.store.is_valid_path(&out).await.unwrap());
    let real = ts.store.store_dir().real_path(&out);
    assert_eq!(std::fs::read(&real).unwrap(), b"foo\n");

    let info = ts.store.query_path_info(&out).await.unwrap().unwrap();
    assert_eq!(info.deriver.as_ref(), Some(&drv_path));
    assert!(info.ultimate);

    // The derivation-output table records the linkage both ways.
    let db = ts.store.db.lock().await;
    let outputs = db
        .query_derivation_outputs(&ts.store.store_dir().print_path(&drv_path))
        .unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].path, ts.store.store_dir().print_path(&out));
    let derivers = db
        .query_valid_derivers(&ts.store.store_dir().print_path(&out))
        .unwrap();
    assert!(derivers.contains(&ts.store.store_dir().print_path(&drv_path)));
}

/// Rebuilding a valid derivation is a no-op.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_build_is_noop() {
    let ts = TestStore::new();
    let (drv_path, drv) = ts.shell_derivation("idempotent", "echo foo > $out").await;
    let out = ts.out_path(&drv);

    ts.store
        .build_paths(&[built(&drv_path)], BuildMode::Normal)
        .await
        .unwrap();
    let first = ts.store.query_path_info(&out).await.unwrap().unwrap();

    ts.store
        .build_paths(&[built(&drv_path)], BuildMode::Normal)
        .await
        .unwrap();
    let second = ts.store.query_path_info(&out).await.unwrap().unwrap();
    assert_eq!(first.registration_time, second.registration_time);
    assert_eq!(first.nar_hash, second.nar_hash);
}

/// A failing builder surfaces a build failure and registers nothing.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_builder() {
    let ts = TestStore::new();
    let (drv_path, drv) = ts.shell_derivation("failing", "exit 3").await;
    let out = ts.out_path(&drv);

    let err = ts
        .store
        .build_paths(&[built(&drv_path)], BuildMode::Normal)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exit code 3"), "got: {err}");
    assert!(!ts.store.is_valid_path(&out).await.unwrap());
}

/// A fixed-output derivation producing the wrong content is rejected
/// and nothing registers.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fixed_output_hash_mismatch() {
    let ts = TestStore::new();
    // Declared hash of "foo\n" (flat), builder writes "bar\n".
    let declared = Algorithm::SHA256.digest("foo\n");
    let ca = ContentAddress::Flat(declared);
    let output = DerivationOutput::CAFixed(ca);
    let out_name = cantata_store_core::derived_path::OutputName::default();
    let out_path = output
        .path(ts.store.store_dir(), "mismatch", &out_name)
        .unwrap()
        .unwrap();

    let mut env = BTreeMap::new();
    env.insert(
        ByteString::from_static(b"out"),
        ByteString::from(ts.store.store_dir().print_path(&out_path)),
    );
    let drv = Derivation {
        name: "mismatch".parse().unwrap(),
        outputs: [(out_name, output)].into_iter().collect(),
        input_srcs: Default::default(),
        input_drvs: Default::default(),
        platform: ByteString::from(DaemonConfig::host_platform()),
        builder: ByteString::from_static(b"/bin/sh"),
        args: vec![
            ByteString::from_static(b"-c"),
            ByteString::from_static(b"echo bar > $out"),
        ],
        env,
    };
    let drv_path = ts.store.add_derivation(&drv).await.unwrap();

    let result = ts
        .store
        .build_derivation(
            &drv_path,
            &drv.resolve(|_, _| None, &BTreeMap::new()).unwrap(),
            BuildMode::Normal,
        )
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::OutputRejected);
    assert!(result.error_msg.contains("hash mismatch"), "got: {}", result.error_msg);
    assert!(!ts.store.is_valid_path(&out_path).await.unwrap());
}

/// A two-level dependency chain: the downstream build consumes the
/// upstream output and the scanner records the reference.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dependent_builds() {
    let ts = TestStore::new();
    let (dep_drv_path, dep_drv) = ts.shell_derivation("dep", "echo dep-payload > $out").await;
    let dep_out = ts.out_path(&dep_drv);

    // The downstream derivation embeds the dependency's output path, so
    // the reference scanner must find it.
    let script = format!(
        "cat {} > $out && echo {} >> $out",
        ts.store.store_dir().print_path(&dep_out),
        ts.store.store_dir().print_path(&dep_out),
    );
    let (top_drv_path, mut top_drv) = ts.shell_derivation("top", &script).await;

    // Wire the dependency in properly: inputs go through input_drvs.
    top_drv.input_drvs.insert(
        dep_drv_path.clone(),
        [cantata_store_core::derived_path::OutputName::default()]
            .into_iter()
            .collect(),
    );
    let top_drv_path2 = ts.store.add_derivation(&top_drv).await.unwrap();
    assert_ne!(top_drv_path, top_drv_path2);

    ts.store
        .build_paths(&[built(&top_drv_path2)], BuildMode::Normal)
        .await
        .unwrap();

    let top_out = ts.out_path(&top_drv);
    assert!(ts.store.is_valid_path(&dep_out).await.unwrap());
    assert!(ts.store.is_valid_path(&top_out).await.unwrap());

    let info = ts.store.query_path_info(&top_out).await.unwrap().unwrap();
    assert!(
        info.references.contains(&dep_out),
        "reference scan should find the dependency"
    );

    // Shared outputs register exactly once even when requested again
    // concurrently.
    let again = futures::future::join(
        ts.store.build_paths(&[built(&top_drv_path2)], BuildMode::Normal),
        ts.store.build_paths(&[built(&dep_drv_path)], BuildMode::Normal),
    )
    .await;
    again.0.unwrap();
    again.1.unwrap();
}

/// Unsupported platforms are rejected before anything runs.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_platform_rejected() {
    let ts = TestStore::new();
    let (drv_path, mut drv) = ts.shell_derivation("alien", "echo x > $out").await;
    drv.platform = ByteString::from_static(b"mips64-plan9");

    let basic = drv.resolve(|_, _| None, &BTreeMap::new()).unwrap();
    let result = ts
        .store
        .build_derivation(&drv_path, &basic, BuildMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.status, BuildStatus::InputRejected);
}
