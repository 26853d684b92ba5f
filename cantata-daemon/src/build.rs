// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The build runner.
//!
//! Takes one basic derivation through pre-flight checks, environment
//! setup, supervised execution of the builder, output canonicalization,
//! reference scanning, content-address verification and registration.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures::StreamExt as _;
use tokio::io::AsyncBufReadExt as _;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cantata_store_core::content_address::ContentAddress;
use cantata_store_core::derivation::{BasicDerivation, DerivationOutput};
use cantata_store_core::derived_path::OutputName;
use cantata_store_core::realisation::{DrvOutput, Realisation};
use cantata_store_core::references::RefScanSink;
use cantata_store_core::store_path::{StorePath, StorePathSet, StoreReferences};
use cantata_store_core::StoreDir;
use cantata_store_db::{RegisterPathParams, StoreDb};
use cantata_store_remote::protocol::types::{BuildMode, BuildResult, BuildStatus};
use cantata_utils_hash::fmt::{Bare, Base16};
use cantata_utils_hash::{Algorithm, Context, NarHash, Sha256};

use crate::build_users::acquire_build_user;
use crate::canonicalize::canonicalize_path_metadata;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::sandbox::{NoSandbox, Sandbox as _, SandboxChild};

/// Why the builder process did not succeed.
enum RunError {
    TimedOut,
    SilentTooLong,
    LogLimitExceeded,
    ExitCode(i32),
    Other(String),
}

/// One built output, scanned and hashed.
#[derive(Clone)]
pub struct BuiltOutput {
    pub name: OutputName,
    pub path: StorePath,
    pub nar_hash: NarHash,
    pub nar_size: u64,
    pub references: StorePathSet,
    /// Present for content-addressed outputs.
    pub ca: Option<ContentAddress>,
}

/// Build `drv` and register its outputs.
///
/// `drv_hash` is the stable hash of the resolved derivation; when
/// present, content-addressed outputs get a [`Realisation`] recorded
/// under it and returned in the result.
pub async fn build_derivation(
    config: &DaemonConfig,
    db: &Arc<Mutex<StoreDb>>,
    drv_path: &StorePath,
    drv: &BasicDerivation,
    mode: BuildMode,
    drv_hash: Option<Sha256>,
) -> DaemonResult<BuildResult> {
    let store_dir = &config.store_dir;
    let start_time = now_secs();

    if !config.supports_platform(&String::from_utf8_lossy(&drv.platform)) {
        return Ok(failure(
            BuildStatus::InputRejected,
            format!(
                "a '{}' is required to build '{}', but this is a '{}' store",
                String::from_utf8_lossy(&drv.platform),
                drv_path,
                DaemonConfig::host_platform(),
            ),
            start_time,
        ));
    }

    if mode == BuildMode::Normal && all_outputs_valid(store_dir, db, drv).await? {
        let mut result = BuildResult::new(BuildStatus::AlreadyValid, String::new());
        result.start_time = start_time;
        result.stop_time = start_time;
        return Ok(result);
    }

    for input in &drv.inputs {
        if !store_dir.real_path(input).exists() {
            return Ok(failure(
                BuildStatus::InputRejected,
                format!("missing input store path '{}'", input),
                start_time,
            ));
        }
    }

    // Known output paths; floating outputs build into store-local
    // scratch paths and move once their content address is known.
    let mut output_dests: Vec<(OutputName, OutputDest)> = Vec::new();
    for (name, output) in &drv.outputs {
        match output.path(store_dir, &drv.name, name)? {
            Some(path) => output_dests.push((name.clone(), OutputDest::Fixed(path))),
            None => {
                let scratch = scratch_path(&drv.name, name);
                output_dests.push((name.clone(), OutputDest::Scratch(scratch)));
            }
        }
    }

    // In repair mode pre-existing outputs are obstructions.
    if mode == BuildMode::Repair {
        for (_name, dest) in &output_dests {
            remove_obstruction(&dest.build_path(store_dir)).await;
        }
    }

    let build_tmp = tempfile::Builder::new()
        .prefix("cantata-build-")
        .tempdir_in(config.builds_dir())
        .map_err(|e| DaemonError::other(format!("creating build directory: {e}")))?;

    let user = match config.build_user_base {
        Some(base) => {
            acquire_build_user(&config.userpool_dir(), base, config.build_user_count)?
        }
        None => None,
    };

    let env = build_environment(config, drv, build_tmp.path(), &output_dests);
    let builder = String::from_utf8_lossy(&drv.builder).into_owned();
    let args: Vec<String> = drv
        .args
        .iter()
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect();
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

    let log_sink = open_build_log(config, drv_path);
    debug!(%drv_path, builder = %builder, "starting build");

    let run = {
        let sandbox = NoSandbox::new();
        match sandbox.spawn(&builder, &arg_refs, &env, build_tmp.path(), user.as_ref()) {
            Ok(child) => supervise(child, config, &log_sink).await,
            Err(e) => Err(RunError::Other(format!(
                "failed to start builder '{}': {e}",
                builder
            ))),
        }
    };
    drop(log_sink);
    let stop_time = now_secs();

    if let Err(err) = run {
        cleanup_outputs(store_dir, &output_dests, config.keep_failed).await;
        let (status, message) = classify_failure(drv, drv_path, err);
        let mut result = failure(status, message, start_time);
        result.stop_time = stop_time;
        return Ok(result);
    }

    finish_build(
        config,
        db,
        drv_path,
        drv,
        mode,
        output_dests,
        (start_time, stop_time),
        drv_hash,
    )
    .await
}

enum OutputDest {
    /// The final path is known before the build.
    Fixed(StorePath),
    /// Scratch name under the store; renamed after hashing.
    Scratch(String),
}

impl OutputDest {
    fn build_path(&self, store_dir: &StoreDir) -> PathBuf {
        match self {
            OutputDest::Fixed(path) => store_dir.real_path(path),
            OutputDest::Scratch(name) => store_dir.to_path().join(name),
        }
    }

    fn build_path_string(&self, store_dir: &StoreDir) -> String {
        self.build_path(store_dir).to_string_lossy().into_owned()
    }
}

fn scratch_path(drv_name: &str, output: &OutputName) -> String {
    format!(
        ".tmp-{}-{}-{}-{:x}",
        std::process::id(),
        drv_name,
        output,
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    )
}

async fn all_outputs_valid(
    store_dir: &StoreDir,
    db: &Arc<Mutex<StoreDb>>,
    drv: &BasicDerivation,
) -> DaemonResult<bool> {
    for (name, output) in &drv.outputs {
        let Some(path) = output.path(store_dir, &drv.name, name)? else {
            return Ok(false);
        };
        let full = store_dir.print_path(&path);
        let db = db.lock().await;
        if !db.is_valid_path(&full)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The builder environment, in the canonical phase order: overridable
/// defaults, derivation variables, then the variables nothing may
/// override.
fn build_environment(
    config: &DaemonConfig,
    drv: &BasicDerivation,
    build_dir: &Path,
    output_dests: &[(OutputName, OutputDest)],
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let build_dir_str = build_dir.to_string_lossy().into_owned();

    env.insert("PATH".into(), "/path-not-set".into());
    env.insert("HOME".into(), "/homeless-shelter".into());
    env.insert("NIX_STORE".into(), config.store_dir.to_str().to_owned());
    env.insert("NIX_BUILD_CORES".into(), config.build_cores.to_string());

    for (key, value) in &drv.env {
        env.insert(
            String::from_utf8_lossy(key).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        );
    }

    env.insert("NIX_BUILD_TOP".into(), build_dir_str.clone());
    env.insert("TMPDIR".into(), build_dir_str.clone());
    env.insert("TEMPDIR".into(), build_dir_str.clone());
    env.insert("TMP".into(), build_dir_str.clone());
    env.insert("TEMP".into(), build_dir_str.clone());
    env.insert("PWD".into(), build_dir_str);

    let mut output_names = Vec::new();
    for (name, dest) in output_dests {
        env.insert(
            name.to_string(),
            dest.build_path_string(&config.store_dir),
        );
        output_names.push(name.to_string());
    }
    env.insert("outputs".into(), output_names.join(" "));

    if drv.is_fixed_output() {
        env.insert("NIX_OUTPUT_CHECKED".into(), "1".into());
    }

    env.insert("NIX_LOG_FD".into(), "2".into());
    env.insert("TERM".into(), "xterm-256color".into());
    env
}

type LogSink = Arc<std::sync::Mutex<dyn std::io::Write + Send>>;

/// Build logs land bzip2-compressed under
/// `<log-dir>/drvs/<first-2>/<rest>.bz2`.
fn open_build_log(config: &DaemonConfig, drv_path: &StorePath) -> LogSink {
    let base_name = drv_path.to_string();
    let (prefix, rest) = base_name.split_at(2);
    let dir = config.log_dir.join("drvs").join(prefix);
    let result = std::fs::create_dir_all(&dir).and_then(|_| {
        let log_path = dir.join(format!("{rest}.bz2"));
        let file = std::fs::File::create(&log_path)?;
        Ok(bzip2::write::BzEncoder::new(
            file,
            bzip2::Compression::default(),
        ))
    });
    match result {
        Ok(writer) => Arc::new(std::sync::Mutex::new(writer)),
        Err(e) => {
            warn!(%drv_path, "failed to open build log: {e}");
            Arc::new(std::sync::Mutex::new(std::io::sink()))
        }
    }
}

/// Drain the builder's output to the log, enforcing the wall-clock,
/// silence and log-size limits.
async fn supervise(
    mut child: SandboxChild,
    config: &DaemonConfig,
    log_sink: &LogSink,
) -> Result<(), RunError> {
    let pid = child.pid();
    let stdout = child.take_stdout();
    let stderr = child.take_stderr();

    let last_output = Arc::new(std::sync::Mutex::new(tokio::time::Instant::now()));
    let log_written = Arc::new(std::sync::atomic::AtomicU64::new(0));

    let mut drains = Vec::new();
    macro_rules! drain {
        ($stream:expr) => {
            if let Some(stream) = $stream {
                let last = Arc::clone(&last_output);
                let written = Arc::clone(&log_written);
                let sink = Arc::clone(log_sink);
                drains.push(tokio::spawn(async move {
                    let mut lines = tokio::io::BufReader::new(stream).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        *last.lock().unwrap() = tokio::time::Instant::now();
                        written.fetch_add(
                            line.len() as u64 + 1,
                            std::sync::atomic::Ordering::Relaxed,
                        );
                        let mut sink = sink.lock().unwrap();
                        let _ = writeln!(sink, "{line}");
                    }
                }));
            }
        };
    }
    drain!(stdout);
    drain!(stderr);

    let wall_deadline = config
        .build_timeout
        .map(|timeout| tokio::time::Instant::now() + timeout);

    let status = loop {
        let poll_interval = std::time::Duration::from_millis(50);
        tokio::select! {
            result = child.wait() => {
                match result {
                    Ok(status) => break status,
                    Err(e) => return Err(RunError::Other(format!("waiting for builder: {e}"))),
                }
            }
            _ = tokio::time::sleep(poll_interval) => {
                if let Some(deadline) = wall_deadline
                    && tokio::time::Instant::now() >= deadline
                {
                    kill_build(pid, &mut child, drains).await;
                    return Err(RunError::TimedOut);
                }
                if let Some(max_silent) = config.max_silent_time
                    && last_output.lock().unwrap().elapsed() >= max_silent
                {
                    kill_build(pid, &mut child, drains).await;
                    return Err(RunError::SilentTooLong);
                }
                if config.max_log_size > 0
                    && log_written.load(std::sync::atomic::Ordering::Relaxed)
                        > config.max_log_size
                {
                    kill_build(pid, &mut child, drains).await;
                    return Err(RunError::LogLimitExceeded);
                }
            }
        }
    };

    for drain in drains {
        let _ = drain.await;
    }

    if status.success() {
        Ok(())
    } else {
        Err(RunError::ExitCode(status.code().unwrap_or(-1)))
    }
}

async fn kill_build(
    pid: Option<u32>,
    child: &mut SandboxChild,
    drains: Vec<tokio::task::JoinHandle<()>>,
) {
    if let Some(pid) = pid {
        // Negative pid addresses the whole process group.
        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
    let _ = child.kill().await;
    for drain in drains {
        let _ = drain.await;
    }
}

fn classify_failure(
    drv: &BasicDerivation,
    drv_path: &StorePath,
    err: RunError,
) -> (BuildStatus, String) {
    match err {
        RunError::TimedOut => (
            BuildStatus::TimedOut,
            format!("building of '{}' timed out", drv_path),
        ),
        RunError::SilentTooLong => (
            BuildStatus::TimedOut,
            format!("'{}' produced no output for too long", drv_path),
        ),
        RunError::LogLimitExceeded => (
            BuildStatus::LogLimitExceeded,
            format!("'{}' exceeded the allowed log size", drv_path),
        ),
        RunError::ExitCode(code) => {
            let permanent = drv
                .env
                .get(b"__permanentFailure".as_ref())
                .is_some_and(|v| v.as_ref() == b"1");
            let status = if permanent {
                BuildStatus::PermanentFailure
            } else {
                BuildStatus::MiscFailure
            };
            (
                status,
                format!("builder for '{}' failed with exit code {}", drv_path, code),
            )
        }
        RunError::Other(message) => (BuildStatus::MiscFailure, message),
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish_build(
    config: &DaemonConfig,
    db: &Arc<Mutex<StoreDb>>,
    drv_path: &StorePath,
    drv: &BasicDerivation,
    mode: BuildMode,
    output_dests: Vec<(OutputName, OutputDest)>,
    times: (u64, u64),
    drv_hash: Option<Sha256>,
) -> DaemonResult<BuildResult> {
    let store_dir = &config.store_dir;
    let (start_time, stop_time) = times;

    let mut built = Vec::new();
    for (name, dest) in &output_dests {
        let build_path = dest.build_path(store_dir);
        if !build_path.exists() {
            cleanup_outputs(store_dir, &output_dests, false).await;
            let mut result = failure(
                BuildStatus::MiscFailure,
                format!(
                    "builder for '{}' failed to produce output path for '{}'",
                    drv_path, name
                ),
                start_time,
            );
            result.stop_time = stop_time;
            return Ok(result);
        }

        canonicalize_path_metadata(&build_path)
            .map_err(|e| DaemonError::other(format!("canonicalizing '{name}': {e}")))?;

        match dest {
            OutputDest::Fixed(path) => {
                let (nar_hash, nar_size, references) =
                    hash_and_scan(&build_path, &drv.inputs, Some(path)).await?;

                // Fixed-output derivations must produce the declared
                // content.
                let ca = if let Some(DerivationOutput::CAFixed(declared)) =
                    drv.outputs.get(name)
                {
                    if let Some(mismatch) = check_fixed_output(
                        &build_path,
                        declared,
                        &nar_hash,
                    )
                    .await?
                    {
                        cleanup_outputs(store_dir, &output_dests, false).await;
                        let mut result = failure(
                            BuildStatus::OutputRejected,
                            format!(
                                "hash mismatch in fixed-output derivation '{}': {}",
                                drv_path, mismatch
                            ),
                            start_time,
                        );
                        result.stop_time = stop_time;
                        return Ok(result);
                    }
                    Some(*declared)
                } else {
                    None
                };

                built.push(BuiltOutput {
                    name: name.clone(),
                    path: path.clone(),
                    nar_hash,
                    nar_size,
                    references,
                    ca,
                });
            }
            OutputDest::Scratch(_) => {
                // Floating output: the content determines the path.
                let (nar_hash, nar_size, references) =
                    hash_and_scan(&build_path, &drv.inputs, None).await?;
                let ca = ContentAddress::Recursive(nar_hash.into());
                let final_path = store_dir.make_fixed_output_path(
                    &cantata_store_core::derivation::output_path_name(&drv.name, name),
                    &ca,
                    &StoreReferences {
                        others: references.clone(),
                        self_ref: false,
                    },
                )?;
                let final_real = store_dir.real_path(&final_path);
                if final_real.exists() {
                    remove_obstruction(&build_path).await;
                } else {
                    tokio::fs::rename(&build_path, &final_real).await?;
                }
                built.push(BuiltOutput {
                    name: name.clone(),
                    path: final_path,
                    nar_hash,
                    nar_size,
                    references,
                    ca: Some(ca),
                });
            }
        }
    }

    if mode == BuildMode::Check {
        return check_outputs(config, db, drv_path, built, (start_time, stop_time)).await;
    }

    register_outputs(config, db, drv_path, &built, mode == BuildMode::Repair).await?;

    let mut result = BuildResult::new(BuildStatus::Built, String::new());
    result.times_built = 1;
    result.start_time = start_time;
    result.stop_time = stop_time;

    // Content-addressed outputs additionally get their learned mapping
    // recorded.
    if let Some(drv_hash) = drv_hash {
        for output in &built {
            if output.ca.is_none()
                || !matches!(drv.outputs.get(&output.name), Some(DerivationOutput::CAFloating(_)))
            {
                continue;
            }
            let realisation = Realisation {
                id: DrvOutput {
                    drv_hash: drv_hash.into(),
                    output_name: output.name.clone(),
                },
                out_path: output.path.clone(),
                signatures: BTreeSet::new(),
                dependent_realisations: BTreeMap::new(),
            };
            let db = db.lock().await;
            db.register_realisation(
                &realisation.id.to_string(),
                &config.store_dir.print_path(&output.path),
                None,
            )?;
            result
                .built_outputs
                .insert(realisation.id.clone(), realisation);
        }
    }

    info!(%drv_path, outputs = built.len(), "build finished");
    Ok(result)
}

/// Check mode: compare the rebuilt outputs against the recorded hashes
/// and report non-determinism; never replace anything.
async fn check_outputs(
    config: &DaemonConfig,
    db: &Arc<Mutex<StoreDb>>,
    drv_path: &StorePath,
    built: Vec<BuiltOutput>,
    times: (u64, u64),
) -> DaemonResult<BuildResult> {
    let (start_time, stop_time) = times;
    let mut non_deterministic = false;
    for output in &built {
        let full = config.store_dir.print_path(&output.path);
        let recorded = {
            let db = db.lock().await;
            db.query_path_info(&full)?
        };
        if let Some(info) = recorded {
            let expected = format!("{}", Base16(output.nar_hash));
            if info.hash != expected {
                non_deterministic = true;
                warn!(path = %full, "output is not deterministic");
            }
        }
    }
    let mut result = if non_deterministic {
        failure(
            BuildStatus::NotDeterministic,
            format!("derivation '{}' is not deterministic", drv_path),
            start_time,
        )
    } else {
        BuildResult::new(BuildStatus::Built, String::new())
    };
    result.times_built = 1;
    result.start_time = start_time;
    result.stop_time = stop_time;
    Ok(result)
}

async fn check_fixed_output(
    build_path: &Path,
    declared: &ContentAddress,
    nar_hash: &NarHash,
) -> DaemonResult<Option<String>> {
    let got: cantata_utils_hash::Hash = match declared {
        ContentAddress::Recursive(expected) => {
            if expected.algorithm() == Algorithm::SHA256 {
                cantata_utils_hash::Hash::from(*nar_hash)
            } else {
                hash_nar_with(build_path, expected.algorithm()).await?
            }
        }
        ContentAddress::Flat(expected) => {
            let data = tokio::fs::read(build_path).await?;
            expected.algorithm().digest(&data)
        }
        ContentAddress::Text(_) => {
            return Ok(Some("text outputs cannot be built".into()));
        }
    };
    let expected = declared.hash();
    if got != expected {
        Ok(Some(format!(
            "expected {}, got {}",
            Bare(Base16(expected)),
            Bare(Base16(got)),
        )))
    } else {
        Ok(None)
    }
}

async fn hash_nar_with(path: &Path, algorithm: Algorithm) -> DaemonResult<cantata_utils_hash::Hash> {
    let mut hasher = Context::new(algorithm);
    let mut stream = cantata_nar::NarByteStream::new(path.to_path_buf());
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    Ok(hasher.finish())
}

/// One NAR pass: hash, count, and scan for references to the inputs and
/// (optionally) the output itself.
pub async fn hash_and_scan(
    path: &Path,
    candidates: &StorePathSet,
    self_path: Option<&StorePath>,
) -> DaemonResult<(NarHash, u64, StorePathSet)> {
    let mut hasher = Context::new(Algorithm::SHA256);
    let mut scanner = RefScanSink::new(candidates, self_path);
    let mut size: u64 = 0;

    let mut stream = cantata_nar::NarByteStream::new(path.to_path_buf());
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        scanner.feed(&chunk);
        size += chunk.len() as u64;
    }

    let nar_hash = NarHash::try_from(hasher.finish())
        .map_err(|e| DaemonError::other(e.to_string()))?;
    Ok((nar_hash, size, scanner.found_paths()))
}

/// Register every output in one transaction.
async fn register_outputs(
    config: &DaemonConfig,
    db: &Arc<Mutex<StoreDb>>,
    drv_path: &StorePath,
    outputs: &[BuiltOutput],
    repair: bool,
) -> DaemonResult<()> {
    let store_dir = config.store_dir.clone();
    let deriver = store_dir.print_path(drv_path);
    let mut db = db.lock().await;

    let mut batch = Vec::new();
    for output in outputs {
        let full = store_dir.print_path(&output.path);
        if repair || db.is_valid_path(&full)? {
            if repair {
                let _ = db.invalidate_path(&full);
            } else {
                continue;
            }
        }
        batch.push(RegisterPathParams {
            path: full,
            hash: format!("{}", Base16(output.nar_hash)),
            registration_time: SystemTime::now(),
            deriver: Some(deriver.clone()),
            nar_size: Some(output.nar_size),
            ultimate: true,
            sigs: None,
            ca: output.ca.map(|ca| ca.to_string()),
            references: output
                .references
                .iter()
                .map(|r| store_dir.print_path(r))
                .collect(),
        });
    }
    db.register_valid_paths(&batch)?;
    for output in outputs {
        db.register_derivation_output(
            &deriver,
            output.name.as_str(),
            &store_dir.print_path(&output.path),
        )?;
    }
    Ok(())
}

async fn cleanup_outputs(
    store_dir: &StoreDir,
    output_dests: &[(OutputName, OutputDest)],
    keep_failed: bool,
) {
    for (_name, dest) in output_dests {
        let path = dest.build_path(store_dir);
        if keep_failed && path.exists() {
            let failed = path.with_file_name(format!(
                "{}.failed",
                path.file_name().unwrap_or_default().to_string_lossy()
            ));
            let _ = tokio::fs::rename(&path, &failed).await;
        } else {
            remove_obstruction(&path).await;
        }
    }
}

async fn remove_obstruction(path: &Path) {
    let _ = tokio::fs::remove_dir_all(path).await;
    let _ = tokio::fs::remove_file(path).await;
}

fn failure(status: BuildStatus, message: String, start_time: u64) -> BuildResult {
    let mut result = BuildResult::new(status, message);
    result.start_time = start_time;
    result.stop_time = start_time;
    result.is_non_deterministic = status == BuildStatus::NotDeterministic;
    result
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
