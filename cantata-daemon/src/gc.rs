// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The garbage collector.
//!
//! Liveness is the forward reference closure over four root sources:
//! permanent root symlinks under `<state>/gcroots`, indirect roots
//! under `<state>/gcroots/auto` (two symlink hops), temp roots of live
//! processes, and a best-effort scan of `/proc` for paths the running
//! system holds open. Deletion runs under the exclusive GC lock against
//! a snapshot of the roots, referrers before referents, and invalidates
//! the database row before touching the filesystem, so a crash leaves
//! orphaned files rather than dangling metadata.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cantata_store_core::store_path::{StorePath, StorePathSet};
use cantata_store_db::StoreDb;
use cantata_store_remote::protocol::types::{GcAction, GcOptions, GcResult};

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::pathlocks::PathLock;
use crate::temproots::read_temp_roots;

/// Root map: store path to the links that pin it.
pub type Roots = BTreeMap<StorePath, BTreeSet<String>>;

/// Gather all root sources. `censor` hides the `/proc` link names.
pub async fn find_roots(config: &DaemonConfig, censor: bool) -> DaemonResult<Roots> {
    let mut roots = Roots::new();
    find_symlink_roots(config, &config.gcroots_dir(), &mut roots)?;
    find_temp_roots(config, &mut roots)?;
    find_runtime_roots(config, censor, &mut roots);
    Ok(roots)
}

fn add_root(config: &DaemonConfig, roots: &mut Roots, target: &Path, link: String) {
    let Ok((path, _rest)) = config.store_dir.to_store_path(target) else {
        return;
    };
    roots.entry(path).or_default().insert(link);
}

/// Walk the gcroots directory. Direct symlinks into the store are
/// permanent roots; symlinks under `auto/` go through one more hop
/// (the user's own link), and dead links are pruned.
fn find_symlink_roots(
    config: &DaemonConfig,
    dir: &Path,
    roots: &mut Roots,
) -> DaemonResult<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            find_symlink_roots(config, &path, roots)?;
            continue;
        }
        if !file_type.is_symlink() {
            continue;
        }
        let Ok(target) = std::fs::read_link(&path) else {
            continue;
        };
        let target = if target.is_absolute() {
            target
        } else {
            path.parent().unwrap_or(Path::new("/")).join(target)
        };
        if config.store_dir.is_in_store(&target) {
            add_root(config, roots, &target, path.to_string_lossy().into_owned());
        } else if path.starts_with(config.auto_roots_dir()) {
            // Indirect root: the target is a user symlink that should
            // point into the store.
            match std::fs::read_link(&target) {
                Ok(second) => {
                    let second = if second.is_absolute() {
                        second
                    } else {
                        target.parent().unwrap_or(Path::new("/")).join(second)
                    };
                    if config.store_dir.is_in_store(&second) {
                        add_root(
                            config,
                            roots,
                            &second,
                            target.to_string_lossy().into_owned(),
                        );
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(link = %path.display(), "removing dangling indirect root");
                    let _ = std::fs::remove_file(&path);
                }
                Err(_) => {}
            }
        }
    }
    Ok(())
}

fn find_temp_roots(config: &DaemonConfig, roots: &mut Roots) -> DaemonResult<()> {
    for raw in read_temp_roots(&config.temproots_dir())? {
        add_root(
            config,
            roots,
            Path::new(&raw),
            "{temp}".to_owned(),
        );
    }
    Ok(())
}

/// Best-effort scan of the running system for store paths in use:
/// `/proc/<pid>/{exe,cwd,fd/*,maps,environ}` and a few kernel sysctl
/// files on Linux, `lsof` elsewhere. Failures stay at debug level.
fn find_runtime_roots(config: &DaemonConfig, censor: bool, roots: &mut Roots) {
    let mut unchecked: BTreeMap<PathBuf, BTreeSet<String>> = BTreeMap::new();

    if cfg!(target_os = "linux") {
        scan_proc(config, &mut unchecked);
        for sysctl in [
            "/proc/sys/kernel/modprobe",
            "/proc/sys/kernel/fbsplash",
            "/proc/sys/kernel/poweroff_cmd",
        ] {
            if let Ok(content) = std::fs::read_to_string(sysctl) {
                unchecked
                    .entry(PathBuf::from(content.trim()))
                    .or_default()
                    .insert(sysctl.to_owned());
            }
        }
    } else {
        scan_lsof(&mut unchecked);
    }

    for (target, links) in unchecked {
        if !config.store_dir.is_in_store(&target) {
            continue;
        }
        for link in links {
            let link = if censor { "{censored}".to_owned() } else { link };
            add_root(config, roots, &target, link);
        }
    }
}

fn scan_proc(config: &DaemonConfig, unchecked: &mut BTreeMap<PathBuf, BTreeSet<String>>) {
    let Ok(proc_entries) = std::fs::read_dir("/proc") else {
        return;
    };
    let store_prefix = format!("{}/", config.store_dir);
    for entry in proc_entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        else {
            continue;
        };
        let base = PathBuf::from("/proc").join(pid);

        for link in ["exe", "cwd"] {
            read_proc_link(&base.join(link), unchecked);
        }
        if let Ok(fds) = std::fs::read_dir(base.join("fd")) {
            for fd in fds.flatten() {
                read_proc_link(&fd.path(), unchecked);
            }
        }
        if let Ok(maps) = std::fs::read_to_string(base.join("maps")) {
            for line in maps.lines() {
                if let Some(idx) = line.find(&store_prefix) {
                    let target = line[idx..]
                        .split_whitespace()
                        .next()
                        .unwrap_or("")
                        .to_owned();
                    unchecked
                        .entry(PathBuf::from(target))
                        .or_default()
                        .insert(base.join("maps").to_string_lossy().into_owned());
                }
            }
        }
        if let Ok(environ) = std::fs::read(base.join("environ")) {
            for chunk in environ.split(|b| *b == 0) {
                let text = String::from_utf8_lossy(chunk);
                if let Some(idx) = text.find(&store_prefix) {
                    let target: String = text[idx..]
                        .chars()
                        .take_while(|c| !c.is_whitespace() && *c != ':' && *c != '=')
                        .collect();
                    unchecked
                        .entry(PathBuf::from(target))
                        .or_default()
                        .insert(base.join("environ").to_string_lossy().into_owned());
                }
            }
        }
    }
}

fn read_proc_link(link: &Path, unchecked: &mut BTreeMap<PathBuf, BTreeSet<String>>) {
    if let Ok(target) = std::fs::read_link(link)
        && target.is_absolute()
    {
        unchecked
            .entry(target)
            .or_default()
            .insert(link.to_string_lossy().into_owned());
    }
}

fn scan_lsof(unchecked: &mut BTreeMap<PathBuf, BTreeSet<String>>) {
    match std::process::Command::new("lsof")
        .args(["-n", "-w", "-F", "n"])
        .output()
    {
        Ok(output) => {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                if let Some(path) = line.strip_prefix('n')
                    && path.starts_with('/')
                {
                    unchecked
                        .entry(PathBuf::from(path))
                        .or_default()
                        .insert("{lsof}".to_owned());
                }
            }
        }
        Err(e) => {
            debug!("lsof unavailable for runtime roots: {e}");
        }
    }
}

/// The forward reference closure of `start` over the database.
pub async fn compute_closure(
    config: &DaemonConfig,
    db: &Arc<Mutex<StoreDb>>,
    start: impl IntoIterator<Item = StorePath>,
) -> DaemonResult<StorePathSet> {
    let db = db.lock().await;
    let mut closure = StorePathSet::new();
    let mut queue: VecDeque<StorePath> = start.into_iter().collect();
    while let Some(path) = queue.pop_front() {
        if !closure.insert(path.clone()) {
            continue;
        }
        let full = config.store_dir.print_path(&path);
        for reference in db.query_references(&full)? {
            if let Ok(parsed) = config.store_dir.parse_path(&reference) {
                if !closure.contains(&parsed) {
                    queue.push_back(parsed);
                }
            }
        }
    }
    Ok(closure)
}

/// Run a collection. Deletion modes hold the exclusive GC lock for the
/// whole run.
pub async fn collect_garbage(
    config: &DaemonConfig,
    db: &Arc<Mutex<StoreDb>>,
    options: &GcOptions,
) -> DaemonResult<GcResult> {
    match options.action {
        GcAction::ReturnLive => {
            let live = live_set(config, db).await?;
            Ok(GcResult {
                paths: live
                    .iter()
                    .map(|p| config.store_dir.print_path(p))
                    .collect(),
                bytes_freed: 0,
            })
        }
        GcAction::ReturnDead => {
            let dead = dead_set(config, db).await?;
            Ok(GcResult {
                paths: dead
                    .iter()
                    .map(|p| config.store_dir.print_path(p))
                    .collect(),
                bytes_freed: 0,
            })
        }
        GcAction::DeleteDead => {
            let _gc_lock = exclusive_gc_lock(config).await?;
            let dead = dead_set(config, db).await?;
            delete_paths(config, db, dead, options.max_freed).await
        }
        GcAction::DeleteSpecific => {
            let _gc_lock = exclusive_gc_lock(config).await?;
            let live = if options.ignore_liveness {
                StorePathSet::new()
            } else {
                live_set(config, db).await?
            };
            for path in &options.paths_to_delete {
                if live.contains(path) {
                    return Err(DaemonError::other(format!(
                        "cannot delete path '{}' since it is still alive",
                        config.store_dir.print_path(path)
                    )));
                }
            }
            delete_paths(config, db, options.paths_to_delete.clone(), options.max_freed).await
        }
    }
}

async fn exclusive_gc_lock(config: &DaemonConfig) -> DaemonResult<PathLock> {
    let lock_target = config.gc_lock_path();
    let lock = tokio::task::spawn_blocking(move || PathLock::lock(&lock_target))
        .await
        .map_err(|e| DaemonError::other(format!("gc lock task: {e}")))??;
    Ok(lock)
}

async fn live_set(config: &DaemonConfig, db: &Arc<Mutex<StoreDb>>) -> DaemonResult<StorePathSet> {
    let roots = find_roots(config, true).await?;
    compute_closure(config, db, roots.into_keys()).await
}

async fn dead_set(config: &DaemonConfig, db: &Arc<Mutex<StoreDb>>) -> DaemonResult<StorePathSet> {
    let live = live_set(config, db).await?;
    let all = {
        let db = db.lock().await;
        db.query_all_valid_paths()?
    };
    let mut dead = StorePathSet::new();
    for full in all {
        if let Ok(path) = config.store_dir.parse_path(&full) {
            if !live.contains(&path) {
                dead.insert(path);
            }
        }
    }
    Ok(dead)
}

/// Delete `dead`, referrers before referents, stopping once
/// `max_freed` bytes (when non-zero) have come off the disk.
async fn delete_paths(
    config: &DaemonConfig,
    db: &Arc<Mutex<StoreDb>>,
    dead: StorePathSet,
    max_freed: u64,
) -> DaemonResult<GcResult> {
    let order = deletion_order(config, db, &dead).await?;
    let mut result = GcResult::default();

    for path in order {
        if max_freed > 0 && result.bytes_freed >= max_freed {
            debug!(freed = result.bytes_freed, "reached max-freed budget");
            break;
        }
        let full = config.store_dir.print_path(&path);
        let real = config.store_dir.real_path(&path);

        // The path lock keeps a concurrent registration from racing the
        // delete.
        let Some(_path_lock) = PathLock::try_lock(&real)? else {
            debug!(path = %full, "skipping locked path");
            continue;
        };

        let freed = {
            let mut db = db.lock().await;
            if db.is_valid_path(&full)? {
                match db.invalidate_path(&full) {
                    Ok(_) => {}
                    Err(cantata_store_db::Error::PathInUse { referrer, .. }) => {
                        debug!(path = %full, referrer, "still referenced, skipping");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            drop(db);
            delete_from_disk(&real).await?
        };
        result.bytes_freed += freed;
        result.paths.push(full);
        let lock_file = PathBuf::from(format!("{}.lock", real.display()));
        let _ = std::fs::remove_file(lock_file);
    }

    info!(
        deleted = result.paths.len(),
        bytes = result.bytes_freed,
        "garbage collection finished"
    );
    Ok(result)
}

/// Topological order with referrers first.
async fn deletion_order(
    config: &DaemonConfig,
    db: &Arc<Mutex<StoreDb>>,
    dead: &StorePathSet,
) -> DaemonResult<Vec<StorePath>> {
    let db = db.lock().await;
    let mut order = Vec::with_capacity(dead.len());
    let mut visited = StorePathSet::new();

    fn visit(
        config: &DaemonConfig,
        db: &StoreDb,
        dead: &StorePathSet,
        path: &StorePath,
        visited: &mut StorePathSet,
        order: &mut Vec<StorePath>,
    ) -> DaemonResult<()> {
        if !visited.insert(path.clone()) {
            return Ok(());
        }
        let full = config.store_dir.print_path(path);
        for referrer in db.query_referrers(&full)? {
            if let Ok(parsed) = config.store_dir.parse_path(&referrer) {
                if dead.contains(&parsed) && parsed != *path {
                    visit(config, db, dead, &parsed, visited, order)?;
                }
            }
        }
        order.push(path.clone());
        Ok(())
    }

    for path in dead {
        visit(config, &db, dead, path, &mut visited, &mut order)?;
    }
    Ok(order)
}

async fn delete_from_disk(real: &Path) -> DaemonResult<u64> {
    let Ok(meta) = tokio::fs::symlink_metadata(real).await else {
        return Ok(0);
    };
    let size = path_size(real, &meta).await;
    if meta.file_type().is_dir() {
        make_tree_writable(real)?;
        tokio::fs::remove_dir_all(real).await?;
    } else {
        tokio::fs::remove_file(real).await?;
    }
    Ok(size)
}

/// Store directories are read-only; deletion needs the write bits back.
fn make_tree_writable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    let meta = std::fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.file_type().is_dir() {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        for entry in std::fs::read_dir(path)? {
            make_tree_writable(&entry?.path())?;
        }
    }
    Ok(())
}

async fn path_size(path: &Path, meta: &std::fs::Metadata) -> u64 {
    if !meta.file_type().is_dir() {
        return meta.len();
    }
    let mut total = 0u64;
    let mut queue = VecDeque::from([path.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(meta) = entry.metadata().await {
                if meta.file_type().is_dir() {
                    queue.push_back(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
    }
    total
}

/// Automatic collection: when free space under the store drops below
/// `min_free`, run one `DeleteDead` with a budget that brings it back
/// toward `max_free`. A trigger arriving mid-run waits for the running
/// collection instead of starting a second one; the post-wait re-check
/// usually makes it a no-op.
pub struct AutoGc {
    gate: Mutex<()>,
}

impl AutoGc {
    pub fn new() -> Self {
        AutoGc {
            gate: Mutex::new(()),
        }
    }

    pub async fn maybe_run(
        &self,
        config: &DaemonConfig,
        db: &Arc<Mutex<StoreDb>>,
    ) -> DaemonResult<()> {
        let Some(min_free) = config.min_free else {
            return Ok(());
        };
        if available_space(config.store_dir.to_path())? >= min_free {
            return Ok(());
        }

        let _running = self.gate.lock().await;
        let available = available_space(config.store_dir.to_path())?;
        if available >= min_free {
            return Ok(());
        }

        let budget = config.max_free.saturating_sub(available);
        info!(available, budget, "starting automatic garbage collection");
        let result = collect_garbage(
            config,
            db,
            &GcOptions {
                action: GcAction::DeleteDead,
                ignore_liveness: false,
                paths_to_delete: StorePathSet::new(),
                max_freed: budget,
            },
        )
        .await;
        if let Err(err) = &result {
            warn!(%err, "automatic garbage collection failed");
        }
        result.map(|_| ())
    }
}

impl Default for AutoGc {
    fn default() -> Self {
        Self::new()
    }
}

fn available_space(path: &Path) -> DaemonResult<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|errno| DaemonError::Io(std::io::Error::from(errno)))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}
