// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Substitution: obtaining store objects from other stores.
//!
//! Substituters are tried in configuration order. A substituter that
//! does not know a path moves the search on; a failing one is logged
//! and skipped; a content mismatch aborts the whole substitution, since
//! the bytes cannot be trusted. "No substituter knows this path" and
//! "substituters failed" stay distinct outcomes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cantata_store_core::fingerprint::fingerprint_path;
use cantata_store_core::store_path::StorePath;
use cantata_store_core::StoreDir;
use cantata_store_db::{RegisterPathParams, StoreDb};
use cantata_store_remote::client::DaemonClient;
use cantata_store_remote::serialization::UnkeyedPathInfo;
use cantata_store_remote::store_url::{Scheme, StoreUrl};
use cantata_utils_hash::fmt::Base16;
use cantata_utils_hash::NarHash;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};

/// A read-only store that can supply path metadata and NARs.
#[allow(async_fn_in_trait)]
pub trait SubstituterSource: Send + Sync {
    fn url(&self) -> &str;

    fn query_info(
        &self,
        path: &StorePath,
    ) -> impl Future<Output = DaemonResult<Option<UnkeyedPathInfo>>> + Send;

    /// Fetch the NAR of `path`, restoring the tree to `dest`; returns
    /// the hash and size of the transferred NAR.
    fn fetch_nar(
        &self,
        path: &StorePath,
        dest: &Path,
    ) -> impl Future<Output = DaemonResult<(NarHash, u64)>> + Send;
}

/// A substituter reached through the daemon protocol over a Unix
/// socket.
pub struct DaemonSubstituter {
    url: String,
    socket: PathBuf,
    store_dir: StoreDir,
}

impl DaemonSubstituter {
    /// Build the substituter list from the configured URLs; URLs whose
    /// scheme is not usable here are skipped with a warning.
    pub fn from_config(config: &DaemonConfig) -> Vec<DaemonSubstituter> {
        let mut subs = Vec::new();
        for raw in &config.substituters {
            let Ok(url) = raw.parse::<StoreUrl>() else {
                warn!(url = raw, "ignoring unparsable substituter URL");
                continue;
            };
            match url.scheme {
                Scheme::Unix | Scheme::Daemon => {
                    let socket = if url.authority.is_empty() {
                        PathBuf::from("/nix/var/nix/daemon-socket/socket")
                    } else {
                        PathBuf::from(&url.authority)
                    };
                    subs.push(DaemonSubstituter {
                        url: raw.clone(),
                        socket,
                        store_dir: config.store_dir.clone(),
                    });
                }
                other => {
                    warn!(url = raw, scheme = other.as_str(), "unsupported substituter scheme");
                }
            }
        }
        subs.sort_by_key(|s| {
            s.url
                .parse::<StoreUrl>()
                .map(|u| u.priority())
                .unwrap_or(50)
        });
        subs
    }
}

impl SubstituterSource for DaemonSubstituter {
    fn url(&self) -> &str {
        &self.url
    }

    async fn query_info(&self, path: &StorePath) -> DaemonResult<Option<UnkeyedPathInfo>> {
        let mut client = DaemonClient::connect(&self.socket, self.store_dir.clone()).await?;
        Ok(client.query_path_info(path).await?)
    }

    async fn fetch_nar(&self, path: &StorePath, dest: &Path) -> DaemonResult<(NarHash, u64)> {
        let mut client = DaemonClient::connect(&self.socket, self.store_dir.clone()).await?;
        Ok(client.fetch_nar(path, dest).await?)
    }
}

/// Make `path` valid by fetching it from one of `substituters`.
///
/// References are substituted first so registration never dangles.
pub fn substitute_path<'a, S: SubstituterSource>(
    config: &'a DaemonConfig,
    db: &'a Arc<Mutex<StoreDb>>,
    substituters: &'a [S],
    path: &'a StorePath,
) -> Pin<Box<dyn Future<Output = DaemonResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let store_dir = &config.store_dir;
        let full = store_dir.print_path(path);
        {
            let db = db.lock().await;
            if db.is_valid_path(&full)? {
                return Ok(());
            }
        }

        let mut any_known = false;
        for substituter in substituters {
            let info = match substituter.query_info(path).await {
                Ok(Some(info)) => info,
                Ok(None) => {
                    debug!(%path, url = substituter.url(), "substituter does not have path");
                    continue;
                }
                Err(err) => {
                    warn!(%path, url = substituter.url(), %err, "substituter query failed");
                    continue;
                }
            };
            any_known = true;

            if let Err(err) = verify_signature_policy(config, path, &info) {
                warn!(%path, url = substituter.url(), %err, "rejecting substitute");
                continue;
            }

            // The whole reference closure must be valid before this
            // path registers.
            for reference in &info.references {
                if reference == path {
                    continue;
                }
                substitute_path(config, db, substituters, reference).await?;
            }

            return fetch_and_register(config, db, substituter, path, info).await;
        }

        if any_known {
            Err(DaemonError::SubstitutersFailed(path.clone()))
        } else {
            Err(DaemonError::NoSubstituters(path.clone()))
        }
    })
}

/// Content-addressed paths are self-authenticating; everything else
/// needs a signature from a trusted key when signatures are required.
pub(crate) fn verify_signature_policy(
    config: &DaemonConfig,
    path: &StorePath,
    info: &UnkeyedPathInfo,
) -> DaemonResult<()> {
    if !config.require_sigs || info.ca.is_some() {
        return Ok(());
    }
    let fingerprint = fingerprint_path(
        &config.store_dir,
        path,
        &info.nar_hash,
        info.nar_size,
        &info.references,
    );
    for sig_text in &info.sigs {
        let Ok(sig) = sig_text.parse::<cantata_store_core::signature::Signature>() else {
            continue;
        };
        if config
            .trusted_public_keys
            .iter()
            .any(|key| key.verify(fingerprint.as_bytes(), &sig))
        {
            return Ok(());
        }
    }
    Err(DaemonError::MissingSignature {
        path: config.store_dir.print_path(path),
    })
}

async fn fetch_and_register<S: SubstituterSource>(
    config: &DaemonConfig,
    db: &Arc<Mutex<StoreDb>>,
    substituter: &S,
    path: &StorePath,
    info: UnkeyedPathInfo,
) -> DaemonResult<()> {
    let store_dir = &config.store_dir;
    let full = store_dir.print_path(path);
    let scratch = store_dir.to_path().join(format!(
        ".tmp-substitute-{}-{}",
        std::process::id(),
        path.hash()
    ));
    let _ = tokio::fs::remove_dir_all(&scratch).await;
    let _ = tokio::fs::remove_file(&scratch).await;

    let (got_hash, got_size) = match substituter.fetch_nar(path, &scratch).await {
        Ok(result) => result,
        Err(err) => {
            cleanup(&scratch).await;
            return Err(err);
        }
    };

    // Verify against the declared metadata before anything registers.
    if got_hash != info.nar_hash {
        cleanup(&scratch).await;
        return Err(DaemonError::HashMismatch {
            path: full,
            expected: info.nar_hash,
            got: got_hash,
        });
    }
    if info.nar_size != 0 && got_size != info.nar_size {
        cleanup(&scratch).await;
        return Err(DaemonError::SizeMismatch {
            path: full,
            expected: info.nar_size,
            got: got_size,
        });
    }

    let final_real = store_dir.real_path(path);
    if final_real.exists() {
        cleanup(&scratch).await;
    } else {
        tokio::fs::rename(&scratch, &final_real).await?;
    }

    let mut db = db.lock().await;
    if db.is_valid_path(&full)? {
        return Ok(());
    }
    db.register_valid_path(&RegisterPathParams {
        path: full.clone(),
        hash: format!("{}", Base16(info.nar_hash)),
        registration_time: SystemTime::now(),
        deriver: info.deriver.map(|d| store_dir.print_path(&d)),
        nar_size: Some(got_size),
        ultimate: false,
        sigs: if info.sigs.is_empty() {
            None
        } else {
            Some(info.sigs.join(" "))
        },
        ca: info.ca,
        references: info
            .references
            .iter()
            .map(|r| store_dir.print_path(r))
            .collect(),
    })?;
    info!(path = %full, url = substituter.url(), "substituted");
    Ok(())
}

async fn cleanup(path: &Path) {
    let _ = tokio::fs::remove_dir_all(path).await;
    let _ = tokio::fs::remove_file(path).await;
}
