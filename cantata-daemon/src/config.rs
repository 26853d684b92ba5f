// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Daemon configuration.
//!
//! A [`DaemonConfig`] is built once at startup from an optional TOML
//! file plus environment overrides (`NIX_STORE_DIR`, `NIX_STATE_DIR`,
//! `NIX_LOG_DIR`, `NIX_REMOTE`, `TMPDIR`) and then passed by reference;
//! there are no process-wide settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use cantata_store_core::signature::{PublicKey, SecretKey};
use cantata_store_core::StoreDir;

use crate::error::{DaemonError, DaemonResult};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub store_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub max_jobs: Option<usize>,
    pub substitution_jobs: Option<usize>,
    pub build_timeout_secs: Option<u64>,
    pub max_silent_time_secs: Option<u64>,
    pub max_log_size: Option<u64>,
    pub keep_failed: Option<bool>,
    pub build_cores: Option<usize>,
    pub substituters: Option<Vec<String>>,
    pub trusted_public_keys: Option<Vec<String>>,
    pub secret_key_file: Option<PathBuf>,
    pub require_sigs: Option<bool>,
    pub extra_platforms: Option<Vec<String>>,
    pub build_user_base: Option<u32>,
    pub build_user_count: Option<u32>,
    pub min_free: Option<u64>,
    pub max_free: Option<u64>,
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub store_dir: StoreDir,
    /// Holds `db/`, `gcroots/`, `temproots/`, `userpool/`, `gc.lock`.
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub socket_path: PathBuf,
    /// Concurrent building goals.
    pub max_jobs: usize,
    /// Concurrent substitution downloads.
    pub substitution_jobs: usize,
    pub build_timeout: Option<Duration>,
    pub max_silent_time: Option<Duration>,
    /// Kill a build once its log exceeds this many bytes; 0 disables.
    pub max_log_size: u64,
    pub keep_failed: bool,
    pub build_cores: usize,
    /// Substituter URLs in fallback order.
    pub substituters: Vec<String>,
    pub trusted_public_keys: Vec<PublicKey>,
    pub secret_key: Option<SecretKey>,
    /// Whether substituted paths must carry a valid signature.
    pub require_sigs: bool,
    /// Platforms accepted besides the host platform.
    pub extra_platforms: Vec<String>,
    /// First uid of the build user pool; `None` builds as the daemon
    /// user.
    pub build_user_base: Option<u32>,
    pub build_user_count: u32,
    /// Trigger automatic GC when free space drops below this.
    pub min_free: Option<u64>,
    /// Automatic GC frees up to this level.
    pub max_free: u64,
}

impl DaemonConfig {
    /// Resolve from an optional config file and the environment.
    pub fn load(config_file: Option<&Path>) -> DaemonResult<Self> {
        let file: ConfigFile = match config_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text).map_err(|e| {
                    DaemonError::other(format!("bad config file {}: {e}", path.display()))
                })?
            }
            None => Default::default(),
        };
        Self::from_parts(file)
    }

    pub fn from_parts(file: ConfigFile) -> DaemonResult<Self> {
        let store_dir_path = std::env::var_os("NIX_STORE_DIR")
            .map(PathBuf::from)
            .or(file.store_dir)
            .unwrap_or_else(|| PathBuf::from("/nix/store"));
        let state_dir = std::env::var_os("NIX_STATE_DIR")
            .map(PathBuf::from)
            .or(file.state_dir)
            .unwrap_or_else(|| PathBuf::from("/nix/var/nix"));
        let log_dir = std::env::var_os("NIX_LOG_DIR")
            .map(PathBuf::from)
            .or(file.log_dir)
            .unwrap_or_else(|| PathBuf::from("/nix/var/log/nix"));
        let socket_path = file
            .socket_path
            .unwrap_or_else(|| state_dir.join("daemon-socket/socket"));

        let store_dir = StoreDir::new(store_dir_path.to_string_lossy().into_owned())
            .map_err(DaemonError::BadStorePath)?;

        let trusted_public_keys = file
            .trusted_public_keys
            .unwrap_or_default()
            .iter()
            .map(|k| {
                k.parse()
                    .map_err(|e| DaemonError::other(format!("bad public key: {e}")))
            })
            .collect::<DaemonResult<Vec<_>>>()?;

        let secret_key = match file.secret_key_file {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                Some(text.trim().parse().map_err(|e| {
                    DaemonError::other(format!("bad secret key in {}: {e}", path.display()))
                })?)
            }
            None => None,
        };

        Ok(DaemonConfig {
            store_dir,
            state_dir,
            log_dir,
            socket_path,
            max_jobs: file.max_jobs.unwrap_or(1),
            substitution_jobs: file.substitution_jobs.unwrap_or(4),
            build_timeout: file.build_timeout_secs.map(Duration::from_secs),
            max_silent_time: file.max_silent_time_secs.map(Duration::from_secs),
            max_log_size: file.max_log_size.unwrap_or(0),
            keep_failed: file.keep_failed.unwrap_or(false),
            build_cores: file.build_cores.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            }),
            substituters: file.substituters.unwrap_or_default(),
            trusted_public_keys,
            secret_key,
            require_sigs: file.require_sigs.unwrap_or(true),
            extra_platforms: file.extra_platforms.unwrap_or_default(),
            build_user_base: file.build_user_base,
            build_user_count: file.build_user_count.unwrap_or(32),
            min_free: file.min_free,
            max_free: file.max_free.unwrap_or(u64::MAX),
        })
    }

    /// A configuration rooted under a scratch directory, for tests.
    pub fn test_config(base: &Path) -> Self {
        let store_dir =
            StoreDir::new(base.join("store").to_string_lossy().into_owned()).unwrap();
        DaemonConfig {
            store_dir,
            state_dir: base.join("state"),
            log_dir: base.join("log"),
            socket_path: base.join("daemon.socket"),
            max_jobs: 2,
            substitution_jobs: 2,
            build_timeout: Some(Duration::from_secs(60)),
            max_silent_time: None,
            max_log_size: 0,
            keep_failed: false,
            build_cores: 1,
            substituters: Vec::new(),
            trusted_public_keys: Vec::new(),
            secret_key: None,
            require_sigs: false,
            extra_platforms: Vec::new(),
            build_user_base: None,
            build_user_count: 4,
            min_free: None,
            max_free: u64::MAX,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("db/db.sqlite")
    }

    pub fn gcroots_dir(&self) -> PathBuf {
        self.state_dir.join("gcroots")
    }

    pub fn auto_roots_dir(&self) -> PathBuf {
        self.state_dir.join("gcroots/auto")
    }

    pub fn temproots_dir(&self) -> PathBuf {
        self.state_dir.join("temproots")
    }

    pub fn userpool_dir(&self) -> PathBuf {
        self.state_dir.join("userpool")
    }

    pub fn gc_lock_path(&self) -> PathBuf {
        self.state_dir.join("gc.lock")
    }

    pub fn builds_dir(&self) -> PathBuf {
        std::env::var_os("TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.state_dir.join("builds"))
    }

    /// The host platform string, e.g. `x86_64-linux`.
    pub fn host_platform() -> String {
        format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
    }

    /// Whether `platform` can be built here.
    pub fn supports_platform(&self, platform: &str) -> bool {
        platform == Self::host_platform()
            || platform == "builtin"
            || self.extra_platforms.iter().any(|p| p == platform)
    }

    /// Create the on-disk layout this configuration describes.
    pub fn create_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.store_dir.to_path())?;
        std::fs::create_dir_all(self.state_dir.join("db"))?;
        std::fs::create_dir_all(self.gcroots_dir())?;
        std::fs::create_dir_all(self.auto_roots_dir())?;
        std::fs::create_dir_all(self.temproots_dir())?;
        std::fs::create_dir_all(self.userpool_dir())?;
        std::fs::create_dir_all(self.builds_dir())?;
        std::fs::create_dir_all(self.log_dir.join("drvs"))?;
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DaemonConfig::from_parts(ConfigFile::default()).unwrap();
        assert_eq!(config.max_jobs, 1);
        assert!(config.require_sigs);
        assert_eq!(config.max_free, u64::MAX);
    }

    #[test]
    fn toml_roundtrip() {
        let file: ConfigFile = toml::from_str(
            r#"
            max_jobs = 8
            keep_failed = true
            substituters = ["daemon", "https://cache.example.org?priority=10"]
            require_sigs = false
            extra_platforms = ["i686-linux"]
            "#,
        )
        .unwrap();
        let config = DaemonConfig::from_parts(file).unwrap();
        assert_eq!(config.max_jobs, 8);
        assert!(config.keep_failed);
        assert_eq!(config.substituters.len(), 2);
        assert!(!config.require_sigs);
        assert!(config.supports_platform("i686-linux"));
    }

    #[test]
    fn unknown_config_keys_rejected() {
        assert!(toml::from_str::<ConfigFile>("no_such_option = 1").is_err());
    }

    #[test]
    fn platform_support() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::test_config(dir.path());
        assert!(config.supports_platform(&DaemonConfig::host_platform()));
        assert!(config.supports_platform("builtin"));
        assert!(!config.supports_platform("mips64-plan9"));
    }

    #[test]
    fn layout_creation() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::test_config(dir.path());
        config.create_layout().unwrap();
        assert!(config.db_path().parent().unwrap().is_dir());
        assert!(config.auto_roots_dir().is_dir());
        assert!(config.temproots_dir().is_dir());
    }
}
