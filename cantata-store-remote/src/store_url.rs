// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Store URLs: `<scheme>://<authority>?<key>=<value>&…`.
//!
//! Backends register themselves in an explicit table built at program
//! start; nothing is registered from static initializers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Schemes the engine recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Scheme {
    /// Pick `daemon` when a daemon socket exists, `local` otherwise.
    Auto,
    Local,
    Daemon,
    Unix,
    Ssh,
    SshNg,
    Http,
    Https,
    File,
    S3,
    /// A store that holds nothing and accepts nothing.
    Dummy,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Auto => "auto",
            Scheme::Local => "local",
            Scheme::Daemon => "daemon",
            Scheme::Unix => "unix",
            Scheme::Ssh => "ssh",
            Scheme::SshNg => "ssh-ng",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::File => "file",
            Scheme::S3 => "s3",
            Scheme::Dummy => "dummy",
        }
    }
}

impl FromStr for Scheme {
    type Err = StoreUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Scheme::Auto),
            "local" => Ok(Scheme::Local),
            "daemon" => Ok(Scheme::Daemon),
            "unix" => Ok(Scheme::Unix),
            "ssh" => Ok(Scheme::Ssh),
            "ssh-ng" => Ok(Scheme::SshNg),
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "file" => Ok(Scheme::File),
            "s3" => Ok(Scheme::S3),
            "dummy" => Ok(Scheme::Dummy),
            other => Err(StoreUrlError::UnknownScheme(other.to_owned())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Clone)]
pub enum StoreUrlError {
    #[error("unknown store scheme '{0}'")]
    UnknownScheme(String),
    #[error("malformed store URL '{0}'")]
    Malformed(String),
}

/// A parsed store URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUrl {
    pub scheme: Scheme,
    /// Host, socket path, or directory, depending on the scheme.
    pub authority: String,
    /// Query parameters (`store`, `trusted`, `priority`,
    /// `compression`, ...).
    pub params: BTreeMap<String, String>,
}

impl StoreUrl {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The `store` parameter: an override for the store directory.
    pub fn store_dir_override(&self) -> Option<&str> {
        self.param("store")
    }

    /// Substituter ordering priority; lower is tried first.
    pub fn priority(&self) -> u64 {
        self.param("priority")
            .and_then(|p| p.parse().ok())
            .unwrap_or(50)
    }
}

impl FromStr for StoreUrl {
    type Err = StoreUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Bare names used by configuration shorthand.
        if !s.contains("://") {
            let (scheme_str, params) = match s.split_once('?') {
                Some((scheme, query)) => (scheme, parse_query(query)),
                None => (s, BTreeMap::new()),
            };
            return Ok(StoreUrl {
                scheme: scheme_str.parse()?,
                authority: String::new(),
                params,
            });
        }

        let url = url::Url::parse(s).map_err(|_| StoreUrlError::Malformed(s.to_owned()))?;
        let scheme: Scheme = url.scheme().parse()?;
        let mut authority = String::new();
        if let Some(host) = url.host_str() {
            if let Some(user) = Some(url.username()).filter(|u| !u.is_empty()) {
                authority.push_str(user);
                authority.push('@');
            }
            authority.push_str(host);
            if let Some(port) = url.port() {
                authority.push(':');
                authority.push_str(&port.to_string());
            }
        }
        authority.push_str(url.path());
        let authority = authority.trim_end_matches('/').to_owned();
        let params = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Ok(StoreUrl {
            scheme,
            authority,
            params,
        })
    }
}

impl fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            f.write_str(if i == 0 { "?" } else { "&" })?;
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

/// A registered store backend.
pub struct BackendDescriptor {
    pub scheme: Scheme,
    /// Whether this backend operates on the local filesystem.
    pub local: bool,
}

/// The table of known backends, built once at program start.
pub struct BackendRegistry {
    backends: Vec<BackendDescriptor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        BackendRegistry {
            backends: Vec::new(),
        }
    }

    /// The registry with every built-in backend.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(BackendDescriptor {
            scheme: Scheme::Local,
            local: true,
        });
        registry.register(BackendDescriptor {
            scheme: Scheme::Daemon,
            local: false,
        });
        registry.register(BackendDescriptor {
            scheme: Scheme::Unix,
            local: false,
        });
        registry.register(BackendDescriptor {
            scheme: Scheme::Ssh,
            local: false,
        });
        registry.register(BackendDescriptor {
            scheme: Scheme::SshNg,
            local: false,
        });
        registry.register(BackendDescriptor {
            scheme: Scheme::Http,
            local: false,
        });
        registry.register(BackendDescriptor {
            scheme: Scheme::Https,
            local: false,
        });
        registry.register(BackendDescriptor {
            scheme: Scheme::File,
            local: true,
        });
        registry.register(BackendDescriptor {
            scheme: Scheme::S3,
            local: false,
        });
        registry.register(BackendDescriptor {
            scheme: Scheme::Dummy,
            local: false,
        });
        registry
    }

    pub fn register(&mut self, descriptor: BackendDescriptor) {
        self.backends.push(descriptor);
    }

    pub fn lookup(&self, scheme: Scheme) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|b| b.scheme == scheme)
    }

    /// Resolve `auto`: `daemon` when the daemon socket exists, `local`
    /// otherwise.
    pub fn resolve_auto(&self, daemon_socket: &std::path::Path) -> Scheme {
        if daemon_socket.exists() {
            Scheme::Daemon
        } else {
            Scheme::Local
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::daemon("daemon", Scheme::Daemon, "")]
    #[case::auto("auto", Scheme::Auto, "")]
    #[case::unix_socket("unix:///run/store/daemon.socket", Scheme::Unix, "/run/store/daemon.socket")]
    #[case::ssh("ssh://builder@example.org", Scheme::Ssh, "builder@example.org")]
    #[case::https("https://cache.example.org/store", Scheme::Https, "cache.example.org/store")]
    #[case::file("file:///srv/cache", Scheme::File, "/srv/cache")]
    fn parse(#[case] input: &str, #[case] scheme: Scheme, #[case] authority: &str) {
        let url: StoreUrl = input.parse().unwrap();
        assert_eq!(url.scheme, scheme);
        assert_eq!(url.authority, authority);
    }

    #[test]
    fn parse_params() {
        let url: StoreUrl = "https://cache.example.org?priority=10&trusted=1&store=/nix/store"
            .parse()
            .unwrap();
        assert_eq!(url.priority(), 10);
        assert_eq!(url.param("trusted"), Some("1"));
        assert_eq!(url.store_dir_override(), Some("/nix/store"));
    }

    #[test]
    fn priority_defaults() {
        let url: StoreUrl = "daemon".parse().unwrap();
        assert_eq!(url.priority(), 50);
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert_eq!(
            "gopher://x".parse::<StoreUrl>().unwrap_err(),
            StoreUrlError::UnknownScheme("gopher".into())
        );
    }

    #[test]
    fn registry_knows_builtins() {
        let registry = BackendRegistry::builtin();
        assert!(registry.lookup(Scheme::Daemon).is_some());
        assert!(registry.lookup(Scheme::Local).unwrap().local);
        assert!(registry.lookup(Scheme::Auto).is_none());
    }

    #[test]
    fn auto_resolution() {
        let registry = BackendRegistry::builtin();
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.socket");
        assert_eq!(registry.resolve_auto(&socket), Scheme::Local);
        std::fs::write(&socket, b"").unwrap();
        assert_eq!(registry.resolve_auto(&socket), Scheme::Daemon);
    }
}
