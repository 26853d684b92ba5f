// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The store directory and path fingerprints.
//!
//! ```EBNF
//! text_path   = 'text', { ':', reference }, ':sha256:', text_digest, ':', store_dir, ':', name
//! source_path = 'source', { ':', reference }, [ ':self' ], ':sha256:', nar_digest, ':', store_dir, ':', name
//! output_path = 'output:', id, ':sha256:', drv_digest, ':', store_dir, ':', name
//! ```
//!
//! The hash part of the resulting store path is the nix-base32 rendering
//! of the 20-byte XOR-fold of SHA-256 over the fingerprint. These
//! strings must stay bit-exact with the wider ecosystem.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;

use cantata_utils_hash::{Algorithm, Sha256};

use crate::content_address::{ContentAddress, ContentAddressWithReferences};

use super::{ParseStorePathError, StorePath, StorePathSet};

/// References carried by a path fingerprint: other paths plus an
/// optional self reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreReferences {
    pub others: StorePathSet,
    pub self_ref: bool,
}

impl StoreReferences {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        !self.self_ref && self.others.is_empty()
    }
}

/// The absolute directory all store objects live under, e.g.
/// `/nix/store`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreDir(Arc<String>);

impl StoreDir {
    pub fn new<S: Into<String>>(dir: S) -> Result<StoreDir, ParseStorePathError> {
        let dir = dir.into();
        if !dir.starts_with('/') || dir.ends_with('/') {
            return Err(ParseStorePathError::NotInStore(dir));
        }
        Ok(StoreDir(Arc::new(dir)))
    }

    pub fn to_str(&self) -> &str {
        &self.0
    }

    pub fn to_path(&self) -> &Path {
        Path::new(self.0.as_str())
    }

    /// Render a [`StorePath`] as an absolute path string.
    pub fn print_path(&self, path: &StorePath) -> String {
        format!("{}/{}", self.0, path)
    }

    /// The absolute filesystem location of `path`.
    pub fn real_path(&self, path: &StorePath) -> PathBuf {
        self.to_path().join(path.to_string())
    }

    /// Parse an absolute path string into a [`StorePath`].
    pub fn parse_path(&self, s: &str) -> Result<StorePath, ParseStorePathError> {
        let rest = s
            .strip_prefix(self.0.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| ParseStorePathError::NotInStore(s.to_owned()))?;
        if rest.contains('/') {
            return Err(ParseStorePathError::NotInStore(s.to_owned()));
        }
        rest.parse().map_err(|error| ParseStorePathError::BadStorePath {
            path: s.to_owned(),
            error,
        })
    }

    /// Whether `path` lies inside this store (possibly below a store
    /// object).
    pub fn is_in_store<P: AsRef<Path>>(&self, path: P) -> bool {
        match path.as_ref().strip_prefix(self.to_path()) {
            Ok(rest) => rest != Path::new(""),
            Err(_) => false,
        }
    }

    /// Split an absolute path into the store object and the residual
    /// path below it.
    pub fn to_store_path<'p>(
        &self,
        path: &'p Path,
    ) -> Result<(StorePath, &'p Path), ParseStorePathError> {
        let not_in_store =
            || ParseStorePathError::NotInStore(path.to_string_lossy().into_owned());
        let rest = path.strip_prefix(self.to_path()).map_err(|_| not_in_store())?;
        let mut components = rest.components();
        let base = components
            .next()
            .ok_or_else(not_in_store)?
            .as_os_str()
            .to_str()
            .ok_or_else(not_in_store)?;
        let store_path = base
            .parse()
            .map_err(|error| ParseStorePathError::BadStorePath {
                path: path.to_string_lossy().into_owned(),
                error,
            })?;
        Ok((store_path, components.as_path()))
    }

    /// Follow a chain of symlinks until the target is inside this store.
    pub async fn follow_links_to_store_path(
        &self,
        path: &Path,
    ) -> std::io::Result<Result<StorePath, ParseStorePathError>> {
        let mut current = path.to_path_buf();
        while !self.is_in_store(&current) {
            let meta = match fs::symlink_metadata(&current).await {
                Ok(meta) => meta,
                Err(err) => return Err(err),
            };
            if !meta.file_type().is_symlink() {
                break;
            }
            let target = fs::read_link(&current).await?;
            current = if target.is_absolute() {
                target
            } else {
                current.parent().unwrap_or(Path::new("/")).join(target)
            };
        }
        Ok(self.to_store_path(&current).map(|(path, _)| path))
    }

    fn fingerprint_type(&self, mut prefix: String, references: &StoreReferences) -> String {
        for reference in references.others.iter() {
            prefix.push(':');
            prefix.push_str(&self.print_path(reference));
        }
        if references.self_ref {
            prefix.push_str(":self");
        }
        prefix
    }

    /// Core path derivation: hash the fingerprint string and build the
    /// path from the folded digest.
    pub fn make_store_path(
        &self,
        path_type: &str,
        digest_hex: &str,
        name: &str,
    ) -> Result<StorePath, ParseStorePathError> {
        let fingerprint = format!("{}:sha256:{}:{}:{}", path_type, digest_hex, self.0, name);
        let digest = Sha256::digest(&fingerprint);
        StorePath::from_hash(&digest, name).map_err(|error| ParseStorePathError::BadStorePath {
            path: format!("{}/{}", self.0, name),
            error,
        })
    }

    /// Path of a stored text file (derivations and other store texts)
    /// with references.
    pub fn make_text_path(
        &self,
        name: &str,
        digest: &Sha256,
        references: &StorePathSet,
    ) -> Result<StorePath, ParseStorePathError> {
        let path_type = self.fingerprint_type(
            "text".into(),
            &StoreReferences {
                others: references.clone(),
                self_ref: false,
            },
        );
        self.make_store_path(&path_type, &format!("{:x}", digest), name)
    }

    /// Path of a NAR-ingested source with references.
    pub fn make_source_path(
        &self,
        name: &str,
        digest: &Sha256,
        references: &StoreReferences,
    ) -> Result<StorePath, ParseStorePathError> {
        let path_type = self.fingerprint_type("source".into(), references);
        self.make_store_path(&path_type, &format!("{:x}", digest), name)
    }

    /// Path of an input-addressed derivation output, where `digest_hex`
    /// is the hex rendering of the derivation's modulo hash.
    pub fn make_output_path(
        &self,
        output_id: &str,
        digest_hex: &str,
        name: &str,
    ) -> Result<StorePath, ParseStorePathError> {
        self.make_store_path(&format!("output:{}", output_id), digest_hex, name)
    }

    /// Path of a fixed-output object, from its declared content hash.
    pub fn make_fixed_output_path(
        &self,
        name: &str,
        ca: &ContentAddress,
        references: &StoreReferences,
    ) -> Result<StorePath, ParseStorePathError> {
        match ca {
            ContentAddress::Text(digest) => {
                assert!(!references.self_ref, "text paths cannot self-reference");
                self.make_text_path(name, digest, &references.others)
            }
            ContentAddress::Recursive(hash) if hash.algorithm() == Algorithm::SHA256 => {
                let digest = Sha256::try_from(*hash).unwrap();
                self.make_source_path(name, &digest, references)
            }
            ContentAddress::Recursive(hash) => {
                assert!(references.is_empty());
                let digest = Sha256::digest(format!("fixed:out:r:{:x}:", hash));
                self.make_output_path("out", &format!("{:x}", digest), name)
            }
            ContentAddress::Flat(hash) => {
                assert!(references.is_empty());
                let digest = Sha256::digest(format!("fixed:out:{:x}:", hash));
                self.make_output_path("out", &format!("{:x}", digest), name)
            }
        }
    }

    /// Path for a full content address with references.
    pub fn make_ca_path(
        &self,
        name: &str,
        ca: &ContentAddressWithReferences,
    ) -> Result<StorePath, ParseStorePathError> {
        self.make_fixed_output_path(name, &ca.ca, &ca.references)
    }
}

impl Default for StoreDir {
    fn default() -> Self {
        StoreDir::new("/nix/store").unwrap()
    }
}

impl AsRef<str> for StoreDir {
    fn as_ref(&self) -> &str {
        self.to_str()
    }
}

impl AsRef<Path> for StoreDir {
    fn as_ref(&self) -> &Path {
        self.to_path()
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use cantata_utils_hash::Hash;
    use cantata_utils_hash::fmt::Any;

    use super::*;

    fn sha256(s: &str) -> Sha256 {
        let hash: Any<Sha256> = s.parse().unwrap();
        hash.into_inner()
    }

    #[test]
    fn parse_and_print() {
        let store = StoreDir::default();
        let p = store
            .parse_path("/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-konsole-18.12.3")
            .unwrap();
        assert_eq!(p.name().as_ref(), "konsole-18.12.3");
        assert_eq!(
            store.print_path(&p),
            "/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-konsole-18.12.3"
        );
    }

    #[rstest]
    #[case::not_in_store("/var/lib/x")]
    #[case::store_itself("/nix/store")]
    #[case::nested("/nix/store/abc/def")]
    fn parse_path_rejects(#[case] path: &str) {
        let store = StoreDir::default();
        assert!(store.parse_path(path).is_err());
    }

    #[test]
    fn is_in_store() {
        let store = StoreDir::default();
        assert!(store.is_in_store("/nix/store/x"));
        assert!(store.is_in_store("/nix/store/x/bin/sh"));
        assert!(!store.is_in_store("/nix/store"));
        assert!(!store.is_in_store("/nix/storeother"));
        assert!(!store.is_in_store("/var"));
    }

    #[test]
    fn to_store_path_residual() {
        let store = StoreDir::default();
        let (path, rest) = store
            .to_store_path(Path::new(
                "/nix/store/7h7qgvs4kgzsn8a6rb273saxyqh4jxlz-konsole-18.12.3/bin/konsole",
            ))
            .unwrap();
        assert_eq!(path.name().as_ref(), "konsole-18.12.3");
        assert_eq!(rest, Path::new("bin/konsole"));
    }

    #[test]
    fn make_source_path_known_value() {
        let store = StoreDir::default();
        let digest = sha256(
            "sha256:248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1",
        );
        let path = store
            .make_source_path("konsole-18.12.3", &digest, &StoreReferences::new())
            .unwrap();
        assert_eq!(
            path.to_string(),
            "1w01xxn8f7s9s4n65ry6rwd7x9awf04s-konsole-18.12.3"
        );
    }

    #[test]
    fn make_fixed_output_path_flat_known_value() {
        let store = StoreDir::default();
        let hash = "sha256:248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1"
            .parse::<Any<Hash>>()
            .unwrap()
            .into_inner();
        let path = store
            .make_fixed_output_path(
                "konsole-18.12.3",
                &ContentAddress::Flat(hash),
                &StoreReferences::new(),
            )
            .unwrap();
        assert_eq!(
            path.to_string(),
            "jw8chmp9sf8f7pw684cszp6pa2zmn0bx-konsole-18.12.3"
        );
    }

    #[test]
    fn make_fixed_output_path_sha1_recursive_known_value() {
        let store = StoreDir::default();
        let hash = "sha1:84983e441c3bd26ebaae4aa1f95129e5e54670f1"
            .parse::<Any<Hash>>()
            .unwrap()
            .into_inner();
        let path = store
            .make_fixed_output_path(
                "konsole-18.12.3",
                &ContentAddress::Recursive(hash),
                &StoreReferences::new(),
            )
            .unwrap();
        assert_eq!(
            path.to_string(),
            "ww9d58nz1xsl5ck0vcpc99h23l1y2hln-konsole-18.12.3"
        );
    }

    #[test]
    fn source_path_with_references_and_self() {
        let store = StoreDir::default();
        let digest = sha256(
            "sha256:248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1",
        );
        let mut others = StorePathSet::new();
        others.insert(
            "ldhh7c134ap5swsm86rqnc0i7cinqvrc-my-terminal".parse().unwrap(),
        );
        others.insert(
            "7h7qgvs4kgzsn8a6rb274saxyqh4jxlz-konsole-18.12.3.drv"
                .parse()
                .unwrap(),
        );
        let references = StoreReferences {
            others,
            self_ref: true,
        };
        let path = store
            .make_source_path("konsole-18.12.3", &digest, &references)
            .unwrap();
        assert_eq!(
            path.to_string(),
            "k7jq5x1vj193x2317ypwsl4k9h0kvra2-konsole-18.12.3"
        );
    }
}
