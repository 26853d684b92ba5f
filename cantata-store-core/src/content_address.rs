// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Content addresses of store objects.
//!
//! Rendered forms, as stored in the `ca` column and sent over the wire:
//!
//! - `text:sha256:<base32>` for stored text (derivations)
//! - `fixed:<algo>:<base32>` for flat file ingestion
//! - `fixed:r:<algo>:<base32>` for recursive (NAR) ingestion

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use cantata_utils_hash::fmt::{Bare, Base32, ParseHashError, parse_bare};
use cantata_utils_hash::{Algorithm, Hash, Sha256, UnknownAlgorithm};

/// How bytes are turned into a store object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentAddressMethod {
    /// The bytes are a stored text with scanned references.
    Text,
    /// The bytes are the file contents themselves.
    Flat,
    /// The bytes are a NAR serialization.
    Recursive,
}

impl ContentAddressMethod {
    /// The prefix used inside `fixed:` renderings (`""` or `"r:"`).
    pub fn fixed_prefix(&self) -> &'static str {
        match self {
            ContentAddressMethod::Recursive => "r:",
            _ => "",
        }
    }
}

/// Method plus algorithm, the declared shape of a floating
/// content-addressed output (`r:sha256`, `text:sha256`, `sha256`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentAddressMethodAlgorithm {
    pub method: ContentAddressMethod,
    pub algorithm: Algorithm,
}

impl fmt::Display for ContentAddressMethodAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.method {
            ContentAddressMethod::Text => write!(f, "text:{}", self.algorithm),
            ContentAddressMethod::Flat => write!(f, "{}", self.algorithm),
            ContentAddressMethod::Recursive => write!(f, "r:{}", self.algorithm),
        }
    }
}

impl FromStr for ContentAddressMethodAlgorithm {
    type Err = ParseContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (method, algo) = if let Some(rest) = s.strip_prefix("text:") {
            (ContentAddressMethod::Text, rest)
        } else if let Some(rest) = s.strip_prefix("r:") {
            (ContentAddressMethod::Recursive, rest)
        } else {
            (ContentAddressMethod::Flat, s)
        };
        Ok(ContentAddressMethodAlgorithm {
            method,
            algorithm: algo.parse()?,
        })
    }
}

/// A concrete content address: method plus digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentAddress {
    Text(Sha256),
    Flat(Hash),
    Recursive(Hash),
}

impl ContentAddress {
    pub fn from_hash(method: ContentAddressMethod, hash: Hash) -> Result<Self, ParseContentAddressError> {
        match method {
            ContentAddressMethod::Text => {
                let digest = Sha256::try_from(hash)
                    .map_err(|_| ParseContentAddressError::TextNotSha256(hash.algorithm()))?;
                Ok(ContentAddress::Text(digest))
            }
            ContentAddressMethod::Flat => Ok(ContentAddress::Flat(hash)),
            ContentAddressMethod::Recursive => Ok(ContentAddress::Recursive(hash)),
        }
    }

    pub fn method(&self) -> ContentAddressMethod {
        match self {
            ContentAddress::Text(_) => ContentAddressMethod::Text,
            ContentAddress::Flat(_) => ContentAddressMethod::Flat,
            ContentAddress::Recursive(_) => ContentAddressMethod::Recursive,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            ContentAddress::Text(digest) => (*digest).into(),
            ContentAddress::Flat(hash) | ContentAddress::Recursive(hash) => *hash,
        }
    }

    pub fn method_algorithm(&self) -> ContentAddressMethodAlgorithm {
        ContentAddressMethodAlgorithm {
            method: self.method(),
            algorithm: self.hash().algorithm(),
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentAddress::Text(digest) => {
                write!(f, "text:sha256:{}", Bare(Base32(*digest)))
            }
            ContentAddress::Flat(hash) => {
                write!(f, "fixed:{}:{}", hash.algorithm(), Bare(Base32(*hash)))
            }
            ContentAddress::Recursive(hash) => {
                write!(f, "fixed:r:{}:{}", hash.algorithm(), Bare(Base32(*hash)))
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ParseContentAddressError {
    #[error("content address '{0}' has an unknown prefix")]
    UnknownPrefix(String),
    #[error("text content addresses must use sha256, not {0}")]
    TextNotSha256(Algorithm),
    #[error(transparent)]
    Algorithm(#[from] UnknownAlgorithm),
    #[error(transparent)]
    Hash(#[from] ParseHashError),
}

impl FromStr for ContentAddress {
    type Err = ParseContentAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("text:sha256:") {
            let digest = parse_bare(Algorithm::SHA256, rest)?;
            Ok(ContentAddress::Text(digest))
        } else if let Some(rest) = s.strip_prefix("fixed:r:") {
            let (algo, digest) = split_hash(rest, s)?;
            Ok(ContentAddress::Recursive(parse_bare(algo, digest)?))
        } else if let Some(rest) = s.strip_prefix("fixed:") {
            let (algo, digest) = split_hash(rest, s)?;
            Ok(ContentAddress::Flat(parse_bare(algo, digest)?))
        } else {
            Err(ParseContentAddressError::UnknownPrefix(s.to_owned()))
        }
    }
}

fn split_hash<'s>(
    rest: &'s str,
    full: &str,
) -> Result<(Algorithm, &'s str), ParseContentAddressError> {
    let (algo, digest) = rest
        .split_once(':')
        .ok_or_else(|| ParseContentAddressError::UnknownPrefix(full.to_owned()))?;
    Ok((algo.parse()?, digest))
}

impl serde::Serialize for ContentAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ContentAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::Deserialize as _;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A content address together with the references the object carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentAddressWithReferences {
    pub ca: ContentAddress,
    pub references: crate::store_path::StoreReferences,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::text("text:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::flat("fixed:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::recursive("fixed:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::sha1("fixed:r:sha1:x0xf8v9fxf3jk8zln1cwlsrmhqvp0f88")]
    fn display_parse_roundtrip(#[case] s: &str) {
        let parsed: ContentAddress = s.parse().unwrap();
        assert_eq!(parsed.to_string(), s);
    }

    #[rstest]
    #[case::empty("")]
    #[case::unknown("blob:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::text_md5("text:md5:8rgkzbyf6cpnsrsakl341f0lkv")]
    fn parse_rejects(#[case] s: &str) {
        assert!(s.parse::<ContentAddress>().is_err());
    }

    #[rstest]
    #[case::flat("sha256", ContentAddressMethod::Flat, Algorithm::SHA256)]
    #[case::recursive("r:sha256", ContentAddressMethod::Recursive, Algorithm::SHA256)]
    #[case::text("text:sha256", ContentAddressMethod::Text, Algorithm::SHA256)]
    #[case::sha1("r:sha1", ContentAddressMethod::Recursive, Algorithm::SHA1)]
    fn method_algorithm_roundtrip(
        #[case] s: &str,
        #[case] method: ContentAddressMethod,
        #[case] algorithm: Algorithm,
    ) {
        let parsed: ContentAddressMethodAlgorithm = s.parse().unwrap();
        assert_eq!(parsed.method, method);
        assert_eq!(parsed.algorithm, algorithm);
        assert_eq!(parsed.to_string(), s);
    }

    #[test]
    fn text_requires_sha256() {
        let sha1 = Algorithm::SHA1.digest("abc");
        assert_eq!(
            ContentAddress::from_hash(ContentAddressMethod::Text, sha1),
            Err(ParseContentAddressError::TextNotSha256(Algorithm::SHA1))
        );
    }
}
