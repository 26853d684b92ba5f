// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Derived paths: the targets of a build request.
//!
//! A target is either an opaque store path to make valid (possibly by
//! substitution) or a derivation plus the set of outputs to realise.
//! The textual form is `<path>` / `<drv-path>!<out1>,<out2>` /
//! `<drv-path>!*`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::store_path::{StorePath, StorePathError, StorePathNameError};

/// The name of a derivation output (`out`, `dev`, `lib`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputName(String);

impl OutputName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OutputName {
    fn default() -> Self {
        OutputName("out".into())
    }
}

impl fmt::Display for OutputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for OutputName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for OutputName {
    type Err = StorePathNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Output names obey the store path name grammar; they end up as
        // path name suffixes.
        let _ = crate::store_path::StorePathName::from_str(s)?;
        Ok(OutputName(s.to_owned()))
    }
}

impl serde::Serialize for OutputName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for OutputName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::Deserialize as _;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which outputs of a derivation a request wants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OutputSpec {
    /// All outputs the derivation declares.
    All,
    /// A non-empty named subset.
    Named(BTreeSet<OutputName>),
}

impl OutputSpec {
    pub fn contains(&self, name: &OutputName) -> bool {
        match self {
            OutputSpec::All => true,
            OutputSpec::Named(set) => set.contains(name),
        }
    }
}

impl fmt::Display for OutputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSpec::All => f.write_str("*"),
            OutputSpec::Named(set) => {
                for (i, name) in set.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", name)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ParseOutputSpecError {
    #[error("output spec is empty")]
    Empty,
    #[error(transparent)]
    OutputName(#[from] StorePathNameError),
}

impl FromStr for OutputSpec {
    type Err = ParseOutputSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(OutputSpec::All);
        }
        if s.is_empty() {
            return Err(ParseOutputSpecError::Empty);
        }
        let mut set = BTreeSet::new();
        for name in s.split(',') {
            set.insert(name.parse()?);
        }
        Ok(OutputSpec::Named(set))
    }
}

/// A single build target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DerivedPath {
    /// Make this path valid, substituting if needed.
    Opaque(StorePath),
    /// Realise these outputs of this derivation.
    Built {
        drv_path: StorePath,
        outputs: OutputSpec,
    },
}

impl fmt::Display for DerivedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivedPath::Opaque(path) => write!(f, "{}", path),
            DerivedPath::Built { drv_path, outputs } => write!(f, "{}!{}", drv_path, outputs),
        }
    }
}

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ParseDerivedPathError {
    #[error(transparent)]
    StorePath(#[from] StorePathError),
    #[error(transparent)]
    OutputSpec(#[from] ParseOutputSpecError),
}

impl FromStr for DerivedPath {
    type Err = ParseDerivedPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('!') {
            None => Ok(DerivedPath::Opaque(s.parse()?)),
            Some((path, outputs)) => Ok(DerivedPath::Built {
                drv_path: path.parse()?,
                outputs: outputs.parse()?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::opaque("00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-hello-2.12.1")]
    #[case::all("00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-hello.drv!*")]
    #[case::one("00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-hello.drv!out")]
    #[case::many("00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-hello.drv!dev,out")]
    fn display_parse_roundtrip(#[case] s: &str) {
        let parsed: DerivedPath = s.parse().unwrap();
        assert_eq!(parsed.to_string(), s);
    }

    #[test]
    fn named_outputs_are_sorted() {
        let spec: OutputSpec = "out,dev,lib".parse().unwrap();
        assert_eq!(spec.to_string(), "dev,lib,out");
    }

    #[test]
    fn empty_spec_rejected() {
        assert_eq!(
            "".parse::<OutputSpec>().unwrap_err(),
            ParseOutputSpecError::Empty
        );
    }

    #[test]
    fn contains() {
        let spec: OutputSpec = "dev,out".parse().unwrap();
        assert!(spec.contains(&"out".parse().unwrap()));
        assert!(!spec.contains(&"lib".parse().unwrap()));
        assert!(OutputSpec::All.contains(&"anything".parse().unwrap()));
    }
}
