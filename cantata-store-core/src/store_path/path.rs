// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use std::fmt;
use std::hash as std_hash;
use std::ops::Deref;
use std::str::FromStr;

use thiserror::Error;

use cantata_utils_base_encoding::base32;
use cantata_utils_hash::{Sha256, compress_hash};

pub(crate) const STORE_PATH_HASH_SIZE: usize = 20;
pub(crate) const STORE_PATH_HASH_ENCODED_SIZE: usize = base32::encode_len(STORE_PATH_HASH_SIZE);
pub(crate) const MAX_NAME_LEN: usize = 211;

/// The base name of a store object: `<base32-digest>-<name>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
    hash: StorePathHash,
    name: StorePathName,
}

impl StorePath {
    /// Parse from the base name, e.g.
    /// `ywrs8hr8fa4244bpdxi88bd87qxqgmy0-app-home`.
    pub fn from_base_name(s: &str) -> Result<Self, StorePathError> {
        Self::from_bytes(s.as_bytes())
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, StorePathError> {
        if buf.len() < STORE_PATH_HASH_ENCODED_SIZE + 1 {
            return Err(StorePathError::HashLength);
        }
        if buf[STORE_PATH_HASH_ENCODED_SIZE] != b'-' {
            return Err(StorePathError::Symbol(
                STORE_PATH_HASH_ENCODED_SIZE as u8,
                buf[STORE_PATH_HASH_ENCODED_SIZE],
            ));
        }
        let hash = StorePathHash::decode_digest(&buf[..STORE_PATH_HASH_ENCODED_SIZE])?;
        let name: StorePathName = buf[STORE_PATH_HASH_ENCODED_SIZE + 1..]
            .try_into()
            .map_err(|err: StorePathNameError| {
                StorePathError::adjust_index(STORE_PATH_HASH_ENCODED_SIZE as u8 + 1, err.into())
            })?;
        Ok(StorePath { hash, name })
    }

    /// Build a path from a full SHA-256 fingerprint digest and a name.
    pub fn from_hash(hash: &Sha256, name: &str) -> Result<Self, StorePathError> {
        Ok(StorePath {
            hash: StorePathHash::from_sha256(hash),
            name: name.parse().map_err(StorePathError::from)?,
        })
    }

    pub fn name(&self) -> &StorePathName {
        &self.name
    }

    pub fn hash(&self) -> &StorePathHash {
        &self.hash
    }

    /// Whether this path names a derivation.
    pub fn is_derivation(&self) -> bool {
        self.name.as_ref().ends_with(".drv")
    }

    /// The name with any `.drv` suffix removed.
    pub fn derivation_name(&self) -> &str {
        self.name.as_ref().strip_suffix(".drv").unwrap_or(&self.name)
    }
}

impl fmt::Debug for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StorePath")
            .field(&format_args!("{}", self))
            .finish()
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.hash, self.name)
    }
}

impl From<(StorePathHash, StorePathName)> for StorePath {
    fn from((hash, name): (StorePathHash, StorePathName)) -> Self {
        StorePath { hash, name }
    }
}

impl TryFrom<&[u8]> for StorePath {
    type Error = StorePathError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        StorePath::from_bytes(value)
    }
}

impl FromStr for StorePath {
    type Err = StorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorePath::from_bytes(s.as_bytes())
    }
}

impl serde::Serialize for StorePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for StorePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::Deserialize as _;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The 160-bit truncated digest part of a store path.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StorePathHash([u8; STORE_PATH_HASH_SIZE]);

impl StorePathHash {
    pub const fn len() -> usize {
        STORE_PATH_HASH_SIZE
    }

    pub const fn encoded_len() -> usize {
        STORE_PATH_HASH_ENCODED_SIZE
    }

    pub fn new(value: [u8; STORE_PATH_HASH_SIZE]) -> StorePathHash {
        StorePathHash(value)
    }

    /// XOR-fold a full fingerprint digest down to the path hash.
    pub fn from_sha256(hash: &Sha256) -> Self {
        let folded = compress_hash(hash.as_ref(), STORE_PATH_HASH_SIZE);
        let mut digest = [0u8; STORE_PATH_HASH_SIZE];
        digest.copy_from_slice(&folded);
        StorePathHash(digest)
    }

    pub fn decode_digest(data: &[u8]) -> Result<StorePathHash, StorePathError> {
        if data.len() != STORE_PATH_HASH_ENCODED_SIZE {
            return Err(StorePathError::HashLength);
        }
        let mut digest = [0u8; STORE_PATH_HASH_SIZE];
        base32::decode_mut(data, &mut digest).map_err(|err| {
            StorePathError::Symbol(err.error.position as u8, data[err.error.position])
        })?;
        Ok(StorePathHash(digest))
    }
}

impl fmt::Debug for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorePathHash({})", self)
    }
}

impl fmt::Display for StorePathHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut output = [0u8; STORE_PATH_HASH_ENCODED_SIZE];
        base32::encode_mut(&self.0, &mut output);
        // Nix base32 is an ASCII subset.
        f.write_str(std::str::from_utf8(&output).unwrap())
    }
}

impl FromStr for StorePathHash {
    type Err = StorePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorePathHash::decode_digest(s.as_bytes())
    }
}

impl AsRef<[u8]> for StorePathHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// Ordering and hashing run over the digest reversed, matching the sort
// order of encoded hash parts.
impl std_hash::Hash for StorePathHash {
    fn hash<H: std_hash::Hasher>(&self, state: &mut H) {
        for c in self.0.iter().rev() {
            c.hash(state);
        }
    }
}

impl Ord for StorePathHash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.iter().rev().cmp(other.0.iter().rev())
    }
}

impl PartialOrd for StorePathHash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

const NAME_LOOKUP: [bool; 256] = {
    let mut table = [false; 256];
    let mut i = 0usize;
    while i < 256 {
        let ch = i as u8;
        table[i] = matches!(ch,
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'+' | b'-' | b'_' | b'?' | b'=' | b'.');
        i += 1;
    }
    table
};

/// The name part of a store path: `[A-Za-z0-9+\-_?=.]{1,211}`, not
/// starting with `.`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePathName(String);

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum StorePathNameError {
    #[error("invalid store path name length")]
    NameLength,
    #[error("store path name starts with '.'")]
    LeadingDot,
    #[error("invalid store path name symbol {1:?} at {0}")]
    Symbol(u8, u8),
}

impl StorePathName {
    fn validate(s: &[u8]) -> Result<(), StorePathNameError> {
        if s.is_empty() || s.len() > MAX_NAME_LEN {
            return Err(StorePathNameError::NameLength);
        }
        if s[0] == b'.' {
            return Err(StorePathNameError::LeadingDot);
        }
        for (idx, ch) in s.iter().enumerate() {
            if !NAME_LOOKUP[*ch as usize] {
                return Err(StorePathNameError::Symbol(idx as u8, *ch));
            }
        }
        Ok(())
    }
}

impl fmt::Display for StorePathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&[u8]> for StorePathName {
    type Error = StorePathNameError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        StorePathName::validate(value)?;
        // Validated as an ASCII subset above.
        Ok(StorePathName(std::str::from_utf8(value).unwrap().to_owned()))
    }
}

impl FromStr for StorePathName {
    type Err = StorePathNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.as_bytes().try_into()
    }
}

impl AsRef<str> for StorePathName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for StorePathName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum StorePathError {
    #[error("invalid store path hash length")]
    HashLength,
    #[error("invalid store path name length")]
    NameLength,
    #[error("store path name starts with '.'")]
    LeadingDot,
    #[error("invalid store path symbol {1:?} at {0}")]
    Symbol(u8, u8),
}

impl From<StorePathNameError> for StorePathError {
    fn from(value: StorePathNameError) -> Self {
        match value {
            StorePathNameError::NameLength => StorePathError::NameLength,
            StorePathNameError::LeadingDot => StorePathError::LeadingDot,
            StorePathNameError::Symbol(idx, ch) => StorePathError::Symbol(idx, ch),
        }
    }
}

impl StorePathError {
    fn adjust_index(prefix: u8, other: StorePathError) -> StorePathError {
        match other {
            StorePathError::Symbol(old, ch) => StorePathError::Symbol(prefix + old, ch),
            other => other,
        }
    }
}

/// A full-path parse error, carrying the offending string.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParseStorePathError {
    #[error("path '{0}' is not in the store")]
    NotInStore(String),
    #[error("bad store path '{path}': {error}")]
    BadStorePath {
        path: String,
        #[source]
        error: StorePathError,
    },
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use hex_literal::hex;
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[test]
    fn parse_hash() {
        let hash = "zzcfcjwxkn4cf1nh8dh521vffyq24179"
            .parse::<StorePathHash>()
            .unwrap();
        let expected = hex!("E904 22B0 776E 0751 6043 D006 C788 9D9D 4BE6 D8FF");
        assert_eq!(hash.as_ref(), expected);
    }

    #[rstest]
    #[case::empty("", StorePathError::HashLength)]
    #[case::too_short("zzcfcjwxkn4cf1nh8dh521vffyq2417", StorePathError::HashLength)]
    #[case::too_long("zzcfcjwxkn4cf1nh8dh521vffyq24179a", StorePathError::HashLength)]
    #[case::bad_symbol("zzcfcjwxkn4|f1nh8dh521vffyq24179", StorePathError::Symbol(11, b'|'))]
    fn parse_hash_error(#[case] hash: &str, #[case] expected: StorePathError) {
        assert_eq!(hash.parse::<StorePathHash>().unwrap_err(), expected);
    }

    #[rstest]
    #[case("perl5.38.0-libnet-3.12")]
    #[case::all_symbols("a.-_?+=abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ")]
    #[case::single("x")]
    fn name_ok(#[case] case: &str) {
        let name = case.parse::<StorePathName>().expect("parses");
        assert_eq!(case, name.as_ref());
    }

    #[rstest]
    #[case::empty("", StorePathNameError::NameLength)]
    #[case::leading_dot(".hidden", StorePathNameError::LeadingDot)]
    #[case::bad_symbol("test|more", StorePathNameError::Symbol(4, b'|'))]
    #[case::slash("a/b", StorePathNameError::Symbol(1, b'/'))]
    fn name_errors(#[case] name: &str, #[case] expected: StorePathNameError) {
        assert_eq!(name.parse::<StorePathName>().unwrap_err(), expected);
    }

    #[test]
    fn name_max_length() {
        let ok = "a".repeat(MAX_NAME_LEN);
        assert!(ok.parse::<StorePathName>().is_ok());
        let too_long = "a".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            too_long.parse::<StorePathName>().unwrap_err(),
            StorePathNameError::NameLength
        );
    }

    #[rstest]
    #[case::missing_dash(
        "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv.test",
        StorePathError::Symbol(32, b'.')
    )]
    #[case::missing_name(
        "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-",
        StorePathError::NameLength
    )]
    #[case::bad_name_symbol(
        "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-test|more",
        StorePathError::Symbol(37, b'|')
    )]
    fn store_path_error(#[case] path: &str, #[case] expected: StorePathError) {
        assert_eq!(path.parse::<StorePath>().unwrap_err(), expected);
    }

    #[test]
    fn store_path_parts() {
        let path: StorePath = "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-konsole-18.12.3"
            .parse()
            .unwrap();
        assert_eq!(path.name().as_ref(), "konsole-18.12.3");
        assert_eq!(path.hash().to_string(), "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv");
        assert!(!path.is_derivation());

        let drv: StorePath = "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-konsole-18.12.3.drv"
            .parse()
            .unwrap();
        assert!(drv.is_derivation());
        assert_eq!(drv.derivation_name(), "konsole-18.12.3");
    }

    #[test]
    fn hash_part_sort_order() {
        // Encoded-string order must agree with StorePathHash's Ord.
        let list = [
            "00ljmhbmf3d12aq4l5l7yr7bxn03yqvf",
            "0sbwqgpi6jbqr710w5vn0b4s5w6z8n8n",
            "1hghwlv8pxghnkk1q0jvhlh2pzc1sc2f",
            "9hmpxy56lak38d06hwdsihnq2cxdcjk0",
            "a4z7pxg4xh6mm66s77d72ks1myzlk777",
            "lzdk0y2liz1jh9s34dcp7fijp96sxa7d",
            "zs498qq1arym4p4z6bkpid3xgrbl29rj",
        ];
        let parsed = list.map(|i| i.parse::<StorePathHash>().unwrap());
        for window in parsed.windows(2) {
            assert_eq!(window[0].cmp(&window[1]), Ordering::Less);
        }
    }

    prop_compose! {
        fn arb_store_path()(
            digest in any::<[u8; STORE_PATH_HASH_SIZE]>(),
            name in "[a-zA-Z0-9+\\-_?=][a-zA-Z0-9+\\-_?=.]{0,60}",
        ) -> StorePath {
            StorePath {
                hash: StorePathHash::new(digest),
                name: name.parse().unwrap(),
            }
        }
    }

    proptest! {
        #[test]
        fn display_parse_roundtrip(path in arb_store_path()) {
            let s = path.to_string();
            let parsed = s.parse::<StorePath>().expect("parses display output");
            prop_assert_eq!(path, parsed);
        }
    }
}
