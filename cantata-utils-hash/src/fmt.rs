// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Rendering and parsing of hashes.
//!
//! A hash can be rendered in four ways, wrapped in the corresponding
//! newtype:
//!
//! - [`Base16`]: `sha256:<lowercase hex>`
//! - [`Base32`]: `sha256:<nix-base32>` (the store default)
//! - [`Base64`]: `sha256:<padded base64>`
//! - [`Sri`]: `sha256-<base64>`
//!
//! [`Any`] parses whichever of these it is given, detecting the encoding
//! from the digest length. [`Bare`] drops the algorithm prefix from a
//! rendering; parsing a bare hash needs an algorithm known from context.

use std::fmt as sfmt;
use std::str::FromStr;

use data_encoding::{BASE64, HEXLOWER_PERMISSIVE};
use thiserror::Error;

use cantata_utils_base_encoding::base32;

use crate::{Algorithm, Hash, InvalidHashError, NarHash, Sha256, UnknownAlgorithm};

#[derive(derive_more::Display, Debug, PartialEq, Eq, Clone)]
pub enum Encoding {
    #[display("base16")]
    Base16,
    #[display("nixbase32")]
    NixBase32,
    #[display("base64")]
    Base64,
}

#[derive(Debug, PartialEq, Clone)]
pub enum ParseHashErrorKind {
    Algorithm(UnknownAlgorithm),
    NotSri,
    TypeMismatch {
        expected: Algorithm,
        actual: Algorithm,
    },
    MissingType,
    BadEncoding(Encoding, data_encoding::DecodeError),
    WrongHashLength(Algorithm, usize),
}

impl sfmt::Display for ParseHashErrorKind {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        match self {
            ParseHashErrorKind::Algorithm(err) => write!(f, "has {err}"),
            ParseHashErrorKind::NotSri => write!(f, "is not SRI"),
            ParseHashErrorKind::TypeMismatch { expected, actual } => {
                write!(f, "should have type '{expected}' but got '{actual}'")
            }
            ParseHashErrorKind::MissingType => write!(
                f,
                "does not include a type, nor is the type otherwise known from context"
            ),
            ParseHashErrorKind::BadEncoding(encoding, err) => {
                write!(f, "has {err} when decoding as {encoding}")
            }
            ParseHashErrorKind::WrongHashLength(algorithm, length) => write!(
                f,
                "has wrong length {length} for hash type '{algorithm}'"
            ),
        }
    }
}

#[derive(Error, Debug, PartialEq, Clone)]
#[error("hash '{hash}' {kind}")]
pub struct ParseHashError {
    hash: String,
    kind: ParseHashErrorKind,
}

impl ParseHashError {
    pub fn new<S: Into<String>>(hash: S, kind: ParseHashErrorKind) -> Self {
        ParseHashError {
            hash: hash.into(),
            kind,
        }
    }

    pub fn kind(&self) -> &ParseHashErrorKind {
        &self.kind
    }
}

impl From<InvalidHashError> for ParseHashErrorKind {
    fn from(value: InvalidHashError) -> Self {
        ParseHashErrorKind::WrongHashLength(value.algorithm, value.length)
    }
}

impl From<UnknownAlgorithm> for ParseHashErrorKind {
    fn from(value: UnknownAlgorithm) -> Self {
        ParseHashErrorKind::Algorithm(value)
    }
}

/// Digest values that the formatting wrappers can wrap.
pub trait HashData: Sized {
    fn from_parts(algorithm: Algorithm, bytes: &[u8]) -> Result<Self, ParseHashErrorKind>;
    /// The algorithm implied by the type itself, if fixed.
    fn implied_algorithm() -> Option<Algorithm>;
    fn algorithm(&self) -> Algorithm;
    fn bytes(&self) -> &[u8];
}

impl HashData for Hash {
    fn from_parts(algorithm: Algorithm, bytes: &[u8]) -> Result<Self, ParseHashErrorKind> {
        Ok(Hash::from_slice(algorithm, bytes)?)
    }

    fn implied_algorithm() -> Option<Algorithm> {
        None
    }

    fn algorithm(&self) -> Algorithm {
        Hash::algorithm(self)
    }

    fn bytes(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl HashData for Sha256 {
    fn from_parts(algorithm: Algorithm, bytes: &[u8]) -> Result<Self, ParseHashErrorKind> {
        if algorithm != Algorithm::SHA256 {
            return Err(ParseHashErrorKind::TypeMismatch {
                expected: Algorithm::SHA256,
                actual: algorithm,
            });
        }
        Ok(Sha256::from_slice(bytes)?)
    }

    fn implied_algorithm() -> Option<Algorithm> {
        Some(Algorithm::SHA256)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SHA256
    }

    fn bytes(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl HashData for NarHash {
    fn from_parts(algorithm: Algorithm, bytes: &[u8]) -> Result<Self, ParseHashErrorKind> {
        Sha256::from_parts(algorithm, bytes).map(NarHash::from)
    }

    fn implied_algorithm() -> Option<Algorithm> {
        Some(Algorithm::SHA256)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SHA256
    }

    fn bytes(&self) -> &[u8] {
        self.digest_bytes()
    }
}

fn decode_digest(
    algorithm: Algorithm,
    digest: &str,
) -> Result<Vec<u8>, ParseHashErrorKind> {
    if digest.len() == algorithm.base16_len() {
        HEXLOWER_PERMISSIVE
            .decode(digest.as_bytes())
            .map_err(|e| ParseHashErrorKind::BadEncoding(Encoding::Base16, e))
    } else if digest.len() == algorithm.base32_len() {
        base32::decode(digest.as_bytes())
            .map_err(|e| ParseHashErrorKind::BadEncoding(Encoding::NixBase32, e.error))
    } else if digest.len() == algorithm.base64_len() {
        BASE64
            .decode(digest.as_bytes())
            .map_err(|e| ParseHashErrorKind::BadEncoding(Encoding::Base64, e))
    } else {
        Err(ParseHashErrorKind::WrongHashLength(algorithm, digest.len()))
    }
}

fn parse_any<H: HashData>(s: &str) -> Result<H, ParseHashErrorKind> {
    if let Some((algo, digest)) = s.split_once(':') {
        let algorithm: Algorithm = algo.parse()?;
        H::from_parts(algorithm, &decode_digest(algorithm, digest)?)
    } else if let Some((algo, digest)) = s.split_once('-') {
        let algorithm: Algorithm = algo.parse()?;
        H::from_parts(algorithm, &decode_digest(algorithm, digest)?)
    } else if let Some(algorithm) = H::implied_algorithm() {
        H::from_parts(algorithm, &decode_digest(algorithm, s)?)
    } else {
        Err(ParseHashErrorKind::MissingType)
    }
}

/// Parse a digest without an algorithm prefix, the algorithm being known
/// from context (derivation output hashes, content addresses).
pub fn parse_bare<H: HashData>(
    algorithm: Algorithm,
    digest: &str,
) -> Result<H, ParseHashError> {
    decode_digest(algorithm, digest)
        .and_then(|bytes| H::from_parts(algorithm, &bytes))
        .map_err(|kind| ParseHashError::new(digest, kind))
}

macro_rules! encoded_wrapper {
    ($name:ident, $sep:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, PartialEq, Eq, Clone, Copy)]
        pub struct $name<H>(pub H);

        impl<H> $name<H> {
            pub fn into_inner(self) -> H {
                self.0
            }
        }

        impl<H: HashData> sfmt::Display for $name<H> {
            fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
                write!(f, "{}{}", self.0.algorithm(), $sep)?;
                self.fmt_bare(f)
            }
        }

        impl<H: HashData> FromStr for $name<H> {
            type Err = ParseHashError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_any(s)
                    .map($name)
                    .map_err(|kind| ParseHashError::new(s, kind))
            }
        }
    };
}

encoded_wrapper!(Base16, ":", "Lowercase hex rendering, `algo:hex`.");
encoded_wrapper!(Base32, ":", "Nix-base32 rendering, `algo:base32`.");
encoded_wrapper!(Base64, ":", "Padded base64 rendering, `algo:base64`.");
encoded_wrapper!(Sri, "-", "SRI rendering, `algo-base64`.");

impl<H: HashData> Base16<H> {
    fn fmt_bare(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        f.write_str(&HEXLOWER_PERMISSIVE.encode(self.0.bytes()))
    }
}

impl<H: HashData> Base32<H> {
    fn fmt_bare(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        f.write_str(&base32::encode(self.0.bytes()))
    }
}

impl<H: HashData> Base64<H> {
    fn fmt_bare(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        f.write_str(&BASE64.encode(self.0.bytes()))
    }
}

impl<H: HashData> Sri<H> {
    fn fmt_bare(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        f.write_str(&BASE64.encode(self.0.bytes()))
    }
}

/// Parses any supported rendering; displays as nix-base32.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Any<H>(pub H);

impl<H> Any<H> {
    pub fn into_inner(self) -> H {
        self.0
    }
}

impl<H: HashData> sfmt::Display for Any<H> {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "{}:", self.0.algorithm())?;
        f.write_str(&base32::encode(self.0.bytes()))
    }
}

impl<H: HashData> FromStr for Any<H> {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_any(s)
            .map(Any)
            .map_err(|kind| ParseHashError::new(s, kind))
    }
}

/// Drops the algorithm prefix from a rendering.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Bare<W>(pub W);

macro_rules! bare_display {
    ($wrapper:ident) => {
        impl<H: HashData> sfmt::Display for Bare<$wrapper<H>> {
            fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
                self.0.fmt_bare(f)
            }
        }
    };
}

bare_display!(Base16);
bare_display!(Base32);
bare_display!(Base64);

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn abc() -> Hash {
        Algorithm::SHA256.digest("abc")
    }

    #[test]
    fn display_forms() {
        let hash = abc();
        assert_eq!(
            Base16(hash).to_string(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            Base32(hash).to_string(),
            "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
        );
        assert_eq!(
            Base64(hash).to_string(),
            "sha256:unhvj48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
        assert_eq!(
            Sri(hash).to_string(),
            "sha256-unhvj48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
        assert_eq!(
            Bare(Base16(hash)).to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[rstest]
    #[case::base16("sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")]
    #[case::base32("sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s")]
    #[case::base64("sha256:unhvj48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=")]
    #[case::sri("sha256-unhvj48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=")]
    fn any_parses_all_forms(#[case] input: &str) {
        let parsed: Any<Hash> = input.parse().unwrap();
        assert_eq!(parsed.into_inner(), abc());
    }

    #[test]
    fn bare_needs_context() {
        let bare = "1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s";
        let err = bare.parse::<Any<Hash>>().expect_err("parse succeeded");
        assert_eq!(err.kind(), &ParseHashErrorKind::MissingType);

        // With an implied algorithm the bare form parses.
        let parsed: Any<Sha256> = bare.parse().unwrap();
        assert_eq!(Hash::from(parsed.into_inner()), abc());
    }

    #[test]
    fn parse_bare_with_algorithm() {
        let bare = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        let parsed: Hash = parse_bare(Algorithm::SHA256, bare).unwrap();
        assert_eq!(parsed, abc());
    }

    #[test]
    fn wrong_length_rejected() {
        let err = "sha256:abcd".parse::<Any<Hash>>().expect_err("parsed");
        assert!(matches!(
            err.kind(),
            ParseHashErrorKind::WrongHashLength(Algorithm::SHA256, 4)
        ));
    }

    #[test]
    fn type_mismatch_rejected() {
        let sha1 = Algorithm::SHA1.digest("abc");
        let rendered = Base16(sha1).to_string();
        let err = rendered.parse::<Any<Sha256>>().expect_err("parsed");
        assert_eq!(
            err.kind(),
            &ParseHashErrorKind::TypeMismatch {
                expected: Algorithm::SHA256,
                actual: Algorithm::SHA1,
            }
        );
    }

    #[test]
    fn sri_roundtrip() {
        let hash = abc();
        let sri = Sri(hash).to_string();
        let parsed: Sri<Hash> = sri.parse().unwrap();
        assert_eq!(parsed.into_inner(), hash);
    }
}
