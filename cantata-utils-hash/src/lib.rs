// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Hash algorithms and digests for the store engine.
//!
//! Supports MD5, SHA-1, SHA-256 and SHA-512 with one-shot and streaming
//! (init/update/finish) interfaces, plus the formatting wrappers in
//! [`fmt`] for base16, nix-base32, base64 and SRI renderings.

use std::fmt as sfmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Digest as _;
use thiserror::Error;

mod algo;
pub mod fmt;
mod hashing_reader;

pub use algo::{Algorithm, UnknownAlgorithm};
pub use hashing_reader::{HashState, HashingReader};

const LARGEST_ALGORITHM: Algorithm = Algorithm::SHA512;

#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
#[error("hash has wrong length {length} != {} for hash type '{algorithm}'", algorithm.size())]
pub struct InvalidHashError {
    pub(crate) algorithm: Algorithm,
    pub(crate) length: usize,
}

/// A digest value tagged with its algorithm.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct Hash {
    algorithm: Algorithm,
    data: [u8; LARGEST_ALGORITHM.size()],
}

impl Hash {
    pub const fn new(algorithm: Algorithm, digest: &[u8]) -> Hash {
        let mut data = [0u8; LARGEST_ALGORITHM.size()];
        let (prefix, _) = data.split_at_mut(algorithm.size());
        prefix.copy_from_slice(digest);
        Hash { algorithm, data }
    }

    pub fn from_slice(algorithm: Algorithm, digest: &[u8]) -> Result<Hash, InvalidHashError> {
        if digest.len() != algorithm.size() {
            return Err(InvalidHashError {
                algorithm,
                length: digest.len(),
            });
        }
        Ok(Hash::new(algorithm, digest))
    }

    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.data[0..self.algorithm.size()]
    }
}

impl std::ops::Deref for Hash {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.digest_bytes()
    }
}

impl sfmt::Debug for Hash {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "Hash({})", fmt::Base32(*self))
    }
}

impl sfmt::Display for Hash {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        sfmt::Display::fmt(&fmt::Base32(*self), f)
    }
}

impl sfmt::LowerHex for Hash {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        sfmt::Display::fmt(&fmt::Base16(*self), f)
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&fmt::Sri(*self))
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de;

        let s = String::deserialize(deserializer)?;
        s.parse::<fmt::Any<Hash>>()
            .map(fmt::Any::into_inner)
            .map_err(de::Error::custom)
    }
}

/// A SHA-256 digest, the default algorithm of the store.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct Sha256([u8; Algorithm::SHA256.size()]);

impl Sha256 {
    pub const fn new(digest: &[u8]) -> Self {
        let mut data = [0u8; Algorithm::SHA256.size()];
        data.copy_from_slice(digest);
        Self(data)
    }

    pub fn from_slice(digest: &[u8]) -> Result<Self, InvalidHashError> {
        if digest.len() != Algorithm::SHA256.size() {
            return Err(InvalidHashError {
                algorithm: Algorithm::SHA256,
                length: digest.len(),
            });
        }
        Ok(Self::new(digest))
    }

    pub fn digest<B: AsRef<[u8]>>(data: B) -> Self {
        Algorithm::SHA256.digest(data).try_into().unwrap()
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Sha256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; Algorithm::SHA256.size()]> for Sha256 {
    fn from(digest: [u8; Algorithm::SHA256.size()]) -> Self {
        Sha256(digest)
    }
}

impl From<Sha256> for Hash {
    fn from(value: Sha256) -> Self {
        Hash::new(Algorithm::SHA256, value.as_ref())
    }
}

impl TryFrom<Hash> for Sha256 {
    type Error = fmt::ParseHashErrorKind;

    fn try_from(value: Hash) -> Result<Self, Self::Error> {
        if value.algorithm() != Algorithm::SHA256 {
            return Err(fmt::ParseHashErrorKind::TypeMismatch {
                expected: Algorithm::SHA256,
                actual: value.algorithm(),
            });
        }
        Ok(Self::new(value.as_ref()))
    }
}

impl sfmt::Debug for Sha256 {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "Sha256({})", fmt::Bare(fmt::Base32(*self)))
    }
}

impl sfmt::Display for Sha256 {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        sfmt::Display::fmt(&fmt::Bare(fmt::Base32(*self)), f)
    }
}

impl sfmt::LowerHex for Sha256 {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        sfmt::Display::fmt(&fmt::Bare(fmt::Base16(*self)), f)
    }
}

/// The SHA-256 digest of a NAR serialization.
///
/// Rendered `sha256:<base16>` in the database and in signing
/// fingerprints.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct NarHash(Sha256);

impl NarHash {
    pub const fn new(digest: &[u8]) -> NarHash {
        NarHash(Sha256::new(digest))
    }

    pub fn from_slice(digest: &[u8]) -> Result<NarHash, InvalidHashError> {
        Sha256::from_slice(digest).map(NarHash)
    }

    pub fn digest<D: AsRef<[u8]>>(data: D) -> Self {
        NarHash(Sha256::digest(data))
    }

    #[inline]
    pub fn digest_bytes(&self) -> &[u8] {
        self.0.digest_bytes()
    }
}

impl AsRef<[u8]> for NarHash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl From<NarHash> for Hash {
    fn from(value: NarHash) -> Self {
        value.0.into()
    }
}

impl From<Sha256> for NarHash {
    fn from(value: Sha256) -> Self {
        NarHash(value)
    }
}

impl TryFrom<Hash> for NarHash {
    type Error = fmt::ParseHashErrorKind;

    fn try_from(value: Hash) -> Result<Self, Self::Error> {
        Ok(NarHash(value.try_into()?))
    }
}

impl sfmt::Debug for NarHash {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        write!(f, "NarHash({self})")
    }
}

impl sfmt::Display for NarHash {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        sfmt::Display::fmt(&fmt::Base16(*self), f)
    }
}

enum InnerContext {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
}

/// A context for multi-step (init/update/finish) digest calculation.
///
/// ```
/// use cantata_utils_hash as hash;
///
/// let one_shot = hash::Algorithm::SHA256.digest("hello, world");
///
/// let mut ctx = hash::Context::new(hash::Algorithm::SHA256);
/// ctx.update("hello");
/// ctx.update(", world");
/// assert_eq!(one_shot, ctx.finish());
/// ```
pub struct Context(Algorithm, InnerContext);

impl Context {
    pub fn new(algorithm: Algorithm) -> Self {
        let inner = match algorithm {
            Algorithm::MD5 => InnerContext::Md5(md5::Context::new()),
            Algorithm::SHA1 => InnerContext::Sha1(sha1::Sha1::new()),
            Algorithm::SHA256 => InnerContext::Sha256(sha2::Sha256::new()),
            Algorithm::SHA512 => InnerContext::Sha512(sha2::Sha512::new()),
        };
        Context(algorithm, inner)
    }

    /// Feed more data into the digest. May be called any number of times
    /// before [`finish`](Self::finish).
    pub fn update<D: AsRef<[u8]>>(&mut self, data: D) {
        let data = data.as_ref();
        match &mut self.1 {
            InnerContext::Md5(ctx) => ctx.consume(data),
            InnerContext::Sha1(ctx) => ctx.update(data),
            InnerContext::Sha256(ctx) => ctx.update(data),
            InnerContext::Sha512(ctx) => ctx.update(data),
        }
    }

    /// Finalize and return the digest. Consumes the context.
    pub fn finish(self) -> Hash {
        match self.1 {
            InnerContext::Md5(ctx) => Hash::new(self.0, ctx.finalize().as_ref()),
            InnerContext::Sha1(ctx) => Hash::new(self.0, ctx.finalize().as_slice()),
            InnerContext::Sha256(ctx) => Hash::new(self.0, ctx.finalize().as_slice()),
            InnerContext::Sha512(ctx) => Hash::new(self.0, ctx.finalize().as_slice()),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.0
    }
}

impl sfmt::Debug for Context {
    fn fmt(&self, f: &mut sfmt::Formatter<'_>) -> sfmt::Result {
        f.debug_tuple("Context").field(&self.0).finish()
    }
}

/// A hashing sink implementing [`AsyncWrite`] that counts bytes.
///
/// [`AsyncWrite`]: tokio::io::AsyncWrite
#[derive(Debug)]
pub struct HashSink(Option<(u64, Context)>);

impl HashSink {
    pub fn new(algorithm: Algorithm) -> HashSink {
        HashSink(Some((0, Context::new(algorithm))))
    }

    /// Finalize and return `(bytes_written, hash)`.
    pub fn finish(self) -> (u64, Hash) {
        let (written, ctx) = self.0.unwrap();
        (written, ctx.finish())
    }
}

impl tokio::io::AsyncWrite for HashSink {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.0.as_mut() {
            None => panic!("write after completion"),
            Some((written, ctx)) => {
                *written += buf.len() as u64;
                ctx.update(buf);
            }
        }
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        std::task::Poll::Ready(Ok(()))
    }
}

/// XOR-fold a digest down to `n` bytes.
pub fn compress_hash(digest: &[u8], n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    for (i, byte) in digest.iter().enumerate() {
        out[i % n] ^= byte;
    }
    out
}
