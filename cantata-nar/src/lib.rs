// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! NAR (canonical archive) format handling.
//!
//! A NAR is the deterministic serialization of a rooted file tree: every
//! token is a u64 little-endian length followed by that many bytes,
//! zero-padded to 8 bytes. Directory entries are emitted in
//! byte-lexicographic order, regular files carry only an executable bit,
//! and symlink targets are stored as raw bytes, so equal trees always
//! serialize to equal bytes. The same bytes are used for hashing,
//! transport and copying.
//!
//! Everything streams: [`dump_path`] walks a tree into any
//! [`AsyncWrite`], [`restore_path`] rebuilds a tree from any
//! [`AsyncRead`] with canonical permissions and timestamps, and
//! [`NarByteStream`] yields the serialization as [`bytes::Bytes`] chunks
//! for hashing and reference scanning.
//!
//! [`AsyncWrite`]: tokio::io::AsyncWrite
//! [`AsyncRead`]: tokio::io::AsyncRead

mod byte_stream;
mod dump;
mod restore;
pub(crate) mod wire;

pub use byte_stream::NarByteStream;
pub use dump::dump_path;
pub use restore::restore_path;

use thiserror::Error;

/// Magic string opening every NAR.
pub const NAR_VERSION_MAGIC: &[u8] = b"nix-archive-1";

/// Longest allowed directory entry name.
pub(crate) const MAX_NAME_LEN: usize = 255;
/// Longest allowed symlink target.
pub(crate) const MAX_TARGET_LEN: usize = 4095;

#[derive(Debug, Error)]
pub enum NarError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("input is not a NAR (bad version magic)")]
    BadMagic,
    #[error("expected token {expected:?}, got {got:?}")]
    UnexpectedToken { expected: String, got: String },
    #[error("unknown node type {0:?}")]
    UnknownNodeType(String),
    #[error("token of {0} bytes exceeds the allowed size")]
    TokenTooLong(u64),
    #[error("token is not zero-padded to 8 bytes")]
    BadPadding,
    #[error("invalid entry name {0:?}")]
    InvalidEntryName(String),
    #[error("directory entry {0:?} is not sorted after its predecessor")]
    UnsortedEntry(String),
    #[error("duplicate directory entry {0:?}")]
    DuplicateEntry(String),
    #[error("unsupported file type at {0}")]
    UnsupportedFileType(std::path::PathBuf),
}
