// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Core store semantics.
//!
//! Pure types and computation for the content-addressed store: store
//! paths and their fingerprints, content addresses, derivations (ATerm
//! and JSON forms), derived paths, realisations, signatures, and the
//! output reference scanner. Everything here is IO-free so it can be
//! tested and composed without a store on disk.

/// Byte strings that may not be valid UTF-8 (builder args, env values,
/// symlink targets).
pub type ByteString = bytes::Bytes;

pub mod content_address;
pub mod derivation;
pub mod derived_path;
pub mod fingerprint;
pub mod realisation;
pub mod references;
pub mod signature;
pub mod store_path;

pub use store_path::{StoreDir, StorePath, StorePathSet};
