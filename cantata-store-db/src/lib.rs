// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! SQLite metadata database of the store.
//!
//! Persists which paths are valid, their NAR hashes and sizes, their
//! reference graph, derivation outputs, realisations of
//! content-addressed outputs, and resolved-derivation successors.
//! Writes go through a single connection under a mutex (single-writer,
//! many-reader via WAL); bulk registration of a closure happens inside
//! one transaction, so a crash leaves either the whole closure valid or
//! none of it.
//!
//! Paths are stored as full absolute path strings, matching the on-disk
//! schema of the wider ecosystem (schema version 10 plus the CA tables
//! plus `Successors`).

mod connection;
mod error;
mod query;
mod schema;
mod types;
mod write;

pub use connection::{OpenMode, StoreDb};
pub use error::{Error, Result};
pub use schema::SCHEMA_VERSION;
pub use types::*;
pub use write::RegisterPathParams;
