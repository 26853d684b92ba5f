// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to open database at '{path}': {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("database not found at {0}")]
    DatabaseNotFound(PathBuf),

    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: i32, found: i32 },

    #[error("cannot register '{path}': reference '{reference}' is not a valid path")]
    DanglingReference { path: String, reference: String },

    #[error("path '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("cannot invalidate '{path}': still referenced by '{referrer}'")]
    PathInUse { path: String, referrer: String },

    #[error("path not found: {0}")]
    PathNotFound(String),
}
