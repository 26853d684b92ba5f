// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use thiserror::Error;

use cantata_store_core::derivation::DerivationError;
use cantata_store_core::store_path::{ParseStorePathError, StorePath};
use cantata_store_remote::ProtocolError;
use cantata_utils_hash::NarHash;

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("path '{0}' is not valid")]
    InvalidPath(String),

    #[error(transparent)]
    BadStorePath(#[from] ParseStorePathError),

    #[error("hash mismatch for '{path}': expected {expected}, got {got}")]
    HashMismatch {
        path: String,
        expected: NarHash,
        got: NarHash,
    },

    #[error("size mismatch for '{path}': expected {expected}, got {got}")]
    SizeMismatch { path: String, expected: u64, got: u64 },

    #[error("build of '{drv_path}' failed: {message}")]
    BuildFailed {
        drv_path: StorePath,
        message: String,
    },

    #[error("no substituter knows '{0}'")]
    NoSubstituters(StorePath),

    #[error("all substituters failed for '{0}'")]
    SubstitutersFailed(StorePath),

    #[error("path '{path}' lacks a valid signature")]
    MissingSignature { path: String },

    #[error("dependency cycle involving '{0}'")]
    Cycle(StorePath),

    #[error("operation interrupted")]
    Interrupted,

    #[error("database error: {0}")]
    Db(#[from] cantata_store_db::Error),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error("archive error: {0}")]
    Nar(#[from] cantata_nar::NarError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl DaemonError {
    pub fn other<S: Into<String>>(message: S) -> Self {
        DaemonError::Other(message.into())
    }
}

impl From<DaemonError> for ProtocolError {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::Protocol(protocol) => protocol,
            other => ProtocolError::custom(other.to_string()),
        }
    }
}
