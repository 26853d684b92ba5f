// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use thiserror::Error;

use crate::protocol::ProtocolVersion;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic number: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("protocol version {client} is below the supported minimum {min}")]
    UnsupportedVersion {
        client: ProtocolVersion,
        min: ProtocolVersion,
    },

    #[error("string of {length} bytes exceeds the maximum of {max}")]
    StringTooLong { length: u64, max: u64 },

    #[error("list of {length} entries exceeds the maximum of {max}")]
    ListTooLong { length: u64, max: u64 },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid operation code {0}")]
    InvalidOpCode(u64),

    #[error("invalid stderr message code {0:#x}")]
    InvalidMsgCode(u64),

    #[error("invalid store path: {0}")]
    InvalidStorePath(String),

    #[error("invalid value for field '{field}': {message}")]
    InvalidField { field: &'static str, message: String },

    #[error("operation '{0}' is not supported by this store")]
    Unsupported(&'static str),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("{0}")]
    Custom(String),
}

impl ProtocolError {
    pub fn custom<S: Into<String>>(message: S) -> Self {
        ProtocolError::Custom(message.into())
    }

    pub fn invalid_field<S: Into<String>>(field: &'static str, message: S) -> Self {
        ProtocolError::InvalidField {
            field,
            message: message.into(),
        }
    }
}
