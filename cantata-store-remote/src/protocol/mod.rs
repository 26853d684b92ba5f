// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Daemon protocol constants and types.

pub mod opcodes;
pub mod types;
mod version;

pub use opcodes::OpCode;
pub use version::{CURRENT_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, ProtocolVersion};

use cantata_store_core::StoreDir;

/// Magic the client opens the connection with (`nixc`).
pub const WORKER_MAGIC_1: u64 = 0x6e697863;
/// Magic the server answers with (`dxio`).
pub const WORKER_MAGIC_2: u64 = 0x6478696f;

/// Longest single string the protocol accepts.
pub const MAX_STRING_SIZE: u64 = 0x1000000;
/// Longest list the protocol accepts.
pub const MAX_LIST_SIZE: u64 = 0x100000;

/// Stderr-pump frame tags sent between request and reply.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msg {
    Write = 0x64617416,
    Read = 0x64617461,
    Error = 0x63787470,
    Next = 0x6f6c6d67,
    StartActivity = 0x53545254,
    StopActivity = 0x53544f50,
    Result = 0x52534c54,
    Last = 0x616c7473,
}

impl Msg {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0x64617416 => Some(Msg::Write),
            0x64617461 => Some(Msg::Read),
            0x63787470 => Some(Msg::Error),
            0x6f6c6d67 => Some(Msg::Next),
            0x53545254 => Some(Msg::StartActivity),
            0x53544f50 => Some(Msg::StopActivity),
            0x52534c54 => Some(Msg::Result),
            0x616c7473 => Some(Msg::Last),
            _ => None,
        }
    }
}

/// Everything serialization needs to know about a connection: the
/// negotiated version and the store directory paths are rendered
/// against.
#[derive(Debug, Clone)]
pub struct WireCtx {
    pub version: ProtocolVersion,
    pub store_dir: StoreDir,
}

impl WireCtx {
    pub fn new(version: ProtocolVersion, store_dir: StoreDir) -> Self {
        WireCtx { version, store_dir }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_codes_roundtrip() {
        for msg in [
            Msg::Write,
            Msg::Read,
            Msg::Error,
            Msg::Next,
            Msg::StartActivity,
            Msg::StopActivity,
            Msg::Result,
            Msg::Last,
        ] {
            assert_eq!(Msg::from_u64(msg as u64), Some(msg));
        }
        assert_eq!(Msg::from_u64(0), None);
    }
}
