// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Wire serialization: u64 little-endian words; byte strings
//! length-prefixed and zero-padded to 8 bytes; lists length-prefixed.
//!
//! Every call carries a [`WireCtx`] so version-guarded fields and store
//! path rendering have what they need.

mod primitives;
mod store_types;

pub use store_types::{UnkeyedPathInfo, read_basic_derivation, read_opt_path, write_opt_path};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::protocol::WireCtx;

#[allow(async_fn_in_trait)]
pub trait Serialize {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError>;
}

#[allow(async_fn_in_trait)]
pub trait Deserialize: Sized {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError>;
}
