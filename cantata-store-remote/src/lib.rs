// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The framed, length-prefixed wire protocols of the store.
//!
//! Three related formats share the primitives in [`serialization`]:
//!
//! - the **daemon protocol** spoken between clients and the daemon over
//!   a Unix socket ([`protocol`], [`client`], [`server`]);
//! - the thinner **serve protocol** used for remote builders
//!   ([`serve`]);
//! - the **export framing** used to ship closures as a byte stream
//!   ([`export`]).
//!
//! [`store_url`] parses store URLs (`daemon://`, `unix://...`, ...) and
//! holds the explicit registry of recognised backends.

pub mod client;
pub mod error;
pub mod export;
pub mod framed;
pub mod protocol;
pub mod serialization;
pub mod serve;
pub mod server;
pub mod store_url;

pub use error::ProtocolError;
pub use protocol::{ProtocolVersion, WireCtx};
