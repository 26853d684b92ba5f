// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Nix-base32 encoding.
//!
//! The alphabet is `0123456789abcdfghijklmnpqrsvwxyz` (no `e`, `o`, `t`,
//! `u`) and, unlike RFC 4648, bits are packed little-endian starting from
//! the *end* of the byte buffer. This is the encoding used for store path
//! hash parts and derivation output hashes.

pub mod base32;
