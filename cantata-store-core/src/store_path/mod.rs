// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Store paths and the store directory.
//!
//! A [`StorePath`] is the pair of a 160-bit truncated digest and a name;
//! the [`StoreDir`] turns it into an absolute path and computes the
//! digest from a path fingerprint.

mod path;
mod store_dir;

use std::collections::BTreeSet;

pub use path::{
    ParseStorePathError, StorePath, StorePathHash, StorePathName, StorePathNameError,
    StorePathError,
};
pub use store_dir::{StoreDir, StoreReferences};

pub type StorePathSet = BTreeSet<StorePath>;
