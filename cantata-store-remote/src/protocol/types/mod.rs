// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Request and reply types of the daemon protocol.

mod build;
mod gc;
mod missing;
mod options;

pub use build::{BuildMode, BuildResult, BuildStatus};
pub use gc::{GcAction, GcOptions, GcResult};
pub use missing::Missing;
pub use options::ClientOptions;
