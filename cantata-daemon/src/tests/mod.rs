// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

mod add_to_store;
mod build_tests;
mod gc_tests;
mod substitute;
mod test_store;

pub(crate) use test_store::TestStore;
