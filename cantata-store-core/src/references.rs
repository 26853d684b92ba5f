// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Reference scanning for built outputs.
//!
//! After a build (or while ingesting a NAR), the store needs to know
//! which candidate paths an object refers to. [`RefScanSink`] is a
//! push-based scanner: feed it arbitrary byte chunks and it finds every
//! candidate whose 32-character hash part occurs anywhere in the stream.
//!
//! The search slides a window of [`StorePathHash::encoded_len`] bytes
//! across the input, validating window characters right to left against
//! the nix-base32 alphabet. An invalid character at offset `j` lets the
//! scan skip ahead `j + 1` positions, so on binary data the scan is
//! effectively O(n / 32) regardless of the number of candidates; full
//! windows are matched through a `HashSet`. A tail buffer carries up to
//! one window of bytes across chunk boundaries, so matches spanning any
//! number of chunks are found and the scanner is restartable.

use std::collections::{BTreeSet, HashSet};

use crate::store_path::{StorePath, StorePathHash, StorePathSet};

const HASH_LEN: usize = StorePathHash::encoded_len();

const NIX_BASE32_VALID: [bool; 256] = {
    let mut table = [false; 256];
    let alphabet = cantata_utils_base_encoding::base32::ALPHABET;
    let mut i = 0;
    while i < alphabet.len() {
        table[alphabet[i] as usize] = true;
        i += 1;
    }
    table
};

/// A streaming scanner for store path hash parts.
pub struct RefScanSink {
    /// Hash parts still being looked for; removed on first match.
    pending: HashSet<[u8; HASH_LEN]>,
    /// Hash parts seen so far.
    seen: HashSet<[u8; HASH_LEN]>,
    /// Maps matched hash parts back to their paths.
    back_map: Vec<([u8; HASH_LEN], StorePath)>,
    /// Trailing bytes of the previous chunk.
    tail: Vec<u8>,
}

impl RefScanSink {
    /// Scanner for `candidates`, plus `self_path` for self-reference
    /// detection.
    pub fn new(candidates: &StorePathSet, self_path: Option<&StorePath>) -> Self {
        let mut pending = HashSet::with_capacity(candidates.len() + 1);
        let mut back_map = Vec::with_capacity(candidates.len() + 1);
        for path in candidates.iter().chain(self_path) {
            let key = hash_key(path);
            if pending.insert(key) {
                back_map.push((key, path.clone()));
            }
        }
        RefScanSink {
            pending,
            seen: HashSet::new(),
            back_map,
            tail: Vec::with_capacity(HASH_LEN),
        }
    }

    /// Feed the next chunk of bytes.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pending.is_empty() {
            return;
        }

        let tail_len = data.len().min(HASH_LEN);

        // Search the boundary region first: old tail + head of new data.
        if !self.tail.is_empty() {
            let mut overlap = self.tail.clone();
            overlap.extend_from_slice(&data[..tail_len]);
            search(&overlap, &mut self.pending, &mut self.seen);
        }

        search(data, &mut self.pending, &mut self.seen);

        // Keep at most HASH_LEN trailing bytes for the next boundary.
        let keep_old = HASH_LEN - tail_len;
        if keep_old < self.tail.len() {
            self.tail.drain(..self.tail.len() - keep_old);
        }
        self.tail.extend_from_slice(&data[data.len() - tail_len..]);
    }

    /// The candidates whose hash parts were found.
    pub fn found_paths(&self) -> StorePathSet {
        let mut result = BTreeSet::new();
        for (key, path) in &self.back_map {
            if self.seen.contains(key) {
                result.insert(path.clone());
            }
        }
        result
    }
}

fn hash_key(path: &StorePath) -> [u8; HASH_LEN] {
    let rendered = path.hash().to_string();
    let mut key = [0u8; HASH_LEN];
    key.copy_from_slice(rendered.as_bytes());
    key
}

fn search(data: &[u8], pending: &mut HashSet<[u8; HASH_LEN]>, seen: &mut HashSet<[u8; HASH_LEN]>) {
    if data.len() < HASH_LEN {
        return;
    }
    let mut i = 0;
    'outer: while i + HASH_LEN <= data.len() {
        let mut j = HASH_LEN;
        while j > 0 {
            j -= 1;
            if !NIX_BASE32_VALID[data[i + j] as usize] {
                i += j + 1;
                continue 'outer;
            }
        }
        let window: [u8; HASH_LEN] = data[i..i + HASH_LEN].try_into().unwrap();
        if pending.remove(&window) {
            seen.insert(window);
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(base: &str) -> StorePath {
        base.parse().unwrap()
    }

    #[test]
    fn finds_input_reference() {
        let input = path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-input");
        let mut candidates = StorePathSet::new();
        candidates.insert(input.clone());
        let mut sink = RefScanSink::new(&candidates, None);
        sink.feed(
            format!("some content /nix/store/{}-input more", input.hash()).as_bytes(),
        );
        assert!(sink.found_paths().contains(&input));
    }

    #[test]
    fn finds_self_reference() {
        let this = path("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-self");
        let mut sink = RefScanSink::new(&StorePathSet::new(), Some(&this));
        sink.feed(format!("#!/bin/sh\nexec /nix/store/{}-self/bin/x", this.hash()).as_bytes());
        assert!(sink.found_paths().contains(&this));
    }

    #[test]
    fn unrelated_candidates_not_reported() {
        let present = path("cccccccccccccccccccccccccccccccc-yes");
        let absent = path("dddddddddddddddddddddddddddddddd-no");
        let mut candidates = StorePathSet::new();
        candidates.insert(present.clone());
        candidates.insert(absent.clone());
        let mut sink = RefScanSink::new(&candidates, None);
        sink.feed(present.hash().to_string().as_bytes());
        let found = sink.found_paths();
        assert!(found.contains(&present));
        assert!(!found.contains(&absent));
    }

    #[test]
    fn binary_noise_is_skipped() {
        let input = path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-input");
        let mut candidates = StorePathSet::new();
        candidates.insert(input.clone());
        let mut sink = RefScanSink::new(&candidates, None);
        let mut data: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        data.extend_from_slice(input.hash().to_string().as_bytes());
        data.extend((0u8..=255).cycle().take(4096));
        sink.feed(&data);
        assert!(sink.found_paths().contains(&input));
    }

    /// Feed the data at every chunk size so a hash spanning 2..=32
    /// chunks is still found.
    #[test]
    fn matches_across_chunk_boundaries() {
        let input = path("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-test");
        let content = format!("prefix|{}|suffix", input.hash());
        let bytes = content.as_bytes();
        for chunk_size in 1..=bytes.len() {
            let mut candidates = StorePathSet::new();
            candidates.insert(input.clone());
            let mut sink = RefScanSink::new(&candidates, None);
            for chunk in bytes.chunks(chunk_size) {
                sink.feed(chunk);
            }
            assert!(
                sink.found_paths().contains(&input),
                "missed match with chunk_size={chunk_size}"
            );
        }
    }
}
