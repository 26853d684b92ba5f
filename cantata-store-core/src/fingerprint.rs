// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! The fingerprint that path signatures sign:
//! `1;<store-path>;<nar-hash>;<nar-size>;<comma-separated-references>`.

use cantata_utils_hash::NarHash;
use cantata_utils_hash::fmt::Base32;

use crate::store_path::{StoreDir, StorePath, StorePathSet};

/// Render the signing fingerprint for a path.
///
/// References must be the full, sorted reference set; the NAR hash is
/// rendered `sha256:<base32>`.
pub fn fingerprint_path(
    store_dir: &StoreDir,
    path: &StorePath,
    nar_hash: &NarHash,
    nar_size: u64,
    references: &StorePathSet,
) -> String {
    let mut out = String::with_capacity(256);
    out.push_str("1;");
    out.push_str(&store_dir.print_path(path));
    out.push(';');
    out.push_str(&Base32(*nar_hash).to_string());
    out.push(';');
    out.push_str(&nar_size.to_string());
    out.push(';');
    for (i, reference) in references.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&store_dir.print_path(reference));
    }
    out
}

#[cfg(test)]
mod tests {
    use cantata_utils_hash::fmt::Any;

    use super::*;

    #[test]
    fn fingerprint_with_references() {
        let store_dir = StoreDir::default();
        let path: StorePath = "syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin"
            .parse()
            .unwrap();
        let nar_hash: NarHash = "sha256:1b4sb93wp679q4zx9k1ignby1yna3z7c4c2ri3wphylbc2dwsys0"
            .parse::<Any<NarHash>>()
            .unwrap()
            .into_inner();
        let mut references = StorePathSet::new();
        references.insert("0jqd0rlxzra1rs38rdxl43yh6rxchgc6-curl-7.82.0".parse().unwrap());
        references.insert("5dq2jj6d7k197p6fzqn8l5n0jfmhxmcg-glibc-2.33-59".parse().unwrap());

        let fingerprint = fingerprint_path(&store_dir, &path, &nar_hash, 196040, &references);
        assert_eq!(
            fingerprint,
            "1;/nix/store/syd87l2rxw8cbsxmxl853h0r6pdwhwjr-curl-7.82.0-bin;sha256:1b4sb93wp679q4zx9k1ignby1yna3z7c4c2ri3wphylbc2dwsys0;196040;/nix/store/0jqd0rlxzra1rs38rdxl43yh6rxchgc6-curl-7.82.0,/nix/store/5dq2jj6d7k197p6fzqn8l5n0jfmhxmcg-glibc-2.33-59"
        );
    }

    #[test]
    fn fingerprint_without_references() {
        let store_dir = StoreDir::default();
        let path: StorePath = "26xbg1ndr7hbcncrlf9nhx5is2b25d13-hello-2.12.1".parse().unwrap();
        let nar_hash: NarHash = "sha256:1mkvday29m2qxg1fnbv8xh9s6151bh8a2xzhh0k86j7lqhyfwibh"
            .parse::<Any<NarHash>>()
            .unwrap()
            .into_inner();
        let fingerprint =
            fingerprint_path(&store_dir, &path, &nar_hash, 226560, &StorePathSet::new());
        assert_eq!(
            fingerprint,
            "1;/nix/store/26xbg1ndr7hbcncrlf9nhx5is2b25d13-hello-2.12.1;sha256:1mkvday29m2qxg1fnbv8xh9s6151bh8a2xzhh0k86j7lqhyfwibh;226560;"
        );
    }
}
