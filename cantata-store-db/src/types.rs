// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Row types for store metadata.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A row from `ValidPaths`, together with its references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfoRow {
    /// Database row id.
    pub id: i64,
    /// Full store path.
    pub path: String,
    /// NAR hash, rendered `sha256:<base16>`.
    pub hash: String,
    pub registration_time: SystemTime,
    /// Full path of the deriver, if recorded.
    pub deriver: Option<String>,
    pub nar_size: Option<u64>,
    /// Built locally; trusted unconditionally.
    pub ultimate: bool,
    /// Space-separated signature strings.
    pub sigs: Option<String>,
    /// Content address string, if content-addressed.
    pub ca: Option<String>,
    /// Full paths this path references.
    pub references: BTreeSet<String>,
}

impl PathInfoRow {
    pub fn signatures(&self) -> Vec<&str> {
        self.sigs
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }
}

/// A row from `DerivationOutputs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationOutputRow {
    pub drv_id: i64,
    pub output_name: String,
    pub path: String,
}

/// A row from `Realisations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealisationRow {
    pub id: i64,
    /// The `DrvOutput` id string, `sha256:<hex>!<output>`.
    pub drv_output: String,
    pub output_name: String,
    pub output_path: String,
    pub signatures: Option<String>,
}

pub(crate) fn unix_to_system_time(timestamp: i64) -> SystemTime {
    if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs((-timestamp) as u64)
    }
}

pub(crate) fn system_time_to_unix(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_time_roundtrip() {
        let now = SystemTime::now();
        let unix = system_time_to_unix(now);
        let back = unix_to_system_time(unix);
        let diff = now.duration_since(back).unwrap_or_default();
        assert!(diff.as_secs() <= 1);
    }

    #[test]
    fn signatures_split() {
        let info = PathInfoRow {
            id: 1,
            path: "/nix/store/test".into(),
            hash: "sha256:abc".into(),
            registration_time: UNIX_EPOCH,
            deriver: None,
            nar_size: None,
            ultimate: false,
            sigs: Some("cache.example.com-1:abc other-1:def".into()),
            ca: None,
            references: BTreeSet::new(),
        };
        assert_eq!(info.signatures(), vec!["cache.example.com-1:abc", "other-1:def"]);
    }
}
