// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Realisations of content-addressed derivation outputs.
//!
//! A [`DrvOutput`] identifies an output of a derivation by the
//! derivation's modulo hash rather than its path, so that the mapping
//! survives input rewrites; the [`Realisation`] records which concrete
//! path that output produced, with enough dependent realisations for a
//! downstream consumer to rebuild the mapping.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

use cantata_utils_hash::fmt::{Any, Base16, ParseHashError};
use cantata_utils_hash::Hash;

use crate::derived_path::OutputName;
use crate::signature::Signature;
use crate::store_path::{StorePath, StorePathNameError};

/// `<drv-hash>!<output-name>`, e.g. `sha256:ba78...!out`.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Clone,
    Display,
    SerializeDisplay,
    DeserializeFromStr,
)]
#[display("{}!{}", Base16(*drv_hash), output_name)]
pub struct DrvOutput {
    pub drv_hash: Hash,
    pub output_name: OutputName,
}

#[derive(Debug, PartialEq, Clone, Error)]
pub enum ParseDrvOutputError {
    #[error("hash error {0}")]
    Hash(
        #[from]
        #[source]
        ParseHashError,
    ),
    #[error("output name error {0}")]
    OutputName(
        #[from]
        #[source]
        StorePathNameError,
    ),
    #[error("invalid derivation output id '{0}'")]
    InvalidId(String),
}

impl FromStr for DrvOutput {
    type Err = ParseDrvOutputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (drv_hash, output_name) = s
            .split_once('!')
            .ok_or_else(|| ParseDrvOutputError::InvalidId(s.to_owned()))?;
        Ok(DrvOutput {
            drv_hash: drv_hash.parse::<Any<Hash>>()?.into_inner(),
            output_name: output_name.parse()?,
        })
    }
}

/// The learned mapping from a derivation output to its concrete path.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Realisation {
    pub id: DrvOutput,
    pub out_path: StorePath,
    #[serde(default)]
    pub signatures: BTreeSet<Signature>,
    /// Transitive closure of the realisations this one depends on.
    #[serde(default)]
    pub dependent_realisations: BTreeMap<DrvOutput, StorePath>,
}

impl Realisation {
    /// The fingerprint that realisation signatures sign: the JSON form
    /// with the signature set emptied.
    pub fn fingerprint(&self) -> String {
        let mut unsigned = self.clone();
        unsigned.signatures = BTreeSet::new();
        serde_json::to_string(&unsigned).expect("realisation serializes")
    }
}

pub type DrvOutputs = BTreeMap<DrvOutput, Realisation>;
