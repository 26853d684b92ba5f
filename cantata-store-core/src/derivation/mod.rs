// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Derivations: the build recipes of the store.
//!
//! A [`Derivation`] keeps derivation inputs (`input_drvs`) separate from
//! plain source inputs; a [`BasicDerivation`] is the fully resolved form
//! whose inputs are store paths only, which is what actually gets built
//! and what travels over the wire.

pub mod aterm;
mod output;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cantata_utils_hash::fmt::{Bare, Base16};
use cantata_utils_hash::Sha256;

use crate::content_address::ParseContentAddressError;
use crate::derived_path::OutputName;
use crate::store_path::{
    ParseStorePathError, StoreDir, StorePath, StorePathName, StorePathSet,
};
use crate::ByteString;

pub use output::{DerivationOutput, output_path_name};

/// A build recipe, as parsed from a `.drv` store object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    /// Name of the derivation (the `.drv` path's name without suffix).
    pub name: StorePathName,
    pub outputs: BTreeMap<OutputName, DerivationOutput>,
    /// Non-derivation store path inputs.
    pub input_srcs: StorePathSet,
    /// Derivation inputs and which of their outputs are needed.
    pub input_drvs: BTreeMap<StorePath, BTreeSet<OutputName>>,
    pub platform: ByteString,
    pub builder: ByteString,
    pub args: Vec<ByteString>,
    pub env: BTreeMap<ByteString, ByteString>,
}

/// A derivation whose inputs are store paths only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicDerivation {
    pub name: StorePathName,
    pub outputs: BTreeMap<OutputName, DerivationOutput>,
    pub inputs: StorePathSet,
    pub platform: ByteString,
    pub builder: ByteString,
    pub args: Vec<ByteString>,
    pub env: BTreeMap<ByteString, ByteString>,
}

/// The classification of a derivation, determined by its outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationType {
    InputAddressed,
    Fixed,
    Floating,
    Deferred,
}

#[derive(Debug, Error, PartialEq, Clone)]
pub enum DerivationError {
    #[error("derivation has no outputs")]
    NoOutputs,
    #[error("derivation mixes output addressing kinds")]
    MixedOutputTypes,
    #[error("fixed-output derivations must have a single output named 'out'")]
    FixedOutputNotSingleOut,
    #[error("output '{output}' declares path '{declared}' but '{computed}' was computed")]
    WrongOutputPath {
        output: OutputName,
        declared: StorePath,
        computed: StorePath,
    },
    #[error("output '{output}' of '{drv_path}' is not yet realised")]
    NotYetResolvable {
        drv_path: StorePath,
        output: OutputName,
    },
    #[error(transparent)]
    StorePath(#[from] ParseStorePathError),
    #[error(transparent)]
    ContentAddress(#[from] ParseContentAddressError),
}

impl Derivation {
    /// The derivation's type; all outputs must agree.
    pub fn r#type(&self) -> Result<DerivationType, DerivationError> {
        let mut iter = self.outputs.values();
        let first = iter.next().ok_or(DerivationError::NoOutputs)?;
        let classify = |out: &DerivationOutput| match out {
            DerivationOutput::InputAddressed(_) => DerivationType::InputAddressed,
            DerivationOutput::CAFixed(_) => DerivationType::Fixed,
            DerivationOutput::CAFloating(_) => DerivationType::Floating,
            DerivationOutput::Deferred => DerivationType::Deferred,
        };
        let ty = classify(first);
        for out in iter {
            if classify(out) != ty {
                return Err(DerivationError::MixedOutputTypes);
            }
        }
        if ty == DerivationType::Fixed
            && (self.outputs.len() != 1 || !self.outputs.contains_key(&OutputName::default()))
        {
            return Err(DerivationError::FixedOutputNotSingleOut);
        }
        Ok(ty)
    }

    /// Known output paths, `None` where the path is not yet determined.
    pub fn output_map(
        &self,
        store_dir: &StoreDir,
    ) -> Result<BTreeMap<OutputName, Option<StorePath>>, ParseStorePathError> {
        let mut map = BTreeMap::new();
        for (name, output) in &self.outputs {
            map.insert(name.clone(), output.path(store_dir, &self.name, name)?);
        }
        Ok(map)
    }

    /// A copy with input-addressed output paths masked out, as hashed
    /// and as first instantiated.
    fn masked(&self) -> Derivation {
        let mut masked = self.clone();
        for (name, output) in masked.outputs.iter_mut() {
            if matches!(output, DerivationOutput::InputAddressed(_)) {
                *output = DerivationOutput::Deferred;
                masked
                    .env
                    .insert(ByteString::from(name.as_str().to_owned()), ByteString::new());
            }
        }
        masked
    }

    /// Compute the input-addressed output paths from the modulo hash and
    /// check them against the declared ones.
    pub fn validate_output_paths(
        &self,
        store_dir: &StoreDir,
        modulo: &Sha256,
    ) -> Result<(), DerivationError> {
        self.r#type()?;
        for (name, output) in &self.outputs {
            if let DerivationOutput::InputAddressed(declared) = output {
                let computed = self.compute_output_path(store_dir, modulo, name)?;
                if *declared != computed {
                    return Err(DerivationError::WrongOutputPath {
                        output: name.clone(),
                        declared: declared.clone(),
                        computed,
                    });
                }
            }
        }
        Ok(())
    }

    /// The input-addressed path of one output given the modulo hash.
    pub fn compute_output_path(
        &self,
        store_dir: &StoreDir,
        modulo: &Sha256,
        output_name: &OutputName,
    ) -> Result<StorePath, DerivationError> {
        let path_name = output_path_name(&self.name, output_name);
        Ok(store_dir.make_output_path(
            output_name.as_str(),
            &Bare(Base16(*modulo)).to_string(),
            &path_name,
        )?)
    }

    /// Resolve to a [`BasicDerivation`]: every input derivation output
    /// is replaced by its realised store path (via `lookup`), and
    /// placeholder strings in the environment are rewritten per
    /// `rewrites`.
    pub fn resolve(
        &self,
        mut lookup: impl FnMut(&StorePath, &OutputName) -> Option<StorePath>,
        rewrites: &BTreeMap<String, String>,
    ) -> Result<BasicDerivation, DerivationError> {
        let mut inputs = self.input_srcs.clone();
        for (drv_path, outputs) in &self.input_drvs {
            for output in outputs {
                let realised = lookup(drv_path, output).ok_or_else(|| {
                    DerivationError::NotYetResolvable {
                        drv_path: drv_path.clone(),
                        output: output.clone(),
                    }
                })?;
                inputs.insert(realised);
            }
        }
        let rewrite = |value: &ByteString| -> ByteString {
            if rewrites.is_empty() {
                return value.clone();
            }
            let mut s = String::from_utf8_lossy(value).into_owned();
            for (from, to) in rewrites {
                s = s.replace(from, to);
            }
            ByteString::from(s)
        };
        Ok(BasicDerivation {
            name: self.name.clone(),
            outputs: self.outputs.clone(),
            inputs,
            platform: self.platform.clone(),
            builder: rewrite(&self.builder),
            args: self.args.iter().map(&rewrite).collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), rewrite(v)))
                .collect(),
        })
    }
}

impl BasicDerivation {
    /// Known output paths of a basic derivation.
    pub fn output_paths(
        &self,
        store_dir: &StoreDir,
    ) -> Result<Vec<(OutputName, StorePath)>, DerivationError> {
        let mut result = Vec::new();
        for (name, output) in &self.outputs {
            if let Some(path) = output.path(store_dir, &self.name, name)? {
                result.push((name.clone(), path));
            }
        }
        Ok(result)
    }

    /// Whether this is a fixed-output derivation (single `out` with a
    /// declared content hash).
    pub fn is_fixed_output(&self) -> bool {
        self.outputs.len() == 1
            && matches!(
                self.outputs.get(&OutputName::default()),
                Some(DerivationOutput::CAFixed(_))
            )
    }
}

/// Compute the hash-modulo of a derivation: the digest from which
/// input-addressed output paths and [`crate::realisation::DrvOutput`]
/// ids are derived.
///
/// Fixed-output derivations hash their content address and output path;
/// anything else hashes the masked ATerm text with every input
/// derivation path replaced by the hex modulo hash of that input, which
/// `input_hashes` must supply.
pub fn hash_modulo(
    store_dir: &StoreDir,
    drv: &Derivation,
    input_hashes: &BTreeMap<StorePath, Sha256>,
) -> Result<Sha256, DerivationError> {
    if drv.r#type()? == DerivationType::Fixed {
        let out = OutputName::default();
        let Some(DerivationOutput::CAFixed(ca)) = drv.outputs.get(&out) else {
            return Err(DerivationError::FixedOutputNotSingleOut);
        };
        let out_path = drv
            .outputs
            .get(&out)
            .unwrap()
            .path(store_dir, &drv.name, &out)?
            .expect("fixed outputs have a computed path");
        let text = format!(
            "fixed:out:{}{}:{}:{}",
            ca.method().fixed_prefix(),
            ca.hash().algorithm(),
            Bare(Base16(ca.hash())),
            store_dir.print_path(&out_path),
        );
        return Ok(Sha256::digest(text));
    }

    let mut replacements = BTreeMap::new();
    for drv_path in drv.input_drvs.keys() {
        let hash = input_hashes
            .get(drv_path)
            .ok_or_else(|| DerivationError::NotYetResolvable {
                drv_path: drv_path.clone(),
                output: OutputName::default(),
            })?;
        replacements.insert(drv_path.clone(), Bare(Base16(*hash)).to_string());
    }
    let masked = drv.masked();
    let text = aterm::unparse_with(store_dir, &masked, Some(&replacements));
    Ok(Sha256::digest(text))
}

/// JSON data-transfer form of a derivation; round-trips with
/// [`Derivation::to_json`] / [`Derivation::from_json`].
#[derive(Debug, Serialize, Deserialize)]
struct DerivationJson {
    name: String,
    outputs: BTreeMap<String, DerivationOutputJson>,
    #[serde(rename = "inputSrcs")]
    input_srcs: Vec<String>,
    #[serde(rename = "inputDrvs")]
    input_drvs: BTreeMap<String, BTreeSet<String>>,
    system: String,
    builder: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct DerivationOutputJson {
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(rename = "hashAlgo", skip_serializing_if = "Option::is_none")]
    hash_algo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

#[derive(Debug, Error)]
pub enum DerivationJsonError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("derivation field is not valid UTF-8")]
    NotUtf8,
    #[error("invalid field: {0}")]
    Invalid(String),
    #[error(transparent)]
    Derivation(#[from] DerivationError),
}

impl Derivation {
    pub fn to_json(&self, store_dir: &StoreDir) -> Result<String, DerivationJsonError> {
        let utf8 = |b: &ByteString| -> Result<String, DerivationJsonError> {
            std::str::from_utf8(b)
                .map(str::to_owned)
                .map_err(|_| DerivationJsonError::NotUtf8)
        };
        let mut outputs = BTreeMap::new();
        for (name, output) in &self.outputs {
            let json = match output {
                DerivationOutput::InputAddressed(path) => DerivationOutputJson {
                    path: Some(store_dir.print_path(path)),
                    ..Default::default()
                },
                DerivationOutput::CAFixed(ca) => DerivationOutputJson {
                    path: Some(
                        store_dir.print_path(
                            &output
                                .path(store_dir, &self.name, name)
                                .map_err(DerivationError::from)?
                                .expect("fixed outputs have a path"),
                        ),
                    ),
                    hash_algo: Some(ca.method_algorithm().to_string()),
                    hash: Some(Bare(Base16(ca.hash())).to_string()),
                },
                DerivationOutput::CAFloating(ma) => DerivationOutputJson {
                    hash_algo: Some(ma.to_string()),
                    ..Default::default()
                },
                DerivationOutput::Deferred => DerivationOutputJson::default(),
            };
            outputs.insert(name.to_string(), json);
        }
        let json = DerivationJson {
            name: self.name.as_ref().to_owned(),
            outputs,
            input_srcs: self
                .input_srcs
                .iter()
                .map(|p| store_dir.print_path(p))
                .collect(),
            input_drvs: self
                .input_drvs
                .iter()
                .map(|(drv, outs)| {
                    (
                        store_dir.print_path(drv),
                        outs.iter().map(|o| o.to_string()).collect(),
                    )
                })
                .collect(),
            system: utf8(&self.platform)?,
            builder: utf8(&self.builder)?,
            args: self.args.iter().map(&utf8).collect::<Result<_, _>>()?,
            env: self
                .env
                .iter()
                .map(|(k, v)| Ok((utf8(k)?, utf8(v)?)))
                .collect::<Result<_, DerivationJsonError>>()?,
        };
        Ok(serde_json::to_string(&json)?)
    }

    pub fn from_json(store_dir: &StoreDir, input: &str) -> Result<Derivation, DerivationJsonError> {
        let json: DerivationJson = serde_json::from_str(input)?;
        let invalid = |what: &str| DerivationJsonError::Invalid(what.to_owned());
        let mut outputs = BTreeMap::new();
        for (name, out) in json.outputs {
            let name: OutputName = name.parse().map_err(|_| invalid("output name"))?;
            let output = match (out.path, out.hash_algo, out.hash) {
                (Some(path), None, None) => DerivationOutput::InputAddressed(
                    store_dir.parse_path(&path).map_err(DerivationError::from)?,
                ),
                (Some(_), Some(algo), Some(hash)) => {
                    let ma: crate::content_address::ContentAddressMethodAlgorithm = algo
                        .parse()
                        .map_err(DerivationError::from)?;
                    let hash = cantata_utils_hash::fmt::parse_bare::<cantata_utils_hash::Hash>(
                        ma.algorithm,
                        &hash,
                    )
                    .map_err(|_| invalid("output hash"))?;
                    DerivationOutput::CAFixed(
                        crate::content_address::ContentAddress::from_hash(ma.method, hash)
                            .map_err(DerivationError::from)?,
                    )
                }
                (None, Some(algo), None) => DerivationOutput::CAFloating(
                    algo.parse().map_err(DerivationError::from)?,
                ),
                (None, None, None) => DerivationOutput::Deferred,
                _ => return Err(invalid("output")),
            };
            outputs.insert(name, output);
        }
        let parse_path = |s: &String| {
            store_dir
                .parse_path(s)
                .map_err(|e| DerivationJsonError::Derivation(e.into()))
        };
        Ok(Derivation {
            name: json.name.parse().map_err(|_| invalid("name"))?,
            outputs,
            input_srcs: json
                .input_srcs
                .iter()
                .map(parse_path)
                .collect::<Result<_, _>>()?,
            input_drvs: json
                .input_drvs
                .iter()
                .map(|(drv, outs)| {
                    Ok((
                        parse_path(drv)?,
                        outs.iter()
                            .map(|o| o.parse().map_err(|_| invalid("output name")))
                            .collect::<Result<_, DerivationJsonError>>()?,
                    ))
                })
                .collect::<Result<_, DerivationJsonError>>()?,
            platform: ByteString::from(json.system),
            builder: ByteString::from(json.builder),
            args: json.args.into_iter().map(ByteString::from).collect(),
            env: json
                .env
                .into_iter()
                .map(|(k, v)| (ByteString::from(k), ByteString::from(v)))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    pub(crate) fn simple_ia_drv(store_dir: &StoreDir) -> Derivation {
        let out_path: StorePath = "33l4p0pn0mybmqzaxfkpppyh7vx1c74p-hello-2.12.1"
            .parse()
            .unwrap();
        let mut outputs = BTreeMap::new();
        outputs.insert(
            OutputName::default(),
            DerivationOutput::InputAddressed(out_path.clone()),
        );
        let mut env = BTreeMap::new();
        env.insert(
            ByteString::from_static(b"out"),
            ByteString::from(store_dir.print_path(&out_path)),
        );
        env.insert(
            ByteString::from_static(b"system"),
            ByteString::from_static(b"x86_64-linux"),
        );
        Derivation {
            name: "hello-2.12.1".parse().unwrap(),
            outputs,
            input_srcs: StorePathSet::new(),
            input_drvs: BTreeMap::new(),
            platform: ByteString::from_static(b"x86_64-linux"),
            builder: ByteString::from_static(b"/bin/sh"),
            args: vec![
                ByteString::from_static(b"-c"),
                ByteString::from_static(b"echo hello > $out"),
            ],
            env,
        }
    }

    #[test]
    fn type_classification() {
        let store_dir = StoreDir::default();
        let drv = simple_ia_drv(&store_dir);
        assert_eq!(drv.r#type().unwrap(), DerivationType::InputAddressed);
    }

    #[test]
    fn mixed_types_rejected() {
        let store_dir = StoreDir::default();
        let mut drv = simple_ia_drv(&store_dir);
        drv.outputs.insert(
            "dev".parse().unwrap(),
            DerivationOutput::CAFloating("r:sha256".parse().unwrap()),
        );
        assert_eq!(drv.r#type().unwrap_err(), DerivationError::MixedOutputTypes);
    }

    #[test]
    fn fixed_requires_single_out() {
        let store_dir = StoreDir::default();
        let mut drv = simple_ia_drv(&store_dir);
        drv.outputs.clear();
        drv.outputs.insert(
            "dev".parse().unwrap(),
            DerivationOutput::CAFixed(
                "fixed:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
                    .parse()
                    .unwrap(),
            ),
        );
        assert_eq!(
            drv.r#type().unwrap_err(),
            DerivationError::FixedOutputNotSingleOut
        );
    }

    #[test]
    fn output_path_computation_roundtrips() {
        // Build the derivation with a masked output, compute the path,
        // fill it in, and check validation accepts the result.
        let store_dir = StoreDir::default();
        let mut drv = simple_ia_drv(&store_dir);
        drv.outputs
            .insert(OutputName::default(), DerivationOutput::Deferred);
        drv.env
            .insert(ByteString::from_static(b"out"), ByteString::new());

        let modulo = hash_modulo(&store_dir, &drv, &BTreeMap::new()).unwrap();
        let out = OutputName::default();
        let path = drv.compute_output_path(&store_dir, &modulo, &out).unwrap();
        drv.outputs
            .insert(out.clone(), DerivationOutput::InputAddressed(path.clone()));
        drv.env.insert(
            ByteString::from_static(b"out"),
            ByteString::from(store_dir.print_path(&path)),
        );
        drv.validate_output_paths(&store_dir, &modulo).unwrap();

        // A wrong declared path is rejected.
        drv.outputs.insert(
            out.clone(),
            DerivationOutput::InputAddressed(
                "00000000000000000000000000000000-hello-2.12.1".parse().unwrap(),
            ),
        );
        assert!(matches!(
            drv.validate_output_paths(&store_dir, &modulo),
            Err(DerivationError::WrongOutputPath { .. })
        ));
    }

    #[test]
    fn resolve_requires_realised_inputs() {
        let store_dir = StoreDir::default();
        let mut drv = simple_ia_drv(&store_dir);
        let input_drv: StorePath = "6z1jfnqqgyqr221zgbpm30v91yfj3r45-bash-5.1.drv"
            .parse()
            .unwrap();
        let mut wanted = BTreeSet::new();
        wanted.insert(OutputName::default());
        drv.input_drvs.insert(input_drv.clone(), wanted);

        let err = drv.resolve(|_, _| None, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, DerivationError::NotYetResolvable { .. }));

        let realised: StorePath = "4xw8n979xpivdc46a9ndcvyhwgif00hz-bash-5.1".parse().unwrap();
        let basic = drv
            .resolve(|_, _| Some(realised.clone()), &BTreeMap::new())
            .unwrap();
        assert!(basic.inputs.contains(&realised));
    }

    #[test]
    fn json_roundtrip() {
        let store_dir = StoreDir::default();
        let drv = simple_ia_drv(&store_dir);
        let json = drv.to_json(&store_dir).unwrap();
        let parsed = Derivation::from_json(&store_dir, &json).unwrap();
        assert_eq!(parsed, drv);
    }

    #[test]
    fn fixed_output_hash_modulo_is_stable() {
        let store_dir = StoreDir::default();
        let mut drv = simple_ia_drv(&store_dir);
        drv.outputs.clear();
        drv.outputs.insert(
            OutputName::default(),
            DerivationOutput::CAFixed(
                "fixed:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
                    .parse()
                    .unwrap(),
            ),
        );
        let h1 = hash_modulo(&store_dir, &drv, &BTreeMap::new()).unwrap();
        // Changing the environment does not change a fixed-output
        // derivation's modulo hash.
        drv.env.insert(
            ByteString::from_static(b"extra"),
            ByteString::from_static(b"1"),
        );
        let h2 = hash_modulo(&store_dir, &drv, &BTreeMap::new()).unwrap();
        assert_eq!(h1, h2);
    }
}
