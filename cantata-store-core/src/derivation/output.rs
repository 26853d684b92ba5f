// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

use std::fmt;

use crate::content_address::{ContentAddress, ContentAddressMethodAlgorithm};
use crate::derived_path::OutputName;
use crate::store_path::{ParseStorePathError, StoreDir, StorePath, StoreReferences};

/// The store path name of an output: `<drv-name>` for `out`,
/// `<drv-name>-<output>` otherwise.
pub fn output_path_name(drv_name: &str, output_name: &OutputName) -> String {
    if output_name.as_str() == "out" {
        drv_name.to_owned()
    } else {
        format!("{}-{}", drv_name, output_name)
    }
}

/// How one output of a derivation is addressed.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub enum DerivationOutput {
    /// Path fixed before the build from the derivation text.
    InputAddressed(StorePath),
    /// Path fixed by a declared content hash the build must match.
    CAFixed(ContentAddress),
    /// Path learned from the produced content.
    CAFloating(ContentAddressMethodAlgorithm),
    /// Not yet computable; resolves once floating inputs are known.
    Deferred,
}

impl DerivationOutput {
    /// The concrete store path of this output, where one is determined
    /// before the build.
    pub fn path(
        &self,
        store_dir: &StoreDir,
        drv_name: &str,
        output_name: &OutputName,
    ) -> Result<Option<StorePath>, ParseStorePathError> {
        match self {
            DerivationOutput::InputAddressed(path) => Ok(Some(path.clone())),
            DerivationOutput::CAFixed(ca) => {
                let name = output_path_name(drv_name, output_name);
                Ok(Some(store_dir.make_fixed_output_path(
                    &name,
                    ca,
                    &StoreReferences::new(),
                )?))
            }
            DerivationOutput::CAFloating(_) | DerivationOutput::Deferred => Ok(None),
        }
    }
}

impl fmt::Display for DerivationOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivationOutput::InputAddressed(_) => f.write_str("input-addressed"),
            DerivationOutput::CAFixed(_) => f.write_str("fixed"),
            DerivationOutput::CAFloating(_) => f.write_str("floating"),
            DerivationOutput::Deferred => f.write_str("deferred"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_has_plain_name() {
        assert_eq!(output_path_name("hello-2.12", &"out".parse().unwrap()), "hello-2.12");
        assert_eq!(
            output_path_name("hello-2.12", &"dev".parse().unwrap()),
            "hello-2.12-dev"
        );
    }

    #[test]
    fn fixed_output_path_is_computed() {
        let store_dir = StoreDir::default();
        let ca: ContentAddress =
            "fixed:r:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
                .parse()
                .unwrap();
        let out = DerivationOutput::CAFixed(ca);
        let path = out
            .path(&store_dir, "example", &"out".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(path.name().as_ref(), "example");
    }

    #[test]
    fn floating_has_no_path() {
        let store_dir = StoreDir::default();
        let out = DerivationOutput::CAFloating("r:sha256".parse().unwrap());
        assert_eq!(
            out.path(&store_dir, "example", &"out".parse().unwrap()).unwrap(),
            None
        );
    }
}
