// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Serialization of store types: paths, path infos, derivations,
//! derived paths, realisations.
//!
//! Store paths travel as full absolute path strings; an optional store
//! path is the empty string when absent.

use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncWrite};

use cantata_store_core::derivation::{BasicDerivation, DerivationOutput};
use cantata_store_core::derived_path::{DerivedPath, OutputName};
use cantata_store_core::realisation::{DrvOutput, Realisation};
use cantata_store_core::store_path::{StorePath, StorePathSet};
use cantata_store_core::ByteString;
use cantata_utils_hash::fmt::{Any, Bare, Base16};
use cantata_utils_hash::NarHash;

use crate::error::ProtocolError;
use crate::protocol::WireCtx;
use crate::serialization::{Deserialize, Serialize};

impl Serialize for StorePath {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        ctx.store_dir.print_path(self).serialize(writer, ctx).await
    }
}

impl Deserialize for StorePath {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let s = String::deserialize(reader, ctx).await?;
        ctx.store_dir
            .parse_path(&s)
            .map_err(|e| ProtocolError::InvalidStorePath(e.to_string()))
    }
}

/// An optional store path, the empty string when absent.
pub async fn write_opt_path<W: AsyncWrite + Unpin + Send>(
    writer: &mut W,
    ctx: &WireCtx,
    path: Option<&StorePath>,
) -> Result<(), ProtocolError> {
    match path {
        Some(path) => path.serialize(writer, ctx).await,
        None => "".serialize(writer, ctx).await,
    }
}

pub async fn read_opt_path<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    ctx: &WireCtx,
) -> Result<Option<StorePath>, ProtocolError> {
    let s = String::deserialize(reader, ctx).await?;
    if s.is_empty() {
        return Ok(None);
    }
    ctx.store_dir
        .parse_path(&s)
        .map(Some)
        .map_err(|e| ProtocolError::InvalidStorePath(e.to_string()))
}

impl Serialize for NarHash {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        Bare(Base16(*self)).to_string().serialize(writer, ctx).await
    }
}

impl Deserialize for NarHash {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let s = String::deserialize(reader, ctx).await?;
        s.parse::<Any<NarHash>>()
            .map(Any::into_inner)
            .map_err(|e| ProtocolError::invalid_field("narHash", e.to_string()))
    }
}

impl Serialize for OutputName {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        self.as_str().serialize(writer, ctx).await
    }
}

impl Deserialize for OutputName {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let s = String::deserialize(reader, ctx).await?;
        s.parse()
            .map_err(|e: cantata_store_core::store_path::StorePathNameError| {
                ProtocolError::invalid_field("outputName", e.to_string())
            })
    }
}

impl Serialize for DerivedPath {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        let rendered = match self {
            DerivedPath::Opaque(path) => ctx.store_dir.print_path(path),
            DerivedPath::Built { drv_path, outputs } => {
                format!("{}!{}", ctx.store_dir.print_path(drv_path), outputs)
            }
        };
        rendered.serialize(writer, ctx).await
    }
}

impl Deserialize for DerivedPath {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let s = String::deserialize(reader, ctx).await?;
        let bad = |e: String| ProtocolError::invalid_field("derivedPath", e);
        match s.split_once('!') {
            None => Ok(DerivedPath::Opaque(
                ctx.store_dir.parse_path(&s).map_err(|e| bad(e.to_string()))?,
            )),
            Some((path, outputs)) => Ok(DerivedPath::Built {
                drv_path: ctx
                    .store_dir
                    .parse_path(path)
                    .map_err(|e| bad(e.to_string()))?,
                outputs: outputs.parse().map_err(|e| {
                    bad(format!("bad output spec: {e:?}"))
                })?,
            }),
        }
    }
}

impl Serialize for DrvOutput {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        self.to_string().serialize(writer, ctx).await
    }
}

impl Deserialize for DrvOutput {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let s = String::deserialize(reader, ctx).await?;
        s.parse()
            .map_err(|e: cantata_store_core::realisation::ParseDrvOutputError| {
                ProtocolError::invalid_field("drvOutput", e.to_string())
            })
    }
}

// Realisations travel as their JSON rendering.
impl Serialize for Realisation {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        let json = serde_json::to_string(self)
            .map_err(|e| ProtocolError::invalid_field("realisation", e.to_string()))?;
        json.serialize(writer, ctx).await
    }
}

impl Deserialize for Realisation {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let json = String::deserialize(reader, ctx).await?;
        serde_json::from_str(&json)
            .map_err(|e| ProtocolError::invalid_field("realisation", e.to_string()))
    }
}

/// Path metadata as sent in a `QueryPathInfo` reply (without the path
/// itself) and inside `AddToStoreNar`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnkeyedPathInfo {
    pub deriver: Option<StorePath>,
    pub nar_hash: NarHash,
    pub references: StorePathSet,
    pub registration_time: u64,
    pub nar_size: u64,
    pub ultimate: bool,
    pub sigs: Vec<String>,
    pub ca: Option<String>,
}

impl Serialize for UnkeyedPathInfo {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        write_opt_path(writer, ctx, self.deriver.as_ref()).await?;
        self.nar_hash.serialize(writer, ctx).await?;
        self.references.serialize(writer, ctx).await?;
        self.registration_time.serialize(writer, ctx).await?;
        self.nar_size.serialize(writer, ctx).await?;
        self.ultimate.serialize(writer, ctx).await?;
        self.sigs.serialize(writer, ctx).await?;
        match &self.ca {
            Some(ca) => ca.serialize(writer, ctx).await?,
            None => "".serialize(writer, ctx).await?,
        }
        Ok(())
    }
}

impl Deserialize for UnkeyedPathInfo {
    async fn deserialize<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
        ctx: &WireCtx,
    ) -> Result<Self, ProtocolError> {
        let deriver = read_opt_path(reader, ctx).await?;
        let nar_hash = NarHash::deserialize(reader, ctx).await?;
        let references = StorePathSet::deserialize(reader, ctx).await?;
        let registration_time = u64::deserialize(reader, ctx).await?;
        let nar_size = u64::deserialize(reader, ctx).await?;
        let ultimate = bool::deserialize(reader, ctx).await?;
        let sigs = Vec::<String>::deserialize(reader, ctx).await?;
        let ca = String::deserialize(reader, ctx).await?;
        Ok(UnkeyedPathInfo {
            deriver,
            nar_hash,
            references,
            registration_time,
            nar_size,
            ultimate,
            sigs,
            ca: if ca.is_empty() { None } else { Some(ca) },
        })
    }
}

impl Serialize for BasicDerivation {
    async fn serialize<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: &mut W,
        ctx: &WireCtx,
    ) -> Result<(), ProtocolError> {
        (self.outputs.len() as u64).serialize(writer, ctx).await?;
        for (name, output) in &self.outputs {
            name.serialize(writer, ctx).await?;
            let (path, algo, hash) = encode_output_fields(ctx, &self.name, name, output)?;
            path.serialize(writer, ctx).await?;
            algo.serialize(writer, ctx).await?;
            hash.serialize(writer, ctx).await?;
        }
        self.inputs.serialize(writer, ctx).await?;
        self.platform.as_ref().serialize(writer, ctx).await?;
        self.builder.as_ref().serialize(writer, ctx).await?;
        (self.args.len() as u64).serialize(writer, ctx).await?;
        for arg in &self.args {
            arg.as_ref().serialize(writer, ctx).await?;
        }
        (self.env.len() as u64).serialize(writer, ctx).await?;
        for (key, value) in &self.env {
            key.as_ref().serialize(writer, ctx).await?;
            value.as_ref().serialize(writer, ctx).await?;
        }
        Ok(())
    }
}

/// Deserialize the derivation body of a `BuildDerivation` request; the
/// name comes from the preceding derivation path.
pub async fn read_basic_derivation<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    ctx: &WireCtx,
    drv_path: &StorePath,
) -> Result<BasicDerivation, ProtocolError> {
    let n_outputs = u64::deserialize(reader, ctx).await?;
    let mut outputs = BTreeMap::new();
    for _ in 0..n_outputs {
        let name = OutputName::deserialize(reader, ctx).await?;
        let path = String::deserialize(reader, ctx).await?;
        let algo = String::deserialize(reader, ctx).await?;
        let hash = String::deserialize(reader, ctx).await?;
        outputs.insert(name, decode_output_fields(ctx, &path, &algo, &hash)?);
    }
    let inputs = StorePathSet::deserialize(reader, ctx).await?;
    let platform = Vec::<u8>::deserialize(reader, ctx).await?;
    let builder = Vec::<u8>::deserialize(reader, ctx).await?;
    let n_args = u64::deserialize(reader, ctx).await?;
    let mut args = Vec::with_capacity(n_args.min(4096) as usize);
    for _ in 0..n_args {
        args.push(ByteString::from(Vec::<u8>::deserialize(reader, ctx).await?));
    }
    let n_env = u64::deserialize(reader, ctx).await?;
    let mut env = BTreeMap::new();
    for _ in 0..n_env {
        let key = ByteString::from(Vec::<u8>::deserialize(reader, ctx).await?);
        let value = ByteString::from(Vec::<u8>::deserialize(reader, ctx).await?);
        env.insert(key, value);
    }
    Ok(BasicDerivation {
        name: drv_path
            .derivation_name()
            .parse()
            .map_err(|_| ProtocolError::invalid_field("drvPath", "bad derivation name"))?,
        outputs,
        inputs,
        platform: ByteString::from(platform),
        builder: ByteString::from(builder),
        args,
        env,
    })
}

fn encode_output_fields(
    ctx: &WireCtx,
    drv_name: &str,
    output_name: &OutputName,
    output: &DerivationOutput,
) -> Result<(String, String, String), ProtocolError> {
    Ok(match output {
        DerivationOutput::InputAddressed(path) => {
            (ctx.store_dir.print_path(path), String::new(), String::new())
        }
        DerivationOutput::CAFixed(ca) => {
            let path = output
                .path(&ctx.store_dir, drv_name, output_name)
                .map_err(|e| ProtocolError::invalid_field("output", e.to_string()))?
                .expect("fixed outputs have a path");
            (
                ctx.store_dir.print_path(&path),
                ca.method_algorithm().to_string(),
                Bare(Base16(ca.hash())).to_string(),
            )
        }
        DerivationOutput::CAFloating(ma) => (String::new(), ma.to_string(), String::new()),
        DerivationOutput::Deferred => (String::new(), String::new(), String::new()),
    })
}

fn decode_output_fields(
    ctx: &WireCtx,
    path: &str,
    algo: &str,
    hash: &str,
) -> Result<DerivationOutput, ProtocolError> {
    let bad = |message: String| ProtocolError::invalid_field("output", message);
    if algo.is_empty() {
        if path.is_empty() {
            return Ok(DerivationOutput::Deferred);
        }
        return Ok(DerivationOutput::InputAddressed(
            ctx.store_dir
                .parse_path(path)
                .map_err(|e| bad(e.to_string()))?,
        ));
    }
    let ma: cantata_store_core::content_address::ContentAddressMethodAlgorithm =
        algo.parse().map_err(|e| bad(format!("{e}")))?;
    if hash.is_empty() {
        return Ok(DerivationOutput::CAFloating(ma));
    }
    let hash = cantata_utils_hash::fmt::parse_bare::<cantata_utils_hash::Hash>(ma.algorithm, hash)
        .map_err(|e| bad(e.to_string()))?;
    let ca = cantata_store_core::content_address::ContentAddress::from_hash(ma.method, hash)
        .map_err(|e| bad(e.to_string()))?;
    Ok(DerivationOutput::CAFixed(ca))
}

#[cfg(test)]
mod tests {
    use cantata_store_core::StoreDir;
    use pretty_assertions::assert_eq;

    use crate::protocol::CURRENT_PROTOCOL_VERSION;

    use super::*;

    fn ctx() -> WireCtx {
        WireCtx::new(CURRENT_PROTOCOL_VERSION, StoreDir::default())
    }

    #[tokio::test]
    async fn store_path_roundtrip() {
        let path: StorePath = "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-hello-2.12.1".parse().unwrap();
        let mut buf = Vec::new();
        path.serialize(&mut buf, &ctx()).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(StorePath::deserialize(&mut reader, &ctx()).await.unwrap(), path);
    }

    #[tokio::test]
    async fn opt_path_empty_string() {
        let mut buf = Vec::new();
        write_opt_path(&mut buf, &ctx(), None).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(read_opt_path(&mut reader, &ctx()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn path_info_roundtrip() {
        let info = UnkeyedPathInfo {
            deriver: Some("00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-hello.drv".parse().unwrap()),
            nar_hash: "sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
                .parse::<Any<NarHash>>()
                .unwrap()
                .into_inner(),
            references: ["0sbwqgpi6jbqr710w5vn0b4s5w6z8n8n-dep".parse().unwrap()]
                .into_iter()
                .collect(),
            registration_time: 1700000000,
            nar_size: 120,
            ultimate: true,
            sigs: vec!["key-1:abc".into()],
            ca: None,
        };
        let mut buf = Vec::new();
        info.serialize(&mut buf, &ctx()).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(
            UnkeyedPathInfo::deserialize(&mut reader, &ctx()).await.unwrap(),
            info
        );
    }

    #[tokio::test]
    async fn derived_path_roundtrip() {
        for s in [
            DerivedPath::Opaque("00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-hello".parse().unwrap()),
            DerivedPath::Built {
                drv_path: "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-hello.drv".parse().unwrap(),
                outputs: "out".parse().unwrap(),
            },
            DerivedPath::Built {
                drv_path: "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-hello.drv".parse().unwrap(),
                outputs: "*".parse().unwrap(),
            },
        ] {
            let mut buf = Vec::new();
            s.serialize(&mut buf, &ctx()).await.unwrap();
            let mut reader = buf.as_slice();
            assert_eq!(DerivedPath::deserialize(&mut reader, &ctx()).await.unwrap(), s);
        }
    }

    #[tokio::test]
    async fn basic_derivation_roundtrip() {
        let drv_path: StorePath = "00ljmhbmf3d12aq4l5l7yr7bxn03yqvv-hello.drv".parse().unwrap();
        let drv = BasicDerivation {
            name: "hello".parse().unwrap(),
            outputs: [(
                OutputName::default(),
                DerivationOutput::InputAddressed(
                    "0sbwqgpi6jbqr710w5vn0b4s5w6z8n8n-hello".parse().unwrap(),
                ),
            )]
            .into_iter()
            .collect(),
            inputs: Default::default(),
            platform: ByteString::from_static(b"x86_64-linux"),
            builder: ByteString::from_static(b"/bin/sh"),
            args: vec![ByteString::from_static(b"-c"), ByteString::from_static(b"exit 0")],
            env: [(
                ByteString::from_static(b"out"),
                ByteString::from_static(b"/nix/store/0sbwqgpi6jbqr710w5vn0b4s5w6z8n8n-hello"),
            )]
            .into_iter()
            .collect(),
        };
        let mut buf = Vec::new();
        drv.serialize(&mut buf, &ctx()).await.unwrap();
        let mut reader = buf.as_slice();
        let parsed = read_basic_derivation(&mut reader, &ctx(), &drv_path).await.unwrap();
        assert_eq!(parsed, drv);
    }
}
