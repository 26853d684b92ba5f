// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! ATerm serialization of derivations, the on-disk `.drv` format:
//!
//! ```text
//! Derive([(outputs)],[(input_drvs)],[srcs],"platform","builder",[args],[(env)])
//! ```
//!
//! Parsing and writing are byte-for-byte compatible with the wider
//! ecosystem; strings escape `\`, `"`, `\n`, `\r` and `\t`.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use cantata_utils_hash::fmt::{Bare, Base16, parse_bare};
use cantata_utils_hash::Hash;

use crate::content_address::{ContentAddress, ContentAddressMethodAlgorithm};
use crate::derived_path::OutputName;
use crate::store_path::{StoreDir, StorePath};
use crate::ByteString;

use super::{Derivation, DerivationOutput};

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ATermError {
    #[error("unexpected end of input at position {0}")]
    UnexpectedEof(usize),
    #[error("at position {pos}: expected {expected}, got {got:?}")]
    Expected {
        pos: usize,
        expected: String,
        got: String,
    },
    #[error("invalid store path: {0}")]
    InvalidStorePath(String),
    #[error("invalid derivation output: {0}")]
    InvalidOutput(String),
    #[error("output '{output}' declares path '{declared}' that does not match its content address")]
    FixedOutputPathMismatch {
        output: OutputName,
        declared: String,
    },
}

/// Parse a `.drv` file. `name` is the derivation name taken from the
/// `.drv` file name (without the suffix).
pub fn parse(store_dir: &StoreDir, input: &str, name: &str) -> Result<Derivation, ATermError> {
    let mut p = Parser::new(input);

    p.expect_str("Derive(")?;
    let outputs = p.parse_outputs(store_dir, name)?;
    p.expect_char(',')?;
    let input_drvs = p.parse_input_drvs(store_dir)?;
    p.expect_char(',')?;
    let input_srcs = p.parse_input_srcs(store_dir)?;
    p.expect_char(',')?;
    let platform = p.parse_string()?;
    p.expect_char(',')?;
    let builder = p.parse_string()?;
    p.expect_char(',')?;
    let args = p.parse_string_list()?;
    p.expect_char(',')?;
    let env = p.parse_env()?;
    p.expect_char(')')?;

    Ok(Derivation {
        name: name
            .parse()
            .map_err(|_| ATermError::InvalidStorePath(format!("invalid derivation name '{name}'")))?,
        outputs,
        input_srcs,
        input_drvs,
        platform: ByteString::from(platform),
        builder: ByteString::from(builder),
        args: args.into_iter().map(ByteString::from).collect(),
        env: env
            .into_iter()
            .map(|(k, v)| (ByteString::from(k), ByteString::from(v)))
            .collect(),
    })
}

/// Serialize a derivation to ATerm.
pub fn unparse(store_dir: &StoreDir, drv: &Derivation) -> String {
    unparse_with(store_dir, drv, None)
}

/// Serialize with each input derivation path replaced by a string from
/// `replacements` (used for hash-modulo computation).
pub(crate) fn unparse_with(
    store_dir: &StoreDir,
    drv: &Derivation,
    replacements: Option<&BTreeMap<StorePath, String>>,
) -> String {
    let mut s = String::with_capacity(4096);
    s.push_str("Derive(");

    // Outputs.
    s.push('[');
    for (i, (output_name, output)) in drv.outputs.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push('(');
        write_string(&mut s, output_name.as_str());
        s.push(',');
        let (path, algo, hash) = encode_output(store_dir, &drv.name, output_name, output);
        write_string(&mut s, &path);
        s.push(',');
        write_string(&mut s, &algo);
        s.push(',');
        write_string(&mut s, &hash);
        s.push(')');
    }
    s.push(']');
    s.push(',');

    // Input derivations, keyed by path or replacement string.
    let mut drv_inputs: Vec<(String, &BTreeSet<OutputName>)> = drv
        .input_drvs
        .iter()
        .map(|(path, outputs)| {
            let key = match replacements.and_then(|r| r.get(path)) {
                Some(replacement) => replacement.clone(),
                None => store_dir.print_path(path),
            };
            (key, outputs)
        })
        .collect();
    drv_inputs.sort_by(|a, b| a.0.cmp(&b.0));
    s.push('[');
    for (i, (key, outputs)) in drv_inputs.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push('(');
        write_string(&mut s, key);
        s.push_str(",[");
        for (j, output) in outputs.iter().enumerate() {
            if j > 0 {
                s.push(',');
            }
            write_string(&mut s, output.as_str());
        }
        s.push_str("])");
    }
    s.push(']');
    s.push(',');

    // Input sources.
    s.push('[');
    for (i, src) in drv.input_srcs.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        write_string(&mut s, &store_dir.print_path(src));
    }
    s.push(']');
    s.push(',');

    write_string_bytes(&mut s, &drv.platform);
    s.push(',');
    write_string_bytes(&mut s, &drv.builder);
    s.push(',');

    s.push('[');
    for (i, arg) in drv.args.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        write_string_bytes(&mut s, arg);
    }
    s.push(']');
    s.push(',');

    s.push('[');
    for (i, (key, value)) in drv.env.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push('(');
        write_string_bytes(&mut s, key);
        s.push(',');
        write_string_bytes(&mut s, value);
        s.push(')');
    }
    s.push(']');

    s.push(')');
    s
}

fn encode_output(
    store_dir: &StoreDir,
    drv_name: &str,
    output_name: &OutputName,
    output: &DerivationOutput,
) -> (String, String, String) {
    match output {
        DerivationOutput::InputAddressed(path) => {
            (store_dir.print_path(path), String::new(), String::new())
        }
        DerivationOutput::CAFixed(ca) => {
            let path = output
                .path(store_dir, drv_name, output_name)
                .expect("fixed output path computes")
                .expect("fixed outputs have a path");
            (
                store_dir.print_path(&path),
                ca.method_algorithm().to_string(),
                Bare(Base16(ca.hash())).to_string(),
            )
        }
        DerivationOutput::CAFloating(ma) => (String::new(), ma.to_string(), String::new()),
        DerivationOutput::Deferred => (String::new(), String::new(), String::new()),
    }
}

fn write_string(s: &mut String, value: &str) {
    s.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => s.push_str("\\\\"),
            '"' => s.push_str("\\\""),
            '\n' => s.push_str("\\n"),
            '\r' => s.push_str("\\r"),
            '\t' => s.push_str("\\t"),
            other => s.push(other),
        }
    }
    s.push('"');
}

fn write_string_bytes(s: &mut String, value: &ByteString) {
    write_string(s, &String::from_utf8_lossy(value));
}

struct Parser<'i> {
    input: &'i str,
    pos: usize,
}

impl<'i> Parser<'i> {
    fn new(input: &'i str) -> Self {
        Parser { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Result<char, ATermError> {
        let ch = self
            .peek()
            .ok_or(ATermError::UnexpectedEof(self.pos))?;
        self.pos += ch.len_utf8();
        Ok(ch)
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ATermError> {
        let pos = self.pos;
        let got = self.bump()?;
        if got != expected {
            return Err(ATermError::Expected {
                pos,
                expected: expected.to_string(),
                got: got.to_string(),
            });
        }
        Ok(())
    }

    fn expect_str(&mut self, expected: &str) -> Result<(), ATermError> {
        if self.input[self.pos..].starts_with(expected) {
            self.pos += expected.len();
            Ok(())
        } else {
            let got: String = self.input[self.pos..].chars().take(expected.len()).collect();
            Err(ATermError::Expected {
                pos: self.pos,
                expected: expected.to_owned(),
                got,
            })
        }
    }

    fn parse_string(&mut self) -> Result<String, ATermError> {
        self.expect_char('"')?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                '"' => return Ok(out),
                '\\' => {
                    let pos = self.pos;
                    match self.bump()? {
                        '\\' => out.push('\\'),
                        '"' => out.push('"'),
                        'n' => out.push('\n'),
                        'r' => out.push('\r'),
                        't' => out.push('\t'),
                        other => {
                            return Err(ATermError::Expected {
                                pos,
                                expected: "escape character".into(),
                                got: other.to_string(),
                            });
                        }
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn parse_string_list(&mut self) -> Result<Vec<String>, ATermError> {
        let mut out = Vec::new();
        self.expect_char('[')?;
        if self.peek() == Some(']') {
            self.bump()?;
            return Ok(out);
        }
        loop {
            out.push(self.parse_string()?);
            match self.bump()? {
                ',' => continue,
                ']' => return Ok(out),
                other => {
                    return Err(ATermError::Expected {
                        pos: self.pos - 1,
                        expected: "',' or ']'".into(),
                        got: other.to_string(),
                    });
                }
            }
        }
    }

    fn parse_store_path(
        &mut self,
        store_dir: &StoreDir,
    ) -> Result<StorePath, ATermError> {
        let s = self.parse_string()?;
        store_dir
            .parse_path(&s)
            .map_err(|e| ATermError::InvalidStorePath(e.to_string()))
    }

    fn parse_outputs(
        &mut self,
        store_dir: &StoreDir,
        drv_name: &str,
    ) -> Result<BTreeMap<OutputName, DerivationOutput>, ATermError> {
        let mut outputs = BTreeMap::new();
        self.expect_char('[')?;
        if self.peek() == Some(']') {
            self.bump()?;
            return Ok(outputs);
        }
        loop {
            self.expect_char('(')?;
            let name: OutputName = self
                .parse_string()?
                .parse()
                .map_err(|e| ATermError::InvalidOutput(format!("bad output name: {e}")))?;
            self.expect_char(',')?;
            let path = self.parse_string()?;
            self.expect_char(',')?;
            let algo = self.parse_string()?;
            self.expect_char(',')?;
            let hash = self.parse_string()?;
            self.expect_char(')')?;

            let output = decode_output(store_dir, drv_name, &name, &path, &algo, &hash)?;
            outputs.insert(name, output);
            match self.bump()? {
                ',' => continue,
                ']' => return Ok(outputs),
                other => {
                    return Err(ATermError::Expected {
                        pos: self.pos - 1,
                        expected: "',' or ']'".into(),
                        got: other.to_string(),
                    });
                }
            }
        }
    }

    fn parse_input_drvs(
        &mut self,
        store_dir: &StoreDir,
    ) -> Result<BTreeMap<StorePath, BTreeSet<OutputName>>, ATermError> {
        let mut inputs = BTreeMap::new();
        self.expect_char('[')?;
        if self.peek() == Some(']') {
            self.bump()?;
            return Ok(inputs);
        }
        loop {
            self.expect_char('(')?;
            let drv_path = self.parse_store_path(store_dir)?;
            self.expect_char(',')?;
            let outputs = self
                .parse_string_list()?
                .into_iter()
                .map(|o| {
                    o.parse()
                        .map_err(|e| ATermError::InvalidOutput(format!("bad output name: {e}")))
                })
                .collect::<Result<BTreeSet<OutputName>, _>>()?;
            self.expect_char(')')?;
            inputs.insert(drv_path, outputs);
            match self.bump()? {
                ',' => continue,
                ']' => return Ok(inputs),
                other => {
                    return Err(ATermError::Expected {
                        pos: self.pos - 1,
                        expected: "',' or ']'".into(),
                        got: other.to_string(),
                    });
                }
            }
        }
    }

    fn parse_input_srcs(
        &mut self,
        store_dir: &StoreDir,
    ) -> Result<crate::store_path::StorePathSet, ATermError> {
        self.parse_string_list()?
            .iter()
            .map(|s| {
                store_dir
                    .parse_path(s)
                    .map_err(|e| ATermError::InvalidStorePath(e.to_string()))
            })
            .collect()
    }

    fn parse_env(&mut self) -> Result<Vec<(String, String)>, ATermError> {
        let mut env = Vec::new();
        self.expect_char('[')?;
        if self.peek() == Some(']') {
            self.bump()?;
            return Ok(env);
        }
        loop {
            self.expect_char('(')?;
            let key = self.parse_string()?;
            self.expect_char(',')?;
            let value = self.parse_string()?;
            self.expect_char(')')?;
            env.push((key, value));
            match self.bump()? {
                ',' => continue,
                ']' => return Ok(env),
                other => {
                    return Err(ATermError::Expected {
                        pos: self.pos - 1,
                        expected: "',' or ']'".into(),
                        got: other.to_string(),
                    });
                }
            }
        }
    }
}

fn decode_output(
    store_dir: &StoreDir,
    drv_name: &str,
    name: &OutputName,
    path: &str,
    algo: &str,
    hash: &str,
) -> Result<DerivationOutput, ATermError> {
    if algo.is_empty() {
        if path.is_empty() {
            return Ok(DerivationOutput::Deferred);
        }
        let parsed = store_dir
            .parse_path(path)
            .map_err(|e| ATermError::InvalidStorePath(e.to_string()))?;
        return Ok(DerivationOutput::InputAddressed(parsed));
    }
    let ma: ContentAddressMethodAlgorithm = algo
        .parse()
        .map_err(|e| ATermError::InvalidOutput(format!("bad hash algorithm '{algo}': {e}")))?;
    if hash.is_empty() {
        return Ok(DerivationOutput::CAFloating(ma));
    }
    let hash: Hash = parse_bare(ma.algorithm, hash)
        .map_err(|e| ATermError::InvalidOutput(format!("bad output hash: {e}")))?;
    let ca = ContentAddress::from_hash(ma.method, hash)
        .map_err(|e| ATermError::InvalidOutput(e.to_string()))?;
    let output = DerivationOutput::CAFixed(ca);

    // The declared path must match the one the content address yields.
    let computed = output
        .path(store_dir, drv_name, name)
        .map_err(|e| ATermError::InvalidStorePath(e.to_string()))?
        .expect("fixed outputs have a path");
    if store_dir.print_path(&computed) != path {
        return Err(ATermError::FixedOutputPathMismatch {
            output: name.clone(),
            declared: path.to_owned(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// The derivation of `nixpkgs.hello`, as produced by the evaluator.
    const HELLO_DRV: &str = r#"Derive([("out","/nix/store/33l4p0pn0mybmqzaxfkpppyh7vx1c74p-hello-2.12.1","","")],[("/nix/store/6z1jfnqqgyqr221zgbpm30v91yfj3r45-bash-5.1-p16.drv",["out"]),("/nix/store/ap9g09fxbicj836zm88d56dn3ff4clxl-stdenv-linux.drv",["out"]),("/nix/store/pf80kikyxr63wrw56k00i1kw6ba76qik-hello-2.12.1.tar.gz.drv",["out"])],["/nix/store/9krlzvny65gdc8s7kpb6lkx8cd02c25b-default-builder.sh"],"x86_64-linux","/nix/store/4xw8n979xpivdc46a9ndcvyhwgif00hz-bash-5.1-p16/bin/bash",["-e","/nix/store/9krlzvny65gdc8s7kpb6lkx8cd02c25b-default-builder.sh"],[("buildInputs",""),("builder","/nix/store/4xw8n979xpivdc46a9ndcvyhwgif00hz-bash-5.1-p16/bin/bash"),("name","hello-2.12.1"),("out","/nix/store/33l4p0pn0mybmqzaxfkpppyh7vx1c74p-hello-2.12.1"),("outputs","out"),("pname","hello"),("src","/nix/store/pa10z4ngm0g83kx9mssrqzz30s84vq7k-hello-2.12.1.tar.gz"),("system","x86_64-linux"),("version","2.12.1")])"#;

    #[test]
    fn parse_hello() {
        let store_dir = StoreDir::default();
        let drv = parse(&store_dir, HELLO_DRV, "hello-2.12.1").unwrap();
        assert_eq!(drv.outputs.len(), 1);
        assert!(matches!(
            drv.outputs.get(&OutputName::default()),
            Some(DerivationOutput::InputAddressed(_))
        ));
        assert_eq!(drv.input_drvs.len(), 3);
        assert_eq!(drv.input_srcs.len(), 1);
        assert_eq!(&drv.platform[..], b"x86_64-linux");
        assert_eq!(drv.args.len(), 2);
        assert_eq!(drv.env.len(), 9);
    }

    #[test]
    fn unparse_hello_roundtrips_bytes() {
        let store_dir = StoreDir::default();
        let drv = parse(&store_dir, HELLO_DRV, "hello-2.12.1").unwrap();
        assert_eq!(unparse(&store_dir, &drv), HELLO_DRV);
    }

    #[test]
    fn escapes_roundtrip() {
        let store_dir = StoreDir::default();
        let mut drv = parse(&store_dir, HELLO_DRV, "hello-2.12.1").unwrap();
        drv.env.insert(
            ByteString::from_static(b"tricky"),
            ByteString::from_static(b"line1\nline2\t\"quoted\" back\\slash\r"),
        );
        let text = unparse(&store_dir, &drv);
        let parsed = parse(&store_dir, &text, "hello-2.12.1").unwrap();
        assert_eq!(parsed, drv);
    }

    #[test]
    fn fixed_output_roundtrip() {
        let store_dir = StoreDir::default();
        let ca: ContentAddress =
            "fixed:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
                .parse()
                .unwrap();
        let output = DerivationOutput::CAFixed(ca);
        let out_name = OutputName::default();
        let path = output
            .path(&store_dir, "source.tar.gz", &out_name)
            .unwrap()
            .unwrap();

        let mut outputs = BTreeMap::new();
        outputs.insert(out_name, output);
        let drv = Derivation {
            name: "source.tar.gz".parse().unwrap(),
            outputs,
            input_srcs: Default::default(),
            input_drvs: Default::default(),
            platform: ByteString::from_static(b"builtin"),
            builder: ByteString::from_static(b"builtin:fetchurl"),
            args: vec![],
            env: Default::default(),
        };
        let text = unparse(&store_dir, &drv);
        assert!(text.contains(&store_dir.print_path(&path)));
        let parsed = parse(&store_dir, &text, "source.tar.gz").unwrap();
        assert_eq!(parsed, drv);
    }

    #[test]
    fn fixed_output_wrong_path_rejected() {
        let store_dir = StoreDir::default();
        let text = r#"Derive([("out","/nix/store/00000000000000000000000000000000-source.tar.gz","sha256","ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")],[],[],"builtin","builtin:fetchurl",[],[])"#;
        let err = parse(&store_dir, text, "source.tar.gz").unwrap_err();
        assert!(matches!(err, ATermError::FixedOutputPathMismatch { .. }));
    }

    #[test]
    fn truncated_input_fails() {
        let store_dir = StoreDir::default();
        let truncated = &HELLO_DRV[..HELLO_DRV.len() - 2];
        assert!(parse(&store_dir, truncated, "hello-2.12.1").is_err());
    }

    #[test]
    fn garbage_fails_with_position() {
        let store_dir = StoreDir::default();
        match parse(&store_dir, "NotADerive(", "x") {
            Err(ATermError::Expected { pos, .. }) => assert_eq!(pos, 0),
            other => panic!("expected position error, got {other:?}"),
        }
    }
}
