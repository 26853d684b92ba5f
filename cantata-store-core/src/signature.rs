// SPDX-FileCopyrightText: 2026 Cantata contributors
// SPDX-License-Identifier: MIT

//! Detached path signatures.
//!
//! A signature is rendered `<key-name>:<base64 ed25519 signature>` and
//! signs the path fingerprint (see [`crate::fingerprint`]). Keys are
//! rendered the same way with the base64 key material in place of the
//! signature.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use data_encoding::BASE64;
use ed25519_dalek::{Signer as _, Verifier as _};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid base64: {0}")]
    Base64(#[from] data_encoding::DecodeError),
    #[error("signature has invalid length {0}, expected 64 bytes")]
    InvalidLength(usize),
    #[error("invalid signature format: {0}")]
    InvalidFormat(String),
    #[error("invalid ed25519 material: {0}")]
    Ed25519(#[from] ed25519_dalek::SignatureError),
}

/// A named detached signature, `name:base64`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    name: String,
    signature: ed25519_dalek::Signature,
}

impl Signature {
    pub fn new(name: String, signature: ed25519_dalek::Signature) -> Self {
        Signature { name, signature }
    }

    /// The name of the key that produced this signature.
    pub fn key_name(&self) -> &str {
        &self.name
    }

    pub fn signature_bytes(&self) -> [u8; 64] {
        self.signature.to_bytes()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, BASE64.encode(&self.signature.to_bytes()))
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, sig) = s
            .split_once(':')
            .ok_or_else(|| SignatureError::InvalidFormat(s.to_owned()))?;
        if name.is_empty() {
            return Err(SignatureError::InvalidFormat(s.to_owned()));
        }
        let bytes = BASE64.decode(sig.as_bytes())?;
        if bytes.len() != 64 {
            return Err(SignatureError::InvalidLength(bytes.len()));
        }
        let signature = ed25519_dalek::Signature::from_slice(&bytes)?;
        Ok(Signature {
            name: name.to_owned(),
            signature,
        })
    }
}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.signature.to_bytes().hash(state);
    }
}

impl PartialOrd for Signature {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Signature {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.name, self.signature.to_bytes())
            .cmp(&(&other.name, other.signature.to_bytes()))
    }
}

impl serde::Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::Deserialize as _;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A named secret key, `name:base64(32-or-64-byte ed25519 key)`.
#[derive(Clone)]
pub struct SecretKey {
    name: String,
    key: ed25519_dalek::SigningKey,
}

impl SecretKey {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sign `fingerprint` and return the named signature.
    pub fn sign(&self, fingerprint: &[u8]) -> Signature {
        Signature {
            name: self.name.clone(),
            signature: self.key.sign(fingerprint),
        }
    }

    /// The corresponding public key.
    pub fn to_public(&self) -> PublicKey {
        PublicKey {
            name: self.name.clone(),
            key: self.key.verifying_key(),
        }
    }
}

impl FromStr for SecretKey {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, key64) = s
            .split_once(':')
            .ok_or_else(|| SignatureError::InvalidFormat(s.to_owned()))?;
        if name.is_empty() {
            return Err(SignatureError::InvalidFormat(s.to_owned()));
        }
        let bytes = BASE64.decode(key64.trim().as_bytes())?;
        let key = match bytes.len() {
            32 => {
                let seed: [u8; 32] = bytes.as_slice().try_into().unwrap();
                ed25519_dalek::SigningKey::from_bytes(&seed)
            }
            64 => {
                let pair: [u8; 64] = bytes.as_slice().try_into().unwrap();
                ed25519_dalek::SigningKey::from_keypair_bytes(&pair)?
            }
            n => return Err(SignatureError::InvalidLength(n)),
        };
        Ok(SecretKey {
            name: name.to_owned(),
            key,
        })
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey").field("name", &self.name).finish()
    }
}

/// A named public key, `name:base64(32-byte ed25519 key)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    name: String,
    key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Verify `signature` over `fingerprint`. The signature's key name
    /// must match this key's name.
    pub fn verify(&self, fingerprint: &[u8], signature: &Signature) -> bool {
        self.name == signature.name
            && self.key.verify(fingerprint, &signature.signature).is_ok()
    }
}

impl FromStr for PublicKey {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, key64) = s
            .split_once(':')
            .ok_or_else(|| SignatureError::InvalidFormat(s.to_owned()))?;
        if name.is_empty() {
            return Err(SignatureError::InvalidFormat(s.to_owned()));
        }
        let bytes = BASE64.decode(key64.trim().as_bytes())?;
        if bytes.len() != 32 {
            return Err(SignatureError::InvalidLength(bytes.len()));
        }
        let raw: [u8; 32] = bytes.as_slice().try_into().unwrap();
        Ok(PublicKey {
            name: name.to_owned(),
            key: ed25519_dalek::VerifyingKey::from_bytes(&raw)?,
        })
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, BASE64.encode(self.key.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SecretKey {
        // Deterministic test seed, not a real key.
        let seed = [42u8; 32];
        SecretKey {
            name: "test-store-1".into(),
            key: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    #[test]
    fn sign_and_verify() {
        let secret = test_key();
        let public = secret.to_public();
        let sig = secret.sign(b"1;/nix/store/aaaa-x;sha256:abc;1;");
        assert!(public.verify(b"1;/nix/store/aaaa-x;sha256:abc;1;", &sig));
        assert!(!public.verify(b"1;/nix/store/aaaa-x;sha256:abc;2;", &sig));
    }

    #[test]
    fn signature_text_roundtrip() {
        let secret = test_key();
        let sig = secret.sign(b"payload");
        let text = sig.to_string();
        assert!(text.starts_with("test-store-1:"));
        let parsed: Signature = text.parse().unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn wrong_key_name_fails_verify() {
        let secret = test_key();
        let public = secret.to_public();
        let mut sig = secret.sign(b"payload");
        sig.name = "other-key".into();
        assert!(!public.verify(b"payload", &sig));
    }

    #[test]
    fn known_upstream_signature_parses() {
        let text = "cache.nixos.org-1:0CpHca+06TwFp9VkMyz5OaphT3E8mnS+1SWymYlvFaghKSYPCMQ66TS1XPAr1+y9rfQZPLaHrBjjnIRktE/nAA==";
        let sig: Signature = text.parse().unwrap();
        assert_eq!(sig.key_name(), "cache.nixos.org-1");
        assert_eq!(sig.to_string(), text);
    }

    #[test]
    fn secret_key_text_roundtrip() {
        let secret = test_key();
        let seed_text = format!("test-store-1:{}", BASE64.encode(&[42u8; 32]));
        let parsed: SecretKey = seed_text.parse().unwrap();
        let sig1 = secret.sign(b"x");
        let sig2 = parsed.sign(b"x");
        assert_eq!(sig1, sig2);
    }
}
