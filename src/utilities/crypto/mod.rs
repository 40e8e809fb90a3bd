//! Ed25519 key material.
//!
//! Wire objects carry raw 32-byte public keys and 64-byte signatures;
//! verification is strict (canonical signatures only).

use std::fmt::{Debug, Display};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utilities::hash::Hash;

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("invalid hexadecimal")]
    InvalidHexadecimal,
    #[error("invalid key length")]
    SliceLength,
    #[error("invalid public key")]
    PublicKey,
}

/// Raw Ed25519 public key.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub const fn new(bytes: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != PUBLIC_KEY_LENGTH {
            return Err(KeyError::SliceLength);
        }
        let mut out = [0u8; PUBLIC_KEY_LENGTH];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidHexadecimal)?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Canonical Ed25519 verification of `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LENGTH]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(signature);
        key.verify_strict(message, &signature).is_ok()
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..8])
    }
}

/// Ed25519 keypair held by this node.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut csprng),
        }
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidHexadecimal)?;
        if bytes.len() != 32 {
            return Err(KeyError::SliceLength);
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        Ok(Self::from_seed(seed))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing.sign(message).to_bytes()
    }
}

impl Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the private half.
        write!(f, "Keypair({})", self.public_key())
    }
}

/// Public key plus signature, trailing every signed wire object.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct FullSignature {
    pub public_key: PublicKey,
    pub signature: [u8; SIGNATURE_LENGTH],
}

impl FullSignature {
    pub fn sign(keypair: &Keypair, message: &[u8]) -> Self {
        Self {
            public_key: keypair.public_key(),
            signature: keypair.sign(message),
        }
    }

    pub fn verify(&self, message: &[u8]) -> bool {
        self.public_key.verify(message, &self.signature)
    }

    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.public_key.as_bytes());
        out.extend_from_slice(&self.signature);
    }

    pub fn unmarshal(
        reader: &mut crate::utilities::codec::ByteReader<'_>,
    ) -> crate::utilities::codec::Result<Self> {
        let key_bytes = reader.read_bytes(PUBLIC_KEY_LENGTH)?;
        let public_key = PublicKey::from_slice(key_bytes)
            .map_err(|_| crate::utilities::codec::CodecError::OutOfRange("public key"))?;
        let sig_bytes = reader.read_bytes(SIGNATURE_LENGTH)?;
        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature.copy_from_slice(sig_bytes);
        Ok(Self {
            public_key,
            signature,
        })
    }
}

impl Debug for FullSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FullSignature(key: {}, sig: {})",
            self.public_key,
            &hex::encode(self.signature)[..8]
        )
    }
}

/// A server identity is its chain id; chain ids are derived from the public
/// key so that test rosters can be built from keypairs alone.
pub fn chain_id_of(public_key: &PublicKey) -> Hash {
    crate::utilities::hash::sha256(public_key.as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = Keypair::from_seed([7u8; 32]);
        let message = b"acknowledged";
        let full = FullSignature::sign(&keypair, message);
        assert!(full.verify(message));
    }

    #[test]
    fn test_verify_rejects_altered_message() {
        let keypair = Keypair::from_seed([7u8; 32]);
        let full = FullSignature::sign(&keypair, b"acknowledged");
        assert!(!full.verify(b"acknowledgee"));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let keypair = Keypair::from_seed([7u8; 32]);
        let other = Keypair::from_seed([8u8; 32]);
        let mut full = FullSignature::sign(&keypair, b"acknowledged");
        full.public_key = other.public_key();
        assert!(!full.verify(b"acknowledged"));
    }

    #[test]
    fn test_hex_roundtrip() {
        let keypair = Keypair::from_seed([9u8; 32]);
        let restored = Keypair::from_hex(&keypair.to_hex()).unwrap();
        assert_eq!(keypair.public_key(), restored.public_key());
    }
}
