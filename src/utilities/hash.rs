use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const HASH_LENGTH: usize = 32;

/// 32-byte opaque content identifier. All references between objects are by hash.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    pub const ZERO: Hash = Hash([0; HASH_LENGTH]);

    pub const fn new(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_LENGTH {
            return None;
        }
        let mut out = [0u8; HASH_LENGTH];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn from_hex(hex_str: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(hex_str)?;
        Self::from_slice(&bytes).ok_or_else(|| anyhow::anyhow!("invalid hash length"))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; HASH_LENGTH]
    }

    /// A minute-marker sentinel: 31 zero bytes, last byte is the marker number 1..=10.
    pub fn minute_marker(minute: u8) -> Self {
        let mut bytes = [0u8; HASH_LENGTH];
        bytes[HASH_LENGTH - 1] = minute + 1;
        Self(bytes)
    }

    /// Returns the end-of-minute value 0..=9 if this hash is a minute-marker sentinel.
    pub fn as_minute_marker(&self) -> Option<u8> {
        if self.0[..HASH_LENGTH - 1].iter().all(|b| *b == 0) {
            let last = self.0[HASH_LENGTH - 1];
            if (1..=10).contains(&last) {
                return Some(last - 1);
            }
        }
        None
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form, enough to eyeball in logs
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

pub fn sha256(data: &[u8]) -> Hash {
    Hash(Sha256::digest(data).into())
}

/// SHA-256 over the concatenation of two hashes, the combining step of
/// serial-hash chaining and Merkle trees.
pub fn sha256_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash(hasher.finalize().into())
}
