//! Entry-credit commits: pay-then-publish, phase one.
//!
//! A commit burns credits from an EC public key and pins the hash of the
//! entry (and, for chain commits, the new chain) it pays for.

use crate::message::{
    read_optional_signature, read_prefix, write_prefix, ValidationState, Validity,
    COMMIT_CHAIN_MSG, COMMIT_ENTRY_MSG,
};
use crate::utilities::codec::{CodecError, Result};
use crate::utilities::crypto::{FullSignature, Keypair, PublicKey};
use crate::utilities::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitChain {
    pub timestamp: u64,
    pub chain_id: Hash,
    pub entry_hash: Hash,
    pub credits: u8,
    pub ec_public_key: PublicKey,
    pub signature: Option<FullSignature>,
}

impl CommitChain {
    pub fn new(
        timestamp: u64,
        chain_id: Hash,
        entry_hash: Hash,
        credits: u8,
        ec_public_key: PublicKey,
    ) -> Self {
        Self {
            timestamp,
            chain_id,
            entry_hash,
            credits,
            ec_public_key,
            signature: None,
        }
    }

    pub fn marshal_for_signature(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(110);
        write_prefix(&mut out, COMMIT_CHAIN_MSG, self.timestamp);
        out.extend_from_slice(self.chain_id.as_bytes());
        out.extend_from_slice(self.entry_hash.as_bytes());
        out.push(self.credits);
        out.extend_from_slice(self.ec_public_key.as_bytes());
        out
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.marshal_for_signature();
        if let Some(signature) = &self.signature {
            signature.marshal(&mut out);
        }
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (mut reader, timestamp) = read_prefix(data, COMMIT_CHAIN_MSG)?;
        let chain_id = reader.read_hash()?;
        let entry_hash = reader.read_hash()?;
        let credits = reader.read_u8()?;
        let key_bytes = reader.read_bytes(32)?;
        let ec_public_key = PublicKey::from_slice(key_bytes)
            .map_err(|_| CodecError::OutOfRange("ec public key"))?;
        let signature = read_optional_signature(&mut reader)?;
        Ok(Self {
            timestamp,
            chain_id,
            entry_hash,
            credits,
            ec_public_key,
            signature,
        })
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = Some(FullSignature::sign(keypair, &self.marshal_for_signature()));
    }

    pub fn verify(&self) -> bool {
        match &self.signature {
            Some(signature) => signature.verify(&self.marshal_for_signature()),
            None => false,
        }
    }

    pub fn validate(&self, _state: &dyn ValidationState) -> Validity {
        // Balance sufficiency is judged at process time; here only the
        // commitment itself must be sound.
        if self.credits == 0 {
            return Validity::Invalid;
        }
        if self.verify() {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub timestamp: u64,
    pub entry_hash: Hash,
    pub credits: u8,
    pub ec_public_key: PublicKey,
    pub signature: Option<FullSignature>,
}

impl CommitEntry {
    pub fn new(timestamp: u64, entry_hash: Hash, credits: u8, ec_public_key: PublicKey) -> Self {
        Self {
            timestamp,
            entry_hash,
            credits,
            ec_public_key,
            signature: None,
        }
    }

    pub fn marshal_for_signature(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(78);
        write_prefix(&mut out, COMMIT_ENTRY_MSG, self.timestamp);
        out.extend_from_slice(self.entry_hash.as_bytes());
        out.push(self.credits);
        out.extend_from_slice(self.ec_public_key.as_bytes());
        out
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.marshal_for_signature();
        if let Some(signature) = &self.signature {
            signature.marshal(&mut out);
        }
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (mut reader, timestamp) = read_prefix(data, COMMIT_ENTRY_MSG)?;
        let entry_hash = reader.read_hash()?;
        let credits = reader.read_u8()?;
        let key_bytes = reader.read_bytes(32)?;
        let ec_public_key = PublicKey::from_slice(key_bytes)
            .map_err(|_| CodecError::OutOfRange("ec public key"))?;
        let signature = read_optional_signature(&mut reader)?;
        Ok(Self {
            timestamp,
            entry_hash,
            credits,
            ec_public_key,
            signature,
        })
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = Some(FullSignature::sign(keypair, &self.marshal_for_signature()));
    }

    pub fn verify(&self) -> bool {
        match &self.signature {
            Some(signature) => signature.verify(&self.marshal_for_signature()),
            None => false,
        }
    }

    pub fn validate(&self, _state: &dyn ValidationState) -> Validity {
        if self.credits == 0 {
            return Validity::Invalid;
        }
        if self.verify() {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}
