//! Per-server signature closing a height. Acknowledged into the list at
//! `dbheight`, it signs off on the previous height's directory block.

use crate::message::{
    read_optional_signature, read_prefix, write_prefix, ValidationState, Validity,
    DB_SIGNATURE_MSG,
};
use crate::utilities::codec::Result;
use crate::utilities::crypto::{FullSignature, Keypair};
use crate::utilities::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryBlockSignature {
    pub timestamp: u64,
    pub leader_chain_id: Hash,
    pub dbheight: u32,
    /// Key MR of the directory block at `dbheight - 1`.
    pub prev_key_mr: Hash,
    pub signature: Option<FullSignature>,
}

impl DirectoryBlockSignature {
    pub fn new(timestamp: u64, leader_chain_id: Hash, dbheight: u32, prev_key_mr: Hash) -> Self {
        Self {
            timestamp,
            leader_chain_id,
            dbheight,
            prev_key_mr,
            signature: None,
        }
    }

    pub fn marshal_for_signature(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(77);
        write_prefix(&mut out, DB_SIGNATURE_MSG, self.timestamp);
        out.extend_from_slice(self.leader_chain_id.as_bytes());
        out.extend_from_slice(&self.dbheight.to_be_bytes());
        out.extend_from_slice(self.prev_key_mr.as_bytes());
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
        let (mut reader, timestamp) = read_prefix(data, DB_SIGNATURE_MSG)?;
        let leader_chain_id = reader.read_hash()?;
        let dbheight = reader.read_u32()?;
        let prev_key_mr = reader.read_hash()?;
        let signature = read_optional_signature(&mut reader)?;
        Ok(Self {
            timestamp,
            leader_chain_id,
            dbheight,
            prev_key_mr,
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

    pub fn validate(&self, state: &dyn ValidationState) -> Validity {
        if self.dbheight < state.dbheight() {
            return Validity::Invalid;
        }
        if self.dbheight > state.dbheight() {
            return Validity::Undetermined;
        }
        let Some(expected_key) = state.federated_key(&self.leader_chain_id) else {
            return Validity::Invalid;
        };
        // The block being signed off must be the predecessor we hold; if we
        // do not hold it yet, the answer is simply not known.
        match state.prev_key_mr() {
            None => return Validity::Undetermined,
            Some(key_mr) if key_mr != self.prev_key_mr => return Validity::Invalid,
            Some(_) => {}
        }
        match &self.signature {
            Some(signature) if signature.public_key == expected_key && self.verify() => {
                Validity::Valid
            }
            _ => Validity::Invalid,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utilities::hash::sha256;

    #[test]
    fn test_roundtrip() {
        let keypair = Keypair::from_seed([4u8; 32]);
        let mut sig = DirectoryBlockSignature::new(6, sha256(b"leader"), 2, sha256(b"keymr"));
        sig.sign(&keypair);
        let decoded = DirectoryBlockSignature::unmarshal(&sig.marshal()).unwrap();
        assert_eq!(decoded, sig);
        assert!(decoded.verify());
    }
}
