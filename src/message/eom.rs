//! End-of-minute marker, sealing one VM for one of the ten minutes.

use crate::message::{
    read_optional_signature, read_prefix, write_prefix, ValidationState, Validity, EOM_MSG,
};
use crate::utilities::codec::{CodecError, Result};
use crate::utilities::crypto::{FullSignature, Keypair};
use crate::utilities::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eom {
    pub timestamp: u64,
    pub leader_chain_id: Hash,
    pub minute: u8,
    pub vm_index: u8,
    pub dbheight: u32,
    pub signature: Option<FullSignature>,
}

impl Eom {
    pub fn new(timestamp: u64, leader_chain_id: Hash, minute: u8, vm_index: u8, dbheight: u32) -> Self {
        Self {
            timestamp,
            leader_chain_id,
            minute,
            vm_index,
            dbheight,
            signature: None,
        }
    }

    pub fn marshal_for_signature(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(47);
        write_prefix(&mut out, EOM_MSG, self.timestamp);
        out.extend_from_slice(self.leader_chain_id.as_bytes());
        out.push(self.minute);
        out.push(self.vm_index);
        out.extend_from_slice(&self.dbheight.to_be_bytes());
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
        let (mut reader, timestamp) = read_prefix(data, EOM_MSG)?;
        let leader_chain_id = reader.read_hash()?;
        let minute = reader.read_u8()?;
        if minute >= 10 {
            return Err(CodecError::OutOfRange("eom minute"));
        }
        let vm_index = reader.read_u8()?;
        let dbheight = reader.read_u32()?;
        let signature = read_optional_signature(&mut reader)?;
        Ok(Self {
            timestamp,
            leader_chain_id,
            minute,
            vm_index,
            dbheight,
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

    /// Only an EOM signed by the federated server owning this VM for this
    /// minute is acceptable.
    pub fn validate(&self, state: &dyn ValidationState) -> Validity {
        if self.dbheight < state.dbheight() {
            return Validity::Invalid;
        }
        if self.dbheight > state.dbheight() {
            return Validity::Undetermined;
        }
        let Some(owner) = state.vm_owner(self.minute, self.vm_index as usize) else {
            return Validity::Invalid;
        };
        if owner != self.leader_chain_id {
            return Validity::Invalid;
        }
        let Some(expected_key) = state.federated_key(&self.leader_chain_id) else {
            return Validity::Invalid;
        };
        match &self.signature {
            Some(signature) if signature.public_key == expected_key && self.verify() => {
                Validity::Valid
            }
            _ => Validity::Invalid,
        }
    }
}
