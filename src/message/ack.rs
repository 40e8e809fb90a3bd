//! Acknowledgement: a federated server's signed ordering assertion placing
//! one message at one slot of one VM, chained by serial hash.

use crate::message::{
    read_optional_signature, read_prefix, write_prefix, ValidationState, Validity, ACK_MSG,
};
use crate::utilities::codec::Result;
use crate::utilities::crypto::{FullSignature, Keypair};
use crate::utilities::hash::{sha256_pair, Hash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub timestamp: u64,
    pub leader_chain_id: Hash,
    pub dbheight: u32,
    pub vm_index: u8,
    pub height_in_vm: u32,
    pub minute: u8,
    pub message_hash: Hash,
    pub serial_hash: Hash,
    pub signature: Option<FullSignature>,
}

/// The serial hash for an ack over `message_hash` following `prev`.
/// The first ack of a VM seeds the chain with its own message hash.
pub fn serial_hash(prev: Option<&Hash>, message_hash: &Hash) -> Hash {
    match prev {
        Some(prev) => sha256_pair(prev, message_hash),
        None => *message_hash,
    }
}

impl Ack {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        timestamp: u64,
        leader_chain_id: Hash,
        dbheight: u32,
        vm_index: u8,
        height_in_vm: u32,
        minute: u8,
        message_hash: Hash,
        prev_message_hash: Option<&Hash>,
    ) -> Self {
        Self {
            timestamp,
            leader_chain_id,
            dbheight,
            vm_index,
            height_in_vm,
            minute,
            message_hash,
            serial_hash: serial_hash(prev_message_hash, &message_hash),
            signature: None,
        }
    }

    pub fn marshal_for_signature(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(115);
        write_prefix(&mut out, ACK_MSG, self.timestamp);
        out.extend_from_slice(self.leader_chain_id.as_bytes());
        out.extend_from_slice(&self.dbheight.to_be_bytes());
        out.push(self.vm_index);
        out.extend_from_slice(&self.height_in_vm.to_be_bytes());
        out.push(self.minute);
        out.extend_from_slice(self.message_hash.as_bytes());
        out.extend_from_slice(self.serial_hash.as_bytes());
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
        let (mut reader, timestamp) = read_prefix(data, ACK_MSG)?;
        let leader_chain_id = reader.read_hash()?;
        let dbheight = reader.read_u32()?;
        let vm_index = reader.read_u8()?;
        let height_in_vm = reader.read_u32()?;
        let minute = reader.read_u8()?;
        let message_hash = reader.read_hash()?;
        let serial_hash = reader.read_hash()?;
        let signature = read_optional_signature(&mut reader)?;
        Ok(Self {
            timestamp,
            leader_chain_id,
            dbheight,
            vm_index,
            height_in_vm,
            minute,
            message_hash,
            serial_hash,
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

    /// Checks the signer against the server map; the serial-hash chain
    /// itself is checked at install time, against the installed predecessor.
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::utilities::hash::sha256;

    #[test]
    fn test_serial_hash_seed() {
        let first = sha256(b"first");
        assert_eq!(serial_hash(None, &first), first);
    }

    #[test]
    fn test_serial_hash_chains() {
        let first = sha256(b"first");
        let second = sha256(b"second");
        assert_eq!(
            serial_hash(Some(&first), &second),
            sha256_pair(&first, &second)
        );
    }

    #[test]
    fn test_roundtrip_signed() {
        let keypair = Keypair::from_seed([1u8; 32]);
        let mut ack = Ack::new(5, sha256(b"leader"), 3, 1, 0, 2, sha256(b"m"), None);
        ack.sign(&keypair);
        let decoded = Ack::unmarshal(&ack.marshal()).unwrap();
        assert_eq!(decoded, ack);
        assert!(decoded.verify());
    }
}
