//! Factoid transaction envelope. The payload is opaque to the consensus
//! core; the factoid state machine judges it at process time.

use crate::message::{
    read_optional_signature, read_prefix, write_prefix, ValidationState, Validity, FACTOID_TX_MSG,
};
use crate::utilities::codec::{encode_var_bytes, Result};
use crate::utilities::crypto::{FullSignature, Keypair};
use crate::utilities::hash::{sha256, Hash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoidTransaction {
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub signature: Option<FullSignature>,
}

impl FactoidTransaction {
    pub fn new(timestamp: u64, payload: Vec<u8>) -> Self {
        Self {
            timestamp,
            payload,
            signature: None,
        }
    }

    pub fn tx_id(&self) -> Hash {
        sha256(&self.payload)
    }

    pub fn marshal_for_signature(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(19 + self.payload.len());
        write_prefix(&mut out, FACTOID_TX_MSG, self.timestamp);
        encode_var_bytes(&mut out, &self.payload);
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
        let (mut reader, timestamp) = read_prefix(data, FACTOID_TX_MSG)?;
        let payload = reader.read_var_bytes()?.to_vec();
        let signature = read_optional_signature(&mut reader)?;
        Ok(Self {
            timestamp,
            payload,
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

    /// Content validity is the factoid state machine's call; a transaction
    /// it rejects still occupies its slot with a nil effect.
    pub fn validate(&self, _state: &dyn ValidationState) -> Validity {
        if self.verify() {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let keypair = Keypair::from_seed([3u8; 32]);
        let mut tx = FactoidTransaction::new(44, vec![1, 2, 3, 4, 5]);
        tx.sign(&keypair);
        let decoded = FactoidTransaction::unmarshal(&tx.marshal()).unwrap();
        assert_eq!(decoded, tx);
        assert!(decoded.verify());
    }

    #[test]
    fn test_tx_id_is_payload_hash() {
        let tx = FactoidTransaction::new(44, vec![9]);
        assert_eq!(tx.tx_id(), sha256(&[9]));
    }
}
