//! Factoid block, opaque at this layer.
//!
//! The factoid state machine is an external collaborator: the engine hands
//! it transaction payloads and, at seal time, asks it for the block to embed
//! in the directory block. Only the key Merkle root and the exchange rate
//! matter here.

use serde::{Deserialize, Serialize};

use crate::block::FACTOID_CHAIN_ID;
use crate::utilities::codec::{ByteReader, CodecError, Result};
use crate::utilities::crypto::PublicKey;
use crate::utilities::hash::{sha256, Hash};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FactoidBlock {
    pub key_mr: Hash,
    pub dbheight: u32,
    pub exchange_rate: u64,
    pub tx_ids: Vec<Hash>,
}

impl FactoidBlock {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(80 + self.tx_ids.len() * 32);
        out.extend_from_slice(FACTOID_CHAIN_ID.as_bytes());
        out.extend_from_slice(self.key_mr.as_bytes());
        out.extend_from_slice(&self.dbheight.to_be_bytes());
        out.extend_from_slice(&self.exchange_rate.to_be_bytes());
        out.extend_from_slice(&(self.tx_ids.len() as u32).to_be_bytes());
        for tx_id in &self.tx_ids {
            out.extend_from_slice(tx_id.as_bytes());
        }
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let chain_id = reader.read_hash()?;
        if chain_id != FACTOID_CHAIN_ID {
            return Err(CodecError::OutOfRange("factoid chain id"));
        }
        let key_mr = reader.read_hash()?;
        let dbheight = reader.read_u32()?;
        let exchange_rate = reader.read_u64()?;
        let count = reader.read_u32()?;
        let mut tx_ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            tx_ids.push(reader.read_hash()?);
        }
        reader.expect_end()?;
        Ok(Self {
            key_mr,
            dbheight,
            exchange_rate,
            tx_ids,
        })
    }
}

/// An entry-credit purchase produced by a factoid transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcIncrease {
    pub ec_public_key: PublicKey,
    pub tx_id: Hash,
    pub index: u64,
    pub num_ec: u64,
}

/// The factoid state machine consumed by the engine.
pub trait FactoidLedger {
    fn exchange_rate(&self) -> u64;

    /// Stateless validity check; an invalid transaction stays in the process
    /// list but has no effect.
    fn validate_transaction(&self, payload: &[u8]) -> bool;

    /// Applies a transaction. Returns `None` when rejected; otherwise the
    /// entry-credit purchases it produced.
    fn apply_transaction(&mut self, payload: &[u8]) -> Option<Vec<EcIncrease>>;

    /// Closes the in-progress block for `dbheight` and starts the next one.
    fn seal_block(&mut self, dbheight: u32) -> FactoidBlock;
}

/// EC purchase payload understood by [`SimpleLedger`]:
/// `0x01 ‖ ec_public_key(32) ‖ num_ec(8 BE)`.
pub const EC_PURCHASE_TAG: u8 = 0x01;

/// Minimal in-process ledger: deterministic key Merkle roots, a fixed
/// exchange rate, and the EC-purchase payload above. Anything else that
/// is non-empty is accepted as an opaque value transfer.
pub struct SimpleLedger {
    exchange_rate: u64,
    prev_key_mr: Hash,
    pending: Vec<Hash>,
    pending_increases: Vec<EcIncrease>,
}

impl SimpleLedger {
    // .001 / .15 * 100_000_000, the historical bootstrap rate
    pub const DEFAULT_EXCHANGE_RATE: u64 = 666_666;

    pub fn new(exchange_rate: u64) -> Self {
        Self {
            exchange_rate,
            prev_key_mr: Hash::ZERO,
            pending: Vec::new(),
            pending_increases: Vec::new(),
        }
    }
}

impl Default for SimpleLedger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_EXCHANGE_RATE)
    }
}

impl FactoidLedger for SimpleLedger {
    fn exchange_rate(&self) -> u64 {
        self.exchange_rate
    }

    fn validate_transaction(&self, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        if payload[0] == EC_PURCHASE_TAG {
            return payload.len() == 41;
        }
        true
    }

    fn apply_transaction(&mut self, payload: &[u8]) -> Option<Vec<EcIncrease>> {
        if !self.validate_transaction(payload) {
            return None;
        }
        let tx_id = sha256(payload);
        self.pending.push(tx_id);

        let mut increases = Vec::new();
        if payload[0] == EC_PURCHASE_TAG {
            let mut key_bytes = [0u8; 32];
            key_bytes.copy_from_slice(&payload[1..33]);
            let mut amount = [0u8; 8];
            amount.copy_from_slice(&payload[33..41]);
            let increase = EcIncrease {
                ec_public_key: PublicKey::new(key_bytes),
                tx_id,
                index: self.pending_increases.len() as u64,
                num_ec: u64::from_be_bytes(amount),
            };
            self.pending_increases.push(increase.clone());
            increases.push(increase);
        }
        Some(increases)
    }

    fn seal_block(&mut self, dbheight: u32) -> FactoidBlock {
        let mut data = dbheight.to_be_bytes().to_vec();
        data.extend_from_slice(self.prev_key_mr.as_bytes());
        for tx_id in &self.pending {
            data.extend_from_slice(tx_id.as_bytes());
        }
        let key_mr = sha256(&data);
        let block = FactoidBlock {
            key_mr,
            dbheight,
            exchange_rate: self.exchange_rate,
            tx_ids: std::mem::take(&mut self.pending),
        };
        self.pending_increases.clear();
        self.prev_key_mr = key_mr;
        block
    }
}

/// Builds an EC-purchase payload for [`SimpleLedger`].
pub fn ec_purchase_payload(ec_public_key: &PublicKey, num_ec: u64) -> Vec<u8> {
    let mut payload = vec![EC_PURCHASE_TAG];
    payload.extend_from_slice(ec_public_key.as_bytes());
    payload.extend_from_slice(&num_ec.to_be_bytes());
    payload
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_block_roundtrip() {
        let block = FactoidBlock {
            key_mr: sha256(b"kmr"),
            dbheight: 9,
            exchange_rate: 666_666,
            tx_ids: vec![sha256(b"t1"), sha256(b"t2")],
        };
        assert_eq!(FactoidBlock::unmarshal(&block.marshal()).unwrap(), block);
    }

    #[test]
    fn test_ledger_rejects_empty_payload() {
        let mut ledger = SimpleLedger::default();
        assert!(!ledger.validate_transaction(&[]));
        assert_eq!(ledger.apply_transaction(&[]), None);
    }

    #[test]
    fn test_ec_purchase() {
        let mut ledger = SimpleLedger::default();
        let key = PublicKey::new([9u8; 32]);
        let payload = ec_purchase_payload(&key, 25);
        let increases = ledger.apply_transaction(&payload).unwrap();
        assert_eq!(increases.len(), 1);
        assert_eq!(increases[0].num_ec, 25);
        assert_eq!(increases[0].ec_public_key, key);
    }

    #[test]
    fn test_seal_chains_key_mr() {
        let mut ledger = SimpleLedger::default();
        ledger.apply_transaction(&[0x02, 0x03]).unwrap();
        let first = ledger.seal_block(1);
        let second = ledger.seal_block(2);
        assert_ne!(first.key_mr, second.key_mr);
        assert_eq!(first.tx_ids.len(), 1);
        assert!(second.tx_ids.is_empty());
    }

    #[test]
    fn test_seal_is_deterministic() {
        let mut a = SimpleLedger::default();
        let mut b = SimpleLedger::default();
        a.apply_transaction(&[0x05]).unwrap();
        b.apply_transaction(&[0x05]).unwrap();
        assert_eq!(a.seal_block(1), b.seal_block(1));
    }
}
