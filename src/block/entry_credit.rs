//! Entry-credit block: the paid side of the two-phase commit/reveal flow.
//!
//! The body interleaves commits with per-minute markers; the balance map is
//! keyed by EC public key with signed 32-bit balances.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::block::EC_CHAIN_ID;
use crate::utilities::codec::{encode_varint, ByteReader, CodecError, Result};
use crate::utilities::crypto::PublicKey;
use crate::utilities::hash::{sha256, Hash};

const ECID_SERVER_INDEX_NUMBER: u8 = 0x00;
const ECID_MINUTE_NUMBER: u8 = 0x01;
const ECID_CHAIN_COMMIT: u8 = 0x02;
const ECID_ENTRY_COMMIT: u8 = 0x03;
const ECID_BALANCE_INCREASE: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum EcEntry {
    ServerIndexNumber(u8),
    MinuteNumber(u8),
    CommitChain {
        chain_id: Hash,
        entry_hash: Hash,
        credits: u8,
        ec_public_key: PublicKey,
    },
    CommitEntry {
        entry_hash: Hash,
        credits: u8,
        ec_public_key: PublicKey,
    },
    IncreaseBalance {
        ec_public_key: PublicKey,
        tx_id: Hash,
        index: u64,
        num_ec: u64,
    },
}

impl EcEntry {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(98);
        match self {
            EcEntry::ServerIndexNumber(index) => {
                out.push(ECID_SERVER_INDEX_NUMBER);
                out.push(*index);
            }
            EcEntry::MinuteNumber(number) => {
                out.push(ECID_MINUTE_NUMBER);
                out.push(*number);
            }
            EcEntry::CommitChain {
                chain_id,
                entry_hash,
                credits,
                ec_public_key,
            } => {
                out.push(ECID_CHAIN_COMMIT);
                out.extend_from_slice(chain_id.as_bytes());
                out.extend_from_slice(entry_hash.as_bytes());
                out.push(*credits);
                out.extend_from_slice(ec_public_key.as_bytes());
            }
            EcEntry::CommitEntry {
                entry_hash,
                credits,
                ec_public_key,
            } => {
                out.push(ECID_ENTRY_COMMIT);
                out.extend_from_slice(entry_hash.as_bytes());
                out.push(*credits);
                out.extend_from_slice(ec_public_key.as_bytes());
            }
            EcEntry::IncreaseBalance {
                ec_public_key,
                tx_id,
                index,
                num_ec,
            } => {
                out.push(ECID_BALANCE_INCREASE);
                out.extend_from_slice(ec_public_key.as_bytes());
                out.extend_from_slice(tx_id.as_bytes());
                encode_varint(&mut out, *index);
                encode_varint(&mut out, *num_ec);
            }
        }
        out
    }

    fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        let tag = reader.read_u8()?;
        match tag {
            ECID_SERVER_INDEX_NUMBER => Ok(EcEntry::ServerIndexNumber(reader.read_u8()?)),
            ECID_MINUTE_NUMBER => Ok(EcEntry::MinuteNumber(reader.read_u8()?)),
            ECID_CHAIN_COMMIT => Ok(EcEntry::CommitChain {
                chain_id: reader.read_hash()?,
                entry_hash: reader.read_hash()?,
                credits: reader.read_u8()?,
                ec_public_key: read_public_key(reader)?,
            }),
            ECID_ENTRY_COMMIT => Ok(EcEntry::CommitEntry {
                entry_hash: reader.read_hash()?,
                credits: reader.read_u8()?,
                ec_public_key: read_public_key(reader)?,
            }),
            ECID_BALANCE_INCREASE => Ok(EcEntry::IncreaseBalance {
                ec_public_key: read_public_key(reader)?,
                tx_id: reader.read_hash()?,
                index: reader.read_varint()?,
                num_ec: reader.read_varint()?,
            }),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

fn read_public_key(reader: &mut ByteReader<'_>) -> Result<PublicKey> {
    let bytes = reader.read_bytes(32)?;
    PublicKey::from_slice(bytes).map_err(|_| CodecError::OutOfRange("ec public key"))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EcBlockHeader {
    pub body_hash: Hash,
    pub prev_header_hash: Hash,
    pub prev_full_hash: Hash,
    pub dbheight: u32,
    pub header_expansion: Vec<u8>,
    pub object_count: u64,
    pub body_size: u64,
}

impl EcBlockHeader {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(150);
        out.extend_from_slice(EC_CHAIN_ID.as_bytes());
        out.extend_from_slice(self.body_hash.as_bytes());
        out.extend_from_slice(self.prev_header_hash.as_bytes());
        out.extend_from_slice(self.prev_full_hash.as_bytes());
        out.extend_from_slice(&self.dbheight.to_be_bytes());
        encode_varint(&mut out, self.header_expansion.len() as u64);
        out.extend_from_slice(&self.header_expansion);
        out.extend_from_slice(&self.object_count.to_be_bytes());
        out.extend_from_slice(&self.body_size.to_be_bytes());
        out
    }

    fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        let chain_id = reader.read_hash()?;
        if chain_id != EC_CHAIN_ID {
            return Err(CodecError::OutOfRange("entry credit chain id"));
        }
        let body_hash = reader.read_hash()?;
        let prev_header_hash = reader.read_hash()?;
        let prev_full_hash = reader.read_hash()?;
        let dbheight = reader.read_u32()?;
        let header_expansion = reader.read_var_bytes()?.to_vec();
        let object_count = reader.read_u64()?;
        let body_size = reader.read_u64()?;
        Ok(Self {
            body_hash,
            prev_header_hash,
            prev_full_hash,
            dbheight,
            header_expansion,
            object_count,
            body_size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EcBlock {
    pub header: EcBlockHeader,
    pub body: Vec<EcEntry>,
}

impl EcBlock {
    pub fn new(dbheight: u32, prev_header_hash: Hash, prev_full_hash: Hash) -> Self {
        Self {
            header: EcBlockHeader {
                body_hash: Hash::ZERO,
                prev_header_hash,
                prev_full_hash,
                dbheight,
                header_expansion: Vec::new(),
                object_count: 0,
                body_size: 0,
            },
            body: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry: EcEntry) {
        self.body.push(entry);
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.body {
            out.extend_from_slice(&entry.marshal());
        }
        out
    }

    fn sealed_header(&self) -> EcBlockHeader {
        let body = self.body_bytes();
        let mut header = self.header.clone();
        header.body_hash = sha256(&body);
        header.object_count = self.body.len() as u64;
        header.body_size = body.len() as u64;
        header
    }

    /// Fixes the derived header fields so the in-memory block matches its
    /// serialized form.
    pub fn seal(&mut self) {
        self.header = self.sealed_header();
    }

    /// The hash of the sealed header; this is what the directory block and
    /// the next height's `prev_header_hash` reference.
    pub fn key_mr(&self) -> Hash {
        sha256(&self.sealed_header().marshal())
    }

    pub fn full_hash(&self) -> Hash {
        sha256(&self.marshal())
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.sealed_header().marshal();
        out.extend_from_slice(&self.body_bytes());
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let header = EcBlockHeader::read_from(&mut reader)?;
        let mut body = Vec::with_capacity(header.object_count as usize);
        for _ in 0..header.object_count {
            body.push(EcEntry::read_from(&mut reader)?);
        }
        reader.expect_end()?;
        Ok(Self { header, body })
    }

    /// Replays this block's commits and balance increases onto a balance
    /// map; markers are skipped. Used when rebuilding state from storage.
    pub fn apply_to_balances(&self, balances: &mut HashMap<PublicKey, i32>) {
        for entry in &self.body {
            match entry {
                EcEntry::CommitChain {
                    credits,
                    ec_public_key,
                    ..
                }
                | EcEntry::CommitEntry {
                    credits,
                    ec_public_key,
                    ..
                } => {
                    *balances.entry(*ec_public_key).or_insert(0) -= i32::from(*credits);
                }
                EcEntry::IncreaseBalance {
                    ec_public_key,
                    num_ec,
                    ..
                } => {
                    *balances.entry(*ec_public_key).or_insert(0) += *num_ec as i32;
                }
                EcEntry::ServerIndexNumber(_) | EcEntry::MinuteNumber(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn block() -> EcBlock {
        let mut block = EcBlock::new(3, sha256(b"prev header"), sha256(b"prev full"));
        block.add_entry(EcEntry::ServerIndexNumber(0));
        block.add_entry(EcEntry::CommitEntry {
            entry_hash: sha256(b"entry"),
            credits: 2,
            ec_public_key: PublicKey::new([5u8; 32]),
        });
        block.add_entry(EcEntry::MinuteNumber(1));
        block.add_entry(EcEntry::CommitChain {
            chain_id: sha256(b"chain"),
            entry_hash: sha256(b"first entry"),
            credits: 11,
            ec_public_key: PublicKey::new([5u8; 32]),
        });
        block.add_entry(EcEntry::IncreaseBalance {
            ec_public_key: PublicKey::new([6u8; 32]),
            tx_id: sha256(b"tx"),
            index: 1,
            num_ec: 50,
        });
        block.add_entry(EcEntry::MinuteNumber(10));
        block
    }

    #[test]
    fn test_roundtrip() {
        let block = block();
        let decoded = EcBlock::unmarshal(&block.marshal()).unwrap();
        assert_eq!(decoded.body, block.body);
        assert_eq!(decoded.key_mr(), block.key_mr());
        assert_eq!(decoded.header.object_count, 6);
    }

    #[test]
    fn test_apply_to_balances() {
        let mut balances = HashMap::new();
        block().apply_to_balances(&mut balances);
        assert_eq!(balances[&PublicKey::new([5u8; 32])], -13);
        assert_eq!(balances[&PublicKey::new([6u8; 32])], 50);
    }

    #[test]
    fn test_body_hash_commits_body() {
        let block = block();
        let mut other = block.clone();
        other.body.pop();
        assert_ne!(block.key_mr(), other.key_mr());
    }

    #[test]
    fn test_rejects_foreign_chain_id() {
        let mut data = block().marshal();
        data[31] = 0x0b;
        assert!(EcBlock::unmarshal(&data).is_err());
    }
}
