//! Directory block: the top of a height, binding the admin, entry-credit,
//! factoid and entry blocks by `(chain_id, key_mr)` pairs.

use serde::{Deserialize, Serialize};

use crate::block::admin::AdminBlock;
use crate::block::entry::EntryBlock;
use crate::block::entry_credit::EcBlock;
use crate::block::factoid::FactoidBlock;
use crate::block::{ADMIN_CHAIN_ID, EC_CHAIN_ID, FACTOID_CHAIN_ID};
use crate::utilities::codec::{ByteReader, Result};
use crate::utilities::hash::{sha256, Hash};
use crate::utilities::merkle::merkle_root;

pub const DBLOCK_VERSION: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DBlockHeader {
    pub version: u8,
    pub network_id: u32,
    pub body_mr: Hash,
    pub prev_key_mr: Hash,
    pub prev_full_hash: Hash,
    pub timestamp: u32,
    pub dbheight: u32,
    pub block_count: u32,
}

impl DBlockHeader {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(113);
        out.push(self.version);
        out.extend_from_slice(&self.network_id.to_be_bytes());
        out.extend_from_slice(self.body_mr.as_bytes());
        out.extend_from_slice(self.prev_key_mr.as_bytes());
        out.extend_from_slice(self.prev_full_hash.as_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.dbheight.to_be_bytes());
        out.extend_from_slice(&self.block_count.to_be_bytes());
        out
    }

    fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            version: reader.read_u8()?,
            network_id: reader.read_u32()?,
            body_mr: reader.read_hash()?,
            prev_key_mr: reader.read_hash()?,
            prev_full_hash: reader.read_hash()?,
            timestamp: reader.read_u32()?,
            dbheight: reader.read_u32()?,
            block_count: reader.read_u32()?,
        })
    }
}

/// One body row: a referenced block. The block sources are the four block
/// types; only their chain id and key Merkle root are carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct DbEntry {
    pub chain_id: Hash,
    pub key_mr: Hash,
}

impl DbEntry {
    pub fn from_admin_block(block: &AdminBlock) -> Self {
        Self {
            chain_id: ADMIN_CHAIN_ID,
            key_mr: block.key_mr(),
        }
    }

    pub fn from_ec_block(block: &EcBlock) -> Self {
        Self {
            chain_id: EC_CHAIN_ID,
            key_mr: block.key_mr(),
        }
    }

    pub fn from_factoid_block(block: &FactoidBlock) -> Self {
        Self {
            chain_id: FACTOID_CHAIN_ID,
            key_mr: block.key_mr,
        }
    }

    pub fn from_entry_block(block: &EntryBlock) -> Self {
        Self {
            chain_id: block.chain_id(),
            key_mr: block.key_mr(),
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(self.chain_id.as_bytes());
        out.extend_from_slice(self.key_mr.as_bytes());
        out
    }

    fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            chain_id: reader.read_hash()?,
            key_mr: reader.read_hash()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DirectoryBlock {
    pub header: DBlockHeader,
    pub entries: Vec<DbEntry>,
}

impl DirectoryBlock {
    /// Starts the block for `dbheight` chained onto `prev` (`None` only for
    /// the genesis block).
    pub fn new(network_id: u32, dbheight: u32, prev: Option<&DirectoryBlock>) -> Self {
        let (prev_key_mr, prev_full_hash) = match prev {
            Some(prev) => (prev.key_mr(), prev.full_hash()),
            None => (Hash::ZERO, Hash::ZERO),
        };
        Self {
            header: DBlockHeader {
                version: DBLOCK_VERSION,
                network_id,
                body_mr: Hash::ZERO,
                prev_key_mr,
                prev_full_hash,
                timestamp: 0,
                dbheight,
                block_count: 0,
            },
            entries: Vec::new(),
        }
    }

    /// The three mandatory body rows, in their fixed positions.
    pub fn set_system_entries(&mut self, admin: DbEntry, entry_credit: DbEntry, factoid: DbEntry) {
        if self.entries.len() < 3 {
            self.entries.resize(
                3,
                DbEntry {
                    chain_id: Hash::ZERO,
                    key_mr: Hash::ZERO,
                },
            );
        }
        self.entries[0] = admin;
        self.entries[1] = entry_credit;
        self.entries[2] = factoid;
    }

    /// Entry-chain rows follow the system rows; callers append in ascending
    /// chain-id order.
    pub fn add_entry_block(&mut self, entry: DbEntry) {
        self.entries.push(entry);
    }

    pub fn body_mr(&self) -> Hash {
        let leaves: Vec<Hash> = self.entries.iter().map(|e| sha256(&e.marshal())).collect();
        merkle_root(&leaves)
    }

    fn sealed_header(&self) -> DBlockHeader {
        let mut header = self.header.clone();
        header.body_mr = self.body_mr();
        header.block_count = self.entries.len() as u32;
        header
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut out = (self.entries.len() as u32).to_be_bytes().to_vec();
        for entry in &self.entries {
            out.extend_from_slice(&entry.marshal());
        }
        out
    }

    /// Fixes the derived header fields so the in-memory block matches its
    /// serialized form.
    pub fn seal(&mut self) {
        self.header = self.sealed_header();
    }

    /// Canonical identifier of the block.
    pub fn key_mr(&self) -> Hash {
        let header_hash = sha256(&self.sealed_header().marshal());
        merkle_root(&[header_hash, self.body_mr()])
    }

    /// Hash over header and body, used for `prev_full_hash` chaining.
    pub fn full_hash(&self) -> Hash {
        sha256(&self.marshal())
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.sealed_header().marshal();
        out.extend_from_slice(&self.body_bytes());
        out
    }

    /// The header's `block_count` duplicates the body count; the body wins
    /// and the header field is recomputed, so a mismatch is tolerated.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let mut header = DBlockHeader::read_from(&mut reader)?;
        let count = reader.read_u32()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(DbEntry::read_from(&mut reader)?);
        }
        reader.expect_end()?;
        header.block_count = count;
        Ok(Self { header, entries })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The in-memory directory chain: an arena of blocks indexed by height.
/// Children reference parents by hash only.
#[derive(Debug, Default)]
pub struct DChain {
    blocks: Vec<DirectoryBlock>,
}

impl DChain {
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn next_height(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn tip(&self) -> Option<&DirectoryBlock> {
        self.blocks.last()
    }

    pub fn block_by_height(&self, height: u32) -> Option<&DirectoryBlock> {
        self.blocks.get(height as usize)
    }

    pub fn block_by_key_mr(&self, key_mr: &Hash) -> Option<&DirectoryBlock> {
        self.blocks.iter().find(|b| b.key_mr() == *key_mr)
    }

    pub fn push(&mut self, block: DirectoryBlock) -> anyhow::Result<()> {
        if block.header.dbheight != self.next_height() {
            anyhow::bail!(
                "directory block height {} does not extend chain at {}",
                block.header.dbheight,
                self.next_height()
            );
        }
        if let Some(tip) = self.tip() {
            if block.header.prev_key_mr != tip.key_mr() {
                anyhow::bail!("directory block does not chain onto the tip key MR");
            }
        }
        self.blocks.push(block);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn system_block(dbheight: u32, prev: Option<&DirectoryBlock>) -> DirectoryBlock {
        let mut block = DirectoryBlock::new(1, dbheight, prev);
        block.set_system_entries(
            DbEntry {
                chain_id: ADMIN_CHAIN_ID,
                key_mr: sha256(b"admin"),
            },
            DbEntry {
                chain_id: EC_CHAIN_ID,
                key_mr: sha256(b"ec"),
            },
            DbEntry {
                chain_id: FACTOID_CHAIN_ID,
                key_mr: sha256(b"factoid"),
            },
        );
        block.header.timestamp = dbheight * 10;
        block
    }

    #[test]
    fn test_roundtrip() {
        let mut block = system_block(0, None);
        block.add_entry_block(DbEntry {
            chain_id: sha256(b"chain"),
            key_mr: sha256(b"eblock"),
        });
        let decoded = DirectoryBlock::unmarshal(&block.marshal()).unwrap();
        assert_eq!(decoded.entries, block.entries);
        assert_eq!(decoded.key_mr(), block.key_mr());
        assert_eq!(decoded.full_hash(), block.full_hash());
    }

    #[test]
    fn test_block_count_mismatch_tolerated() {
        let block = system_block(0, None);
        let mut data = block.marshal();
        // Corrupt the header's block_count; the body count must win.
        data[109] = 0xff;
        let decoded = DirectoryBlock::unmarshal(&data).unwrap();
        assert_eq!(decoded.header.block_count, 3);
        assert_eq!(decoded.entries.len(), 3);
    }

    #[test]
    fn test_chaining() {
        let genesis = system_block(0, None);
        let next = system_block(1, Some(&genesis));
        assert_eq!(next.header.prev_key_mr, genesis.key_mr());
        assert_eq!(next.header.prev_full_hash, genesis.full_hash());
    }

    #[test]
    fn test_dchain_rejects_gap() {
        let mut chain = DChain::new();
        chain.push(system_block(0, None)).unwrap();
        let skipping = system_block(2, chain.tip());
        assert!(chain.push(skipping).is_err());
    }

    #[test]
    fn test_dchain_lookup() {
        let mut chain = DChain::new();
        chain.push(system_block(0, None)).unwrap();
        let next = system_block(1, chain.tip());
        let key_mr = next.key_mr();
        chain.push(next).unwrap();
        assert_eq!(chain.next_height(), 2);
        assert!(chain.block_by_key_mr(&key_mr).is_some());
        assert_eq!(
            chain.block_by_height(1).map(|b| b.key_mr()),
            Some(key_mr)
        );
    }

    #[test]
    fn test_empty_body_mr_is_hash_of_nothing() {
        let block = DirectoryBlock::new(1, 0, None);
        assert_eq!(block.body_mr(), sha256(&[]));
    }
}
