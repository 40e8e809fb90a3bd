//! Entries and per-chain entry blocks.
//!
//! An entry-block body is a flat list of 32-byte values: entry hashes
//! interleaved with minute-marker sentinels (first 31 bytes zero, last byte
//! 1..=10). Anything else is an entry hash.

use serde::{Deserialize, Serialize};

use crate::utilities::codec::{encode_var_bytes, ByteReader, CodecError, Result};
use crate::utilities::hash::{sha256, Hash};
use crate::utilities::merkle::merkle_root;

/// A user entry: payload bytes bound to a content chain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Entry {
    pub chain_id: Hash,
    pub content: Vec<u8>,
}

impl Entry {
    pub fn new(chain_id: Hash, content: Vec<u8>) -> Self {
        Self { chain_id, content }
    }

    /// The hash commits/reveals are matched on.
    pub fn hash(&self) -> Hash {
        let mut data = self.chain_id.as_bytes().to_vec();
        data.extend_from_slice(&self.content);
        sha256(&data)
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.chain_id.as_bytes().to_vec();
        encode_var_bytes(&mut out, &self.content);
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let entry = Self::read_from(&mut reader)?;
        reader.expect_end()?;
        Ok(entry)
    }

    pub(crate) fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        let chain_id = reader.read_hash()?;
        let content = reader.read_var_bytes()?.to_vec();
        Ok(Self { chain_id, content })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EntryBlockHeader {
    pub chain_id: Hash,
    pub body_mr: Hash,
    pub prev_key_mr: Hash,
    pub prev_full_hash: Hash,
    pub sequence: u32,
    pub dbheight: u32,
    pub entry_count: u32,
}

impl EntryBlockHeader {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(140);
        out.extend_from_slice(self.chain_id.as_bytes());
        out.extend_from_slice(self.body_mr.as_bytes());
        out.extend_from_slice(self.prev_key_mr.as_bytes());
        out.extend_from_slice(self.prev_full_hash.as_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.dbheight.to_be_bytes());
        out.extend_from_slice(&self.entry_count.to_be_bytes());
        out
    }

    fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            chain_id: reader.read_hash()?,
            body_mr: reader.read_hash()?,
            prev_key_mr: reader.read_hash()?,
            prev_full_hash: reader.read_hash()?,
            sequence: reader.read_u32()?,
            dbheight: reader.read_u32()?,
            entry_count: reader.read_u32()?,
        })
    }
}

/// One entry block per content chain touched at a height.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EntryBlock {
    pub header: EntryBlockHeader,
    pub body: Vec<Hash>,
    /// Entries added since the last minute marker.
    #[serde(skip)]
    dirty: bool,
}

impl EntryBlock {
    pub fn new(
        chain_id: Hash,
        dbheight: u32,
        sequence: u32,
        prev_key_mr: Hash,
        prev_full_hash: Hash,
    ) -> Self {
        Self {
            header: EntryBlockHeader {
                chain_id,
                body_mr: Hash::ZERO,
                prev_key_mr,
                prev_full_hash,
                sequence,
                dbheight,
                entry_count: 0,
            },
            body: Vec::new(),
            dirty: false,
        }
    }

    pub fn chain_id(&self) -> Hash {
        self.header.chain_id
    }

    pub fn add_entry(&mut self, entry_hash: Hash) {
        self.body.push(entry_hash);
        self.dirty = true;
    }

    /// Closes minute `minute` for this chain. A marker lands only when the
    /// chain saw entries since the previous marker, or at the final minute.
    pub fn close_minute(&mut self, minute: u8) {
        if self.dirty || minute == 9 {
            self.body.push(Hash::minute_marker(minute));
            self.dirty = false;
        }
    }

    pub fn body_mr(&self) -> Hash {
        merkle_root(&self.body)
    }

    fn sealed_header(&self) -> EntryBlockHeader {
        let mut header = self.header.clone();
        header.body_mr = self.body_mr();
        header.entry_count = self.body.len() as u32;
        header
    }

    /// Fixes the derived header fields so the in-memory block matches its
    /// serialized form.
    pub fn seal(&mut self) {
        self.header = self.sealed_header();
        self.dirty = false;
    }

    pub fn key_mr(&self) -> Hash {
        let header_hash = sha256(&self.sealed_header().marshal());
        merkle_root(&[header_hash, self.body_mr()])
    }

    pub fn full_hash(&self) -> Hash {
        sha256(&self.marshal())
    }

    /// The entry hashes in the body, markers skipped.
    pub fn entry_hashes(&self) -> Vec<Hash> {
        self.body
            .iter()
            .filter(|h| h.as_minute_marker().is_none())
            .copied()
            .collect()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.sealed_header().marshal();
        for value in &self.body {
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let header = EntryBlockHeader::read_from(&mut reader)?;
        let mut body = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            body.push(reader.read_hash()?);
        }
        reader.expect_end()?;
        let block = Self {
            header,
            body,
            dirty: false,
        };
        if block.header.body_mr != block.body_mr() {
            return Err(CodecError::OutOfRange("entry block body merkle root"));
        }
        Ok(block)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry() -> Entry {
        Entry::new(sha256(b"a chain"), vec![1, 2, 3, 4])
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = entry();
        assert_eq!(Entry::unmarshal(&entry.marshal()).unwrap(), entry);
    }

    #[test]
    fn test_entry_hash_covers_chain_and_content() {
        let entry = entry();
        let other = Entry::new(sha256(b"another chain"), entry.content.clone());
        assert_ne!(entry.hash(), other.hash());
    }

    #[test]
    fn test_block_roundtrip() {
        let mut block = EntryBlock::new(sha256(b"chain"), 4, 1, sha256(b"prev"), sha256(b"full"));
        block.add_entry(sha256(b"e1"));
        block.close_minute(2);
        block.add_entry(sha256(b"e2"));
        block.close_minute(9);

        let decoded = EntryBlock::unmarshal(&block.marshal()).unwrap();
        assert_eq!(decoded.body, block.body);
        assert_eq!(decoded.key_mr(), block.key_mr());
    }

    #[test]
    fn test_minute_markers_only_when_dirty() {
        let mut block = EntryBlock::new(sha256(b"chain"), 4, 0, Hash::ZERO, Hash::ZERO);
        block.add_entry(sha256(b"e1"));
        block.close_minute(3);
        block.close_minute(4);
        block.close_minute(9);

        assert_eq!(
            block.body,
            vec![
                sha256(b"e1"),
                Hash::minute_marker(3),
                Hash::minute_marker(9),
            ]
        );
    }

    #[test]
    fn test_entry_hashes_skip_markers() {
        let mut block = EntryBlock::new(sha256(b"chain"), 4, 0, Hash::ZERO, Hash::ZERO);
        block.add_entry(sha256(b"e1"));
        block.close_minute(0);
        block.add_entry(sha256(b"e2"));
        block.close_minute(9);
        assert_eq!(block.entry_hashes(), vec![sha256(b"e1"), sha256(b"e2")]);
    }

    #[test]
    fn test_key_mr_depends_on_body() {
        let mut a = EntryBlock::new(sha256(b"chain"), 4, 0, Hash::ZERO, Hash::ZERO);
        let mut b = a.clone();
        a.add_entry(sha256(b"e1"));
        b.add_entry(sha256(b"e2"));
        assert_ne!(a.key_mr(), b.key_mr());
    }
}
