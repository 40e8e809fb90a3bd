//! Admin block: server-set changes, key rotations and minute markers.

use serde::{Deserialize, Serialize};

use crate::block::ADMIN_CHAIN_ID;
use crate::utilities::codec::{ByteReader, CodecError, Result};
use crate::utilities::crypto::PublicKey;
use crate::utilities::hash::{sha256, Hash};
use crate::utilities::merkle::merkle_root;

const ENTRY_MINUTE_NUMBER: u8 = 0x00;
const ENTRY_ADD_FEDERATED: u8 = 0x01;
const ENTRY_REMOVE_FEDERATED: u8 = 0x02;
const ENTRY_ADD_AUDIT: u8 = 0x03;
const ENTRY_KEY_ROTATION: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum AdminEntry {
    MinuteNumber(u8),
    AddFederatedServer { chain_id: Hash },
    RemoveFederatedServer { chain_id: Hash },
    AddAuditServer { chain_id: Hash },
    KeyRotation { chain_id: Hash, public_key: PublicKey },
}

impl AdminEntry {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(66);
        match self {
            AdminEntry::MinuteNumber(minute) => {
                out.push(ENTRY_MINUTE_NUMBER);
                out.push(*minute);
            }
            AdminEntry::AddFederatedServer { chain_id } => {
                out.push(ENTRY_ADD_FEDERATED);
                out.extend_from_slice(chain_id.as_bytes());
            }
            AdminEntry::RemoveFederatedServer { chain_id } => {
                out.push(ENTRY_REMOVE_FEDERATED);
                out.extend_from_slice(chain_id.as_bytes());
            }
            AdminEntry::AddAuditServer { chain_id } => {
                out.push(ENTRY_ADD_AUDIT);
                out.extend_from_slice(chain_id.as_bytes());
            }
            AdminEntry::KeyRotation {
                chain_id,
                public_key,
            } => {
                out.push(ENTRY_KEY_ROTATION);
                out.extend_from_slice(chain_id.as_bytes());
                out.extend_from_slice(public_key.as_bytes());
            }
        }
        out
    }

    fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        let tag = reader.read_u8()?;
        match tag {
            ENTRY_MINUTE_NUMBER => Ok(AdminEntry::MinuteNumber(reader.read_u8()?)),
            ENTRY_ADD_FEDERATED => Ok(AdminEntry::AddFederatedServer {
                chain_id: reader.read_hash()?,
            }),
            ENTRY_REMOVE_FEDERATED => Ok(AdminEntry::RemoveFederatedServer {
                chain_id: reader.read_hash()?,
            }),
            ENTRY_ADD_AUDIT => Ok(AdminEntry::AddAuditServer {
                chain_id: reader.read_hash()?,
            }),
            ENTRY_KEY_ROTATION => {
                let chain_id = reader.read_hash()?;
                let key_bytes = reader.read_bytes(32)?;
                let public_key = PublicKey::from_slice(key_bytes)
                    .map_err(|_| CodecError::OutOfRange("admin entry public key"))?;
                Ok(AdminEntry::KeyRotation {
                    chain_id,
                    public_key,
                })
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AdminBlockHeader {
    pub chain_id: Hash,
    pub prev_lookup_hash: Hash,
    pub dbheight: u32,
    pub entry_count: u32,
}

impl AdminBlockHeader {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(72);
        out.extend_from_slice(self.chain_id.as_bytes());
        out.extend_from_slice(self.prev_lookup_hash.as_bytes());
        out.extend_from_slice(&self.dbheight.to_be_bytes());
        out.extend_from_slice(&self.entry_count.to_be_bytes());
        out
    }

    fn read_from(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            chain_id: reader.read_hash()?,
            prev_lookup_hash: reader.read_hash()?,
            dbheight: reader.read_u32()?,
            entry_count: reader.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AdminBlock {
    pub header: AdminBlockHeader,
    pub entries: Vec<AdminEntry>,
}

impl AdminBlock {
    pub fn new(dbheight: u32, prev_lookup_hash: Hash) -> Self {
        Self {
            header: AdminBlockHeader {
                chain_id: ADMIN_CHAIN_ID,
                prev_lookup_hash,
                dbheight,
                entry_count: 0,
            },
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry: AdminEntry) {
        self.entries.push(entry);
    }

    /// Merkle root over the serialized entries in insertion order; this is
    /// the value the directory block references.
    pub fn key_mr(&self) -> Hash {
        let leaves: Vec<Hash> = self.entries.iter().map(|e| sha256(&e.marshal())).collect();
        merkle_root(&leaves)
    }

    /// Hash of the whole serialized block, chained through heights.
    pub fn lookup_hash(&self) -> Hash {
        sha256(&self.marshal())
    }

    /// Fixes the derived entry count so the in-memory block matches its
    /// serialized form.
    pub fn seal(&mut self) {
        self.header.entry_count = self.entries.len() as u32;
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut header = self.header.clone();
        header.entry_count = self.entries.len() as u32;
        let mut out = header.marshal();
        for entry in &self.entries {
            out.extend_from_slice(&entry.marshal());
        }
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let header = AdminBlockHeader::read_from(&mut reader)?;
        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            entries.push(AdminEntry::read_from(&mut reader)?);
        }
        reader.expect_end()?;
        Ok(Self { header, entries })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut block = AdminBlock::new(7, sha256(b"prev"));
        block.add_entry(AdminEntry::AddFederatedServer {
            chain_id: sha256(b"server"),
        });
        block.add_entry(AdminEntry::MinuteNumber(1));
        block.add_entry(AdminEntry::KeyRotation {
            chain_id: sha256(b"server"),
            public_key: PublicKey::new([3u8; 32]),
        });
        block.add_entry(AdminEntry::RemoveFederatedServer {
            chain_id: sha256(b"gone"),
        });

        let decoded = AdminBlock::unmarshal(&block.marshal()).unwrap();
        assert_eq!(decoded, {
            let mut expected = block.clone();
            expected.header.entry_count = 4;
            expected
        });
        assert_eq!(decoded.key_mr(), block.key_mr());
    }

    #[test]
    fn test_key_mr_is_insertion_order_sensitive() {
        let mut a = AdminBlock::new(7, Hash::ZERO);
        a.add_entry(AdminEntry::MinuteNumber(1));
        a.add_entry(AdminEntry::MinuteNumber(2));

        let mut b = AdminBlock::new(7, Hash::ZERO);
        b.add_entry(AdminEntry::MinuteNumber(2));
        b.add_entry(AdminEntry::MinuteNumber(1));

        assert_ne!(a.key_mr(), b.key_mr());
    }

    #[test]
    fn test_unknown_entry_tag() {
        let mut block = AdminBlock::new(1, Hash::ZERO);
        block.add_entry(AdminEntry::MinuteNumber(1));
        let mut data = block.marshal();
        let header_len = block.header.marshal().len();
        data[header_len] = 0x77;
        assert!(matches!(
            AdminBlock::unmarshal(&data),
            Err(CodecError::UnknownTag(0x77))
        ));
    }
}
