//! Peer-to-peer recovery: requests for missing process-list slots or data,
//! their responses, and whole-height block transfers.

use crate::block::admin::AdminBlock;
use crate::block::directory::DirectoryBlock;
use crate::block::entry::{Entry, EntryBlock};
use crate::block::entry_credit::EcBlock;
use crate::block::factoid::FactoidBlock;
use crate::message::ack::Ack;
use crate::message::{
    read_prefix, write_prefix, Message, Validity, DATA_RESPONSE_MSG, DB_STATE_MSG, MISSING_DATA_MSG,
    MISSING_MSG,
};
use crate::utilities::codec::{encode_var_bytes, CodecError, Result};
use crate::utilities::hash::Hash;

/// Request for a process-list slot that has stayed nil too long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingMsg {
    pub timestamp: u64,
    pub dbheight: u32,
    pub vm_index: u8,
    pub height_in_vm: u32,
}

impl MissingMsg {
    pub fn new(timestamp: u64, dbheight: u32, vm_index: u8, height_in_vm: u32) -> Self {
        Self {
            timestamp,
            dbheight,
            vm_index,
            height_in_vm,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18);
        write_prefix(&mut out, MISSING_MSG, self.timestamp);
        out.extend_from_slice(&self.dbheight.to_be_bytes());
        out.push(self.vm_index);
        out.extend_from_slice(&self.height_in_vm.to_be_bytes());
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (mut reader, timestamp) = read_prefix(data, MISSING_MSG)?;
        let dbheight = reader.read_u32()?;
        let vm_index = reader.read_u8()?;
        let height_in_vm = reader.read_u32()?;
        reader.expect_end()?;
        Ok(Self {
            timestamp,
            dbheight,
            vm_index,
            height_in_vm,
        })
    }
}

/// Request for an entry or entry block by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingData {
    pub timestamp: u64,
    pub data_hash: Hash,
}

impl MissingData {
    pub fn new(timestamp: u64, data_hash: Hash) -> Self {
        Self {
            timestamp,
            data_hash,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(41);
        write_prefix(&mut out, MISSING_DATA_MSG, self.timestamp);
        out.extend_from_slice(self.data_hash.as_bytes());
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (mut reader, timestamp) = read_prefix(data, MISSING_DATA_MSG)?;
        let data_hash = reader.read_hash()?;
        reader.expect_end()?;
        Ok(Self {
            timestamp,
            data_hash,
        })
    }
}

const DATA_TYPE_ENTRY: u8 = 0;
const DATA_TYPE_ENTRY_BLOCK: u8 = 1;
const DATA_TYPE_PROCESS_SLOT: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    Entry(Entry),
    EntryBlock(EntryBlock),
    /// A replayed process-list slot, re-entering through the follower path.
    ProcessSlot {
        dbheight: u32,
        vm_index: u8,
        height_in_vm: u32,
        ack: Ack,
        message: Box<Message>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataResponse {
    pub timestamp: u64,
    pub data_hash: Hash,
    pub data: ResponseData,
}

impl DataResponse {
    pub fn for_entry(timestamp: u64, entry: Entry) -> Self {
        Self {
            timestamp,
            data_hash: entry.hash(),
            data: ResponseData::Entry(entry),
        }
    }

    pub fn for_entry_block(timestamp: u64, block: EntryBlock) -> Self {
        Self {
            timestamp,
            data_hash: block.key_mr(),
            data: ResponseData::EntryBlock(block),
        }
    }

    pub fn for_process_slot(
        timestamp: u64,
        dbheight: u32,
        vm_index: u8,
        height_in_vm: u32,
        ack: Ack,
        message: Message,
    ) -> Self {
        Self {
            timestamp,
            data_hash: message.msg_hash(),
            data: ResponseData::ProcessSlot {
                dbheight,
                vm_index,
                height_in_vm,
                ack,
                message: Box::new(message),
            },
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_prefix(&mut out, DATA_RESPONSE_MSG, self.timestamp);
        match &self.data {
            ResponseData::Entry(entry) => {
                out.push(DATA_TYPE_ENTRY);
                out.extend_from_slice(self.data_hash.as_bytes());
                encode_var_bytes(&mut out, &entry.marshal());
            }
            ResponseData::EntryBlock(block) => {
                out.push(DATA_TYPE_ENTRY_BLOCK);
                out.extend_from_slice(self.data_hash.as_bytes());
                encode_var_bytes(&mut out, &block.marshal());
            }
            ResponseData::ProcessSlot {
                dbheight,
                vm_index,
                height_in_vm,
                ack,
                message,
            } => {
                out.push(DATA_TYPE_PROCESS_SLOT);
                out.extend_from_slice(self.data_hash.as_bytes());
                out.extend_from_slice(&dbheight.to_be_bytes());
                out.push(*vm_index);
                out.extend_from_slice(&height_in_vm.to_be_bytes());
                encode_var_bytes(&mut out, &ack.marshal());
                encode_var_bytes(&mut out, &message.marshal());
            }
        }
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (mut reader, timestamp) = read_prefix(data, DATA_RESPONSE_MSG)?;
        let data_type = reader.read_u8()?;
        let data_hash = reader.read_hash()?;
        let data = match data_type {
            DATA_TYPE_ENTRY => {
                let bytes = reader.read_var_bytes()?;
                ResponseData::Entry(Entry::unmarshal(bytes)?)
            }
            DATA_TYPE_ENTRY_BLOCK => {
                let bytes = reader.read_var_bytes()?;
                ResponseData::EntryBlock(EntryBlock::unmarshal(bytes)?)
            }
            DATA_TYPE_PROCESS_SLOT => {
                let dbheight = reader.read_u32()?;
                let vm_index = reader.read_u8()?;
                let height_in_vm = reader.read_u32()?;
                let ack_bytes = reader.read_var_bytes()?;
                let msg_bytes = reader.read_var_bytes()?;
                ResponseData::ProcessSlot {
                    dbheight,
                    vm_index,
                    height_in_vm,
                    ack: Ack::unmarshal(ack_bytes)?,
                    message: Box::new(Message::unmarshal(msg_bytes)?),
                }
            }
            other => return Err(CodecError::UnknownTag(other)),
        };
        reader.expect_end()?;
        Ok(Self {
            timestamp,
            data_hash,
            data,
        })
    }

    /// A response whose payload does not hash to its claimed identity is
    /// discarded outright.
    pub fn validate(&self) -> Validity {
        let actual = match &self.data {
            ResponseData::Entry(entry) => entry.hash(),
            ResponseData::EntryBlock(block) => block.key_mr(),
            ResponseData::ProcessSlot { message, .. } => message.msg_hash(),
        };
        if actual == self.data_hash {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}

/// A complete block set for one height, answering a predecessor gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbState {
    pub timestamp: u64,
    pub directory_block: DirectoryBlock,
    pub admin_block: AdminBlock,
    pub ec_block: EcBlock,
    pub factoid_block: FactoidBlock,
    pub entry_blocks: Vec<EntryBlock>,
    pub entries: Vec<Entry>,
}

impl DbState {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_prefix(&mut out, DB_STATE_MSG, self.timestamp);
        encode_var_bytes(&mut out, &self.directory_block.marshal());
        encode_var_bytes(&mut out, &self.admin_block.marshal());
        encode_var_bytes(&mut out, &self.ec_block.marshal());
        encode_var_bytes(&mut out, &self.factoid_block.marshal());
        out.extend_from_slice(&(self.entry_blocks.len() as u32).to_be_bytes());
        for block in &self.entry_blocks {
            encode_var_bytes(&mut out, &block.marshal());
        }
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for entry in &self.entries {
            encode_var_bytes(&mut out, &entry.marshal());
        }
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (mut reader, timestamp) = read_prefix(data, DB_STATE_MSG)?;
        let directory_block = DirectoryBlock::unmarshal(reader.read_var_bytes()?)?;
        let admin_block = AdminBlock::unmarshal(reader.read_var_bytes()?)?;
        let ec_block = EcBlock::unmarshal(reader.read_var_bytes()?)?;
        let factoid_block = FactoidBlock::unmarshal(reader.read_var_bytes()?)?;
        let eblock_count = reader.read_u32()?;
        let mut entry_blocks = Vec::with_capacity(eblock_count as usize);
        for _ in 0..eblock_count {
            entry_blocks.push(EntryBlock::unmarshal(reader.read_var_bytes()?)?);
        }
        let entry_count = reader.read_u32()?;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            entries.push(Entry::unmarshal(reader.read_var_bytes()?)?);
        }
        reader.expect_end()?;
        Ok(Self {
            timestamp,
            directory_block,
            admin_block,
            ec_block,
            factoid_block,
            entry_blocks,
            entries,
        })
    }

    /// The directory block's body must reference exactly the blocks carried.
    pub fn validate(&self) -> Validity {
        let entries = &self.directory_block.entries;
        if entries.len() < 3 {
            return Validity::Invalid;
        }
        if entries[0].key_mr != self.admin_block.key_mr()
            || entries[1].key_mr != self.ec_block.key_mr()
            || entries[2].key_mr != self.factoid_block.key_mr
        {
            return Validity::Invalid;
        }
        for (slot, block) in entries[3..].iter().zip(self.entry_blocks.iter()) {
            if slot.chain_id != block.chain_id() || slot.key_mr != block.key_mr() {
                return Validity::Invalid;
            }
        }
        if entries.len() - 3 != self.entry_blocks.len() {
            return Validity::Invalid;
        }
        Validity::Valid
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::directory::DbEntry;
    use crate::block::{ADMIN_CHAIN_ID, EC_CHAIN_ID, FACTOID_CHAIN_ID};
    use crate::utilities::hash::sha256;

    fn db_state() -> DbState {
        let mut admin_block = AdminBlock::new(0, Hash::ZERO);
        admin_block.seal();
        let mut ec_block = EcBlock::new(0, Hash::ZERO, Hash::ZERO);
        ec_block.seal();
        let factoid_block = FactoidBlock {
            key_mr: sha256(b"f"),
            dbheight: 0,
            exchange_rate: 1,
            tx_ids: vec![],
        };
        let mut directory_block = DirectoryBlock::new(1, 0, None);
        directory_block.set_system_entries(
            DbEntry {
                chain_id: ADMIN_CHAIN_ID,
                key_mr: admin_block.key_mr(),
            },
            DbEntry {
                chain_id: EC_CHAIN_ID,
                key_mr: ec_block.key_mr(),
            },
            DbEntry {
                chain_id: FACTOID_CHAIN_ID,
                key_mr: factoid_block.key_mr,
            },
        );
        directory_block.seal();
        DbState {
            timestamp: 12,
            directory_block,
            admin_block,
            ec_block,
            factoid_block,
            entry_blocks: vec![],
            entries: vec![],
        }
    }

    #[test]
    fn test_roundtrip() {
        let state = db_state();
        assert_eq!(DbState::unmarshal(&state.marshal()).unwrap(), state);
    }

    #[test]
    fn test_validate_consistent_set() {
        assert_eq!(db_state().validate(), Validity::Valid);
    }

    #[test]
    fn test_validate_rejects_mismatched_admin() {
        let mut state = db_state();
        state.admin_block.add_entry(crate::block::admin::AdminEntry::MinuteNumber(1));
        assert_eq!(state.validate(), Validity::Invalid);
    }

    #[test]
    fn test_data_response_hash_check() {
        let entry = Entry::new(sha256(b"chain"), vec![1, 2]);
        let mut response = DataResponse::for_entry(7, entry);
        assert_eq!(response.validate(), Validity::Valid);
        response.data_hash = sha256(b"wrong");
        assert_eq!(response.validate(), Validity::Invalid);
    }

    #[test]
    fn test_process_slot_roundtrip() {
        let keypair = crate::utilities::crypto::Keypair::from_seed([6u8; 32]);
        let message = Message::MissingData(MissingData::new(1, sha256(b"x")));
        let mut ack = Ack::new(1, sha256(b"leader"), 4, 0, 0, 0, message.msg_hash(), None);
        ack.sign(&keypair);
        let response = DataResponse::for_process_slot(2, 4, 0, 0, ack, message);
        let decoded = DataResponse::unmarshal(&response.marshal()).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.validate(), Validity::Valid);
    }
}
