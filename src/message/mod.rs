//! The tagged message layer.
//!
//! Every wire message starts with a one-byte type tag and an 8-byte
//! big-endian millisecond timestamp; signed variants end with a trailing
//! `public_key(32) ‖ signature(64)`. `marshal_for_signature` covers
//! everything before that trailer, and `MsgHash` is SHA-256 over it.

pub mod ack;
pub mod commit;
pub mod dbsig;
pub mod eom;
pub mod factoid;
pub mod recovery;
pub mod reveal;
pub mod server;

use std::fmt::Display;

use crate::utilities::codec::{ByteReader, CodecError, Result};
use crate::utilities::crypto::{Keypair, PublicKey};
use crate::utilities::hash::{sha256, Hash};

pub use ack::{serial_hash, Ack};
pub use commit::{CommitChain, CommitEntry};
pub use dbsig::DirectoryBlockSignature;
pub use eom::Eom;
pub use factoid::FactoidTransaction;
pub use recovery::{DataResponse, DbState, MissingData, MissingMsg, ResponseData};
pub use reveal::RevealEntry;
pub use server::{AddServer, RemoveServer, ServerType};

pub const EOM_MSG: u8 = 0x01;
pub const ACK_MSG: u8 = 0x02;
pub const COMMIT_CHAIN_MSG: u8 = 0x03;
pub const COMMIT_ENTRY_MSG: u8 = 0x04;
pub const REVEAL_ENTRY_MSG: u8 = 0x05;
pub const FACTOID_TX_MSG: u8 = 0x06;
pub const DB_SIGNATURE_MSG: u8 = 0x07;
pub const SERVER_ADJUST_MSG: u8 = 0x08;
pub const MISSING_MSG: u8 = 0x09;
pub const MISSING_DATA_MSG: u8 = 0x0a;
pub const DATA_RESPONSE_MSG: u8 = 0x0b;
pub const DB_STATE_MSG: u8 = 0x0c;

/// Three-way validation result. `Undetermined` means a dependency is not
/// known yet; it must never be folded into accept or reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Invalid,
    Undetermined,
    Valid,
}

/// What a message needs to know about the node to judge itself.
pub trait ValidationState {
    /// Height of the process list under construction.
    fn dbheight(&self) -> u32;
    fn is_federated(&self, chain_id: &Hash) -> bool;
    fn federated_key(&self, chain_id: &Hash) -> Option<PublicKey>;
    /// Chain id of the federated server owning `(minute, vm_index)`.
    fn vm_owner(&self, minute: u8, vm_index: usize) -> Option<Hash>;
    /// Key authorized to add or remove servers, when configured.
    fn authority_key(&self) -> Option<PublicKey>;
    fn has_commit(&self, entry_hash: &Hash) -> bool;
    /// Key MR of the previous height's directory block, once known.
    fn prev_key_mr(&self) -> Option<Hash>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Eom(Eom),
    Ack(Ack),
    CommitChain(CommitChain),
    CommitEntry(CommitEntry),
    RevealEntry(RevealEntry),
    FactoidTransaction(FactoidTransaction),
    DirectoryBlockSignature(DirectoryBlockSignature),
    AddServer(AddServer),
    RemoveServer(RemoveServer),
    MissingMsg(MissingMsg),
    MissingData(MissingData),
    DataResponse(DataResponse),
    DbState(Box<DbState>),
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Eom(_) => EOM_MSG,
            Message::Ack(_) => ACK_MSG,
            Message::CommitChain(_) => COMMIT_CHAIN_MSG,
            Message::CommitEntry(_) => COMMIT_ENTRY_MSG,
            Message::RevealEntry(_) => REVEAL_ENTRY_MSG,
            Message::FactoidTransaction(_) => FACTOID_TX_MSG,
            Message::DirectoryBlockSignature(_) => DB_SIGNATURE_MSG,
            Message::AddServer(_) | Message::RemoveServer(_) => SERVER_ADJUST_MSG,
            Message::MissingMsg(_) => MISSING_MSG,
            Message::MissingData(_) => MISSING_DATA_MSG,
            Message::DataResponse(_) => DATA_RESPONSE_MSG,
            Message::DbState(_) => DB_STATE_MSG,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Eom(_) => "EOM",
            Message::Ack(_) => "Ack",
            Message::CommitChain(_) => "CommitChain",
            Message::CommitEntry(_) => "CommitEntry",
            Message::RevealEntry(_) => "RevealEntry",
            Message::FactoidTransaction(_) => "FactoidTx",
            Message::DirectoryBlockSignature(_) => "DBSig",
            Message::AddServer(_) => "AddServer",
            Message::RemoveServer(_) => "RemoveServer",
            Message::MissingMsg(_) => "MissingMsg",
            Message::MissingData(_) => "MissingData",
            Message::DataResponse(_) => "DataResponse",
            Message::DbState(_) => "DBState",
        }
    }

    /// The directory-block height a message is pinned to, when it carries
    /// one.
    pub fn dbheight(&self) -> Option<u32> {
        match self {
            Message::Eom(m) => Some(m.dbheight),
            Message::Ack(m) => Some(m.dbheight),
            Message::DirectoryBlockSignature(m) => Some(m.dbheight),
            Message::MissingMsg(m) => Some(m.dbheight),
            Message::DbState(m) => Some(m.directory_block.header.dbheight),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Message::Eom(m) => m.timestamp,
            Message::Ack(m) => m.timestamp,
            Message::CommitChain(m) => m.timestamp,
            Message::CommitEntry(m) => m.timestamp,
            Message::RevealEntry(m) => m.timestamp,
            Message::FactoidTransaction(m) => m.timestamp,
            Message::DirectoryBlockSignature(m) => m.timestamp,
            Message::AddServer(m) => m.timestamp,
            Message::RemoveServer(m) => m.timestamp,
            Message::MissingMsg(m) => m.timestamp,
            Message::MissingData(m) => m.timestamp,
            Message::DataResponse(m) => m.timestamp,
            Message::DbState(m) => m.timestamp,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        match self {
            Message::Eom(m) => m.marshal(),
            Message::Ack(m) => m.marshal(),
            Message::CommitChain(m) => m.marshal(),
            Message::CommitEntry(m) => m.marshal(),
            Message::RevealEntry(m) => m.marshal(),
            Message::FactoidTransaction(m) => m.marshal(),
            Message::DirectoryBlockSignature(m) => m.marshal(),
            Message::AddServer(m) => m.marshal(),
            Message::RemoveServer(m) => m.marshal(),
            Message::MissingMsg(m) => m.marshal(),
            Message::MissingData(m) => m.marshal(),
            Message::DataResponse(m) => m.marshal(),
            Message::DbState(m) => m.marshal(),
        }
    }

    /// Everything `marshal` writes except the trailing signature. For
    /// unsigned variants this equals `marshal`.
    pub fn marshal_for_signature(&self) -> Vec<u8> {
        match self {
            Message::Eom(m) => m.marshal_for_signature(),
            Message::Ack(m) => m.marshal_for_signature(),
            Message::CommitChain(m) => m.marshal_for_signature(),
            Message::CommitEntry(m) => m.marshal_for_signature(),
            Message::FactoidTransaction(m) => m.marshal_for_signature(),
            Message::DirectoryBlockSignature(m) => m.marshal_for_signature(),
            Message::AddServer(m) => m.marshal_for_signature(),
            Message::RemoveServer(m) => m.marshal_for_signature(),
            Message::RevealEntry(_)
            | Message::MissingMsg(_)
            | Message::MissingData(_)
            | Message::DataResponse(_)
            | Message::DbState(_) => self.marshal(),
        }
    }

    /// Stable identity of the message, independent of whether the signature
    /// has been attached yet.
    pub fn msg_hash(&self) -> Hash {
        sha256(&self.marshal_for_signature())
    }

    pub fn unmarshal(data: &[u8]) -> Result<Message> {
        let tag = *data.first().ok_or(CodecError::UnexpectedEof(0))?;
        match tag {
            EOM_MSG => Ok(Message::Eom(Eom::unmarshal(data)?)),
            ACK_MSG => Ok(Message::Ack(Ack::unmarshal(data)?)),
            COMMIT_CHAIN_MSG => Ok(Message::CommitChain(CommitChain::unmarshal(data)?)),
            COMMIT_ENTRY_MSG => Ok(Message::CommitEntry(CommitEntry::unmarshal(data)?)),
            REVEAL_ENTRY_MSG => Ok(Message::RevealEntry(RevealEntry::unmarshal(data)?)),
            FACTOID_TX_MSG => Ok(Message::FactoidTransaction(FactoidTransaction::unmarshal(
                data,
            )?)),
            DB_SIGNATURE_MSG => Ok(Message::DirectoryBlockSignature(
                DirectoryBlockSignature::unmarshal(data)?,
            )),
            SERVER_ADJUST_MSG => server::unmarshal_adjustment(data),
            MISSING_MSG => Ok(Message::MissingMsg(MissingMsg::unmarshal(data)?)),
            MISSING_DATA_MSG => Ok(Message::MissingData(MissingData::unmarshal(data)?)),
            DATA_RESPONSE_MSG => Ok(Message::DataResponse(DataResponse::unmarshal(data)?)),
            DB_STATE_MSG => Ok(Message::DbState(Box::new(DbState::unmarshal(data)?))),
            other => Err(CodecError::UnknownTag(other)),
        }
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        match self {
            Message::Eom(m) => m.sign(keypair),
            Message::Ack(m) => m.sign(keypair),
            Message::CommitChain(m) => m.sign(keypair),
            Message::CommitEntry(m) => m.sign(keypair),
            Message::FactoidTransaction(m) => m.sign(keypair),
            Message::DirectoryBlockSignature(m) => m.sign(keypair),
            Message::AddServer(m) => m.sign(keypair),
            Message::RemoveServer(m) => m.sign(keypair),
            Message::RevealEntry(_)
            | Message::MissingMsg(_)
            | Message::MissingData(_)
            | Message::DataResponse(_)
            | Message::DbState(_) => {}
        }
    }

    /// Signature check alone. Unsigned variants verify trivially.
    pub fn verify(&self) -> bool {
        match self {
            Message::Eom(m) => m.verify(),
            Message::Ack(m) => m.verify(),
            Message::CommitChain(m) => m.verify(),
            Message::CommitEntry(m) => m.verify(),
            Message::FactoidTransaction(m) => m.verify(),
            Message::DirectoryBlockSignature(m) => m.verify(),
            Message::AddServer(m) => m.verify(),
            Message::RemoveServer(m) => m.verify(),
            Message::RevealEntry(_)
            | Message::MissingMsg(_)
            | Message::MissingData(_)
            | Message::DataResponse(_)
            | Message::DbState(_) => true,
        }
    }

    pub fn validate(&self, state: &dyn ValidationState) -> Validity {
        match self {
            Message::Eom(m) => m.validate(state),
            Message::Ack(m) => m.validate(state),
            Message::CommitChain(m) => m.validate(state),
            Message::CommitEntry(m) => m.validate(state),
            Message::RevealEntry(m) => m.validate(state),
            Message::FactoidTransaction(m) => m.validate(state),
            Message::DirectoryBlockSignature(m) => m.validate(state),
            Message::AddServer(m) => m.validate(state),
            Message::RemoveServer(m) => m.validate(state),
            Message::MissingMsg(_) | Message::MissingData(_) => Validity::Valid,
            Message::DataResponse(m) => m.validate(),
            Message::DbState(m) => m.validate(),
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Eom(m) => write!(
                f,
                "{:>12} dbht:{:5} vm:{:3} min:{}",
                self.name(),
                m.dbheight,
                m.vm_index,
                m.minute
            ),
            Message::Ack(m) => write!(
                f,
                "{:>12} dbht:{:5} vm:{:3} ht:{:5} hash:{}",
                self.name(),
                m.dbheight,
                m.vm_index,
                m.height_in_vm,
                m.message_hash
            ),
            Message::MissingMsg(m) => write!(
                f,
                "{:>12} dbht:{:5} vm:{:3} ht:{:5}",
                self.name(),
                m.dbheight,
                m.vm_index,
                m.height_in_vm
            ),
            _ => write!(f, "{:>12} hash:{}", self.name(), self.msg_hash()),
        }
    }
}

/// Shared helpers for reading the common prefix and the optional trailer.
pub(crate) fn read_prefix(data: &[u8], expected_tag: u8) -> Result<(ByteReader<'_>, u64)> {
    let mut reader = ByteReader::new(data);
    let tag = reader.read_u8()?;
    if tag != expected_tag {
        return Err(CodecError::WrongTag {
            expected: expected_tag,
            found: tag,
        });
    }
    let timestamp = reader.read_u64()?;
    Ok((reader, timestamp))
}

pub(crate) fn write_prefix(out: &mut Vec<u8>, tag: u8, timestamp: u64) {
    out.push(tag);
    out.extend_from_slice(&timestamp.to_be_bytes());
}

pub(crate) fn read_optional_signature(
    reader: &mut ByteReader<'_>,
) -> Result<Option<crate::utilities::crypto::FullSignature>> {
    if reader.is_empty() {
        return Ok(None);
    }
    let signature = crate::utilities::crypto::FullSignature::unmarshal(reader)?;
    reader.expect_end()?;
    Ok(Some(signature))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::entry::Entry;
    use crate::utilities::time::now_ms;

    fn keypair() -> Keypair {
        Keypair::from_seed([42u8; 32])
    }

    fn signed_variants() -> Vec<Message> {
        let key = keypair();
        let mut messages = vec![
            Message::Eom(Eom::new(now_ms(), sha256(b"leader"), 3, 0, 7)),
            Message::Ack(Ack {
                timestamp: now_ms(),
                leader_chain_id: sha256(b"leader"),
                dbheight: 7,
                vm_index: 0,
                height_in_vm: 2,
                minute: 3,
                message_hash: sha256(b"payload"),
                serial_hash: sha256(b"serial"),
                signature: None,
            }),
            Message::CommitChain(CommitChain::new(
                now_ms(),
                sha256(b"chain"),
                sha256(b"entry"),
                11,
                key.public_key(),
            )),
            Message::CommitEntry(CommitEntry::new(
                now_ms(),
                sha256(b"entry"),
                1,
                key.public_key(),
            )),
            Message::FactoidTransaction(FactoidTransaction::new(now_ms(), vec![1, 2, 3])),
            Message::DirectoryBlockSignature(DirectoryBlockSignature::new(
                now_ms(),
                sha256(b"leader"),
                7,
                sha256(b"prev keymr"),
            )),
            Message::AddServer(AddServer::new(
                now_ms(),
                sha256(b"new server"),
                ServerType::Federated,
            )),
            Message::RemoveServer(RemoveServer::new(
                now_ms(),
                sha256(b"old server"),
                ServerType::Audit,
            )),
        ];
        for message in &mut messages {
            message.sign(&key);
        }
        messages
    }

    fn unsigned_variants() -> Vec<Message> {
        vec![
            Message::RevealEntry(RevealEntry::new(
                now_ms(),
                Entry::new(sha256(b"chain"), vec![9, 9]),
            )),
            Message::MissingMsg(MissingMsg::new(now_ms(), 7, 0, 4)),
            Message::MissingData(MissingData::new(now_ms(), sha256(b"wanted"))),
        ]
    }

    #[test]
    fn test_roundtrip_all_variants() {
        for message in signed_variants().into_iter().chain(unsigned_variants()) {
            let decoded = Message::unmarshal(&message.marshal()).unwrap();
            assert_eq!(decoded, message, "roundtrip failed for {}", message.name());
        }
    }

    #[test]
    fn test_first_byte_is_type_tag() {
        for message in signed_variants().into_iter().chain(unsigned_variants()) {
            assert_eq!(message.marshal()[0], message.msg_type());
        }
    }

    #[test]
    fn test_signature_law() {
        for message in signed_variants() {
            assert!(message.verify(), "verify failed for {}", message.name());
            // Flipping any byte of the signed prefix must break verification.
            let prefix_len = message.marshal_for_signature().len();
            let mut bytes = message.marshal();
            for i in 1..prefix_len {
                bytes[i] ^= 0x01;
                if let Ok(tampered) = Message::unmarshal(&bytes) {
                    assert!(
                        !tampered.verify(),
                        "tampered byte {i} verified for {}",
                        message.name()
                    );
                }
                bytes[i] ^= 0x01;
            }
        }
    }

    #[test]
    fn test_msg_hash_stable_across_signing() {
        let key = keypair();
        let mut message = Message::Eom(Eom::new(now_ms(), sha256(b"leader"), 3, 0, 7));
        let before = message.msg_hash();
        message.sign(&key);
        assert_eq!(message.msg_hash(), before);
    }

    #[test]
    fn test_unknown_tag() {
        assert!(matches!(
            Message::unmarshal(&[0x7f, 0, 0]),
            Err(CodecError::UnknownTag(0x7f))
        ));
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(
            Message::unmarshal(&[]),
            Err(CodecError::UnexpectedEof(0))
        ));
    }
}
