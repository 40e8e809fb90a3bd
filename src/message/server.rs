//! Server-set adjustments, authorized by a configured authoritative key.
//! Add and remove share the 0x08 tag, split by an action byte.

use crate::message::{
    read_optional_signature, read_prefix, write_prefix, Message, ValidationState, Validity,
    SERVER_ADJUST_MSG,
};
use crate::utilities::codec::{CodecError, Result};
use crate::utilities::crypto::{FullSignature, Keypair};
use crate::utilities::hash::Hash;

const ACTION_ADD: u8 = 0x00;
const ACTION_REMOVE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Federated,
    Audit,
}

impl ServerType {
    fn as_byte(self) -> u8 {
        match self {
            ServerType::Federated => 0,
            ServerType::Audit => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ServerType::Federated),
            1 => Ok(ServerType::Audit),
            _ => Err(CodecError::OutOfRange("server type")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddServer {
    pub timestamp: u64,
    pub server_chain_id: Hash,
    pub server_type: ServerType,
    pub signature: Option<FullSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveServer {
    pub timestamp: u64,
    pub server_chain_id: Hash,
    pub server_type: ServerType,
    pub signature: Option<FullSignature>,
}

fn marshal_prefix(
    timestamp: u64,
    action: u8,
    server_chain_id: &Hash,
    server_type: ServerType,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(43);
    write_prefix(&mut out, SERVER_ADJUST_MSG, timestamp);
    out.push(action);
    out.extend_from_slice(server_chain_id.as_bytes());
    out.push(server_type.as_byte());
    out
}

fn validate_adjustment(
    signature: &Option<FullSignature>,
    prefix: &[u8],
    state: &dyn ValidationState,
) -> Validity {
    let Some(signature) = signature else {
        return Validity::Invalid;
    };
    if let Some(authority) = state.authority_key() {
        if signature.public_key != authority {
            return Validity::Invalid;
        }
    }
    if signature.verify(prefix) {
        Validity::Valid
    } else {
        Validity::Invalid
    }
}

impl AddServer {
    pub fn new(timestamp: u64, server_chain_id: Hash, server_type: ServerType) -> Self {
        Self {
            timestamp,
            server_chain_id,
            server_type,
            signature: None,
        }
    }

    pub fn marshal_for_signature(&self) -> Vec<u8> {
        marshal_prefix(
            self.timestamp,
            ACTION_ADD,
            &self.server_chain_id,
            self.server_type,
        )
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.marshal_for_signature();
        if let Some(signature) = &self.signature {
            signature.marshal(&mut out);
        }
        out
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

    pub fn validate(&self, state: &dyn ValidationState) -> Validity {
        validate_adjustment(&self.signature, &self.marshal_for_signature(), state)
    }
}

impl RemoveServer {
    pub fn new(timestamp: u64, server_chain_id: Hash, server_type: ServerType) -> Self {
        Self {
            timestamp,
            server_chain_id,
            server_type,
            signature: None,
        }
    }

    pub fn marshal_for_signature(&self) -> Vec<u8> {
        marshal_prefix(
            self.timestamp,
            ACTION_REMOVE,
            &self.server_chain_id,
            self.server_type,
        )
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = self.marshal_for_signature();
        if let Some(signature) = &self.signature {
            signature.marshal(&mut out);
        }
        out
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

    pub fn validate(&self, state: &dyn ValidationState) -> Validity {
        validate_adjustment(&self.signature, &self.marshal_for_signature(), state)
    }
}

/// Both adjustments share a tag; the action byte picks the variant.
pub(crate) fn unmarshal_adjustment(data: &[u8]) -> Result<Message> {
    let (mut reader, timestamp) = read_prefix(data, SERVER_ADJUST_MSG)?;
    let action = reader.read_u8()?;
    let server_chain_id = reader.read_hash()?;
    let server_type = ServerType::from_byte(reader.read_u8()?)?;
    let signature = read_optional_signature(&mut reader)?;
    match action {
        ACTION_ADD => Ok(Message::AddServer(AddServer {
            timestamp,
            server_chain_id,
            server_type,
            signature,
        })),
        ACTION_REMOVE => Ok(Message::RemoveServer(RemoveServer {
            timestamp,
            server_chain_id,
            server_type,
            signature,
        })),
        _ => Err(CodecError::OutOfRange("server adjustment action")),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utilities::hash::sha256;

    #[test]
    fn test_add_remove_distinguished() {
        let add = AddServer::new(1, sha256(b"s"), ServerType::Federated);
        let remove = RemoveServer::new(1, sha256(b"s"), ServerType::Federated);
        assert_ne!(add.marshal(), remove.marshal());

        assert!(matches!(
            Message::unmarshal(&add.marshal()).unwrap(),
            Message::AddServer(_)
        ));
        assert!(matches!(
            Message::unmarshal(&remove.marshal()).unwrap(),
            Message::RemoveServer(_)
        ));
    }

    #[test]
    fn test_bad_server_type() {
        let mut data = AddServer::new(1, sha256(b"s"), ServerType::Audit).marshal();
        let last = data.len() - 1;
        data[last] = 9;
        assert!(matches!(
            Message::unmarshal(&data),
            Err(CodecError::OutOfRange("server type"))
        ));
    }
}
