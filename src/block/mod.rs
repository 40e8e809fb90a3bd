//! The four block families assembled at every directory-block height, plus
//! the directory block that binds them.

pub mod admin;
pub mod directory;
pub mod entry;
pub mod entry_credit;
pub mod factoid;

use crate::utilities::hash::Hash;

const fn system_chain_id(last: u8) -> Hash {
    let mut bytes = [0u8; 32];
    bytes[31] = last;
    Hash::new(bytes)
}

/// Fixed chain identifiers known to every node.
pub const ADMIN_CHAIN_ID: Hash = system_chain_id(0x0a);
pub const EC_CHAIN_ID: Hash = system_chain_id(0x0c);
pub const DIRECTORY_CHAIN_ID: Hash = system_chain_id(0x0d);
pub const FACTOID_CHAIN_ID: Hash = system_chain_id(0x0f);
