//! Reveal: pay-then-publish, phase two. Carries the entry payload whose
//! hash must match a commit already recorded at this height.

use crate::block::entry::Entry;
use crate::message::{read_prefix, write_prefix, ValidationState, Validity, REVEAL_ENTRY_MSG};
use crate::utilities::codec::Result;
use crate::utilities::hash::Hash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealEntry {
    pub timestamp: u64,
    pub entry: Entry,
}

impl RevealEntry {
    pub fn new(timestamp: u64, entry: Entry) -> Self {
        Self { timestamp, entry }
    }

    pub fn entry_hash(&self) -> Hash {
        self.entry.hash()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(41 + self.entry.content.len());
        write_prefix(&mut out, REVEAL_ENTRY_MSG, self.timestamp);
        out.extend_from_slice(&self.entry.marshal());
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let (mut reader, timestamp) = read_prefix(data, REVEAL_ENTRY_MSG)?;
        let entry = Entry::read_from(&mut reader)?;
        reader.expect_end()?;
        Ok(Self { timestamp, entry })
    }

    /// A reveal with no matching commit is not wrong, just early.
    pub fn validate(&self, state: &dyn ValidationState) -> Validity {
        if state.has_commit(&self.entry_hash()) {
            Validity::Valid
        } else {
            Validity::Undetermined
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utilities::hash::sha256;

    #[test]
    fn test_roundtrip() {
        let reveal = RevealEntry::new(3, Entry::new(sha256(b"chain"), vec![0xde, 0xad]));
        assert_eq!(RevealEntry::unmarshal(&reveal.marshal()).unwrap(), reveal);
    }

    #[test]
    fn test_entry_hash_matches_entry() {
        let entry = Entry::new(sha256(b"chain"), vec![1]);
        let reveal = RevealEntry::new(3, entry.clone());
        assert_eq!(reveal.entry_hash(), entry.hash());
    }
}
