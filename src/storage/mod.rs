//! Storage interface consumed by the engine, with an in-memory
//! implementation. The real overlay lives outside this crate; everything
//! here goes through the [`BlockStore`] trait, and a height is saved as one
//! batch: either the whole set lands or none of it.

use std::collections::HashMap;

use thiserror::Error;

use crate::block::admin::AdminBlock;
use crate::block::directory::DirectoryBlock;
use crate::block::entry::{Entry, EntryBlock};
use crate::block::entry_credit::EcBlock;
use crate::block::factoid::FactoidBlock;
use crate::utilities::hash::Hash;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("block set for height {height} is inconsistent: {reason}")]
    InconsistentSet { height: u32, reason: String },
    #[error("directory chain broken at height {height}: {reason}")]
    BrokenChain { height: u32, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The four blocks of one height plus the new entry blocks and entries.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSet {
    pub directory: DirectoryBlock,
    pub admin: AdminBlock,
    pub entry_credit: EcBlock,
    pub factoid: FactoidBlock,
    pub entry_blocks: Vec<EntryBlock>,
    pub entries: Vec<Entry>,
}

pub trait BlockStore {
    fn fetch_dblock_by_keymr(&self, key_mr: &Hash) -> Result<Option<DirectoryBlock>>;
    fn fetch_dblock_by_height(&self, height: u32) -> Result<Option<DirectoryBlock>>;
    /// Key MRs for heights `start..end` (`None` end means "to the head").
    fn fetch_dblock_height_range(&self, start: u32, end: Option<u32>) -> Result<Vec<Hash>>;
    /// Height of the chain tip, if any block has been saved.
    fn fetch_head(&self) -> Result<Option<u32>>;

    fn fetch_a_block_by_keymr(&self, key_mr: &Hash) -> Result<Option<AdminBlock>>;
    fn fetch_a_block_by_height(&self, height: u32) -> Result<Option<AdminBlock>>;
    fn fetch_ec_block_by_keymr(&self, key_mr: &Hash) -> Result<Option<EcBlock>>;
    fn fetch_ec_block_by_height(&self, height: u32) -> Result<Option<EcBlock>>;
    fn fetch_f_block_by_keymr(&self, key_mr: &Hash) -> Result<Option<FactoidBlock>>;
    fn fetch_f_block_by_height(&self, height: u32) -> Result<Option<FactoidBlock>>;
    fn fetch_eblock_by_keymr(&self, key_mr: &Hash) -> Result<Option<EntryBlock>>;
    fn fetch_entry_by_hash(&self, entry_hash: &Hash) -> Result<Option<Entry>>;

    /// Persists a closed height as one batch.
    fn save_directory_block(&mut self, set: &BlockSet) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    dblocks: Vec<DirectoryBlock>,
    dblocks_by_keymr: HashMap<Hash, u32>,
    a_blocks: HashMap<u32, AdminBlock>,
    a_blocks_by_keymr: HashMap<Hash, u32>,
    ec_blocks: HashMap<u32, EcBlock>,
    ec_blocks_by_keymr: HashMap<Hash, u32>,
    f_blocks: HashMap<u32, FactoidBlock>,
    f_blocks_by_keymr: HashMap<Hash, u32>,
    eblocks: HashMap<Hash, EntryBlock>,
    entries: HashMap<Hash, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_set(set: &BlockSet) -> Result<()> {
        let height = set.directory.header.dbheight;
        let entries = &set.directory.entries;
        if entries.len() < 3 {
            return Err(StoreError::InconsistentSet {
                height,
                reason: "directory body lacks the three system rows".into(),
            });
        }
        if entries[0].key_mr != set.admin.key_mr()
            || entries[1].key_mr != set.entry_credit.key_mr()
            || entries[2].key_mr != set.factoid.key_mr
        {
            return Err(StoreError::InconsistentSet {
                height,
                reason: "system rows do not reference the supplied blocks".into(),
            });
        }
        Ok(())
    }
}

impl BlockStore for MemoryStore {
    fn fetch_dblock_by_keymr(&self, key_mr: &Hash) -> Result<Option<DirectoryBlock>> {
        Ok(self
            .dblocks_by_keymr
            .get(key_mr)
            .and_then(|h| self.dblocks.get(*h as usize))
            .cloned())
    }

    fn fetch_dblock_by_height(&self, height: u32) -> Result<Option<DirectoryBlock>> {
        Ok(self.dblocks.get(height as usize).cloned())
    }

    fn fetch_dblock_height_range(&self, start: u32, end: Option<u32>) -> Result<Vec<Hash>> {
        let end = end.unwrap_or(self.dblocks.len() as u32);
        Ok(self
            .dblocks
            .iter()
            .skip(start as usize)
            .take(end.saturating_sub(start) as usize)
            .map(|b| b.key_mr())
            .collect())
    }

    fn fetch_head(&self) -> Result<Option<u32>> {
        Ok(self.dblocks.len().checked_sub(1).map(|h| h as u32))
    }

    fn fetch_a_block_by_keymr(&self, key_mr: &Hash) -> Result<Option<AdminBlock>> {
        Ok(self
            .a_blocks_by_keymr
            .get(key_mr)
            .and_then(|h| self.a_blocks.get(h))
            .cloned())
    }

    fn fetch_a_block_by_height(&self, height: u32) -> Result<Option<AdminBlock>> {
        Ok(self.a_blocks.get(&height).cloned())
    }

    fn fetch_ec_block_by_keymr(&self, key_mr: &Hash) -> Result<Option<EcBlock>> {
        Ok(self
            .ec_blocks_by_keymr
            .get(key_mr)
            .and_then(|h| self.ec_blocks.get(h))
            .cloned())
    }

    fn fetch_ec_block_by_height(&self, height: u32) -> Result<Option<EcBlock>> {
        Ok(self.ec_blocks.get(&height).cloned())
    }

    fn fetch_f_block_by_keymr(&self, key_mr: &Hash) -> Result<Option<FactoidBlock>> {
        Ok(self
            .f_blocks_by_keymr
            .get(key_mr)
            .and_then(|h| self.f_blocks.get(h))
            .cloned())
    }

    fn fetch_f_block_by_height(&self, height: u32) -> Result<Option<FactoidBlock>> {
        Ok(self.f_blocks.get(&height).cloned())
    }

    fn fetch_eblock_by_keymr(&self, key_mr: &Hash) -> Result<Option<EntryBlock>> {
        Ok(self.eblocks.get(key_mr).cloned())
    }

    fn fetch_entry_by_hash(&self, entry_hash: &Hash) -> Result<Option<Entry>> {
        Ok(self.entries.get(entry_hash).cloned())
    }

    fn save_directory_block(&mut self, set: &BlockSet) -> Result<()> {
        let height = set.directory.header.dbheight;
        if height as usize != self.dblocks.len() {
            return Err(StoreError::InconsistentSet {
                height,
                reason: format!("expected next height {}", self.dblocks.len()),
            });
        }
        Self::check_set(set)?;

        // All checks passed; the batch lands atomically from here on.
        self.dblocks_by_keymr.insert(set.directory.key_mr(), height);
        self.dblocks.push(set.directory.clone());
        self.a_blocks_by_keymr.insert(set.admin.key_mr(), height);
        self.a_blocks.insert(height, set.admin.clone());
        self.ec_blocks_by_keymr
            .insert(set.entry_credit.key_mr(), height);
        self.ec_blocks.insert(height, set.entry_credit.clone());
        self.f_blocks_by_keymr.insert(set.factoid.key_mr, height);
        self.f_blocks.insert(height, set.factoid.clone());
        for eblock in &set.entry_blocks {
            self.eblocks.insert(eblock.key_mr(), eblock.clone());
        }
        for entry in &set.entries {
            self.entries.insert(entry.hash(), entry.clone());
        }
        log::debug!(
            "saved height {height}: dblock {} with {} entry blocks",
            set.directory.key_mr(),
            set.entry_blocks.len()
        );
        Ok(())
    }
}

/// Walks the stored directory chain from genesis, re-deriving every link:
/// `prev_key_mr`, `prev_full_hash` and the body Merkle root. Returns the
/// validated blocks in height order.
pub fn validate_chain(store: &dyn BlockStore) -> Result<Vec<DirectoryBlock>> {
    let Some(head) = store.fetch_head()? else {
        return Ok(Vec::new());
    };
    let mut blocks = Vec::with_capacity(head as usize + 1);
    let mut prev: Option<(Hash, Hash)> = None;
    for height in 0..=head {
        let block = store
            .fetch_dblock_by_height(height)?
            .ok_or_else(|| StoreError::BrokenChain {
                height,
                reason: "missing block".into(),
            })?;
        if block.header.dbheight != height {
            return Err(StoreError::BrokenChain {
                height,
                reason: "stored under the wrong height".into(),
            });
        }
        if block.header.body_mr != block.body_mr() {
            return Err(StoreError::BrokenChain {
                height,
                reason: "body merkle root mismatch".into(),
            });
        }
        if let Some((prev_key_mr, prev_full_hash)) = prev {
            if block.header.prev_key_mr != prev_key_mr {
                return Err(StoreError::BrokenChain {
                    height,
                    reason: "previous key MR mismatch".into(),
                });
            }
            if block.header.prev_full_hash != prev_full_hash {
                return Err(StoreError::BrokenChain {
                    height,
                    reason: "previous full hash mismatch".into(),
                });
            }
        }
        prev = Some((block.key_mr(), block.full_hash()));
        blocks.push(block);
    }
    Ok(blocks)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::directory::DbEntry;
    use crate::block::{ADMIN_CHAIN_ID, EC_CHAIN_ID, FACTOID_CHAIN_ID};
    use crate::utilities::hash::sha256;
    use assert_matches::assert_matches;

    fn block_set(height: u32, prev: Option<&DirectoryBlock>) -> BlockSet {
        let mut admin = AdminBlock::new(height, Hash::ZERO);
        admin.seal();
        let mut entry_credit = EcBlock::new(height, Hash::ZERO, Hash::ZERO);
        entry_credit.seal();
        let factoid = FactoidBlock {
            key_mr: sha256(&height.to_be_bytes()),
            dbheight: height,
            exchange_rate: 1,
            tx_ids: vec![],
        };
        let mut directory = DirectoryBlock::new(1, height, prev);
        directory.set_system_entries(
            DbEntry {
                chain_id: ADMIN_CHAIN_ID,
                key_mr: admin.key_mr(),
            },
            DbEntry {
                chain_id: EC_CHAIN_ID,
                key_mr: entry_credit.key_mr(),
            },
            DbEntry {
                chain_id: FACTOID_CHAIN_ID,
                key_mr: factoid.key_mr,
            },
        );
        directory.seal();
        BlockSet {
            directory,
            admin,
            entry_credit,
            factoid,
            entry_blocks: vec![],
            entries: vec![],
        }
    }

    #[test]
    fn test_save_and_fetch() {
        let mut store = MemoryStore::new();
        let set = block_set(0, None);
        store.save_directory_block(&set).unwrap();

        assert_eq!(store.fetch_head().unwrap(), Some(0));
        let by_height = store.fetch_dblock_by_height(0).unwrap().unwrap();
        let by_keymr = store
            .fetch_dblock_by_keymr(&set.directory.key_mr())
            .unwrap()
            .unwrap();
        assert_eq!(by_height, by_keymr);
        assert!(store
            .fetch_a_block_by_keymr(&set.admin.key_mr())
            .unwrap()
            .is_some());
        assert!(store
            .fetch_ec_block_by_height(0)
            .unwrap()
            .is_some());
        assert!(store
            .fetch_f_block_by_keymr(&set.factoid.key_mr)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_save_rejects_height_gap() {
        let mut store = MemoryStore::new();
        let set = block_set(4, None);
        assert_matches!(
            store.save_directory_block(&set),
            Err(StoreError::InconsistentSet { .. })
        );
        // Nothing partial is visible.
        assert_eq!(store.fetch_head().unwrap(), None);
    }

    #[test]
    fn test_save_rejects_mismatched_system_rows() {
        let mut store = MemoryStore::new();
        let mut set = block_set(0, None);
        set.directory.entries[0].key_mr = sha256(b"bogus");
        assert_matches!(
            store.save_directory_block(&set),
            Err(StoreError::InconsistentSet { .. })
        );
    }

    #[test]
    fn test_validate_chain() {
        let mut store = MemoryStore::new();
        let genesis = block_set(0, None);
        store.save_directory_block(&genesis).unwrap();
        let next = block_set(1, Some(&genesis.directory));
        store.save_directory_block(&next).unwrap();

        let blocks = validate_chain(&store).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].header.prev_key_mr, blocks[0].key_mr());
    }

    #[test]
    fn test_validate_chain_detects_broken_link() {
        let mut store = MemoryStore::new();
        let genesis = block_set(0, None);
        store.save_directory_block(&genesis).unwrap();
        // A second block not chained to the first.
        let mut orphan = block_set(1, None);
        orphan.directory.header.prev_key_mr = sha256(b"someone else");
        store.save_directory_block(&orphan).unwrap();

        assert_matches!(
            validate_chain(&store),
            Err(StoreError::BrokenChain { height: 1, .. })
        );
    }

    #[test]
    fn test_height_range() {
        let mut store = MemoryStore::new();
        let genesis = block_set(0, None);
        store.save_directory_block(&genesis).unwrap();
        let next = block_set(1, Some(&genesis.directory));
        store.save_directory_block(&next).unwrap();

        let all = store.fetch_dblock_height_range(0, None).unwrap();
        assert_eq!(all.len(), 2);
        let tail = store.fetch_dblock_height_range(1, Some(2)).unwrap();
        assert_eq!(tail, vec![next.directory.key_mr()]);
    }
}
