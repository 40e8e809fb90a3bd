//! The per-height process list: parallel ack-chained VM logs, the message
//! cursor that replays them deterministically, and the block bodies built
//! up as messages are processed.

use std::collections::{BTreeMap, HashMap};

use crate::block::admin::{AdminBlock, AdminEntry};
use crate::block::directory::{DbEntry, DirectoryBlock};
use crate::block::entry::{Entry, EntryBlock};
use crate::block::entry_credit::{EcBlock, EcEntry};
use crate::block::factoid::{FactoidBlock, FactoidLedger};
use crate::consensus::vm::{Slot, Vm};
use crate::consensus::{build_server_map, AuditServer, FederatedServer, MAX_VMS};
use crate::message::{
    serial_hash, Ack, DirectoryBlockSignature, Message, ServerType, ValidationState,
};
use crate::storage::BlockSet;
use crate::utilities::crypto::{Keypair, PublicKey};
use crate::utilities::hash::Hash;

/// Progress of a list through its ten minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStatus {
    /// Created, predecessor not yet confirmed saved.
    New,
    /// Predecessor persisted; accepting acknowledged messages.
    Good,
    /// First EOM observed.
    Sealing,
    /// Every VM sealed through minute 9; signatures being collected.
    Signing,
    /// Blocks emitted; the list is frozen.
    Final,
}

/// Result of attempting to install an `(ack, message)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    /// Same slot, same message hash. Idempotent no-op.
    Duplicate,
    /// The predecessor slot is still empty; retry once it lands.
    Waiting,
    /// The ack's serial hash disagrees with the installed chain.
    SerialMismatch,
    /// Different message hash for an occupied slot. Protocol violation.
    Conflict,
    /// Structurally unusable (VM out of range, hash mismatch with payload).
    Rejected,
}

/// Follower-visible roster change, applied by the engine at the next height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerChange {
    Add {
        chain_id: Hash,
        server_type: ServerType,
    },
    Remove {
        chain_id: Hash,
        server_type: ServerType,
    },
}

/// Where an entry chain left off at the previous height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHead {
    pub sequence: u32,
    pub key_mr: Hash,
    pub full_hash: Hash,
}

/// Everything the predecessor height contributes to a new list.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrevBlocks<'a> {
    pub directory: Option<&'a DirectoryBlock>,
    pub admin_lookup_hash: Hash,
    pub ec_header_hash: Hash,
    pub ec_full_hash: Hash,
}

/// Mutable collaborator state threaded through `process`.
pub struct ProcessContext<'a> {
    pub ec_balances: &'a mut HashMap<PublicKey, i32>,
    pub factoid: &'a mut dyn FactoidLedger,
    pub allow_negative_ec_balance: bool,
    pub chain_heads: &'a mut HashMap<Hash, ChainHead>,
}

pub struct ProcessList {
    pub dbheight: u32,
    pub network_id: u32,
    pub vms: Vec<Vm>,
    server_map: Vec<Vec<usize>>,
    pub fed_servers: Vec<FederatedServer>,
    pub audit_servers: Vec<AuditServer>,
    /// Replay caches for this height.
    old_msgs: HashMap<Hash, Message>,
    old_acks: HashMap<Hash, Ack>,
    /// Block bodies under construction.
    pub new_eblocks: BTreeMap<Hash, EntryBlock>,
    pub new_entries: BTreeMap<Hash, Entry>,
    pub commits: HashMap<Hash, Message>,
    pub admin_block: AdminBlock,
    pub ec_block: EcBlock,
    pub directory_block: DirectoryBlock,
    pub factoid_block: Option<FactoidBlock>,
    /// Signatures closing the previous height, keyed by signer chain id.
    pub prev_sigs: HashMap<Hash, DirectoryBlockSignature>,
    pub server_changes: Vec<ServerChange>,
    pub status: ListStatus,
    pub sealing: bool,
    /// Invariant: the predecessor height is persisted.
    pub good: bool,
    /// Minute the leader side is acknowledging into.
    pub leader_minute: u8,
    /// Minute boundaries already recorded into the block bodies.
    minutes_recorded: u8,
    prev_key_mr: Hash,
}

impl ProcessList {
    pub fn new(
        dbheight: u32,
        network_id: u32,
        mut fed_servers: Vec<FederatedServer>,
        mut audit_servers: Vec<AuditServer>,
        prev: PrevBlocks<'_>,
    ) -> Self {
        crate::consensus::sort_federated(&mut fed_servers);
        crate::consensus::sort_audit(&mut audit_servers);
        let live = fed_servers.len().clamp(1, MAX_VMS);
        let vms = (0..live).map(|_| Vm::new()).collect();
        let server_map = build_server_map(dbheight, live);
        let prev_key_mr = prev
            .directory
            .map(|block| block.key_mr())
            .unwrap_or(Hash::ZERO);
        Self {
            dbheight,
            network_id,
            vms,
            server_map,
            fed_servers,
            audit_servers,
            old_msgs: HashMap::new(),
            old_acks: HashMap::new(),
            new_eblocks: BTreeMap::new(),
            new_entries: BTreeMap::new(),
            commits: HashMap::new(),
            admin_block: AdminBlock::new(dbheight, prev.admin_lookup_hash),
            ec_block: EcBlock::new(dbheight, prev.ec_header_hash, prev.ec_full_hash),
            directory_block: DirectoryBlock::new(network_id, dbheight, prev.directory),
            factoid_block: None,
            prev_sigs: HashMap::new(),
            server_changes: Vec::new(),
            status: ListStatus::New,
            sealing: false,
            good: false,
            leader_minute: 0,
            minutes_recorded: 0,
            prev_key_mr,
        }
    }

    pub fn vm_count(&self) -> usize {
        self.vms.len()
    }

    pub fn prev_key_mr(&self) -> Hash {
        self.prev_key_mr
    }

    /// Index of a federated server in the sorted roster.
    pub fn server_index(&self, chain_id: &Hash) -> Option<usize> {
        self.fed_servers
            .iter()
            .position(|server| server.chain_id == *chain_id)
    }

    /// Chain id of the server owning `(minute, vm_index)`.
    pub fn vm_owner(&self, minute: u8, vm_index: usize) -> Option<Hash> {
        let row = self.server_map.get(minute as usize)?;
        let server = *row.get(vm_index)?;
        self.fed_servers.get(server).map(|s| s.chain_id)
    }

    /// Marks the predecessor as persisted; the list starts accepting work.
    pub fn mark_good(&mut self) {
        if self.status == ListStatus::New {
            self.status = ListStatus::Good;
        }
        self.good = true;
    }

    /// Leader side: build and sign the ack placing `message` at the tail of
    /// `vm_index`.
    pub fn create_ack(
        &self,
        vm_index: usize,
        minute: u8,
        message: &Message,
        timestamp: u64,
        leader_chain_id: Hash,
        keypair: &Keypair,
    ) -> Ack {
        let vm = &self.vms[vm_index];
        let prev = vm.last_message_hash();
        let mut ack = Ack::new(
            timestamp,
            leader_chain_id,
            self.dbheight,
            vm_index as u8,
            vm.next_ack_height(),
            minute,
            message.msg_hash(),
            prev.as_ref(),
        );
        ack.sign(keypair);
        ack
    }

    /// Installs an acknowledged message at the slot its ack prescribes,
    /// enforcing the serial-hash chain against the installed predecessor.
    ///
    /// A failed check never occupies the slot; a correct later delivery is
    /// still accepted.
    pub fn add_to_process_list(&mut self, ack: Ack, message: Message) -> InstallOutcome {
        let vm_index = ack.vm_index as usize;
        if vm_index >= self.vms.len() {
            log::warn!("ack for out-of-range vm {vm_index} at dbheight {}", self.dbheight);
            return InstallOutcome::Rejected;
        }
        if message.msg_hash() != ack.message_hash {
            log::warn!("ack affirms {} but payload hashes differently", ack.message_hash);
            return InstallOutcome::Rejected;
        }
        let index = ack.height_in_vm as usize;
        let vm = &self.vms[vm_index];

        if let Some(existing) = vm.slot(index) {
            if existing.ack.message_hash == ack.message_hash {
                return InstallOutcome::Duplicate;
            }
            log::error!(
                "conflicting install at dbheight {} vm {} index {}: {} vs {}",
                self.dbheight,
                vm_index,
                index,
                existing.ack.message_hash,
                ack.message_hash
            );
            return InstallOutcome::Conflict;
        }

        let expected = if index == 0 {
            serial_hash(None, &ack.message_hash)
        } else {
            match vm.slot(index - 1) {
                Some(prev) => serial_hash(Some(&prev.ack.message_hash), &ack.message_hash),
                None => return InstallOutcome::Waiting,
            }
        };
        if expected != ack.serial_hash {
            log::warn!(
                "serial hash mismatch at dbheight {} vm {} index {}; discarding",
                self.dbheight,
                vm_index,
                index
            );
            return InstallOutcome::SerialMismatch;
        }

        self.old_msgs.insert(ack.message_hash, message.clone());
        self.old_acks.insert(ack.message_hash, ack.clone());
        // A commitment counts from the moment it is installed, so a reveal
        // stalled ahead of it in the same VM can unblock.
        match &message {
            Message::CommitChain(commit) => {
                self.commits.insert(commit.entry_hash, message.clone());
            }
            Message::CommitEntry(commit) => {
                self.commits.insert(commit.entry_hash, message.clone());
            }
            _ => {}
        }
        let vm = &mut self.vms[vm_index];
        vm.leader_minute = vm.leader_minute.max(ack.minute);
        vm.put(index, Slot { message, ack });
        vm.missing_time = None;
        InstallOutcome::Installed
    }

    /// True if this `(ack, message)` pair was already installed at this
    /// height; re-delivery is a no-op.
    pub fn already_seen(&self, message_hash: &Hash) -> bool {
        self.old_acks.contains_key(message_hash)
    }

    pub fn message_by_hash(&self, message_hash: &Hash) -> Option<&Message> {
        self.old_msgs.get(message_hash)
    }

    /// Advances every VM cursor as far as it can. Iteration order (VM 0..n,
    /// each drained in turn) is the reproducible replay order every
    /// follower derives identical block bytes from.
    pub fn process(&mut self, ctx: &mut ProcessContext<'_>) {
        for vm_index in 0..self.vms.len() {
            loop {
                let height = self.vms[vm_index].height;
                let Some(slot) = self.vms[vm_index].slot(height).cloned() else {
                    break;
                };
                if !self.process_slot(vm_index, height, &slot, ctx) {
                    break;
                }
                self.vms[vm_index].height = height + 1;
            }
        }
        self.record_completed_minutes();
        self.advance_status();
    }

    /// Per-variant processing. `false` means "try again later": the cursor
    /// stays and other VMs continue.
    fn process_slot(
        &mut self,
        vm_index: usize,
        height: usize,
        slot: &Slot,
        ctx: &mut ProcessContext<'_>,
    ) -> bool {
        match &slot.message {
            Message::CommitChain(commit) => {
                self.apply_commit(
                    commit.entry_hash,
                    commit.credits,
                    commit.ec_public_key,
                    EcEntry::CommitChain {
                        chain_id: commit.chain_id,
                        entry_hash: commit.entry_hash,
                        credits: commit.credits,
                        ec_public_key: commit.ec_public_key,
                    },
                    ctx,
                );
                true
            }
            Message::CommitEntry(commit) => {
                self.apply_commit(
                    commit.entry_hash,
                    commit.credits,
                    commit.ec_public_key,
                    EcEntry::CommitEntry {
                        entry_hash: commit.entry_hash,
                        credits: commit.credits,
                        ec_public_key: commit.ec_public_key,
                    },
                    ctx,
                );
                true
            }
            Message::RevealEntry(reveal) => {
                let entry_hash = reveal.entry_hash();
                if !self.commits.contains_key(&entry_hash) {
                    // Not ready: the paying commit has not been processed yet.
                    return false;
                }
                let entry = reveal.entry.clone();
                let chain_id = entry.chain_id;
                let dbheight = self.dbheight;
                let eblock = self.new_eblocks.entry(chain_id).or_insert_with(|| {
                    match ctx.chain_heads.get(&chain_id) {
                        Some(head) => EntryBlock::new(
                            chain_id,
                            dbheight,
                            head.sequence + 1,
                            head.key_mr,
                            head.full_hash,
                        ),
                        None => EntryBlock::new(chain_id, dbheight, 0, Hash::ZERO, Hash::ZERO),
                    }
                });
                eblock.add_entry(entry_hash);
                self.new_entries.insert(entry_hash, entry);
                true
            }
            Message::FactoidTransaction(tx) => {
                match ctx.factoid.apply_transaction(&tx.payload) {
                    None => {
                        // Recorded for determinism; the effect is nil.
                        log::warn!("factoid tx {} rejected by ledger", tx.tx_id());
                    }
                    Some(increases) => {
                        for increase in increases {
                            *ctx.ec_balances.entry(increase.ec_public_key).or_insert(0) +=
                                increase.num_ec as i32;
                            self.ec_block.add_entry(EcEntry::IncreaseBalance {
                                ec_public_key: increase.ec_public_key,
                                tx_id: increase.tx_id,
                                index: increase.index,
                                num_ec: increase.num_ec,
                            });
                        }
                    }
                }
                true
            }
            Message::Eom(eom) => {
                let vm = &mut self.vms[vm_index];
                vm.seal = eom.minute + 1;
                vm.seal_height = height;
                vm.minute_complete = eom.minute + 1;
                vm.minute_height = height;
                vm.seal_time = None;
                self.sealing = true;
                true
            }
            Message::DirectoryBlockSignature(sig) => {
                if sig.prev_key_mr == self.prev_key_mr {
                    self.prev_sigs.insert(sig.leader_chain_id, sig.clone());
                } else {
                    log::warn!(
                        "directory signature for {} does not match predecessor {}",
                        sig.prev_key_mr,
                        self.prev_key_mr
                    );
                }
                true
            }
            Message::AddServer(add) => {
                let entry = match add.server_type {
                    ServerType::Federated => AdminEntry::AddFederatedServer {
                        chain_id: add.server_chain_id,
                    },
                    ServerType::Audit => AdminEntry::AddAuditServer {
                        chain_id: add.server_chain_id,
                    },
                };
                self.admin_block.add_entry(entry);
                self.server_changes.push(ServerChange::Add {
                    chain_id: add.server_chain_id,
                    server_type: add.server_type,
                });
                true
            }
            Message::RemoveServer(remove) => {
                if remove.server_type == ServerType::Federated {
                    self.admin_block.add_entry(AdminEntry::RemoveFederatedServer {
                        chain_id: remove.server_chain_id,
                    });
                }
                self.server_changes.push(ServerChange::Remove {
                    chain_id: remove.server_chain_id,
                    server_type: remove.server_type,
                });
                true
            }
            other => {
                // Recovery traffic never belongs in a VM log.
                log::warn!("skipping non-process message {} in vm {vm_index}", other.name());
                true
            }
        }
    }

    fn apply_commit(
        &mut self,
        entry_hash: Hash,
        credits: u8,
        ec_public_key: PublicKey,
        ec_entry: EcEntry,
        ctx: &mut ProcessContext<'_>,
    ) {
        let balance = ctx.ec_balances.entry(ec_public_key).or_insert(0);
        if !ctx.allow_negative_ec_balance && *balance < i32::from(credits) {
            // Recorded in the log; balances and block bodies untouched.
            log::warn!(
                "commit for {} overdraws {} ({} < {})",
                entry_hash,
                ec_public_key,
                balance,
                credits
            );
            return;
        }
        *balance -= i32::from(credits);
        self.ec_block.add_entry(ec_entry);
    }

    /// Records minute boundaries that every live VM has sealed: EC and
    /// admin markers once per minute, entry-block markers per chain.
    fn record_completed_minutes(&mut self) {
        let completed = self
            .vms
            .iter()
            .map(|vm| vm.minute_complete)
            .min()
            .unwrap_or(0);
        while self.minutes_recorded < completed {
            let minute = self.minutes_recorded;
            let server_index = self.server_map[minute as usize][0] as u8;
            self.ec_block
                .add_entry(EcEntry::ServerIndexNumber(server_index));
            self.ec_block.add_entry(EcEntry::MinuteNumber(minute + 1));
            self.admin_block.add_entry(AdminEntry::MinuteNumber(minute + 1));
            for eblock in self.new_eblocks.values_mut() {
                eblock.close_minute(minute);
            }
            self.minutes_recorded += 1;
        }
        self.leader_minute = completed.min(9);
    }

    /// Majority of the federated set.
    fn signature_quorum(&self) -> usize {
        self.fed_servers.len() / 2 + 1
    }

    pub fn has_signature_majority(&self) -> bool {
        self.prev_sigs.len() >= self.signature_quorum()
    }

    pub fn all_sealed(&self) -> bool {
        self.vms.iter().all(|vm| vm.seal == 10)
    }

    pub fn fully_processed(&self) -> bool {
        self.vms.iter().all(|vm| vm.fully_processed())
    }

    fn advance_status(&mut self) {
        if self.status == ListStatus::Good && self.sealing {
            self.status = ListStatus::Sealing;
        }
        if self.status == ListStatus::Sealing && self.all_sealed() {
            self.status = ListStatus::Signing;
        }
        if self.status == ListStatus::Signing
            && self.has_signature_majority()
            && self.fully_processed()
            && self.minutes_recorded == 10
        {
            self.status = ListStatus::Final;
        }
    }

    pub fn ready_to_finalize(&self) -> bool {
        self.status == ListStatus::Final && self.factoid_block.is_none()
    }

    /// Closes the height: seals the four block bodies and assembles the
    /// directory block. Deterministic given the same VM logs and rosters.
    pub fn finalize(&mut self, ctx: &mut ProcessContext<'_>) -> BlockSet {
        let factoid = ctx.factoid.seal_block(self.dbheight);
        self.factoid_block = Some(factoid.clone());

        self.admin_block.seal();
        self.ec_block.seal();
        for eblock in self.new_eblocks.values_mut() {
            eblock.seal();
        }

        self.directory_block.header.timestamp = self.closing_timestamp();
        self.directory_block.set_system_entries(
            DbEntry::from_admin_block(&self.admin_block),
            DbEntry::from_ec_block(&self.ec_block),
            DbEntry::from_factoid_block(&factoid),
        );
        // BTreeMap iteration gives ascending chain-id order.
        for eblock in self.new_eblocks.values() {
            self.directory_block.add_entry_block(DbEntry::from_entry_block(eblock));
        }
        self.directory_block.seal();

        BlockSet {
            directory: self.directory_block.clone(),
            admin: self.admin_block.clone(),
            entry_credit: self.ec_block.clone(),
            factoid,
            entry_blocks: self.new_eblocks.values().cloned().collect(),
            entries: self.new_entries.values().cloned().collect(),
        }
    }

    /// Header timestamp in whole minutes, taken from the sealing EOM of
    /// VM 0 so every follower derives the same value from the same log.
    fn closing_timestamp(&self) -> u32 {
        let vm = &self.vms[0];
        vm.slot(vm.seal_height)
            .map(|slot| (slot.message.timestamp() / 60_000) as u32)
            .unwrap_or(0)
    }
}

/// [`ValidationState`] view over a list plus node-level configuration.
pub struct ValidationView<'a> {
    pub list: &'a ProcessList,
    pub authority_key: Option<PublicKey>,
}

impl ValidationState for ValidationView<'_> {
    fn dbheight(&self) -> u32 {
        self.list.dbheight
    }

    fn is_federated(&self, chain_id: &Hash) -> bool {
        self.list.server_index(chain_id).is_some()
    }

    fn federated_key(&self, chain_id: &Hash) -> Option<PublicKey> {
        self.list
            .fed_servers
            .iter()
            .find(|server| server.chain_id == *chain_id)
            .map(|server| server.public_key)
    }

    fn vm_owner(&self, minute: u8, vm_index: usize) -> Option<Hash> {
        self.list.vm_owner(minute, vm_index)
    }

    fn authority_key(&self) -> Option<PublicKey> {
        self.authority_key
    }

    fn has_commit(&self, entry_hash: &Hash) -> bool {
        self.list.commits.contains_key(entry_hash)
    }

    fn prev_key_mr(&self) -> Option<Hash> {
        if self.list.good {
            Some(self.list.prev_key_mr)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::factoid::SimpleLedger;
    use crate::message::{CommitEntry, Eom, MissingData, RevealEntry, Validity};
    use crate::utilities::crypto::chain_id_of;
    use crate::utilities::hash::sha256;

    struct Fixture {
        list: ProcessList,
        keys: Vec<Keypair>,
        balances: HashMap<PublicKey, i32>,
        ledger: SimpleLedger,
        chain_heads: HashMap<Hash, ChainHead>,
    }

    impl Fixture {
        fn new(server_count: usize, dbheight: u32) -> Self {
            let keys: Vec<Keypair> = (0..server_count)
                .map(|i| Keypair::from_seed([i as u8 + 1; 32]))
                .collect();
            let fed: Vec<FederatedServer> = keys
                .iter()
                .map(|k| FederatedServer {
                    chain_id: chain_id_of(&k.public_key()),
                    public_key: k.public_key(),
                })
                .collect();
            let mut list =
                ProcessList::new(dbheight, 1, fed, Vec::new(), PrevBlocks::default());
            list.mark_good();
            Self {
                list,
                keys,
                balances: HashMap::new(),
                ledger: SimpleLedger::default(),
                chain_heads: HashMap::new(),
            }
        }

        fn keypair_for(&self, chain_id: &Hash) -> &Keypair {
            self.keys
                .iter()
                .find(|k| chain_id_of(&k.public_key()) == *chain_id)
                .unwrap()
        }

        fn install(&mut self, vm_index: usize, minute: u8, message: Message) -> InstallOutcome {
            let owner = self.list.vm_owner(minute, vm_index).unwrap();
            let keypair = self.keypair_for(&owner);
            let ack = self.list.create_ack(
                vm_index,
                minute,
                &message,
                message.timestamp(),
                owner,
                keypair,
            );
            self.list.add_to_process_list(ack, message)
        }

        fn process(&mut self) {
            let mut ctx = ProcessContext {
                ec_balances: &mut self.balances,
                factoid: &mut self.ledger,
                allow_negative_ec_balance: true,
                chain_heads: &mut self.chain_heads,
            };
            self.list.process(&mut ctx);
        }
    }

    fn commit_for(entry: &Entry, keypair: &Keypair) -> Message {
        let mut commit = CommitEntry::new(10, entry.hash(), 1, keypair.public_key());
        commit.sign(keypair);
        Message::CommitEntry(commit)
    }

    #[test]
    fn test_serial_hash_chain_holds() {
        let mut fx = Fixture::new(1, 1);
        for i in 0..5u8 {
            let msg = Message::MissingData(MissingData::new(u64::from(i), sha256(&[i])));
            assert_eq!(fx.install(0, 0, msg), InstallOutcome::Installed);
        }
        let vm = &fx.list.vms[0];
        let mut prev: Option<Hash> = None;
        for slot in vm.list.iter().map(|s| s.as_ref().unwrap()) {
            let expected = serial_hash(prev.as_ref(), &slot.ack.message_hash);
            assert_eq!(slot.ack.serial_hash, expected);
            prev = Some(slot.ack.message_hash);
        }
    }

    #[test]
    fn test_duplicate_install_is_noop() {
        let mut fx = Fixture::new(1, 1);
        let msg = Message::MissingData(MissingData::new(0, sha256(b"x")));
        let owner = fx.list.vm_owner(0, 0).unwrap();
        let keypair = fx.keypair_for(&owner);
        let ack = fx.list.create_ack(0, 0, &msg, 0, owner, keypair);

        assert_eq!(
            fx.list.add_to_process_list(ack.clone(), msg.clone()),
            InstallOutcome::Installed
        );
        fx.process();
        let height_before = fx.list.vms[0].height;
        assert_eq!(
            fx.list.add_to_process_list(ack, msg),
            InstallOutcome::Duplicate
        );
        fx.process();
        assert_eq!(fx.list.vms[0].height, height_before);
    }

    #[test]
    fn test_conflicting_install_does_not_overwrite() {
        let mut fx = Fixture::new(1, 1);
        let first = Message::MissingData(MissingData::new(0, sha256(b"x")));
        let owner = fx.list.vm_owner(0, 0).unwrap();
        let ack = fx
            .list
            .create_ack(0, 0, &first, 0, owner, fx.keypair_for(&owner));
        fx.list.add_to_process_list(ack.clone(), first.clone());

        // Same slot, different payload.
        let second = Message::MissingData(MissingData::new(0, sha256(b"y")));
        let mut bad_ack = ack;
        bad_ack.message_hash = second.msg_hash();
        bad_ack.serial_hash = second.msg_hash();
        assert_eq!(
            fx.list.add_to_process_list(bad_ack, second),
            InstallOutcome::Conflict
        );
        let installed = fx.list.vms[0].slot(0).unwrap();
        assert_eq!(installed.message, first);
    }

    #[test]
    fn test_serial_mismatch_leaves_slot_open() {
        let mut fx = Fixture::new(1, 1);
        let first = Message::MissingData(MissingData::new(0, sha256(b"x")));
        fx.install(0, 0, first);

        let second = Message::MissingData(MissingData::new(1, sha256(b"y")));
        let owner = fx.list.vm_owner(0, 0).unwrap();
        let keypair = fx.keypair_for(&owner);
        let mut broken = fx
            .list
            .create_ack(0, 0, &second, 1, owner, keypair);
        broken.serial_hash = sha256(b"garbage");
        broken.sign(keypair);

        assert_eq!(
            fx.list.add_to_process_list(broken, second.clone()),
            InstallOutcome::SerialMismatch
        );
        assert!(fx.list.vms[0].slot(1).is_none());

        // The correctly chained ack for the same index is then accepted.
        assert_eq!(fx.install(0, 0, second), InstallOutcome::Installed);
    }

    #[test]
    fn test_out_of_order_ack_waits() {
        let mut fx = Fixture::new(1, 1);
        let first = Message::MissingData(MissingData::new(0, sha256(b"x")));
        let second = Message::MissingData(MissingData::new(1, sha256(b"y")));

        let owner = fx.list.vm_owner(0, 0).unwrap();
        let keypair = fx.keypair_for(&owner);
        let ack0 = fx.list.create_ack(0, 0, &first, 0, owner, keypair);
        let mut ack1 = Ack::new(
            1,
            owner,
            1,
            0,
            1,
            0,
            second.msg_hash(),
            Some(&first.msg_hash()),
        );
        ack1.sign(keypair);

        assert_eq!(
            fx.list.add_to_process_list(ack1.clone(), second.clone()),
            InstallOutcome::Waiting
        );
        assert_eq!(
            fx.list.add_to_process_list(ack0, first),
            InstallOutcome::Installed
        );
        assert_eq!(
            fx.list.add_to_process_list(ack1, second),
            InstallOutcome::Installed
        );
    }

    #[test]
    fn test_commit_then_reveal() {
        let mut fx = Fixture::new(1, 1);
        let ec_key = Keypair::from_seed([99u8; 32]);
        let entry = Entry::new(sha256(b"content chain"), vec![1, 2, 3]);

        fx.install(0, 0, commit_for(&entry, &ec_key));
        fx.install(0, 0, Message::RevealEntry(RevealEntry::new(11, entry.clone())));
        fx.process();

        assert!(fx.list.new_entries.contains_key(&entry.hash()));
        assert_eq!(fx.balances[&ec_key.public_key()], -1);
        assert_eq!(fx.list.new_eblocks.len(), 1);
        assert!(fx.list.fully_processed());
    }

    #[test]
    fn test_reveal_without_commit_stalls_cursor() {
        let mut fx = Fixture::new(1, 1);
        let ec_key = Keypair::from_seed([99u8; 32]);
        let entry = Entry::new(sha256(b"content chain"), vec![1, 2, 3]);

        fx.install(0, 0, Message::RevealEntry(RevealEntry::new(11, entry.clone())));
        fx.process();
        assert_eq!(fx.list.vms[0].height, 0);
        assert!(fx.list.new_entries.is_empty());

        // The commit arrives into a later slot; its installation is enough
        // for the stalled reveal to proceed on the next processing pass.
        fx.install(0, 0, commit_for(&entry, &ec_key));
        fx.process();
        assert!(fx.list.fully_processed());
        assert!(fx.list.new_entries.contains_key(&entry.hash()));
        assert_eq!(fx.balances[&ec_key.public_key()], -1);
    }

    #[test]
    fn test_eom_seals_vm_and_records_markers() {
        let mut fx = Fixture::new(1, 1);
        for minute in 0..10u8 {
            let owner = fx.list.vm_owner(minute, 0).unwrap();
            let mut eom = Eom::new(u64::from(minute) * 60_000, owner, minute, 0, 1);
            eom.sign(fx.keypair_for(&owner));
            fx.install(0, minute, Message::Eom(eom));
            fx.process();
        }
        assert_eq!(fx.list.vms[0].seal, 10);
        assert!(fx.list.all_sealed());
        let minute_markers = fx
            .list
            .ec_block
            .body
            .iter()
            .filter(|e| matches!(e, EcEntry::MinuteNumber(_)))
            .count();
        assert_eq!(minute_markers, 10);
        assert_eq!(fx.list.admin_block.entries.len(), 10);
        assert_eq!(fx.list.status, ListStatus::Signing);
    }

    #[test]
    fn test_wrong_minute_owner_rejected_by_validation() {
        let fx = Fixture::new(2, 5);
        let view = ValidationView {
            list: &fx.list,
            authority_key: None,
        };
        // The owner of VM 0 differs between minutes 0 and 1 with two servers.
        let minute0_owner = fx.list.vm_owner(0, 0).unwrap();
        let minute1_owner = fx.list.vm_owner(1, 0).unwrap();
        assert_ne!(minute0_owner, minute1_owner);

        // An EOM for minute 0 signed by minute 1's owner is invalid.
        let wrong_key = fx.keypair_for(&minute1_owner);
        let mut eom = Eom::new(0, minute1_owner, 0, 0, 5);
        eom.sign(wrong_key);
        assert_eq!(eom.validate(&view), Validity::Invalid);

        // Signed by the right owner it is valid.
        let right_key = fx.keypair_for(&minute0_owner);
        let mut eom = Eom::new(0, minute0_owner, 0, 0, 5);
        eom.sign(right_key);
        assert_eq!(eom.validate(&view), Validity::Valid);
    }

    #[test]
    fn test_overdraft_commit_with_strict_balances() {
        let mut fx = Fixture::new(1, 1);
        let ec_key = Keypair::from_seed([98u8; 32]);
        let entry = Entry::new(sha256(b"chain"), vec![7]);
        fx.install(0, 0, commit_for(&entry, &ec_key));

        let mut ctx = ProcessContext {
            ec_balances: &mut fx.balances,
            factoid: &mut fx.ledger,
            allow_negative_ec_balance: false,
            chain_heads: &mut fx.chain_heads,
        };
        fx.list.process(&mut ctx);

        // Recorded in the log, no balance or block-body effect.
        assert_eq!(fx.list.vms[0].height, 1);
        assert_eq!(fx.balances[&ec_key.public_key()], 0);
        assert!(fx.list.ec_block.body.is_empty());
    }
}
