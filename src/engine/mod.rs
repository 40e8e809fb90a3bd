//! The engine: one single-threaded cooperative loop owning every piece of
//! mutable consensus state. It drains the inbound queues, advances each VM
//! cursor as far as it can, drives minute and seal transitions, and walks
//! the ten-minute wall clock.

pub mod ticker;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use lru::LruCache;
use tokio::sync::{oneshot, Mutex};

use crate::block::admin::AdminBlock;
use crate::block::directory::{DbEntry, DChain, DirectoryBlock};
use crate::block::entry_credit::{EcBlock, EcEntry};
use crate::block::factoid::FactoidLedger;
use crate::config::Configuration;
use crate::consensus::process_list::{
    ChainHead, InstallOutcome, ListStatus, PrevBlocks, ProcessContext, ProcessList, ServerChange,
    ValidationView,
};
use crate::consensus::{vm_index_for, AuditServer, FederatedServer};
use crate::engine::ticker::MinuteTicker;
use crate::message::{
    Ack, DataResponse, DbState, DirectoryBlockSignature, Eom, Message, MissingData, MissingMsg,
    ResponseData, ServerType, Validity,
};
use crate::network::{EngineChannels, OutboundMessage};
use crate::storage::{validate_chain, BlockSet, BlockStore};
use crate::utilities::crypto::{chain_id_of, Keypair, PublicKey};
use crate::utilities::hash::Hash;
use crate::utilities::time::now_ms;

/// How long a slot may stay nil before a retry request goes out.
const MISSING_RETRY: Duration = Duration::from_secs(2);
const HOLDING_CAPACITY: usize = 4096;

pub type SharedStore = Arc<Mutex<Box<dyn BlockStore + Send>>>;

pub struct Engine {
    keypair: Keypair,
    chain_id: Hash,
    network_id: u32,
    block_period: Duration,
    allow_negative_ec_balance: bool,
    authority_key: Option<PublicKey>,

    fed_servers: Vec<FederatedServer>,
    audit_servers: Vec<AuditServer>,

    dchain: DChain,
    chain_heads: HashMap<Hash, ChainHead>,
    ec_balances: HashMap<PublicKey, i32>,
    factoid: Box<dyn FactoidLedger + Send + Sync>,
    storage: SharedStore,

    current: ProcessList,
    /// Messages awaiting a dependency: their ack, their height, or their
    /// commit.
    holding: LruCache<Hash, Message>,
    /// Acks awaiting their payload.
    pending_acks: HashMap<Hash, Ack>,

    channels: EngineChannels,
    ticker: MinuteTicker,
    /// Minutes for which this node has already issued its EOMs.
    emitted_minutes: u8,
    /// Set after a height rollover; held messages get one fresh look.
    needs_retry: bool,
    /// Set when peers are visibly ahead of us; drives db-state requests.
    behind_since: Option<Instant>,
    prev_admin_lookup: Hash,
    prev_ec_header: Hash,
    prev_ec_full: Hash,
}

impl Engine {
    /// Builds the engine from configuration: loads keys and rosters, opens
    /// and validates the stored chain (building genesis when empty), and
    /// allocates the first process list.
    pub async fn init(
        config: Configuration,
        store: Box<dyn BlockStore + Send>,
        factoid: Box<dyn FactoidLedger + Send + Sync>,
        channels: EngineChannels,
    ) -> anyhow::Result<Self> {
        let keypair = if config.node.private_key.is_empty() {
            Keypair::generate()
        } else {
            Keypair::from_hex(&config.node.private_key)
                .map_err(|e| anyhow::anyhow!("node private key: {e}"))?
        };
        let chain_id = match &config.node.chain_id {
            Some(hex) => Hash::from_hex(hex)?,
            None => chain_id_of(&keypair.public_key()),
        };
        let network_id = config.consensus.network_id;

        let mut fed_servers = Vec::new();
        for entry in &config.consensus.federated_servers {
            fed_servers.push(FederatedServer {
                chain_id: Hash::from_hex(&entry.chain_id)?,
                public_key: PublicKey::from_hex(&entry.public_key)
                    .map_err(|e| anyhow::anyhow!("federated server key: {e}"))?,
            });
        }
        if fed_servers.is_empty() {
            // Single-node bootstrap: this server is the whole federation.
            fed_servers.push(FederatedServer {
                chain_id,
                public_key: keypair.public_key(),
            });
        }
        let mut audit_servers = Vec::new();
        for entry in &config.consensus.audit_servers {
            audit_servers.push(AuditServer {
                chain_id: Hash::from_hex(&entry.chain_id)?,
                public_key: PublicKey::from_hex(&entry.public_key)
                    .map_err(|e| anyhow::anyhow!("audit server key: {e}"))?,
            });
        }
        let authority_key = match &config.consensus.authority_public_key {
            Some(hex) => Some(
                PublicKey::from_hex(hex).map_err(|e| anyhow::anyhow!("authority key: {e}"))?,
            ),
            None => None,
        };

        let storage: SharedStore = Arc::new(Mutex::new(store));
        let mut factoid = factoid;

        let mut dchain = DChain::new();
        let mut ec_balances = HashMap::new();
        let mut chain_heads = HashMap::new();
        let prev_admin_lookup;
        let prev_ec_header;
        let prev_ec_full;
        {
            let mut store = storage.lock().await;
            let mut blocks = validate_chain(&**store)?;
            if blocks.is_empty() {
                let genesis = build_genesis(network_id, factoid.as_mut());
                store.save_directory_block(&genesis)?;
                log::info!("built genesis block {}", genesis.directory.key_mr());
                blocks.push(genesis.directory.clone());
            }
            let head = blocks.len() as u32 - 1;
            for block in blocks {
                dchain.push(block)?;
            }
            for height in 0..=head {
                if let Some(ec_block) = store.fetch_ec_block_by_height(height)? {
                    ec_block.apply_to_balances(&mut ec_balances);
                }
            }
            for height in 0..=head {
                if let Some(dblock) = store.fetch_dblock_by_height(height)? {
                    for row in dblock.entries.iter().skip(3) {
                        if let Some(eblock) = store.fetch_eblock_by_keymr(&row.key_mr)? {
                            chain_heads.insert(
                                row.chain_id,
                                ChainHead {
                                    sequence: eblock.header.sequence,
                                    key_mr: eblock.key_mr(),
                                    full_hash: eblock.full_hash(),
                                },
                            );
                        }
                    }
                }
            }
            prev_admin_lookup = store
                .fetch_a_block_by_height(head)?
                .map(|b| b.lookup_hash())
                .unwrap_or(Hash::ZERO);
            let prev_ec = store.fetch_ec_block_by_height(head)?;
            prev_ec_header = prev_ec.as_ref().map(|b| b.key_mr()).unwrap_or(Hash::ZERO);
            prev_ec_full = prev_ec.map(|b| b.full_hash()).unwrap_or(Hash::ZERO);
        }

        let current = make_list(
            &dchain,
            network_id,
            fed_servers.clone(),
            audit_servers.clone(),
            prev_admin_lookup,
            prev_ec_header,
            prev_ec_full,
        );
        let block_period = Duration::from_secs(config.consensus.block_period_secs.max(1));
        let mut engine = Self {
            keypair,
            chain_id,
            network_id,
            block_period,
            allow_negative_ec_balance: config.consensus.allow_negative_ec_balance,
            authority_key,
            fed_servers,
            audit_servers,
            dchain,
            chain_heads,
            ec_balances,
            factoid,
            storage,
            current,
            holding: LruCache::new(
                NonZeroUsize::new(HOLDING_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            pending_acks: HashMap::new(),
            channels,
            ticker: MinuteTicker::new(block_period),
            emitted_minutes: 0,
            needs_retry: false,
            behind_since: None,
            prev_admin_lookup,
            prev_ec_header,
            prev_ec_full,
        };
        engine.emit_directory_signature().await;
        Ok(engine)
    }

    pub fn chain_id(&self) -> Hash {
        self.chain_id
    }

    pub fn current_height(&self) -> u32 {
        self.current.dbheight
    }

    /// Clone of the guarded storage handle, for readers outside the loop.
    pub fn storage_handle(&self) -> SharedStore {
        self.storage.clone()
    }

    pub fn ec_balance(&self, key: &PublicKey) -> i32 {
        self.ec_balances.get(key).copied().unwrap_or(0)
    }

    /// Main loop. One cooperative thread: drain inbound, advance cursors,
    /// check transitions, walk the wall clock.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        log::info!(
            "engine running: height {} with {} federated servers",
            self.current.dbheight,
            self.fed_servers.len()
        );
        let idle = (self.block_period / 100).max(Duration::from_millis(5));
        loop {
            tokio::select! {
                Some(message) = self.channels.leader_in_queue.recv() => {
                    self.on_inbound(message).await;
                }
                Some(message) = self.channels.in_queue.recv() => {
                    self.on_inbound(message).await;
                }
                Some(minute) = self.ticker.next() => {
                    self.on_minute(minute).await;
                }
                _ = tokio::time::sleep(idle) => {}
                _ = &mut shutdown => {
                    log::info!("engine shutting down at height {}", self.current.dbheight);
                    break;
                }
            }
            self.run_housekeeping().await;
        }
    }

    async fn on_inbound(&mut self, message: Message) {
        log::trace!("inbound {message}");
        if self.current.already_seen(&message.msg_hash()) && !matches!(message, Message::Ack(_)) {
            // Replay of an installed pair is a no-op.
            return;
        }
        let validity = {
            let view = ValidationView {
                list: &self.current,
                authority_key: self.authority_key,
            };
            message.validate(&view)
        };
        match validity {
            Validity::Invalid => {
                log::debug!("invalid message dropped: {message}");
                let _ = self.channels.invalid_queue.try_send(message);
            }
            Validity::Undetermined => {
                if message.dbheight() > Some(self.current.dbheight)
                    && self.behind_since.is_none()
                {
                    self.behind_since = Some(Instant::now());
                }
                self.holding.put(message.msg_hash(), message);
            }
            Validity::Valid => self.route_valid(message).await,
        }
    }

    async fn route_valid(&mut self, message: Message) {
        match message {
            Message::Ack(ack) => self.on_ack(ack),
            Message::MissingMsg(request) => self.answer_missing_msg(request).await,
            Message::MissingData(request) => self.answer_missing_data(request).await,
            Message::DataResponse(response) => self.on_data_response(response),
            Message::DbState(state) => self.adopt_db_state(*state).await,
            other => self.submit_or_hold(other).await,
        }
    }

    /// Leader path when this node owns the target VM this minute, follower
    /// path otherwise.
    async fn submit_or_hold(&mut self, message: Message) {
        let (vm_index, minute) = match &message {
            Message::Eom(eom) => (eom.vm_index as usize, eom.minute),
            _ => (
                vm_index_for(&message.msg_hash(), self.current.vm_count()),
                self.current.leader_minute,
            ),
        };
        if self.current.vm_owner(minute, vm_index) == Some(self.chain_id) {
            self.leader_execute(vm_index, minute, message).await;
        } else {
            let hash = message.msg_hash();
            if let Some(ack) = self.pending_acks.remove(&hash) {
                self.try_install(ack, message);
            } else {
                self.holding.put(hash, message);
            }
        }
    }

    /// Issue the ack, install locally, broadcast both.
    async fn leader_execute(&mut self, vm_index: usize, minute: u8, message: Message) {
        let ack = self.current.create_ack(
            vm_index,
            minute,
            &message,
            now_ms(),
            self.chain_id,
            &self.keypair,
        );
        let outcome = self.current.add_to_process_list(ack.clone(), message.clone());
        if outcome != InstallOutcome::Installed && outcome != InstallOutcome::Duplicate {
            log::error!("failed to install own ack ({outcome:?}) for {message}");
            return;
        }
        let _ = self
            .channels
            .out_queue
            .send(OutboundMessage::broadcast(Message::Ack(ack)))
            .await;
        let _ = self
            .channels
            .out_queue
            .send(OutboundMessage::broadcast(message))
            .await;
    }

    fn on_ack(&mut self, ack: Ack) {
        if self.current.already_seen(&ack.message_hash) {
            return;
        }
        match self.holding.pop(&ack.message_hash) {
            Some(message) => {
                self.try_install(ack, message);
            }
            None => {
                self.pending_acks.insert(ack.message_hash, ack);
            }
        }
    }

    fn try_install(&mut self, ack: Ack, message: Message) -> InstallOutcome {
        let hash = ack.message_hash;
        let outcome = self.current.add_to_process_list(ack.clone(), message.clone());
        match outcome {
            InstallOutcome::Installed | InstallOutcome::Duplicate => {}
            InstallOutcome::Waiting => {
                // Predecessor slot still open; both halves stay around.
                self.pending_acks.insert(hash, ack);
                self.holding.put(hash, message);
            }
            InstallOutcome::SerialMismatch => {
                // The ack is bad; the payload may pair with a reissued ack.
                self.holding.put(hash, message);
            }
            InstallOutcome::Conflict | InstallOutcome::Rejected => {}
        }
        outcome
    }

    async fn answer_missing_msg(&mut self, request: MissingMsg) {
        if request.dbheight < self.current.dbheight {
            // The height is already closed here; answer with the whole set
            // so the peer can catch up.
            if let Some(state) = self.db_state_for(request.dbheight).await {
                let _ = self
                    .channels
                    .out_queue
                    .send(OutboundMessage::direct(Message::DbState(Box::new(state))))
                    .await;
            }
            return;
        }
        if request.dbheight != self.current.dbheight {
            return;
        }
        let Some(slot) = self
            .current
            .vms
            .get(request.vm_index as usize)
            .and_then(|vm| vm.slot(request.height_in_vm as usize))
        else {
            return;
        };
        let response = DataResponse::for_process_slot(
            now_ms(),
            request.dbheight,
            request.vm_index,
            request.height_in_vm,
            slot.ack.clone(),
            slot.message.clone(),
        );
        let _ = self
            .channels
            .out_queue
            .send(OutboundMessage::direct(Message::DataResponse(response)))
            .await;
    }

    async fn answer_missing_data(&mut self, request: MissingData) {
        let hash = request.data_hash;
        let entry = match self.current.new_entries.get(&hash) {
            Some(entry) => Some(entry.clone()),
            None => self
                .storage
                .lock()
                .await
                .fetch_entry_by_hash(&hash)
                .unwrap_or(None),
        };
        if let Some(entry) = entry {
            let response = DataResponse::for_entry(now_ms(), entry);
            let _ = self
                .channels
                .out_queue
                .send(OutboundMessage::direct(Message::DataResponse(response)))
                .await;
            return;
        }
        if let Ok(Some(eblock)) = self.storage.lock().await.fetch_eblock_by_keymr(&hash) {
            let response = DataResponse::for_entry_block(now_ms(), eblock);
            let _ = self
                .channels
                .out_queue
                .send(OutboundMessage::direct(Message::DataResponse(response)))
                .await;
        }
    }

    /// Rebuilds the block set of a closed height from storage.
    async fn db_state_for(&self, dbheight: u32) -> Option<DbState> {
        let store = self.storage.lock().await;
        let directory_block = store.fetch_dblock_by_height(dbheight).ok()??;
        let admin_block = store.fetch_a_block_by_height(dbheight).ok()??;
        let ec_block = store.fetch_ec_block_by_height(dbheight).ok()??;
        let factoid_block = store.fetch_f_block_by_height(dbheight).ok()??;
        let mut entry_blocks = Vec::new();
        let mut entries = Vec::new();
        for row in directory_block.entries.iter().skip(3) {
            let eblock = store.fetch_eblock_by_keymr(&row.key_mr).ok()??;
            for entry_hash in eblock.entry_hashes() {
                if let Ok(Some(entry)) = store.fetch_entry_by_hash(&entry_hash) {
                    entries.push(entry);
                }
            }
            entry_blocks.push(eblock);
        }
        Some(DbState {
            timestamp: now_ms(),
            directory_block,
            admin_block,
            ec_block,
            factoid_block,
            entry_blocks,
            entries,
        })
    }

    fn on_data_response(&mut self, response: DataResponse) {
        match response.data {
            ResponseData::ProcessSlot { ack, message, .. } => {
                // Re-enter through the normal ack path.
                self.holding.put(message.msg_hash(), *message);
                self.on_ack(ack);
            }
            ResponseData::Entry(_) | ResponseData::EntryBlock(_) => {
                log::debug!("data response for the sync layer, not the core");
            }
        }
    }

    /// A peer supplied the block set our chain is missing at its head.
    async fn adopt_db_state(&mut self, state: DbState) {
        let height = state.directory_block.header.dbheight;
        if height != self.dchain.next_height() {
            log::debug!("ignoring db state for height {height}");
            return;
        }
        if let Some(tip) = self.dchain.tip() {
            if state.directory_block.header.prev_key_mr != tip.key_mr() {
                log::warn!("db state for height {height} does not chain onto our tip");
                return;
            }
        }
        let set = BlockSet {
            directory: state.directory_block,
            admin: state.admin_block,
            entry_credit: state.ec_block,
            factoid: state.factoid_block,
            entry_blocks: state.entry_blocks,
            entries: state.entries,
        };
        {
            let mut store = self.storage.lock().await;
            if let Err(err) = store.save_directory_block(&set) {
                log::error!("cannot adopt db state at height {height}: {err}");
                return;
            }
        }
        self.absorb_saved_set(&set);
        log::info!("adopted height {height} from peer db state");
        self.start_next_height().await;
    }

    /// Local EOM emission for each VM this node owns at the given minute.
    async fn on_minute(&mut self, minute: u8) {
        if matches!(self.current.status, ListStatus::New | ListStatus::Final) {
            return;
        }
        if self.current.server_index(&self.chain_id).is_none() {
            return;
        }
        while self.emitted_minutes < 10 && self.emitted_minutes <= minute {
            let m = self.emitted_minutes;
            for vm_index in 0..self.current.vm_count() {
                if self.current.vm_owner(m, vm_index) == Some(self.chain_id) {
                    let mut eom = Eom::new(
                        now_ms(),
                        self.chain_id,
                        m,
                        vm_index as u8,
                        self.current.dbheight,
                    );
                    eom.sign(&self.keypair);
                    self.leader_execute(vm_index, m, Message::Eom(eom)).await;
                }
            }
            self.emitted_minutes += 1;
        }
    }

    async fn run_housekeeping(&mut self) {
        if self.needs_retry {
            self.needs_retry = false;
            let mut batch = Vec::new();
            while let Some((_, message)) = self.holding.pop_lru() {
                batch.push(message);
            }
            for message in batch {
                self.on_inbound(message).await;
            }
        }
        self.match_pending();
        self.process_current();
        self.check_missing().await;
        self.maybe_finalize().await;
    }

    /// Pairs buffered acks with buffered payloads.
    fn match_pending(&mut self) {
        let hashes: Vec<Hash> = self.pending_acks.keys().copied().collect();
        for hash in hashes {
            if let Some(message) = self.holding.pop(&hash) {
                if let Some(ack) = self.pending_acks.remove(&hash) {
                    self.try_install(ack, message);
                }
            }
        }
    }

    fn process_current(&mut self) {
        let mut ctx = ProcessContext {
            ec_balances: &mut self.ec_balances,
            factoid: self.factoid.as_mut(),
            allow_negative_ec_balance: self.allow_negative_ec_balance,
            chain_heads: &mut self.chain_heads,
        };
        self.current.process(&mut ctx);
    }

    /// Two-second retry timers: gaps at the cursor, and the seal-stall
    /// detector once sealing has begun.
    async fn check_missing(&mut self) {
        let now = Instant::now();
        let sealing = self.current.sealing;
        let dbheight = self.current.dbheight;
        let mut requests = Vec::new();
        for (vm_index, vm) in self.current.vms.iter_mut().enumerate() {
            if vm.stalled_on_gap() {
                match vm.missing_time {
                    None => vm.missing_time = Some(now),
                    Some(since) if now.duration_since(since) >= MISSING_RETRY => {
                        requests.push((vm_index as u8, vm.height as u32));
                        vm.missing_time = Some(now);
                    }
                    Some(_) => {}
                }
            } else {
                vm.missing_time = None;
            }
            if sealing && vm.seal == 0 {
                match vm.seal_time {
                    None => vm.seal_time = Some(now),
                    Some(since) if now.duration_since(since) >= MISSING_RETRY => {
                        // Leader stall: the sealing EOM never arrived.
                        requests.push((vm_index as u8, vm.list.len() as u32));
                        vm.seal_time = Some(now);
                    }
                    Some(_) => {}
                }
            }
        }
        for (vm_index, height_in_vm) in requests {
            log::debug!(
                "requesting missing slot dbht:{dbheight} vm:{vm_index} ht:{height_in_vm}"
            );
            let request = MissingMsg::new(now_ms(), dbheight, vm_index, height_in_vm);
            let _ = self
                .channels
                .out_queue
                .send(OutboundMessage::broadcast(Message::MissingMsg(request)))
                .await;
        }

        // Peers are ahead of this node; ask for the height we are missing.
        // Whoever has closed it answers with a DBState set.
        if let Some(since) = self.behind_since {
            if now.duration_since(since) >= MISSING_RETRY {
                let request = MissingMsg::new(now_ms(), dbheight, 0, 0);
                let _ = self
                    .channels
                    .out_queue
                    .send(OutboundMessage::broadcast(Message::MissingMsg(request)))
                    .await;
                self.behind_since = Some(now);
            }
        }
    }

    async fn maybe_finalize(&mut self) {
        if !self.current.ready_to_finalize() {
            return;
        }
        let set = {
            let mut ctx = ProcessContext {
                ec_balances: &mut self.ec_balances,
                factoid: self.factoid.as_mut(),
                allow_negative_ec_balance: self.allow_negative_ec_balance,
                chain_heads: &mut self.chain_heads,
            };
            self.current.finalize(&mut ctx)
        };
        {
            let mut store = self.storage.lock().await;
            if let Err(err) = store.save_directory_block(&set) {
                // A failed commit of a locally built block is a broken
                // invariant; no partial write may stay visible.
                panic!(
                    "storage commit failed at height {}: {err}",
                    set.directory.header.dbheight
                );
            }
        }
        log::info!(
            "height {} closed: dblock {} ({} entry blocks)",
            set.directory.header.dbheight,
            set.directory.key_mr(),
            set.entry_blocks.len()
        );
        self.absorb_saved_set(&set);
        self.apply_server_changes();
        self.start_next_height().await;
    }

    /// Book-keeping shared by local closure and peer adoption.
    fn absorb_saved_set(&mut self, set: &BlockSet) {
        if let Err(err) = self.dchain.push(set.directory.clone()) {
            panic!("directory chain corrupted: {err}");
        }
        for eblock in &set.entry_blocks {
            self.chain_heads.insert(
                eblock.chain_id(),
                ChainHead {
                    sequence: eblock.header.sequence,
                    key_mr: eblock.key_mr(),
                    full_hash: eblock.full_hash(),
                },
            );
        }
        self.prev_admin_lookup = set.admin.lookup_hash();
        self.prev_ec_header = set.entry_credit.key_mr();
        self.prev_ec_full = set.entry_credit.full_hash();
    }

    fn apply_server_changes(&mut self) {
        let changes = std::mem::take(&mut self.current.server_changes);
        for change in changes {
            match change {
                ServerChange::Add {
                    chain_id,
                    server_type: ServerType::Federated,
                } => {
                    if self.fed_servers.iter().any(|s| s.chain_id == chain_id) {
                        continue;
                    }
                    if let Some(pos) = self
                        .audit_servers
                        .iter()
                        .position(|s| s.chain_id == chain_id)
                    {
                        let audit = self.audit_servers.remove(pos);
                        log::info!("promoting audit server {chain_id} to federated");
                        self.fed_servers.push(FederatedServer {
                            chain_id: audit.chain_id,
                            public_key: audit.public_key,
                        });
                    } else {
                        log::warn!("cannot add federated server {chain_id}: key unknown");
                    }
                }
                ServerChange::Add {
                    chain_id,
                    server_type: ServerType::Audit,
                } => {
                    log::warn!("cannot add audit server {chain_id}: key unknown");
                }
                ServerChange::Remove {
                    chain_id,
                    server_type,
                } => match server_type {
                    ServerType::Federated => {
                        if self.fed_servers.len() == 1 {
                            log::warn!("refusing to remove the last federated server");
                            continue;
                        }
                        self.fed_servers.retain(|s| s.chain_id != chain_id);
                    }
                    ServerType::Audit => {
                        self.audit_servers.retain(|s| s.chain_id != chain_id);
                    }
                },
            }
        }
    }

    async fn start_next_height(&mut self) {
        self.current = make_list(
            &self.dchain,
            self.network_id,
            self.fed_servers.clone(),
            self.audit_servers.clone(),
            self.prev_admin_lookup,
            self.prev_ec_header,
            self.prev_ec_full,
        );
        self.emitted_minutes = 0;
        self.pending_acks.clear();
        self.needs_retry = true;
        self.behind_since = None;
        log::debug!("opened process list for height {}", self.current.dbheight);
        self.emit_directory_signature().await;
    }

    /// Our signature over the just-closed predecessor, acked into the new
    /// list as its opening message.
    async fn emit_directory_signature(&mut self) {
        if self.current.server_index(&self.chain_id).is_none() {
            return;
        }
        let mut signature = DirectoryBlockSignature::new(
            now_ms(),
            self.chain_id,
            self.current.dbheight,
            self.current.prev_key_mr(),
        );
        signature.sign(&self.keypair);
        let message = Message::DirectoryBlockSignature(signature);
        let vm_index = vm_index_for(&message.msg_hash(), self.current.vm_count());
        let minute = self.current.leader_minute;
        if self.current.vm_owner(minute, vm_index) == Some(self.chain_id) {
            self.leader_execute(vm_index, minute, message).await;
        } else {
            let _ = self
                .channels
                .out_queue
                .send(OutboundMessage::broadcast(message))
                .await;
        }
    }
}

fn make_list(
    dchain: &DChain,
    network_id: u32,
    fed_servers: Vec<FederatedServer>,
    audit_servers: Vec<AuditServer>,
    prev_admin_lookup: Hash,
    prev_ec_header: Hash,
    prev_ec_full: Hash,
) -> ProcessList {
    let prev = PrevBlocks {
        directory: dchain.tip(),
        admin_lookup_hash: prev_admin_lookup,
        ec_header_hash: prev_ec_header,
        ec_full_hash: prev_ec_full,
    };
    let mut list = ProcessList::new(
        dchain.next_height(),
        network_id,
        fed_servers,
        audit_servers,
        prev,
    );
    list.mark_good();
    list
}

/// The height-0 block set: empty admin block, the seeded entry-credit
/// block, the ledger's first factoid block, and a directory block with zero
/// previous hashes.
fn build_genesis(network_id: u32, factoid: &mut dyn FactoidLedger) -> BlockSet {
    let mut admin = AdminBlock::new(0, Hash::ZERO);
    let mut entry_credit = EcBlock::new(0, Hash::ZERO, Hash::ZERO);
    entry_credit.add_entry(EcEntry::ServerIndexNumber(0));
    for minute in 0..10u8 {
        entry_credit.add_entry(EcEntry::MinuteNumber(minute + 1));
    }
    let factoid_block = factoid.seal_block(0);
    admin.seal();
    entry_credit.seal();
    let mut directory = DirectoryBlock::new(network_id, 0, None);
    directory.set_system_entries(
        DbEntry::from_admin_block(&admin),
        DbEntry::from_ec_block(&entry_credit),
        DbEntry::from_factoid_block(&factoid_block),
    );
    directory.seal();
    BlockSet {
        directory,
        admin,
        entry_credit,
        factoid: factoid_block,
        entry_blocks: Vec::new(),
        entries: Vec::new(),
    }
}
