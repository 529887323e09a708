//! Chain state: index maintenance, input connection, best-chain selection,
//! and reorganization.
//!
//! Everything here runs under the manager's main lock. Disk mutation goes
//! through a `StoreTxn`; in-memory forward links and the mempool only change
//! after the transaction commits, so a crash at any point leaves the node on
//! one of the two endpoints of the attempted transition.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nucleod_consensus::constants::{future_drift, MAX_BLOCK_SIGOPS, MAX_TIP_AGE, MN_PAYEE_MAX_BLOCK_AGE};
use nucleod_consensus::money::{money_range, Amount, MIN_TX_FEE};
use nucleod_consensus::params::{ChainParams, Network};
use nucleod_consensus::rewards::{
    developer_payment, masternode_payment, proof_of_stake_reward, proof_of_work_reward,
};
use nucleod_consensus::sporks::{SporkId, SporkSet};
use nucleod_consensus::Hash256;
use nucleod_pow::difficulty::{block_trust, compact_to_u256, compute_max_bits, ProofHeader};
use nucleod_pow::next_target_required;
use nucleod_primitives::block::{Block, BlockHeader};
use nucleod_primitives::encoding::{compact_size_len, Decodable, Decoder, Encodable};
use nucleod_primitives::hash::hash256_short;
use nucleod_primitives::outpoint::OutPoint;
use nucleod_primitives::transaction::Transaction;
use nucleod_script::interpreter::{
    verify_signature, MANDATORY_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS,
};
use nucleod_script::opcodes::push_number;
use nucleod_script::secp::parse_pubkey_hex;
use nucleod_script::standard::{p2sh_sigop_count, sigop_count};
use nucleod_stake::kernel::{check_stake_kernel_hash, KernelCheck, StakeKernel};
use nucleod_stake::modifier::{
    compute_next_stake_modifier, selection_interval, stake_modifier_checksum, BlockSummary,
};
use nucleod_stake::check_coinstake_timestamp;
use nucleod_storage::{Column, KeyValueStore, StoreTxn};
use primitive_types::U256;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::blockfiles::{BlockFileStore, BlockPos};
use crate::blockindex::{
    decode_index_node, encode_index_node, BlockId, BlockIndex, BlockIndexNode,
};
use crate::checkpoints::{CheckpointMode, SyncCheckpointMessage, SyncCheckpoints};
use crate::error::{ChainError, TransientKind};
use crate::mempool::Mempool;
use crate::orphans::{OrphanBlockPool, OrphanTxPool};
use crate::ratelimit::FreeTxRateLimiter;
use crate::subscribers::{Hooks, PeerOps};
use crate::txindex::{DiskTxPos, TxIndexEntry};
use crate::validation::{
    check_block, check_transaction, get_min_fee, is_standard_tx, standardness_applies, FeeMode,
    ValidationFlags,
};

const META_BEST_CHAIN: &[u8] = b"best_chain";
const META_BEST_INVALID_TRUST: &[u8] = b"best_invalid_trust";
const META_SYNC_CHECKPOINT: &[u8] = b"sync_checkpoint";

const BLOCK_HEADER_LEN: usize = 80;

/// Time source; tests pin it.
#[derive(Clone)]
pub enum Clock {
    System,
    Fixed(Arc<AtomicI64>),
}

impl Clock {
    pub fn fixed(now: i64) -> (Self, Arc<AtomicI64>) {
        let cell = Arc::new(AtomicI64::new(now));
        (Clock::Fixed(Arc::clone(&cell)), cell)
    }

    pub fn now(&self) -> i64 {
        match self {
            Clock::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs() as i64)
                .unwrap_or(0),
            Clock::Fixed(cell) => cell.load(Ordering::Relaxed),
        }
    }
}

/// The genesis block is reconstructed from parameters at startup.
pub fn genesis_block(params: &ChainParams) -> Block {
    const TIMESTAMP_TEXT: &[u8] = b"20 Feb 2014 Bitcoin ATMs come to USA";
    let mut script_sig = vec![0x00, 0x01, 0x2a, TIMESTAMP_TEXT.len() as u8];
    script_sig.extend_from_slice(TIMESTAMP_TEXT);

    let coinbase = Transaction {
        version: 1,
        time: params.consensus.genesis_time,
        vin: vec![nucleod_primitives::transaction::TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![nucleod_primitives::transaction::TxOut::empty()],
        lock_time: 0,
    };
    let merkle_root = coinbase.txid();
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root,
            time: params.consensus.genesis_time,
            bits: params.consensus.genesis_bits,
            nonce: params.consensus.genesis_nonce,
        },
        transactions: vec![coinbase],
        signature: Vec::new(),
    }
}

type FetchedInputs = HashMap<Hash256, (TxIndexEntry, Transaction)>;

/// Deferred ECDSA check, batched and verified in parallel per block.
struct ScriptCheck {
    tx_index: usize,
    input_index: usize,
    script_pubkey: Vec<u8>,
}

enum IndexReader<'a> {
    Store(&'a dyn KeyValueStore),
    Txn(&'a StoreTxn<'a>),
}

impl<'a> IndexReader<'a> {
    fn get(&self, txid: &Hash256) -> Result<Option<TxIndexEntry>, ChainError> {
        let bytes = match self {
            IndexReader::Store(store) => store.get(Column::TxIndex, txid)?,
            IndexReader::Txn(txn) => txn.get(Column::TxIndex, txid)?,
        };
        match bytes {
            Some(bytes) => Ok(Some(TxIndexEntry::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn contains(&self, txid: &Hash256) -> Result<bool, ChainError> {
        Ok(self.get(txid)?.is_some())
    }
}

pub struct ChainState {
    params: ChainParams,
    sporks: SporkSet,
    store: Arc<dyn KeyValueStore>,
    block_files: BlockFileStore,
    pub(crate) index: BlockIndex,
    genesis: Option<BlockId>,
    best: Option<BlockId>,
    best_trust: U256,
    best_invalid_trust: U256,
    time_best_received: i64,
    last_best_coinbase: Hash256,
    orphan_blocks: OrphanBlockPool,
    orphan_txs: OrphanTxPool,
    stake_seen: HashSet<(OutPoint, u32)>,
    checkpoints: SyncCheckpoints,
    clock: Clock,
    flags: ValidationFlags,
    ibd_latched_false: bool,
    orphan_rng: StdRng,
    misc_warning: String,
}

impl ChainState {
    pub fn new(
        params: ChainParams,
        store: Arc<dyn KeyValueStore>,
        block_files: BlockFileStore,
        clock: Clock,
    ) -> Self {
        let master_pubkey = parse_pubkey_hex(params.checkpoint_pubkey).unwrap_or_default();
        Self {
            params,
            sporks: SporkSet::default(),
            store,
            block_files,
            index: BlockIndex::new(),
            genesis: None,
            best: None,
            best_trust: U256::zero(),
            best_invalid_trust: U256::zero(),
            time_best_received: 0,
            last_best_coinbase: [0u8; 32],
            orphan_blocks: OrphanBlockPool::new(),
            orphan_txs: OrphanTxPool::new(),
            stake_seen: HashSet::new(),
            checkpoints: SyncCheckpoints::new(CheckpointMode::Strict, master_pubkey),
            clock,
            flags: ValidationFlags::default(),
            ibd_latched_false: false,
            orphan_rng: StdRng::from_entropy(),
            misc_warning: String::new(),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn validation_flags(&self) -> ValidationFlags {
        self.flags
    }

    pub fn set_validation_flags(&mut self, flags: ValidationFlags) {
        self.flags = flags;
    }

    pub fn set_spork(&mut self, id: SporkId, value: i64) {
        self.sporks.set_value(id, value);
    }

    pub fn spork_value(&self, id: SporkId) -> i64 {
        self.sporks.value(id)
    }

    pub fn set_checkpoint_mode(&mut self, mode: CheckpointMode) {
        self.checkpoints.set_mode(mode);
    }

    pub fn warning(&self) -> &str {
        &self.misc_warning
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn best_id(&self) -> Option<BlockId> {
        self.best
    }

    pub fn best_hash(&self) -> Option<Hash256> {
        self.best.map(|id| self.index.hash(id))
    }

    pub fn best_height(&self) -> i32 {
        self.best.map(|id| self.index.node(id).height).unwrap_or(-1)
    }

    pub fn best_trust(&self) -> U256 {
        self.best_trust
    }

    pub fn orphan_block_count(&self) -> usize {
        self.orphan_blocks.len()
    }

    pub fn orphan_tx_count(&self) -> usize {
        self.orphan_txs.len()
    }

    pub fn contains_block(&self, hash: &Hash256) -> bool {
        self.index.contains(hash)
    }

    pub fn has_orphan_block(&self, hash: &Hash256) -> bool {
        self.orphan_blocks.contains(hash)
    }

    pub fn orphan_root(&self, hash: &Hash256) -> Option<Hash256> {
        self.orphan_blocks.orphan_root(hash)
    }

    pub fn contains_tx_on_disk(&self, txid: &Hash256) -> Result<bool, ChainError> {
        IndexReader::Store(self.store.as_ref()).contains(txid)
    }

    pub fn block_locator_from_best(&self) -> Vec<Hash256> {
        self.best
            .map(|id| self.index.locator(id))
            .unwrap_or_default()
    }

    /// Initialize from disk, creating the genesis block when empty.
    pub fn init(&mut self, hooks: &Hooks, pool: &mut Mempool) -> Result<(), ChainError> {
        self.load_block_index()?;
        if !self.index.is_empty() {
            nucleod_log::log_info!(
                "loaded block index: {} blocks, best height {}",
                self.index.len(),
                self.best_height()
            );
            return Ok(());
        }

        let genesis = genesis_block(&self.params);
        let genesis_hash = genesis.hash();
        if self.params.network == Network::Regtest {
            self.params.consensus.hash_genesis_block = genesis_hash;
        } else if genesis_hash != self.params.consensus.hash_genesis_block {
            return Err(ChainError::Fatal(format!(
                "constructed genesis hash {} does not match parameters",
                hash256_short(&genesis_hash)
            )));
        }

        let bytes = genesis.encode_to_vec();
        let pos = self.block_files.append_block(&bytes)?;
        self.add_to_block_index(hooks, pool, &genesis, pos, [0u8; 32])?;
        nucleod_log::log_info!("initialized new chain at genesis {}", hash256_short(&genesis_hash));
        Ok(())
    }

    fn load_block_index(&mut self) -> Result<(), ChainError> {
        let entries = self.store.scan(Column::BlockIndex)?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut disk_nodes = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key.len() != 32 {
                return Err(ChainError::Fatal("corrupt block index key".to_string()));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key);
            disk_nodes.push(decode_index_node(hash, &value)?);
        }
        // Parents must exist before children; heights give that order.
        disk_nodes.sort_by_key(|disk| disk.node.height);

        for disk in disk_nodes {
            let mut node = disk.node;
            if node.height > 0 {
                let parent = self.index.lookup(&disk.prev_hash).ok_or_else(|| {
                    ChainError::Fatal("block index parent missing on load".to_string())
                })?;
                node.parent = Some(parent);
                node.chain_trust =
                    self.index.node(parent).chain_trust + block_trust(node.bits);
            } else {
                node.chain_trust = block_trust(node.bits);
                // Trust accumulates from genesis.
            }
            let is_pos = node.is_proof_of_stake;
            let stake = (node.stake_prevout, node.stake_time);
            let id = self.index.insert(node);
            if self.index.node(id).height == 0 {
                self.genesis = Some(id);
            }
            if is_pos {
                self.stake_seen.insert(stake);
            }
        }

        // Rebuild the active chain from the persisted best hash.
        let best_hash = self
            .store
            .get(Column::Meta, META_BEST_CHAIN)?
            .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
            .ok_or_else(|| ChainError::Fatal("best chain hash missing".to_string()))?;
        let best = self
            .index
            .lookup(&best_hash)
            .ok_or_else(|| ChainError::Fatal("best chain hash not in index".to_string()))?;
        self.best = Some(best);
        self.best_trust = self.index.node(best).chain_trust;
        let mut cursor = best;
        while let Some(parent) = self.index.parent(cursor) {
            self.index.node_mut(parent).next = Some(cursor);
            cursor = parent;
        }

        if let Some(bytes) = self.store.get(Column::Meta, META_BEST_INVALID_TRUST)? {
            if bytes.len() == 32 {
                self.best_invalid_trust = U256::from_little_endian(&bytes);
            }
        }
        if let Some(bytes) = self.store.get(Column::Meta, META_SYNC_CHECKPOINT)? {
            if let Ok(hash) = <[u8; 32]>::try_from(bytes.as_slice()) {
                self.checkpoints.set_current(hash);
            }
        }
        Ok(())
    }

    /// Initial block download: behind the checkpoint estimate, or the tip
    /// is stale. Latches to false once left.
    pub fn is_initial_block_download(&mut self) -> bool {
        if self.ibd_latched_false {
            return false;
        }
        let Some(best) = self.best else {
            return true;
        };
        if self.best_height() < self.params.consensus.total_blocks_estimate() {
            return true;
        }
        if self.index.node(best).block_time() < self.now() - MAX_TIP_AGE {
            return true;
        }
        self.ibd_latched_false = true;
        false
    }

    // ---- transaction admission -------------------------------------------

    /// Contextual mempool admission. `check_inputs` is disabled when
    /// resurrecting transactions after a reorganization.
    pub fn accept_tx(
        &mut self,
        hooks: &Hooks,
        pool: &mut Mempool,
        limiter: &mut FreeTxRateLimiter,
        tx: Transaction,
        check_inputs: bool,
        limit_free: bool,
    ) -> Result<Hash256, ChainError> {
        check_transaction(&tx, self.params.network)?;

        if tx.is_coinbase() {
            return Err(ChainError::reject(100, "coinbase as individual tx"));
        }
        if tx.is_coinstake() {
            return Err(ChainError::reject(100, "coinstake as individual tx"));
        }

        if standardness_applies(&self.params) && !is_standard_tx(&tx) {
            return Err(ChainError::reject(0, "nonstandard transaction"));
        }

        let txid = tx.txid();
        if pool.contains(&txid) {
            return Err(ChainError::Transient(TransientKind::AlreadyInPool));
        }
        if self.contains_tx_on_disk(&txid)? {
            return Err(ChainError::Transient(TransientKind::AlreadyHave));
        }

        // No replacement: any input already spent in-pool is a conflict.
        for input in &tx.vin {
            if pool.spender_of(&input.prevout).is_some() {
                return Err(ChainError::reject(0, "conflicts with in-pool transaction"));
            }
        }

        if check_inputs {
            let reader = IndexReader::Store(self.store.as_ref());
            let mut inputs = self.fetch_inputs(&reader, pool, &tx, None, false)?;

            let value_in = Self::value_in(&inputs, &tx)?;
            let fees = value_in - tx.value_out();
            let size = tx.serialized_size();

            let min_fee = get_min_fee(&tx, 1_000, FeeMode::Relay, size);
            if (limit_free && fees < min_fee) || (!limit_free && fees < MIN_TX_FEE) {
                return Err(ChainError::reject(0, "insufficient fee"));
            }

            // Continuously rate-limit free transactions to bound
            // penny-flooding.
            if limit_free && fees < MIN_TX_FEE && !limiter.allow(size, self.now()) {
                return Err(ChainError::reject(0, "free transaction rejected by rate limiter"));
            }

            self.connect_inputs(
                &tx,
                &txid,
                &mut inputs,
                None,
                DiskTxPos::memory(),
                self.best,
                false,
                false,
                None,
            )?;
        }

        pool.insert(txid, tx.clone());
        nucleod_log::log_info!(
            "accepted tx {} into mempool ({} entries)",
            hash256_short(&txid),
            pool.len()
        );
        hooks.sync_tx(&tx, None, true);
        hooks.relay_transaction(&tx, &txid);
        Ok(txid)
    }

    /// Feed an accepted transaction to the orphan pool, re-admitting every
    /// dependent that becomes connectable.
    pub fn resolve_orphan_txs(
        &mut self,
        hooks: &Hooks,
        pool: &mut Mempool,
        limiter: &mut FreeTxRateLimiter,
        accepted: Hash256,
    ) {
        let mut work_queue = vec![accepted];
        let mut erase_queue = Vec::new();
        let mut cursor = 0usize;
        while cursor < work_queue.len() {
            let parent = work_queue[cursor];
            cursor += 1;
            for orphan_hash in self.orphan_txs.children_of(&parent) {
                let Some(orphan) = self.orphan_txs.get(&orphan_hash).cloned() else {
                    continue;
                };
                match self.accept_tx(hooks, pool, limiter, orphan, true, true) {
                    Ok(txid) => {
                        nucleod_log::log_info!("accepted orphan tx {}", hash256_short(&txid));
                        work_queue.push(txid);
                        erase_queue.push(txid);
                    }
                    Err(err) if err.is_transient(TransientKind::MissingInputs) => {}
                    Err(_) => {
                        // Permanently bad orphan.
                        erase_queue.push(orphan_hash);
                        nucleod_log::log_info!(
                            "removed invalid orphan tx {}",
                            hash256_short(&orphan_hash)
                        );
                    }
                }
            }
        }
        for txid in erase_queue {
            self.orphan_txs.erase(&txid);
        }
    }

    pub fn orphan_tx_contains(&self, txid: &Hash256) -> bool {
        self.orphan_txs.contains(txid)
    }

    pub fn orphan_erase(&mut self, txid: &Hash256) {
        self.orphan_txs.erase(txid);
    }

    pub fn add_orphan_tx(&mut self, tx: Transaction) -> bool {
        let stored = self.orphan_txs.insert(tx);
        let evicted = self.orphan_txs.default_limit(&mut self.orphan_rng);
        if evicted > 0 {
            nucleod_log::log_info!("orphan tx overflow, removed {evicted}");
        }
        stored
    }

    /// Locate each input's previous transaction via (queued overlay, disk
    /// index, mempool), in that order.
    fn fetch_inputs(
        &self,
        reader: &IndexReader<'_>,
        pool: &Mempool,
        tx: &Transaction,
        queued: Option<&HashMap<Hash256, TxIndexEntry>>,
        in_block: bool,
    ) -> Result<FetchedInputs, ChainError> {
        let mut inputs = FetchedInputs::new();
        if tx.is_coinbase() {
            return Ok(inputs);
        }

        for input in &tx.vin {
            let prev_hash = input.prevout.hash;
            if inputs.contains_key(&prev_hash) {
                continue;
            }

            let mut entry = match queued.and_then(|map| map.get(&prev_hash)) {
                Some(entry) => Some(entry.clone()),
                None => reader.get(&prev_hash)?,
            };

            if entry.is_none() && in_block {
                nucleod_log::log_debug!(
                    "prev tx {} index entry not found",
                    hash256_short(&prev_hash)
                );
                return Err(ChainError::reject(0, "prev tx index entry not found"));
            }

            let prev_tx = match &entry {
                Some(found) if !found.pos.is_memory() => self.read_tx_at(found.pos)?,
                _ => match pool.get(&prev_hash) {
                    Some(prev) => {
                        let prev = prev.clone();
                        if entry.is_none() {
                            entry = Some(TxIndexEntry::new(DiskTxPos::memory(), prev.vout.len()));
                        }
                        prev
                    }
                    None => return Err(ChainError::Transient(TransientKind::MissingInputs)),
                },
            };

            let entry = entry.expect("entry populated above");
            inputs.insert(prev_hash, (entry, prev_tx));
        }

        // Range-check every prevout index against what was fetched.
        for input in &tx.vin {
            let (entry, prev_tx) = &inputs[&input.prevout.hash];
            let index = input.prevout.index as usize;
            if index >= prev_tx.vout.len() || index >= entry.spent.len() {
                return Err(ChainError::reject(100, "prevout index out of range"));
            }
        }

        Ok(inputs)
    }

    fn value_in(inputs: &FetchedInputs, tx: &Transaction) -> Result<Amount, ChainError> {
        let mut total: Amount = 0;
        for input in &tx.vin {
            let (_, prev_tx) = &inputs[&input.prevout.hash];
            let value = prev_tx.vout[input.prevout.index as usize].value;
            total += value;
            if !money_range(value) || !money_range(total) {
                return Err(ChainError::reject(100, "txin values out of range"));
            }
        }
        Ok(total)
    }

    /// Consume `tx`'s inputs against the fetched previous transactions.
    ///
    /// Cheap structural checks run first; signature verification only
    /// happens once every input has passed, and block connection defers it
    /// into a batch.
    #[allow(clippy::too_many_arguments)]
    fn connect_inputs(
        &self,
        tx: &Transaction,
        txid: &Hash256,
        inputs: &mut FetchedInputs,
        mut queued: Option<&mut HashMap<Hash256, TxIndexEntry>>,
        pos_this_tx: DiskTxPos,
        block_parent: Option<BlockId>,
        in_block: bool,
        tolerate_spent: bool,
        mut deferred: Option<(&mut Vec<ScriptCheck>, usize)>,
    ) -> Result<(), ChainError> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let weight = if in_block { 100 } else { 0 };

        let mut value_in: Amount = 0;
        for input in &tx.vin {
            let (entry, prev_tx) = inputs
                .get(&input.prevout.hash)
                .ok_or(ChainError::reject(100, "prevout missing from fetch"))?;
            let index = input.prevout.index as usize;
            if index >= prev_tx.vout.len() || index >= entry.spent.len() {
                return Err(ChainError::reject(100, "prevout index out of range"));
            }

            // Matured coinbase/coinstake only.
            if (prev_tx.is_coinbase() || prev_tx.is_coinstake()) && !entry.pos.is_memory() {
                if let Some(anchor) = block_parent {
                    let anchor_height = self.index.node(anchor).height;
                    for ancestor in self.index.ancestors(anchor) {
                        let node = self.index.node(ancestor);
                        if anchor_height - node.height >= self.params.consensus.coinbase_maturity {
                            break;
                        }
                        if node.pos.file == entry.pos.file
                            && node.pos.offset == entry.pos.block_offset
                        {
                            return Err(ChainError::reject(
                                0,
                                "tried to spend immature generation output",
                            ));
                        }
                    }
                }
            }

            if prev_tx.time > tx.time {
                return Err(ChainError::reject(
                    weight,
                    "transaction timestamp earlier than input transaction",
                ));
            }

            let value = prev_tx.vout[index].value;
            value_in += value;
            if !money_range(value) || !money_range(value_in) {
                return Err(ChainError::reject(weight, "txin values out of range"));
            }
        }

        // Double-spend and signature pass, now that the inexpensive checks
        // have all succeeded.
        let skip_signatures = in_block
            && self.best_height() < self.params.consensus.total_blocks_estimate();
        for (input_index, input) in tx.vin.iter().enumerate() {
            let (entry, prev_tx) = inputs
                .get_mut(&input.prevout.hash)
                .ok_or(ChainError::reject(100, "prevout missing from fetch"))?;
            let index = input.prevout.index as usize;

            if entry.spent[index].is_some() {
                if tolerate_spent {
                    nucleod_log::log_debug!(
                        "skipping already-connected input of {}",
                        hash256_short(txid)
                    );
                    continue;
                }
                // No DoS on purpose: punishing this would let an attacker
                // split the network with a well-timed double-spend.
                return Err(ChainError::reject(0, "input already spent"));
            }

            if !skip_signatures {
                let script_pubkey = prev_tx.vout[index].script_pubkey.clone();
                match &mut deferred {
                    Some((checks, tx_index)) => checks.push(ScriptCheck {
                        tx_index: *tx_index,
                        input_index,
                        script_pubkey,
                    }),
                    None => {
                        // Standard rules gate relay only where standardness
                        // itself applies; test networks verify consensus
                        // rules alone.
                        let flags = if standardness_applies(&self.params) {
                            STANDARD_SCRIPT_VERIFY_FLAGS
                        } else {
                            MANDATORY_SCRIPT_VERIFY_FLAGS
                        };
                        verify_signature(&input.script_sig, &script_pubkey, tx, input_index, flags)
                            .map_err(|_| ChainError::reject(100, "signature verification failed"))?;
                    }
                }
            }

            entry.spent[index] = Some(pos_this_tx);
            if let Some(queued) = queued.as_deref_mut() {
                queued.insert(input.prevout.hash, entry.clone());
            }
        }

        if !tx.is_coinstake() {
            let value_out = tx.value_out();
            if value_in < value_out {
                return Err(ChainError::reject(weight, "value in below value out"));
            }
            let fee = value_in - value_out;
            if fee < 0 {
                return Err(ChainError::reject(weight, "negative fee"));
            }
            if in_block && fee < get_min_fee(tx, 1, FeeMode::Block, tx.serialized_size()) {
                return Err(ChainError::reject(100, "fee below required minimum"));
            }
        }

        Ok(())
    }

    fn read_tx_at(&self, pos: DiskTxPos) -> Result<Transaction, ChainError> {
        let payload = self.block_files.read_block(BlockPos {
            file: pos.file,
            offset: pos.block_offset,
        })?;
        let relative = (pos.tx_offset - pos.block_offset) as usize;
        if relative >= payload.len() {
            return Err(ChainError::Fatal("tx offset outside block".to_string()));
        }
        let mut decoder = Decoder::new(&payload[relative..]);
        Ok(Transaction::consensus_decode(&mut decoder)?)
    }

    fn read_block_at(&self, pos: BlockPos) -> Result<Block, ChainError> {
        let payload = self.block_files.read_block(pos)?;
        Ok(Block::decode(&payload)?)
    }

    /// Offsets of each transaction within the serialized block payload.
    fn tx_offsets(block: &Block) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(block.transactions.len());
        let mut cursor =
            BLOCK_HEADER_LEN + compact_size_len(block.transactions.len() as u64);
        for tx in &block.transactions {
            offsets.push(cursor);
            cursor += tx.serialized_size();
        }
        offsets
    }

    // ---- stake checks ----------------------------------------------------

    /// Verify the stake kernel of a coinstake against `bits`, returning the
    /// proof hash on success.
    pub fn check_proof_of_stake(
        &self,
        coinstake: &Transaction,
        bits: u32,
    ) -> Result<KernelCheck, ChainError> {
        if !coinstake.is_coinstake() {
            return Err(ChainError::reject(100, "not a coinstake"));
        }
        let kernel_input = &coinstake.vin[0];
        let reader = IndexReader::Store(self.store.as_ref());
        let Some(entry) = reader.get(&kernel_input.prevout.hash)? else {
            // The staked output is not indexed yet; tolerated while syncing.
            return Err(ChainError::reject(0, "stake prevout not in main chain"));
        };
        if entry.pos.is_memory() {
            return Err(ChainError::reject(0, "stake prevout not yet mined"));
        }
        let prev_tx = self.read_tx_at(entry.pos)?;
        let index = kernel_input.prevout.index as usize;
        if index >= prev_tx.vout.len() {
            return Err(ChainError::reject(100, "stake prevout index out of range"));
        }

        let block_payload = self.block_files.read_block(BlockPos {
            file: entry.pos.file,
            offset: entry.pos.block_offset,
        })?;
        let mut decoder = Decoder::new(&block_payload);
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        let from_id = self
            .index
            .lookup(&header.hash())
            .ok_or(ChainError::reject(0, "stake source block not indexed"))?;
        let from_node = self.index.node(from_id);

        let kernel = StakeKernel {
            stake_modifier: from_node.stake_modifier,
            block_from_time: from_node.block_time(),
            tx_prev_offset: (entry.pos.tx_offset - entry.pos.block_offset) as u32,
            tx_prev_time: prev_tx.time,
            prevout: kernel_input.prevout,
            tx_time: coinstake.time,
        };
        let value = prev_tx.vout[index].value;
        check_stake_kernel_hash(bits, &kernel, value, &self.params.consensus)
            .map_err(|_| ChainError::reject(0, "check kernel hash failed"))
    }

    fn proof_headers_from(&self, id: BlockId) -> impl Iterator<Item = ProofHeader> + '_ {
        self.index.ancestors(id).map(|ancestor| {
            let node = self.index.node(ancestor);
            ProofHeader {
                time: node.block_time(),
                bits: node.bits,
                is_proof_of_stake: node.is_proof_of_stake,
                is_genesis: node.height == 0,
            }
        })
    }

    pub fn next_target(&self, parent: BlockId, is_proof_of_stake: bool) -> u32 {
        next_target_required(
            self.proof_headers_from(parent),
            is_proof_of_stake,
            &self.params.consensus,
        )
    }

    fn last_bits_of_kind(&self, from: BlockId, is_proof_of_stake: bool) -> u32 {
        for ancestor in self.index.ancestors(from) {
            let node = self.index.node(ancestor);
            if node.is_proof_of_stake == is_proof_of_stake || node.height == 0 {
                return node.bits;
            }
        }
        self.index.node(from).bits
    }

    // ---- block admission -------------------------------------------------

    /// Full inbound path: duplicate gates, context-free checks, orphan
    /// buffering, contextual acceptance, and recursive orphan resolution.
    pub fn process_new_block(
        &mut self,
        hooks: &Hooks,
        pool: &mut Mempool,
        block: Block,
        from: Option<&dyn PeerOps>,
    ) -> Result<(), ChainError> {
        let hash = block.hash();
        if self.index.contains(&hash) {
            return Err(ChainError::Transient(TransientKind::AlreadyHave));
        }
        if self.orphan_blocks.contains(&hash) {
            return Err(ChainError::Transient(TransientKind::AlreadyHave));
        }

        // Limited duplicity on stake: an identical kernel is allowed only
        // when an orphan child or a pending checkpoint asks for this block.
        let initial_download = self.is_initial_block_download();
        if !initial_download {
            if let Some(proof) = block.proof_of_stake() {
                if self.stake_seen.contains(&proof)
                    && !self.orphan_blocks.has_child(&hash)
                    && !self.checkpoints.wanted_by_pending(&hash)
                {
                    return Err(ChainError::Transient(TransientKind::DuplicateStake));
                }
            }
        }

        let flags = self.flags;
        check_block(&block, &self.params, &flags, self.now())?;

        // Blocks forking off before the last synchronized checkpoint must
        // still carry plausible difficulty; cheap spam dies here.
        if let Some(checkpoint_id) = self.checkpoints.last_checkpoint_node(&self.index) {
            let not_extending_best = Some(block.header.prev_block) != self.best_hash();
            if not_extending_best && !self.checkpoints.wanted_by_pending(&hash) {
                let checkpoint_node = self.index.node(checkpoint_id);
                let delta_time = block.header.time as i64 - checkpoint_node.block_time();
                let is_pos = block.is_proof_of_stake();
                let limit = if is_pos {
                    &self.params.consensus.pos_limit
                } else {
                    &self.params.consensus.pow_limit
                };
                let required_bits = compute_max_bits(
                    limit,
                    self.last_bits_of_kind(checkpoint_id, is_pos),
                    delta_time,
                );
                let block_target = compact_to_u256(block.header.bits).unwrap_or_default();
                let required_target = compact_to_u256(required_bits).unwrap_or_default();
                if block_target > required_target {
                    if let Some(peer) = from {
                        peer.misbehaving(100, "block with too little proof");
                    }
                    return Err(ChainError::reject(100, "block with too little proof"));
                }
            }
        }

        // Parent unknown: buffer and chase the missing ancestry.
        if !self.index.contains(&block.header.prev_block) {
            nucleod_log::log_info!(
                "orphan block {}, missing parent {}",
                hash256_short(&hash),
                hash256_short(&block.header.prev_block)
            );
            if let Some(proof) = block.proof_of_stake() {
                if self.orphan_blocks.stake_seen(&proof)
                    && !self.orphan_blocks.has_child(&hash)
                    && !self.checkpoints.wanted_by_pending(&hash)
                {
                    return Err(ChainError::Transient(TransientKind::DuplicateStake));
                }
            }
            self.orphan_blocks.insert(block);
            if let Some(peer) = from {
                if let Some(root) = self.orphan_blocks.orphan_root(&hash) {
                    peer.push_getblocks(self.block_locator_from_best(), root);
                }
                if !initial_download {
                    // getblocks may skip an ancestor rejected earlier by the
                    // duplicate-stake gate; ask for it directly too.
                    if let Some(wanted) = self.orphan_blocks.wanted_by(&hash) {
                        peer.ask_for_block(wanted);
                    }
                }
            }
            return Ok(());
        }

        self.accept_block(hooks, pool, &block)?;

        // Recursively connect buffered descendants, breadth-first. Each is
        // removed from the pool whatever its individual outcome.
        let mut work_queue = vec![hash];
        let mut cursor = 0usize;
        while cursor < work_queue.len() {
            let parent = work_queue[cursor];
            cursor += 1;
            for orphan in self.orphan_blocks.take_children(&parent) {
                let orphan_hash = orphan.hash();
                match self.accept_block(hooks, pool, &orphan) {
                    Ok(()) => work_queue.push(orphan_hash),
                    Err(err) => {
                        nucleod_log::log_info!(
                            "orphan block {} rejected: {err}",
                            hash256_short(&orphan_hash)
                        );
                    }
                }
            }
        }

        nucleod_log::log_debug!("block {} accepted", hash256_short(&hash));
        Ok(())
    }

    /// Contextual block acceptance; the parent must be indexed.
    pub fn accept_block(
        &mut self,
        hooks: &Hooks,
        pool: &mut Mempool,
        block: &Block,
    ) -> Result<(), ChainError> {
        let hash = block.hash();
        if self.index.contains(&hash) {
            return Err(ChainError::Transient(TransientKind::AlreadyHave));
        }
        let Some(parent) = self.index.lookup(&block.header.prev_block) else {
            return Err(ChainError::reject(10, "prev block not found"));
        };
        let height = self.index.node(parent).height + 1;
        let is_pos = block.is_proof_of_stake();

        if !is_pos && height > self.params.consensus.last_pow_block {
            return Err(ChainError::reject(100, "proof-of-work period ended"));
        }

        if block.header.bits != self.next_target(parent, is_pos) {
            return Err(ChainError::reject(100, "incorrect proof target"));
        }

        let block_time = block.header.time as i64;
        let parent_node = self.index.node(parent);
        if block_time <= self.index.median_time_past(parent)
            || future_drift(block_time) < parent_node.block_time()
        {
            return Err(ChainError::reject(0, "block timestamp too early"));
        }

        if is_pos {
            let coinstake = &block.transactions[1];
            let protocol = self.params.consensus.pos_protocol_version(height);
            if !check_coinstake_timestamp(protocol, block_time, coinstake.time as i64) {
                return Err(ChainError::reject(50, "coinstake timestamp violation"));
            }
        }

        for tx in &block.transactions {
            if !tx.is_final(height, block_time) {
                return Err(ChainError::reject(10, "contains a non-final transaction"));
            }
        }

        if let Some(expected) = self.params.consensus.hardened_checkpoint(height) {
            if *expected != hash {
                return Err(ChainError::reject(
                    100,
                    "rejected by hardened checkpoint lock-in",
                ));
            }
        }

        let proof_hash = if is_pos {
            match self.check_proof_of_stake(&block.transactions[1], block.header.bits) {
                Ok(check) => check.proof_hash,
                Err(err) => {
                    nucleod_log::log_warn!(
                        "check proof-of-stake failed for block {}: {err}",
                        hash256_short(&hash)
                    );
                    if !self.is_initial_block_download() {
                        return Err(ChainError::reject(0, "check proof-of-stake failed"));
                    }
                    [0u8; 32]
                }
            }
        } else {
            hash
        };

        let checkpoint_ok = self.checkpoints.check_sync(&self.index, &hash, parent);
        match self.checkpoints.mode() {
            CheckpointMode::Strict if !checkpoint_ok => {
                return Err(ChainError::reject(0, "rejected by synchronized checkpoint"));
            }
            CheckpointMode::Advisory if !checkpoint_ok => {
                self.misc_warning =
                    "WARNING: synchronized checkpoint violation detected, but skipped!".to_string();
                nucleod_log::log_warn!("{}", self.misc_warning);
            }
            _ => {}
        }

        // The coinbase scriptSig must lead with the serialized height.
        let expected_prefix = push_number(height as i64);
        let coinbase_sig = &block.transactions[0].vin[0].script_sig;
        if coinbase_sig.len() < expected_prefix.len()
            || coinbase_sig[..expected_prefix.len()] != expected_prefix[..]
        {
            return Err(ChainError::reject(100, "block height mismatch in coinbase"));
        }

        let bytes = block.encode_to_vec();
        if !self.block_files.has_space_for(bytes.len() as u64) {
            return Err(ChainError::Fatal("out of disk space".to_string()));
        }
        let pos = self.block_files.append_block(&bytes)?;
        self.add_to_block_index(hooks, pool, block, pos, proof_hash)?;

        // Relay once it is our tip; stale inventory stays quiet during sync.
        if self.best_hash() == Some(hash) {
            hooks.relay_block(&hash, self.best_height());
        }

        self.checkpoints.accept_pending(&self.index, self.best);
        Ok(())
    }

    fn ancestor_summaries(&self, parent: BlockId) -> Vec<BlockSummary> {
        let prev_time = self.index.node(parent).block_time();
        let window_start = (prev_time / self.params.consensus.modifier_interval)
            * self.params.consensus.modifier_interval
            - selection_interval(&self.params.consensus);
        let mut summaries = Vec::new();
        let mut found_generated = false;
        for ancestor in self.index.ancestors(parent) {
            let node = self.index.node(ancestor);
            summaries.push(BlockSummary {
                hash: node.hash,
                proof_hash: node.proof_hash,
                time: node.block_time(),
                entropy_bit: node.entropy_bit,
                is_proof_of_stake: node.is_proof_of_stake,
                stake_modifier: node.stake_modifier,
                generated_modifier: node.generated_modifier,
            });
            found_generated |= node.generated_modifier;
            if found_generated && node.block_time() < window_start {
                break;
            }
        }
        summaries
    }

    /// Create the index node for an accepted block and advance the chain if
    /// it carries more trust than the current tip.
    fn add_to_block_index(
        &mut self,
        hooks: &Hooks,
        pool: &mut Mempool,
        block: &Block,
        pos: BlockPos,
        proof_hash: Hash256,
    ) -> Result<(), ChainError> {
        let hash = block.hash();
        if self.index.contains(&hash) {
            return Err(ChainError::Transient(TransientKind::AlreadyHave));
        }

        let parent = self.index.lookup(&block.header.prev_block);
        let (height, parent_trust) = match parent {
            Some(id) => {
                let node = self.index.node(id);
                (node.height + 1, node.chain_trust)
            }
            None => (0, U256::zero()),
        };

        let summaries = match parent {
            Some(id) => self.ancestor_summaries(id),
            None => Vec::new(),
        };
        let (stake_modifier, generated_modifier) =
            compute_next_stake_modifier(&summaries, &self.params.consensus)
                .map_err(|err| ChainError::Fatal(format!("stake modifier: {err}")))?;

        let is_pos = block.is_proof_of_stake();
        let (stake_prevout, stake_time) = block
            .proof_of_stake()
            .unwrap_or((OutPoint::null(), 0));

        let parent_checksum = parent
            .map(|id| self.index.node(id).modifier_checksum)
            .unwrap_or(0);
        let entropy_bit = block.stake_entropy_bit();
        let modifier_checksum = stake_modifier_checksum(
            parent_checksum,
            entropy_bit,
            is_pos,
            &proof_hash,
            stake_modifier,
        );

        let node = BlockIndexNode {
            hash,
            parent,
            next: None,
            height,
            pos,
            version: block.header.version,
            merkle_root: block.header.merkle_root,
            time: block.header.time,
            bits: block.header.bits,
            nonce: block.header.nonce,
            chain_trust: parent_trust + block_trust(block.header.bits),
            mint: 0,
            money_supply: 0,
            is_proof_of_stake: is_pos,
            generated_modifier,
            entropy_bit,
            stake_modifier,
            modifier_checksum,
            proof_hash,
            stake_prevout,
            stake_time,
        };
        let trust = node.chain_trust;
        let id = self.index.insert(node);
        if is_pos {
            self.stake_seen.insert((stake_prevout, stake_time));
        }

        // Persist the bare node before any chain transition.
        let store = Arc::clone(&self.store);
        let mut txn = StoreTxn::begin(store.as_ref());
        self.write_index_node(&mut txn, id);
        txn.commit()?;

        if trust > self.best_trust {
            self.set_best_chain(hooks, pool, block, id)?;
        }

        if self.best == Some(id) {
            // Surface the previous best block's coinbase to subscribers.
            hooks.updated_tx(&self.last_best_coinbase);
            self.last_best_coinbase = block.transactions[0].txid();
        }

        Ok(())
    }

    fn write_index_node(&self, txn: &mut StoreTxn<'_>, id: BlockId) {
        let node = self.index.node(id);
        let prev_hash = self.index.prev_hash(id);
        let next_hash = node
            .next
            .map(|next| self.index.hash(next))
            .unwrap_or([0u8; 32]);
        txn.put(
            Column::BlockIndex,
            &node.hash,
            encode_index_node(node, &prev_hash, &next_hash),
        );
    }

    fn write_index_node_with_next(&self, txn: &mut StoreTxn<'_>, id: BlockId, next_hash: Hash256) {
        let node = self.index.node(id);
        let prev_hash = self.index.prev_hash(id);
        txn.put(
            Column::BlockIndex,
            &node.hash,
            encode_index_node(node, &prev_hash, &next_hash),
        );
    }

    // ---- best chain transitions ------------------------------------------

    /// Advance the best chain to `id`, reorganizing across a fork when the
    /// new node does not extend the current tip.
    fn set_best_chain(
        &mut self,
        hooks: &Hooks,
        pool: &mut Mempool,
        block: &Block,
        id: BlockId,
    ) -> Result<(), ChainError> {
        let hash = self.index.hash(id);
        let mut final_id = id;

        if self.genesis.is_none() && hash == self.params.consensus.hash_genesis_block {
            let mut txn = StoreTxn::begin(self.store.as_ref());
            txn.put(Column::Meta, META_BEST_CHAIN, hash.to_vec());
            txn.commit()?;
            self.genesis = Some(id);
        } else if Some(block.header.prev_block) == self.best_hash() {
            self.set_best_chain_inner(hooks, pool, block, id, false)?;
        } else {
            // The first block of the new chain whose own trust already beats
            // the tip; everything above it reconnects afterwards, non-fatally.
            let mut intermediate = id;
            let mut secondary: Vec<BlockId> = Vec::new();
            while let Some(parent) = self.index.parent(intermediate) {
                if self.index.node(parent).chain_trust <= self.best_trust {
                    break;
                }
                secondary.push(intermediate);
                intermediate = parent;
            }
            if !secondary.is_empty() {
                nucleod_log::log_info!("postponing {} reconnects", secondary.len());
            }

            if let Err(err) = self.reorganize(hooks, pool, intermediate) {
                self.invalid_chain_found(id);
                return Err(err);
            }
            final_id = intermediate;

            for secondary_id in secondary.into_iter().rev() {
                let node_pos = self.index.node(secondary_id).pos;
                let Ok(secondary_block) = self.read_block_at(node_pos) else {
                    nucleod_log::log_warn!("failed to read postponed block from disk");
                    break;
                };
                // Failures here leave a valid (shorter) new chain.
                if self
                    .set_best_chain_inner(hooks, pool, &secondary_block, secondary_id, true)
                    .is_err()
                {
                    break;
                }
                final_id = secondary_id;
            }
        }

        let initial_download = self.is_initial_block_download();
        if !initial_download {
            hooks.set_best_chain(&self.index.locator(final_id));
        }

        self.best = Some(final_id);
        self.index.node_mut(final_id).next = None;
        self.best_trust = self.index.node(final_id).chain_trust;
        self.time_best_received = self.now();

        nucleod_log::log_info!(
            "new best {} height {} trust {}",
            hash256_short(&self.index.hash(final_id)),
            self.best_height(),
            self.best_trust
        );

        if !initial_download {
            // Version supermajority scan over the trailing window.
            let mut upgraded = 0usize;
            for ancestor in self.index.ancestors(final_id).take(100) {
                if self.index.node(ancestor).version
                    > nucleod_primitives::block::BLOCK_CURRENT_VERSION
                {
                    upgraded += 1;
                }
            }
            if upgraded > 0 {
                nucleod_log::log_info!("{upgraded} of last 100 blocks above current version");
            }
            if upgraded > 50 {
                self.misc_warning =
                    "Warning: this version is obsolete, upgrade required!".to_string();
            }
        }

        Ok(())
    }

    /// Connect one block extending the current best chain.
    fn set_best_chain_inner(
        &mut self,
        hooks: &Hooks,
        pool: &mut Mempool,
        block: &Block,
        id: BlockId,
        reorganizing: bool,
    ) -> Result<(), ChainError> {
        let hash = self.index.hash(id);
        let store = Arc::clone(&self.store);
        let mut txn = StoreTxn::begin(store.as_ref());

        if let Err(err) = self.connect_block(hooks, &mut txn, block, id, reorganizing) {
            txn.abort();
            self.invalid_chain_found(id);
            return Err(err);
        }
        txn.put(Column::Meta, META_BEST_CHAIN, hash.to_vec());
        txn.commit()?;

        // Disk is committed; now flip the in-memory forward pointer.
        if let Some(parent) = self.index.parent(id) {
            self.index.node_mut(parent).next = Some(id);
        }
        self.best = Some(id);
        self.best_trust = self.index.node(id).chain_trust;

        for tx in &block.transactions {
            pool.remove(&tx.txid());
        }
        for tx in &block.transactions {
            hooks.sync_tx(tx, Some(block), true);
        }
        Ok(())
    }

    /// Connect `block`'s transactions into the index inside `txn`.
    fn connect_block(
        &mut self,
        hooks: &Hooks,
        txn: &mut StoreTxn<'_>,
        block: &Block,
        id: BlockId,
        reorganizing: bool,
    ) -> Result<(), ChainError> {
        // Check again in case a prior version let a bad block in; block
        // signatures were already validated on arrival.
        let mut recheck_flags = self.flags;
        recheck_flags.check_signature = false;
        check_block(block, &self.params, &recheck_flags, self.now())?;

        let node_pos = self.index.node(id).pos;
        let height = self.index.node(id).height;
        let parent = self.index.parent(id);
        let offsets = Self::tx_offsets(block);

        let mut queued: HashMap<Hash256, TxIndexEntry> = HashMap::new();
        let mut deferred_checks: Vec<ScriptCheck> = Vec::new();
        let mut fees: Amount = 0;
        let mut value_in_total: Amount = 0;
        let mut value_out_total: Amount = 0;
        let mut stake_reward: Amount = 0;
        let mut sigops = 0usize;

        let empty_pool = Mempool::new();
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();

            // Do not allow blocks to overwrite a not-fully-spent earlier
            // transaction with the same id (BIP30-style replay guard).
            if !reorganizing {
                let existing = IndexReader::Txn(txn).get(&txid)?;
                if let Some(existing) = existing {
                    if existing.spent.iter().any(|slot| slot.is_none()) {
                        return Err(ChainError::reject(50, "tried to overwrite transaction"));
                    }
                }
            }

            for input in &tx.vin {
                sigops += sigop_count(&input.script_sig, false);
            }
            for output in &tx.vout {
                sigops += sigop_count(&output.script_pubkey, false);
            }
            if sigops > MAX_BLOCK_SIGOPS {
                return Err(ChainError::reject(100, "too many sigops"));
            }

            let pos_this_tx = DiskTxPos {
                file: node_pos.file,
                block_offset: node_pos.offset,
                tx_offset: node_pos.offset + offsets[tx_index] as u64,
            };

            if tx.is_coinbase() {
                value_out_total += tx.value_out();
            } else {
                let reader = IndexReader::Txn(txn);
                let mut inputs =
                    self.fetch_inputs(&reader, &empty_pool, tx, Some(&queued), true)?;

                for input in &tx.vin {
                    let (_, prev_tx) = &inputs[&input.prevout.hash];
                    sigops += p2sh_sigop_count(
                        &prev_tx.vout[input.prevout.index as usize].script_pubkey,
                        &input.script_sig,
                    );
                }
                if sigops > MAX_BLOCK_SIGOPS {
                    return Err(ChainError::reject(100, "too many sigops"));
                }

                let tx_value_in = Self::value_in(&inputs, tx)?;
                let tx_value_out = tx.value_out();
                value_in_total += tx_value_in;
                value_out_total += tx_value_out;
                if tx.is_coinstake() {
                    stake_reward = tx_value_out - tx_value_in;
                } else {
                    fees += tx_value_in - tx_value_out;
                }

                self.connect_inputs(
                    tx,
                    &txid,
                    &mut inputs,
                    Some(&mut queued),
                    pos_this_tx,
                    Some(id),
                    true,
                    reorganizing,
                    Some((&mut deferred_checks, tx_index)),
                )?;
            }

            queued.insert(txid, TxIndexEntry::new(pos_this_tx, tx.vout.len()));
        }

        // Signature verification dominates; run the batch across cores.
        let sig_failure = deferred_checks
            .par_iter()
            .find_any(|check| {
                let tx = &block.transactions[check.tx_index];
                verify_signature(
                    &tx.vin[check.input_index].script_sig,
                    &check.script_pubkey,
                    tx,
                    check.input_index,
                    MANDATORY_SCRIPT_VERIFY_FLAGS,
                )
                .is_err()
            })
            .is_some();
        if sig_failure {
            return Err(ChainError::reject(100, "signature verification failed"));
        }

        // Money supply bookkeeping.
        let mint = value_out_total - value_in_total + fees;
        let parent_supply = parent
            .map(|p| self.index.node(p).money_supply)
            .unwrap_or(0);
        // Genesis carries no supply, so the first block is exempt.
        if parent_supply == 0 && height > 1 {
            nucleod_log::log_warn!("money supply at parent of height {height} is zero");
            if !self.is_initial_block_download() {
                return Err(ChainError::Fatal(
                    "money supply was calculated to zero".to_string(),
                ));
            }
        }
        let money_supply = parent_supply + value_out_total - value_in_total;

        self.enforce_rewards(hooks, block, height, fees, stake_reward)?;

        {
            let node = self.index.node_mut(id);
            node.mint = mint;
            node.money_supply = money_supply;
        }

        // Flush queued tx index updates and the refreshed node.
        for (txid, entry) in &queued {
            txn.put(Column::TxIndex, txid, entry.encode());
        }
        self.write_index_node(txn, id);
        if let Some(parent) = parent {
            self.write_index_node_with_next(txn, parent, self.index.hash(id));
        }
        Ok(())
    }

    /// Reward ceilings and masternode/developer payout enforcement.
    fn enforce_rewards(
        &mut self,
        hooks: &Hooks,
        block: &Block,
        height: i32,
        fees: Amount,
        stake_reward: Amount,
    ) -> Result<(), ChainError> {
        let winner_enforced = self
            .sporks
            .is_active(SporkId::MasternodeWinnerEnforcement, self.now());
        let reward_checks = height > self.params.consensus.reward_check_start_height;

        if block.is_proof_of_work() {
            let reward = proof_of_work_reward(fees, height, self.params.network);
            if reward_checks && block.transactions[0].value_out() > reward {
                return Err(ChainError::reject(50, "coinbase reward exceeded"));
            }
            return Ok(());
        }

        let coinstake = &block.transactions[1];
        let calculated = proof_of_stake_reward(fees, height);
        if reward_checks && stake_reward > calculated {
            return Err(ChainError::reject(100, "coinstake pays too much"));
        }

        if self.is_initial_block_download() {
            if let Some(ledger) = &hooks.masternodes {
                let required = masternode_payment(height, calculated);
                if let Some(output) = coinstake
                    .vout
                    .iter()
                    .find(|output| output.value == required)
                {
                    ledger.record_past_winner(height, &output.script_pubkey);
                }
            }
            nucleod_log::log_info!(
                "initial download: skipping payment checks at height {height}"
            );
            return Ok(());
        }

        let dos_weight = self.sporks.value(SporkId::PaymentEnforcementDosValue).max(0) as u32;
        let required_mn = masternode_payment(height, calculated);
        let required_dev = developer_payment(calculated);

        let mut block_payee: Option<Vec<u8>> = None;
        for output in &coinstake.vout {
            if output.value == required_mn {
                block_payee = Some(output.script_pubkey.clone());
            }
        }

        if block_payee.is_none() {
            if height >= self.params.consensus.enforce_mn_payment_height {
                return Err(ChainError::Rejected {
                    weight: dos_weight,
                    reason: "stake does not pay masternode expected amount",
                });
            }
            nucleod_log::log_info!("stake does not pay masternode expected amount (not enforced)");
        }

        // Payee identity checks only once the masternode list is available
        // and the block is fresh enough to judge.
        if let Some(ledger) = hooks.masternodes.clone() {
            let fresh = MN_PAYEE_MAX_BLOCK_AGE > self.now() - block.header.time as i64;
            if ledger.is_synced() && fresh {
                let threshold = self.sporks.value(SporkId::PaymentEnforcementThreshold);
                let mut paid_correct = false;
                if let Some(expected) = ledger.block_payee(height) {
                    paid_correct = block_payee.as_deref() == Some(expected.as_slice());
                    if !paid_correct {
                        // The winner list may simply be behind; recompute
                        // before treating it as a violation.
                        if let Some(recomputed) = ledger.recalculate_payee(height) {
                            paid_correct = block_payee.as_deref() == Some(recomputed.as_slice());
                        }
                        if !paid_correct && winner_enforced && (threshold > 0) {
                            return Err(ChainError::Rejected {
                                weight: dos_weight,
                                reason: "stake does not pay correct masternode",
                            });
                        }
                    }
                } else {
                    nucleod_log::log_info!(
                        "no expected masternode payee for block at height {height}"
                    );
                }
                let valid_payment = block_payee.is_some() && paid_correct;
                if !valid_payment && winner_enforced {
                    return Err(ChainError::Rejected {
                        weight: dos_weight,
                        reason: "masternode payment missing or not valid",
                    });
                }
            }
        }

        // Developer payment: exact amount to the fixed script.
        let dev_paid = coinstake.vout.iter().any(|output| {
            output.value == required_dev && output.script_pubkey == self.params.developer_script
        });
        if !dev_paid {
            if height >= self.params.consensus.enforce_dev_payment_height {
                return Err(ChainError::Rejected {
                    weight: dos_weight,
                    reason: "block fails to pay developer payment",
                });
            }
            nucleod_log::log_info!("block does not pay developer payment (not enforced)");
        }

        Ok(())
    }

    /// Undo a connected block's tx index writes. Does not touch the block
    /// file or the index DAG.
    fn disconnect_block(
        &mut self,
        txn: &mut StoreTxn<'_>,
        block: &Block,
        id: BlockId,
    ) -> Result<(), ChainError> {
        for tx in block.transactions.iter().rev() {
            self.disconnect_inputs(txn, tx)?;
        }
        if let Some(parent) = self.index.parent(id) {
            self.write_index_node_with_next(txn, parent, [0u8; 32]);
        }
        Ok(())
    }

    fn disconnect_inputs(
        &self,
        txn: &mut StoreTxn<'_>,
        tx: &Transaction,
    ) -> Result<(), ChainError> {
        if !tx.is_coinbase() {
            for input in &tx.vin {
                let reader = IndexReader::Txn(txn);
                let mut entry = reader
                    .get(&input.prevout.hash)?
                    .ok_or_else(|| ChainError::Fatal("prev tx index missing on disconnect".to_string()))?;
                let index = input.prevout.index as usize;
                if index >= entry.spent.len() {
                    return Err(ChainError::Fatal("prevout out of range on disconnect".to_string()));
                }
                entry.spent[index] = None;
                txn.put(Column::TxIndex, &input.prevout.hash, entry.encode());
            }
        }
        // Erasing can fail to matter if a duplicate of this transaction was
        // completely spent in the surviving chain; removal is a no-op then.
        txn.delete(Column::TxIndex, &tx.txid());
        Ok(())
    }

    /// Switch the active chain to `target`. Disk state moves inside one
    /// storage transaction with the best-chain pointer written last; memory
    /// and the mempool change only after the commit.
    fn reorganize(
        &mut self,
        hooks: &Hooks,
        pool: &mut Mempool,
        target: BlockId,
    ) -> Result<(), ChainError> {
        nucleod_log::log_info!("reorganize begin");
        let best = self
            .best
            .ok_or_else(|| ChainError::Fatal("reorganize without a tip".to_string()))?;

        // Walk both chains back to the fork point.
        let mut fork = best;
        let mut longer = target;
        while fork != longer {
            while self.index.node(longer).height > self.index.node(fork).height {
                longer = self
                    .index
                    .parent(longer)
                    .ok_or_else(|| ChainError::Fatal("fork walk hit null parent".to_string()))?;
            }
            if fork == longer {
                break;
            }
            fork = self
                .index
                .parent(fork)
                .ok_or_else(|| ChainError::Fatal("fork walk hit null parent".to_string()))?;
        }

        let mut disconnect: Vec<BlockId> = Vec::new();
        let mut cursor = best;
        while cursor != fork {
            disconnect.push(cursor);
            cursor = self
                .index
                .parent(cursor)
                .ok_or_else(|| ChainError::Fatal("disconnect walk hit null parent".to_string()))?;
        }
        let mut connect: Vec<BlockId> = Vec::new();
        let mut cursor = target;
        while cursor != fork {
            connect.push(cursor);
            cursor = self
                .index
                .parent(cursor)
                .ok_or_else(|| ChainError::Fatal("connect walk hit null parent".to_string()))?;
        }
        connect.reverse();

        nucleod_log::log_info!(
            "reorganize: disconnect {} blocks, connect {} blocks across fork {}",
            disconnect.len(),
            connect.len(),
            hash256_short(&self.index.hash(fork))
        );

        let store = Arc::clone(&self.store);
        let mut txn = StoreTxn::begin(store.as_ref());

        // Disconnect the shorter branch, queueing its transactions for
        // resurrection once everything commits.
        let mut disconnected_blocks: Vec<Block> = Vec::new();
        for &id in &disconnect {
            let block = self.read_block_at(self.index.node(id).pos)?;
            self.disconnect_block(&mut txn, &block, id)?;
            disconnected_blocks.push(block);
        }

        let mut connected_blocks: Vec<Block> = Vec::new();
        for &id in &connect {
            let block = self.read_block_at(self.index.node(id).pos)?;
            self.connect_block(hooks, &mut txn, &block, id, true)?;
            connected_blocks.push(block);
        }

        // Best-chain pointer goes in last; a crash before the commit leaves
        // the previous tip fully intact.
        let target_hash = self.index.hash(target);
        txn.put(Column::Meta, META_BEST_CHAIN, target_hash.to_vec());
        txn.commit()?;

        // Only now mutate the in-memory forward links.
        for &id in &disconnect {
            if let Some(parent) = self.index.parent(id) {
                self.index.node_mut(parent).next = None;
            }
        }
        for &id in &connect {
            if let Some(parent) = self.index.parent(id) {
                self.index.node_mut(parent).next = Some(id);
            }
        }
        self.best = Some(target);
        self.best_trust = self.index.node(target).chain_trust;

        // Resurrect transactions from the abandoned branch, best-effort.
        let mut limiter = FreeTxRateLimiter::with_default_limit();
        for block in &disconnected_blocks {
            for tx in &block.transactions {
                if tx.is_coinbase() || tx.is_coinstake() {
                    continue;
                }
                let _ = self.accept_tx(hooks, pool, &mut limiter, tx.clone(), false, false);
            }
            for tx in &block.transactions {
                hooks.sync_tx(tx, Some(block), false);
            }
        }

        // Purge transactions now confirmed by the new branch.
        for block in &connected_blocks {
            for tx in &block.transactions {
                pool.remove(&tx.txid());
                pool.remove_conflicts(tx);
            }
            for tx in &block.transactions {
                hooks.sync_tx(tx, Some(block), true);
            }
        }

        nucleod_log::log_info!("reorganize done");
        Ok(())
    }

    fn invalid_chain_found(&mut self, id: BlockId) {
        let trust = self.index.node(id).chain_trust;
        if trust > self.best_invalid_trust {
            self.best_invalid_trust = trust;
            let store = Arc::clone(&self.store);
            let mut txn = StoreTxn::begin(store.as_ref());
            txn.put(
                Column::Meta,
                META_BEST_INVALID_TRUST,
                self.best_invalid_trust.to_little_endian().to_vec(),
            );
            if txn.commit().is_err() {
                nucleod_log::log_warn!("failed to persist best invalid trust");
            }
        }
        nucleod_log::log_error!(
            "invalid chain found: block {} height {} trust {}",
            hash256_short(&self.index.hash(id)),
            self.index.node(id).height,
            self.index.node(id).chain_trust
        );
        if let Some(best) = self.best {
            nucleod_log::log_error!(
                "current best: {} height {} trust {}",
                hash256_short(&self.index.hash(best)),
                self.best_height(),
                self.best_trust
            );
        }
    }

    // ---- sync checkpoints ------------------------------------------------

    pub fn process_sync_checkpoint(&mut self, message: SyncCheckpointMessage) -> bool {
        let accepted = self
            .checkpoints
            .process_message(message, &self.index, self.best);
        if accepted {
            if let Some(current) = self.checkpoints.current() {
                let mut txn = StoreTxn::begin(self.store.as_ref());
                txn.put(Column::Meta, META_SYNC_CHECKPOINT, current.to_vec());
                if txn.commit().is_err() {
                    nucleod_log::log_warn!("failed to persist sync checkpoint");
                }
            }
        }
        accepted
    }

    pub fn sync_checkpoint(&self) -> Option<Hash256> {
        self.checkpoints.current()
    }

    pub fn pending_sync_checkpoint(&self) -> Option<SyncCheckpointMessage> {
        self.checkpoints.pending_message().cloned()
    }

    pub fn sync_checkpoint_message(&self) -> Option<SyncCheckpointMessage> {
        self.checkpoints.current_message().cloned()
    }

    // ---- queries for the message layer -----------------------------------

    /// Active-chain successor of a node.
    pub fn next_in_chain(&self, id: BlockId) -> Option<BlockId> {
        self.index.node(id).next
    }

    /// Highest locator entry on the active chain.
    pub fn find_locator_fork(&self, locator: &[Hash256]) -> Option<BlockId> {
        for hash in locator {
            if let Some(id) = self.index.lookup(hash) {
                if self.is_in_main_chain(id) {
                    return Some(id);
                }
            }
        }
        self.genesis
    }

    pub fn is_in_main_chain(&self, id: BlockId) -> bool {
        self.index.node(id).next.is_some() || self.best == Some(id)
    }

    /// Invariant check: active-chain nodes are exactly those their parent
    /// forwards to.
    pub fn chain_links_consistent(&self) -> bool {
        let Some(best) = self.best else {
            return true;
        };
        let active: HashSet<BlockId> = self.index.ancestors(best).collect();
        for id in self.index.ids() {
            let Some(parent) = self.index.node(id).parent else {
                continue;
            };
            let parent_forwards = self.index.node(parent).next == Some(id);
            if active.contains(&id) != parent_forwards {
                return false;
            }
        }
        true
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        let Some(id) = self.index.lookup(hash) else {
            return Ok(None);
        };
        Ok(Some(self.read_block_at(self.index.node(id).pos)?))
    }

    pub fn header_of(&self, id: BlockId) -> BlockHeader {
        self.index.header(id)
    }

    /// Fetch an indexed transaction and the hash of its containing block.
    pub fn read_transaction(
        &self,
        txid: &Hash256,
    ) -> Result<Option<(Transaction, Hash256)>, ChainError> {
        let reader = IndexReader::Store(self.store.as_ref());
        let Some(entry) = reader.get(txid)? else {
            return Ok(None);
        };
        if entry.pos.is_memory() {
            return Ok(None);
        }
        let tx = self.read_tx_at(entry.pos)?;
        let payload = self.block_files.read_block(BlockPos {
            file: entry.pos.file,
            offset: entry.pos.block_offset,
        })?;
        let mut decoder = Decoder::new(&payload);
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        Ok(Some((tx, header.hash())))
    }

}
