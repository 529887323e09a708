//! Lock owner and public surface of the consensus core.
//!
//! `ChainManager` owns one `ChainState` (the main lock), the mempool (its
//! own lock, always taken after the main one), the free-relay limiter, and
//! the registered collaborators. Lock order is main -> pool -> limiter;
//! hooks are snapshotted before any lock is taken so callbacks never run
//! under a registration mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nucleod_consensus::params::ChainParams;
use nucleod_consensus::sporks::SporkId;
use nucleod_consensus::Hash256;
use nucleod_primitives::block::{Block, BlockHeader};
use nucleod_primitives::transaction::Transaction;
use nucleod_storage::KeyValueStore;
use primitive_types::U256;

use crate::blockfiles::BlockFileStore;
use crate::checkpoints::{CheckpointMode, SyncCheckpointMessage};
use crate::error::{ChainError, TransientKind};
use crate::mempool::Mempool;
use crate::ratelimit::FreeTxRateLimiter;
use crate::state::{ChainState, Clock};
use crate::subscribers::{Hooks, MasternodeLedger, NetworkHooks, PeerOps, WalletNotify};
use crate::validation::ValidationFlags;

#[derive(Clone, Debug)]
pub struct TipInfo {
    pub hash: Hash256,
    pub height: i32,
    pub trust: U256,
}

pub struct ChainManager {
    state: Mutex<ChainState>,
    pool: Mutex<Mempool>,
    limiter: Mutex<FreeTxRateLimiter>,
    hooks: Mutex<Hooks>,
    shutdown: AtomicBool,
}

impl ChainManager {
    pub fn new(
        params: ChainParams,
        store: Arc<dyn KeyValueStore>,
        block_files: BlockFileStore,
        clock: Clock,
    ) -> Self {
        Self {
            state: Mutex::new(ChainState::new(params, store, block_files, clock)),
            pool: Mutex::new(Mempool::new()),
            limiter: Mutex::new(FreeTxRateLimiter::with_default_limit()),
            hooks: Mutex::new(Hooks::default()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Load or create the chain; must run before any message processing.
    pub fn init(&self) -> Result<(), ChainError> {
        let hooks = self.hooks_snapshot();
        let mut state = self.state.lock().expect("chain state lock");
        let mut pool = self.pool.lock().expect("mempool lock");
        state.init(&hooks, &mut pool)
    }

    // ---- registration ----------------------------------------------------

    pub fn register_wallet(&self, wallet: Arc<dyn WalletNotify>) {
        self.hooks.lock().expect("hooks lock").wallets.push(wallet);
    }

    pub fn set_network_hooks(&self, network: Arc<dyn NetworkHooks>) {
        self.hooks.lock().expect("hooks lock").network = Some(network);
    }

    pub fn set_masternode_ledger(&self, ledger: Arc<dyn MasternodeLedger>) {
        self.hooks.lock().expect("hooks lock").masternodes = Some(ledger);
    }

    fn hooks_snapshot(&self) -> Hooks {
        self.hooks.lock().expect("hooks lock").clone()
    }

    // ---- shutdown --------------------------------------------------------

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    // ---- configuration ---------------------------------------------------

    pub fn set_validation_flags(&self, flags: ValidationFlags) {
        self.state
            .lock()
            .expect("chain state lock")
            .set_validation_flags(flags);
    }

    pub fn set_spork(&self, id: SporkId, value: i64) {
        self.state
            .lock()
            .expect("chain state lock")
            .set_spork(id, value);
    }

    pub fn set_checkpoint_mode(&self, mode: CheckpointMode) {
        self.state
            .lock()
            .expect("chain state lock")
            .set_checkpoint_mode(mode);
    }

    pub fn set_free_relay_limit(&self, limit: i64) {
        *self.limiter.lock().expect("limiter lock") = FreeTxRateLimiter::new(limit);
    }

    // ---- block path ------------------------------------------------------

    /// Entry point for inbound blocks, whether from peers or the loader.
    pub fn process_new_block(
        &self,
        block: Block,
        from: Option<&dyn PeerOps>,
    ) -> Result<(), ChainError> {
        let hooks = self.hooks_snapshot();
        let mut state = self.state.lock().expect("chain state lock");
        let mut pool = self.pool.lock().expect("mempool lock");
        let result = state.process_new_block(&hooks, &mut pool, block, from);
        if let Err(err) = &result {
            if err.is_fatal() {
                nucleod_log::log_error!("[FATAL] {err}");
                self.request_shutdown();
            } else {
                let weight = err.dos_weight();
                if weight > 0 {
                    if let Some(peer) = from {
                        peer.misbehaving(weight, "block misbehavior");
                    }
                }
            }
        }
        result
    }

    // ---- transaction path ------------------------------------------------

    /// Entry point for inbound loose transactions; buffers orphans and
    /// retries dependents after each success.
    pub fn process_transaction(
        &self,
        tx: Transaction,
        from: Option<&dyn PeerOps>,
    ) -> Result<(), ChainError> {
        let hooks = self.hooks_snapshot();
        let mut state = self.state.lock().expect("chain state lock");
        let mut pool = self.pool.lock().expect("mempool lock");
        let mut limiter = self.limiter.lock().expect("limiter lock");

        match state.accept_tx(&hooks, &mut pool, &mut limiter, tx.clone(), true, true) {
            Ok(txid) => {
                state.resolve_orphan_txs(&hooks, &mut pool, &mut limiter, txid);
                state.orphan_erase(&txid);
                Ok(())
            }
            Err(err) if err.is_transient(TransientKind::MissingInputs) => {
                state.add_orphan_tx(tx);
                Ok(())
            }
            Err(err) => {
                if err.is_fatal() {
                    nucleod_log::log_error!("[FATAL] {err}");
                    self.request_shutdown();
                } else if err.dos_weight() > 0 {
                    if let Some(peer) = from {
                        peer.misbehaving(err.dos_weight(), "transaction misbehavior");
                    }
                }
                Err(err)
            }
        }
    }

    /// Direct mempool admission without orphan handling; used by tests and
    /// local submission.
    pub fn accept_to_memory_pool(&self, tx: Transaction, limit_free: bool) -> Result<Hash256, ChainError> {
        let hooks = self.hooks_snapshot();
        let mut state = self.state.lock().expect("chain state lock");
        let mut pool = self.pool.lock().expect("mempool lock");
        let mut limiter = self.limiter.lock().expect("limiter lock");
        state.accept_tx(&hooks, &mut pool, &mut limiter, tx, true, limit_free)
    }

    // ---- checkpoints -----------------------------------------------------

    pub fn process_sync_checkpoint(&self, message: SyncCheckpointMessage) -> bool {
        let mut state = self.state.lock().expect("chain state lock");
        state.process_sync_checkpoint(message)
    }

    pub fn sync_checkpoint(&self) -> Option<Hash256> {
        self.state.lock().expect("chain state lock").sync_checkpoint()
    }

    pub fn pending_sync_checkpoint(&self) -> Option<SyncCheckpointMessage> {
        self.state
            .lock()
            .expect("chain state lock")
            .pending_sync_checkpoint()
    }

    pub fn sync_checkpoint_message(&self) -> Option<SyncCheckpointMessage> {
        self.state
            .lock()
            .expect("chain state lock")
            .sync_checkpoint_message()
    }

    // ---- queries ---------------------------------------------------------

    pub fn tip(&self) -> Option<TipInfo> {
        let state = self.state.lock().expect("chain state lock");
        let hash = state.best_hash()?;
        Some(TipInfo {
            hash,
            height: state.best_height(),
            trust: state.best_trust(),
        })
    }

    pub fn best_height(&self) -> i32 {
        self.state.lock().expect("chain state lock").best_height()
    }

    pub fn best_hash(&self) -> Option<Hash256> {
        self.state.lock().expect("chain state lock").best_hash()
    }

    pub fn block_locator(&self) -> Vec<Hash256> {
        self.state
            .lock()
            .expect("chain state lock")
            .block_locator_from_best()
    }

    pub fn contains_block(&self, hash: &Hash256) -> bool {
        self.state
            .lock()
            .expect("chain state lock")
            .contains_block(hash)
    }

    pub fn has_orphan_block(&self, hash: &Hash256) -> bool {
        self.state
            .lock()
            .expect("chain state lock")
            .has_orphan_block(hash)
    }

    pub fn orphan_block_root(&self, hash: &Hash256) -> Option<Hash256> {
        self.state.lock().expect("chain state lock").orphan_root(hash)
    }

    pub fn orphan_counts(&self) -> (usize, usize) {
        let state = self.state.lock().expect("chain state lock");
        (state.orphan_tx_count(), state.orphan_block_count())
    }

    /// Surface observed inventory to wallet subscribers (request counting).
    pub fn notify_inventory(&self, hash: &Hash256) {
        self.hooks_snapshot().inventory(hash);
    }

    /// Do we already have this transaction, in any store?
    pub fn already_have_tx(&self, txid: &Hash256) -> bool {
        let state = self.state.lock().expect("chain state lock");
        let pool = self.pool.lock().expect("mempool lock");
        if pool.contains(txid) || state.orphan_tx_contains(txid) {
            return true;
        }
        state.contains_tx_on_disk(txid).unwrap_or(false)
    }

    pub fn mempool_hashes(&self) -> Vec<Hash256> {
        self.pool.lock().expect("mempool lock").hashes()
    }

    pub fn mempool_contains(&self, txid: &Hash256) -> bool {
        self.pool.lock().expect("mempool lock").contains(txid)
    }

    pub fn mempool_size(&self) -> usize {
        self.pool.lock().expect("mempool lock").len()
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        self.state.lock().expect("chain state lock").read_block(hash)
    }

    /// Look a transaction up in the pool first, then in the index.
    pub fn read_transaction(
        &self,
        txid: &Hash256,
    ) -> Result<Option<(Transaction, Option<Hash256>)>, ChainError> {
        let state = self.state.lock().expect("chain state lock");
        let pool = self.pool.lock().expect("mempool lock");
        if let Some(tx) = pool.get(txid) {
            return Ok(Some((tx.clone(), None)));
        }
        Ok(state
            .read_transaction(txid)?
            .map(|(tx, block_hash)| (tx, Some(block_hash))))
    }

    /// Up to `limit` active-chain block hashes following the locator fork.
    pub fn blocks_from_locator(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
        limit: usize,
    ) -> (Vec<Hash256>, Option<Hash256>) {
        let state = self.state.lock().expect("chain state lock");
        let mut hashes = Vec::new();
        let mut continuation = None;
        let Some(fork) = state.find_locator_fork(locator) else {
            return (hashes, continuation);
        };
        let mut cursor = state.next_in_chain(fork);
        while let Some(id) = cursor {
            let hash = state.index.hash(id);
            if hash == *stop {
                break;
            }
            hashes.push(hash);
            if hashes.len() >= limit {
                // The requester getblocks the next batch from here.
                continuation = Some(hash);
                break;
            }
            cursor = state.next_in_chain(id);
        }
        (hashes, continuation)
    }

    /// Up to `limit` headers following the locator fork (or starting at
    /// `stop` itself when the locator is empty).
    pub fn headers_from_locator(
        &self,
        locator: &[Hash256],
        stop: &Hash256,
        limit: usize,
    ) -> Vec<BlockHeader> {
        let state = self.state.lock().expect("chain state lock");
        let mut headers = Vec::new();
        let mut cursor = if locator.is_empty() {
            state.index.lookup(stop)
        } else {
            state
                .find_locator_fork(locator)
                .and_then(|fork| state.next_in_chain(fork))
        };
        while let Some(id) = cursor {
            headers.push(state.header_of(id));
            if headers.len() >= limit || state.index.hash(id) == *stop {
                break;
            }
            cursor = state.next_in_chain(id);
        }
        headers
    }

    pub fn chain_links_consistent(&self) -> bool {
        self.state
            .lock()
            .expect("chain state lock")
            .chain_links_consistent()
    }

    pub fn message_start(&self) -> [u8; 4] {
        self.state
            .lock()
            .expect("chain state lock")
            .params()
            .message_start
    }

    pub fn is_initial_block_download(&self) -> bool {
        self.state
            .lock()
            .expect("chain state lock")
            .is_initial_block_download()
    }

    pub fn warning(&self) -> String {
        self.state
            .lock()
            .expect("chain state lock")
            .warning()
            .to_string()
    }
}
