//! Holding areas for out-of-order transactions and blocks.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use nucleod_consensus::constants::{MAX_ORPHAN_TRANSACTIONS, MAX_ORPHAN_TX_SIZE};
use nucleod_consensus::Hash256;
use nucleod_primitives::block::Block;
use nucleod_primitives::hash::hash256_short;
use nucleod_primitives::outpoint::OutPoint;
use nucleod_primitives::transaction::Transaction;
use rand::RngCore;

/// Transactions whose inputs reference unknown parents, indexed by the
/// parent txid each one waits on.
#[derive(Default)]
pub struct OrphanTxPool {
    orphans: BTreeMap<Hash256, Transaction>,
    by_parent: HashMap<Hash256, BTreeSet<Hash256>>,
}

impl OrphanTxPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.orphans.contains_key(txid)
    }

    /// Buffer an orphan. Oversized transactions are refused outright; a
    /// legitimate sender will rebroadcast once the parents confirm.
    pub fn insert(&mut self, tx: Transaction) -> bool {
        let txid = tx.txid();
        if self.orphans.contains_key(&txid) {
            return false;
        }
        let size = tx.serialized_size();
        if size > MAX_ORPHAN_TX_SIZE {
            nucleod_log::log_info!(
                "ignoring large orphan tx (size {size}, hash {})",
                hash256_short(&txid)
            );
            return false;
        }
        for input in &tx.vin {
            self.by_parent
                .entry(input.prevout.hash)
                .or_default()
                .insert(txid);
        }
        self.orphans.insert(txid, tx);
        nucleod_log::log_debug!(
            "stored orphan tx {} (pool size {})",
            hash256_short(&txid),
            self.orphans.len()
        );
        true
    }

    pub fn erase(&mut self, txid: &Hash256) {
        let Some(tx) = self.orphans.remove(txid) else {
            return;
        };
        for input in &tx.vin {
            if let Some(waiting) = self.by_parent.get_mut(&input.prevout.hash) {
                waiting.remove(txid);
                if waiting.is_empty() {
                    self.by_parent.remove(&input.prevout.hash);
                }
            }
        }
    }

    /// Orphans waiting on `parent`, in deterministic order.
    pub fn children_of(&self, parent: &Hash256) -> Vec<Hash256> {
        self.by_parent
            .get(parent)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.orphans.get(txid)
    }

    /// Evict pseudo-random entries until the pool fits the cap. The victim
    /// is the first entry at or after a random hash.
    pub fn enforce_limit(&mut self, max_orphans: usize, rng: &mut dyn RngCore) -> usize {
        let mut evicted = 0usize;
        while self.orphans.len() > max_orphans {
            let mut probe = [0u8; 32];
            rng.fill_bytes(&mut probe);
            let victim = self
                .orphans
                .range(probe..)
                .next()
                .or_else(|| self.orphans.iter().next())
                .map(|(txid, _)| *txid);
            match victim {
                Some(txid) => {
                    self.erase(&txid);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    pub fn default_limit(&mut self, rng: &mut dyn RngCore) -> usize {
        self.enforce_limit(MAX_ORPHAN_TRANSACTIONS, rng)
    }
}

/// Blocks whose parents are unknown, indexed by the missing parent hash.
/// Stake kernels of buffered orphans are tracked to stop duplicate-stake
/// flooding before the parent even arrives.
#[derive(Default)]
pub struct OrphanBlockPool {
    blocks: HashMap<Hash256, Block>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    stake_seen: HashSet<(OutPoint, u32)>,
}

impl OrphanBlockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    /// A child orphan waiting on `hash` legitimizes re-delivery of its
    /// parent even when the stake kernel was already seen.
    pub fn has_child(&self, hash: &Hash256) -> bool {
        self.by_prev.contains_key(hash)
    }

    pub fn stake_seen(&self, proof: &(OutPoint, u32)) -> bool {
        self.stake_seen.contains(proof)
    }

    pub fn insert(&mut self, block: Block) {
        let hash = block.hash();
        if let Some(proof) = block.proof_of_stake() {
            self.stake_seen.insert(proof);
        }
        self.by_prev
            .entry(block.header.prev_block)
            .or_default()
            .push(hash);
        self.blocks.insert(hash, block);
    }

    /// Root of the orphan chain containing `hash`: the earliest buffered
    /// ancestor. Its parent is what we must request from peers.
    pub fn orphan_root(&self, hash: &Hash256) -> Option<Hash256> {
        let mut cursor = self.blocks.get(hash)?;
        loop {
            match self.blocks.get(&cursor.header.prev_block) {
                Some(parent) => cursor = parent,
                None => return Some(cursor.hash()),
            }
        }
    }

    /// The block hash an orphan chain ultimately waits on.
    pub fn wanted_by(&self, hash: &Hash256) -> Option<Hash256> {
        let mut cursor = self.blocks.get(hash)?;
        loop {
            match self.blocks.get(&cursor.header.prev_block) {
                Some(parent) => cursor = parent,
                None => return Some(cursor.header.prev_block),
            }
        }
    }

    /// Remove and return every buffered child of `parent`.
    pub fn take_children(&mut self, parent: &Hash256) -> Vec<Block> {
        let Some(hashes) = self.by_prev.remove(parent) else {
            return Vec::new();
        };
        let mut children = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(block) = self.blocks.remove(&hash) {
                if let Some(proof) = block.proof_of_stake() {
                    self.stake_seen.remove(&proof);
                }
                children.push(block);
            }
        }
        children
    }
}
