//! Capability interfaces the core calls out through.
//!
//! Wallets, the peer layer, and the masternode list are external
//! collaborators; the core only ever sees these traits.

use std::sync::Arc;

use nucleod_consensus::Hash256;
use nucleod_primitives::block::Block;
use nucleod_primitives::transaction::Transaction;

/// Wallet-facing validation callbacks, registered at startup.
pub trait WalletNotify: Send + Sync {
    /// A transaction was (dis)connected; `block` is set when it came in one.
    fn sync_tx(&self, tx: &Transaction, block: Option<&Block>, connect: bool);
    /// The active chain advanced; `locator` identifies the new tip.
    fn set_best_chain(&self, locator: &[Hash256]);
    fn updated_tx(&self, txid: &Hash256);
    /// Inventory observed on the network, for request accounting.
    fn inventory(&self, hash: &Hash256);
}

/// Relay duties the core delegates back to the peer layer.
pub trait NetworkHooks: Send + Sync {
    fn relay_block(&self, hash: &Hash256, best_height: i32);
    fn relay_transaction(&self, tx: &Transaction, txid: &Hash256);
}

/// The masternode winner list; discovery and voting live outside the core.
pub trait MasternodeLedger: Send + Sync {
    fn is_synced(&self) -> bool;
    /// Expected payee script for the block at `height`.
    fn block_payee(&self, height: i32) -> Option<Vec<u8>>;
    /// Recompute the payee after a mismatch, then report it again.
    fn recalculate_payee(&self, height: i32) -> Option<Vec<u8>> {
        self.block_payee(height)
    }
    /// Record the winner actually paid by an accepted historical block.
    fn record_past_winner(&self, height: i32, payee: &[u8]) {
        let _ = (height, payee);
    }
}

/// Per-peer actions available while processing that peer's message.
pub trait PeerOps {
    fn misbehaving(&self, score: u32, reason: &str);
    fn push_getblocks(&self, locator: Vec<Hash256>, stop: Hash256);
    fn ask_for_block(&self, hash: Hash256);
}

/// Snapshot of the registered collaborators, cloned before entering the
/// main lock so callbacks never run while registration mutexes are held.
#[derive(Clone, Default)]
pub struct Hooks {
    pub wallets: Vec<Arc<dyn WalletNotify>>,
    pub network: Option<Arc<dyn NetworkHooks>>,
    pub masternodes: Option<Arc<dyn MasternodeLedger>>,
}

impl Hooks {
    pub fn sync_tx(&self, tx: &Transaction, block: Option<&Block>, connect: bool) {
        for wallet in &self.wallets {
            wallet.sync_tx(tx, block, connect);
        }
    }

    pub fn set_best_chain(&self, locator: &[Hash256]) {
        for wallet in &self.wallets {
            wallet.set_best_chain(locator);
        }
    }

    pub fn updated_tx(&self, txid: &Hash256) {
        for wallet in &self.wallets {
            wallet.updated_tx(txid);
        }
    }

    pub fn inventory(&self, hash: &Hash256) {
        for wallet in &self.wallets {
            wallet.inventory(hash);
        }
    }

    pub fn relay_block(&self, hash: &Hash256, best_height: i32) {
        if let Some(network) = &self.network {
            network.relay_block(hash, best_height);
        }
    }

    pub fn relay_transaction(&self, tx: &Transaction, txid: &Hash256) {
        if let Some(network) = &self.network {
            network.relay_transaction(tx, txid);
        }
    }
}
