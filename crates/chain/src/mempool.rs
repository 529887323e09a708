//! In-memory pool of accepted, unconfirmed transactions.

use std::collections::HashMap;

use nucleod_consensus::Hash256;
use nucleod_primitives::outpoint::OutPoint;
use nucleod_primitives::transaction::Transaction;

#[derive(Default)]
pub struct Mempool {
    transactions: HashMap<Hash256, Transaction>,
    /// Spend index: which pool transaction consumes each outpoint.
    next_spends: HashMap<OutPoint, Hash256>,
    updates: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Counter bumped on every mutation; rebroadcast scheduling keys off it.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.transactions.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&Transaction> {
        self.transactions.get(txid)
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.next_spends.get(outpoint).copied()
    }

    pub fn hashes(&self) -> Vec<Hash256> {
        self.transactions.keys().copied().collect()
    }

    /// Caller has already validated; conflicts must have been checked.
    pub fn insert(&mut self, txid: Hash256, tx: Transaction) {
        for input in &tx.vin {
            self.next_spends.insert(input.prevout, txid);
        }
        self.transactions.insert(txid, tx);
        self.updates += 1;
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        let tx = self.transactions.remove(txid)?;
        for input in &tx.vin {
            if self.next_spends.get(&input.prevout) == Some(txid) {
                self.next_spends.remove(&input.prevout);
            }
        }
        self.updates += 1;
        Some(tx)
    }

    /// Evict every pool transaction spending an outpoint `tx` consumes;
    /// dependents of the evicted transactions go with them.
    pub fn remove_conflicts(&mut self, tx: &Transaction) -> Vec<Hash256> {
        let mut evicted = Vec::new();
        for input in &tx.vin {
            if let Some(conflicting) = self.next_spends.get(&input.prevout).copied() {
                self.remove_recursive(conflicting, &mut evicted);
            }
        }
        evicted
    }

    fn remove_recursive(&mut self, txid: Hash256, evicted: &mut Vec<Hash256>) {
        let Some(tx) = self.remove(&txid) else {
            return;
        };
        evicted.push(txid);
        for (index, _) in tx.vout.iter().enumerate() {
            let outpoint = OutPoint::new(txid, index as u32);
            if let Some(child) = self.next_spends.get(&outpoint).copied() {
                self.remove_recursive(child, evicted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nucleod_primitives::transaction::{TxIn, TxOut};

    fn tx_spending(prevout: OutPoint, tag: u8) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            vin: vec![TxIn {
                prevout,
                script_sig: vec![tag],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 10,
                script_pubkey: vec![tag],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn insert_indexes_spends() {
        let mut pool = Mempool::new();
        let prevout = OutPoint::new([1u8; 32], 0);
        let tx = tx_spending(prevout, 7);
        let txid = tx.txid();
        pool.insert(txid, tx);

        assert!(pool.contains(&txid));
        assert_eq!(pool.spender_of(&prevout), Some(txid));

        pool.remove(&txid);
        assert!(!pool.contains(&txid));
        assert_eq!(pool.spender_of(&prevout), None);
    }

    #[test]
    fn conflicts_evict_descendants() {
        let mut pool = Mempool::new();
        let shared = OutPoint::new([1u8; 32], 0);
        let parent = tx_spending(shared, 1);
        let parent_id = parent.txid();
        let child = tx_spending(OutPoint::new(parent_id, 0), 2);
        let child_id = child.txid();
        pool.insert(parent_id, parent);
        pool.insert(child_id, child);

        // A confirmed transaction spending the same outpoint purges both.
        let confirmed = tx_spending(shared, 9);
        let evicted = pool.remove_conflicts(&confirmed);
        assert!(evicted.contains(&parent_id));
        assert!(evicted.contains(&child_id));
        assert!(pool.is_empty());
    }
}
