//! Read-your-writes storage transaction.
//!
//! Index mutation during block connect and reorganization happens through a
//! `StoreTxn`: reads observe queued writes, nothing reaches the backend until
//! `commit`, and dropping an uncommitted transaction is an abort. Every
//! failure path therefore aborts without any discipline from the caller.

use std::collections::BTreeMap;

use crate::{Column, KeyValueStore, StoreError, WriteBatch};

pub struct StoreTxn<'a> {
    store: &'a dyn KeyValueStore,
    /// Pending state per key; `None` marks a queued delete.
    overlay: BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>,
}

impl<'a> StoreTxn<'a> {
    pub fn begin(store: &'a dyn KeyValueStore) -> Self {
        Self {
            store,
            overlay: BTreeMap::new(),
        }
    }

    pub fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(pending) = self.overlay.get(&(column, key.to_vec())) {
            return Ok(pending.clone());
        }
        self.store.get(column, key)
    }

    pub fn put(&mut self, column: Column, key: &[u8], value: Vec<u8>) {
        self.overlay.insert((column, key.to_vec()), Some(value));
    }

    pub fn delete(&mut self, column: Column, key: &[u8]) {
        self.overlay.insert((column, key.to_vec()), None);
    }

    pub fn pending_ops(&self) -> usize {
        self.overlay.len()
    }

    /// Atomically apply every queued write.
    pub fn commit(self) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for ((column, key), pending) in self.overlay {
            match pending {
                Some(value) => batch.put(column, key, value),
                None => batch.delete(column, key),
            }
        }
        self.store.write_batch(&batch)
    }

    /// Discard all queued writes. Dropping the transaction does the same;
    /// the explicit form exists for readability at call sites.
    pub fn abort(self) {}
}
