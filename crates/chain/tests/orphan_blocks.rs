use std::cell::RefCell;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use nucleod_chain::{BlockFileStore, ChainManager, Clock, PeerOps};
use nucleod_consensus::money::COIN;
use nucleod_consensus::params::{chain_params, Network};
use nucleod_consensus::Hash256;
use nucleod_primitives::block::{Block, BlockHeader};
use nucleod_primitives::outpoint::OutPoint;
use nucleod_primitives::transaction::{Transaction, TxIn, TxOut};
use nucleod_script::opcodes::push_number;
use nucleod_storage::memory::MemoryStore;

const SPACING: u32 = 80;
const REGTEST_BITS: u32 = 0x207f_ffff;

fn coinbase(height: i32, time: u32, value: i64) -> Transaction {
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: push_number(height as i64),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn build_block(parent: Hash256, height: i32, time: u32) -> Block {
    let reward = if height == 1 {
        50_000_000 * COIN
    } else {
        5_000 * COIN
    };
    let mut block = Block {
        header: BlockHeader {
            version: 7,
            prev_block: parent,
            merkle_root: [0u8; 32],
            time,
            bits: REGTEST_BITS,
            nonce: 0,
        },
        transactions: vec![coinbase(height, time, reward)],
        signature: Vec::new(),
    };
    block.header.merkle_root = block.merkle_root();
    block
}

fn setup() -> (ChainManager, Arc<AtomicI64>, u32, tempfile::TempDir) {
    let params = chain_params(Network::Regtest);
    let genesis_time = params.consensus.genesis_time;
    let dir = tempfile::tempdir().expect("tempdir");
    let files =
        BlockFileStore::new(dir.path(), params.message_start, 1 << 26).expect("block files");
    let (clock, clock_cell) = Clock::fixed(genesis_time as i64);
    let manager = ChainManager::new(params, Arc::new(MemoryStore::new()), files, clock);
    manager.init().expect("init");
    (manager, clock_cell, genesis_time, dir)
}

/// Records what the core asked the peer for.
#[derive(Default)]
struct RecordingPeer {
    getblocks: RefCell<Vec<Hash256>>,
    asked_for: RefCell<Vec<Hash256>>,
    misbehavior: RefCell<u32>,
}

impl PeerOps for RecordingPeer {
    fn misbehaving(&self, score: u32, _reason: &str) {
        *self.misbehavior.borrow_mut() += score;
    }

    fn push_getblocks(&self, _locator: Vec<Hash256>, stop: Hash256) {
        self.getblocks.borrow_mut().push(stop);
    }

    fn ask_for_block(&self, hash: Hash256) {
        self.asked_for.borrow_mut().push(hash);
    }
}

#[test]
fn orphan_resolves_when_parent_arrives() {
    let (manager, clock, genesis_time, _dir) = setup();
    let genesis = manager.best_hash().expect("genesis");

    let block1 = build_block(genesis, 1, genesis_time + SPACING);
    let hash1 = block1.hash();
    let block2 = build_block(hash1, 2, genesis_time + 2 * SPACING);
    let hash2 = block2.hash();
    let block3 = build_block(hash2, 3, genesis_time + 3 * SPACING);
    let hash3 = block3.hash();
    clock.store((genesis_time + 3 * SPACING) as i64, Ordering::Relaxed);

    manager.process_new_block(block1, None).expect("block 1");
    assert_eq!(manager.best_height(), 1);

    // Block 3 arrives before block 2: buffered, ancestry requested.
    let peer = RecordingPeer::default();
    manager
        .process_new_block(block3, Some(&peer))
        .expect("orphan buffered");
    assert_eq!(manager.best_height(), 1);
    assert!(manager.has_orphan_block(&hash3));
    assert_eq!(manager.orphan_counts().1, 1);
    // The orphan root is block 3 itself; its parent is what we want.
    assert_eq!(peer.getblocks.borrow().as_slice(), &[hash3]);
    assert_eq!(peer.asked_for.borrow().as_slice(), &[hash2]);
    assert_eq!(*peer.misbehavior.borrow(), 0);

    // Parent arrives; the orphan connects behind it.
    manager.process_new_block(block2, None).expect("block 2");
    assert_eq!(manager.best_height(), 3);
    assert_eq!(manager.best_hash(), Some(hash3));
    assert_eq!(manager.orphan_counts().1, 0);
    assert!(manager.chain_links_consistent());
}

#[test]
fn deep_orphan_chain_resolves_transitively() {
    let (manager, clock, genesis_time, _dir) = setup();
    let genesis = manager.best_hash().expect("genesis");

    let mut blocks = Vec::new();
    let mut parent = genesis;
    for height in 1..=6 {
        let block = build_block(parent, height, genesis_time + height as u32 * SPACING);
        parent = block.hash();
        blocks.push(block);
    }
    clock.store((genesis_time + 6 * SPACING) as i64, Ordering::Relaxed);

    // Deliver every ancestor in reverse order; all but the first buffer.
    for block in blocks.iter().skip(1).rev() {
        manager
            .process_new_block(block.clone(), None)
            .expect("orphan buffered");
    }
    assert_eq!(manager.best_height(), 0);
    assert_eq!(manager.orphan_counts().1, 5);

    // The lone missing block connects the entire chain.
    manager
        .process_new_block(blocks[0].clone(), None)
        .expect("block 1");
    assert_eq!(manager.best_height(), 6);
    assert_eq!(manager.orphan_counts().1, 0);
    for block in &blocks {
        assert!(manager.contains_block(&block.hash()));
    }
    assert!(manager.chain_links_consistent());
}

#[test]
fn orphan_root_walks_to_earliest_buffered_ancestor() {
    let (manager, clock, genesis_time, _dir) = setup();
    let genesis = manager.best_hash().expect("genesis");

    let block1 = build_block(genesis, 1, genesis_time + SPACING);
    let block2 = build_block(block1.hash(), 2, genesis_time + 2 * SPACING);
    let hash2 = block2.hash();
    let block3 = build_block(hash2, 3, genesis_time + 3 * SPACING);
    let hash3 = block3.hash();
    clock.store((genesis_time + 3 * SPACING) as i64, Ordering::Relaxed);

    manager.process_new_block(block2, None).expect("buffered");
    manager.process_new_block(block3, None).expect("buffered");
    assert_eq!(manager.orphan_block_root(&hash3), Some(hash2));
}
