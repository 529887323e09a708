use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use nucleod_chain::{BlockFileStore, ChainManager, Clock};
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

fn build_block(parent: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: BlockHeader {
            version: 7,
            prev_block: parent,
            merkle_root: [0u8; 32],
            time,
            bits: REGTEST_BITS,
            nonce: 0,
        },
        transactions,
        signature: Vec::new(),
    };
    block.header.merkle_root = block.merkle_root();
    block
}

struct Harness {
    manager: ChainManager,
    clock: Arc<AtomicI64>,
    genesis_time: u32,
    _dir: tempfile::TempDir,
}

fn setup() -> Harness {
    let params = chain_params(Network::Regtest);
    let genesis_time = params.consensus.genesis_time;
    let dir = tempfile::tempdir().expect("tempdir");
    let files =
        BlockFileStore::new(dir.path(), params.message_start, 1 << 26).expect("block files");
    let (clock, clock_cell) = Clock::fixed(genesis_time as i64);
    let manager = ChainManager::new(params, Arc::new(MemoryStore::new()), files, clock);
    manager.init().expect("init");
    Harness {
        manager,
        clock: clock_cell,
        genesis_time,
        _dir: dir,
    }
}

impl Harness {
    fn block_time(&self, height: i32) -> u32 {
        self.genesis_time + height as u32 * SPACING
    }

    fn mine(&self, parent: Hash256, height: i32, extra: Vec<Transaction>) -> Hash256 {
        let time = self.block_time(height);
        let reward = if height == 1 {
            50_000_000 * COIN
        } else {
            5_000 * COIN
        };
        let mut transactions = vec![coinbase(height, time, reward)];
        transactions.extend(extra);
        let block = build_block(parent, time, transactions);
        let hash = block.hash();
        self.clock.store(time as i64, Ordering::Relaxed);
        self.manager
            .process_new_block(block, None)
            .expect("block accepted");
        hash
    }
}

#[test]
fn genesis_initializes_chain() {
    let harness = setup();
    let tip = harness.manager.tip().expect("tip");
    assert_eq!(tip.height, 0);
    assert!(harness.manager.contains_block(&tip.hash));
}

#[test]
fn linear_accept_advances_tip() {
    let harness = setup();
    let genesis = harness.manager.best_hash().expect("genesis");

    let block1 = harness.mine(genesis, 1, Vec::new());
    assert_eq!(harness.manager.best_height(), 1);
    assert_eq!(harness.manager.best_hash(), Some(block1));

    let mut parent = block1;
    for height in 2..=5 {
        parent = harness.mine(parent, height, Vec::new());
    }
    assert_eq!(harness.manager.best_height(), 5);
    assert!(harness.manager.chain_links_consistent());
}

#[test]
fn tip_trust_is_monotonic() {
    let harness = setup();
    let mut parent = harness.manager.best_hash().expect("genesis");
    let mut last_trust = harness.manager.tip().expect("tip").trust;
    for height in 1..=8 {
        parent = harness.mine(parent, height, Vec::new());
        let trust = harness.manager.tip().expect("tip").trust;
        assert!(trust > last_trust);
        last_trust = trust;
    }
}

#[test]
fn duplicate_delivery_is_transient() {
    let harness = setup();
    let genesis = harness.manager.best_hash().expect("genesis");
    let time = harness.block_time(1);
    let block = build_block(genesis, time, vec![coinbase(1, time, 50_000_000 * COIN)]);
    harness.clock.store(time as i64, Ordering::Relaxed);
    harness
        .manager
        .process_new_block(block.clone(), None)
        .expect("first delivery");
    let err = harness
        .manager
        .process_new_block(block, None)
        .expect_err("second delivery");
    assert_eq!(err.dos_weight(), 0);
    assert_eq!(harness.manager.best_height(), 1);
}

#[test]
fn wrong_coinbase_height_rejected() {
    let harness = setup();
    let genesis = harness.manager.best_hash().expect("genesis");
    let time = harness.block_time(1);
    // Coinbase claims height 2 in a block extending genesis.
    let block = build_block(genesis, time, vec![coinbase(2, time, 50_000_000 * COIN)]);
    harness.clock.store(time as i64, Ordering::Relaxed);
    let err = harness
        .manager
        .process_new_block(block, None)
        .expect_err("height mismatch");
    assert_eq!(err.dos_weight(), 100);
    assert_eq!(harness.manager.best_height(), 0);
}

#[test]
fn overclaiming_coinbase_rejected() {
    let harness = setup();
    let genesis = harness.manager.best_hash().expect("genesis");
    let block1 = harness.mine(genesis, 1, Vec::new());

    let time = harness.block_time(2);
    let block = build_block(block1, time, vec![coinbase(2, time, 5_001 * COIN)]);
    harness.clock.store(time as i64, Ordering::Relaxed);
    let err = harness
        .manager
        .process_new_block(block, None)
        .expect_err("reward ceiling");
    assert_eq!(err.dos_weight(), 50);
    // The failed connect leaves the tip where it was.
    assert_eq!(harness.manager.best_height(), 1);
    assert!(harness.manager.chain_links_consistent());
}

#[test]
fn exact_reward_with_fees_is_accepted() {
    let harness = setup();
    let genesis = harness.manager.best_hash().expect("genesis");
    let block1 = harness.mine(genesis, 1, Vec::new());
    let coinbase1_txid = coinbase(1, harness.block_time(1), 50_000_000 * COIN).txid();

    let mut parent = block1;
    for height in 2..=11 {
        parent = harness.mine(parent, height, Vec::new());
    }

    // Spend the matured height-1 coinbase with a 0.0001 fee; the coinbase
    // of the including block claims subsidy plus that fee, exactly.
    let time = harness.block_time(12);
    let spend = Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout: OutPoint::new(coinbase1_txid, 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50_000_000 * COIN - 10_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let spend_txid = spend.txid();
    let block = build_block(
        parent,
        time,
        vec![coinbase(12, time, 5_000 * COIN + 10_000), spend],
    );
    harness.clock.store(time as i64, Ordering::Relaxed);
    harness
        .manager
        .process_new_block(block, None)
        .expect("block with fee-claiming coinbase");
    assert_eq!(harness.manager.best_height(), 12);

    let (found, containing) = harness
        .manager
        .read_transaction(&spend_txid)
        .expect("read")
        .expect("indexed");
    assert_eq!(found.txid(), spend_txid);
    assert!(containing.is_some());
}

#[test]
fn immature_coinbase_spend_rejected() {
    let harness = setup();
    let genesis = harness.manager.best_hash().expect("genesis");
    let block1 = harness.mine(genesis, 1, Vec::new());
    let coinbase1_txid = coinbase(1, harness.block_time(1), 50_000_000 * COIN).txid();

    // Only four confirmations; maturity on regtest is ten.
    let mut parent = block1;
    for height in 2..=4 {
        parent = harness.mine(parent, height, Vec::new());
    }

    let time = harness.block_time(5);
    let spend = Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout: OutPoint::new(coinbase1_txid, 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50_000_000 * COIN - 10_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    };
    let block = build_block(parent, time, vec![coinbase(5, time, 5_000 * COIN), spend]);
    harness.clock.store(time as i64, Ordering::Relaxed);
    assert!(harness.manager.process_new_block(block, None).is_err());
    assert_eq!(harness.manager.best_height(), 4);
}
