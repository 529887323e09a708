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
const FEE: i64 = 10_000;

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

fn spend(prevout: OutPoint, value: i64, time: u32, tag: u8) -> Transaction {
    let mut script_pubkey = vec![0x76, 0xa9, 0x14];
    script_pubkey.extend_from_slice(&[tag; 20]);
    script_pubkey.extend_from_slice(&[0x88, 0xac]);
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout,
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

fn build_block(
    parent: Hash256,
    height: i32,
    time: u32,
    extra: Vec<Transaction>,
    nonce: u32,
) -> Block {
    let reward = if height == 1 {
        50_000_000 * COIN
    } else {
        5_000 * COIN
    };
    let fees = FEE * extra.len() as i64;
    let mut transactions = vec![coinbase(height, time, reward + fees)];
    transactions.extend(extra);
    let mut block = Block {
        header: BlockHeader {
            version: 7,
            prev_block: parent,
            merkle_root: [0u8; 32],
            time,
            bits: REGTEST_BITS,
            nonce,
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
    fn time_at(&self, height: i32) -> u32 {
        self.genesis_time + height as u32 * SPACING
    }

    /// Build the shared trunk: a spendable coinbase at height 1, matured by
    /// height 11. Returns (trunk tip hash, height-1 coinbase txid).
    fn grow_trunk(&self) -> (Hash256, Hash256) {
        let mut parent = self.manager.best_hash().expect("genesis");
        let coinbase1_txid = coinbase(1, self.time_at(1), 50_000_000 * COIN).txid();
        for height in 1..=11 {
            let block = build_block(parent, height, self.time_at(height), Vec::new(), 0);
            parent = block.hash();
            self.clock
                .store(self.time_at(height) as i64, Ordering::Relaxed);
            self.manager
                .process_new_block(block, None)
                .expect("trunk block");
        }
        (parent, coinbase1_txid)
    }
}

#[test]
fn longer_fork_triggers_reorganization() {
    let harness = setup();
    let (trunk, coinbase1_txid) = harness.grow_trunk();
    let funds = OutPoint::new(coinbase1_txid, 0);

    // Branch A holds a spend of the matured coinbase.
    let spend_a = spend(funds, 50_000_000 * COIN - FEE, harness.time_at(12), 0xaa);
    let spend_a_txid = spend_a.txid();
    let a1 = build_block(trunk, 12, harness.time_at(12), vec![spend_a], 0xa1);
    let a1_hash = a1.hash();
    harness
        .clock
        .store(harness.time_at(12) as i64, Ordering::Relaxed);
    harness.manager.process_new_block(a1, None).expect("A1");
    assert_eq!(harness.manager.best_hash(), Some(a1_hash));

    // Branch B: same fork point, one block longer, no spend of the funds.
    let b1 = build_block(trunk, 12, harness.time_at(12) + 1, Vec::new(), 0xb1);
    let b1_hash = b1.hash();
    let b2 = build_block(b1_hash, 13, harness.time_at(13), Vec::new(), 0xb2);
    let b2_hash = b2.hash();

    harness.manager.process_new_block(b1, None).expect("B1");
    // Equal trust: the fork is stored but stays inactive.
    assert_eq!(harness.manager.best_hash(), Some(a1_hash));

    harness
        .clock
        .store(harness.time_at(13) as i64, Ordering::Relaxed);
    harness.manager.process_new_block(b2, None).expect("B2");
    assert_eq!(harness.manager.best_hash(), Some(b2_hash));
    assert_eq!(harness.manager.best_height(), 13);
    assert!(harness.manager.chain_links_consistent());

    // The abandoned branch's spend is resurrected into the mempool.
    assert!(harness.manager.mempool_contains(&spend_a_txid));
}

#[test]
fn reorganization_purges_confirmed_transactions_from_pool() {
    let harness = setup();
    let (trunk, coinbase1_txid) = harness.grow_trunk();
    let funds = OutPoint::new(coinbase1_txid, 0);

    // A1 carries no transactions; the fork branch confirms spend_b.
    let a1 = build_block(trunk, 12, harness.time_at(12), Vec::new(), 0xa1);
    harness
        .clock
        .store(harness.time_at(12) as i64, Ordering::Relaxed);
    harness.manager.process_new_block(a1, None).expect("A1");

    // spend_b sits in the mempool first.
    let spend_b = spend(funds, 50_000_000 * COIN - FEE, harness.time_at(12) + 1, 0xbb);
    let spend_b_txid = spend_b.txid();
    harness
        .manager
        .accept_to_memory_pool(spend_b.clone(), true)
        .expect("mempool accept");
    assert!(harness.manager.mempool_contains(&spend_b_txid));

    let b1 = build_block(
        trunk,
        12,
        harness.time_at(12) + 1,
        vec![spend_b],
        0xb1,
    );
    let b1_hash = b1.hash();
    let b2 = build_block(b1_hash, 13, harness.time_at(13), Vec::new(), 0xb2);
    let b2_hash = b2.hash();

    harness.manager.process_new_block(b1, None).expect("B1");
    harness
        .clock
        .store(harness.time_at(13) as i64, Ordering::Relaxed);
    harness.manager.process_new_block(b2, None).expect("B2");

    assert_eq!(harness.manager.best_hash(), Some(b2_hash));
    // Now confirmed on the active chain, gone from the pool.
    assert!(!harness.manager.mempool_contains(&spend_b_txid));
    let (_, containing) = harness
        .manager
        .read_transaction(&spend_b_txid)
        .expect("read")
        .expect("indexed");
    assert_eq!(containing, Some(b1_hash));
}

#[test]
fn failed_reorganization_keeps_old_tip() {
    let harness = setup();
    let (trunk, _) = harness.grow_trunk();

    let a1 = build_block(trunk, 12, harness.time_at(12), Vec::new(), 0xa1);
    let a1_hash = a1.hash();
    harness
        .clock
        .store(harness.time_at(12) as i64, Ordering::Relaxed);
    harness.manager.process_new_block(a1, None).expect("A1");

    // The competing branch's second block overpays its coinbase; the
    // violation only surfaces while reconnecting during the reorganization.
    let b1 = build_block(trunk, 12, harness.time_at(12) + 1, Vec::new(), 0xb1);
    let b1_hash = b1.hash();
    let mut b2 = build_block(b1_hash, 13, harness.time_at(13), Vec::new(), 0xb2);
    b2.transactions[0].vout[0].value = 5_001 * COIN;
    b2.header.merkle_root = b2.merkle_root();

    harness.manager.process_new_block(b1, None).expect("B1 stored");
    harness
        .clock
        .store(harness.time_at(13) as i64, Ordering::Relaxed);
    let err = harness
        .manager
        .process_new_block(b2, None)
        .expect_err("overpaying fork block");
    assert_eq!(err.dos_weight(), 50);

    // The attempted transition rolled back entirely.
    assert_eq!(harness.manager.best_hash(), Some(a1_hash));
    assert_eq!(harness.manager.best_height(), 12);
    assert!(harness.manager.chain_links_consistent());

    // The surviving chain keeps extending normally afterwards.
    let a2 = build_block(a1_hash, 13, harness.time_at(13) + 1, Vec::new(), 0xa2);
    let a2_hash = a2.hash();
    harness
        .clock
        .store((harness.time_at(13) + 1) as i64, Ordering::Relaxed);
    harness.manager.process_new_block(a2, None).expect("A2");
    assert_eq!(harness.manager.best_hash(), Some(a2_hash));
}
