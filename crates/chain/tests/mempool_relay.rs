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
const FUND_OUTPUTS: usize = 200;

fn funding_coinbase(time: u32) -> Transaction {
    let share = 50_000_000 * COIN / FUND_OUTPUTS as i64;
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: push_number(1),
            sequence: u32::MAX,
        }],
        vout: vec![
            TxOut {
                value: share,
                script_pubkey: vec![0x51],
            };
            FUND_OUTPUTS
        ],
        lock_time: 0,
    }
}

fn plain_coinbase(height: i32, time: u32) -> Transaction {
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: push_number(height as i64),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 5_000 * COIN,
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
    funding_txid: Hash256,
    now: i64,
    _dir: tempfile::TempDir,
}

/// Chain with a matured 200-way funding coinbase at height one.
fn setup() -> Harness {
    let params = chain_params(Network::Regtest);
    let genesis_time = params.consensus.genesis_time;
    let dir = tempfile::tempdir().expect("tempdir");
    let files =
        BlockFileStore::new(dir.path(), params.message_start, 1 << 26).expect("block files");
    let (clock, clock_cell) = Clock::fixed(genesis_time as i64);
    let manager = ChainManager::new(params, Arc::new(MemoryStore::new()), files, clock);
    manager.init().expect("init");

    let mut parent = manager.best_hash().expect("genesis");
    let funding = funding_coinbase(genesis_time + SPACING);
    let funding_txid = funding.txid();
    for height in 1..=11 {
        let time = genesis_time + height as u32 * SPACING;
        let coinbase = if height == 1 {
            funding.clone()
        } else {
            plain_coinbase(height, time)
        };
        let block = build_block(parent, time, vec![coinbase]);
        parent = block.hash();
        clock_cell.store(time as i64, Ordering::Relaxed);
        manager.process_new_block(block, None).expect("setup block");
    }

    let now = (genesis_time + 12 * SPACING) as i64;
    clock_cell.store(now, Ordering::Relaxed);
    Harness {
        manager,
        clock: clock_cell,
        funding_txid,
        now,
        _dir: dir,
    }
}

impl Harness {
    fn fund(&self, index: u32) -> OutPoint {
        OutPoint::new(self.funding_txid, index)
    }
}

fn spend(prevout: OutPoint, value: i64, time: u32, tag: u8) -> Transaction {
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
            script_pubkey: vec![0x51, 0x75, 0x51 + (tag % 16)],
        }],
        lock_time: 0,
    }
}

/// Pad a spend with one large push so it serializes to exactly `target`
/// bytes.
fn sized_free_spend(prevout: OutPoint, value: i64, time: u32, target: usize) -> Transaction {
    let mut tx = spend(prevout, value, time, 0);
    tx.vout[0].script_pubkey = vec![0x51];
    let base = tx.serialized_size();
    // Compact-size prefix for the scriptSig grows to three bytes.
    let data_len = target - base - 3 - 2;
    let mut script_sig = vec![0x4d];
    script_sig.extend_from_slice(&(data_len as u16).to_le_bytes());
    script_sig.extend_from_slice(&vec![0xab; data_len]);
    tx.vin[0].script_sig = script_sig;
    assert_eq!(tx.serialized_size(), target);
    tx
}

#[test]
fn double_spend_rejected_without_dos() {
    let harness = setup();
    let share = 50_000_000 * COIN / FUND_OUTPUTS as i64;
    let time = harness.now as u32;

    let first = spend(harness.fund(0), share - 10_000, time, 1);
    let first_txid = first.txid();
    harness
        .manager
        .accept_to_memory_pool(first, true)
        .expect("first spend");
    assert!(harness.manager.mempool_contains(&first_txid));

    // A conflicting spend of the same output is refused with no penalty.
    let conflict = spend(harness.fund(0), share - 20_000, time, 2);
    let err = harness
        .manager
        .accept_to_memory_pool(conflict, true)
        .expect_err("conflict");
    assert_eq!(err.dos_weight(), 0);
    assert!(harness.manager.mempool_contains(&first_txid));
    assert_eq!(harness.manager.mempool_size(), 1);
}

#[test]
fn free_relay_is_rate_limited_and_recovers() {
    let harness = setup();
    let share = 50_000_000 * COIN / FUND_OUTPUTS as i64;
    let time = harness.now as u32;

    // Zero-fee kilobyte transactions: the limiter admits 150_000 byte-units
    // per decay window at the default -limitfreerelay of 15.
    let mut accepted = 0usize;
    let mut first_rejected = None;
    for index in 0..160u32 {
        let tx = sized_free_spend(harness.fund(index), share, time, 1_000);
        match harness.manager.accept_to_memory_pool(tx, true) {
            Ok(_) => accepted += 1,
            Err(err) => {
                assert_eq!(err.dos_weight(), 0);
                first_rejected.get_or_insert(index);
            }
        }
    }
    assert_eq!(accepted, 150);
    assert_eq!(first_rejected, Some(150));

    // Ten minutes of idle decays roughly two thirds of the counter.
    harness.clock.store(harness.now + 600, Ordering::Relaxed);
    let tx = sized_free_spend(harness.fund(150), share, harness.now as u32, 1_000);
    harness
        .manager
        .accept_to_memory_pool(tx, true)
        .expect("accepted after decay");
}

#[test]
fn fee_paying_transactions_bypass_the_limiter() {
    let harness = setup();
    let share = 50_000_000 * COIN / FUND_OUTPUTS as i64;
    let time = harness.now as u32;

    for index in 0..180u32 {
        let tx = spend(harness.fund(index), share - 10_000, time, index as u8);
        harness
            .manager
            .accept_to_memory_pool(tx, true)
            .expect("fee-paying spend");
    }
    assert_eq!(harness.manager.mempool_size(), 180);
}

#[test]
fn orphan_tx_resolves_when_parent_accepted() {
    let harness = setup();
    let share = 50_000_000 * COIN / FUND_OUTPUTS as i64;
    let time = harness.now as u32;

    let parent_tx = spend(harness.fund(0), share - 10_000, time, 1);
    let parent_txid = parent_tx.txid();
    let child = spend(OutPoint::new(parent_txid, 0), share - 20_000, time + 1, 2);
    let child_txid = child.txid();

    // Child first: buffered as an orphan, nothing pooled yet.
    harness
        .manager
        .process_transaction(child, None)
        .expect("orphan buffered");
    assert!(!harness.manager.mempool_contains(&child_txid));
    assert_eq!(harness.manager.orphan_counts().0, 1);

    // Parent arrives: both land in the pool, the orphan pool drains.
    harness
        .manager
        .process_transaction(parent_tx, None)
        .expect("parent accepted");
    assert!(harness.manager.mempool_contains(&parent_txid));
    assert!(harness.manager.mempool_contains(&child_txid));
    assert_eq!(harness.manager.orphan_counts().0, 0);
}

#[test]
fn invalid_orphan_is_evicted_on_parent_arrival() {
    let harness = setup();
    let share = 50_000_000 * COIN / FUND_OUTPUTS as i64;
    let time = harness.now as u32;

    let parent_tx = spend(harness.fund(0), share - 10_000, time, 1);
    let parent_txid = parent_tx.txid();
    // Orphan claiming more than the parent output carries.
    let bad_child = spend(OutPoint::new(parent_txid, 0), share, time + 1, 2);
    let bad_child_txid = bad_child.txid();

    harness
        .manager
        .process_transaction(bad_child, None)
        .expect("orphan buffered");
    harness
        .manager
        .process_transaction(parent_tx, None)
        .expect("parent accepted");

    assert!(harness.manager.mempool_contains(&parent_txid));
    assert!(!harness.manager.mempool_contains(&bad_child_txid));
    assert_eq!(harness.manager.orphan_counts().0, 0);
}
