use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nucleod_chain::{BlockFileStore, ChainManager, Clock};
use nucleod_consensus::money::COIN;
use nucleod_consensus::params::{chain_params, Network};
use nucleod_consensus::Hash256;
use nucleod_node::messages::{commands, decode_inv_list, GetBlocksMessage, InvKind};
use nucleod_node::{load_external_block_data, Inv, MessageProcessor, Peer};
use nucleod_primitives::block::{Block, BlockHeader};
use nucleod_primitives::encoding::Encodable;
use nucleod_primitives::outpoint::OutPoint;
use nucleod_primitives::transaction::{Transaction, TxIn, TxOut};
use nucleod_script::opcodes::push_number;
use nucleod_storage::memory::MemoryStore;

const SPACING: u32 = 80;
const REGTEST_BITS: u32 = 0x207f_ffff;

fn coinbase(height: i32, time: u32) -> Transaction {
    let value = if height == 1 {
        50_000_000 * COIN
    } else {
        5_000 * COIN
    };
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
    let mut block = Block {
        header: BlockHeader {
            version: 7,
            prev_block: parent,
            merkle_root: [0u8; 32],
            time,
            bits: REGTEST_BITS,
            nonce: 0,
        },
        transactions: vec![coinbase(height, time)],
        signature: Vec::new(),
    };
    block.header.merkle_root = block.merkle_root();
    block
}

fn setup() -> (Arc<ChainManager>, u32, tempfile::TempDir) {
    let params = chain_params(Network::Regtest);
    let genesis_time = params.consensus.genesis_time;
    let dir = tempfile::tempdir().expect("tempdir");
    let files =
        BlockFileStore::new(dir.path(), params.message_start, 1 << 26).expect("block files");
    let (clock, clock_cell) = Clock::fixed(genesis_time as i64);
    // Far enough ahead that every test block passes the drift check.
    clock_cell.store((genesis_time + 100 * SPACING) as i64, Ordering::Relaxed);
    let manager = Arc::new(ChainManager::new(
        params,
        Arc::new(MemoryStore::new()),
        files,
        clock,
    ));
    manager.init().expect("init");
    (manager, genesis_time, dir)
}

fn chain_of(manager: &ChainManager, genesis_time: u32, length: i32) -> Vec<Block> {
    let mut parent = manager.best_hash().expect("genesis");
    let mut blocks = Vec::new();
    for height in 1..=length {
        let block = build_block(parent, height, genesis_time + height as u32 * SPACING);
        parent = block.hash();
        blocks.push(block);
    }
    blocks
}

#[test]
fn bootstrap_import_accepts_framed_records() {
    let (manager, genesis_time, _dir) = setup();
    let blocks = chain_of(&manager, genesis_time, 5);
    let magic = manager.message_start();

    let mut data = Vec::new();
    data.extend_from_slice(b"leading garbage");
    for block in &blocks {
        let payload = block.encode_to_vec();
        data.extend_from_slice(&magic);
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&payload);
    }
    // Torn record at the tail must not derail the import.
    data.extend_from_slice(&magic);
    data.extend_from_slice(&100u32.to_le_bytes());
    data.extend_from_slice(&[0u8; 10]);

    let loaded = load_external_block_data(&manager, &data);
    assert_eq!(loaded, 5);
    assert_eq!(manager.best_height(), 5);
}

#[test]
fn bootstrap_import_skips_implausible_sizes() {
    let (manager, genesis_time, _dir) = setup();
    let blocks = chain_of(&manager, genesis_time, 1);
    let magic = manager.message_start();

    let mut data = Vec::new();
    // Magic with a zero size is not a record.
    data.extend_from_slice(&magic);
    data.extend_from_slice(&0u32.to_le_bytes());
    let payload = blocks[0].encode_to_vec();
    data.extend_from_slice(&magic);
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(&payload);

    assert_eq!(load_external_block_data(&manager, &data), 1);
    assert_eq!(manager.best_height(), 1);
}

/// Test double recording everything sent to the peer.
#[derive(Default)]
struct MockPeer {
    sent: RefCell<Vec<(String, Vec<u8>)>>,
    inventory: RefCell<Vec<Inv>>,
    continuation: RefCell<Option<Hash256>>,
    misbehavior: RefCell<u32>,
}

impl Peer for MockPeer {
    fn id(&self) -> u64 {
        7
    }

    fn starting_height(&self) -> i32 {
        0
    }

    fn record_starting_height(&self, _height: i32) {}

    fn misbehaving(&self, score: u32, _reason: &str) {
        *self.misbehavior.borrow_mut() += score;
    }

    fn send(&self, command: &str, payload: Vec<u8>) {
        self.sent.borrow_mut().push((command.to_string(), payload));
    }

    fn add_inventory_known(&self, _inv: &Inv) {}

    fn push_inventory(&self, inv: Inv) {
        self.inventory.borrow_mut().push(inv);
    }

    fn set_continuation(&self, hash: Option<Hash256>) {
        *self.continuation.borrow_mut() = hash;
    }

    fn continuation(&self) -> Option<Hash256> {
        *self.continuation.borrow()
    }
}

#[test]
fn block_messages_drive_the_chain() {
    let (manager, genesis_time, _dir) = setup();
    let processor = MessageProcessor::new(Arc::clone(&manager));
    let peer = MockPeer::default();

    for block in chain_of(&manager, genesis_time, 3) {
        processor
            .handle_message(&peer, commands::BLOCK, &block.encode_to_vec())
            .expect("block handled");
    }
    assert_eq!(manager.best_height(), 3);
    assert_eq!(*peer.misbehavior.borrow(), 0);
}

#[test]
fn getblocks_serves_inventory_after_locator_fork() {
    let (manager, genesis_time, _dir) = setup();
    let processor = MessageProcessor::new(Arc::clone(&manager));
    let peer = MockPeer::default();

    let blocks = chain_of(&manager, genesis_time, 6);
    for block in &blocks {
        manager
            .process_new_block(block.clone(), None)
            .expect("block");
    }

    // Locator claiming only block 2: the reply lists blocks 3..6.
    let message = GetBlocksMessage {
        locator: nucleod_node::BlockLocator::new(vec![blocks[1].hash()]),
        stop: [0u8; 32],
    };
    processor
        .handle_message(&peer, commands::GETBLOCKS, &message.encode_to_vec())
        .expect("getblocks handled");

    let served: Vec<Hash256> = peer.inventory.borrow().iter().map(|inv| inv.hash).collect();
    let expected: Vec<Hash256> = blocks[2..].iter().map(Block::hash).collect();
    assert_eq!(served, expected);
    assert!(peer.continuation.borrow().is_none());
}

#[test]
fn getdata_returns_blocks_and_inv_requests_unknown() {
    let (manager, genesis_time, _dir) = setup();
    let processor = MessageProcessor::new(Arc::clone(&manager));
    let peer = MockPeer::default();

    let blocks = chain_of(&manager, genesis_time, 2);
    for block in &blocks {
        manager
            .process_new_block(block.clone(), None)
            .expect("block");
    }

    // Announce one known and one unknown block; only the unknown one is
    // requested back.
    let known = blocks[0].hash();
    let unknown = [0xeeu8; 32];
    let invs = nucleod_node::messages::encode_inv_list(&[Inv::block(known), Inv::block(unknown)]);
    processor
        .handle_message(&peer, commands::INV, &invs)
        .expect("inv handled");

    let sent = peer.sent.borrow();
    let getdata = sent
        .iter()
        .find(|(command, _)| command == commands::GETDATA)
        .expect("getdata sent");
    let requested = decode_inv_list(&getdata.1).expect("decode");
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].hash, unknown);
    assert_eq!(requested[0].kind, InvKind::Block);
    drop(sent);

    // Fetch a block back.
    let request = nucleod_node::messages::encode_inv_list(&[Inv::block(known)]);
    processor
        .handle_message(&peer, commands::GETDATA, &request)
        .expect("getdata handled");
    let sent = peer.sent.borrow();
    let (_, payload) = sent
        .iter()
        .find(|(command, _)| command == commands::BLOCK)
        .expect("block sent");
    assert_eq!(Block::decode(payload).expect("decode").hash(), known);
}
