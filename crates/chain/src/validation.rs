//! Context-free transaction and block checks.

use nucleod_consensus::constants::{future_drift, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE};
use nucleod_consensus::money::{money_range, Amount, CENT, MAX_MONEY, MIN_RELAY_TX_FEE, MIN_TX_FEE};
use nucleod_consensus::params::{ChainParams, Network};
use nucleod_consensus::Hash256;
use nucleod_pow::check_proof_of_work;
use nucleod_primitives::block::Block;
use nucleod_primitives::transaction::{Transaction, TX_CURRENT_VERSION};
use nucleod_script::secp::verify_hash_signature;
use nucleod_script::standard::{
    has_canonical_pushes, is_push_only, sigop_count, solve, ScriptType,
    MAX_STANDARD_SCRIPT_SIG_SIZE,
};

use crate::error::ChainError;

use std::collections::HashSet;

/// Which optional block checks run; tests and the re-check inside block
/// connect relax individual rules.
#[derive(Clone, Copy, Debug)]
pub struct ValidationFlags {
    /// Verify the PoW hash against `bits`. Off by default: the deployed
    /// rule relies on the retarget equality check plus checkpoints, and
    /// every header still pays for itself through `bits`.
    pub check_pow: bool,
    pub check_merkle: bool,
    pub check_signature: bool,
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self {
            check_pow: false,
            check_merkle: true,
            check_signature: true,
        }
    }
}

/// Structural transaction rules; no chain state consulted.
pub fn check_transaction(tx: &Transaction, network: Network) -> Result<(), ChainError> {
    if tx.vin.is_empty() {
        return Err(ChainError::reject(10, "vin empty"));
    }
    if tx.vout.is_empty() {
        return Err(ChainError::reject(10, "vout empty"));
    }
    if tx.serialized_size() > MAX_BLOCK_SIZE {
        return Err(ChainError::reject(100, "transaction over size limit"));
    }

    let is_coinbase = tx.is_coinbase();
    let is_coinstake = tx.is_coinstake();
    let mut value_out: Amount = 0;
    for output in &tx.vout {
        if output.is_empty() && !is_coinbase && !is_coinstake {
            return Err(ChainError::reject(100, "empty txout in user transaction"));
        }
        if output.value < 0 {
            return Err(ChainError::reject(100, "txout value negative"));
        }
        if output.value > MAX_MONEY {
            return Err(ChainError::reject(100, "txout value too high"));
        }
        value_out += output.value;
        if !money_range(value_out) {
            return Err(ChainError::reject(100, "txout total out of range"));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(ChainError::reject(0, "duplicate inputs"));
        }
    }

    if is_coinbase {
        let script_len = tx.vin[0].script_sig.len();
        if network == Network::Mainnet && !(2..=100).contains(&script_len) {
            return Err(ChainError::reject(100, "coinbase script size invalid"));
        }
    } else {
        for input in &tx.vin {
            if input.prevout.is_null() {
                return Err(ChainError::reject(10, "null prevout in user transaction"));
            }
        }
    }

    Ok(())
}

/// Relay standardness; consensus-valid transactions that fail here are
/// simply not accepted into the pool on mainnet.
pub fn is_standard_tx(tx: &Transaction) -> bool {
    if tx.version > TX_CURRENT_VERSION {
        return false;
    }

    for input in &tx.vin {
        if input.script_sig.len() > MAX_STANDARD_SCRIPT_SIG_SIZE {
            return false;
        }
        if !is_push_only(&input.script_sig) {
            return false;
        }
        if !has_canonical_pushes(&input.script_sig) {
            return false;
        }
    }

    let mut data_outputs = 0usize;
    for output in &tx.vout {
        let Some((kind, _)) = solve(&output.script_pubkey) else {
            return false;
        };
        if kind == ScriptType::NullData {
            data_outputs += 1;
        } else if output.value == 0 {
            return false;
        }
        if !has_canonical_pushes(&output.script_pubkey) {
            return false;
        }
    }

    // Only one data carrier per transaction.
    data_outputs <= 1
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeeMode {
    Block,
    Relay,
}

/// Minimum fee for a transaction of `bytes` size entering a block that
/// already holds `block_size` bytes. Relay mode carries a zero base fee;
/// free relay is bounded by the rate limiter instead.
pub fn get_min_fee(tx: &Transaction, block_size: usize, mode: FeeMode, bytes: usize) -> Amount {
    let base_fee = match mode {
        FeeMode::Relay => MIN_RELAY_TX_FEE,
        FeeMode::Block => MIN_TX_FEE,
    };
    let new_block_size = block_size + bytes;
    let mut min_fee = (1 + bytes as Amount / 1_000) * base_fee;

    // Dust outputs always pay the full base fee.
    if min_fee < MIN_TX_FEE && tx.vout.iter().any(|output| output.value < CENT) {
        min_fee = MIN_TX_FEE;
    }

    // Raise the price as the block approaches full.
    let soft_cap = MAX_BLOCK_SIZE / 2;
    if block_size != 1 && new_block_size >= soft_cap / 2 {
        if new_block_size >= soft_cap {
            return MAX_MONEY;
        }
        min_fee *= (soft_cap / (soft_cap - new_block_size)) as Amount;
    }

    if !money_range(min_fee) {
        min_fee = MAX_MONEY;
    }
    min_fee
}

/// Proof-of-stake block signature: the key taken from the coinstake's first
/// paying output signs the block hash. Proof-of-work blocks are unsigned.
pub fn check_block_signature(block: &Block) -> bool {
    if block.is_proof_of_work() {
        return block.signature.is_empty();
    }
    let coinstake = &block.transactions[1];
    let Some(output) = coinstake.vout.get(1) else {
        return false;
    };
    let Some((ScriptType::PubKey, solutions)) = solve(&output.script_pubkey) else {
        return false;
    };
    if block.signature.is_empty() {
        return false;
    }
    verify_hash_signature(&solutions[0], &block.signature, &block.hash())
}

/// Context-free block checks.
pub fn check_block(
    block: &Block,
    params: &ChainParams,
    flags: &ValidationFlags,
    adjusted_time: i64,
) -> Result<(), ChainError> {
    if block.transactions.is_empty()
        || block.transactions.len() > MAX_BLOCK_SIZE
        || block.serialized_size() > MAX_BLOCK_SIZE
    {
        return Err(ChainError::reject(100, "block size limits failed"));
    }

    if flags.check_pow
        && block.is_proof_of_work()
        && !check_proof_of_work(&block.hash(), block.header.bits, &params.consensus.pow_limit)
    {
        return Err(ChainError::reject(50, "proof of work failed"));
    }

    let block_time = block.header.time as i64;
    if block_time > future_drift(adjusted_time) {
        return Err(ChainError::reject(0, "block timestamp too far in the future"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ChainError::reject(100, "first tx is not coinbase"));
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(ChainError::reject(100, "more than one coinbase"));
        }
    }

    if block_time > future_drift(block.transactions[0].time as i64) {
        return Err(ChainError::reject(50, "coinbase timestamp too early"));
    }

    if block.is_proof_of_stake() {
        let coinbase = &block.transactions[0];
        if coinbase.vout.len() != 1 || !coinbase.vout[0].is_empty() {
            return Err(ChainError::reject(
                100,
                "coinbase output not empty in proof-of-stake block",
            ));
        }
        for tx in &block.transactions[2..] {
            if tx.is_coinstake() {
                return Err(ChainError::reject(100, "more than one coinstake"));
            }
        }
        if flags.check_signature && !check_block_signature(block) {
            return Err(ChainError::reject(100, "bad proof-of-stake block signature"));
        }
    }

    for tx in &block.transactions {
        check_transaction(tx, params.network)?;
        if block_time < tx.time as i64 {
            return Err(ChainError::reject(
                50,
                "block timestamp earlier than transaction timestamp",
            ));
        }
    }

    let mut unique: HashSet<Hash256> = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        if !unique.insert(tx.txid()) {
            return Err(ChainError::reject(100, "duplicate transaction"));
        }
    }

    let mut sigops = 0usize;
    for tx in &block.transactions {
        for input in &tx.vin {
            sigops += sigop_count(&input.script_sig, false);
        }
        for output in &tx.vout {
            sigops += sigop_count(&output.script_pubkey, false);
        }
    }
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(ChainError::reject(100, "out-of-bounds sigop count"));
    }

    if flags.check_merkle && block.header.merkle_root != block.merkle_root() {
        return Err(ChainError::reject(100, "merkle root mismatch"));
    }

    Ok(())
}

/// The mainnet relay policy applies standardness; test networks relay
/// everything consensus-valid.
pub fn standardness_applies(params: &ChainParams) -> bool {
    params.network == Network::Mainnet
}
