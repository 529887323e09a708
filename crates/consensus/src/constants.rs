//! Protocol-wide limits and timing constants.

/// Maximum serialized block size, and the ceiling for any serialized tx.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
/// Miner soft cap; fee scaling kicks in at half of this.
pub const MAX_BLOCK_SIZE_GEN: usize = MAX_BLOCK_SIZE / 2;
/// Block-global signature-operation budget.
pub const MAX_BLOCK_SIGOPS: usize = MAX_BLOCK_SIZE / 50;
/// Maximum entries in a single inv/getdata message.
pub const MAX_INV_SZ: usize = 50_000;

/// Orphan transaction pool cap.
pub const MAX_ORPHAN_TRANSACTIONS: usize = 10_000;
/// Largest transaction the orphan pool will buffer.
pub const MAX_ORPHAN_TX_SIZE: usize = 5_000;

/// Spends of a coinbase or coinstake need this many confirmations.
pub const COINBASE_MATURITY: i32 = 80;
pub const COINBASE_MATURITY_TESTNET: i32 = 10;

/// Proof-of-work blocks are refused above this height.
pub const LAST_POW_BLOCK: i32 = 10_000;

/// Coinbase/coinstake reward ceilings are enforced above this height; the
/// range below it predates the first hardened checkpoint sweep.
pub const REWARD_CHECK_START_HEIGHT: i32 = 17_901;

/// Block timestamps may run at most this far ahead of adjusted time.
pub const FUTURE_DRIFT: i64 = 10 * 60;

pub fn future_drift(time: i64) -> i64 {
    time + FUTURE_DRIFT
}

pub fn past_drift(time: i64) -> i64 {
    time - FUTURE_DRIFT
}

/// Retarget horizon and spacing for the EMA difficulty filter.
pub const TARGET_TIMESPAN: i64 = 20 * 60;
pub const TARGET_SPACING: i64 = 79;

/// Stake age window; a UTXO accrues no weight before the minimum and none
/// past the maximum.
pub const STAKE_MIN_AGE: i64 = 5 * 60 * 60;
pub const STAKE_MAX_AGE: i64 = 5 * 60 * 60;
pub const STAKE_MIN_AGE_TESTNET: i64 = 60 * 60;

/// Seconds between stake-modifier regenerations.
pub const MODIFIER_INTERVAL: i64 = 10 * 60;
pub const MODIFIER_INTERVAL_TESTNET: i64 = 6;
pub const MODIFIER_INTERVAL_RATIO: i64 = 3;

/// Low bits of a v2 coinstake timestamp must be zero.
pub const STAKE_TIMESTAMP_MASK: u32 = 15;

/// Masternode payment amount becomes a consensus rule here.
pub const ENFORCE_MN_PAYMENT_HEIGHT: i32 = 1_100_000;
/// Developer payment amount and script become a consensus rule here.
pub const ENFORCE_DEV_PAYMENT_HEIGHT: i32 = 1_200_000;

/// Masternode payee checks only apply to blocks younger than this.
pub const MN_PAYEE_MAX_BLOCK_AGE: i64 = 60 * 60;

/// Free transaction relay: units are thousand-bytes per minute.
pub const DEFAULT_LIMIT_FREE_RELAY: i64 = 15;

/// Prefix for signed plain-text messages (sync checkpoints, spork relays).
pub const SIGNED_MESSAGE_MAGIC: &str = "Nucleo Signed Message:\n";

/// Tip older than this keeps the node in initial block download.
pub const MAX_TIP_AGE: i64 = 24 * 60 * 60;

/// Minimum free disk space before accepting more blocks (50 MB).
pub const MIN_DISK_SPACE: u64 = 52_428_800;
