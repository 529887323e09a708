//! Stake kernel hash verification and coinstake timing rules.

use nucleod_consensus::constants::STAKE_TIMESTAMP_MASK;
use nucleod_consensus::money::{Amount, CENT, COIN};
use nucleod_consensus::{ConsensusParams, Hash256};
use nucleod_pow::difficulty::compact_to_u256;
use nucleod_primitives::encoding::{Encodable, Encoder};
use nucleod_primitives::hash::sha256d;
use nucleod_primitives::outpoint::OutPoint;
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Coinstake timestamp precedes the staked output's transaction.
    TimestampViolation,
    /// The staked output has not reached the minimum age.
    StakeTooYoung,
    /// `bits` does not decode to a usable target.
    BadTarget,
    /// Kernel hash exceeds the weighted target.
    TargetNotMet,
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::TimestampViolation => write!(f, "coinstake timestamp violation"),
            KernelError::StakeTooYoung => write!(f, "stake does not meet minimum age"),
            KernelError::BadTarget => write!(f, "invalid stake target"),
            KernelError::TargetNotMet => write!(f, "kernel hash does not meet target"),
        }
    }
}

impl std::error::Error for KernelError {}

/// Everything the kernel hash binds together.
#[derive(Clone, Copy, Debug)]
pub struct StakeKernel {
    pub stake_modifier: u64,
    /// Timestamp of the block containing the staked output.
    pub block_from_time: i64,
    /// Byte offset of the staked transaction inside that block.
    pub tx_prev_offset: u32,
    pub tx_prev_time: u32,
    pub prevout: OutPoint,
    pub tx_time: u32,
}

/// Result of a successful kernel check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelCheck {
    pub proof_hash: Hash256,
    pub target: Hash256,
}

/// Coin-day weight of a staked output: value-time product capped at the
/// maximum stake age, normalized to coin-days.
pub fn coin_day_weight(value: Amount, age_seconds: i64, params: &ConsensusParams) -> u64 {
    let weighted_seconds = age_seconds.clamp(0, params.stake_max_age) as u128;
    let cent_seconds = value.max(0) as u128 * weighted_seconds / CENT as u128;
    (cent_seconds * CENT as u128 / COIN as u128 / (24 * 60 * 60)) as u64
}

/// Verify `hash(modifier, block-from-time, txPrev-time, txPrev-offset,
/// outpoint, tx-time) <= target * weight`.
pub fn check_stake_kernel_hash(
    bits: u32,
    kernel: &StakeKernel,
    stake_value: Amount,
    params: &ConsensusParams,
) -> Result<KernelCheck, KernelError> {
    if (kernel.tx_time as i64) < kernel.tx_prev_time as i64 {
        return Err(KernelError::TimestampViolation);
    }
    if kernel.block_from_time + params.stake_min_age > kernel.tx_time as i64 {
        return Err(KernelError::StakeTooYoung);
    }

    let target_per_coin_day = compact_to_u256(bits).map_err(|_| KernelError::BadTarget)?;
    if target_per_coin_day.is_zero() {
        return Err(KernelError::BadTarget);
    }

    let age = kernel.tx_time as i64 - kernel.tx_prev_time as i64;
    let weight = coin_day_weight(stake_value, age, params);

    let weighted = U512::from(target_per_coin_day) * U512::from(weight);
    let target = if weighted > U512::from(U256::MAX) {
        U256::MAX
    } else {
        let bytes = weighted.to_little_endian();
        let mut low = [0u8; 32];
        low.copy_from_slice(&bytes[..32]);
        U256::from_little_endian(&low)
    };

    let mut encoder = Encoder::new();
    encoder.write_u64_le(kernel.stake_modifier);
    encoder.write_u32_le(kernel.block_from_time as u32);
    encoder.write_u32_le(kernel.tx_prev_time);
    encoder.write_u32_le(kernel.tx_prev_offset);
    kernel.prevout.consensus_encode(&mut encoder);
    encoder.write_u32_le(kernel.tx_time);
    let proof_hash = sha256d(&encoder.into_inner());

    if U256::from_little_endian(&proof_hash) > target {
        return Err(KernelError::TargetNotMet);
    }

    Ok(KernelCheck {
        proof_hash,
        target: target.to_little_endian(),
    })
}

/// The coinstake timestamp and block timestamp must agree; protocol v2
/// additionally requires the timestamp to sit on a mask boundary.
pub fn check_coinstake_timestamp(protocol_version: u32, block_time: i64, tx_time: i64) -> bool {
    if block_time != tx_time {
        return false;
    }
    if protocol_version >= 2 {
        (tx_time as u32 & STAKE_TIMESTAMP_MASK) == 0
    } else {
        true
    }
}
