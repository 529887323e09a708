//! Compact target utilities and the per-block retarget filter.

use std::cmp::Ordering;

use nucleod_consensus::{ConsensusParams, Hash256};
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

/// Ancestor view the retarget filter walks, youngest first.
#[derive(Clone, Copy, Debug)]
pub struct ProofHeader {
    pub time: i64,
    pub bits: u32,
    pub is_proof_of_stake: bool,
    pub is_genesis: bool,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if (bits & 0x0080_0000) != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3))
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;
    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        compact = (value >> (8 * (size - 3))).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

pub fn cmp_hashes(a: &Hash256, b: &Hash256) -> Ordering {
    U256::from_little_endian(a).cmp(&U256::from_little_endian(b))
}

/// Chain trust contributed by one block: ~2^256 / (target + 1).
pub fn block_trust(bits: u32) -> U256 {
    let Ok(target) = compact_to_u256(bits) else {
        return U256::zero();
    };
    if target.is_zero() {
        return U256::zero();
    }
    let one = U256::from(1u64);
    (!target / (target + one)) + one
}

pub fn check_proof_of_work(hash: &Hash256, bits: u32, pow_limit: &Hash256) -> bool {
    let Ok(target) = compact_to_u256(bits) else {
        return false;
    };
    if target.is_zero() || target > U256::from_little_endian(pow_limit) {
        return false;
    }
    U256::from_little_endian(hash) <= target
}

/// Expected `bits` for the next block of the given proof kind.
///
/// Exponential moving average toward the target spacing; proof-of-work and
/// proof-of-stake retarget on independent sub-chains, so only the last two
/// ancestors of the matching kind participate.
pub fn next_target_required(
    mut ancestors: impl Iterator<Item = ProofHeader>,
    is_proof_of_stake: bool,
    params: &ConsensusParams,
) -> u32 {
    let limit = if is_proof_of_stake {
        U256::from_little_endian(&params.pos_limit)
    } else {
        U256::from_little_endian(&params.pow_limit)
    };
    let limit_bits = u256_to_compact(limit);

    let Some(prev) = last_of_kind(&mut ancestors, is_proof_of_stake) else {
        return limit_bits;
    };
    if prev.is_genesis {
        return limit_bits;
    }
    let Some(prev_prev) = last_of_kind(&mut ancestors, is_proof_of_stake) else {
        return limit_bits;
    };
    if prev_prev.is_genesis {
        return limit_bits;
    }

    let mut actual_spacing = prev.time - prev_prev.time;
    if actual_spacing < 0 {
        actual_spacing = params.target_spacing;
    }

    let interval = params.target_timespan / params.target_spacing;
    let Ok(prev_target) = compact_to_u256(prev.bits) else {
        return limit_bits;
    };

    let numerator =
        ((interval - 1) * params.target_spacing + 2 * actual_spacing).max(0) as u64;
    let denominator = ((interval + 1) * params.target_spacing) as u64;
    let scaled = U512::from(prev_target) * U512::from(numerator) / U512::from(denominator);

    if scaled.is_zero() || scaled > U512::from(limit) {
        return limit_bits;
    }
    let bytes = scaled.to_little_endian();
    let mut low = [0u8; 32];
    low.copy_from_slice(&bytes[..32]);
    u256_to_compact(U256::from_little_endian(&low))
}

/// Walk back to the most recent ancestor of the requested kind; a chain
/// with no such ancestor yields its genesis entry.
fn last_of_kind(
    ancestors: &mut impl Iterator<Item = ProofHeader>,
    is_proof_of_stake: bool,
) -> Option<ProofHeader> {
    for header in ancestors {
        if header.is_proof_of_stake == is_proof_of_stake || header.is_genesis {
            return Some(header);
        }
    }
    None
}

/// The loosest target reachable `elapsed` seconds past `base_bits`, doubling
/// once per day. Gates orphan chains that claim too little work.
pub fn compute_max_bits(limit: &Hash256, base_bits: u32, mut elapsed: i64) -> u32 {
    let limit = U256::from_little_endian(limit);
    let Ok(base) = compact_to_u256(base_bits) else {
        return u256_to_compact(limit);
    };

    let mut result = base.saturating_mul(U256::from(2u64));
    while elapsed > 0 && result < limit {
        result = result.saturating_mul(U256::from(2u64));
        elapsed -= 24 * 60 * 60;
    }
    if result > limit {
        result = limit;
    }
    u256_to_compact(result)
}
