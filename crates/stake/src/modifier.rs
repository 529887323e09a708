//! Stake modifier derivation.
//!
//! Each block carries a 64-bit modifier assembled from the entropy bits of
//! blocks selected out of a trailing window. A fresh modifier is generated
//! once per modifier interval; other blocks inherit the previous one. Binding
//! the selection to prior proof hashes keeps a staker from grinding future
//! kernels by reorganizing their own recent history.

use nucleod_consensus::constants::MODIFIER_INTERVAL_RATIO;
use nucleod_consensus::{ConsensusParams, Hash256};
use nucleod_primitives::encoding::Encoder;
use nucleod_primitives::hash::sha256d;
use primitive_types::U256;

const MODIFIER_BITS: usize = 64;

/// Ancestor facts the modifier derivation consumes, youngest first.
#[derive(Clone, Debug)]
pub struct BlockSummary {
    pub hash: Hash256,
    pub proof_hash: Hash256,
    pub time: i64,
    pub entropy_bit: bool,
    pub is_proof_of_stake: bool,
    pub stake_modifier: u64,
    pub generated_modifier: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierError {
    /// No ancestor carries a generated modifier.
    NoGeneratedModifier,
    /// Not enough candidate blocks inside the selection window.
    InsufficientCandidates,
}

impl std::fmt::Display for ModifierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModifierError::NoGeneratedModifier => write!(f, "no generated stake modifier found"),
            ModifierError::InsufficientCandidates => {
                write!(f, "unable to select enough blocks for stake modifier")
            }
        }
    }
}

impl std::error::Error for ModifierError {}

/// Compute the modifier for a block whose parent chain is `ancestors`
/// (`ancestors[0]` is the parent). Returns `(modifier, generated)`.
pub fn compute_next_stake_modifier(
    ancestors: &[BlockSummary],
    params: &ConsensusParams,
) -> Result<(u64, bool), ModifierError> {
    let Some(prev) = ancestors.first() else {
        // Genesis gets a zero modifier, flagged as generated.
        return Ok((0, true));
    };

    let (current_modifier, modifier_time) = last_generated_modifier(ancestors)?;
    if modifier_time / params.modifier_interval >= prev.time / params.modifier_interval {
        // Interval has not rolled over; inherit.
        return Ok((current_modifier, false));
    }

    // Candidates are the blocks inside the selection window preceding the
    // interval boundary, ordered by (time, hash).
    let selection_interval = selection_interval(params);
    let interval_start =
        (prev.time / params.modifier_interval) * params.modifier_interval - selection_interval;
    let mut candidates: Vec<&BlockSummary> = ancestors
        .iter()
        .take_while(|summary| summary.time >= interval_start)
        .collect();
    candidates.sort_by(|a, b| (a.time, a.hash).cmp(&(b.time, b.hash)));

    let mut selected = vec![false; candidates.len()];
    let mut modifier: u64 = 0;
    let mut interval_stop = interval_start;
    let rounds = MODIFIER_BITS.min(candidates.len());

    for round in 0..rounds {
        interval_stop += selection_interval_section(round, params);
        let chosen = select_candidate(&candidates, &selected, interval_stop, current_modifier)
            .ok_or(ModifierError::InsufficientCandidates)?;
        selected[chosen] = true;
        if candidates[chosen].entropy_bit {
            modifier |= 1u64 << round;
        }
    }

    nucleod_log::log_debug!(
        "new stake modifier 0x{modifier:016x} from {rounds} of {} candidates",
        candidates.len()
    );
    Ok((modifier, true))
}

fn last_generated_modifier(ancestors: &[BlockSummary]) -> Result<(u64, i64), ModifierError> {
    ancestors
        .iter()
        .find(|summary| summary.generated_modifier)
        .map(|summary| (summary.stake_modifier, summary.time))
        .ok_or(ModifierError::NoGeneratedModifier)
}

/// Pick the candidate with the smallest selection hash. Candidates are
/// scanned oldest first; once one is provisionally selected, candidates
/// past `interval_stop` no longer compete, but the very first unselected
/// candidate always qualifies so a thin window cannot stall the chain.
/// Proof-of-stake candidates get their hash scaled down so staked blocks
/// dominate the selection.
fn select_candidate(
    candidates: &[&BlockSummary],
    selected: &[bool],
    interval_stop: i64,
    current_modifier: u64,
) -> Option<usize> {
    let mut best: Option<(U256, usize)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if best.is_some() && candidate.time > interval_stop {
            break;
        }
        if selected[index] {
            continue;
        }
        let mut encoder = Encoder::new();
        encoder.write_hash(&candidate.proof_hash);
        encoder.write_u64_le(current_modifier);
        let mut selection = U256::from_little_endian(&sha256d(&encoder.into_inner()));
        if candidate.is_proof_of_stake {
            selection >>= 32;
        }
        match best {
            Some((hash, _)) if selection >= hash => {}
            _ => best = Some((selection, index)),
        }
    }
    best.map(|(_, index)| index)
}

/// Total span of the selection window.
pub fn selection_interval(params: &ConsensusParams) -> i64 {
    (0..MODIFIER_BITS)
        .map(|section| selection_interval_section(section, params))
        .sum()
}

/// Per-round slice of the window; earlier rounds search wider slices.
fn selection_interval_section(section: usize, params: &ConsensusParams) -> i64 {
    params.modifier_interval * 63
        / (63 + ((63 - section as i64) * (MODIFIER_INTERVAL_RATIO - 1)))
}

/// Rolling 32-bit checksum chained across the index; used to spot index
/// corruption when reloading.
pub fn stake_modifier_checksum(
    prev_checksum: u32,
    entropy_bit: bool,
    is_proof_of_stake: bool,
    proof_hash: &Hash256,
    stake_modifier: u64,
) -> u32 {
    let mut flags = 0u32;
    if entropy_bit {
        flags |= 1 << 1;
    }
    if is_proof_of_stake {
        flags |= 1 << 0;
    }
    let mut encoder = Encoder::new();
    encoder.write_u32_le(prev_checksum);
    encoder.write_u32_le(flags);
    encoder.write_hash(proof_hash);
    encoder.write_u64_le(stake_modifier);
    let digest = sha256d(&encoder.into_inner());
    u32::from_le_bytes([digest[28], digest[29], digest[30], digest[31]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use nucleod_consensus::params::{consensus_params, Network};

    fn summary(time: i64, seed: u8, generated: bool) -> BlockSummary {
        BlockSummary {
            hash: [seed; 32],
            proof_hash: [seed.wrapping_add(1); 32],
            time,
            entropy_bit: seed & 1 == 1,
            is_proof_of_stake: false,
            stake_modifier: 0x1111,
            generated_modifier: generated,
        }
    }

    #[test]
    fn genesis_gets_generated_zero_modifier() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(compute_next_stake_modifier(&[], &params), Ok((0, true)));
    }

    #[test]
    fn same_interval_inherits_previous_modifier() {
        let params = consensus_params(Network::Mainnet);
        let base = 1_000_000 * params.modifier_interval;
        // Generated at the start of the interval, parent inside the same one.
        let ancestors = vec![
            summary(base + 10, 2, false),
            summary(base + 5, 3, true),
            summary(base - 50, 4, true),
        ];
        let (modifier, generated) =
            compute_next_stake_modifier(&ancestors, &params).expect("modifier");
        assert_eq!(modifier, 0x1111);
        assert!(!generated);
    }

    // One-second-spaced history deep enough to cover the whole selection
    // window, with the last generated modifier several intervals back.
    fn dense_history(params: &ConsensusParams, flip: bool) -> Vec<BlockSummary> {
        let parent_time = 100_000 * params.modifier_interval;
        let depth = (selection_interval(params) + 4 * params.modifier_interval) as usize;
        let mut ancestors = Vec::with_capacity(depth);
        for offset in 0..depth {
            let seed = (offset % 251) as u8;
            let mut entry = summary(parent_time - offset as i64, seed, false);
            if flip {
                entry.entropy_bit = !entry.entropy_bit;
            }
            ancestors.push(entry);
        }
        let last = ancestors.len() - 1;
        ancestors[last].generated_modifier = true;
        ancestors
    }

    #[test]
    fn interval_rollover_generates() {
        let params = consensus_params(Network::Regtest);
        let ancestors = dense_history(&params, false);
        let (_, generated) = compute_next_stake_modifier(&ancestors, &params).expect("modifier");
        assert!(generated);
    }

    #[test]
    fn modifier_depends_on_entropy_bits() {
        let params = consensus_params(Network::Regtest);
        let (a, _) =
            compute_next_stake_modifier(&dense_history(&params, false), &params).expect("modifier");
        let (b, _) =
            compute_next_stake_modifier(&dense_history(&params, true), &params).expect("modifier");
        assert_ne!(a, b);
    }

    #[test]
    fn checksum_chains() {
        let a = stake_modifier_checksum(0, false, false, &[0u8; 32], 0);
        let b = stake_modifier_checksum(a, true, false, &[1u8; 32], 42);
        let b_again = stake_modifier_checksum(a, true, false, &[1u8; 32], 42);
        assert_eq!(b, b_again);
        assert_ne!(a, b);
    }
}
