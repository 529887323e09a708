//! Proof targets, chain trust, and difficulty retargeting.

pub mod difficulty;

pub use difficulty::{
    block_trust, check_proof_of_work, compact_to_target, compact_to_u256, compute_max_bits,
    hash_meets_target, next_target_required, target_to_compact, u256_to_compact, CompactError,
    ProofHeader,
};
