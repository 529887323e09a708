//! Proof-of-stake kernel: stake modifier derivation and kernel-hash checks.

pub mod kernel;
pub mod modifier;

pub use kernel::{
    check_coinstake_timestamp, check_stake_kernel_hash, coin_day_weight, KernelCheck, KernelError,
    StakeKernel,
};
pub use modifier::{compute_next_stake_modifier, stake_modifier_checksum, BlockSummary};
