//! Consensus constants, chain parameters, and the reward schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;
pub mod sporks;

/// Little-endian 32-byte hash, as serialized on the wire.
pub type Hash256 = [u8; 32];

pub use params::{chain_params, ChainParams, Checkpoint, ConsensusParams, Network};
pub use rewards::{
    developer_payment, masternode_payment, proof_of_stake_reward, proof_of_work_reward,
};
