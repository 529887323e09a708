//! Consensus core: validation pipeline, block index, and reorganization.

pub mod blockfiles;
pub mod blockindex;
pub mod checkpoints;
pub mod error;
pub mod manager;
pub mod mempool;
pub mod orphans;
pub mod ratelimit;
pub mod state;
pub mod subscribers;
pub mod txindex;
pub mod validation;

pub use blockfiles::{BlockFileStore, BlockPos};
pub use blockindex::{BlockId, BlockIndex, BlockIndexNode};
pub use checkpoints::{CheckpointMode, SyncCheckpointMessage};
pub use error::{ChainError, TransientKind};
pub use manager::{ChainManager, TipInfo};
pub use mempool::Mempool;
pub use state::{genesis_block, ChainState, Clock};
pub use subscribers::{MasternodeLedger, NetworkHooks, PeerOps, WalletNotify};
pub use validation::ValidationFlags;
