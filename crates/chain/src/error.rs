//! Error taxonomy for every validator entry point.

use nucleod_primitives::encoding::DecodeError;
use nucleod_storage::StoreError;

use crate::blockfiles::BlockFileError;

/// Recoverable conditions the caller re-queues or ignores.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransientKind {
    /// Block parent not yet in the index; buffered as an orphan.
    MissingParent,
    /// Transaction inputs unknown; buffered as an orphan.
    MissingInputs,
    /// Already indexed or already buffered.
    AlreadyHave,
    /// Already sitting in the mempool.
    AlreadyInPool,
    /// Stake kernel already seen for another block.
    DuplicateStake,
}

impl TransientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransientKind::MissingParent => "missing parent",
            TransientKind::MissingInputs => "missing inputs",
            TransientKind::AlreadyHave => "already have",
            TransientKind::AlreadyInPool => "already in mempool",
            TransientKind::DuplicateStake => "duplicate stake",
        }
    }
}

/// Outcome of validating a transaction or block.
///
/// `Rejected` carries the misbehavior weight the peer layer applies to the
/// originating peer; a weight of 100 is an immediate ban.
#[derive(Debug)]
pub enum ChainError {
    Rejected { weight: u32, reason: &'static str },
    Transient(TransientKind),
    /// Structurally malformed serialized data.
    Invalid(&'static str),
    /// Storage or invariant failure; the node must shut down.
    Fatal(String),
}

impl ChainError {
    pub fn reject(weight: u32, reason: &'static str) -> Self {
        ChainError::Rejected { weight, reason }
    }

    pub fn dos_weight(&self) -> u32 {
        match self {
            ChainError::Rejected { weight, .. } => *weight,
            _ => 0,
        }
    }

    pub fn is_transient(&self, kind: TransientKind) -> bool {
        matches!(self, ChainError::Transient(have) if *have == kind)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Fatal(_))
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Rejected { weight, reason } => {
                write!(f, "rejected (DoS {weight}): {reason}")
            }
            ChainError::Transient(kind) => write!(f, "{}", kind.as_str()),
            ChainError::Invalid(reason) => write!(f, "invalid: {reason}"),
            ChainError::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Fatal(format!("storage: {err}"))
    }
}

impl From<BlockFileError> for ChainError {
    fn from(err: BlockFileError) -> Self {
        ChainError::Fatal(format!("block files: {err}"))
    }
}

impl From<DecodeError> for ChainError {
    fn from(_: DecodeError) -> Self {
        ChainError::Invalid("malformed serialized data")
    }
}
