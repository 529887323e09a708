//! Wire-message handling consumed by the consensus core.
//!
//! Envelope framing, connection management, and address gossip live in the
//! peer layer; this crate reacts to the decoded commands the core cares
//! about and drives `ChainManager`.

pub mod loader;
pub mod messages;
pub mod process;

pub use loader::{load_external_block_data, load_external_block_file};
pub use messages::{BlockLocator, Inv, InvKind, RejectMessage};
pub use process::{MessageProcessor, Peer};
