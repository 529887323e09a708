//! Dispatch of inbound commands into the consensus core.

use std::sync::Arc;

use nucleod_chain::error::{ChainError, TransientKind};
use nucleod_chain::{ChainManager, PeerOps, SyncCheckpointMessage};
use nucleod_consensus::Hash256;
use nucleod_primitives::block::Block;
use nucleod_primitives::encoding::{decode_exact, Encodable, Encoder};
use nucleod_primitives::hash::hash256_short;
use nucleod_primitives::transaction::Transaction;

use crate::messages::{
    commands, decode_inv_list, encode_inv_list, BlockLocator, GetBlocksMessage, Inv, InvKind,
    RejectMessage, VersionMessage,
};

const GETBLOCKS_LIMIT: usize = 500;
const GETHEADERS_LIMIT: usize = 2_000;

/// What the dispatcher may do with the peer a message came from. The peer
/// layer owns sockets, send buffers, and the misbehavior ledger.
pub trait Peer {
    fn id(&self) -> u64;
    fn starting_height(&self) -> i32;
    fn record_starting_height(&self, height: i32);
    fn misbehaving(&self, score: u32, reason: &str);
    /// Queue an outbound message.
    fn send(&self, command: &str, payload: Vec<u8>);
    /// Inventory this peer is known to have; suppresses echo relay.
    fn add_inventory_known(&self, inv: &Inv);
    /// Batched inventory announcement (trickled by the peer layer).
    fn push_inventory(&self, inv: Inv);
    /// Continuation mark for paged getblocks responses.
    fn set_continuation(&self, hash: Option<Hash256>);
    fn continuation(&self) -> Option<Hash256>;
}

/// Adapter giving the core its narrow view of a peer.
struct CorePeer<'a> {
    peer: &'a dyn Peer,
}

impl<'a> PeerOps for CorePeer<'a> {
    fn misbehaving(&self, score: u32, reason: &str) {
        self.peer.misbehaving(score, reason);
    }

    fn push_getblocks(&self, locator: Vec<Hash256>, stop: Hash256) {
        let message = GetBlocksMessage {
            locator: BlockLocator::new(locator),
            stop,
        };
        self.peer
            .send(commands::GETBLOCKS, message.encode_to_vec());
    }

    fn ask_for_block(&self, hash: Hash256) {
        self.peer
            .send(commands::GETDATA, encode_inv_list(&[Inv::block(hash)]));
    }
}

#[derive(Debug)]
pub enum ProcessError {
    Malformed(&'static str),
    Chain(ChainError),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Malformed(what) => write!(f, "malformed {what} payload"),
            ProcessError::Chain(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ProcessError {}

pub struct MessageProcessor {
    chain: Arc<ChainManager>,
}

impl MessageProcessor {
    pub fn new(chain: Arc<ChainManager>) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &ChainManager {
        &self.chain
    }

    /// React to one decoded command. Unknown commands are ignored; the
    /// peer layer handles everything not consensus-relevant.
    pub fn handle_message(
        &self,
        peer: &dyn Peer,
        command: &str,
        payload: &[u8],
    ) -> Result<(), ProcessError> {
        if self.chain.shutdown_requested() {
            return Ok(());
        }
        match command {
            commands::VERSION => self.handle_version(peer, payload),
            commands::INV => self.handle_inv(peer, payload),
            commands::GETDATA => self.handle_getdata(peer, payload),
            commands::GETBLOCKS => self.handle_getblocks(peer, payload),
            commands::GETHEADERS => self.handle_getheaders(peer, payload),
            commands::BLOCK => self.handle_block(peer, payload),
            commands::TX => self.handle_tx(peer, payload),
            commands::MEMPOOL => self.handle_mempool(peer),
            commands::CHECKPOINT => self.handle_checkpoint(payload),
            commands::REJECT => self.handle_reject(payload),
            _ => Ok(()),
        }
    }

    fn handle_version(&self, peer: &dyn Peer, payload: &[u8]) -> Result<(), ProcessError> {
        let version: VersionMessage =
            decode_exact(payload).map_err(|_| ProcessError::Malformed("version"))?;
        peer.record_starting_height(version.starting_height);
        peer.send(commands::VERACK, Vec::new());
        // Kick off chain download from what we already have.
        let message = GetBlocksMessage {
            locator: BlockLocator::new(self.chain.block_locator()),
            stop: [0u8; 32],
        };
        peer.send(commands::GETBLOCKS, message.encode_to_vec());
        Ok(())
    }

    fn handle_inv(&self, peer: &dyn Peer, payload: &[u8]) -> Result<(), ProcessError> {
        let invs = match decode_inv_list(payload) {
            Ok(invs) => invs,
            Err(_) => {
                peer.misbehaving(20, "oversized or malformed inv");
                return Err(ProcessError::Malformed("inv"));
            }
        };

        let last_block_index = invs
            .iter()
            .rposition(|inv| inv.kind == InvKind::Block);

        let mut unknown = Vec::new();
        for (position, inv) in invs.iter().enumerate() {
            peer.add_inventory_known(inv);
            self.chain.notify_inventory(&inv.hash);
            let already_have = match inv.kind {
                InvKind::Tx => self.chain.already_have_tx(&inv.hash),
                InvKind::Block => {
                    self.chain.contains_block(&inv.hash) || self.chain.has_orphan_block(&inv.hash)
                }
                InvKind::SyncCheckpoint => self.chain.sync_checkpoint() == Some(inv.hash),
            };

            if !already_have {
                unknown.push(*inv);
            } else if inv.kind == InvKind::Block {
                if let Some(root) = self.chain.orphan_block_root(&inv.hash) {
                    // We hold descendants; chase the missing ancestry.
                    let message = GetBlocksMessage {
                        locator: BlockLocator::new(self.chain.block_locator()),
                        stop: root,
                    };
                    peer.send(commands::GETBLOCKS, message.encode_to_vec());
                } else if Some(position) == last_block_index {
                    // Already-known last entry of a getblocks batch: ask for
                    // the continuation so a long sidechain keeps streaming.
                    let message = GetBlocksMessage {
                        locator: BlockLocator::new(self.chain.block_locator()),
                        stop: [0u8; 32],
                    };
                    peer.send(commands::GETBLOCKS, message.encode_to_vec());
                }
            }
        }

        if !unknown.is_empty() {
            peer.send(commands::GETDATA, encode_inv_list(&unknown));
        }
        Ok(())
    }

    fn handle_getdata(&self, peer: &dyn Peer, payload: &[u8]) -> Result<(), ProcessError> {
        let invs = match decode_inv_list(payload) {
            Ok(invs) => invs,
            Err(_) => {
                peer.misbehaving(20, "oversized or malformed getdata");
                return Err(ProcessError::Malformed("getdata"));
            }
        };

        for inv in invs {
            match inv.kind {
                InvKind::Block => {
                    if let Ok(Some(block)) = self.chain.read_block(&inv.hash) {
                        peer.send(commands::BLOCK, block.encode_to_vec());
                    }
                    if peer.continuation() == Some(inv.hash) {
                        // Bypass the trickle: triggers the next getblocks.
                        if let Some(best) = self.chain.best_hash() {
                            peer.send(commands::INV, encode_inv_list(&[Inv::block(best)]));
                        }
                        peer.set_continuation(None);
                    }
                }
                InvKind::Tx => {
                    if let Ok(Some((tx, _))) = self.chain.read_transaction(&inv.hash) {
                        peer.send(commands::TX, tx.encode_to_vec());
                    }
                }
                InvKind::SyncCheckpoint => {
                    if let Some(message) = self.chain.sync_checkpoint_message() {
                        if message.checkpoint_hash == inv.hash {
                            peer.send(commands::CHECKPOINT, message.encode());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_getblocks(&self, peer: &dyn Peer, payload: &[u8]) -> Result<(), ProcessError> {
        let message: GetBlocksMessage =
            decode_exact(payload).map_err(|_| ProcessError::Malformed("getblocks"))?;
        let (hashes, continuation) =
            self.chain
                .blocks_from_locator(&message.locator.have, &message.stop, GETBLOCKS_LIMIT);
        nucleod_log::log_debug!(
            "getblocks peer={} served {} hashes",
            peer.id(),
            hashes.len()
        );
        for hash in hashes {
            peer.push_inventory(Inv::block(hash));
        }
        peer.set_continuation(continuation);
        Ok(())
    }

    fn handle_getheaders(&self, peer: &dyn Peer, payload: &[u8]) -> Result<(), ProcessError> {
        let message: GetBlocksMessage =
            decode_exact(payload).map_err(|_| ProcessError::Malformed("getheaders"))?;
        let headers = self.chain.headers_from_locator(
            &message.locator.have,
            &message.stop,
            GETHEADERS_LIMIT,
        );
        let mut encoder = Encoder::new();
        encoder.write_compact_size(headers.len() as u64);
        for header in &headers {
            header.consensus_encode(&mut encoder);
            // Headers carry an empty transaction count on the wire.
            encoder.write_compact_size(0);
        }
        peer.send(commands::HEADERS, encoder.into_inner());
        Ok(())
    }

    fn handle_block(&self, peer: &dyn Peer, payload: &[u8]) -> Result<(), ProcessError> {
        let block = Block::decode(payload).map_err(|_| ProcessError::Malformed("block"))?;
        let hash = block.hash();
        nucleod_log::log_debug!("received block {} peer={}", hash256_short(&hash), peer.id());
        peer.add_inventory_known(&Inv::block(hash));

        let core_peer = CorePeer { peer };
        match self.chain.process_new_block(block, Some(&core_peer)) {
            Ok(()) => Ok(()),
            Err(ChainError::Transient(_)) => Ok(()),
            Err(err) => Err(ProcessError::Chain(err)),
        }
    }

    fn handle_tx(&self, peer: &dyn Peer, payload: &[u8]) -> Result<(), ProcessError> {
        let tx: Transaction =
            decode_exact(payload).map_err(|_| ProcessError::Malformed("tx"))?;
        peer.add_inventory_known(&Inv::tx(tx.txid()));

        let core_peer = CorePeer { peer };
        match self.chain.process_transaction(tx, Some(&core_peer)) {
            Ok(()) => Ok(()),
            Err(ChainError::Transient(TransientKind::AlreadyInPool))
            | Err(ChainError::Transient(TransientKind::AlreadyHave)) => Ok(()),
            Err(err) => Err(ProcessError::Chain(err)),
        }
    }

    fn handle_mempool(&self, peer: &dyn Peer) -> Result<(), ProcessError> {
        let hashes = self.chain.mempool_hashes();
        let mut invs: Vec<Inv> = hashes.into_iter().map(Inv::tx).collect();
        invs.truncate(nucleod_consensus::constants::MAX_INV_SZ);
        if !invs.is_empty() {
            peer.send(commands::INV, encode_inv_list(&invs));
        }
        Ok(())
    }

    fn handle_checkpoint(&self, payload: &[u8]) -> Result<(), ProcessError> {
        let message = SyncCheckpointMessage::decode(payload)
            .map_err(|_| ProcessError::Malformed("checkpoint"))?;
        self.chain.process_sync_checkpoint(message);
        Ok(())
    }

    fn handle_reject(&self, payload: &[u8]) -> Result<(), ProcessError> {
        let message: RejectMessage =
            decode_exact(payload).map_err(|_| ProcessError::Malformed("reject"))?;
        match &message.hash {
            Some(hash) => nucleod_log::log_debug!(
                "peer rejected {} code 0x{:02x}: {} ({})",
                message.command,
                message.code,
                message.reason,
                hash256_short(hash)
            ),
            None => nucleod_log::log_debug!(
                "peer rejected {} code 0x{:02x}: {}",
                message.command,
                message.code,
                message.reason
            ),
        }
        Ok(())
    }
}
