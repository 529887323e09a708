//! Hardened and synchronized checkpoints.
//!
//! Hardened checkpoints are `(height, hash)` pairs baked into the chain
//! parameters. Synchronized checkpoints arrive as master-key-signed messages
//! designating a recent block as canonical; local policy decides whether a
//! violation is fatal, warned, or ignored.

use nucleod_consensus::Hash256;
use nucleod_primitives::encoding::{DecodeError, Decoder, Encoder};
use nucleod_primitives::hash::{hash256_short, sha256d};
use nucleod_script::secp::verify_hash_signature;

use crate::blockindex::{BlockId, BlockIndex};

const SYNC_CHECKPOINT_VERSION: i32 = 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointMode {
    Strict,
    Advisory,
    Permissive,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncCheckpointMessage {
    pub version: i32,
    pub checkpoint_hash: Hash256,
    pub signature: Vec<u8>,
}

impl SyncCheckpointMessage {
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.checkpoint_hash);
        encoder.into_inner()
    }

    pub fn verify(&self, master_pubkey: &[u8]) -> bool {
        if self.version != SYNC_CHECKPOINT_VERSION {
            return false;
        }
        let digest = sha256d(&self.signed_payload());
        verify_hash_signature(master_pubkey, &self.signature, &digest)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.checkpoint_hash);
        encoder.write_var_bytes(&self.signature);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_i32_le()?;
        let checkpoint_hash = decoder.read_hash()?;
        let signature = decoder.read_var_bytes()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            version,
            checkpoint_hash,
            signature,
        })
    }
}

pub struct SyncCheckpoints {
    mode: CheckpointMode,
    master_pubkey: Vec<u8>,
    current: Option<Hash256>,
    /// Last applied signed message, re-served to peers on request.
    current_message: Option<SyncCheckpointMessage>,
    pending: Option<SyncCheckpointMessage>,
}

impl SyncCheckpoints {
    pub fn new(mode: CheckpointMode, master_pubkey: Vec<u8>) -> Self {
        Self {
            mode,
            master_pubkey,
            current: None,
            current_message: None,
            pending: None,
        }
    }

    pub fn mode(&self) -> CheckpointMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: CheckpointMode) {
        self.mode = mode;
    }

    pub fn current(&self) -> Option<Hash256> {
        self.current
    }

    pub fn set_current(&mut self, hash: Hash256) {
        self.current = Some(hash);
    }

    pub fn pending_message(&self) -> Option<&SyncCheckpointMessage> {
        self.pending.as_ref()
    }

    pub fn current_message(&self) -> Option<&SyncCheckpointMessage> {
        self.current_message.as_ref()
    }

    pub fn wanted_by_pending(&self, hash: &Hash256) -> bool {
        self.pending
            .as_ref()
            .map(|message| message.checkpoint_hash == *hash)
            .unwrap_or(false)
    }

    /// Handle an incoming signed checkpoint. Returns true when the message
    /// is valid and either applied or parked pending its block.
    pub fn process_message(
        &mut self,
        message: SyncCheckpointMessage,
        index: &BlockIndex,
        best: Option<BlockId>,
    ) -> bool {
        if !message.verify(&self.master_pubkey) {
            nucleod_log::log_warn!(
                "sync checkpoint {} has a bad master signature",
                hash256_short(&message.checkpoint_hash)
            );
            return false;
        }
        if !index.contains(&message.checkpoint_hash) {
            nucleod_log::log_info!(
                "sync checkpoint {} pending, block not yet received",
                hash256_short(&message.checkpoint_hash)
            );
            self.pending = Some(message);
            return true;
        }
        let applied = self.apply(message.checkpoint_hash, index, best);
        if applied {
            self.current_message = Some(message);
        }
        applied
    }

    /// Promote the pending checkpoint if its block has since arrived.
    pub fn accept_pending(&mut self, index: &BlockIndex, best: Option<BlockId>) {
        let Some(message) = self.pending.clone() else {
            return;
        };
        if index.contains(&message.checkpoint_hash) {
            self.pending = None;
            if self.apply(message.checkpoint_hash, index, best) {
                self.current_message = Some(message);
            }
        }
    }

    fn apply(&mut self, hash: Hash256, index: &BlockIndex, best: Option<BlockId>) -> bool {
        // The checkpoint must sit on the active chain.
        let Some(id) = index.lookup(&hash) else {
            return false;
        };
        let on_main_chain = match best {
            Some(best_id) => index
                .ancestor_at_height(best_id, index.node(id).height)
                .map(|ancestor| ancestor == id)
                .unwrap_or(false),
            None => false,
        };
        if !on_main_chain {
            nucleod_log::log_warn!(
                "sync checkpoint {} is not on the active chain",
                hash256_short(&hash)
            );
            return false;
        }
        nucleod_log::log_info!("sync checkpoint set to {}", hash256_short(&hash));
        self.current = Some(hash);
        true
    }

    /// The ppcoin sync rule: a new block (or its ancestors at the
    /// checkpoint height) must descend from the current checkpoint.
    pub fn check_sync(&self, index: &BlockIndex, hash: &Hash256, prev: BlockId) -> bool {
        let Some(checkpoint_hash) = self.current else {
            return true;
        };
        let Some(checkpoint_id) = index.lookup(&checkpoint_hash) else {
            return true;
        };
        let checkpoint_height = index.node(checkpoint_id).height;
        let height = index.node(prev).height + 1;

        if height > checkpoint_height {
            // Trace the new chain back to the checkpoint height; only a
            // descendant passes.
            return index
                .ancestor_at_height(prev, checkpoint_height)
                .map(|ancestor| ancestor == checkpoint_id)
                .unwrap_or(false);
        }
        if height == checkpoint_height {
            return *hash == checkpoint_hash;
        }
        // Lower than the checkpoint: only re-delivery of indexed blocks.
        index.contains(hash)
    }

    /// Last checkpointed node, used by the anti-spam minimum-work gate.
    pub fn last_checkpoint_node(&self, index: &BlockIndex) -> Option<BlockId> {
        self.current.and_then(|hash| index.lookup(&hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

    fn signed_message(hash: Hash256, secret_bytes: [u8; 32]) -> (SyncCheckpointMessage, Vec<u8>) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&secret_bytes).expect("secret");
        let pubkey = PublicKey::from_secret_key(&secp, &secret);
        let mut message = SyncCheckpointMessage {
            version: SYNC_CHECKPOINT_VERSION,
            checkpoint_hash: hash,
            signature: Vec::new(),
        };
        let digest = sha256d(&message.signed_payload());
        let msg = Message::from_digest_slice(&digest).expect("msg");
        message.signature = secp.sign_ecdsa(&msg, &secret).serialize_der().to_vec();
        (message, pubkey.serialize().to_vec())
    }

    #[test]
    fn message_round_trip_and_signature() {
        let (message, pubkey) = signed_message([7u8; 32], [0x33; 32]);
        let decoded = SyncCheckpointMessage::decode(&message.encode()).expect("decode");
        assert_eq!(decoded, message);
        assert!(decoded.verify(&pubkey));

        let mut tampered = decoded;
        tampered.checkpoint_hash = [8u8; 32];
        assert!(!tampered.verify(&pubkey));
    }

    #[test]
    fn unknown_block_parks_pending() {
        let (message, pubkey) = signed_message([7u8; 32], [0x33; 32]);
        let mut checkpoints = SyncCheckpoints::new(CheckpointMode::Strict, pubkey);
        let index = BlockIndex::new();
        assert!(checkpoints.process_message(message, &index, None));
        assert!(checkpoints.wanted_by_pending(&[7u8; 32]));
        assert_eq!(checkpoints.current(), None);
    }

    #[test]
    fn bad_signature_refused() {
        let (message, _) = signed_message([7u8; 32], [0x33; 32]);
        let (_, other_key) = signed_message([7u8; 32], [0x44; 32]);
        let mut checkpoints = SyncCheckpoints::new(CheckpointMode::Strict, other_key);
        let index = BlockIndex::new();
        assert!(!checkpoints.process_message(message, &index, None));
        assert!(checkpoints.pending_message().is_none());
    }
}
