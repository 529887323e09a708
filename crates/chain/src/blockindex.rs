//! In-memory block index.
//!
//! Nodes live in an arena addressed by `BlockId`; `parent` links form the
//! full DAG and `next` links trace the active chain forward. Ids are stable
//! for the process lifetime, so transient vectors built during
//! reorganization hold ids, never aliased references.

use std::collections::HashMap;

use nucleod_consensus::money::Amount;
use nucleod_consensus::Hash256;
use nucleod_primitives::block::BlockHeader;
use nucleod_primitives::encoding::{DecodeError, Decoder, Encoder};
use nucleod_primitives::outpoint::OutPoint;
use primitive_types::U256;

use crate::blockfiles::BlockPos;

pub type BlockId = u32;

const MEDIAN_TIME_SPAN: usize = 11;

const FLAG_PROOF_OF_STAKE: u8 = 1 << 0;
const FLAG_GENERATED_MODIFIER: u8 = 1 << 1;
const FLAG_ENTROPY_BIT: u8 = 1 << 2;

#[derive(Clone, Debug)]
pub struct BlockIndexNode {
    pub hash: Hash256,
    pub parent: Option<BlockId>,
    /// Forward link; `Some` only while this node sits on the active chain.
    pub next: Option<BlockId>,
    pub height: i32,
    pub pos: BlockPos,
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub chain_trust: U256,
    pub mint: Amount,
    pub money_supply: Amount,
    pub is_proof_of_stake: bool,
    pub generated_modifier: bool,
    pub entropy_bit: bool,
    pub stake_modifier: u64,
    pub modifier_checksum: u32,
    pub proof_hash: Hash256,
    pub stake_prevout: OutPoint,
    pub stake_time: u32,
}

impl BlockIndexNode {
    pub fn header(&self, prev_hash: Hash256) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    pub fn block_time(&self) -> i64 {
        self.time as i64
    }
}

/// On-disk form of a node. Chain trust is recomputed on load; the forward
/// hash is persisted so the active chain survives restarts.
pub struct DiskIndexNode {
    pub prev_hash: Hash256,
    pub next_hash: Hash256,
    pub node: BlockIndexNode,
}

pub fn encode_index_node(node: &BlockIndexNode, prev_hash: &Hash256, next_hash: &Hash256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_hash(prev_hash);
    encoder.write_hash(next_hash);
    encoder.write_i32_le(node.height);
    encoder.write_u32_le(node.pos.file);
    encoder.write_u64_le(node.pos.offset);
    encoder.write_i32_le(node.version);
    encoder.write_hash(&node.merkle_root);
    encoder.write_u32_le(node.time);
    encoder.write_u32_le(node.bits);
    encoder.write_u32_le(node.nonce);
    encoder.write_i64_le(node.mint);
    encoder.write_i64_le(node.money_supply);
    let mut flags = 0u8;
    if node.is_proof_of_stake {
        flags |= FLAG_PROOF_OF_STAKE;
    }
    if node.generated_modifier {
        flags |= FLAG_GENERATED_MODIFIER;
    }
    if node.entropy_bit {
        flags |= FLAG_ENTROPY_BIT;
    }
    encoder.write_u8(flags);
    encoder.write_u64_le(node.stake_modifier);
    encoder.write_u32_le(node.modifier_checksum);
    encoder.write_hash(&node.proof_hash);
    encoder.write_hash(&node.stake_prevout.hash);
    encoder.write_u32_le(node.stake_prevout.index);
    encoder.write_u32_le(node.stake_time);
    encoder.into_inner()
}

pub fn decode_index_node(hash: Hash256, bytes: &[u8]) -> Result<DiskIndexNode, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let prev_hash = decoder.read_hash()?;
    let next_hash = decoder.read_hash()?;
    let height = decoder.read_i32_le()?;
    let file = decoder.read_u32_le()?;
    let offset = decoder.read_u64_le()?;
    let version = decoder.read_i32_le()?;
    let merkle_root = decoder.read_hash()?;
    let time = decoder.read_u32_le()?;
    let bits = decoder.read_u32_le()?;
    let nonce = decoder.read_u32_le()?;
    let mint = decoder.read_i64_le()?;
    let money_supply = decoder.read_i64_le()?;
    let flags = decoder.read_u8()?;
    let stake_modifier = decoder.read_u64_le()?;
    let modifier_checksum = decoder.read_u32_le()?;
    let proof_hash = decoder.read_hash()?;
    let stake_hash = decoder.read_hash()?;
    let stake_index = decoder.read_u32_le()?;
    let stake_time = decoder.read_u32_le()?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(DiskIndexNode {
        prev_hash,
        next_hash,
        node: BlockIndexNode {
            hash,
            parent: None,
            next: None,
            height,
            pos: BlockPos { file, offset },
            version,
            merkle_root,
            time,
            bits,
            nonce,
            chain_trust: U256::zero(),
            mint,
            money_supply,
            is_proof_of_stake: (flags & FLAG_PROOF_OF_STAKE) != 0,
            generated_modifier: (flags & FLAG_GENERATED_MODIFIER) != 0,
            entropy_bit: (flags & FLAG_ENTROPY_BIT) != 0,
            stake_modifier,
            modifier_checksum,
            proof_hash,
            stake_prevout: OutPoint::new(stake_hash, stake_index),
            stake_time,
        },
    })
}

#[derive(Default)]
pub struct BlockIndex {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<Hash256, BlockId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, node: BlockIndexNode) -> BlockId {
        let id = self.nodes.len() as BlockId;
        self.by_hash.insert(node.hash, id);
        self.nodes.push(node);
        id
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn node(&self, id: BlockId) -> &BlockIndexNode {
        &self.nodes[id as usize]
    }

    pub fn node_mut(&mut self, id: BlockId) -> &mut BlockIndexNode {
        &mut self.nodes[id as usize]
    }

    pub fn parent(&self, id: BlockId) -> Option<BlockId> {
        self.node(id).parent
    }

    pub fn hash(&self, id: BlockId) -> Hash256 {
        self.node(id).hash
    }

    pub fn prev_hash(&self, id: BlockId) -> Hash256 {
        match self.node(id).parent {
            Some(parent) => self.hash(parent),
            None => [0u8; 32],
        }
    }

    pub fn header(&self, id: BlockId) -> BlockHeader {
        self.node(id).header(self.prev_hash(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> {
        0..self.nodes.len() as BlockId
    }

    /// Walk ancestors starting at `id` itself.
    pub fn ancestors(&self, id: BlockId) -> AncestorIter<'_> {
        AncestorIter {
            index: self,
            cursor: Some(id),
        }
    }

    pub fn ancestor_at_height(&self, id: BlockId, height: i32) -> Option<BlockId> {
        let mut cursor = id;
        loop {
            let node = self.node(cursor);
            if node.height == height {
                return Some(cursor);
            }
            if node.height < height {
                return None;
            }
            cursor = node.parent?;
        }
    }

    /// Median of the last eleven block timestamps ending at `id`.
    pub fn median_time_past(&self, id: BlockId) -> i64 {
        let mut times: Vec<i64> = self
            .ancestors(id)
            .take(MEDIAN_TIME_SPAN)
            .map(|ancestor| self.node(ancestor).block_time())
            .collect();
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Exponentially sparse hash trail back from `id`, ending at genesis.
    pub fn locator(&self, id: BlockId) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1i32;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            hashes.push(self.hash(current));
            if hashes.len() >= 10 {
                step *= 2;
            }
            let node = self.node(current);
            if node.height == 0 {
                break;
            }
            let target = (node.height - step).max(0);
            cursor = self.ancestor_at_height(current, target);
        }
        hashes
    }
}

pub struct AncestorIter<'a> {
    index: &'a BlockIndex,
    cursor: Option<BlockId>,
}

impl<'a> Iterator for AncestorIter<'a> {
    type Item = BlockId;

    fn next(&mut self) -> Option<BlockId> {
        let current = self.cursor?;
        self.cursor = self.index.parent(current);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(hash_tag: u8, parent: Option<BlockId>, height: i32, time: u32) -> BlockIndexNode {
        BlockIndexNode {
            hash: [hash_tag; 32],
            parent,
            next: None,
            height,
            pos: BlockPos::null(),
            version: 7,
            merkle_root: [0u8; 32],
            time,
            bits: 0x1e0f_ffff,
            nonce: 0,
            chain_trust: U256::from(height as u64),
            mint: 0,
            money_supply: 0,
            is_proof_of_stake: false,
            generated_modifier: false,
            entropy_bit: false,
            stake_modifier: 0,
            modifier_checksum: 0,
            proof_hash: [0u8; 32],
            stake_prevout: OutPoint::null(),
            stake_time: 0,
        }
    }

    fn linear_chain(len: u8) -> BlockIndex {
        let mut index = BlockIndex::new();
        let mut parent = None;
        for height in 0..len {
            let id = index.insert(test_node(height + 1, parent, height as i32, 1_000 + height as u32));
            parent = Some(id);
        }
        index
    }

    #[test]
    fn ancestors_walk_to_genesis() {
        let index = linear_chain(5);
        let tip = index.lookup(&[5u8; 32]).expect("tip");
        let heights: Vec<i32> = index
            .ancestors(tip)
            .map(|id| index.node(id).height)
            .collect();
        assert_eq!(heights, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn ancestor_at_height_finds_exact() {
        let index = linear_chain(8);
        let tip = index.lookup(&[8u8; 32]).expect("tip");
        let at_3 = index.ancestor_at_height(tip, 3).expect("node");
        assert_eq!(index.node(at_3).height, 3);
        assert!(index.ancestor_at_height(tip, 9).is_none());
    }

    #[test]
    fn median_time_past_is_median() {
        let index = linear_chain(5);
        let tip = index.lookup(&[5u8; 32]).expect("tip");
        // Times are 1000..=1004; median is 1002.
        assert_eq!(index.median_time_past(tip), 1_002);
    }

    #[test]
    fn locator_starts_at_tip_and_ends_at_genesis() {
        let index = linear_chain(40);
        let tip = index.lookup(&[40u8; 32]).expect("tip");
        let locator = index.locator(tip);
        assert_eq!(locator[0], [40u8; 32]);
        assert_eq!(*locator.last().expect("genesis"), [1u8; 32]);
        assert!(locator.len() < 40);
    }

    #[test]
    fn disk_round_trip() {
        let mut node = test_node(9, None, 42, 1_234);
        node.pos = BlockPos { file: 1, offset: 88 };
        node.mint = 1_000;
        node.money_supply = 5_000;
        node.is_proof_of_stake = true;
        node.entropy_bit = true;
        node.stake_modifier = 0xfeed;
        node.stake_prevout = OutPoint::new([7u8; 32], 2);
        node.stake_time = 777;

        let bytes = encode_index_node(&node, &[3u8; 32], &[4u8; 32]);
        let decoded = decode_index_node([9u8; 32], &bytes).expect("decode");
        assert_eq!(decoded.prev_hash, [3u8; 32]);
        assert_eq!(decoded.next_hash, [4u8; 32]);
        assert_eq!(decoded.node.height, 42);
        assert_eq!(decoded.node.pos, node.pos);
        assert!(decoded.node.is_proof_of_stake);
        assert!(decoded.node.entropy_bit);
        assert!(!decoded.node.generated_modifier);
        assert_eq!(decoded.node.stake_modifier, 0xfeed);
        assert_eq!(decoded.node.stake_prevout, node.stake_prevout);
    }
}
