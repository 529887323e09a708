//! Message payload types for the commands the core consumes.

use nucleod_consensus::constants::MAX_INV_SZ;
use nucleod_consensus::Hash256;
use nucleod_primitives::encoding::{
    Decodable, DecodeError, Decoder, Encodable, Encoder,
};

/// Command strings as they appear in the message envelope.
pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const INV: &str = "inv";
    pub const GETDATA: &str = "getdata";
    pub const GETBLOCKS: &str = "getblocks";
    pub const GETHEADERS: &str = "getheaders";
    pub const HEADERS: &str = "headers";
    pub const BLOCK: &str = "block";
    pub const TX: &str = "tx";
    pub const MEMPOOL: &str = "mempool";
    pub const CHECKPOINT: &str = "checkpoint";
    pub const REJECT: &str = "reject";
}

pub mod reject_codes {
    pub const MALFORMED: u8 = 0x01;
    pub const INVALID: u8 = 0x10;
    pub const OBSOLETE: u8 = 0x11;
    pub const DUPLICATE: u8 = 0x12;
    pub const NONSTANDARD: u8 = 0x40;
    pub const INSUFFICIENT_FEE: u8 = 0x42;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum InvKind {
    Tx,
    Block,
    SyncCheckpoint,
}

impl InvKind {
    pub fn wire_value(self) -> u32 {
        match self {
            InvKind::Tx => 1,
            InvKind::Block => 2,
            InvKind::SyncCheckpoint => 5,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(InvKind::Tx),
            2 => Some(InvKind::Block),
            5 => Some(InvKind::SyncCheckpoint),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inv {
    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Tx,
            hash,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvKind::Block,
            hash,
        }
    }
}

impl Encodable for Inv {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.kind.wire_value());
        encoder.write_hash(&self.hash);
    }
}

impl Decodable for Inv {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let kind = InvKind::from_wire(decoder.read_u32_le()?)
            .ok_or(DecodeError::InvalidData("unknown inventory type"))?;
        let hash = decoder.read_hash()?;
        Ok(Self { kind, hash })
    }
}

pub fn encode_inv_list(invs: &[Inv]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_compact_size(invs.len() as u64);
    for inv in invs {
        inv.consensus_encode(&mut encoder);
    }
    encoder.into_inner()
}

/// Decode an inv/getdata payload, refusing oversized lists.
pub fn decode_inv_list(bytes: &[u8]) -> Result<Vec<Inv>, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let count = decoder.read_compact_size()?;
    if count as usize > MAX_INV_SZ {
        return Err(DecodeError::SizeTooLarge);
    }
    let mut invs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        invs.push(Inv::consensus_decode(&mut decoder)?);
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(invs)
}

/// Exponentially sparse trail of known block hashes; the responder finds
/// the highest entry on its active chain and serves what follows.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockLocator {
    pub have: Vec<Hash256>,
}

impl BlockLocator {
    pub fn new(have: Vec<Hash256>) -> Self {
        Self { have }
    }

    pub fn is_null(&self) -> bool {
        self.have.is_empty()
    }
}

impl Encodable for BlockLocator {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        // Carries a version slot for wire parity with older peers.
        encoder.write_i32_le(0);
        encoder.write_compact_size(self.have.len() as u64);
        for hash in &self.have {
            encoder.write_hash(hash);
        }
    }
}

impl Decodable for BlockLocator {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let _version = decoder.read_i32_le()?;
        let count = decoder.read_compact_size()?;
        let mut have = Vec::with_capacity(count as usize);
        for _ in 0..count {
            have.push(decoder.read_hash()?);
        }
        Ok(Self { have })
    }
}

/// `getblocks`/`getheaders` payload: locator plus stop hash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetBlocksMessage {
    pub locator: BlockLocator,
    pub stop: Hash256,
}

impl Encodable for GetBlocksMessage {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.locator.consensus_encode(encoder);
        encoder.write_hash(&self.stop);
    }
}

impl Decodable for GetBlocksMessage {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let locator = BlockLocator::consensus_decode(decoder)?;
        let stop = decoder.read_hash()?;
        Ok(Self { locator, stop })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectMessage {
    pub command: String,
    pub code: u8,
    pub reason: String,
    pub hash: Option<Hash256>,
}

impl Encodable for RejectMessage {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_var_str(&self.command);
        encoder.write_u8(self.code);
        encoder.write_var_str(&self.reason);
        if let Some(hash) = &self.hash {
            encoder.write_hash(hash);
        }
    }
}

impl Decodable for RejectMessage {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let command = decoder.read_var_str()?;
        let code = decoder.read_u8()?;
        let reason = decoder.read_var_str()?;
        let hash = if decoder.remaining() >= 32 {
            Some(decoder.read_hash()?)
        } else {
            None
        };
        Ok(Self {
            command,
            code,
            reason,
            hash,
        })
    }
}

/// Subset of the version handshake the core reads.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionMessage {
    pub protocol_version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub starting_height: i32,
}

impl Encodable for VersionMessage {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.protocol_version);
        encoder.write_u64_le(self.services);
        encoder.write_i64_le(self.timestamp);
        encoder.write_i32_le(self.starting_height);
    }
}

impl Decodable for VersionMessage {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            protocol_version: decoder.read_i32_le()?,
            services: decoder.read_u64_le()?,
            timestamp: decoder.read_i64_le()?,
            starting_height: decoder.read_i32_le()?,
        })
    }
}
