//! Transaction index records.
//!
//! Each indexed transaction stores where it lives on disk and, per output, a
//! pointer to the transaction that spent it. The spent vector is the
//! double-spend oracle for both mempool admission and block connect.

use nucleod_primitives::encoding::{DecodeError, Decoder, Encoder};

const SPENT_SLOT_NULL: u8 = 0;
const SPENT_SLOT_SET: u8 = 1;

/// Location of a serialized transaction: block file, offset of the block
/// payload, and absolute offset of the transaction itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskTxPos {
    pub file: u32,
    pub block_offset: u64,
    pub tx_offset: u64,
}

impl DiskTxPos {
    /// Sentinel for transactions living only in the mempool.
    pub fn memory() -> Self {
        Self {
            file: 1,
            block_offset: 1,
            tx_offset: 1,
        }
    }

    pub fn is_memory(&self) -> bool {
        *self == Self::memory()
    }

    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.file);
        encoder.write_u64_le(self.block_offset);
        encoder.write_u64_le(self.tx_offset);
    }

    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            file: decoder.read_u32_le()?,
            block_offset: decoder.read_u64_le()?,
            tx_offset: decoder.read_u64_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIndexEntry {
    pub pos: DiskTxPos,
    /// Per-output spend pointer; `None` while unspent.
    pub spent: Vec<Option<DiskTxPos>>,
}

impl TxIndexEntry {
    pub fn new(pos: DiskTxPos, outputs: usize) -> Self {
        Self {
            pos,
            spent: vec![None; outputs],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.pos.encode_into(&mut encoder);
        encoder.write_compact_size(self.spent.len() as u64);
        for slot in &self.spent {
            match slot {
                Some(pos) => {
                    encoder.write_u8(SPENT_SLOT_SET);
                    pos.encode_into(&mut encoder);
                }
                None => encoder.write_u8(SPENT_SLOT_NULL),
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let pos = DiskTxPos::decode_from(&mut decoder)?;
        let count = decoder.read_compact_size()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::SizeTooLarge)?;
        let mut spent = Vec::with_capacity(count);
        for _ in 0..count {
            match decoder.read_u8()? {
                SPENT_SLOT_NULL => spent.push(None),
                SPENT_SLOT_SET => spent.push(Some(DiskTxPos::decode_from(&mut decoder)?)),
                _ => return Err(DecodeError::InvalidData("bad spent slot tag")),
            }
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { pos, spent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips() {
        let mut entry = TxIndexEntry::new(
            DiskTxPos {
                file: 2,
                block_offset: 1_024,
                tx_offset: 1_105,
            },
            3,
        );
        entry.spent[1] = Some(DiskTxPos {
            file: 3,
            block_offset: 8,
            tx_offset: 90,
        });

        let decoded = TxIndexEntry::decode(&entry.encode()).expect("decode");
        assert_eq!(decoded, entry);
        assert!(decoded.spent[0].is_none());
        assert!(decoded.spent[1].is_some());
    }

    #[test]
    fn memory_sentinel() {
        assert!(DiskTxPos::memory().is_memory());
        assert!(!DiskTxPos {
            file: 0,
            block_offset: 8,
            tx_offset: 89
        }
        .is_memory());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(TxIndexEntry::decode(&[1, 2, 3]).is_err());
        let entry = TxIndexEntry::new(DiskTxPos::memory(), 1);
        let mut bytes = entry.encode();
        bytes.push(0);
        assert!(TxIndexEntry::decode(&bytes).is_err());
    }
}
