//! Transaction types and serialization.
//!
//! Transactions carry their own timestamp between the version and the input
//! list; proof-of-stake validation keys off it.

use nucleod_consensus::money::Amount;
use nucleod_consensus::Hash256;

use crate::encoding::{
    compact_size_len, read_vec, write_vec, Decodable, DecodeError, Decoder, Encodable, Encoder,
};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const TX_CURRENT_VERSION: i32 = 1;

/// Lock-time values below this are block heights, above are unix times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn is_final(&self) -> bool {
        self.sequence == u32::MAX
    }
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    /// Empty outputs mark coinbase placeholders and the coinstake slot.
    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_to_vec())
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// Coinstake: real first input, empty first output, and at least one
    /// further output carrying the staked value back out.
    pub fn is_coinstake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
    }

    pub fn value_out(&self) -> Amount {
        self.vout.iter().map(|output| output.value).sum()
    }

    pub fn serialized_size(&self) -> usize {
        let mut size = 4 + 4 + 4;
        size += compact_size_len(self.vin.len() as u64);
        for input in &self.vin {
            size += 36 + compact_size_len(input.script_sig.len() as u64) + input.script_sig.len() + 4;
        }
        size += compact_size_len(self.vout.len() as u64);
        for output in &self.vout {
            size += 8
                + compact_size_len(output.script_pubkey.len() as u64)
                + output.script_pubkey.len();
        }
        size
    }

    pub fn is_final(&self, height: i32, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let threshold = if self.lock_time < LOCKTIME_THRESHOLD {
            height as i64
        } else {
            block_time
        };
        if (self.lock_time as i64) < threshold {
            return true;
        }
        self.vin.iter().all(TxIn::is_final)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.time);
        write_vec(encoder, &self.vin);
        write_vec(encoder, &self.vout);
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let time = decoder.read_u32_le()?;
        let vin = read_vec(decoder)?;
        let vout = read_vec(decoder)?;
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            time,
            vin,
            vout,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::decode_exact;

    fn sample_tx() -> Transaction {
        Transaction {
            version: TX_CURRENT_VERSION,
            time: 1_400_000_000,
            vin: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 1),
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 50_000,
                script_pubkey: vec![0x76, 0xa9],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn serialized_size_matches_encoding() {
        let tx = sample_tx();
        assert_eq!(tx.serialized_size(), tx.encode_to_vec().len());
    }

    #[test]
    fn round_trip_preserves_txid() {
        let tx = sample_tx();
        let decoded: Transaction = decode_exact(&tx.encode_to_vec()).expect("decode");
        assert_eq!(decoded.txid(), tx.txid());
        assert_eq!(decoded, tx);
    }

    #[test]
    fn coinbase_and_coinstake_shapes() {
        let coinbase = Transaction {
            version: 1,
            time: 0,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x02],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut::empty()],
            lock_time: 0,
        };
        assert!(coinbase.is_coinbase());
        assert!(!coinbase.is_coinstake());

        let coinstake = Transaction {
            version: 1,
            time: 0,
            vin: vec![TxIn {
                prevout: OutPoint::new([1u8; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![
                TxOut::empty(),
                TxOut {
                    value: 100,
                    script_pubkey: vec![0x51],
                },
            ],
            lock_time: 0,
        };
        assert!(coinstake.is_coinstake());
        assert!(!coinstake.is_coinbase());
    }

    #[test]
    fn finality_rules() {
        let mut tx = sample_tx();
        assert!(tx.is_final(0, 0));

        tx.lock_time = 100;
        tx.vin[0].sequence = 0;
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));

        tx.vin[0].sequence = u32::MAX;
        assert!(tx.is_final(100, 0));

        tx.lock_time = LOCKTIME_THRESHOLD + 10;
        tx.vin[0].sequence = 0;
        assert!(!tx.is_final(0, LOCKTIME_THRESHOLD as i64 + 10));
        assert!(tx.is_final(0, LOCKTIME_THRESHOLD as i64 + 11));
    }
}
