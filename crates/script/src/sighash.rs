//! Legacy transaction signature hash.

use nucleod_consensus::Hash256;
use nucleod_primitives::encoding::{Encodable, Encoder};
use nucleod_primitives::hash::sha256d;
use nucleod_primitives::transaction::Transaction;

use crate::opcodes::{OP_CODESEPARATOR, OP_PUSHDATA1, OP_PUSHDATA2, OP_PUSHDATA4};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SighashError {
    InputIndexOutOfRange,
    SingleWithoutMatchingOutput,
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
            SighashError::SingleWithoutMatchingOutput => {
                write!(f, "SIGHASH_SINGLE input has no matching output")
            }
        }
    }
}

impl std::error::Error for SighashError {}

/// Hash the transaction for signing input `input_index` against
/// `script_code`, applying the legacy SIGHASH modes.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Result<Hash256, SighashError> {
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }
    let base_type = hash_type & 0x1f;
    if base_type == SIGHASH_SINGLE && input_index >= tx.vout.len() {
        return Err(SighashError::SingleWithoutMatchingOutput);
    }

    let script_code = strip_code_separators(script_code);
    let anyone_can_pay = (hash_type & SIGHASH_ANYONECANPAY) != 0;

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);
    encoder.write_u32_le(tx.time);

    if anyone_can_pay {
        encoder.write_compact_size(1);
        encode_input(&mut encoder, tx, input_index, input_index, &script_code, base_type);
    } else {
        encoder.write_compact_size(tx.vin.len() as u64);
        for index in 0..tx.vin.len() {
            encode_input(&mut encoder, tx, index, input_index, &script_code, base_type);
        }
    }

    match base_type {
        SIGHASH_NONE => {
            encoder.write_compact_size(0);
        }
        SIGHASH_SINGLE => {
            encoder.write_compact_size(input_index as u64 + 1);
            for index in 0..=input_index {
                if index == input_index {
                    tx.vout[index].consensus_encode(&mut encoder);
                } else {
                    // Nulled output: value -1, empty script.
                    encoder.write_i64_le(-1);
                    encoder.write_compact_size(0);
                }
            }
        }
        _ => {
            encoder.write_compact_size(tx.vout.len() as u64);
            for output in &tx.vout {
                output.consensus_encode(&mut encoder);
            }
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(hash_type);
    Ok(sha256d(&encoder.into_inner()))
}

fn encode_input(
    encoder: &mut Encoder,
    tx: &Transaction,
    index: usize,
    signing_index: usize,
    script_code: &[u8],
    base_type: u32,
) {
    let input = &tx.vin[index];
    input.prevout.consensus_encode(encoder);
    if index == signing_index {
        encoder.write_var_bytes(script_code);
    } else {
        encoder.write_compact_size(0);
    }
    let sequence = if index != signing_index
        && (base_type == SIGHASH_NONE || base_type == SIGHASH_SINGLE)
    {
        0
    } else {
        input.sequence
    };
    encoder.write_u32_le(sequence);
}

/// Legacy FindAndDelete of OP_CODESEPARATOR, skipping push payloads.
fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        let start = cursor;
        cursor += 1;
        let data_len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let len = script.get(cursor).copied().unwrap_or(0) as usize;
                cursor += 1;
                len
            }
            OP_PUSHDATA2 => {
                let len = script
                    .get(cursor..cursor + 2)
                    .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
                    .unwrap_or(0);
                cursor += 2;
                len
            }
            OP_PUSHDATA4 => {
                let len = script
                    .get(cursor..cursor + 4)
                    .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
                    .unwrap_or(0);
                cursor += 4;
                len
            }
            _ => 0,
        };
        cursor = (cursor + data_len).min(script.len());
        if opcode != OP_CODESEPARATOR {
            out.extend_from_slice(&script[start..cursor]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nucleod_primitives::outpoint::OutPoint;
    use nucleod_primitives::transaction::{TxIn, TxOut};

    fn two_in_two_out() -> Transaction {
        Transaction {
            version: 1,
            time: 1_400_000_000,
            vin: vec![
                TxIn {
                    prevout: OutPoint::new([1u8; 32], 0),
                    script_sig: vec![0xde, 0xad],
                    sequence: u32::MAX,
                },
                TxIn {
                    prevout: OutPoint::new([2u8; 32], 1),
                    script_sig: Vec::new(),
                    sequence: 7,
                },
            ],
            vout: vec![
                TxOut {
                    value: 10,
                    script_pubkey: vec![0x51],
                },
                TxOut {
                    value: 20,
                    script_pubkey: vec![0x52],
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn hash_differs_per_input_and_type() {
        let tx = two_in_two_out();
        let code = vec![0x76, 0xa9];
        let h0 = signature_hash(&tx, 0, &code, SIGHASH_ALL).expect("hash");
        let h1 = signature_hash(&tx, 1, &code, SIGHASH_ALL).expect("hash");
        let h0_none = signature_hash(&tx, 0, &code, SIGHASH_NONE).expect("hash");
        assert_ne!(h0, h1);
        assert_ne!(h0, h0_none);
    }

    #[test]
    fn script_sig_content_does_not_matter() {
        let mut tx = two_in_two_out();
        let code = vec![0x76, 0xa9];
        let before = signature_hash(&tx, 0, &code, SIGHASH_ALL).expect("hash");
        tx.vin[0].script_sig = vec![0xff; 40];
        let after = signature_hash(&tx, 0, &code, SIGHASH_ALL).expect("hash");
        assert_eq!(before, after);
    }

    #[test]
    fn anyone_can_pay_ignores_other_inputs() {
        let mut tx = two_in_two_out();
        let code = vec![0x76];
        let flags = SIGHASH_ALL | SIGHASH_ANYONECANPAY;
        let before = signature_hash(&tx, 0, &code, flags).expect("hash");
        tx.vin[1].prevout = OutPoint::new([9u8; 32], 9);
        let after = signature_hash(&tx, 0, &code, flags).expect("hash");
        assert_eq!(before, after);
    }

    #[test]
    fn out_of_range_input_errors() {
        let tx = two_in_two_out();
        assert_eq!(
            signature_hash(&tx, 5, &[], SIGHASH_ALL),
            Err(SighashError::InputIndexOutOfRange)
        );
    }

    #[test]
    fn single_without_output_errors() {
        let mut tx = two_in_two_out();
        tx.vout.truncate(1);
        assert_eq!(
            signature_hash(&tx, 1, &[], SIGHASH_SINGLE),
            Err(SighashError::SingleWithoutMatchingOutput)
        );
    }

    #[test]
    fn code_separator_is_stripped() {
        let tx = two_in_two_out();
        let with_sep = vec![0x76, OP_CODESEPARATOR, 0xa9];
        let without = vec![0x76, 0xa9];
        let a = signature_hash(&tx, 0, &with_sep, SIGHASH_ALL).expect("hash");
        let b = signature_hash(&tx, 0, &without, SIGHASH_ALL).expect("hash");
        assert_eq!(a, b);
    }
}
