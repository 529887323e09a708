//! Standard output-script templates and sigop accounting.

use crate::opcodes::{
    decode_script_num, MAX_PUBKEYS_PER_MULTISIG, OP_0, OP_1, OP_16, OP_1NEGATE, OP_CHECKMULTISIG,
    OP_CHECKMULTISIGVERIFY, OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_DUP, OP_EQUAL, OP_EQUALVERIFY,
    OP_HASH160, OP_PUSHDATA1, OP_PUSHDATA2, OP_PUSHDATA4, OP_RETURN,
};

/// Maximum scriptSig size considered standard.
pub const MAX_STANDARD_SCRIPT_SIG_SIZE: usize = 500;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    NonStandard,
    NullData,
    PubKey,
    PubKeyHash,
    ScriptHash,
    Multisig,
}

/// Classify an output script, returning the pushed operands the spender has
/// to satisfy (pubkeys, key hash, script hash, or multisig m/keys/n).
pub fn solve(script: &[u8]) -> Option<(ScriptType, Vec<Vec<u8>>)> {
    if script.first() == Some(&OP_RETURN) {
        // OP_RETURN followed only by pushes is a data carrier.
        if is_push_only(&script[1..]) {
            return Some((ScriptType::NullData, Vec::new()));
        }
        return None;
    }

    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
    {
        return Some((ScriptType::ScriptHash, vec![script[2..22].to_vec()]));
    }

    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        return Some((ScriptType::PubKeyHash, vec![script[3..23].to_vec()]));
    }

    if let Some(key_len @ (33 | 65)) = script.first().copied() {
        let expected = key_len as usize + 2;
        if script.len() == expected && script[expected - 1] == OP_CHECKSIG {
            return Some((ScriptType::PubKey, vec![script[1..expected - 1].to_vec()]));
        }
    }

    if let Some(solution) = solve_multisig(script) {
        return Some((ScriptType::Multisig, solution));
    }

    None
}

/// `m <key>.. n OP_CHECKMULTISIG`; solutions are `[m, keys.., n]` with the
/// counts as single script-number bytes, mirroring the classifier the
/// signing code feeds on.
fn solve_multisig(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    let last = *script.last()?;
    if last != OP_CHECKMULTISIG {
        return None;
    }
    let m = small_int(*script.first()?)?;
    let n = small_int(script[script.len() - 2])?;
    if m < 1 || n < 1 || m > n || n as usize > MAX_PUBKEYS_PER_MULTISIG {
        return None;
    }

    let mut solutions = vec![vec![m as u8]];
    let mut cursor = 1usize;
    for _ in 0..n {
        let len = *script.get(cursor)? as usize;
        if !(33..=65).contains(&len) {
            return None;
        }
        cursor += 1;
        let key = script.get(cursor..cursor + len)?;
        solutions.push(key.to_vec());
        cursor += len;
    }
    if cursor != script.len() - 2 {
        return None;
    }
    solutions.push(vec![n as u8]);
    Some(solutions)
}

fn small_int(opcode: u8) -> Option<i64> {
    if opcode == OP_0 {
        Some(0)
    } else if (OP_1..=OP_16).contains(&opcode) {
        Some((opcode - OP_1 + 1) as i64)
    } else {
        None
    }
}

/// Stack items a standard scriptSig must push for the given output type.
pub fn script_sig_args_expected(kind: ScriptType, solutions: &[Vec<u8>]) -> Option<usize> {
    match kind {
        ScriptType::NonStandard | ScriptType::NullData => None,
        ScriptType::PubKey => Some(1),
        ScriptType::PubKeyHash => Some(2),
        ScriptType::ScriptHash => Some(1),
        ScriptType::Multisig => {
            let m = *solutions.first()?.first()? as usize;
            // Signatures plus the CHECKMULTISIG dummy element.
            Some(m + 1)
        }
    }
}

pub fn is_push_only(script: &[u8]) -> bool {
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => match script.get(cursor) {
                Some(len) => {
                    cursor += 1;
                    *len as usize
                }
                None => return false,
            },
            OP_PUSHDATA2 => match script.get(cursor..cursor + 2) {
                Some(bytes) => {
                    cursor += 2;
                    u16::from_le_bytes([bytes[0], bytes[1]]) as usize
                }
                None => return false,
            },
            OP_PUSHDATA4 => match script.get(cursor..cursor + 4) {
                Some(bytes) => {
                    cursor += 4;
                    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                None => return false,
            },
            OP_0 | OP_1NEGATE | OP_1..=OP_16 => 0,
            _ => return false,
        };
        if cursor + len > script.len() {
            return false;
        }
        cursor += len;
    }
    true
}

/// Every push uses the shortest encoding for its payload.
pub fn has_canonical_pushes(script: &[u8]) -> bool {
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let Some(len) = script.get(cursor).copied() else {
                    return false;
                };
                cursor += 1;
                if len < 0x4c {
                    return false;
                }
                len as usize
            }
            OP_PUSHDATA2 => {
                let Some(bytes) = script.get(cursor..cursor + 2) else {
                    return false;
                };
                cursor += 2;
                let len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
                if len <= 0xff {
                    return false;
                }
                len
            }
            OP_PUSHDATA4 => {
                let Some(bytes) = script.get(cursor..cursor + 4) else {
                    return false;
                };
                cursor += 4;
                let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                if len <= 0xffff {
                    return false;
                }
                len
            }
            _ => continue,
        };
        if cursor + len > script.len() {
            return false;
        }
        cursor += len;
    }
    true
}

/// Count signature operations. `accurate` decodes the key count operand of a
/// multisig; the legacy mode charges the maximum.
pub fn sigop_count(script: &[u8], accurate: bool) -> usize {
    let mut count = 0usize;
    let mut cursor = 0usize;
    let mut last_opcode: Option<u8> = None;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        match opcode {
            0x01..=0x4b => cursor += opcode as usize,
            OP_PUSHDATA1 => {
                let len = script.get(cursor).copied().unwrap_or(0) as usize;
                cursor += 1 + len;
            }
            OP_PUSHDATA2 => {
                let len = script
                    .get(cursor..cursor + 2)
                    .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
                    .unwrap_or(0);
                cursor += 2 + len;
            }
            OP_PUSHDATA4 => {
                let len = script
                    .get(cursor..cursor + 4)
                    .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
                    .unwrap_or(0);
                cursor += 4 + len;
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_opcode {
                    Some(op) if accurate && (OP_1..=OP_16).contains(&op) => {
                        (op - OP_1 + 1) as usize
                    }
                    _ => MAX_PUBKEYS_PER_MULTISIG,
                };
            }
            _ => {}
        }
        last_opcode = Some(opcode);
    }
    count
}

/// Sigops contributed by a P2SH input: the redeem script is the last item
/// the scriptSig pushes.
pub fn p2sh_sigop_count(script_pubkey: &[u8], script_sig: &[u8]) -> usize {
    let is_p2sh = script_pubkey.len() == 23
        && script_pubkey[0] == OP_HASH160
        && script_pubkey[1] == 0x14
        && script_pubkey[22] == OP_EQUAL;
    if !is_p2sh || !is_push_only(script_sig) {
        return 0;
    }
    match last_push(script_sig) {
        Some(redeem) => sigop_count(redeem, true),
        None => 0,
    }
}

pub fn last_push(script: &[u8]) -> Option<&[u8]> {
    let mut cursor = 0usize;
    let mut last: Option<&[u8]> = None;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let len = *script.get(cursor)? as usize;
                cursor += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(cursor..cursor + 2)?;
                cursor += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(cursor..cursor + 4)?;
                cursor += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            OP_0 | OP_1NEGATE | OP_1..=OP_16 => {
                last = Some(&[]);
                continue;
            }
            _ => return None,
        };
        let data = script.get(cursor..cursor + len)?;
        cursor += len;
        last = Some(data);
    }
    last
}

/// Checks used by mempool standardness: every pushed operand decodes via
/// `decode_script_num` small-int rules where a count is expected.
pub fn multisig_counts(solutions: &[Vec<u8>]) -> Option<(usize, usize)> {
    let m = decode_script_num(solutions.first()?)? as usize;
    let n = decode_script_num(solutions.last()?)? as usize;
    Some((m, n))
}
