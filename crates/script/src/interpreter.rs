//! Script interpreter and input signature verification.

use nucleod_primitives::hash::{hash160, sha256, sha256d};
use nucleod_primitives::transaction::Transaction;
use ripemd::{Digest as RipemdDigest, Ripemd160};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey};
use sha1::Sha1;

use crate::opcodes::*;
use crate::secp::secp256k1_verify;
use crate::sighash::{signature_hash, SIGHASH_ALL, SIGHASH_NONE, SIGHASH_SINGLE};
use crate::standard::is_push_only;

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 8;

/// Rules every block must satisfy.
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;
/// Rules applied to loose transactions before relay.
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_SIGPUSHONLY
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;

#[derive(Debug)]
pub enum ScriptError {
    StackUnderflow,
    EvalFalse,
    InvalidOpcode,
    SigEncoding,
    PubkeyEncoding,
    SigHashType,
    SigCheck,
    SigPushOnly,
    NullDummy,
    LockTime,
    MinimalData,
    UnbalancedConditional,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::StackUnderflow => write!(f, "script stack underflow"),
            ScriptError::EvalFalse => write!(f, "script evaluated to false"),
            ScriptError::InvalidOpcode => write!(f, "invalid opcode"),
            ScriptError::SigEncoding => write!(f, "invalid signature encoding"),
            ScriptError::PubkeyEncoding => write!(f, "invalid public key encoding"),
            ScriptError::SigHashType => write!(f, "invalid sighash type"),
            ScriptError::SigCheck => write!(f, "signature check failed"),
            ScriptError::SigPushOnly => write!(f, "scriptSig is not push-only"),
            ScriptError::NullDummy => write!(f, "null dummy element required"),
            ScriptError::LockTime => write!(f, "locktime check failed"),
            ScriptError::MinimalData => write!(f, "non-minimal push"),
            ScriptError::UnbalancedConditional => write!(f, "unbalanced conditional"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Verify that `tx` input `input_index` satisfies the previous output's
/// script, including the nested redeem evaluation for P2SH.
pub fn verify_signature(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let checker = SignatureChecker {
        tx,
        input_index,
        flags,
    };

    let mut stack = Vec::new();
    eval_script(script_sig, &mut stack, &checker)?;

    let stack_copy = stack.clone();
    eval_script(script_pubkey, &mut stack, &checker)?;

    if stack.last().map(|top| cast_to_bool(top)) != Some(true) {
        return Err(ScriptError::EvalFalse);
    }

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        let mut redeem_stack = stack_copy;
        let redeem_script = redeem_stack.pop().ok_or(ScriptError::StackUnderflow)?;
        stack = redeem_stack;
        eval_script(&redeem_script, &mut stack, &checker)?;
        if stack.last().map(|top| cast_to_bool(top)) != Some(true) {
            return Err(ScriptError::EvalFalse);
        }
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && (stack.len() != 1 || !cast_to_bool(&stack[0])) {
        return Err(ScriptError::EvalFalse);
    }

    Ok(())
}

struct SignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    flags: ScriptFlags,
}

impl<'a> SignatureChecker<'a> {
    fn check_sig(
        &self,
        sig_bytes: &[u8],
        pubkey_bytes: &[u8],
        script_code: &[u8],
    ) -> Result<bool, ScriptError> {
        if sig_bytes.is_empty() {
            return Ok(false);
        }
        let hash_type = *sig_bytes.last().ok_or(ScriptError::SigEncoding)? as u32;
        if (self.flags & SCRIPT_VERIFY_STRICTENC) != 0 {
            let base_type = hash_type & 0x1f;
            if base_type != SIGHASH_ALL && base_type != SIGHASH_NONE && base_type != SIGHASH_SINGLE
            {
                return Err(ScriptError::SigHashType);
            }
            if !is_compressed_or_uncompressed_pubkey(pubkey_bytes) {
                return Err(ScriptError::PubkeyEncoding);
            }
        }

        let der = &sig_bytes[..sig_bytes.len() - 1];
        let sig = Signature::from_der(der).map_err(|_| ScriptError::SigEncoding)?;
        let mut normalized = sig;
        normalized.normalize_s();
        if (self.flags & SCRIPT_VERIFY_LOW_S) != 0 && normalized != sig {
            return Err(ScriptError::SigEncoding);
        }

        let pubkey =
            PublicKey::from_slice(pubkey_bytes).map_err(|_| ScriptError::PubkeyEncoding)?;
        let digest = match signature_hash(self.tx, self.input_index, script_code, hash_type) {
            Ok(digest) => digest,
            Err(_) => return Ok(false),
        };
        let msg = Message::from_digest_slice(&digest).map_err(|_| ScriptError::SigCheck)?;
        Ok(secp256k1_verify()
            .verify_ecdsa(&msg, &normalized, &pubkey)
            .is_ok())
    }

    fn check_lock_time(&self, lock_time: i64) -> Result<(), ScriptError> {
        const LOCKTIME_THRESHOLD: i64 = 500_000_000;
        let tx_lock_time = self.tx.lock_time as i64;
        let same_kind = (tx_lock_time < LOCKTIME_THRESHOLD) == (lock_time < LOCKTIME_THRESHOLD);
        if !same_kind || lock_time > tx_lock_time {
            return Err(ScriptError::LockTime);
        }
        if self.tx.vin[self.input_index].sequence == u32::MAX {
            return Err(ScriptError::LockTime);
        }
        Ok(())
    }
}

fn eval_script(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    checker: &SignatureChecker<'_>,
) -> Result<(), ScriptError> {
    let mut cursor = 0usize;
    let mut script_code_start = 0usize;
    let mut exec_stack: Vec<bool> = Vec::new();

    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let exec = exec_stack.iter().all(|branch| *branch);

        // Push opcodes always parse their payload, executed or not.
        if opcode <= OP_PUSHDATA4 && opcode != OP_0 {
            let len = match opcode {
                0x01..=0x4b => opcode as usize,
                OP_PUSHDATA1 => read_u8(script, &mut cursor)? as usize,
                OP_PUSHDATA2 => read_u16(script, &mut cursor)? as usize,
                OP_PUSHDATA4 => read_u32(script, &mut cursor)? as usize,
                _ => unreachable!(),
            };
            let data = read_bytes(script, &mut cursor, len)?;
            if exec {
                if (checker.flags & SCRIPT_VERIFY_MINIMALDATA) != 0
                    && !is_minimal_push(&data, opcode)
                {
                    return Err(ScriptError::MinimalData);
                }
                stack.push(data);
            }
            continue;
        }

        match opcode {
            OP_0 => {
                if exec {
                    stack.push(Vec::new());
                }
            }
            OP_1NEGATE => {
                if exec {
                    stack.push(script_num_bytes(-1));
                }
            }
            OP_1..=OP_16 => {
                if exec {
                    stack.push(script_num_bytes((opcode - OP_1 + 1) as i64));
                }
            }
            OP_NOP => {}
            OP_IF | OP_NOTIF => {
                if exec {
                    let value = cast_to_bool(&pop(stack)?);
                    exec_stack.push(if opcode == OP_NOTIF { !value } else { value });
                } else {
                    exec_stack.push(false);
                }
            }
            OP_ELSE => {
                let current = exec_stack
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                exec_stack.push(!current);
            }
            OP_ENDIF => {
                if exec_stack.pop().is_none() {
                    return Err(ScriptError::UnbalancedConditional);
                }
            }
            OP_VERIFY => {
                if exec && !cast_to_bool(&pop(stack)?) {
                    return Err(ScriptError::EvalFalse);
                }
            }
            OP_RETURN => {
                if exec {
                    return Err(ScriptError::EvalFalse);
                }
            }
            OP_DUP => {
                if exec {
                    let top = stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                    stack.push(top);
                }
            }
            OP_DROP => {
                if exec {
                    pop(stack)?;
                }
            }
            OP_2DROP => {
                if exec {
                    pop(stack)?;
                    pop(stack)?;
                }
            }
            OP_SIZE => {
                if exec {
                    let len = stack.last().ok_or(ScriptError::StackUnderflow)?.len();
                    stack.push(script_num_bytes(len as i64));
                }
            }
            OP_EQUAL | OP_EQUALVERIFY => {
                if exec {
                    let a = pop(stack)?;
                    let b = pop(stack)?;
                    if opcode == OP_EQUALVERIFY {
                        if a != b {
                            return Err(ScriptError::EvalFalse);
                        }
                    } else {
                        stack.push(bool_item(a == b));
                    }
                }
            }
            OP_RIPEMD160 => {
                if exec {
                    let data = pop(stack)?;
                    let mut hasher = Ripemd160::new();
                    hasher.update(data);
                    stack.push(hasher.finalize().to_vec());
                }
            }
            OP_SHA1 => {
                if exec {
                    let data = pop(stack)?;
                    let mut hasher = Sha1::new();
                    hasher.update(data);
                    stack.push(hasher.finalize().to_vec());
                }
            }
            OP_SHA256 => {
                if exec {
                    let data = pop(stack)?;
                    stack.push(sha256(&data).to_vec());
                }
            }
            OP_HASH160 => {
                if exec {
                    let data = pop(stack)?;
                    stack.push(hash160(&data).to_vec());
                }
            }
            OP_HASH256 => {
                if exec {
                    let data = pop(stack)?;
                    stack.push(sha256d(&data).to_vec());
                }
            }
            OP_CODESEPARATOR => {
                if exec {
                    script_code_start = cursor;
                }
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                if exec {
                    let pubkey = pop(stack)?;
                    let sig = pop(stack)?;
                    let ok = checker.check_sig(&sig, &pubkey, &script[script_code_start..])?;
                    if opcode == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Err(ScriptError::SigCheck);
                        }
                    } else {
                        stack.push(bool_item(ok));
                    }
                }
            }
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if exec {
                    let n = decode_script_num(&pop(stack)?).ok_or(ScriptError::InvalidOpcode)?;
                    if !(0..=MAX_PUBKEYS_PER_MULTISIG as i64).contains(&n) {
                        return Err(ScriptError::InvalidOpcode);
                    }
                    let mut pubkeys = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        pubkeys.push(pop(stack)?);
                    }
                    pubkeys.reverse();
                    let m = decode_script_num(&pop(stack)?).ok_or(ScriptError::InvalidOpcode)?;
                    if m < 0 || m > n {
                        return Err(ScriptError::InvalidOpcode);
                    }
                    let mut sigs = Vec::with_capacity(m as usize);
                    for _ in 0..m {
                        sigs.push(pop(stack)?);
                    }
                    sigs.reverse();

                    // Off-by-one in the original protocol: an extra element
                    // is consumed before the signatures.
                    let dummy = pop(stack)?;
                    if (checker.flags & SCRIPT_VERIFY_NULLDUMMY) != 0 && !dummy.is_empty() {
                        return Err(ScriptError::NullDummy);
                    }

                    let script_code = &script[script_code_start..];
                    let mut sig_index = 0usize;
                    let mut key_index = 0usize;
                    while sig_index < sigs.len() && key_index < pubkeys.len() {
                        if checker.check_sig(&sigs[sig_index], &pubkeys[key_index], script_code)? {
                            sig_index += 1;
                        }
                        key_index += 1;
                        if pubkeys.len() - key_index < sigs.len() - sig_index {
                            break;
                        }
                    }

                    let success = sig_index == sigs.len();
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !success {
                            return Err(ScriptError::SigCheck);
                        }
                    } else {
                        stack.push(bool_item(success));
                    }
                }
            }
            OP_CHECKLOCKTIMEVERIFY => {
                if exec {
                    if (checker.flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY) != 0 {
                        let top = stack.last().ok_or(ScriptError::StackUnderflow)?;
                        let lock_time =
                            decode_script_num(top).ok_or(ScriptError::InvalidOpcode)?;
                        checker.check_lock_time(lock_time)?;
                    } else if (checker.flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                        return Err(ScriptError::InvalidOpcode);
                    }
                }
            }
            OP_NOP1 | OP_NOP3..=OP_NOP10 => {
                if exec && (checker.flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                    return Err(ScriptError::InvalidOpcode);
                }
            }
            _ => {
                if exec {
                    nucleod_log::log_debug!("rejecting script with opcode 0x{opcode:02x}");
                    return Err(ScriptError::InvalidOpcode);
                }
            }
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::StackUnderflow)
}

fn bool_item(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            // Negative zero counts as false.
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn is_p2sh(script_pubkey: &[u8]) -> bool {
    script_pubkey.len() == 23
        && script_pubkey[0] == OP_HASH160
        && script_pubkey[1] == 0x14
        && script_pubkey[22] == OP_EQUAL
}

fn is_compressed_or_uncompressed_pubkey(data: &[u8]) -> bool {
    match data.len() {
        33 => data[0] == 0x02 || data[0] == 0x03,
        65 => data[0] == 0x04,
        _ => false,
    }
}

fn is_minimal_push(data: &[u8], opcode: u8) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        return opcode == OP_1 + (data[0] - 1);
    }
    if data.len() == 1 && data[0] == 0x81 {
        return opcode == OP_1NEGATE;
    }
    if data.len() <= 75 {
        return opcode == data.len() as u8;
    }
    if data.len() <= 255 {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 65535 {
        return opcode == OP_PUSHDATA2;
    }
    true
}

fn read_bytes(script: &[u8], cursor: &mut usize, len: usize) -> Result<Vec<u8>, ScriptError> {
    if *cursor + len > script.len() {
        return Err(ScriptError::StackUnderflow);
    }
    let out = script[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(out)
}

fn read_u8(script: &[u8], cursor: &mut usize) -> Result<u8, ScriptError> {
    if *cursor >= script.len() {
        return Err(ScriptError::StackUnderflow);
    }
    let out = script[*cursor];
    *cursor += 1;
    Ok(out)
}

fn read_u16(script: &[u8], cursor: &mut usize) -> Result<u16, ScriptError> {
    let bytes = read_bytes(script, cursor, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(script: &[u8], cursor: &mut usize) -> Result<u32, ScriptError> {
    let bytes = read_bytes(script, cursor, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
