//! Shared secp256k1 context and raw-hash signature checks.

use std::sync::OnceLock;

use nucleod_consensus::Hash256;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

pub(crate) fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

/// Verify a DER signature over a precomputed digest. Block signatures and
/// synchronized-checkpoint messages sign the raw hash without a sighash byte.
pub fn verify_hash_signature(pubkey: &[u8], signature: &[u8], digest: &Hash256) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(mut sig) = Signature::from_der(signature) else {
        return false;
    };
    sig.normalize_s();
    let Ok(msg) = Message::from_digest_slice(digest) else {
        return false;
    };
    secp256k1_verify().verify_ecdsa(&msg, &sig, &pubkey).is_ok()
}

pub fn parse_pubkey_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for chunk in hex.as_bytes().chunks(2) {
        let pair = std::str::from_utf8(chunk).ok()?;
        out.push(u8::from_str_radix(pair, 16).ok()?);
    }
    match out.first() {
        Some(0x02 | 0x03) if out.len() == 33 => Some(out),
        Some(0x04) if out.len() == 65 => Some(out),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SecretKey;

    #[test]
    fn verify_hash_signature_accepts_valid() {
        let secp = Secp256k1::signing_only();
        let secret = SecretKey::from_slice(&[0x11u8; 32]).expect("secret");
        let pubkey = PublicKey::from_secret_key(&secp, &secret);

        let digest = [0x42u8; 32];
        let msg = Message::from_digest_slice(&digest).expect("msg");
        let sig = secp.sign_ecdsa(&msg, &secret).serialize_der();

        assert!(verify_hash_signature(&pubkey.serialize(), &sig, &digest));
        assert!(!verify_hash_signature(
            &pubkey.serialize(),
            &sig,
            &[0x43u8; 32]
        ));
        assert!(!verify_hash_signature(&[0u8; 33], &sig, &digest));
    }

    #[test]
    fn parse_pubkey_hex_validates_prefix_and_length() {
        let compressed = format!("02{}", "11".repeat(32));
        assert!(parse_pubkey_hex(&compressed).is_some());
        let uncompressed = format!("04{}", "11".repeat(64));
        assert!(parse_pubkey_hex(&uncompressed).is_some());
        assert!(parse_pubkey_hex("0411").is_none());
        assert!(parse_pubkey_hex("zz").is_none());
    }
}
