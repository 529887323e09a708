//! Per-network consensus parameter definitions.

use crate::constants::{
    COINBASE_MATURITY, COINBASE_MATURITY_TESTNET, ENFORCE_DEV_PAYMENT_HEIGHT,
    ENFORCE_MN_PAYMENT_HEIGHT, LAST_POW_BLOCK, MODIFIER_INTERVAL, MODIFIER_INTERVAL_TESTNET,
    REWARD_CHECK_START_HEIGHT, STAKE_MAX_AGE, STAKE_MIN_AGE, STAKE_MIN_AGE_TESTNET,
    TARGET_SPACING, TARGET_TIMESPAN,
};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    pub pow_limit: Hash256,
    pub pos_limit: Hash256,
    pub target_timespan: i64,
    pub target_spacing: i64,
    pub stake_min_age: i64,
    pub stake_max_age: i64,
    pub modifier_interval: i64,
    pub coinbase_maturity: i32,
    pub last_pow_block: i32,
    pub pos_protocol_v2_height: i32,
    pub reward_check_start_height: i32,
    pub enforce_mn_payment_height: i32,
    pub enforce_dev_payment_height: i32,
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    /// Height of the highest hardened checkpoint.
    pub fn total_blocks_estimate(&self) -> i32 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }

    pub fn hardened_checkpoint(&self, height: i32) -> Option<&Hash256> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
            .map(|checkpoint| &checkpoint.hash)
    }

    pub fn pos_protocol_version(&self, height: i32) -> u32 {
        if height >= self.pos_protocol_v2_height {
            2
        } else {
            1
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    /// Message-start magic; also frames records in block files.
    pub message_start: [u8; 4],
    pub default_port: u16,
    /// Master public key for synchronized checkpoint messages.
    pub checkpoint_pubkey: &'static str,
    /// scriptPubKey the developer payment must be made to.
    pub developer_script: Vec<u8>,
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parse a display-order (big-endian) hex hash into wire order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_chain_params(),
        Network::Testnet => testnet_chain_params(),
        Network::Regtest => regtest_chain_params(),
    }
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    chain_params(network).consensus
}

const CHECKPOINT_MASTER_PUBKEY: &str = "04cc53cdd3e788d3ea9ca63468b9f2bcc2838af920d8e72985739e8\
                                        ac4159d518d1a1597da13b1854d8331def51778aa6a01951cef7763\
                                        fa4300341f34431bad49";

const MAINNET_DEVELOPER_KEY_HASH: [u8; 20] = [
    0x3f, 0x0c, 0x5a, 0x89, 0x21, 0xb7, 0x14, 0xd4, 0xe2, 0x9a, 0x6c, 0x40, 0x91, 0x7d, 0x58,
    0x2a, 0xee, 0x03, 0xc1, 0x76,
];

const TESTNET_DEVELOPER_KEY_HASH: [u8; 20] = [
    0x8d, 0x27, 0x41, 0x0b, 0x56, 0xc9, 0xea, 0x33, 0x70, 0x1f, 0x82, 0x5e, 0x4d, 0xba, 0x96,
    0xe1, 0x0a, 0x45, 0x2f, 0xc8,
];

fn p2pkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(key_hash);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hash256_from_hex(
            "000001faef25dec4fbcf906e6242621df2c183bf232f263d0ba5b101911e4563",
        )
        .expect("mainnet genesis hash"),
        genesis_time: 1_393_221_600,
        genesis_bits: 0x1e0f_ffff,
        genesis_nonce: 164_482,
        pow_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pow limit"),
        pos_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pos limit"),
        target_timespan: TARGET_TIMESPAN,
        target_spacing: TARGET_SPACING,
        stake_min_age: STAKE_MIN_AGE,
        stake_max_age: STAKE_MAX_AGE,
        modifier_interval: MODIFIER_INTERVAL,
        coinbase_maturity: COINBASE_MATURITY,
        last_pow_block: LAST_POW_BLOCK,
        pos_protocol_v2_height: 500_000,
        reward_check_start_height: REWARD_CHECK_START_HEIGHT,
        enforce_mn_payment_height: ENFORCE_MN_PAYMENT_HEIGHT,
        enforce_dev_payment_height: ENFORCE_DEV_PAYMENT_HEIGHT,
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: hash256_from_hex(
                "000001faef25dec4fbcf906e6242621df2c183bf232f263d0ba5b101911e4563",
            )
            .expect("mainnet genesis checkpoint"),
        }],
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: hash256_from_hex(
            "0000724595fb3b9609d441cbfb9577615c292abf07d996d3edabc48de843642d",
        )
        .expect("testnet genesis hash"),
        genesis_time: 1_393_221_600,
        genesis_bits: 0x1f00_ffff,
        genesis_nonce: 216_178,
        pow_limit: hash256_from_hex(
            "3fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pow limit"),
        pos_limit: hash256_from_hex(
            "3fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pos limit"),
        target_timespan: TARGET_TIMESPAN,
        target_spacing: TARGET_SPACING,
        stake_min_age: STAKE_MIN_AGE_TESTNET,
        stake_max_age: STAKE_MAX_AGE,
        modifier_interval: MODIFIER_INTERVAL_TESTNET,
        coinbase_maturity: COINBASE_MATURITY_TESTNET,
        last_pow_block: LAST_POW_BLOCK,
        pos_protocol_v2_height: 0,
        reward_check_start_height: 0,
        enforce_mn_payment_height: 0,
        enforce_dev_payment_height: 0,
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: hash256_from_hex(
                "0000724595fb3b9609d441cbfb9577615c292abf07d996d3edabc48de843642d",
            )
            .expect("testnet genesis checkpoint"),
        }],
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        // Regtest recomputes the genesis hash at startup; tests overwrite it.
        hash_genesis_block: [0u8; 32],
        genesis_time: 1_393_221_600,
        genesis_bits: 0x207f_ffff,
        genesis_nonce: 0,
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pow limit"),
        pos_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pos limit"),
        target_timespan: TARGET_TIMESPAN,
        target_spacing: TARGET_SPACING,
        stake_min_age: 60,
        stake_max_age: STAKE_MAX_AGE,
        modifier_interval: MODIFIER_INTERVAL_TESTNET,
        coinbase_maturity: COINBASE_MATURITY_TESTNET,
        last_pow_block: i32::MAX,
        pos_protocol_v2_height: 0,
        reward_check_start_height: 0,
        enforce_mn_payment_height: 0,
        enforce_dev_payment_height: 0,
        checkpoints: Vec::new(),
    }
}

fn mainnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        consensus: mainnet_consensus_params(),
        message_start: [0xb2, 0xd1, 0xf4, 0xa3],
        default_port: 32_001,
        checkpoint_pubkey: CHECKPOINT_MASTER_PUBKEY,
        developer_script: p2pkh_script(&MAINNET_DEVELOPER_KEY_HASH),
    }
}

fn testnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        consensus: testnet_consensus_params(),
        message_start: [0xaf, 0xf4, 0xc1, 0xa2],
        default_port: 32_005,
        checkpoint_pubkey: CHECKPOINT_MASTER_PUBKEY,
        developer_script: p2pkh_script(&TESTNET_DEVELOPER_KEY_HASH),
    }
}

fn regtest_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        consensus: regtest_consensus_params(),
        message_start: [0xcf, 0xca, 0x1e, 0xb9],
        default_port: 32_007,
        checkpoint_pubkey: CHECKPOINT_MASTER_PUBKEY,
        developer_script: p2pkh_script(&TESTNET_DEVELOPER_KEY_HASH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_hash_round_trips_through_hex() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(
            hash256_to_hex(&params.hash_genesis_block),
            "000001faef25dec4fbcf906e6242621df2c183bf232f263d0ba5b101911e4563"
        );
    }

    #[test]
    fn mainnet_limits() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(params.target_spacing, 79);
        assert_eq!(params.target_timespan, 1200);
        assert_eq!(params.coinbase_maturity, 80);
        assert_eq!(params.stake_min_age, params.stake_max_age);
        assert_eq!(params.total_blocks_estimate(), 0);
        assert!(params.hardened_checkpoint(0).is_some());
        assert!(params.hardened_checkpoint(1).is_none());
    }

    #[test]
    fn checkpoint_heights_ascend() {
        for network in [Network::Mainnet, Network::Testnet] {
            let params = consensus_params(network);
            for window in params.checkpoints.windows(2) {
                assert!(window[0].height < window[1].height);
            }
        }
    }

    #[test]
    fn pos_protocol_version_boundary() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(params.pos_protocol_version(499_999), 1);
        assert_eq!(params.pos_protocol_version(500_000), 2);
        let testnet = consensus_params(Network::Testnet);
        assert_eq!(testnet.pos_protocol_version(0), 2);
    }

    #[test]
    fn hex_rejects_bad_input() {
        assert!(hash256_from_hex("00").is_err());
        assert!(hash256_from_hex(&"zz".repeat(32)).is_err());
    }
}
