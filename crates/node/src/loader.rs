//! Bootstrap loader for external block files.
//!
//! Scans `[magic][size][block]` records out of a byte stream, tolerating
//! leading garbage and torn tails, and feeds each block through the normal
//! acceptance path.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use nucleod_chain::ChainManager;
use nucleod_consensus::constants::MAX_BLOCK_SIZE;
use nucleod_primitives::block::Block;

#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        LoadError::Io(err)
    }
}

pub fn load_external_block_file(
    chain: &ChainManager,
    path: impl AsRef<Path>,
) -> Result<usize, LoadError> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(load_external_block_data(chain, &data))
}

/// Import every well-formed record from `data`; returns how many blocks
/// the chain accepted.
pub fn load_external_block_data(chain: &ChainManager, data: &[u8]) -> usize {
    let magic = chain_magic(chain);
    let mut loaded = 0usize;
    let mut cursor = 0usize;

    while cursor + 8 <= data.len() {
        if chain.shutdown_requested() {
            break;
        }
        // Hunt for the next record magic.
        let Some(found) = find_magic(&data[cursor..], &magic) else {
            break;
        };
        cursor += found;
        if cursor + 8 > data.len() {
            break;
        }
        let size = u32::from_le_bytes([
            data[cursor + 4],
            data[cursor + 5],
            data[cursor + 6],
            data[cursor + 7],
        ]) as usize;
        if size == 0 || size > MAX_BLOCK_SIZE {
            // Not a plausible record; resume scanning past this magic.
            cursor += 1;
            continue;
        }
        let payload_start = cursor + 8;
        let Some(payload) = data.get(payload_start..payload_start + size) else {
            break; // Torn tail.
        };
        match Block::decode(payload) {
            Ok(block) => {
                if chain.process_new_block(block, None).is_ok() {
                    loaded += 1;
                }
                cursor = payload_start + size;
            }
            Err(_) => {
                cursor += 1;
            }
        }
    }

    nucleod_log::log_info!("bootstrap import finished: {loaded} blocks accepted");
    loaded
}

fn chain_magic(chain: &ChainManager) -> [u8; 4] {
    chain.message_start()
}

fn find_magic(data: &[u8], magic: &[u8; 4]) -> Option<usize> {
    data.windows(4).position(|window| window == magic)
}
