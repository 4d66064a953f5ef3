use std::fmt::Debug;

use super::block::Block;
use super::crypto::{hash256, Hash};

/// Strategy for finding a block's nonce
pub trait ProofOfWork: Debug + Send + Sync {
    /// Returns a nonce for the block
    fn work(&self, block: &Block) -> u64;
}

/// Checks that the hex encoding of `hash` starts with `difficulty` zeros
///
/// # Arguments
///
/// * `hash` - The block hash
/// * `difficulty` - The number of leading zero hex characters required
pub fn meets_difficulty(hash: &Hash, difficulty: u32) -> bool {
    let target = "0".repeat(difficulty as usize);
    hash.to_hex().starts_with(&target)
}

/// Sequential nonce search from zero
#[derive(Debug, Clone, Default)]
pub struct SimplePow;

impl SimplePow {
    /// Creates the default strategy
    pub fn new() -> Self {
        SimplePow
    }
}

impl ProofOfWork for SimplePow {
    fn work(&self, block: &Block) -> u64 {
        let merkle_root = block.merkle_root();
        let mut nonce = 0u64;

        loop {
            let hash = hash256(&block.header_bytes(&merkle_root, nonce));
            if meets_difficulty(&hash, block.difficulty) {
                return nonce;
            }
            nonce += 1;
        }
    }
}
