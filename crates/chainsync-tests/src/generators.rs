//! Deterministic test data generators.
//!
//! Provides functions to build hash chains and linked block sequences for
//! exercising the queue and the downloader without real chain data.

use chainsync::{Block, Hash, HASH_LENGTH};

/// Generate a test hash from a seed.
pub fn test_hash(seed: u64) -> Hash {
    let mut bytes = [0u8; HASH_LENGTH];
    bytes[0] = 0xAB;
    bytes[1..9].copy_from_slice(&seed.to_be_bytes());
    bytes[HASH_LENGTH - 1] = (seed % 251) as u8;
    Hash::new(bytes)
}

/// The hash of the chain block at the given number.
pub fn chain_hash(number: u64) -> Hash {
    let mut bytes = [0u8; HASH_LENGTH];
    bytes[0] = 0xC1;
    bytes[1..9].copy_from_slice(&number.to_be_bytes());
    Hash::new(bytes)
}

/// A linked chain of `len` blocks, genesis (number 0) first.
pub fn linked_chain(len: usize) -> Vec<Block> {
    linked_chain_at(0, len)
}

/// A linked run of `len` blocks starting at block number `offset`.
///
/// The first block's parent is the chain hash below the run, or the zero
/// hash when the run starts at genesis.
pub fn linked_chain_at(offset: u64, len: usize) -> Vec<Block> {
    let mut parent = if offset == 0 {
        Hash::ZERO
    } else {
        chain_hash(offset - 1)
    };
    let mut blocks = Vec::with_capacity(len);
    for number in offset..offset + len as u64 {
        let hash = chain_hash(number);
        blocks.push(Block::new(hash, parent, number));
        parent = hash;
    }
    blocks
}

/// Hashes of a block run, chain tip first (the order backfill discovers
/// them in).
pub fn tip_first_hashes(blocks: &[Block]) -> Vec<Hash> {
    blocks.iter().rev().map(|block| block.hash).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashes_are_deterministic_and_distinct() {
        assert_eq!(test_hash(7), test_hash(7));
        assert_ne!(test_hash(7), test_hash(8));
        assert_ne!(chain_hash(7), test_hash(7));
    }

    #[test]
    fn test_linked_chain_links() {
        let blocks = linked_chain(5);
        assert_eq!(blocks[0].parent, Hash::ZERO);
        for pair in blocks.windows(2) {
            assert_eq!(pair[1].parent, pair[0].hash);
            assert_eq!(pair[1].number, pair[0].number + 1);
        }
    }

    #[test]
    fn test_linked_chain_at_offset() {
        let blocks = linked_chain_at(10, 3);
        assert_eq!(blocks[0].number, 10);
        assert_eq!(blocks[0].parent, chain_hash(9));
    }

    #[test]
    fn test_tip_first_order() {
        let blocks = linked_chain(4);
        let hashes = tip_first_hashes(&blocks);
        assert_eq!(hashes[0], blocks[3].hash);
        assert_eq!(hashes[3], blocks[0].hash);
    }
}
