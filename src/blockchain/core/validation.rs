use crate::error::ChainError;
use crate::hasher::meets_difficulty;
use rayon::prelude::*;

use super::chain::{Block, GENESIS_PREVIOUS_HASH};
use super::state::LedgerState;

/// Structural and cryptographic integrity of a block sequence.
///
/// For every link `i >= 1`, the stored hash must equal the recomputed hash and
/// `previous_hash` must equal the predecessor's hash. The genesis block is
/// never checked against a predecessor. Pure; callable on any candidate.
pub fn is_valid_chain(blocks: &[Block]) -> bool {
    blocks.par_windows(2).all(|pair| {
        let (previous, current) = (&pair[0], &pair[1]);
        current.hash == current.calculate_hash() && current.previous_hash == previous.hash
    })
}

/// Check a sealed block's own hash and proof-of-work.
pub fn verify_seal(block: &Block, difficulty: u32) -> Result<(), ChainError> {
    let calculated = block.calculate_hash();
    if calculated != block.hash {
        return Err(ChainError::InvalidBlock(format!(
            "Block {} hash mismatch. Expected {}, but got {}.",
            block.index, calculated, block.hash
        )));
    }
    if !meets_difficulty(&block.hash, difficulty) {
        return Err(ChainError::InvalidBlock(format!(
            "Block {} hash {} does not meet difficulty {}.",
            block.index, block.hash, difficulty
        )));
    }
    Ok(())
}

/// Full independent verification of a chain received from elsewhere.
///
/// On top of [`is_valid_chain`] this requires the genesis sentinel, contiguous
/// indices, a valid seal on every block and a balance replay that never
/// overdraws. Returns the replayed balances on success.
pub fn verify_chain(
    blocks: &[Block],
    difficulty: u32,
    seed: &LedgerState,
) -> Result<LedgerState, ChainError> {
    let genesis = blocks
        .first()
        .ok_or_else(|| ChainError::InvalidBlock("Chain is empty".to_string()))?;

    if genesis.index != 0 || genesis.previous_hash != GENESIS_PREVIOUS_HASH {
        return Err(ChainError::InvalidBlock(
            "First block is not a genesis block".to_string(),
        ));
    }

    if let Some((position, block)) = blocks
        .iter()
        .enumerate()
        .find(|(position, block)| block.index != *position as u64)
    {
        return Err(ChainError::InvalidBlock(format!(
            "Block at position {} has index {}",
            position, block.index
        )));
    }

    if !is_valid_chain(blocks) {
        return Err(ChainError::InvalidBlock(
            "Hash linkage or block hash check failed".to_string(),
        ));
    }

    blocks
        .par_iter()
        .try_for_each(|block| verify_seal(block, difficulty))?;

    LedgerState::replay(seed, blocks)
}
