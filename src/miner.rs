//! Proof-of-work sealing
//!
//! The search is cooperative: it runs in bounded batches of nonces and checks a
//! cancellation flag between batches, so a caller can interrupt a long search
//! or resume it later from the nonce stored on the block.

use crate::blockchain::Block;
use crate::error::ChainError;
use crate::hasher::meets_difficulty;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Nonces tried between two cancellation checks.
pub const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Try at most `budget` nonces starting at `block.nonce`.
///
/// Returns `Ok(true)` with `nonce` and `hash` set when a satisfying nonce is
/// found. Otherwise leaves `block.nonce` at the next untried value and returns
/// `Ok(false)`, so calling again resumes where this call stopped.
pub fn search(block: &mut Block, difficulty: u32, budget: u64) -> Result<bool, ChainError> {
    let preimage = block.preimage();
    let mut nonce = block.nonce;

    for _ in 0..budget {
        let hash = preimage.digest(nonce);
        if meets_difficulty(&hash, difficulty) {
            block.nonce = nonce;
            block.hash = hash;
            return Ok(true);
        }
        nonce = nonce.checked_add(1).ok_or_else(|| {
            ChainError::InvalidBlock(format!("Nonce space exhausted for block {}", block.index))
        })?;
    }

    block.nonce = nonce;
    Ok(false)
}

/// Seal `block` under `difficulty`, checking `cancel` every
/// [`CANCEL_CHECK_INTERVAL`] attempts.
pub fn mine_block(mut block: Block, difficulty: u32, cancel: &AtomicBool) -> Result<Block, ChainError> {
    loop {
        if cancel.load(Ordering::Relaxed) {
            debug!(index = block.index, nonce = block.nonce, "mining cancelled");
            return Err(ChainError::MiningCancelled);
        }
        if search(&mut block, difficulty, CANCEL_CHECK_INTERVAL)? {
            debug!(index = block.index, nonce = block.nonce, hash = %block.hash, "block sealed");
            return Ok(block);
        }
    }
}
