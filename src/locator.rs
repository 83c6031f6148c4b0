//! Block locators for peer synchronization
//!
//! A locator lists active-chain hashes from the tip backwards, densely at
//! first and then at doubling intervals, ending at genesis. A peer answers
//! with the highest of those hashes that is on its own active chain.

use crate::error::{ChainError, Result};
use crate::storage::{ChainStore, StorageError};
use crate::types::{Block, Hash};

/// Heights sampled for a chain whose tip is at `top`, descending.
///
/// Steps of one until ten heights are collected, then doubling. Genesis
/// (height 0) is always last.
pub fn locator_heights(top: u64) -> Vec<u64> {
    let mut heights = Vec::new();
    let mut height = top;
    let mut step = 1u64;

    while height > 0 {
        heights.push(height);
        if heights.len() > 10 {
            step = step.saturating_mul(2);
        }
        match height.checked_sub(step) {
            Some(next) => height = next,
            None => break,
        }
    }
    heights.push(0);
    heights
}

/// Locator for the active chain ending at `top`.
pub async fn build_locator(store: &dyn ChainStore, top: &Block) -> Result<Vec<Hash>> {
    let heights = locator_heights(top.height);
    let blocks = store.get_blocks_by_heights(&heights).await?;

    if blocks.len() != heights.len() {
        return Err(ChainError::Storage(StorageError::Corrupt(format!(
            "active chain has gaps below height {}",
            top.height
        ))));
    }
    Ok(blocks.into_iter().map(|b| b.hash).collect())
}

/// Highest active block named by `locator`.
pub async fn resolve_locator(store: &dyn ChainStore, locator: &[Hash]) -> Result<Option<Block>> {
    Ok(store.get_block_by_locator(locator).await?)
}
