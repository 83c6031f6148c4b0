//! Block validation rules
//!
//! Everything here is pure: no storage access, no chain state beyond what the
//! caller passes in.

use crate::constants::*;
use crate::error::{ChainError, Result};
use crate::pow::{check_proof_of_work, median_time_past, next_work_required, U256};
use crate::transaction::check_transaction;
use crate::types::*;

/// The claimed block hash must be the double-SHA256 of its header.
pub fn check_hash(block: &Block) -> Result<()> {
    if block.header.hash() != block.hash {
        return Err(ChainError::violation(format!(
            "Block hash {} does not match header",
            display_hash(&block.hash)
        )));
    }
    Ok(())
}

/// Reject timestamps more than `max_future` seconds ahead of `now`.
pub fn check_timestamp(header: &BlockHeader, now: u64, max_future: u64) -> Result<()> {
    if header.timestamp as u64 > now.saturating_add(max_future) {
        return Err(ChainError::violation(format!(
            "Timestamp {} too far in the future",
            header.timestamp
        )));
    }
    Ok(())
}

/// CheckTransactions: [𝒯𝒳] → {valid, invalid}
///
/// 1. |txs| > 0
/// 2. txs[0] is coinbase
/// 3. ∀i > 0: txs[i] is not coinbase
pub fn check_transactions(txs: &[Transaction]) -> Result<()> {
    let Some(first) = txs.first() else {
        return Err(ChainError::violation("Block has no transactions"));
    };
    if !first.is_coinbase() {
        return Err(ChainError::violation("First transaction must be coinbase"));
    }
    if let Some(i) = txs.iter().skip(1).position(|tx| tx.is_coinbase()) {
        return Err(ChainError::violation(format!(
            "More than one coinbase (second at index {})",
            i + 1
        )));
    }
    Ok(())
}

/// Merkle root of transaction hashes. Odd levels duplicate their last node.
pub fn merkle_root(hashes: &[Hash]) -> Option<Hash> {
    if hashes.is_empty() {
        return None;
    }

    let mut level = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(&last) = level.last() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut data = [0u8; 64];
                data[..32].copy_from_slice(&pair[0]);
                data[32..].copy_from_slice(&pair[1]);
                double_sha256(&data)
            })
            .collect();
    }
    Some(level[0])
}

pub fn check_merkle_root(header: &BlockHeader, txs: &[Transaction]) -> Result<()> {
    let hashes: Vec<Hash> = txs.iter().map(|tx| tx.txid()).collect();
    match merkle_root(&hashes) {
        Some(root) if root == header.merkle_root => Ok(()),
        _ => Err(ChainError::violation("Merkle root mismatch")),
    }
}

/// CheckBlock: ℬ × [𝒯𝒳] → {valid, invalid}
///
/// Position-independent checks, run before a block is queued:
/// 1. hash matches header
/// 2. proof of work meets the encoded target, target within `pow_limit`
/// 3. timestamp not too far in the future
/// 4. transaction list shape
/// 5. merkle root
/// 6. intrinsic checks on every transaction
pub fn check_block(
    block: &Block,
    txs: &[Transaction],
    pow_limit: &U256,
    now: u64,
    max_future: u64,
) -> Result<()> {
    check_hash(block)?;
    check_proof_of_work(&block.hash, block.header.bits, pow_limit)?;
    check_timestamp(&block.header, now, max_future)?;
    check_transactions(txs)?;
    check_merkle_root(&block.header, txs)?;
    for tx in txs {
        check_transaction(tx)?;
    }
    Ok(())
}

/// A block at a checkpointed height must carry the checkpointed hash.
pub fn check_checkpoint(block: &Block, checkpoints: &[Checkpoint]) -> Result<()> {
    match checkpoints.iter().find(|c| c.height == block.height) {
        Some(checkpoint) if checkpoint.hash != block.hash => Err(ChainError::violation(format!(
            "Block {} at height {} does not match checkpoint {}",
            display_hash(&block.hash),
            block.height,
            display_hash(&checkpoint.hash)
        ))),
        _ => Ok(()),
    }
}

/// Context-dependent header checks for `child` on top of `parent`.
///
/// `ancestor_timestamps` are the timestamps of up to `MEDIAN_TIME_SPAN`
/// blocks ending with `parent`. `period_start` is the first block of the
/// difficulty period and is only required when `child` starts a new one.
pub fn verify_child(
    child: &Block,
    parent: &Block,
    period_start: Option<&BlockHeader>,
    ancestor_timestamps: &[u32],
    pow_limit: &U256,
) -> Result<()> {
    if child.prev_hash() != &parent.hash {
        return Err(ChainError::violation("Parent does not match previous hash"));
    }

    let expected = next_work_required(&parent.header, parent.height, period_start, pow_limit)?;
    if child.header.bits != expected {
        return Err(ChainError::violation(format!(
            "Incorrect difficulty bits {:#010x}, expected {:#010x}",
            child.header.bits, expected
        )));
    }

    let window = &ancestor_timestamps[ancestor_timestamps.len().saturating_sub(MEDIAN_TIME_SPAN)..];
    if let Some(mtp) = median_time_past(window) {
        if child.header.timestamp <= mtp {
            return Err(ChainError::violation(format!(
                "Timestamp {} not after median time past {}",
                child.header.timestamp, mtp
            )));
        }
    }
    Ok(())
}
