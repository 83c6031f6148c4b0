//! Subsidy schedule and coinbase value limit

use crate::constants::*;
use crate::error::{ChainError, Result};
use crate::types::*;

/// GetBlockSubsidy: ℕ → ℕ
///
/// subsidy = 50 * C * 2^(-⌊h/H⌋), reaching zero after 64 halvings.
pub fn get_block_subsidy(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

/// The coinbase may claim at most the block subsidy plus the fees paid by the
/// block's other transactions.
pub fn check_coinbase_value(coinbase: &Transaction, height: u64, fees: u128) -> Result<()> {
    let claimed = coinbase.total_output_value();
    let allowed = get_block_subsidy(height) as u128 + fees;

    if claimed > allowed {
        return Err(ChainError::violation(format!(
            "Coinbase claims {} but only {} is available at height {}",
            claimed, allowed, height
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase(value: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint { hash: NULL_HASH, index: COINBASE_INDEX },
                script_sig: vec![0x01, 0x01],
                sequence: 0xffffffff,
            }],
            outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_get_block_subsidy_genesis() {
        assert_eq!(get_block_subsidy(0), INITIAL_SUBSIDY);
    }

    #[test]
    fn test_get_block_subsidy_halvings() {
        assert_eq!(get_block_subsidy(HALVING_INTERVAL - 1), INITIAL_SUBSIDY);
        assert_eq!(get_block_subsidy(HALVING_INTERVAL), INITIAL_SUBSIDY / 2);
        assert_eq!(get_block_subsidy(HALVING_INTERVAL * 2), INITIAL_SUBSIDY / 4);
        assert_eq!(get_block_subsidy(HALVING_INTERVAL * 64), 0);
    }

    #[test]
    fn test_coinbase_value_limit() {
        assert!(check_coinbase_value(&coinbase(INITIAL_SUBSIDY), 1, 0).is_ok());
        assert!(check_coinbase_value(&coinbase(INITIAL_SUBSIDY + 10), 1, 10).is_ok());
        assert!(check_coinbase_value(&coinbase(INITIAL_SUBSIDY + 11), 1, 10).is_err());
        assert!(check_coinbase_value(&coinbase(INITIAL_SUBSIDY), HALVING_INTERVAL, 0).is_err());
    }
}
