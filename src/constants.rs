//! Chain-state consensus constants

/// Maximum money supply: 21,000,000 BTC in satoshis
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// Satoshis per BTC
pub const SATOSHIS_PER_BTC: u64 = 100_000_000;

/// Initial block subsidy: 50 BTC
pub const INITIAL_SUBSIDY: u64 = 50 * SATOSHIS_PER_BTC;

/// Halving interval: 210,000 blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Target time per block: 10 minutes
pub const TARGET_SPACING: u64 = 10 * 60;

/// Expected duration of one difficulty period: 2 weeks
pub const TARGET_TIMESPAN: u64 = 14 * 24 * 60 * 60;

/// Difficulty adjustment interval: 2016 blocks
pub const RETARGET_INTERVAL: u64 = TARGET_TIMESPAN / TARGET_SPACING;

/// How far block timestamps may be into the future: 2 hours
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Number of ancestors considered for median time past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Output index used by the coinbase input's null outpoint
pub const COINBASE_INDEX: u32 = 0xffffffff;

/// Hash type passed to the script verifier for every input
pub const SIGHASH_ALL: u32 = 1;

/// Recently committed blocks kept in memory
pub const RECENT_BLOCK_CACHE_SIZE: usize = 10;

/// Recently committed transactions kept in memory
pub const RECENT_TX_CACHE_SIZE: usize = 2000;

/// Orphans not connected after this long are dropped: 1 hour
pub const ORPHAN_TIMEOUT_SECS: u64 = 60 * 60;

/// Upper bound on ancestor steps taken while looking for a fork point
pub const MAX_FORK_DEPTH: u64 = 10_000;
