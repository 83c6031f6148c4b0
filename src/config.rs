//! Network parameters
//!
//! Everything the chain engine needs to know about a network. Presets exist
//! for livenet, testnet and unitnet (a minimum-difficulty network for tests);
//! custom networks load from JSON.

use crate::block::merkle_root;
use crate::constants::*;
use crate::error::{ChainError, Result};
use crate::pow::U256;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Decode hex at compile time. Panics (a build error in const context) on bad input.
const fn hex_bytes<const N: usize>(s: &str) -> [u8; N] {
    const fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => panic!("invalid hex digit"),
        }
    }

    let bytes = s.as_bytes();
    assert!(bytes.len() == N * 2, "hex length mismatch");
    let mut out = [0u8; N];
    let mut i = 0;
    while i < N {
        out[i] = (nibble(bytes[2 * i]) << 4) | nibble(bytes[2 * i + 1]);
        i += 1;
    }
    out
}

/// Display-order hex to an internal-order hash, at compile time.
const fn display_hash_const(s: &str) -> Hash {
    let mut hash: Hash = hex_bytes(s);
    let mut i = 0;
    while i < 16 {
        let tmp = hash[i];
        hash[i] = hash[31 - i];
        hash[31 - i] = tmp;
        i += 1;
    }
    hash
}

const GENESIS_PUBKEY: [u8; 65] = hex_bytes(
    "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f",
);
const GENESIS_COINBASE_TAG: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";
const GENESIS_TIMESTAMP: u32 = 1231006505;
const GENESIS_NONCE: u32 = 2083236893;
const MAINNET_BITS: u32 = 0x1d00ffff;
const UNITNET_BITS: u32 = 0x207fffff;

const LIVENET_GENESIS_HASH: Hash =
    display_hash_const("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f");
const TESTNET_GENESIS_HASH: Hash =
    display_hash_const("000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943");
const UNITNET_GENESIS_HASH: Hash =
    display_hash_const("c638d20174b4203c994a3cbd6c0dd888bd19bb7ebe9ecc42fa7eca98dbe1da14");

const LIVENET_CHECKPOINTS: [(u64, &str); 8] = [
    (11111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
    (33333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
    (68555, "00000000001e1b4903550a0b96e9a9405c8a95f387162e4944e8d9fbe501cd6a"),
    (70567, "00000000006a49b14bcf27462068f1264c961f11fa2e0eddd2be0791e1d4124a"),
    (74000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
    (105000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
    (118000, "000000000000774a7f8a7a12dc906ddb9e17e75d684f15e00f8767f9e8f36553"),
    (134444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
];

/// Header fields and coinbase of the genesis block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisParams {
    pub version: i32,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    pub coinbase: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    pub network: String,
    pub genesis: GenesisParams,
    /// Expected genesis hash. When set, a mismatching genesis is a config error.
    #[serde(with = "opt_hash")]
    pub genesis_hash: Option<Hash>,
    /// Proof-of-work limit in compact form.
    pub pow_limit_bits: u32,
    /// Ascending by height.
    pub checkpoints: Vec<Checkpoint>,
    pub recent_block_cache_size: usize,
    pub recent_tx_cache_size: usize,
    pub orphan_timeout_secs: u64,
    pub max_fork_depth: u64,
    pub max_future_block_time: u64,
    /// Emit per-pubkey-hash transaction events.
    pub live_accounting: bool,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::unitnet()
    }
}

impl ChainParams {
    pub fn livenet() -> Self {
        ChainParams {
            network: "livenet".into(),
            genesis: GenesisParams {
                version: 1,
                timestamp: GENESIS_TIMESTAMP,
                bits: MAINNET_BITS,
                nonce: GENESIS_NONCE,
                coinbase: genesis_coinbase(),
            },
            genesis_hash: Some(LIVENET_GENESIS_HASH),
            pow_limit_bits: MAINNET_BITS,
            checkpoints: LIVENET_CHECKPOINTS
                .iter()
                .map(|&(height, hash)| Checkpoint {
                    height,
                    hash: display_hash_const(hash),
                })
                .collect(),
            recent_block_cache_size: RECENT_BLOCK_CACHE_SIZE,
            recent_tx_cache_size: RECENT_TX_CACHE_SIZE,
            orphan_timeout_secs: ORPHAN_TIMEOUT_SECS,
            max_fork_depth: MAX_FORK_DEPTH,
            max_future_block_time: MAX_FUTURE_BLOCK_TIME,
            live_accounting: true,
        }
    }

    pub fn testnet() -> Self {
        let mut params = Self::livenet();
        params.network = "testnet".into();
        params.genesis.timestamp = 1296688602;
        params.genesis.nonce = 414098458;
        params.genesis_hash = Some(TESTNET_GENESIS_HASH);
        params.checkpoints.clear();
        params
    }

    /// Minimum difficulty, no checkpoints. Genesis keeps the livenet nonce,
    /// so it does not meet its own target; genesis is never mined against.
    pub fn unitnet() -> Self {
        let mut params = Self::livenet();
        params.network = "unitnet".into();
        params.genesis.bits = UNITNET_BITS;
        params.genesis_hash = Some(UNITNET_GENESIS_HASH);
        params.pow_limit_bits = UNITNET_BITS;
        params.checkpoints.clear();
        params
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: ChainParams =
            serde_json::from_str(json).map_err(|e| ChainError::Config(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ChainError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ChainError::Config(e.to_string()))
    }

    pub fn pow_limit(&self) -> Result<U256> {
        U256::from_compact(self.pow_limit_bits)
            .map_err(|e| ChainError::Config(format!("proof-of-work limit: {}", e)))
    }

    /// Genesis block as it is stored: height 0, active, its own work.
    pub fn genesis_block(&self) -> Block {
        let txid = self.genesis.coinbase.txid();
        let header = BlockHeader {
            version: self.genesis.version,
            prev_block_hash: NULL_HASH,
            merkle_root: merkle_root(&[txid]).unwrap_or(txid),
            timestamp: self.genesis.timestamp,
            bits: self.genesis.bits,
            nonce: self.genesis.nonce,
        };

        let mut block = Block::new(header);
        block.chain_work = block.work();
        block.active = true;
        block.tx_hashes = vec![txid];
        block
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn validate(&self) -> Result<()> {
        self.pow_limit()?;

        if self.recent_block_cache_size == 0 || self.recent_tx_cache_size == 0 {
            return Err(ChainError::Config("cache sizes must be positive".into()));
        }
        if self.max_fork_depth == 0 {
            return Err(ChainError::Config("max_fork_depth must be positive".into()));
        }
        if self.checkpoints.windows(2).any(|w| w[0].height >= w[1].height) {
            return Err(ChainError::Config("checkpoints must be strictly ascending".into()));
        }
        if !self.genesis.coinbase.is_coinbase() {
            return Err(ChainError::Config("genesis transaction is not a coinbase".into()));
        }

        if let Some(expected) = self.genesis_hash {
            let actual = self.genesis_block().hash;
            if actual != expected {
                return Err(ChainError::Config(format!(
                    "genesis hash {} does not match expected {}",
                    display_hash(&actual),
                    display_hash(&expected)
                )));
            }
        }
        Ok(())
    }
}

fn genesis_coinbase() -> Transaction {
    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04, GENESIS_COINBASE_TAG.len() as u8];
    script_sig.extend_from_slice(GENESIS_COINBASE_TAG);

    let mut script_pubkey = vec![GENESIS_PUBKEY.len() as u8];
    script_pubkey.extend_from_slice(&GENESIS_PUBKEY);
    script_pubkey.push(0xac);

    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint {
                hash: NULL_HASH,
                index: COINBASE_INDEX,
            },
            script_sig,
            sequence: 0xffffffff,
        }],
        outputs: vec![TransactionOutput {
            value: INITIAL_SUBSIDY,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

/// Optional hash as display-order hex, `null` when absent.
mod opt_hash {
    use crate::types::{display_hash, parse_display_hash, Hash};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Option<Hash>, serializer: S) -> Result<S::Ok, S::Error> {
        match hash {
            Some(hash) => serializer.serialize_some(&display_hash(hash)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Hash>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => parse_display_hash(&s)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid hash '{}'", s))),
            None => Ok(None),
        }
    }
}
