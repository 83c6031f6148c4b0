//! Core chain types and their consensus serialization

use crate::constants::COINBASE_INDEX;
use crate::pow::{block_work, U256};
use bitcoin_hashes::{sha256d, Hash as BitcoinHash};
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash type: 256-bit hash in internal (little-endian) byte order
pub type Hash = [u8; 32];

/// 160-bit hash of a public key
pub type PubKeyHash = [u8; 20];

/// Byte string type
pub type ByteString = Vec<u8>;

/// The all-zero hash referenced by coinbase inputs and the genesis header.
pub const NULL_HASH: Hash = [0u8; 32];

/// OutPoint: reference to output `index` of transaction `hash`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn is_null(&self) -> bool {
        self.hash == NULL_HASH && self.index == COINBASE_INDEX
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: u64,
    pub script_pubkey: ByteString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Consensus serialization.
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::new();

        data.extend_from_slice(&self.version.to_le_bytes());

        data.extend_from_slice(&encode_varint(self.inputs.len() as u64));
        for input in &self.inputs {
            data.extend_from_slice(&input.prevout.hash);
            data.extend_from_slice(&input.prevout.index.to_le_bytes());
            data.extend_from_slice(&encode_varint(input.script_sig.len() as u64));
            data.extend_from_slice(&input.script_sig);
            data.extend_from_slice(&input.sequence.to_le_bytes());
        }

        data.extend_from_slice(&encode_varint(self.outputs.len() as u64));
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_le_bytes());
            data.extend_from_slice(&encode_varint(output.script_pubkey.len() as u64));
            data.extend_from_slice(&output.script_pubkey);
        }

        data.extend_from_slice(&self.lock_time.to_le_bytes());
        data
    }

    /// Transaction identity: double SHA256 of the serialized form.
    pub fn txid(&self) -> Hash {
        double_sha256(&self.serialize())
    }

    /// Exactly one input spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn total_output_value(&self) -> u128 {
        self.outputs.iter().map(|o| o.value as u128).sum()
    }
}

/// Block header: the 80 hashed bytes of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn serialize(&self) -> [u8; 80] {
        let mut bytes = [0u8; 80];
        bytes[0..4].copy_from_slice(&self.version.to_le_bytes());
        bytes[4..36].copy_from_slice(&self.prev_block_hash);
        bytes[36..68].copy_from_slice(&self.merkle_root);
        bytes[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.bits.to_le_bytes());
        bytes[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    pub fn hash(&self) -> Hash {
        double_sha256(&self.serialize())
    }
}

/// A block header plus the state derived once it is connected to a parent.
///
/// `hash` is the block's identity. It is computed from the header by
/// [`Block::new`], or taken from the wire by [`Block::with_claimed_hash`] in
/// which case [`crate::block::check_hash`] must be run before trusting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: Hash,
    pub height: u64,
    pub chain_work: U256,
    pub active: bool,
    pub tx_hashes: Vec<Hash>,
}

impl Block {
    pub fn new(header: BlockHeader) -> Self {
        let hash = header.hash();
        Self::with_claimed_hash(header, hash)
    }

    pub fn with_claimed_hash(header: BlockHeader, hash: Hash) -> Self {
        Block {
            header,
            hash,
            height: 0,
            chain_work: U256::zero(),
            active: false,
            tx_hashes: Vec::new(),
        }
    }

    pub fn prev_hash(&self) -> &Hash {
        &self.header.prev_block_hash
    }

    /// Work represented by this block alone.
    pub fn work(&self) -> U256 {
        block_work(self.header.bits)
    }

    /// Derive height and cumulative work from the parent block.
    pub fn attach_to(&mut self, parent: &Block) {
        self.height = parent.height + 1;
        self.chain_work = parent.chain_work.saturating_add(&self.work());
    }

    pub fn more_work_than(&self, other: &Block) -> bool {
        self.chain_work > other.chain_work
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Block {} height={}>", display_hash(&self.hash), self.height)
    }
}

/// A trusted (height, hash) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    #[serde(with = "serde_hash")]
    pub hash: Hash,
}

/// Double SHA256.
pub fn double_sha256(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> PubKeyHash {
    let sha = Sha256::digest(data);
    let digest = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Hex in display order (byte-reversed), as block explorers print hashes.
pub fn display_hash(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a display-order hex hash back into internal byte order.
pub fn parse_display_hash(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s).ok()?;
    let mut hash: Hash = bytes.try_into().ok()?;
    hash.reverse();
    Some(hash)
}

/// Encode a number as a Bitcoin varint
pub fn encode_varint(value: u64) -> Vec<u8> {
    if value < 0xfd {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut result = vec![0xfd];
        result.extend_from_slice(&(value as u16).to_le_bytes());
        result
    } else if value <= 0xffffffff {
        let mut result = vec![0xfe];
        result.extend_from_slice(&(value as u32).to_le_bytes());
        result
    } else {
        let mut result = vec![0xff];
        result.extend_from_slice(&value.to_le_bytes());
        result
    }
}

/// Serde adapter storing hashes as display-order hex strings.
pub mod serde_hash {
    use super::{display_hash, parse_display_hash, Hash};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&display_hash(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_display_hash(&s).ok_or_else(|| D::Error::custom(format!("invalid hash '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block_hash: NULL_HASH,
            merkle_root: parse_display_hash(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            )
            .unwrap(),
            timestamp: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        }
    }

    #[test]
    fn test_block_hash_bitcoin_genesis() {
        let header = genesis_header();
        assert_eq!(
            display_hash(&header.hash()),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_header_serialization_length() {
        assert_eq!(genesis_header().serialize().len(), 80);
    }

    #[test]
    fn test_attach_to_accumulates_work() {
        let mut parent = Block::new(genesis_header());
        parent.chain_work = parent.work();

        let mut child_header = genesis_header();
        child_header.prev_block_hash = parent.hash;
        let mut child = Block::new(child_header);
        child.attach_to(&parent);

        assert_eq!(child.height, 1);
        assert_eq!(child.chain_work, parent.work().saturating_add(&parent.work()));
        assert!(child.more_work_than(&parent));
        assert!(!parent.more_work_than(&child));
    }

    #[test]
    fn test_coinbase_detection() {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint { hash: NULL_HASH, index: COINBASE_INDEX },
                script_sig: vec![0x51],
                sequence: 0xffffffff,
            }],
            outputs: vec![],
            lock_time: 0,
        };
        assert!(coinbase.is_coinbase());

        let mut spend = coinbase.clone();
        spend.inputs[0].prevout.index = 0;
        assert!(!spend.is_coinbase());

        let mut two_inputs = coinbase.clone();
        two_inputs.inputs.push(coinbase.inputs[0].clone());
        assert!(!two_inputs.is_coinbase());
    }

    #[test]
    fn test_display_hash_round_trip() {
        let s = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
        let hash = parse_display_hash(s).unwrap();
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x6f);
        assert_eq!(display_hash(&hash), s);
        assert!(parse_display_hash("abcd").is_none());
    }

    #[test]
    fn test_encode_varint() {
        assert_eq!(encode_varint(0xfc), vec![0xfc]);
        assert_eq!(encode_varint(0xfd), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(encode_varint(0x10000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
    }
}
