//! Shared fixtures for the chain integration tests: a unitnet chain backed by
//! [`MemoryStore`] and a miner that finds valid nonces against the unitnet
//! limit.

#![allow(dead_code)]

use chainstate::block::merkle_root;
use chainstate::constants::{COINBASE_INDEX, INITIAL_SUBSIDY};
use chainstate::pow::{check_proof_of_work, U256};
use chainstate::script::AcceptAllVerifier;
use chainstate::*;
use std::sync::Arc;

pub const UNITNET_BITS: u32 = 0x207fffff;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn new_chain() -> (Arc<BlockChain>, Arc<MemoryStore>) {
    new_chain_with(ChainParams::unitnet()).await
}

pub async fn new_chain_with(params: ChainParams) -> (Arc<BlockChain>, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let chain = BlockChain::new(params, store.clone(), Arc::new(AcceptAllVerifier)).unwrap();
    chain.init().await.unwrap();
    (Arc::new(chain), store)
}

/// Coinbase for `height`. `tag` tells apart coinbases of competing branches.
pub fn coinbase(height: u64, tag: u8) -> Transaction {
    coinbase_paying(height, tag, INITIAL_SUBSIDY)
}

pub fn coinbase_paying(height: u64, tag: u8, value: u64) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(tag);
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint { hash: NULL_HASH, index: COINBASE_INDEX },
            script_sig,
            sequence: 0xffffffff,
        }],
        outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
        lock_time: 0,
    }
}

/// Spend output `index` of `source`, paying `value` back out.
pub fn spend(source: &Transaction, index: u32, value: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint { hash: source.txid(), index },
            script_sig: vec![0x51],
            sequence: 0xffffffff,
        }],
        outputs: vec![TransactionOutput { value, script_pubkey: vec![0x51] }],
        lock_time: 0,
    }
}

/// A candidate block on top of `parent` carrying `txs`, with height and
/// chain work filled in locally so it can serve as the next parent.
pub fn mine(parent: &Block, txs: Vec<Transaction>) -> (Block, Vec<Transaction>) {
    mine_with_bits(parent, txs, UNITNET_BITS)
}

pub fn mine_with_bits(parent: &Block, txs: Vec<Transaction>, bits: u32) -> (Block, Vec<Transaction>) {
    let limit = U256::from_compact(UNITNET_BITS).unwrap();
    let txids: Vec<Hash> = txs.iter().map(|tx| tx.txid()).collect();
    let mut header = BlockHeader {
        version: 1,
        prev_block_hash: parent.hash,
        merkle_root: merkle_root(&txids).unwrap(),
        timestamp: parent.header.timestamp + 600,
        bits,
        nonce: 0,
    };
    while check_proof_of_work(&header.hash(), header.bits, &limit).is_err() {
        header.nonce += 1;
    }

    let mut block = Block::new(header);
    block.attach_to(parent);
    (block, txs)
}

/// A block holding only a coinbase.
pub fn next(parent: &Block, tag: u8) -> (Block, Vec<Transaction>) {
    mine(parent, vec![coinbase(parent.height + 1, tag)])
}

/// `length` coinbase-only blocks on top of `parent`.
pub fn branch(parent: &Block, length: usize, tag: u8) -> Vec<(Block, Vec<Transaction>)> {
    let mut blocks: Vec<(Block, Vec<Transaction>)> = Vec::with_capacity(length);
    for _ in 0..length {
        let tip = blocks.last().map_or(parent, |(block, _)| block);
        let block = next(tip, tag);
        blocks.push(block);
    }
    blocks
}

pub async fn submit(chain: &BlockChain, block: &(Block, Vec<Transaction>)) -> Result<SubmitOutcome> {
    chain.submit(block.0.clone(), block.1.clone()).await
}

pub async fn stored(store: &MemoryStore, hash: &Hash) -> Block {
    store.get_block_by_hash(hash).await.unwrap().unwrap()
}

pub fn connected(height: u64, mode: BlockMode, reorganized: bool) -> SubmitOutcome {
    SubmitOutcome::Connected { mode, height, reorganized }
}
