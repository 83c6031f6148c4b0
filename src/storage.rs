//! Durable block and transaction storage
//!
//! [`ChainStore`] is the seam towards the persistent key-value engine. The
//! chain engine only talks to storage through this trait. [`MemoryStore`] is a
//! complete in-memory backend used by tests and by embedders that keep the
//! chain in RAM.

use crate::types::{Block, Hash, OutPoint, Transaction};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Backend failure: {0}")]
    Backend(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage operations consumed by the chain engine.
///
/// Writes are upserts. The spent-output index maps each outpoint spent by an
/// active-chain transaction to the spending transaction's hash.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Insert or update a block, keeping the active height index in sync with
    /// `block.active`.
    async fn save_block(&self, block: &Block) -> StorageResult<()>;

    /// Store transactions and record them, in order, as the body of `block_hash`.
    async fn save_transactions(&self, block_hash: &Hash, txs: &[Transaction]) -> StorageResult<()>;

    /// Mark every input of `txs` as spent.
    async fn connect_transactions(&self, txs: &[Transaction]) -> StorageResult<()>;

    /// Undo [`ChainStore::connect_transactions`].
    async fn disconnect_transactions(&self, txs: &[Transaction]) -> StorageResult<()>;

    async fn get_block_by_hash(&self, hash: &Hash) -> StorageResult<Option<Block>>;

    /// Active-chain block at `height`.
    async fn get_block_by_height(&self, height: u64) -> StorageResult<Option<Block>>;

    /// A child of `prev`, preferring the active one.
    async fn get_block_by_prev(&self, prev: &Hash) -> StorageResult<Option<Block>>;

    /// Highest active block.
    async fn get_top_block(&self) -> StorageResult<Option<Block>>;

    /// Known transactions among `hashes`. Unknown hashes are skipped.
    async fn get_transactions_by_hashes(&self, hashes: &[Hash]) -> StorageResult<Vec<Transaction>>;

    /// Body of a block in block order.
    async fn get_block_transactions(&self, block_hash: &Hash) -> StorageResult<Vec<Transaction>>;

    /// Hashes of every stored block whose body contains transaction `hash`.
    async fn get_transaction_blocks(&self, hash: &Hash) -> StorageResult<Vec<Hash>>;

    /// Number of `outpoints` already spent by a transaction other than `exclude`.
    async fn count_conflicting_transactions(
        &self,
        outpoints: &[OutPoint],
        exclude: &Hash,
    ) -> StorageResult<usize>;

    /// Active blocks at the given heights, missing heights skipped.
    async fn get_blocks_by_heights(&self, heights: &[u64]) -> StorageResult<Vec<Block>> {
        let mut blocks = Vec::with_capacity(heights.len());
        for &height in heights {
            if let Some(block) = self.get_block_by_height(height).await? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// Highest active block whose hash appears in `locator`.
    async fn get_block_by_locator(&self, locator: &[Hash]) -> StorageResult<Option<Block>> {
        let mut best: Option<Block> = None;
        for hash in locator {
            if let Some(block) = self.get_block_by_hash(hash).await? {
                if block.active && best.as_ref().map_or(true, |b| block.height > b.height) {
                    best = Some(block);
                }
            }
        }
        Ok(best)
    }

    async fn knows_transaction(&self, hash: &Hash) -> StorageResult<bool> {
        Ok(!self.get_transactions_by_hashes(&[*hash]).await?.is_empty())
    }
}

#[derive(Default)]
struct MemoryTables {
    blocks: HashMap<Hash, Block>,
    active_heights: BTreeMap<u64, Hash>,
    children: HashMap<Hash, Vec<Hash>>,
    transactions: HashMap<Hash, Transaction>,
    block_transactions: HashMap<Hash, Vec<Hash>>,
    transaction_blocks: HashMap<Hash, Vec<Hash>>,
    spent: HashMap<OutPoint, Hash>,
}

/// In-memory [`ChainStore`].
///
/// Writes can be made to fail, either all of them ([`MemoryStore::set_read_only`])
/// or after a number of successful ones ([`MemoryStore::fail_writes_after`]).
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
    read_only: AtomicBool,
    write_budget: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Allow `writes` more successful writes, then fail every write.
    pub fn fail_writes_after(&self, writes: usize) {
        if let Ok(mut budget) = self.write_budget.lock() {
            *budget = Some(writes);
        }
    }

    /// Remove any write failure injection.
    pub fn allow_writes(&self) {
        self.set_read_only(false);
        if let Ok(mut budget) = self.write_budget.lock() {
            *budget = None;
        }
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("store is read-only".into()));
        }
        let mut budget = self
            .write_budget
            .lock()
            .map_err(|_| StorageError::Backend("write budget lock poisoned".into()))?;
        match budget.as_mut() {
            Some(0) => Err(StorageError::Backend("write budget exhausted".into())),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Number of outpoints in the spent index.
    pub async fn spent_count(&self) -> usize {
        self.tables.read().await.spent.len()
    }

    /// Spender of `outpoint`, if any.
    pub async fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash> {
        self.tables.read().await.spent.get(outpoint).copied()
    }
}

#[async_trait]
impl ChainStore for MemoryStore {
    async fn save_block(&self, block: &Block) -> StorageResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;

        if block.active {
            tables.active_heights.insert(block.height, block.hash);
        } else if tables.active_heights.get(&block.height) == Some(&block.hash) {
            tables.active_heights.remove(&block.height);
        }

        if !tables.blocks.contains_key(&block.hash) {
            tables
                .children
                .entry(*block.prev_hash())
                .or_default()
                .push(block.hash);
        }
        tables.blocks.insert(block.hash, block.clone());
        Ok(())
    }

    async fn save_transactions(&self, block_hash: &Hash, txs: &[Transaction]) -> StorageResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;

        let mut hashes = Vec::with_capacity(txs.len());
        for tx in txs {
            let txid = tx.txid();
            tables.transactions.insert(txid, tx.clone());
            let containing = tables.transaction_blocks.entry(txid).or_default();
            if !containing.contains(block_hash) {
                containing.push(*block_hash);
            }
            hashes.push(txid);
        }
        tables.block_transactions.insert(*block_hash, hashes);
        Ok(())
    }

    async fn connect_transactions(&self, txs: &[Transaction]) -> StorageResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;

        for tx in txs.iter().filter(|tx| !tx.is_coinbase()) {
            let txid = tx.txid();
            for input in &tx.inputs {
                tables.spent.insert(input.prevout, txid);
            }
        }
        Ok(())
    }

    async fn disconnect_transactions(&self, txs: &[Transaction]) -> StorageResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;

        for tx in txs.iter().filter(|tx| !tx.is_coinbase()) {
            let txid = tx.txid();
            for input in &tx.inputs {
                if tables.spent.get(&input.prevout) == Some(&txid) {
                    tables.spent.remove(&input.prevout);
                }
            }
        }
        Ok(())
    }

    async fn get_block_by_hash(&self, hash: &Hash) -> StorageResult<Option<Block>> {
        Ok(self.tables.read().await.blocks.get(hash).cloned())
    }

    async fn get_block_by_height(&self, height: u64) -> StorageResult<Option<Block>> {
        let tables = self.tables.read().await;
        Ok(tables
            .active_heights
            .get(&height)
            .and_then(|hash| tables.blocks.get(hash))
            .cloned())
    }

    async fn get_block_by_prev(&self, prev: &Hash) -> StorageResult<Option<Block>> {
        let tables = self.tables.read().await;
        let children: Vec<&Block> = tables
            .children
            .get(prev)
            .map(|hashes| hashes.iter().filter_map(|h| tables.blocks.get(h)).collect())
            .unwrap_or_default();

        Ok(children
            .iter()
            .find(|b| b.active)
            .or_else(|| children.first())
            .map(|b| (*b).clone()))
    }

    async fn get_top_block(&self) -> StorageResult<Option<Block>> {
        let tables = self.tables.read().await;
        match tables.active_heights.iter().next_back() {
            Some((height, hash)) => match tables.blocks.get(hash) {
                Some(block) => Ok(Some(block.clone())),
                None => Err(StorageError::Corrupt(format!(
                    "active height {} points at a missing block",
                    height
                ))),
            },
            None => Ok(None),
        }
    }

    async fn get_transactions_by_hashes(&self, hashes: &[Hash]) -> StorageResult<Vec<Transaction>> {
        let tables = self.tables.read().await;
        Ok(hashes
            .iter()
            .filter_map(|h| tables.transactions.get(h).cloned())
            .collect())
    }

    async fn get_block_transactions(&self, block_hash: &Hash) -> StorageResult<Vec<Transaction>> {
        let tables = self.tables.read().await;
        let Some(hashes) = tables.block_transactions.get(block_hash) else {
            return Ok(Vec::new());
        };

        hashes
            .iter()
            .map(|h| {
                tables.transactions.get(h).cloned().ok_or_else(|| {
                    StorageError::Corrupt(format!(
                        "block body references unknown transaction {}",
                        crate::types::display_hash(h)
                    ))
                })
            })
            .collect()
    }

    async fn get_transaction_blocks(&self, hash: &Hash) -> StorageResult<Vec<Hash>> {
        let tables = self.tables.read().await;
        Ok(tables.transaction_blocks.get(hash).cloned().unwrap_or_default())
    }

    async fn count_conflicting_transactions(
        &self,
        outpoints: &[OutPoint],
        exclude: &Hash,
    ) -> StorageResult<usize> {
        let tables = self.tables.read().await;
        Ok(outpoints
            .iter()
            .filter(|o| tables.spent.get(o).map_or(false, |spender| spender != exclude))
            .count())
    }

    async fn knows_transaction(&self, hash: &Hash) -> StorageResult<bool> {
        Ok(self.tables.read().await.transactions.contains_key(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockHeader, TransactionInput, TransactionOutput, NULL_HASH};

    fn block(prev: Hash, nonce: u32, height: u64, active: bool) -> Block {
        let mut block = Block::new(BlockHeader {
            version: 1,
            prev_block_hash: prev,
            merkle_root: NULL_HASH,
            timestamp: 1_600_000_000,
            bits: 0x207fffff,
            nonce,
        });
        block.height = height;
        block.active = active;
        block
    }

    fn spend(prev: Hash, index: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint { hash: prev, index },
                script_sig: vec![],
                sequence: 0xffffffff,
            }],
            outputs: vec![TransactionOutput { value: 1, script_pubkey: vec![] }],
            lock_time: 0,
        }
    }

    #[tokio::test]
    async fn test_height_index_follows_active_flag() {
        let store = MemoryStore::new();
        let mut a = block(NULL_HASH, 1, 0, true);
        store.save_block(&a).await.unwrap();
        assert_eq!(store.get_block_by_height(0).await.unwrap(), Some(a.clone()));
        assert_eq!(store.get_top_block().await.unwrap(), Some(a.clone()));

        a.active = false;
        store.save_block(&a).await.unwrap();
        assert_eq!(store.get_block_by_height(0).await.unwrap(), None);
        assert_eq!(store.get_top_block().await.unwrap(), None);
        assert!(store.get_block_by_hash(&a.hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_get_block_by_prev_prefers_active() {
        let store = MemoryStore::new();
        let root = block(NULL_HASH, 1, 0, true);
        let side = block(root.hash, 2, 1, false);
        let main = block(root.hash, 3, 1, true);
        for b in [&root, &side, &main] {
            store.save_block(b).await.unwrap();
        }

        let child = store.get_block_by_prev(&root.hash).await.unwrap().unwrap();
        assert_eq!(child.hash, main.hash);
        assert!(store.get_block_by_prev(&main.hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spent_index_and_conflicts() {
        let store = MemoryStore::new();
        let tx = spend([7; 32], 0);
        let mut rival = spend([7; 32], 0);
        rival.lock_time = 1;
        let outpoints = vec![OutPoint { hash: [7; 32], index: 0 }];

        store.connect_transactions(&[tx.clone()]).await.unwrap();
        assert_eq!(store.count_conflicting_transactions(&outpoints, &tx.txid()).await.unwrap(), 0);
        assert_eq!(store.count_conflicting_transactions(&outpoints, &rival.txid()).await.unwrap(), 1);

        // Disconnecting a transaction that is not the recorded spender is a no-op.
        store.disconnect_transactions(&[rival.clone()]).await.unwrap();
        assert_eq!(store.spent_count().await, 1);

        store.disconnect_transactions(&[tx]).await.unwrap();
        assert_eq!(store.count_conflicting_transactions(&outpoints, &rival.txid()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_block_transactions_keep_order() {
        let store = MemoryStore::new();
        let txs = vec![spend([1; 32], 0), spend([2; 32], 1), spend([3; 32], 2)];
        store.save_transactions(&[9; 32], &txs).await.unwrap();

        assert_eq!(store.get_block_transactions(&[9; 32]).await.unwrap(), txs);
        assert!(store.get_block_transactions(&[8; 32]).await.unwrap().is_empty());
        assert!(store.knows_transaction(&txs[1].txid()).await.unwrap());

        let found = store
            .get_transactions_by_hashes(&[txs[2].txid(), [0xee; 32]])
            .await
            .unwrap();
        assert_eq!(found, vec![txs[2].clone()]);
    }

    #[tokio::test]
    async fn test_transaction_blocks_index() {
        let store = MemoryStore::new();
        let shared = spend([1; 32], 0);
        store.save_transactions(&[9; 32], &[shared.clone()]).await.unwrap();
        store.save_transactions(&[8; 32], &[shared.clone(), spend([2; 32], 0)]).await.unwrap();
        store.save_transactions(&[9; 32], &[shared.clone()]).await.unwrap();

        assert_eq!(
            store.get_transaction_blocks(&shared.txid()).await.unwrap(),
            vec![[9; 32], [8; 32]]
        );
        assert!(store.get_transaction_blocks(&[0xee; 32]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locator_picks_highest_active() {
        let store = MemoryStore::new();
        let a = block(NULL_HASH, 1, 0, true);
        let b = block(a.hash, 2, 1, true);
        let stale = block(a.hash, 3, 1, false);
        for blk in [&a, &b, &stale] {
            store.save_block(blk).await.unwrap();
        }

        let found = store
            .get_block_by_locator(&[stale.hash, a.hash, b.hash])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.hash, b.hash);
        assert!(store.get_block_by_locator(&[stale.hash]).await.unwrap().is_none());
        assert_eq!(store.get_blocks_by_heights(&[1, 0, 5]).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_injection() {
        let store = MemoryStore::new();
        let a = block(NULL_HASH, 1, 0, true);

        store.set_read_only(true);
        assert!(matches!(store.save_block(&a).await, Err(StorageError::Backend(_))));

        store.allow_writes();
        store.fail_writes_after(1);
        assert!(store.save_block(&a).await.is_ok());
        assert!(store.save_block(&a).await.is_err());

        store.allow_writes();
        assert!(store.save_block(&a).await.is_ok());
    }
}
