//! Chain reorganization
//!
//! Switches the active chain from one branch to another by rewriting the
//! `active` flags and the spent-output index block by block. The caller must
//! hold the chain state lock for the whole call.

use crate::error::{ChainError, Result};
use crate::events::{ChainEvent, EventBus, EventKey};
use crate::fork::ForkPlan;
use crate::storage::ChainStore;
use crate::transaction::affected_keys;
use crate::types::{display_hash, Block, Transaction};

/// Blocks whose state changed, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorganizationResult {
    /// Now inactive, in the order they were disconnected (descending height).
    pub disconnected: Vec<Block>,
    /// Now active, ascending height.
    pub connected: Vec<Block>,
    pub fork_point: Block,
}

impl ReorganizationResult {
    pub fn depth(&self) -> usize {
        self.disconnected.len()
    }
}

pub struct Reorganizer<'a> {
    store: &'a dyn ChainStore,
    events: &'a EventBus,
    live_accounting: bool,
}

impl<'a> Reorganizer<'a> {
    pub fn new(store: &'a dyn ChainStore, events: &'a EventBus, live_accounting: bool) -> Self {
        Reorganizer {
            store,
            events,
            live_accounting,
        }
    }

    /// Reorganization: ForkPlan → ReorganizationResult
    ///
    /// 1. For each block of `plan.disconnect`, tip first: mark inactive, emit
    ///    revocations for its transactions (last first), release their spent
    ///    outputs, persist
    /// 2. For each block of `plan.connect`, fork point first: mark active,
    ///    record its spent outputs, emit add/save notifications, persist
    ///
    /// Any failure leaves storage part-way between the branches and is
    /// reported as [`ChainError::ReorgFailed`].
    pub async fn reorganize(&self, plan: &ForkPlan) -> Result<ReorganizationResult> {
        tracing::info!(
            fork_point = %display_hash(&plan.fork_point.hash),
            height = plan.fork_point.height,
            disconnect = plan.disconnect.len(),
            connect = plan.connect.len(),
            "Reorganizing"
        );

        match self.apply(plan).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::error!(error = %e, "Reorganization failed, chain state is inconsistent");
                Err(ChainError::ReorgFailed(Box::new(e)))
            }
        }
    }

    async fn apply(&self, plan: &ForkPlan) -> Result<ReorganizationResult> {
        let mut disconnected = Vec::with_capacity(plan.disconnect.len());
        for block in &plan.disconnect {
            disconnected.push(self.disconnect_block(block.clone()).await?);
        }

        let mut connected = Vec::with_capacity(plan.connect.len());
        for block in &plan.connect {
            connected.push(self.connect_block(block.clone()).await?);
        }

        Ok(ReorganizationResult {
            disconnected,
            connected,
            fork_point: plan.fork_point.clone(),
        })
    }

    async fn disconnect_block(&self, mut block: Block) -> Result<Block> {
        tracing::debug!(block = %block, "Disconnect");
        block.active = false;

        let txs = self.store.get_block_transactions(&block.hash).await?;
        for tx in txs.iter().rev() {
            let txid = tx.txid();
            self.events.emit(ChainEvent::TxRevoke {
                txid,
                tx: tx.clone(),
                block: block.hash,
            });
            for key in self.keys(tx) {
                self.events.emit(ChainEvent::TxRevokeKeyed {
                    key,
                    txid,
                    block: block.hash,
                });
            }
        }

        self.store.disconnect_transactions(&txs).await?;
        self.store.save_block(&block).await?;
        Ok(block)
    }

    async fn connect_block(&self, mut block: Block) -> Result<Block> {
        tracing::debug!(block = %block, "Connect");
        block.active = true;

        let txs = self.store.get_block_transactions(&block.hash).await?;
        self.store.connect_transactions(&txs).await?;

        for tx in &txs {
            let txid = tx.txid();
            self.events.emit(ChainEvent::TxAdd {
                txid,
                tx: tx.clone(),
                block: block.hash,
            });
            for key in self.keys(tx) {
                self.events.emit(ChainEvent::TxAddKeyed {
                    key,
                    txid,
                    block: block.hash,
                });
            }
            self.events.emit(ChainEvent::TxSave {
                txid,
                block: block.hash,
            });
        }

        self.events.emit(ChainEvent::BlockAdd(block.clone()));
        self.store.save_block(&block).await?;
        self.events.emit(ChainEvent::BlockSave(block.clone()));
        Ok(block)
    }

    fn keys(&self, tx: &Transaction) -> Vec<EventKey> {
        if !self.live_accounting {
            return Vec::new();
        }
        affected_keys(tx.txid(), tx.outputs.iter())
    }
}
