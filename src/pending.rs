//! Blocks that entered the ingestion pipeline but are not committed yet
//!
//! An [`InFlightBlock`] is owned by the pipeline from arrival until its fate
//! is decided. Blocks whose parent is unknown are parked in the
//! [`PendingIndex`], either as an orphan *head* (registered under the missing
//! parent hash) or as a child attached to another parked block.

use crate::error::{ChainError, Result};
use crate::types::{display_hash, Block, Hash, Transaction};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Where a block lands relative to the current chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Extends the current tip.
    Main,
    /// Connects to a known block that is not the tip.
    Side,
    /// Parent unknown; parked until it arrives.
    Orphan,
    /// Already known.
    Discard,
}

/// Pipeline position of an in-flight block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Arrived,
    Classifying,
    MainConnect,
    SideConnect,
    Orphaned,
    Discarded,
    VerifyingTransactions,
    Reorganizing,
    Committing,
    Done,
}

/// Result delivered to submitters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Committed. `reorganized` is set when the block triggered a chain switch.
    Connected {
        mode: BlockMode,
        height: u64,
        reorganized: bool,
    },
    /// Parked until its parent arrives.
    Orphaned,
    /// Already pending or recently committed.
    Duplicate,
    /// Already in storage.
    Discarded,
}

pub type Completion = oneshot::Sender<Result<SubmitOutcome>>;

/// A candidate block and everything the pipeline learns about it.
pub struct InFlightBlock {
    pub block: Block,
    pub txs: Vec<Transaction>,
    pub mode: Option<BlockMode>,
    pub stage: Stage,
    /// Set once classified as main or side.
    pub parent: Option<Block>,
    /// Parked blocks waiting on this one.
    pub children: Vec<Hash>,
    pub received: Instant,
    completions: Vec<Completion>,
}

impl InFlightBlock {
    pub fn new(block: Block, txs: Vec<Transaction>) -> Self {
        InFlightBlock {
            block,
            txs,
            mode: None,
            stage: Stage::Arrived,
            parent: None,
            children: Vec::new(),
            received: Instant::now(),
            completions: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash {
        self.block.hash
    }

    pub fn prev_hash(&self) -> Hash {
        *self.block.prev_hash()
    }

    pub fn advance(&mut self, stage: Stage) {
        tracing::trace!(block = %display_hash(&self.block.hash), from = ?self.stage, to = ?stage, "Stage");
        self.stage = stage;
    }

    pub fn add_completion(&mut self, completion: Completion) {
        self.completions.push(completion);
    }

    pub fn has_completions(&self) -> bool {
        !self.completions.is_empty()
    }

    /// Deliver `result` to every waiting submitter.
    pub fn complete(&mut self, result: Result<SubmitOutcome>) {
        for completion in self.completions.drain(..) {
            // A submitter that stopped waiting is not an error.
            let _ = completion.send(result.clone());
        }
    }
}

impl std::fmt::Debug for InFlightBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightBlock")
            .field("hash", &display_hash(&self.block.hash))
            .field("mode", &self.mode)
            .field("stage", &self.stage)
            .field("children", &self.children.len())
            .field("waiting", &self.completions.len())
            .finish()
    }
}

/// Parked orphans plus the block currently being processed.
#[derive(Debug, Default)]
pub struct PendingIndex {
    blocks: HashMap<Hash, InFlightBlock>,
    heads: HashMap<Hash, Vec<Hash>>,
    current: Option<Hash>,
}

impl PendingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `hash` as the block being processed.
    pub fn begin(&mut self, hash: Hash) {
        self.current = Some(hash);
    }

    pub fn finish(&mut self) {
        self.current = None;
    }

    /// Whether `hash` is parked or being processed.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.current.as_ref() == Some(hash) || self.blocks.contains_key(hash)
    }

    /// Whether `hash` is parked as an orphan.
    pub fn is_parked(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get_by_hash(&self, hash: &Hash) -> Option<&InFlightBlock> {
        self.blocks.get(hash)
    }

    /// Park `ctx` by hash. Linking it to a head list or a parked parent is
    /// the caller's job.
    pub fn add(&mut self, ctx: InFlightBlock) {
        self.blocks.insert(ctx.hash(), ctx);
    }

    /// Remove a parked block, detaching it from the head list and from any
    /// parent's child list. Its own children stay parked.
    pub fn remove(&mut self, hash: &Hash) -> Option<InFlightBlock> {
        let ctx = self.blocks.remove(hash)?;
        self.remove_orphan_head(&ctx.prev_hash(), hash);
        if let Some(parent) = self.blocks.get_mut(&ctx.prev_hash()) {
            parent.children.retain(|h| h != hash);
        }
        Some(ctx)
    }

    /// Orphan heads registered as waiting on `parent`.
    pub fn get_by_parent_hash(&self, parent: &Hash) -> Vec<&InFlightBlock> {
        self.heads
            .get(parent)
            .map(|hashes| hashes.iter().filter_map(|h| self.blocks.get(h)).collect())
            .unwrap_or_default()
    }

    /// Detach and return the orphan heads waiting on `parent`.
    pub fn take_by_parent_hash(&mut self, parent: &Hash) -> Vec<InFlightBlock> {
        let hashes = self.heads.remove(parent).unwrap_or_default();
        hashes.iter().filter_map(|h| self.blocks.remove(h)).collect()
    }

    /// Park `ctx` as an orphan head waiting on its previous hash.
    pub fn add_as_orphan_head(&mut self, ctx: InFlightBlock) {
        let hash = ctx.hash();
        let waiting = self.heads.entry(ctx.prev_hash()).or_default();
        if !waiting.contains(&hash) {
            waiting.push(hash);
        }
        self.add(ctx);
    }

    pub fn remove_orphan_head(&mut self, parent: &Hash, hash: &Hash) {
        if let Some(waiting) = self.heads.get_mut(parent) {
            waiting.retain(|h| h != hash);
            if waiting.is_empty() {
                self.heads.remove(parent);
            }
        }
    }

    /// Park `ctx` as a child of the parked block it references. Returns `ctx`
    /// back if that parent is not parked.
    pub fn attach_child(&mut self, ctx: InFlightBlock) -> std::result::Result<(), InFlightBlock> {
        let hash = ctx.hash();
        match self.blocks.get_mut(&ctx.prev_hash()) {
            Some(parent) => {
                if !parent.children.contains(&hash) {
                    parent.children.push(hash);
                }
                self.add(ctx);
                Ok(())
            }
            None => Err(ctx),
        }
    }

    /// Detach the parked children of `ctx`, in arrival order.
    pub fn take_children(&mut self, ctx: &mut InFlightBlock) -> Vec<InFlightBlock> {
        ctx.children
            .drain(..)
            .filter_map(|h| self.blocks.remove(&h))
            .collect()
    }

    /// Everything that can only connect through `ctx`: heads waiting on it and
    /// attached children, recursively. All of them are removed.
    pub fn discard_descendants(&mut self, ctx: &mut InFlightBlock) -> Vec<InFlightBlock> {
        let mut discarded = Vec::new();
        let mut frontier = self.take_by_parent_hash(&ctx.hash());
        frontier.extend(self.take_children(ctx));

        while let Some(mut child) = frontier.pop() {
            frontier.extend(self.take_by_parent_hash(&child.hash()));
            frontier.extend(self.take_children(&mut child));
            discarded.push(child);
        }
        discarded
    }

    /// Drop orphan heads parked longer than `timeout`, with their descendants.
    pub fn expire_stale(&mut self, timeout: Duration, now: Instant) -> Vec<InFlightBlock> {
        let stale: Vec<Hash> = self
            .heads
            .values()
            .flatten()
            .filter(|h| {
                self.blocks
                    .get(*h)
                    .map_or(false, |ctx| now.saturating_duration_since(ctx.received) > timeout)
            })
            .copied()
            .collect();

        let mut expired = Vec::new();
        for hash in stale {
            if let Some(mut ctx) = self.remove(&hash) {
                expired.extend(self.discard_descendants(&mut ctx));
                expired.push(ctx);
            }
        }
        expired
    }

    /// Number of parked blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Error delivered to the descendants of a block that failed.
pub fn parent_rejected(parent: &Hash) -> ChainError {
    ChainError::ParentRejected { parent: *parent }
}
