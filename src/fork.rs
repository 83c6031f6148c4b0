//! Fork resolution
//!
//! [`classify`] decides where an incoming block attaches; [`find_fork`] walks
//! two tips back to their common ancestor. [`BranchView`] is the set of
//! blocks and spends a side block builds on.

use crate::cache::RecentCache;
use crate::error::{ChainError, Result};
use crate::pending::{BlockMode, PendingIndex};
use crate::storage::ChainStore;
use crate::types::{display_hash, Block, Hash, OutPoint};
use std::collections::{HashMap, HashSet};

/// The two branches between a fork point and two tips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkPlan {
    /// Old branch, tip first (descending height). Excludes the fork point.
    pub disconnect: Vec<Block>,
    /// New branch, fork point's child first (ascending height).
    pub connect: Vec<Block>,
    pub fork_point: Block,
}

/// Where an incoming block attaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Parent is the current tip.
    Main(Block),
    /// Parent is a committed block other than the tip.
    Side(Block),
    /// Parent is parked in the pending index.
    OrphanOfPending,
    /// Parent unknown everywhere.
    OrphanHead,
    /// The block itself is already stored.
    Discard,
}

impl Classification {
    pub fn mode(&self) -> BlockMode {
        match self {
            Classification::Main(_) => BlockMode::Main,
            Classification::Side(_) => BlockMode::Side,
            Classification::OrphanOfPending | Classification::OrphanHead => BlockMode::Orphan,
            Classification::Discard => BlockMode::Discard,
        }
    }
}

/// Classify `candidate` against the current state, first match wins:
///
/// 1. previous hash is the tip → main
/// 2. previous hash is parked → orphan of that pending block
/// 3. previous hash recently committed → side
/// 4. candidate already stored → discard
/// 5. previous hash stored → side
/// 6. otherwise → orphan head
pub async fn classify(
    candidate: &Block,
    tip: &Block,
    pending: &PendingIndex,
    recent: &RecentCache<Block>,
    store: &dyn ChainStore,
) -> Result<Classification> {
    let prev = candidate.prev_hash();

    if prev == &tip.hash {
        return Ok(Classification::Main(tip.clone()));
    }
    if pending.is_parked(prev) {
        return Ok(Classification::OrphanOfPending);
    }
    if let Some(parent) = recent.get(prev) {
        return Ok(Classification::Side(parent));
    }
    if store.get_block_by_hash(&candidate.hash).await?.is_some() {
        return Ok(Classification::Discard);
    }
    if let Some(parent) = store.get_block_by_hash(prev).await? {
        return Ok(Classification::Side(parent));
    }
    Ok(Classification::OrphanHead)
}

/// Parent of `block`, from the recent cache or storage.
pub async fn load_parent(
    block: &Block,
    recent: &RecentCache<Block>,
    store: &dyn ChainStore,
) -> Result<Option<Block>> {
    if let Some(parent) = recent.get(block.prev_hash()) {
        return Ok(Some(parent));
    }
    Ok(store.get_block_by_hash(block.prev_hash()).await?)
}

async fn step_back(
    block: &Block,
    recent: &RecentCache<Block>,
    store: &dyn ChainStore,
) -> Result<Block> {
    load_parent(block, recent, store).await?.ok_or_else(|| {
        ChainError::DisconnectedFork(format!(
            "Ancestor {} of {} not found",
            display_hash(block.prev_hash()),
            display_hash(&block.hash)
        ))
    })
}

/// FindFork
///
/// Walk `old_tip` and `new_tip` back until they meet. The taller branch is
/// first walked down to the other's height, then both step together.
/// Taking more than `max_depth` steps, or running out of ancestors, means the
/// stored ancestry is broken and fails with [`ChainError::DisconnectedFork`].
pub async fn find_fork(
    old_tip: &Block,
    new_tip: &Block,
    recent: &RecentCache<Block>,
    store: &dyn ChainStore,
    max_depth: u64,
) -> Result<ForkPlan> {
    let mut old = old_tip.clone();
    let mut new = new_tip.clone();
    let mut disconnect = Vec::new();
    let mut connect = Vec::new();
    let mut steps = 0u64;

    let mut count_step = || {
        steps += 1;
        if steps > max_depth {
            return Err(ChainError::DisconnectedFork(format!(
                "No fork point within {} blocks",
                max_depth
            )));
        }
        Ok(())
    };

    while old.height > new.height {
        count_step()?;
        let parent = step_back(&old, recent, store).await?;
        disconnect.push(std::mem::replace(&mut old, parent));
    }
    while new.height > old.height {
        count_step()?;
        let parent = step_back(&new, recent, store).await?;
        connect.push(std::mem::replace(&mut new, parent));
    }
    while old.hash != new.hash {
        count_step()?;
        if old.height == 0 {
            return Err(ChainError::DisconnectedFork(format!(
                "{} and {} share no genesis",
                display_hash(&old_tip.hash),
                display_hash(&new_tip.hash)
            )));
        }
        let old_parent = step_back(&old, recent, store).await?;
        let new_parent = step_back(&new, recent, store).await?;
        disconnect.push(std::mem::replace(&mut old, old_parent));
        connect.push(std::mem::replace(&mut new, new_parent));
    }

    connect.reverse();
    tracing::debug!(
        fork_point = %display_hash(&old.hash),
        height = old.height,
        disconnect = disconnect.len(),
        connect = connect.len(),
        "Found fork"
    );

    Ok(ForkPlan {
        disconnect,
        connect,
        fork_point: old,
    })
}

/// The chain a new block extends, seen from the active chain.
///
/// Everything active at or below `fork_height` is shared with the active
/// chain. Above it the branch consists of the inactive `connected` blocks.
/// Outputs spent by those blocks are in `spent`; outputs spent only by the
/// active blocks above the fork point are `released`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchView {
    pub fork_height: u64,
    pub connected: HashSet<Hash>,
    pub spent: HashMap<OutPoint, Hash>,
    pub released: HashSet<OutPoint>,
}

impl BranchView {
    /// A block on top of `tip`: the branch is the active chain itself.
    pub fn active(tip: &Block) -> Self {
        BranchView {
            fork_height: tip.height,
            ..Default::default()
        }
    }

    /// The branch ending at the new tip of `plan`.
    pub async fn from_plan(plan: &ForkPlan, store: &dyn ChainStore) -> Result<Self> {
        let mut view = BranchView::active(&plan.fork_point);

        for block in &plan.disconnect {
            for tx in store.get_block_transactions(&block.hash).await? {
                if tx.is_coinbase() {
                    continue;
                }
                view.released.extend(tx.inputs.iter().map(|input| input.prevout));
            }
        }

        for block in &plan.connect {
            view.connected.insert(block.hash);
            for tx in store.get_block_transactions(&block.hash).await? {
                if tx.is_coinbase() {
                    continue;
                }
                let txid = tx.txid();
                for input in &tx.inputs {
                    view.spent.insert(input.prevout, txid);
                    view.released.remove(&input.prevout);
                }
            }
        }
        Ok(view)
    }

    /// Whether `block` is an ancestor of (or is) the branch tip.
    pub fn contains(&self, block: &Block) -> bool {
        self.connected.contains(&block.hash) || (block.active && block.height <= self.fork_height)
    }
}
