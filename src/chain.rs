//! The chain-state engine
//!
//! [`BlockChain`] owns the tip pointers, the pending index and the recent
//! caches. Blocks from any number of callers are funnelled through one FIFO
//! queue and processed strictly one at a time: classify, verify, optionally
//! reorganize, commit.

use crate::block::{check_block, check_checkpoint, verify_child};
use crate::cache::RecentCache;
use crate::config::ChainParams;
use crate::constants::{MEDIAN_TIME_SPAN, RETARGET_INTERVAL};
use crate::error::{ChainError, Result};
use crate::events::{ChainEvent, EventBus};
use crate::fork::{classify, find_fork, load_parent, BranchView, Classification, ForkPlan};
use crate::locator::{build_locator, resolve_locator};
use crate::pending::{parent_rejected, BlockMode, InFlightBlock, PendingIndex, Stage, SubmitOutcome};
use crate::pow::{is_retarget_height, U256};
use crate::reorganization::Reorganizer;
use crate::script::ScriptVerifier;
use crate::storage::ChainStore;
use crate::transaction::{check_transaction, TransactionMap, TxVerifier, VerifiedTransaction};
use crate::types::{display_hash, Block, Hash, Transaction};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tracing::{debug, error, info, warn};

/// Mutable chain state. Guarded by one async lock that the pipeline holds for
/// the whole of a block's processing.
struct ChainState {
    genesis: Option<Block>,
    top: Option<Block>,
    /// Advisory only, never used for chain selection.
    last_received: Option<Block>,
    pending: PendingIndex,
    recent_blocks: RecentCache<Block>,
    recent_txs: RecentCache<Transaction>,
    halted: bool,
}

#[derive(Default)]
struct IngestQueue {
    blocks: VecDeque<InFlightBlock>,
    processing: bool,
}

/// What the pipeline decided for one block.
enum Disposition {
    Duplicate,
    Orphan,
    Discard,
    Committed {
        mode: BlockMode,
        height: u64,
        reorganized: bool,
        is_tip: bool,
    },
}

pub struct BlockChain {
    params: ChainParams,
    pow_limit: U256,
    store: Arc<dyn ChainStore>,
    scripts: Arc<dyn ScriptVerifier>,
    events: EventBus,
    state: tokio::sync::Mutex<ChainState>,
    queue: Mutex<IngestQueue>,
}

impl BlockChain {
    pub fn new(
        params: ChainParams,
        store: Arc<dyn ChainStore>,
        scripts: Arc<dyn ScriptVerifier>,
    ) -> Result<Self> {
        params.validate()?;
        let pow_limit = params.pow_limit()?;

        let state = ChainState {
            genesis: None,
            top: None,
            last_received: None,
            pending: PendingIndex::new(),
            recent_blocks: RecentCache::new(params.recent_block_cache_size),
            recent_txs: RecentCache::new(params.recent_tx_cache_size),
            halted: false,
        };

        Ok(BlockChain {
            params,
            pow_limit,
            store,
            scripts,
            events: EventBus::new(),
            state: tokio::sync::Mutex::new(state),
            queue: Mutex::new(IngestQueue::default()),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Persist genesis if storage does not have it yet, then load the tip.
    pub async fn init(&self) -> Result<Block> {
        let mut state = self.state.lock().await;
        let genesis = self.params.genesis_block();

        let stored = match self.store.get_block_by_hash(&genesis.hash).await? {
            Some(existing) => existing,
            None => {
                self.store
                    .save_transactions(&genesis.hash, &[self.params.genesis.coinbase.clone()])
                    .await?;
                self.store.save_block(&genesis).await?;
                info!(network = %self.params.network, genesis = %genesis, "Created genesis block");
                genesis
            }
        };

        let top = self.store.get_top_block().await?.unwrap_or_else(|| stored.clone());
        info!(top = %top, "Chain initialized");

        state.genesis = Some(stored);
        state.top = Some(top.clone());
        drop(state);

        self.events.emit(ChainEvent::InitComplete(top.clone()));
        Ok(top)
    }

    /// Submit a candidate block and wait for its fate.
    ///
    /// Already pending or recently committed blocks succeed immediately with
    /// [`SubmitOutcome::Duplicate`]. Blocks failing position-independent
    /// checks are rejected without being queued. Everything else joins the
    /// ingestion queue. If no block is being processed, this call drives the
    /// queue until it is empty.
    pub async fn submit(&self, block: Block, txs: Vec<Transaction>) -> Result<SubmitOutcome> {
        let hash = block.hash;
        {
            let state = self.state.lock().await;
            if state.halted {
                return Err(ChainError::Halted);
            }
            if state.top.is_none() {
                return Err(ChainError::NotInitialized);
            }
            if state.pending.contains(&hash) || state.recent_blocks.contains(&hash) {
                debug!(block = %display_hash(&hash), "Duplicate block");
                return Ok(SubmitOutcome::Duplicate);
            }
        }

        if let Err(e) = check_block(
            &block,
            &txs,
            &self.pow_limit,
            unix_time(),
            self.params.max_future_block_time,
        ) {
            warn!(block = %display_hash(&hash), error = %e, "Rejected block");
            return Err(e);
        }

        let (completion, outcome) = oneshot::channel();
        let drive = {
            let mut queue = self.lock_queue();
            if let Some(queued) = queue.blocks.iter_mut().find(|ctx| ctx.hash() == hash) {
                queued.add_completion(completion);
                false
            } else {
                let mut ctx = InFlightBlock::new(block, txs);
                ctx.add_completion(completion);
                queue.blocks.push_back(ctx);
                !std::mem::replace(&mut queue.processing, true)
            }
        };

        if drive {
            self.drain().await;
        }

        outcome.await.map_err(|_| ChainError::Halted)?
    }

    fn lock_queue(&self) -> MutexGuard<'_, IngestQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process queued blocks until the queue is empty.
    async fn drain(&self) {
        loop {
            let next = {
                let mut queue = self.lock_queue();
                match queue.blocks.pop_front() {
                    Some(ctx) => ctx,
                    None => {
                        queue.processing = false;
                        break;
                    }
                }
            };
            self.process(next).await;
        }
        self.events.emit(ChainEvent::QueueDone);
    }

    async fn process(&self, mut ctx: InFlightBlock) {
        let mut state = self.state.lock().await;
        if state.halted {
            ctx.complete(Err(ChainError::Halted));
            return;
        }

        let timeout = Duration::from_secs(self.params.orphan_timeout_secs);
        for expired in state.pending.expire_stale(timeout, Instant::now()) {
            warn!(block = %display_hash(&expired.hash()), "Dropped stale orphan");
        }

        let hash = ctx.hash();
        state.pending.begin(hash);
        let result = self.run_pipeline(&mut state, &mut ctx).await;
        state.pending.finish();
        ctx.advance(Stage::Done);

        match result {
            Ok(Disposition::Duplicate) => {
                ctx.complete(Ok(SubmitOutcome::Duplicate));
                let waiting = release_waiting(&mut state.pending, &mut ctx);
                self.requeue(waiting, false);
            }
            Ok(Disposition::Discard) => {
                debug!(block = %display_hash(&hash), "Block already stored");
                ctx.complete(Ok(SubmitOutcome::Discarded));
                let waiting = release_waiting(&mut state.pending, &mut ctx);
                self.requeue(waiting, false);
            }
            Ok(Disposition::Orphan) => {
                ctx.complete(Ok(SubmitOutcome::Orphaned));
                if let Err(ctx) = state.pending.attach_child(ctx) {
                    state.pending.add_as_orphan_head(ctx);
                }
            }
            Ok(Disposition::Committed {
                mode,
                height,
                reorganized,
                is_tip,
            }) => {
                ctx.complete(Ok(SubmitOutcome::Connected {
                    mode,
                    height,
                    reorganized,
                }));
                let children = release_waiting(&mut state.pending, &mut ctx);
                if !children.is_empty() {
                    debug!(block = %display_hash(&hash), count = children.len(), "Releasing orphans");
                }
                self.requeue(children, is_tip);
            }
            Err(e) => {
                warn!(block = %display_hash(&hash), error = %e, "Block failed");
                for mut child in state.pending.discard_descendants(&mut ctx) {
                    debug!(block = %display_hash(&child.hash()), "Discarding descendant of failed block");
                    child.complete(Err(parent_rejected(&hash)));
                }

                if e.is_fatal() {
                    error!(error = %e, "Halting block ingestion");
                    state.halted = true;
                    let queued: Vec<InFlightBlock> = self.lock_queue().blocks.drain(..).collect();
                    for mut queued in queued {
                        queued.complete(Err(ChainError::Halted));
                    }
                }
                ctx.complete(Err(e));
            }
        }
    }

    /// Put released orphans back in line: in front when their parent became
    /// the tip, at the back otherwise.
    fn requeue(&self, children: Vec<InFlightBlock>, front: bool) {
        if children.is_empty() {
            return;
        }
        let mut queue = self.lock_queue();
        if front {
            for child in children.into_iter().rev() {
                queue.blocks.push_front(child);
            }
        } else {
            queue.blocks.extend(children);
        }
    }

    async fn run_pipeline(
        &self,
        state: &mut ChainState,
        ctx: &mut InFlightBlock,
    ) -> Result<Disposition> {
        ctx.advance(Stage::Classifying);
        if state.recent_blocks.contains(&ctx.hash()) {
            return Ok(Disposition::Duplicate);
        }

        let tip = state.top.clone().ok_or(ChainError::NotInitialized)?;
        let classification = classify(
            &ctx.block,
            &tip,
            &state.pending,
            &state.recent_blocks,
            self.store.as_ref(),
        )
        .await?;
        let mode = classification.mode();
        ctx.mode = Some(mode);
        state.last_received = Some(ctx.block.clone());
        debug!(block = %display_hash(&ctx.hash()), ?mode, "Classified");

        let parent = match classification {
            Classification::Main(parent) => {
                ctx.advance(Stage::MainConnect);
                parent
            }
            Classification::Side(parent) => {
                ctx.advance(Stage::SideConnect);
                parent
            }
            Classification::OrphanOfPending | Classification::OrphanHead => {
                ctx.advance(Stage::Orphaned);
                return Ok(Disposition::Orphan);
            }
            Classification::Discard => {
                ctx.advance(Stage::Discarded);
                return Ok(Disposition::Discard);
            }
        };

        ctx.block.attach_to(&parent);
        ctx.block.tx_hashes = ctx.txs.iter().map(|tx| tx.txid()).collect();
        ctx.parent = Some(parent.clone());
        self.verify_header(state, &ctx.block, &parent).await?;
        check_checkpoint(&ctx.block, &self.params.checkpoints)?;

        // A side block is checked against its own branch, not the active chain.
        let plan = match mode {
            BlockMode::Side => Some(
                find_fork(
                    &tip,
                    &parent,
                    &state.recent_blocks,
                    self.store.as_ref(),
                    self.params.max_fork_depth,
                )
                .await?,
            ),
            _ => None,
        };
        let branch = match &plan {
            Some(plan) => BranchView::from_plan(plan, self.store.as_ref()).await?,
            None => BranchView::active(&tip),
        };

        ctx.advance(Stage::VerifyingTransactions);
        let verified = TxVerifier::new(self.store.as_ref(), self.scripts.as_ref())
            .with_recent(&state.recent_txs)
            .with_branch(&branch)
            .skip_scripts(self.is_trusted_height(ctx.block.height))
            .live_accounting(self.params.live_accounting)
            .verify_block(&ctx.txs, ctx.block.height)
            .await?;

        let is_tip = mode == BlockMode::Main || ctx.block.more_work_than(&tip);
        let reorganized = plan.is_some() && is_tip;
        match plan {
            Some(plan) if is_tip => {
                ctx.advance(Stage::Reorganizing);
                self.reorganize(state, &tip, &plan).await?;
            }
            Some(_) => info!(block = %ctx.block, "Side chain block"),
            None => {}
        }

        ctx.advance(Stage::Committing);
        ctx.block.active = is_tip;
        self.commit(state, &ctx.block, &ctx.txs, &verified).await?;

        Ok(Disposition::Committed {
            mode,
            height: ctx.block.height,
            reorganized,
            is_tip,
        })
    }

    /// Difficulty and median-time checks against the block's actual branch.
    async fn verify_header(&self, state: &ChainState, block: &Block, parent: &Block) -> Result<()> {
        let mut timestamps = vec![parent.header.timestamp];
        let mut cursor = parent.clone();
        while timestamps.len() < MEDIAN_TIME_SPAN && cursor.height > 0 {
            match load_parent(&cursor, &state.recent_blocks, self.store.as_ref()).await? {
                Some(ancestor) => {
                    timestamps.push(ancestor.header.timestamp);
                    cursor = ancestor;
                }
                None => break,
            }
        }

        let period_start = if is_retarget_height(block.height) {
            let start_height = block.height.saturating_sub(RETARGET_INTERVAL);
            self.ancestor_at(state, parent, start_height).await?
        } else {
            None
        };

        verify_child(
            block,
            parent,
            period_start.as_ref().map(|b| &b.header),
            &timestamps,
            &self.pow_limit,
        )
    }

    /// Ancestor of `from` (inclusive) at `height`.
    async fn ancestor_at(&self, state: &ChainState, from: &Block, height: u64) -> Result<Option<Block>> {
        if from.height < height {
            return Ok(None);
        }
        if from.active {
            return Ok(self.store.get_block_by_height(height).await?);
        }

        let mut cursor = from.clone();
        while cursor.height > height {
            match load_parent(&cursor, &state.recent_blocks, self.store.as_ref()).await? {
                Some(parent) => cursor = parent,
                None => return Ok(None),
            }
        }
        Ok(Some(cursor))
    }

    /// Switch the active chain from `old_tip` to the new branch of `plan`.
    async fn reorganize(&self, state: &mut ChainState, old_tip: &Block, plan: &ForkPlan) -> Result<()> {
        let result = Reorganizer::new(self.store.as_ref(), &self.events, self.params.live_accounting)
            .reorganize(plan)
            .await?;

        for block in result.disconnected.iter().chain(&result.connected) {
            state.recent_blocks.update(&block.hash, |cached| cached.active = block.active);
        }
        let top = result
            .connected
            .last()
            .cloned()
            .unwrap_or_else(|| result.fork_point.clone());
        info!(
            old_tip = %old_tip,
            new_tip = %top,
            depth = result.depth(),
            "Reorganized"
        );
        state.top = Some(top);
        Ok(())
    }

    /// Persist a verified block and move the tip if it is now active.
    async fn commit(
        &self,
        state: &mut ChainState,
        block: &Block,
        txs: &[Transaction],
        verified: &[VerifiedTransaction],
    ) -> Result<()> {
        for (tx, result) in txs.iter().zip(verified) {
            self.events.emit(ChainEvent::TxAdd {
                txid: result.txid,
                tx: tx.clone(),
                block: block.hash,
            });
            for key in &result.affected_keys {
                self.events.emit(ChainEvent::TxAddKeyed {
                    key: *key,
                    txid: result.txid,
                    block: block.hash,
                });
            }
        }

        self.store.save_transactions(&block.hash, txs).await?;
        for result in verified {
            self.events.emit(ChainEvent::TxSave {
                txid: result.txid,
                block: block.hash,
            });
        }

        self.events.emit(ChainEvent::BlockAdd(block.clone()));
        self.store.save_block(block).await?;

        if block.active {
            if let Err(e) = self.store.connect_transactions(txs).await {
                let mut reverted = block.clone();
                reverted.active = false;
                if let Err(revert) = self.store.save_block(&reverted).await {
                    error!(block = %block, error = %revert, "Could not deactivate block after failed spend update");
                }
                return Err(e.into());
            }
        }
        self.events.emit(ChainEvent::BlockSave(block.clone()));

        if block.active {
            state.top = Some(block.clone());
        }
        state.recent_blocks.put(block.hash, block.clone());
        for (tx, result) in txs.iter().zip(verified) {
            state.recent_txs.put(result.txid, tx.clone());
        }
        debug!(block = %block, active = block.active, "Committed");
        Ok(())
    }

    /// Blocks at or below the last checkpoint height skip script evaluation.
    /// The checkpointed block itself is already pinned by hash.
    fn is_trusted_height(&self, height: u64) -> bool {
        self.params
            .last_checkpoint()
            .map_or(false, |checkpoint| height <= checkpoint.height)
    }

    /// Whether the tip has reached the last checkpoint (or there is none).
    pub async fn is_past_checkpoints(&self) -> bool {
        let Some(checkpoint) = self.params.last_checkpoint() else {
            return true;
        };
        let state = self.state.lock().await;
        state.top.as_ref().map_or(false, |top| top.height >= checkpoint.height)
    }

    /// Verify a loose transaction against the active chain.
    pub async fn verify_transaction(&self, tx: &Transaction) -> Result<VerifiedTransaction> {
        check_transaction(tx)?;
        let state = self.state.lock().await;
        let top = state.top.as_ref().ok_or(ChainError::NotInitialized)?;
        let branch = BranchView::active(top);
        TxVerifier::new(self.store.as_ref(), self.scripts.as_ref())
            .with_recent(&state.recent_txs)
            .with_branch(&branch)
            .live_accounting(self.params.live_accounting)
            .verify(tx, &TransactionMap::new())
            .await
    }

    pub async fn get_genesis_block(&self) -> Option<Block> {
        self.state.lock().await.genesis.clone()
    }

    pub async fn get_top_block(&self) -> Option<Block> {
        self.state.lock().await.top.clone()
    }

    pub async fn get_last_received_block(&self) -> Option<Block> {
        self.state.lock().await.last_received.clone()
    }

    pub async fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>> {
        let state = self.state.lock().await;
        if let Some(block) = state.recent_blocks.get(hash) {
            return Ok(Some(block));
        }
        Ok(self.store.get_block_by_hash(hash).await?)
    }

    pub async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        Ok(self.store.get_block_by_height(height).await?)
    }

    pub async fn get_block_by_prev(&self, prev: &Hash) -> Result<Option<Block>> {
        Ok(self.store.get_block_by_prev(prev).await?)
    }

    /// Known transactions among `hashes`, recent commits first.
    pub async fn get_transactions_by_hashes(&self, hashes: &[Hash]) -> Result<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut found = Vec::with_capacity(hashes.len());
        let mut missing = Vec::new();
        for hash in hashes {
            match state.recent_txs.get(hash) {
                Some(tx) => found.push(tx),
                None => missing.push(*hash),
            }
        }
        if !missing.is_empty() {
            found.extend(self.store.get_transactions_by_hashes(&missing).await?);
        }
        Ok(found)
    }

    /// Pending, recently committed or stored.
    pub async fn knows_block(&self, hash: &Hash) -> Result<bool> {
        let state = self.state.lock().await;
        if state.pending.contains(hash) || state.recent_blocks.contains(hash) {
            return Ok(true);
        }
        Ok(self.store.get_block_by_hash(hash).await?.is_some())
    }

    pub async fn knows_transaction(&self, hash: &Hash) -> Result<bool> {
        let state = self.state.lock().await;
        if state.recent_txs.contains(hash) {
            return Ok(true);
        }
        Ok(self.store.knows_transaction(hash).await?)
    }

    /// Whether `hash` is parked waiting for its parent.
    pub async fn is_orphan(&self, hash: &Hash) -> bool {
        self.state.lock().await.pending.is_parked(hash)
    }

    pub async fn get_orphan_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Blocks waiting in the ingestion queue.
    pub fn get_queue_count(&self) -> usize {
        self.lock_queue().blocks.len()
    }

    pub async fn is_halted(&self) -> bool {
        self.state.lock().await.halted
    }

    pub async fn get_block_locator(&self) -> Result<Vec<Hash>> {
        let state = self.state.lock().await;
        let top = state.top.clone().ok_or(ChainError::NotInitialized)?;
        build_locator(self.store.as_ref(), &top).await
    }

    pub async fn get_block_by_locator(&self, locator: &[Hash]) -> Result<Option<Block>> {
        let _state = self.state.lock().await;
        resolve_locator(self.store.as_ref(), locator).await
    }
}

/// Orphans waiting on `ctx`: heads parked on its hash and children attached
/// to it while it was parked itself.
fn release_waiting(pending: &mut PendingIndex, ctx: &mut InFlightBlock) -> Vec<InFlightBlock> {
    let mut waiting = pending.take_by_parent_hash(&ctx.hash());
    waiting.extend(pending.take_children(ctx));
    waiting
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::AcceptAllVerifier;
    use crate::storage::MemoryStore;

    fn chain() -> BlockChain {
        BlockChain::new(
            ChainParams::unitnet(),
            Arc::new(MemoryStore::new()),
            Arc::new(AcceptAllVerifier),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_before_init() {
        let chain = chain();
        let genesis = chain.params().genesis_block();
        let err = chain.submit(genesis, Vec::new()).await.unwrap_err();
        assert!(matches!(err, ChainError::NotInitialized));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let first = BlockChain::new(ChainParams::unitnet(), store.clone(), Arc::new(AcceptAllVerifier))
            .unwrap();
        let top = first.init().await.unwrap();
        assert_eq!(top.height, 0);

        let second = BlockChain::new(ChainParams::unitnet(), store, Arc::new(AcceptAllVerifier))
            .unwrap();
        assert_eq!(second.init().await.unwrap(), top);
        assert_eq!(second.get_genesis_block().await.unwrap().hash, top.hash);
    }

    #[tokio::test]
    async fn test_init_emits_event() {
        let chain = chain();
        let mut events = chain.subscribe();
        let top = chain.init().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ChainEvent::InitComplete(top));
    }

    #[tokio::test]
    async fn test_genesis_resubmission_fails_proof_of_work() {
        let chain = chain();
        chain.init().await.unwrap();
        let genesis = chain.params().genesis_block();
        let txs = vec![chain.params().genesis.coinbase.clone()];
        // Unitnet genesis keeps the livenet nonce.
        assert!(chain.submit(genesis, txs).await.is_err());
    }

    #[test]
    fn test_trusted_height() {
        let mut params = ChainParams::unitnet();
        params.checkpoints = vec![crate::types::Checkpoint { height: 10, hash: [1; 32] }];
        let chain = BlockChain::new(params, Arc::new(MemoryStore::new()), Arc::new(AcceptAllVerifier))
            .unwrap();
        assert!(chain.is_trusted_height(10));
        assert!(!chain.is_trusted_height(11));
        assert!(!self::chain().is_trusted_height(0));
    }
}
