//! Transaction validation
//!
//! Intrinsic checks need nothing but the transaction. Contextual checks go
//! through [`TxVerifier`], which resolves input sources against in-block
//! siblings, recently committed transactions and storage.

use crate::cache::RecentCache;
use crate::constants::*;
use crate::economic::check_coinbase_value;
use crate::error::{ChainError, Result};
use crate::events::EventKey;
use crate::fork::BranchView;
use crate::script::{extract_pubkey_hash, ScriptVerifier};
use crate::storage::ChainStore;
use crate::types::*;
use std::collections::{HashMap, HashSet};

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// A transaction tx = (v, ins, outs, lt) is valid if and only if:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. ∀o ∈ outs: o.value ≤ M_max, and Σ o.value ≤ M_max
/// 3. no outpoint is spent twice within tx
/// 4. coinbase: 2 ≤ |scriptSig| ≤ 100; otherwise no input spends the null outpoint
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(ChainError::violation("Empty inputs or outputs"));
    }

    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value > MAX_MONEY {
            return Err(ChainError::violation(format!(
                "Invalid output value {} at index {}",
                output.value, i
            )));
        }
    }
    if tx.total_output_value() > MAX_MONEY as u128 {
        return Err(ChainError::violation("Total output value out of range"));
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(ChainError::violation("Duplicate input"));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(ChainError::violation(format!("Coinbase script length {}", len)));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(ChainError::violation("Null prevout in non-coinbase transaction"));
    }

    Ok(())
}

/// Transactions already accepted in the same block or batch, by hash.
#[derive(Debug, Default, Clone)]
pub struct TransactionMap {
    txs: HashMap<Hash, Transaction>,
}

impl TransactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tx: Transaction) -> Hash {
        let txid = tx.txid();
        self.txs.insert(txid, tx);
        txid
    }

    pub fn get(&self, hash: &Hash) -> Option<&Transaction> {
        self.txs.get(hash)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

/// Outcome of a successful contextual verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTransaction {
    pub txid: Hash,
    pub fee: u64,
    /// Keys for per-key notifications. Empty unless live accounting is on.
    pub affected_keys: Vec<EventKey>,
}

/// Contextual transaction verification.
pub struct TxVerifier<'a> {
    store: &'a dyn ChainStore,
    scripts: &'a dyn ScriptVerifier,
    recent: Option<&'a RecentCache<Transaction>>,
    branch: Option<&'a BranchView>,
    check_scripts: bool,
    live_accounting: bool,
}

impl<'a> TxVerifier<'a> {
    pub fn new(store: &'a dyn ChainStore, scripts: &'a dyn ScriptVerifier) -> Self {
        TxVerifier {
            store,
            scripts,
            recent: None,
            branch: None,
            check_scripts: true,
            live_accounting: false,
        }
    }

    /// Consult recently committed transactions before storage.
    pub fn with_recent(mut self, recent: &'a RecentCache<Transaction>) -> Self {
        self.recent = Some(recent);
        self
    }

    /// Only accept sources and spends that lie on `branch`.
    pub fn with_branch(mut self, branch: &'a BranchView) -> Self {
        self.branch = Some(branch);
        self
    }

    /// Skip script evaluation, e.g. for blocks below the last checkpoint.
    pub fn skip_scripts(mut self, skip: bool) -> Self {
        self.check_scripts = !skip;
        self
    }

    pub fn live_accounting(mut self, enabled: bool) -> Self {
        self.live_accounting = enabled;
        self
    }

    /// Look up every source transaction referenced by `tx`.
    ///
    /// Siblings win over the recent cache, which wins over storage. The first
    /// hash that none of them knows is reported as [`ChainError::MissingSource`].
    pub async fn resolve_sources(
        &self,
        tx: &Transaction,
        siblings: &TransactionMap,
    ) -> Result<HashMap<Hash, Transaction>> {
        let mut sources = HashMap::new();
        let mut wanted = Vec::new();

        for input in &tx.inputs {
            let hash = input.prevout.hash;
            if sources.contains_key(&hash) || wanted.contains(&hash) {
                continue;
            }
            if let Some(source) = siblings.get(&hash) {
                sources.insert(hash, source.clone());
            } else if let Some(source) = self.recent.and_then(|r| r.get(&hash)) {
                sources.insert(hash, source);
            } else {
                wanted.push(hash);
            }
        }

        if !wanted.is_empty() {
            for source in self.store.get_transactions_by_hashes(&wanted).await? {
                sources.insert(source.txid(), source);
            }
        }

        for input in &tx.inputs {
            if !sources.contains_key(&input.prevout.hash) {
                return Err(ChainError::MissingSource { hash: input.prevout.hash });
            }
        }
        Ok(sources)
    }

    /// Verify a non-coinbase transaction against its sources.
    ///
    /// 1. every source is known and has the referenced output
    /// 2. with a branch set, every source outside the block lies on it
    /// 3. every unlocking script satisfies its locking script
    /// 4. no referenced output is already spent by a different transaction
    /// 5. Σ inputs ≥ Σ outputs
    pub async fn verify(
        &self,
        tx: &Transaction,
        siblings: &TransactionMap,
    ) -> Result<VerifiedTransaction> {
        let txid = tx.txid();
        if tx.is_coinbase() {
            return Err(ChainError::violation(
                "Coinbase transaction is only valid as the first transaction of a block",
            ));
        }

        let sources = self.resolve_sources(tx, siblings).await?;

        let mut spent_outputs = Vec::with_capacity(tx.inputs.len());
        for (i, input) in tx.inputs.iter().enumerate() {
            let source = &sources[&input.prevout.hash];
            let output = source.outputs.get(input.prevout.index as usize).ok_or_else(|| {
                ChainError::violation(format!(
                    "Input {} references output {} of {} which has only {}",
                    i,
                    input.prevout.index,
                    display_hash(&input.prevout.hash),
                    source.outputs.len()
                ))
            })?;
            spent_outputs.push(output);
        }

        if let Some(branch) = self.branch {
            for hash in sources.keys().filter(|hash| siblings.get(hash).is_none()) {
                if !self.is_on_branch(hash, branch).await? {
                    return Err(ChainError::violation(format!(
                        "Source {} of {} is not on this block's branch",
                        display_hash(hash),
                        display_hash(&txid)
                    )));
                }
            }
        }

        if self.check_scripts {
            for (i, (input, output)) in tx.inputs.iter().zip(&spent_outputs).enumerate() {
                if !self.scripts.verify(&input.script_sig, &output.script_pubkey, tx, i, SIGHASH_ALL) {
                    return Err(ChainError::violation(format!(
                        "Script evaluation failed for input {} of {}",
                        i,
                        display_hash(&txid)
                    )));
                }
            }
        }

        let mut outpoints: Vec<OutPoint> = tx.inputs.iter().map(|input| input.prevout).collect();
        let mut conflicts = 0;
        if let Some(branch) = self.branch {
            outpoints.retain(|outpoint| match branch.spent.get(outpoint) {
                Some(spender) => {
                    if spender != &txid {
                        conflicts += 1;
                    }
                    false
                }
                None => !branch.released.contains(outpoint),
            });
        }
        if !outpoints.is_empty() {
            conflicts += self.store.count_conflicting_transactions(&outpoints, &txid).await?;
        }
        if conflicts > 0 {
            return Err(ChainError::violation(format!(
                "Transaction {} double-spends {} output(s)",
                display_hash(&txid),
                conflicts
            )));
        }

        let value_in: u128 = spent_outputs.iter().map(|o| o.value as u128).sum();
        let value_out = tx.total_output_value();
        if value_out > value_in {
            return Err(ChainError::violation(format!(
                "Transaction {} spends {} but its inputs only provide {}",
                display_hash(&txid),
                value_out,
                value_in
            )));
        }
        let fee = u64::try_from(value_in - value_out)
            .ok()
            .filter(|fee| *fee <= MAX_MONEY)
            .ok_or_else(|| ChainError::violation("Fee out of range"))?;

        let affected_keys = if self.live_accounting {
            affected_keys(txid, spent_outputs.iter().copied().chain(&tx.outputs))
        } else {
            Vec::new()
        };

        Ok(VerifiedTransaction { txid, fee, affected_keys })
    }

    async fn is_on_branch(&self, txid: &Hash, branch: &BranchView) -> Result<bool> {
        for block_hash in self.store.get_transaction_blocks(txid).await? {
            if let Some(block) = self.store.get_block_by_hash(&block_hash).await? {
                if branch.contains(&block) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Verify the full body of a block at `height`.
    ///
    /// Transactions are checked in order; each may spend outputs of earlier
    /// ones. Two transactions of one block may not spend the same outpoint.
    /// The coinbase (first transaction) may claim at most subsidy plus fees.
    /// The returned list is in block order, coinbase first.
    pub async fn verify_block(
        &self,
        txs: &[Transaction],
        height: u64,
    ) -> Result<Vec<VerifiedTransaction>> {
        let Some((coinbase, rest)) = txs.split_first() else {
            return Err(ChainError::violation("Block has no transactions"));
        };

        let mut siblings = TransactionMap::new();
        let coinbase_id = siblings.insert(coinbase.clone());

        let mut spent_in_block = HashSet::new();
        let mut verified = Vec::with_capacity(txs.len());
        let mut fees: u128 = 0;

        for tx in rest {
            for input in &tx.inputs {
                if !spent_in_block.insert(input.prevout) {
                    return Err(ChainError::violation(format!(
                        "Output {}:{} spent twice in block",
                        display_hash(&input.prevout.hash),
                        input.prevout.index
                    )));
                }
            }

            let result = self.verify(tx, &siblings).await?;
            fees += result.fee as u128;
            siblings.insert(tx.clone());
            verified.push(result);
        }

        check_coinbase_value(coinbase, height, fees)?;

        let coinbase_keys = if self.live_accounting {
            affected_keys(coinbase_id, coinbase.outputs.iter())
        } else {
            Vec::new()
        };
        verified.insert(
            0,
            VerifiedTransaction {
                txid: coinbase_id,
                fee: 0,
                affected_keys: coinbase_keys,
            },
        );
        Ok(verified)
    }
}

/// Transaction hash followed by the distinct pubkey hashes of `outputs`.
pub fn affected_keys<'o>(
    txid: Hash,
    outputs: impl Iterator<Item = &'o TransactionOutput>,
) -> Vec<EventKey> {
    let mut keys = vec![EventKey::TxHash(txid)];
    for output in outputs {
        if let Some(hash) = extract_pubkey_hash(&output.script_pubkey) {
            let key = EventKey::PubKeyHash(hash);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{p2pkh_script, AcceptAllVerifier};
    use crate::storage::MemoryStore;

    struct RejectAll;

    impl ScriptVerifier for RejectAll {
        fn verify(&self, _: &[u8], _: &[u8], _: &Transaction, _: usize, _: u32) -> bool {
            false
        }
    }

    fn coinbase(value: u64, tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint { hash: NULL_HASH, index: COINBASE_INDEX },
                script_sig: vec![0x01, tag],
                sequence: 0xffffffff,
            }],
            outputs: vec![TransactionOutput { value, script_pubkey: p2pkh_script(&[tag; 20]) }],
            lock_time: 0,
        }
    }

    fn spend(source: &Transaction, index: u32, value: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint { hash: source.txid(), index },
                script_sig: vec![0x51],
                sequence: 0xffffffff,
            }],
            outputs: vec![TransactionOutput { value, script_pubkey: p2pkh_script(&[0xbb; 20]) }],
            lock_time: 0,
        }
    }

    async fn stored(store: &MemoryStore, txs: &[Transaction]) {
        store.save_transactions(&[0xee; 32], txs).await.unwrap();
    }

    #[test]
    fn test_check_transaction_valid() {
        assert!(check_transaction(&coinbase(50, 1)).is_ok());
        assert!(check_transaction(&spend(&coinbase(50, 1), 0, 10)).is_ok());
    }

    #[test]
    fn test_check_transaction_empty() {
        let mut tx = coinbase(50, 1);
        tx.outputs.clear();
        assert!(check_transaction(&tx).is_err());

        let mut tx = spend(&coinbase(50, 1), 0, 10);
        tx.inputs.clear();
        assert!(check_transaction(&tx).is_err());
    }

    #[test]
    fn test_check_transaction_value_range() {
        let mut tx = coinbase(MAX_MONEY + 1, 1);
        assert!(check_transaction(&tx).is_err());

        tx.outputs = vec![tx.outputs[0].clone(), tx.outputs[0].clone()];
        tx.outputs[0].value = MAX_MONEY;
        tx.outputs[1].value = 1;
        assert!(check_transaction(&tx).is_err());
    }

    #[test]
    fn test_check_transaction_duplicate_input() {
        let mut tx = spend(&coinbase(50, 1), 0, 10);
        tx.inputs.push(tx.inputs[0].clone());
        assert!(check_transaction(&tx).is_err());
    }

    #[test]
    fn test_check_transaction_coinbase_script_length() {
        let mut tx = coinbase(50, 1);
        tx.inputs[0].script_sig = vec![0x01];
        assert!(check_transaction(&tx).is_err());
        tx.inputs[0].script_sig = vec![0; 101];
        assert!(check_transaction(&tx).is_err());
    }

    #[tokio::test]
    async fn test_verify_spend_from_storage() {
        let store = MemoryStore::new();
        let source = coinbase(5000, 1);
        stored(&store, &[source.clone()]).await;

        let tx = spend(&source, 0, 4000);
        let verifier = TxVerifier::new(&store, &AcceptAllVerifier);
        let result = verifier.verify(&tx, &TransactionMap::new()).await.unwrap();

        assert_eq!(result.txid, tx.txid());
        assert_eq!(result.fee, 1000);
        assert!(result.affected_keys.is_empty());
    }

    #[tokio::test]
    async fn test_verify_missing_source() {
        let store = MemoryStore::new();
        let source = coinbase(5000, 1);
        let tx = spend(&source, 0, 4000);

        let verifier = TxVerifier::new(&store, &AcceptAllVerifier);
        let err = verifier.verify(&tx, &TransactionMap::new()).await.unwrap_err();
        match err {
            ChainError::MissingSource { hash } => assert_eq!(hash, source.txid()),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_verify_prefers_siblings_and_recent() {
        let store = MemoryStore::new();
        let from_sibling = coinbase(100, 1);
        let from_recent = coinbase(100, 2);

        let mut siblings = TransactionMap::new();
        siblings.insert(from_sibling.clone());
        let mut recent = RecentCache::new(4);
        recent.put(from_recent.txid(), from_recent.clone());

        let mut tx = spend(&from_sibling, 0, 150);
        tx.inputs.push(spend(&from_recent, 0, 0).inputs[0].clone());

        let verifier = TxVerifier::new(&store, &AcceptAllVerifier).with_recent(&recent);
        let result = verifier.verify(&tx, &siblings).await.unwrap();
        assert_eq!(result.fee, 50);
    }

    #[tokio::test]
    async fn test_verify_output_index_out_of_range() {
        let store = MemoryStore::new();
        let source = coinbase(5000, 1);
        stored(&store, &[source.clone()]).await;

        let verifier = TxVerifier::new(&store, &AcceptAllVerifier);
        let err = verifier
            .verify(&spend(&source, 1, 10), &TransactionMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::ConsensusViolation(_)));
    }

    #[tokio::test]
    async fn test_verify_outputs_exceed_inputs() {
        let store = MemoryStore::new();
        let source = coinbase(5000, 1);
        stored(&store, &[source.clone()]).await;

        let verifier = TxVerifier::new(&store, &AcceptAllVerifier);
        let err = verifier
            .verify(&spend(&source, 0, 5001), &TransactionMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::ConsensusViolation(_)));
    }

    #[tokio::test]
    async fn test_verify_double_spend() {
        let store = MemoryStore::new();
        let source = coinbase(5000, 1);
        stored(&store, &[source.clone()]).await;

        let first = spend(&source, 0, 4000);
        store.connect_transactions(&[first.clone()]).await.unwrap();

        let verifier = TxVerifier::new(&store, &AcceptAllVerifier);
        // The recorded spender itself is not a conflict.
        assert!(verifier.verify(&first, &TransactionMap::new()).await.is_ok());

        let second = spend(&source, 0, 3000);
        let err = verifier.verify(&second, &TransactionMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("double-spends"));
    }

    #[tokio::test]
    async fn test_verify_script_failure_and_skip() {
        let store = MemoryStore::new();
        let source = coinbase(5000, 1);
        stored(&store, &[source.clone()]).await;
        let tx = spend(&source, 0, 10);

        let strict = TxVerifier::new(&store, &RejectAll);
        assert!(strict.verify(&tx, &TransactionMap::new()).await.is_err());

        let trusted = TxVerifier::new(&store, &RejectAll).skip_scripts(true);
        assert!(trusted.verify(&tx, &TransactionMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_rejects_loose_coinbase() {
        let store = MemoryStore::new();
        let verifier = TxVerifier::new(&store, &AcceptAllVerifier);
        assert!(verifier.verify(&coinbase(1, 1), &TransactionMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_live_accounting_keys() {
        let store = MemoryStore::new();
        let source = coinbase(5000, 0xaa);
        stored(&store, &[source.clone()]).await;

        let tx = spend(&source, 0, 10);
        let verifier = TxVerifier::new(&store, &AcceptAllVerifier).live_accounting(true);
        let result = verifier.verify(&tx, &TransactionMap::new()).await.unwrap();

        assert_eq!(
            result.affected_keys,
            vec![
                EventKey::TxHash(tx.txid()),
                EventKey::PubKeyHash([0xaa; 20]),
                EventKey::PubKeyHash([0xbb; 20]),
            ]
        );
    }

    #[tokio::test]
    async fn test_verify_block_chained_spends_and_fees() {
        let store = MemoryStore::new();
        let funding = coinbase(5000, 1);
        stored(&store, &[funding.clone()]).await;

        let a = spend(&funding, 0, 4000);
        let b = spend(&a, 0, 3500);
        let block = vec![coinbase(INITIAL_SUBSIDY + 1500, 2), a, b];

        let verifier = TxVerifier::new(&store, &AcceptAllVerifier);
        let verified = verifier.verify_block(&block, 1).await.unwrap();
        assert_eq!(verified.len(), 3);
        assert_eq!(verified[0].txid, block[0].txid());
        assert_eq!(verified[1].fee + verified[2].fee, 1500);

        let mut greedy = block.clone();
        greedy[0] = coinbase(INITIAL_SUBSIDY + 1501, 2);
        assert!(verifier.verify_block(&greedy, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_verify_block_spend_of_later_tx_is_missing() {
        let store = MemoryStore::new();
        let funding = coinbase(5000, 1);
        stored(&store, &[funding.clone()]).await;

        let a = spend(&funding, 0, 4000);
        let b = spend(&a, 0, 3500);
        let block = vec![coinbase(INITIAL_SUBSIDY, 2), b, a];

        let verifier = TxVerifier::new(&store, &AcceptAllVerifier);
        let err = verifier.verify_block(&block, 1).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_verify_block_intra_block_double_spend() {
        let store = MemoryStore::new();
        let funding = coinbase(5000, 1);
        stored(&store, &[funding.clone()]).await;

        let a = spend(&funding, 0, 4000);
        let b = spend(&funding, 0, 3000);
        let block = vec![coinbase(INITIAL_SUBSIDY, 2), a, b];

        let verifier = TxVerifier::new(&store, &AcceptAllVerifier);
        let err = verifier.verify_block(&block, 1).await.unwrap_err();
        assert!(err.to_string().contains("spent twice"));
    }

    fn block_at(height: u64, nonce: u32, active: bool) -> Block {
        let mut block = Block::new(BlockHeader {
            version: 1,
            prev_block_hash: NULL_HASH,
            merkle_root: [0; 32],
            timestamp: 0,
            bits: 0x207fffff,
            nonce,
        });
        block.height = height;
        block.active = active;
        block
    }

    #[tokio::test]
    async fn test_verify_sources_must_be_on_branch() {
        let store = MemoryStore::new();
        let base = block_at(0, 0, true);
        let side = block_at(1, 1, false);
        let funding = coinbase(5000, 1);
        let side_coinbase = coinbase(5000, 2);
        store.save_block(&base).await.unwrap();
        store.save_block(&side).await.unwrap();
        store.save_transactions(&base.hash, &[funding.clone()]).await.unwrap();
        store.save_transactions(&side.hash, &[side_coinbase.clone()]).await.unwrap();

        let view = BranchView::active(&base);
        let verifier = TxVerifier::new(&store, &AcceptAllVerifier).with_branch(&view);
        assert!(verifier.verify(&spend(&funding, 0, 10), &TransactionMap::new()).await.is_ok());

        let err = verifier
            .verify(&spend(&side_coinbase, 0, 10), &TransactionMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not on this block's branch"));

        let mut on_side = BranchView::active(&base);
        on_side.connected.insert(side.hash);
        let verifier = TxVerifier::new(&store, &AcceptAllVerifier).with_branch(&on_side);
        assert!(verifier.verify(&spend(&side_coinbase, 0, 10), &TransactionMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_branch_spends() {
        let store = MemoryStore::new();
        let base = block_at(0, 0, true);
        let funding = coinbase(5000, 1);
        store.save_block(&base).await.unwrap();
        store.save_transactions(&base.hash, &[funding.clone()]).await.unwrap();

        let active_spend = spend(&funding, 0, 4000);
        store.connect_transactions(&[active_spend.clone()]).await.unwrap();
        let outpoint = active_spend.inputs[0].prevout;
        let tx = spend(&funding, 0, 3000);

        // Spent by an active block the branch disconnects: free again.
        let mut view = BranchView::active(&base);
        view.released.insert(outpoint);
        let verifier = TxVerifier::new(&store, &AcceptAllVerifier).with_branch(&view);
        assert!(verifier.verify(&tx, &TransactionMap::new()).await.is_ok());

        // Spent earlier on the branch itself.
        view.spent.insert(outpoint, [0x42; 32]);
        let verifier = TxVerifier::new(&store, &AcceptAllVerifier).with_branch(&view);
        let err = verifier.verify(&tx, &TransactionMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("double-spends"));

        // Without the release the active spend still conflicts.
        let view = BranchView::active(&base);
        let verifier = TxVerifier::new(&store, &AcceptAllVerifier).with_branch(&view);
        assert!(verifier.verify(&tx, &TransactionMap::new()).await.is_err());
    }
}
