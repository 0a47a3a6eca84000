use super::{StructuralError, ValidationError};
use crate::ledger::{ChainView, Transaction};
use crate::proof::Proof;
use crate::store::LocalStore;
use parking_lot::Mutex;
use scaleout_common::{ContentHash, NodeId};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Checks incoming proofs against local knowledge.
///
/// Verdicts on individual transactions are kept across proofs so shared
/// history is walked once and dependents of an invalid transaction fail
/// fast. Each proof is verified in a session whose findings reach the shared
/// cache only when the session ends.
pub struct Verification {
    cache: Mutex<HashMap<ContentHash, bool>>,
    received: Mutex<HashSet<ContentHash>>,
}

impl Verification {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            received: Mutex::new(HashSet::new()),
        }
    }

    /// Cached verdict for a transaction
    pub fn cached(&self, hash: &ContentHash) -> Option<bool> {
        self.cache.lock().get(hash).copied()
    }

    pub fn was_received(&self, hash: &ContentHash) -> bool {
        self.received.lock().contains(hash)
    }

    /// Verify the transaction of `proof` together with its whole history.
    ///
    /// A transaction is accepted at most once. When the failure may go away
    /// later (not final yet, history missing) the same proof can be
    /// delivered again.
    pub fn validate_new_message(
        &self,
        proof: &Proof,
        store: &LocalStore,
    ) -> Result<(), ValidationError> {
        let transaction = proof.transaction();
        let hash = transaction.hash();
        if !self.received.lock().insert(hash) {
            return Err(ValidationError::Replay {
                transaction: transaction.to_string(),
            });
        }

        let mut session = Session::new(self, store, proof);
        let result = session
            .check_views()
            .and_then(|()| session.validate(transaction));

        match &result {
            Ok(()) => {
                let mut cache = self.cache.lock();
                cache.extend(session.local.drain());
            }
            Err(err) => {
                if err.is_intrinsic() {
                    let mut cache = self.cache.lock();
                    cache.extend(session.local.drain());
                    cache.extend(session.invalid.drain(..).map(|hash| (hash, false)));
                } else {
                    self.received.lock().remove(&hash);
                }
                warn!(
                    node = %store.own_id(),
                    transaction = %transaction,
                    error = %err,
                    "Rejected proof"
                );
            }
        }
        result
    }
}

impl Default for Verification {
    fn default() -> Self {
        Self::new()
    }
}

/// State of one proof verification
struct Session<'a> {
    verification: &'a Verification,
    store: &'a LocalStore,
    proof: &'a Proof,
    views: HashMap<NodeId, ChainView>,
    local: HashMap<ContentHash, bool>,
    in_progress: HashSet<ContentHash>,
    invalid: Vec<ContentHash>,
}

impl<'a> Session<'a> {
    fn new(verification: &'a Verification, store: &'a LocalStore, proof: &'a Proof) -> Self {
        Self {
            verification,
            store,
            proof,
            views: HashMap::new(),
            local: HashMap::new(),
            in_progress: HashSet::new(),
            invalid: Vec::new(),
        }
    }

    /// Every claimed update must fit the chain it extends, whether or not
    /// the transaction ends up needing it
    fn check_views(&mut self) -> Result<(), ValidationError> {
        for owner in self.proof.chain_updates().keys() {
            self.view(*owner)?;
        }
        Ok(())
    }

    fn verdict(&self, hash: &ContentHash) -> Option<bool> {
        self.local
            .get(hash)
            .copied()
            .or_else(|| self.verification.cached(hash))
    }

    /// Walk `root` and its history depth first on a heap stack; history
    /// depth is not bounded by the thread stack. A failure marks the failing
    /// transaction and every open dependent.
    fn validate<'t>(&mut self, root: &'t Transaction) -> Result<(), ValidationError> {
        // Transactions whose own checks passed, with the next source to visit
        let mut open: Vec<(&'t Transaction, usize)> = Vec::new();
        if self.enter(root)? {
            open.push((root, 0));
        }

        while let Some(&(transaction, next)) = open.last() {
            let Some(source) = transaction.sources().get(next) else {
                open.pop();
                self.finish(transaction, None);
                continue;
            };
            if let Some(top) = open.last_mut() {
                top.1 += 1;
            }

            let step = if self.verdict(&source.hash()) == Some(false) {
                Err(ValidationError::InvalidSource {
                    transaction: transaction.to_string(),
                    dependency: source.to_string(),
                })
            } else {
                self.enter(source)
            };
            match step {
                Ok(true) => open.push((source.as_ref(), 0)),
                Ok(false) => {}
                Err(err) => {
                    while let Some((dependent, _)) = open.pop() {
                        self.finish(dependent, Some(&err));
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Run the checks of `transaction` that do not involve its sources.
    /// Returns false when it is known valid already.
    fn enter(&mut self, transaction: &Transaction) -> Result<bool, ValidationError> {
        let hash = transaction.hash();
        match self.verdict(&hash) {
            Some(true) => return Ok(false),
            Some(false) => {
                return Err(ValidationError::InvalidSource {
                    transaction: transaction.to_string(),
                    dependency: transaction.to_string(),
                })
            }
            None => {}
        }
        if !self.in_progress.insert(hash) {
            return Err(StructuralError::Cycle {
                transaction: transaction.to_string(),
            }
            .into());
        }

        let checked = if transaction.is_genesis() {
            self.check_genesis(transaction)
        } else {
            self.check_transaction(transaction)
        };
        match checked {
            Ok(()) => Ok(true),
            Err(err) => {
                self.finish(transaction, Some(&err));
                Err(err)
            }
        }
    }

    fn finish(&mut self, transaction: &Transaction, failure: Option<&ValidationError>) {
        let hash = transaction.hash();
        self.in_progress.remove(&hash);
        match failure {
            None => {
                self.local.insert(hash, true);
            }
            Some(err) if err.is_intrinsic() => self.invalid.push(hash),
            Some(_) => {}
        }
    }

    fn check_genesis(&self, transaction: &Transaction) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidGenesis {
            transaction: transaction.to_string(),
            reason: reason.to_string(),
        };
        if transaction.block_number() != Some(0) {
            return Err(invalid("not in block 0"));
        }
        if !transaction.sources().is_empty() {
            return Err(invalid("has sources"));
        }
        if transaction.remainder() != 0 {
            return Err(invalid("has a remainder"));
        }
        if !self.store.genesis().contains(transaction) {
            return Err(invalid("not part of the genesis block"));
        }
        Ok(())
    }

    fn check_transaction(&mut self, transaction: &Transaction) -> Result<(), ValidationError> {
        let Some(sender) = transaction.sender() else {
            return self.check_genesis(transaction);
        };
        let number = transaction.block_number().ok_or_else(|| StructuralError::Unplaced {
            transaction: transaction.to_string(),
        })?;

        self.check_placement(sender, transaction, number)?;
        self.check_sources_order(sender, transaction, number)?;
        self.check_money(sender, transaction)?;
        self.check_double_spend(sender, transaction)
    }

    fn view(&mut self, owner: NodeId) -> Result<&ChainView, ValidationError> {
        if !self.views.contains_key(&owner) {
            let peer = self
                .store
                .peer(owner)
                .ok_or(ValidationError::UnknownDependency { node: owner })?;
            let view = ChainView::new(&peer.chain().read(), self.proof.updates_for(owner));
            self.views.insert(owner, view);
        }
        let view = &self.views[&owner];
        view.check_integrity().map_err(StructuralError::from)?;
        Ok(view)
    }

    /// The transaction sits in the block it claims and that block is final
    fn check_placement(
        &mut self,
        owner: NodeId,
        transaction: &Transaction,
        number: u32,
    ) -> Result<(), ValidationError> {
        let main_chain = self.store.main_chain().clone();
        let view = self.view(owner)?;

        let placed = view.block(number).is_some_and(|block| block.contains(transaction));
        if !placed {
            return Err(StructuralError::MissingTransaction {
                transaction: transaction.to_string(),
                owner,
                block: number,
            }
            .into());
        }

        let is_final = view.blocks().skip_while(|block| block.number() < number).any(|block| {
            block.next_committed_block().is_some() || main_chain.is_block_present(block)
        });
        if !is_final {
            return Err(ValidationError::NotFinal {
                transaction: transaction.to_string(),
                block: number,
            });
        }
        Ok(())
    }

    /// Sources on the sender's own chain come strictly before the
    /// transaction, either in an earlier block or earlier in the same block.
    fn check_sources_order(
        &mut self,
        sender: NodeId,
        transaction: &Transaction,
        number: u32,
    ) -> Result<(), ValidationError> {
        let view = self.view(sender)?;
        for source in transaction.sources() {
            if source.sender() != Some(sender) {
                continue;
            }
            let out_of_order = || StructuralError::SourceOrder {
                transaction: transaction.to_string(),
                dependency: source.to_string(),
            };
            let source_number = source.block_number().ok_or_else(out_of_order)?;
            if source_number > number {
                return Err(out_of_order().into());
            }
            if source_number == number {
                let hashes: Vec<ContentHash> = view
                    .block(number)
                    .map(|block| block.transactions().iter().map(|tx| tx.hash()).collect())
                    .unwrap_or_default();
                let position = |hash: ContentHash| hashes.iter().position(|h| *h == hash);
                match (position(source.hash()), position(transaction.hash())) {
                    (Some(before), Some(after)) if before < after => {}
                    _ => return Err(out_of_order().into()),
                }
            }
        }
        Ok(())
    }

    fn check_money(&self, sender: NodeId, transaction: &Transaction) -> Result<(), ValidationError> {
        let actual = transaction.amount().saturating_add(transaction.remainder());
        let mismatch = |expected| ValidationError::MoneyMismatch {
            transaction: transaction.to_string(),
            expected,
            actual,
        };
        if transaction.amount() < 0 || transaction.remainder() < 0 {
            return Err(mismatch(0));
        }

        let mut sum: i64 = 0;
        for source in transaction.sources() {
            let contribution = source.contribution_to(sender).ok_or_else(|| {
                ValidationError::SourceNotInvolvingSender {
                    transaction: transaction.to_string(),
                    dependency: source.to_string(),
                }
            })?;
            sum = sum.saturating_add(contribution);
            if sum > actual {
                return Err(mismatch(sum));
            }
        }
        if sum != actual {
            return Err(mismatch(sum));
        }
        Ok(())
    }

    /// No earlier transaction of the sender consumed any of our sources
    fn check_double_spend(
        &mut self,
        sender: NodeId,
        transaction: &Transaction,
    ) -> Result<(), ValidationError> {
        let hash = transaction.hash();
        let view = self.view(sender)?;
        for block in view.blocks() {
            for other in block.transactions() {
                if other.hash() == hash {
                    return Ok(());
                }
                if other.sender() == Some(sender) && other.shares_source_with(transaction) {
                    debug!(transaction = %transaction, conflicting = %other, "Double spend");
                    return Err(ValidationError::DoubleSpend {
                        transaction: transaction.to_string(),
                        conflicting: other.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{node, TestCluster};
    use std::sync::Arc;

    #[test]
    fn test_valid_transfer_is_accepted() {
        let cluster = TestCluster::new(3, 100);
        let tx = cluster.transfer(1, 2, 30);

        let verification = cluster.store(2).verification();
        assert_eq!(verification.cached(&tx.hash()), Some(true));
        assert!(verification.was_received(&tx.hash()));
    }

    #[test]
    fn test_replay_is_rejected_without_mutation() {
        let cluster = TestCluster::new(3, 100);
        let tx = cluster.pay(1, 2, 30);
        cluster.seal_and_commit(1);
        let proof = cluster.proof(&tx);

        let receiver = cluster.store(2);
        receiver.accept_proof(&proof).unwrap();
        assert_eq!(receiver.available_money(), 130);

        let err = receiver.accept_proof(&proof).unwrap_err();
        assert!(matches!(err, ValidationError::Replay { .. }));
        assert_eq!(receiver.available_money(), 130);
    }

    #[test]
    fn test_not_final_can_be_retried() {
        let cluster = TestCluster::new(3, 100);
        let tx = cluster.pay(1, 2, 30);
        cluster.seal(1);

        let blocks = cluster.store(1).own_peer().chain().read().blocks()[1..].to_vec();
        let proof = Proof::with_updates(tx.clone(), [(node(1), blocks)].into());

        let receiver = cluster.store(2);
        let err = receiver.accept_proof(&proof).unwrap_err();
        assert!(matches!(err, ValidationError::NotFinal { block: 1, .. }));
        assert!(!receiver.verification().was_received(&tx.hash()));
        assert_eq!(receiver.peer(node(1)).unwrap().chain().read().last_block_number(), Some(0));

        cluster.seal_and_commit(1);
        receiver.accept_proof(&cluster.proof(&tx)).unwrap();
    }

    #[test]
    fn test_money_mismatch_is_cached_invalid() {
        let cluster = TestCluster::new(3, 100);
        let genesis = cluster.genesis_transaction(1);
        let forged = Arc::new(Transaction::new(50, node(1), node(2), 150, 0, vec![genesis]));
        cluster.forge(1, vec![forged.clone()]);

        let receiver = cluster.store(2);
        let err = receiver.accept_proof(&cluster.proof(&forged)).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MoneyMismatch { expected: 100, actual: 150, .. }
        ));
        assert_eq!(receiver.verification().cached(&forged.hash()), Some(false));
        assert_eq!(receiver.available_money(), 100);

        // Intrinsic failures stay in the seen set
        assert!(receiver.verification().was_received(&forged.hash()));
    }

    #[test]
    fn test_negative_amount_is_rejected() {
        let cluster = TestCluster::new(3, 100);
        let genesis = cluster.genesis_transaction(1);
        let forged = Arc::new(Transaction::new(50, node(1), node(2), -10, 110, vec![genesis]));
        cluster.forge(1, vec![forged.clone()]);

        let err = cluster.store(2).accept_proof(&cluster.proof(&forged)).unwrap_err();
        assert!(matches!(err, ValidationError::MoneyMismatch { .. }));
    }

    #[test]
    fn test_source_must_involve_sender() {
        let cluster = TestCluster::new(3, 100);
        let foreign = cluster.genesis_transaction(0);
        let forged = Arc::new(Transaction::new(50, node(1), node(2), 100, 0, vec![foreign]));
        cluster.forge(1, vec![forged.clone()]);

        let err = cluster.store(2).accept_proof(&cluster.proof(&forged)).unwrap_err();
        assert!(matches!(err, ValidationError::SourceNotInvolvingSender { .. }));
    }

    #[test]
    fn test_double_spend_is_rejected() {
        let cluster = TestCluster::new(3, 100);
        let genesis = cluster.genesis_transaction(1);
        let first = Arc::new(Transaction::new(50, node(1), node(2), 30, 70, vec![genesis.clone()]));
        let second = Arc::new(Transaction::new(51, node(1), node(0), 50, 50, vec![genesis]));
        cluster.forge(1, vec![first.clone(), second.clone()]);

        cluster.store(2).accept_proof(&cluster.proof(&first)).unwrap();
        let err = cluster.store(0).accept_proof(&cluster.proof(&second)).unwrap_err();
        assert!(matches!(err, ValidationError::DoubleSpend { .. }));
    }

    #[test]
    fn test_forged_genesis_is_rejected() {
        let cluster = TestCluster::new(3, 100);
        let fake = Arc::new(Transaction::genesis(7, node(1), 500));
        let forged = Arc::new(Transaction::new(50, node(1), node(2), 500, 0, vec![fake]));
        cluster.forge(1, vec![forged.clone()]);

        let err = cluster.store(2).accept_proof(&cluster.proof(&forged)).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidGenesis { .. }));
    }

    #[test]
    fn test_source_from_later_block_is_rejected() {
        let cluster = TestCluster::new(3, 100);
        let genesis = cluster.genesis_transaction(1);
        let later = Arc::new(Transaction::new(60, node(1), node(0), 10, 90, vec![genesis]));
        let earlier = Arc::new(Transaction::new(61, node(1), node(2), 90, 0, vec![later.clone()]));
        cluster.forge(1, vec![earlier.clone()]);
        cluster.forge(1, vec![later]);

        let err = cluster.store(2).accept_proof(&cluster.proof(&earlier)).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Structural(StructuralError::SourceOrder { .. })
        ));
    }

    #[test]
    fn test_spending_change_in_same_block() {
        let cluster = TestCluster::new(3, 100);
        cluster.pay(1, 0, 10);
        let tx = cluster.pay(1, 2, 80);
        cluster.seal_and_commit(1);

        // The second payment spends the change of the first
        assert_eq!(tx.sources().len(), 1);
        assert_eq!(tx.sources()[0].block_number(), Some(1));
        cluster.store(2).accept_proof(&cluster.proof(&tx)).unwrap();
    }

    #[test]
    fn test_gap_in_update_is_structural() {
        let cluster = TestCluster::new(3, 100);
        let tx = cluster.pay(1, 2, 30);
        cluster.seal_and_commit(1);
        cluster.seal_and_commit(1);

        let blocks = cluster.store(1).own_peer().chain().read().blocks()[2..].to_vec();
        let proof = Proof::with_updates(tx, [(node(1), blocks)].into());
        let err = cluster.store(2).accept_proof(&proof).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Structural(StructuralError::InvalidView(_))
        ));
    }

    #[test]
    fn test_transitive_history_is_verified() {
        let cluster = TestCluster::new(4, 100);
        let first = cluster.transfer(3, 1, 50);
        let tx = cluster.transfer(1, 2, 120);

        let receiver = cluster.store(2);
        assert_eq!(receiver.verification().cached(&first.hash()), Some(true));
        assert_eq!(receiver.peer(node(3)).unwrap().chain().read().last_block_number(), Some(1));
        assert!(receiver.unspent().lock().contains(&tx));
    }

    #[test]
    fn test_long_source_chain_is_verified() {
        let depth = 3_000u32;
        let money = 1_000_000;
        let cluster = TestCluster::new(2, money);

        // Each payment spends the change of the one before it
        let mut previous = cluster.genesis_transaction(1);
        let mut history = Vec::with_capacity(depth as usize);
        for number in 1..=depth {
            let tx = Arc::new(Transaction::new(
                number,
                node(1),
                node(0),
                1,
                money - i64::from(number),
                vec![previous],
            ));
            history.push(tx.clone());
            previous = tx;
        }
        cluster.forge(1, history.clone());

        let receiver = cluster.store(0);
        receiver.accept_proof(&cluster.proof(&previous)).unwrap();
        assert_eq!(receiver.verification().cached(&history[0].hash()), Some(true));
        assert_eq!(receiver.available_money(), money + 1);
    }
}
