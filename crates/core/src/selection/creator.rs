use super::{CostVector, SelectionError, SourceTuple, TupleKind};
use crate::ledger::{Transaction, TransactionKey};
use crate::store::{LocalStore, Peer, UnspentSet};
use scaleout_common::{ContentHash, NodeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Picks the sources of a new payment.
///
/// Among the unspent transactions it looks for a set covering the amount
/// that discloses the least history the receiver does not know yet. Sets
/// grow pairwise round by round; costs merge by maximum since a chain
/// disclosed up to some block covers every earlier block too.
pub struct TransactionCreator<'a> {
    store: &'a LocalStore,
    sender: NodeId,
    receiver: Arc<Peer>,
    amount: i64,
    requirements: HashMap<ContentHash, CostVector>,
    current_best: u64,
    best: Option<SourceTuple>,
}

impl<'a> TransactionCreator<'a> {
    pub fn new(store: &'a LocalStore, receiver: NodeId, amount: i64) -> Result<Self, SelectionError> {
        if amount <= 0 {
            return Err(SelectionError::InvalidAmount(amount));
        }
        let receiver = store
            .peer(receiver)
            .ok_or(SelectionError::UnknownReceiver(receiver))?;

        Ok(Self {
            store,
            sender: store.own_id(),
            receiver,
            amount,
            requirements: HashMap::new(),
            current_best: u64::MAX,
            best: None,
        })
    }

    /// Build the transaction, mark its sources spent and keep the change.
    /// On failure the unspent set is left untouched.
    pub fn create_transaction(mut self) -> Result<Arc<Transaction>, SelectionError> {
        let mut unspent = self.store.unspent().lock();
        let available = unspent.available_money();
        if available < self.amount {
            return Err(SelectionError::InsufficientFunds {
                available,
                requested: self.amount,
            });
        }

        let sources = self
            .best_sources(&unspent)
            .ok_or(SelectionError::InsufficientFunds {
                available,
                requested: self.amount,
            })?;
        let remainder = sources.amount() - self.amount;
        let sources = sources.into_transactions();
        for source in &sources {
            unspent.remove(source);
        }

        let transaction = Arc::new(Transaction::new(
            self.store.next_transaction_number(),
            self.sender,
            self.receiver.id(),
            self.amount,
            remainder,
            sources,
        ));
        if remainder > 0 || self.receiver.id() == self.sender {
            unspent.insert(transaction.clone());
        }

        info!(
            node = %self.sender,
            transaction = %transaction,
            sources = transaction.sources().len(),
            "Created transaction"
        );
        Ok(transaction)
    }

    /// Cheapest set of unspent transactions covering the amount, if any
    pub fn best_sources(&mut self, unspent: &UnspentSet) -> Option<SourceTuple> {
        let mut candidates = self.collect_candidates(unspent);

        self.first_round(&mut candidates);
        self.cleanup(&mut candidates, u64::MAX);
        if candidates.len() <= 1 {
            return self.best.take();
        }

        let rounds = candidates.len() - 1;
        let mut previous_best = self.current_best;
        let mut current = candidates.clone();
        let mut seen: HashSet<Vec<TransactionKey>> = HashSet::new();

        // After `rounds` rounds the only set left is the union of all
        for round in 0..rounds {
            let mut next = self.do_one_round(&candidates, &current, &mut seen);
            debug!(
                round,
                frontier = next.len(),
                best = self.current_best,
                "Selection round"
            );
            if next.len() <= 1 {
                break;
            }

            self.cleanup(&mut next, previous_best);
            self.cleanup(&mut candidates, previous_best);
            current = next;
            previous_best = self.current_best;
        }
        self.best.take()
    }

    fn collect_candidates(&mut self, unspent: &UnspentSet) -> Vec<SourceTuple> {
        let genesis_threshold = self.store.config().initial_money / 2;
        let mut genesis_found = self.store.config().genesis_grouping;

        let mut candidates = Vec::with_capacity(unspent.len());
        for transaction in unspent.transactions() {
            let Some(amount) = transaction.contribution_to(self.sender) else {
                continue;
            };
            let is_endowment = transaction.is_genesis()
                || (transaction.sender() == Some(self.sender)
                    && transaction.remainder() > genesis_threshold);
            let kind = if !genesis_found && is_endowment {
                genesis_found = true;
                TupleKind::Genesis
            } else {
                TupleKind::Normal
            };

            let cost = self.requirements_of(&transaction);
            let cardinality = self.cardinality(&cost);
            candidates.push(SourceTuple::single(kind, transaction, amount, cost, cardinality));
        }
        candidates
    }

    fn first_round(&mut self, candidates: &mut Vec<SourceTuple>) {
        let genesis_grouping = self.store.config().genesis_grouping;
        let amount = self.amount;

        candidates.retain(|tuple| {
            let cardinality = tuple.cardinality();
            if cardinality > self.current_best {
                return false;
            }
            if cardinality == self.current_best {
                // Ties go against the genesis endowment
                let best_is_genesis = self
                    .best
                    .as_ref()
                    .is_some_and(|best| best.kind() == TupleKind::Genesis);
                if !genesis_grouping && best_is_genesis && tuple.covers(amount) {
                    self.best = Some(tuple.clone());
                }
                return false;
            }
            if tuple.covers(amount) {
                self.current_best = cardinality;
                self.best = Some(tuple.clone());
                return false;
            }
            true
        });
    }

    fn do_one_round(
        &mut self,
        base: &[SourceTuple],
        current: &[SourceTuple],
        seen: &mut HashSet<Vec<TransactionKey>>,
    ) -> Vec<SourceTuple> {
        let mut next = Vec::new();
        for left in base {
            for right in current {
                if right.contains_all(left) {
                    continue;
                }
                let cost = left.cost().merge(right.cost());
                let cardinality = self.cardinality(&cost);
                if cardinality >= self.current_best {
                    continue;
                }

                let combined = left.combine(right, self.sender, cost, cardinality);
                if !seen.insert(combined.keys()) {
                    continue;
                }
                if combined.covers(self.amount) {
                    self.current_best = cardinality;
                    self.best = Some(combined);
                } else {
                    next.push(combined);
                }
            }
        }
        next
    }

    /// Drop tuples no better than the best found so far
    fn cleanup(&self, tuples: &mut Vec<SourceTuple>, previous_best: u64) {
        if self.current_best != previous_best {
            tuples.retain(|tuple| tuple.cardinality() < self.current_best);
        }
    }

    fn cardinality(&self, cost: &CostVector) -> u64 {
        cost.cardinality(self.store.config().selection_metric, self.receiver.meta())
    }

    /// Furthest block per chain the receiver needs to verify `transaction`,
    /// following its sources down to genesis or to the receiver's own chain.
    fn requirements_of(&mut self, transaction: &Arc<Transaction>) -> CostVector {
        let mut stack: Vec<(Arc<Transaction>, bool)> = vec![(transaction.clone(), false)];
        let mut visiting: HashSet<ContentHash> = HashSet::new();

        while let Some((tx, expanded)) = stack.pop() {
            let hash = tx.hash();
            if self.requirements.contains_key(&hash) {
                continue;
            }
            if expanded {
                let mut cost = CostVector::new();
                if let Some((chain, block)) = self.direct_requirement(&tx) {
                    cost.require(chain, block);
                    for source in tx.sources() {
                        if let Some(source_cost) = self.requirements.get(&source.hash()) {
                            cost.absorb(source_cost);
                        }
                    }
                }
                self.requirements.insert(hash, cost);
                continue;
            }
            if !visiting.insert(hash) {
                continue;
            }

            stack.push((tx.clone(), true));
            if self.direct_requirement(&tx).is_some() {
                for source in tx.sources() {
                    stack.push((source.clone(), false));
                }
            }
        }

        self.requirements
            .get(&transaction.hash())
            .cloned()
            .unwrap_or_default()
    }

    /// The block of its own chain `transaction` needs disclosed, or `None`
    /// when the receiver holds that history already
    fn direct_requirement(&self, transaction: &Transaction) -> Option<(NodeId, u32)> {
        let owner = transaction.sender()?;
        if owner == self.receiver.id() {
            return None;
        }
        let peer = self.store.peer(owner)?;
        let chain = peer.chain().read();
        let block = match transaction.block_number() {
            Some(number) => self.store.finality_anchor(&chain, number).unwrap_or(number),
            None => chain.last_block_number().map_or(0, |last| last + 1),
        };
        Some((owner, block))
    }
}
