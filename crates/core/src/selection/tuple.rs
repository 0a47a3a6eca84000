use crate::ledger::{MetaKnowledge, Transaction, TransactionKey};
use scaleout_common::{NodeId, SelectionMetric};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Per chain, the furthest block a receiver needs to verify a set of
/// sources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CostVector(BTreeMap<NodeId, u32>);

impl CostVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the requirement on `chain` to at least `block`
    pub fn require(&mut self, chain: NodeId, block: u32) {
        let entry = self.0.entry(chain).or_insert(block);
        *entry = (*entry).max(block);
    }

    /// Element-wise maximum
    pub fn merge(&self, other: &CostVector) -> CostVector {
        let mut merged = self.clone();
        merged.absorb(other);
        merged
    }

    pub fn absorb(&mut self, other: &CostVector) {
        for (chain, block) in &other.0 {
            self.require(*chain, *block);
        }
    }

    pub fn get(&self, chain: NodeId) -> Option<u32> {
        self.0.get(&chain).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Scalar cost of disclosing everything required to `meta`'s owner.
    /// Chains the receiver owns or already knows far enough cost nothing.
    pub fn cardinality(&self, metric: SelectionMetric, meta: &dyn MetaKnowledge) -> u64 {
        let missing = self.0.iter().filter_map(|(chain, block)| {
            if *chain == meta.owner() {
                return None;
            }
            let first_unknown = meta.first_unknown_block_number(*chain);
            (*block >= first_unknown).then(|| u64::from(*block - first_unknown) + 1)
        });
        match metric {
            SelectionMetric::ChainCount => missing.count() as u64,
            SelectionMetric::BlockSum => missing.sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleKind {
    /// Holds the genesis endowment; any equally cheap alternative wins
    Genesis,
    Normal,
}

/// A candidate set of sources
#[derive(Debug, Clone)]
pub struct SourceTuple {
    kind: TupleKind,
    transactions: BTreeMap<TransactionKey, Arc<Transaction>>,
    amount: i64,
    cost: CostVector,
    cardinality: u64,
}

impl SourceTuple {
    pub fn single(
        kind: TupleKind,
        transaction: Arc<Transaction>,
        amount: i64,
        cost: CostVector,
        cardinality: u64,
    ) -> Self {
        Self {
            kind,
            transactions: BTreeMap::from([(transaction.key(), transaction)]),
            amount,
            cost,
            cardinality,
        }
    }

    /// Union of two tuples. `owner` decides how much every member is worth.
    pub fn combine(&self, other: &SourceTuple, owner: NodeId, cost: CostVector, cardinality: u64) -> Self {
        let mut transactions = self.transactions.clone();
        for (key, tx) in &other.transactions {
            transactions.entry(*key).or_insert_with(|| tx.clone());
        }
        let amount = transactions
            .values()
            .filter_map(|tx| tx.contribution_to(owner))
            .sum();
        Self {
            kind: TupleKind::Normal,
            transactions,
            amount,
            cost,
            cardinality,
        }
    }

    pub fn kind(&self) -> TupleKind {
        self.kind
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn cost(&self) -> &CostVector {
        &self.cost
    }

    pub fn cardinality(&self) -> u64 {
        self.cardinality
    }

    pub fn covers(&self, amount: i64) -> bool {
        self.amount >= amount
    }

    pub fn contains_all(&self, other: &SourceTuple) -> bool {
        other.transactions.keys().all(|key| self.transactions.contains_key(key))
    }

    pub fn keys(&self) -> Vec<TransactionKey> {
        self.transactions.keys().copied().collect()
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Arc<Transaction>> {
        self.transactions.values()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn into_transactions(self) -> Vec<Arc<Transaction>> {
        self.transactions.into_values().collect()
    }
}

impl fmt::Display for SourceTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let numbers: Vec<String> = self.transactions.values().map(|tx| tx.to_string()).collect();
        write!(
            f,
            "Tuple(<{}>, ${}, cost={})",
            numbers.join(", "),
            self.amount,
            self.cardinality
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TrackedMetaKnowledge;

    fn node(id: i32) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn test_merge_takes_maximum() {
        let mut a = CostVector::new();
        a.require(node(2), 3);
        a.require(node(3), 1);
        let mut b = CostVector::new();
        b.require(node(2), 1);
        b.require(node(4), 2);

        let merged = a.merge(&b);
        assert_eq!(merged.get(node(2)), Some(3));
        assert_eq!(merged.get(node(3)), Some(1));
        assert_eq!(merged.get(node(4)), Some(2));
    }

    #[test]
    fn test_cardinality_subtracts_knowledge() {
        let meta = TrackedMetaKnowledge::new(node(1));
        meta.update_last_known_block_number(node(2), 2);
        meta.update_last_known_block_number(node(3), 0);

        let mut cost = CostVector::new();
        cost.require(node(1), 9);
        cost.require(node(2), 2);
        cost.require(node(3), 3);
        cost.require(node(4), 1);

        // Chain 3 misses blocks 1..=3, chain 4 blocks 0..=1
        assert_eq!(cost.cardinality(SelectionMetric::BlockSum, &meta), 5);
        assert_eq!(cost.cardinality(SelectionMetric::ChainCount, &meta), 2);
    }

    #[test]
    fn test_combine_recomputes_amount() {
        let owner = node(0);
        let a = Arc::new(Transaction::new(1, node(2), owner, 5, 0, vec![]));
        let b = Arc::new(Transaction::new(2, owner, node(3), 1, 7, vec![]));
        let left = SourceTuple::single(TupleKind::Genesis, a.clone(), 5, CostVector::new(), 0);
        let right = SourceTuple::single(TupleKind::Normal, b, 7, CostVector::new(), 0);

        let both = left.combine(&right, owner, CostVector::new(), 0);
        assert_eq!(both.amount(), 12);
        assert_eq!(both.kind(), TupleKind::Normal);
        assert!(both.contains_all(&left));
        assert!(!left.contains_all(&both));

        let again = both.combine(&left, owner, CostVector::new(), 0);
        assert_eq!(again.len(), 2);
        assert_eq!(again.amount(), 12);
    }
}
