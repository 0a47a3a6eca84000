/// Proofs
///
/// A proof is a transaction plus the chain updates its receiver needs in
/// order to verify it. [`ProofConstructor`] computes the smallest such set
/// from what the receiver is believed to know already.

mod constructor;

pub use constructor::{ProofConstructor, ProofError};

use crate::ledger::{Block, Transaction};
use scaleout_common::NodeId;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Proof {
    transaction: Arc<Transaction>,
    chain_updates: BTreeMap<NodeId, Vec<Arc<Block>>>,
}

impl Proof {
    /// A proof carrying no updates, for receivers that know enough already
    pub fn new(transaction: Arc<Transaction>) -> Self {
        Self::with_updates(transaction, BTreeMap::new())
    }

    pub fn with_updates(
        transaction: Arc<Transaction>,
        chain_updates: BTreeMap<NodeId, Vec<Arc<Block>>>,
    ) -> Self {
        let chain_updates = chain_updates
            .into_iter()
            .filter(|(_, blocks)| !blocks.is_empty())
            .collect();
        Self {
            transaction,
            chain_updates,
        }
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    /// Per owner, blocks in increasing number order
    pub fn chain_updates(&self) -> &BTreeMap<NodeId, Vec<Arc<Block>>> {
        &self.chain_updates
    }

    pub fn updates_for(&self, owner: NodeId) -> &[Arc<Block>] {
        self.chain_updates
            .get(&owner)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn block_count(&self) -> usize {
        self.chain_updates.values().map(Vec::len).sum()
    }

    pub fn is_trivial(&self) -> bool {
        self.chain_updates.is_empty()
    }
}
