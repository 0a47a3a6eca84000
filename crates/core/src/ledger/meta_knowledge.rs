use super::{Block, Chain, LedgerError};
use parking_lot::RwLock;
use scaleout_common::NodeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What one peer (the owner) is believed to know about every chain.
///
/// Entries only ever grow. A missing entry means nothing is known, which the
/// wire format expresses as -1.
pub trait MetaKnowledge: Send + Sync {
    /// The peer whose knowledge this describes
    fn owner(&self) -> NodeId;

    fn last_known_block_number(&self, node: NodeId) -> Option<u32>;

    /// Raise the last known block of `node`'s chain to at least `number`
    fn update_last_known_block_number(&self, node: NodeId, number: u32);

    /// Every chain with at least one known block
    fn snapshot(&self) -> BTreeMap<NodeId, u32>;

    fn first_unknown_block_number(&self, node: NodeId) -> u32 {
        self.last_known_block_number(node)
            .map_or(0, |last| last + 1)
    }

    /// Blocks of `chain` the owner is missing to know it up to `end`.
    ///
    /// Empty when the chain is the owner's own or already known that far,
    /// otherwise the contiguous range `[first unknown, end]`.
    fn blocks_to_send(&self, chain: &Chain, end: u32) -> Result<Vec<Arc<Block>>, LedgerError> {
        let node = chain.owner();
        if node == self.owner() {
            return Ok(Vec::new());
        }

        let first = self.first_unknown_block_number(node);
        if first > end {
            return Ok(Vec::new());
        }
        if chain.last_block_number().map_or(true, |last| last < end) {
            return Err(LedgerError::BlockOutOfRange { owner: node, number: end });
        }

        Ok(chain.blocks()[first as usize..=end as usize].to_vec())
    }
}

/// Authoritative record, maintained from the proofs exchanged with the owner
pub struct TrackedMetaKnowledge {
    owner: NodeId,
    known: RwLock<HashMap<NodeId, u32>>,
}

impl TrackedMetaKnowledge {
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            known: RwLock::new(HashMap::new()),
        }
    }
}

impl MetaKnowledge for TrackedMetaKnowledge {
    fn owner(&self) -> NodeId {
        self.owner
    }

    fn last_known_block_number(&self, node: NodeId) -> Option<u32> {
        self.known.read().get(&node).copied()
    }

    fn update_last_known_block_number(&self, node: NodeId, number: u32) {
        let mut known = self.known.write();
        let entry = known.entry(node).or_insert(number);
        *entry = (*entry).max(number);
    }

    fn snapshot(&self) -> BTreeMap<NodeId, u32> {
        self.known.read().iter().map(|(k, v)| (*k, *v)).collect()
    }
}

/// Ground truth about what a participant holds locally
pub trait OracleSource: Send + Sync {
    /// Last block of `chain` held by `observer`
    fn last_block_number(&self, observer: NodeId, chain: NodeId) -> Option<u32>;

    /// Chains `observer` holds at least one block of
    fn known_chains(&self, observer: NodeId) -> Vec<NodeId>;
}

/// Answers from the owner's actual chains instead of a tracked record.
/// Only usable when every participant lives in the same process.
pub struct OracleMetaKnowledge {
    owner: NodeId,
    source: Arc<dyn OracleSource>,
}

impl OracleMetaKnowledge {
    pub fn new(owner: NodeId, source: Arc<dyn OracleSource>) -> Self {
        Self { owner, source }
    }
}

impl MetaKnowledge for OracleMetaKnowledge {
    fn owner(&self) -> NodeId {
        self.owner
    }

    fn last_known_block_number(&self, node: NodeId) -> Option<u32> {
        self.source.last_block_number(self.owner, node)
    }

    fn update_last_known_block_number(&self, _node: NodeId, _number: u32) {}

    fn snapshot(&self) -> BTreeMap<NodeId, u32> {
        self.source
            .known_chains(self.owner)
            .into_iter()
            .filter_map(|chain| Some((chain, self.last_known_block_number(chain)?)))
            .collect()
    }
}
