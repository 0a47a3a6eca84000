/// Ledger model
///
/// Every participant owns one append-only chain of blocks holding its own
/// transactions. Foreign chains are local copies that only grow through
/// verified proofs. This module holds the model itself plus the two
/// structures used to reason about what other participants know about it:
/// per-peer meta knowledge and chain views over claimed updates.

mod block;
mod block_abstract;
mod chain;
mod chain_view;
mod error;
mod meta_knowledge;
mod transaction;

pub use block::Block;
pub use block_abstract::BlockAbstract;
pub use chain::{Chain, ChainKind};
pub use chain_view::{ChainView, ChainViewError};
pub use error::LedgerError;
pub use meta_knowledge::{MetaKnowledge, OracleMetaKnowledge, OracleSource, TrackedMetaKnowledge};
pub use transaction::{Transaction, TransactionKey};

use scaleout_common::{ContentHash, NodeId};

/// Feeds the fixed-width big-endian layout shared by transaction and block
/// hashes.
pub(crate) struct ContentHasher(blake3::Hasher);

impl ContentHasher {
    pub(crate) fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub(crate) fn u32(&mut self, value: u32) -> &mut Self {
        self.0.update(&value.to_be_bytes());
        self
    }

    pub(crate) fn i64(&mut self, value: i64) -> &mut Self {
        self.0.update(&value.to_be_bytes());
        self
    }

    pub(crate) fn node(&mut self, node: Option<NodeId>) -> &mut Self {
        self.0.update(&NodeId::to_wire(node).to_be_bytes());
        self
    }

    pub(crate) fn hash(&mut self, hash: &ContentHash) -> &mut Self {
        self.0.update(hash.as_bytes());
        self
    }

    pub(crate) fn finish(&self) -> ContentHash {
        ContentHash::from_bytes(*self.0.finalize().as_bytes())
    }
}
