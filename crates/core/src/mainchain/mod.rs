/// Main chain
///
/// The external total-order service that makes blocks final. Nodes submit
/// block abstracts and later ask whether a block hash has been committed.

mod memory;

pub use memory::InMemoryMainChain;

use crate::ledger::{Block, BlockAbstract};
use scaleout_common::ContentHash;

/// Failures talking to the ordering service. Always retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MainChainError {
    #[error("Main chain unavailable: {0}")]
    Unavailable(String),

    #[error("Main chain not initialized")]
    NotInitialized,

    #[error("Main chain rejected abstract: {0}")]
    Rejected(String),
}

impl MainChainError {
    /// Whether submitting again later can succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

pub trait MainChain: Send + Sync {
    fn init(&self) -> Result<(), MainChainError>;

    fn stop(&self);

    /// Submit an abstract for ordering. Returns the hash of the main-chain
    /// entry once committed, `None` while the commit is still in flight.
    fn commit_abstract(
        &self,
        abstract_: &BlockAbstract,
    ) -> Result<Option<ContentHash>, MainChainError>;

    /// Whether a block with this hash has been committed
    fn is_present(&self, block_hash: &ContentHash) -> bool;

    fn is_block_present(&self, block: &Block) -> bool {
        self.is_present(&block.hash())
    }

    /// Monotonic height of the main chain
    fn current_height(&self) -> u64;
}
