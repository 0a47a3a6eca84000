use super::{Block, LedgerError, Transaction};
use scaleout_common::NodeId;
use std::sync::Arc;
use tracing::debug;

/// Whether the local node writes a chain or only mirrors it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// Grows by sealing the node's own pending transactions
    Own,
    /// Grows only through verified updates
    Foreign,
}

/// One participant's blocks, indexed by block number.
pub struct Chain {
    owner: NodeId,
    kind: ChainKind,
    blocks: Vec<Arc<Block>>,
    genesis_transaction: Option<Arc<Transaction>>,
    last_committed: Option<u32>,
    committed: Vec<u32>,
    pending: Vec<Arc<Transaction>>,
}

impl Chain {
    pub fn new(owner: NodeId, kind: ChainKind) -> Self {
        Self {
            owner,
            kind,
            blocks: Vec::new(),
            genesis_transaction: None,
            last_committed: None,
            committed: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn kind(&self) -> ChainKind {
        self.kind
    }

    pub fn is_own(&self) -> bool {
        self.kind == ChainKind::Own
    }

    /// Install the genesis block as block 0 and pick out this owner's
    /// endowment.
    pub fn set_genesis_block(&mut self, genesis: Arc<Block>) -> Result<(), LedgerError> {
        if !self.blocks.is_empty() {
            return Err(LedgerError::GenesisAlreadySet { owner: self.owner });
        }
        if !genesis.is_genesis() || genesis.number() != 0 {
            return Err(LedgerError::NotGenesisBlock {
                number: genesis.number(),
            });
        }

        self.genesis_transaction = genesis
            .transactions()
            .iter()
            .find(|tx| tx.receiver() == self.owner)
            .cloned();
        self.blocks.push(genesis);
        self.last_committed = Some(0);
        self.committed.push(0);
        Ok(())
    }

    pub fn genesis_transaction(&self) -> Option<&Arc<Transaction>> {
        self.genesis_transaction.as_ref()
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    pub fn block(&self, number: u32) -> Option<&Arc<Block>> {
        self.blocks.get(number as usize)
    }

    pub fn last_block(&self) -> Option<&Arc<Block>> {
        self.blocks.last()
    }

    pub fn last_block_number(&self) -> Option<u32> {
        self.blocks.last().map(|block| block.number())
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn find_transaction(&self, block: u32, number: u32) -> Option<&Arc<Transaction>> {
        self.block(block)?.transaction(number)
    }

    /// Queue a transaction for the next sealed block
    pub fn append_pending(&mut self, transaction: Arc<Transaction>) -> Result<(), LedgerError> {
        if !self.is_own() {
            return Err(LedgerError::NotOwnChain { owner: self.owner });
        }
        self.pending.push(transaction);
        Ok(())
    }

    pub fn pending(&self) -> &[Arc<Transaction>] {
        &self.pending
    }

    /// Seal every pending transaction into a new block
    pub fn seal_block(&mut self) -> Result<Arc<Block>, LedgerError> {
        if !self.is_own() {
            return Err(LedgerError::NotOwnChain { owner: self.owner });
        }
        let previous = self
            .blocks
            .last()
            .ok_or(LedgerError::MissingGenesis { owner: self.owner })?;

        let block = Arc::new(Block::next(previous, self.owner, self.pending.clone())?);
        self.pending.clear();
        self.blocks.push(block.clone());
        debug!(
            owner = %self.owner,
            block = block.number(),
            transactions = block.transactions().len(),
            "Sealed block"
        );
        Ok(block)
    }

    /// Append the part of `updates` this chain does not hold yet.
    ///
    /// Updates are expected to be checked by a [`super::ChainView`] first.
    /// Returns the number of blocks appended.
    pub fn update(&mut self, updates: &[Arc<Block>]) -> Result<usize, LedgerError> {
        let fresh = self.check_update(updates)?;
        self.blocks.extend(fresh.iter().cloned());
        Ok(fresh.len())
    }

    /// The part of `updates` that [`Chain::update`] would append, or the
    /// error it would fail with. The chain is left untouched either way.
    pub fn check_update<'b>(&self, updates: &'b [Arc<Block>]) -> Result<&'b [Arc<Block>], LedgerError> {
        if self.is_own() {
            return Err(LedgerError::OwnChainUpdate { owner: self.owner });
        }

        let known = self.blocks.len() as u32;
        let skip = updates.iter().take_while(|block| block.number() < known).count();
        let fresh = &updates[skip..];

        let mut previous = self.blocks.last();
        for (expected, block) in (known..).zip(fresh) {
            if block.number() != expected {
                return Err(LedgerError::NonContiguousUpdate {
                    owner: self.owner,
                    expected,
                    found: block.number(),
                });
            }
            if let Some(previous) = previous {
                if block.previous_hash() != Some(previous.hash()) {
                    return Err(LedgerError::BrokenLink {
                        owner: self.owner,
                        number: block.number(),
                    });
                }
            }
            previous = Some(block);
        }
        Ok(fresh)
    }

    pub fn last_committed_block(&self) -> Option<u32> {
        self.last_committed
    }

    /// Numbers of the blocks known to be final, ascending
    pub fn committed_blocks(&self) -> &[u32] {
        &self.committed
    }

    /// Record that block `number` reached finality.
    ///
    /// Every earlier block still without an anchor gets `number` as its
    /// next committed block. Returns false when nothing changed.
    pub fn mark_committed(&mut self, number: u32) -> Result<bool, LedgerError> {
        if self.block(number).is_none() {
            return Err(LedgerError::BlockOutOfRange {
                owner: self.owner,
                number,
            });
        }
        if self.last_committed.is_some_and(|last| last >= number) {
            return Ok(false);
        }

        let start = self.last_committed.map_or(0, |last| last + 1);
        for block in &self.blocks[start as usize..=number as usize] {
            block.mark_next_committed(number);
        }
        self.last_committed = Some(number);
        self.committed.push(number);
        Ok(true)
    }

    /// The nearest final block at or after `number`, if known
    pub fn committed_anchor(&self, number: u32) -> Option<u32> {
        self.block(number)?.next_committed_block()
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("blocks", &self.blocks.len())
            .field("last_committed", &self.last_committed)
            .field("pending", &self.pending.len())
            .finish()
    }
}
