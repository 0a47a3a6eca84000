use super::Proof;
use crate::ledger::{Block, LedgerError, Transaction};
use crate::store::{LocalStore, Peer};
use scaleout_common::NodeId;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error("Transaction {transaction} was not sent by this node")]
    NotOwnTransaction { transaction: String },

    #[error("Transaction {transaction} is not in a block yet")]
    NotInBlock { transaction: String },

    #[error("Block {block} of chain {owner} has no committed block at or after it")]
    NotCommitted { owner: NodeId, block: u32 },

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Builds the proof of one of our transactions for its receiver.
///
/// Starting from our own chain up to the first committed block after the
/// transaction, it walks the sources of every transaction it discloses and
/// adds the missing ranges of their chains, until nothing new is needed.
pub struct ProofConstructor<'a> {
    store: &'a LocalStore,
    transaction: Arc<Transaction>,
    sender: NodeId,
    receiver: Arc<Peer>,
    to_send: BTreeMap<NodeId, Vec<Arc<Block>>>,
}

impl<'a> ProofConstructor<'a> {
    pub fn new(store: &'a LocalStore, transaction: Arc<Transaction>) -> Result<Self, ProofError> {
        let sender = store.own_id();
        if transaction.sender() != Some(sender) {
            return Err(ProofError::NotOwnTransaction {
                transaction: transaction.to_string(),
            });
        }
        let receiver = store
            .peer(transaction.receiver())
            .ok_or(ProofError::UnknownNode(transaction.receiver()))?;

        Ok(Self {
            store,
            transaction,
            sender,
            receiver,
            to_send: BTreeMap::new(),
        })
    }

    pub fn construct(mut self) -> Result<Proof, ProofError> {
        let own = self.store.own_peer();
        // Hold our chain steady while the tail is read
        let own_chain = own.chain().read();

        let number = self
            .transaction
            .block_number()
            .ok_or_else(|| ProofError::NotInBlock {
                transaction: self.transaction.to_string(),
            })?;
        let anchor = self
            .store
            .finality_anchor(&own_chain, number)
            .ok_or(ProofError::NotCommitted {
                owner: self.sender,
                block: number,
            })?;

        let blocks = self.receiver.meta().blocks_to_send(&own_chain, anchor)?;
        if blocks.is_empty() {
            return Ok(Proof::new(self.transaction));
        }

        let added = self.add_blocks_to_send(self.sender, blocks);
        self.process_blocks(added)?;
        drop(own_chain);

        let proof = Proof::with_updates(self.transaction, self.to_send);
        debug!(
            receiver = %self.receiver.id(),
            chains = proof.chain_updates().len(),
            blocks = proof.block_count(),
            "Constructed proof"
        );
        Ok(proof)
    }

    /// Disclose the history behind every transaction of `blocks`. Each block
    /// is visited once.
    fn process_blocks(&mut self, blocks: Vec<Arc<Block>>) -> Result<(), ProofError> {
        let mut work: VecDeque<Arc<Block>> = blocks.into();
        while let Some(block) = work.pop_front() {
            for transaction in block.transactions() {
                for source in transaction.sources() {
                    let added = self.process_source(source)?;
                    work.extend(added);
                }
            }
        }
        Ok(())
    }

    fn process_source(&mut self, source: &Transaction) -> Result<Vec<Arc<Block>>, ProofError> {
        // The receiver knows its own chain and gets ours in full
        let Some(owner) = source.sender() else {
            return Ok(Vec::new());
        };
        if owner == self.sender || owner == self.receiver.id() {
            return Ok(Vec::new());
        }

        let number = source.block_number().ok_or_else(|| ProofError::NotInBlock {
            transaction: source.to_string(),
        })?;
        let peer = self
            .store
            .peer(owner)
            .ok_or(ProofError::UnknownNode(owner))?;

        let blocks = {
            let chain = peer.chain().read();
            let anchor = self
                .store
                .finality_anchor(&chain, number)
                .ok_or(ProofError::NotCommitted { owner, block: number })?;
            self.receiver.meta().blocks_to_send(&chain, anchor)?
        };
        Ok(self.add_blocks_to_send(owner, blocks))
    }

    /// Extend the pending list of `owner` with `blocks`.
    ///
    /// Ranges handed out for one owner all start at the same first unknown
    /// block, so a new range either is covered by the current list or
    /// extends it. Returns only the blocks that were not scheduled yet.
    fn add_blocks_to_send(&mut self, owner: NodeId, blocks: Vec<Arc<Block>>) -> Vec<Arc<Block>> {
        let current = self.to_send.entry(owner).or_default();
        if current.is_empty() {
            current.extend(blocks.iter().cloned());
            return blocks;
        }
        if current.len() >= blocks.len() {
            return Vec::new();
        }

        let added = blocks[current.len()..].to_vec();
        current.extend(added.iter().cloned());
        added
    }
}
