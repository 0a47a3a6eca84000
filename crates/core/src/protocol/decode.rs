use super::messages::{BlockDescriptor, ProofMessage, SourceRef, TransactionDescriptor, NO_BLOCK};
use crate::ledger::{Block, LedgerError, Transaction};
use crate::proof::Proof;
use crate::store::LocalStore;
use scaleout_common::{ContentHash, NodeId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid node id {0}")]
    InvalidNodeId(i32),

    #[error("Invalid block number {number} on chain {owner}")]
    InvalidBlockNumber { owner: i32, number: i32 },

    #[error("Cannot resolve transaction {tx_number} in block {block_number} of chain {node_id}")]
    UnresolvedSource {
        node_id: i32,
        block_number: i32,
        tx_number: u32,
    },

    #[error("Hash mismatch for {what}: claimed {claimed}, computed {computed}")]
    HashMismatch {
        what: String,
        claimed: ContentHash,
        computed: ContentHash,
    },

    #[error("Block {number} of chain {owner} does not follow a known block")]
    MissingPredecessor { owner: NodeId, number: u32 },

    #[error("Transaction {tx_number} in block {block_number} of chain {node_id} depends on itself")]
    Cycle {
        node_id: i32,
        block_number: i32,
        tx_number: u32,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<SourceRef> for DecodeError {
    fn from(source: SourceRef) -> Self {
        DecodeError::UnresolvedSource {
            node_id: source.node_id,
            block_number: source.block_number,
            tx_number: source.tx_number,
        }
    }
}

/// Rebuilds a [`Proof`] from a [`ProofMessage`].
///
/// References resolve against local chains first and against the
/// message's own blocks second. Every rebuilt transaction and block must
/// hash to the value the sender claimed.
pub struct ProofDecoder<'a> {
    store: &'a LocalStore,
    message: &'a ProofMessage,
    resolved: HashMap<SourceRef, Arc<Transaction>>,
    in_progress: HashSet<SourceRef>,
}

impl<'a> ProofDecoder<'a> {
    pub fn new(store: &'a LocalStore, message: &'a ProofMessage) -> Self {
        Self {
            store,
            message,
            resolved: HashMap::new(),
            in_progress: HashSet::new(),
        }
    }

    pub fn decode(mut self) -> Result<Proof, DecodeError> {
        let message = self.message;
        let mut chain_updates = BTreeMap::new();
        for (owner, descriptors) in &message.chain_updates {
            let owner = NodeId::from_wire(*owner).ok_or(DecodeError::InvalidNodeId(*owner))?;
            let blocks = self.decode_chain(owner, descriptors)?;
            chain_updates.insert(owner, blocks);
        }

        let descriptor = &message.transaction;
        let location = location_of(descriptor)?;
        let transaction = self.resolve(location, false)?;
        check_hash(&transaction.to_string(), descriptor.hash, transaction.hash())?;

        Ok(Proof::with_updates(transaction, chain_updates))
    }

    fn decode_chain(
        &mut self,
        owner: NodeId,
        descriptors: &[BlockDescriptor],
    ) -> Result<Vec<Arc<Block>>, DecodeError> {
        let mut blocks: Vec<Arc<Block>> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let block = if descriptor.number == 0 {
                self.store.genesis().clone()
            } else {
                let number = u32::try_from(descriptor.number).map_err(|_| {
                    DecodeError::InvalidBlockNumber {
                        owner: owner.as_i32(),
                        number: descriptor.number,
                    }
                })?;
                if descriptor.previous_block_number != descriptor.number - 1 {
                    return Err(DecodeError::InvalidBlockNumber {
                        owner: owner.as_i32(),
                        number: descriptor.previous_block_number,
                    });
                }
                let previous_hash = match blocks.last() {
                    Some(previous) if previous.number() + 1 == number => previous.hash(),
                    _ => self
                        .local_block_hash(owner, number - 1)
                        .ok_or(DecodeError::MissingPredecessor { owner, number })?,
                };

                let mut transactions = Vec::with_capacity(descriptor.transactions.len());
                for tx in &descriptor.transactions {
                    let location = SourceRef {
                        node_id: owner.as_i32(),
                        block_number: descriptor.number,
                        tx_number: tx.number,
                    };
                    transactions.push(self.resolve(location, false)?);
                }
                Arc::new(Block::from_parts(
                    number,
                    Some(owner),
                    Some(previous_hash),
                    transactions,
                )?)
            };

            check_hash(
                &format!("block {} of {}", descriptor.number, owner),
                descriptor.hash,
                block.hash(),
            )?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    fn local_block_hash(&self, owner: NodeId, number: u32) -> Option<ContentHash> {
        let peer = self.store.peer(owner)?;
        let chain = peer.chain().read();
        chain.block(number).map(|block| block.hash())
    }

    /// Find the transaction at `location`. Known sources must be held
    /// locally; anything else may come from the message.
    fn resolve(&mut self, location: SourceRef, local_only: bool) -> Result<Arc<Transaction>, DecodeError> {
        if let Some(transaction) = self.resolved.get(&location) {
            return Ok(transaction.clone());
        }

        let transaction = match self.find_local(location) {
            Some(transaction) => transaction,
            None if local_only => return Err(location.into()),
            None => {
                let descriptor = self.find_in_message(location).ok_or(location)?;
                if !self.in_progress.insert(location) {
                    return Err(DecodeError::Cycle {
                        node_id: location.node_id,
                        block_number: location.block_number,
                        tx_number: location.tx_number,
                    });
                }
                let decoded = self.build_transaction(descriptor);
                self.in_progress.remove(&location);
                decoded?
            }
        };

        self.resolved.insert(location, transaction.clone());
        Ok(transaction)
    }

    fn find_local(&self, location: SourceRef) -> Option<Arc<Transaction>> {
        let owner = NodeId::from_wire(location.node_id)?;
        let block = u32::try_from(location.block_number).ok()?;
        self.store.find_transaction(owner, block, location.tx_number)
    }

    fn find_in_message(&self, location: SourceRef) -> Option<&'a TransactionDescriptor> {
        let message = self.message;
        if location_of(&message.transaction).ok() == Some(location) {
            return Some(&message.transaction);
        }
        message
            .chain_updates
            .get(&location.node_id)?
            .iter()
            .find(|block| block.number == location.block_number)?
            .transactions
            .iter()
            .find(|tx| tx.number == location.tx_number)
    }

    fn build_transaction(
        &mut self,
        descriptor: &TransactionDescriptor,
    ) -> Result<Arc<Transaction>, DecodeError> {
        let mut sources = Vec::with_capacity(descriptor.known_sources.len() + descriptor.new_sources.len());
        for source in &descriptor.known_sources {
            sources.push(self.resolve(*source, true)?);
        }
        for source in &descriptor.new_sources {
            sources.push(self.resolve(*source, false)?);
        }

        let receiver = NodeId::from_wire(descriptor.receiver_id)
            .ok_or(DecodeError::InvalidNodeId(descriptor.receiver_id))?;
        let block_number = u32::try_from(descriptor.block_number).ok();
        let transaction = Arc::new(Transaction::from_parts(
            descriptor.number,
            NodeId::from_wire(descriptor.sender_id),
            receiver,
            descriptor.amount,
            descriptor.remainder,
            sources,
            block_number,
        ));
        check_hash(&transaction.to_string(), descriptor.hash, transaction.hash())?;
        Ok(transaction)
    }
}

/// Where a described transaction lives
fn location_of(descriptor: &TransactionDescriptor) -> Result<SourceRef, DecodeError> {
    let owner = if descriptor.is_genesis() {
        descriptor.receiver_id
    } else {
        descriptor.sender_id
    };
    if descriptor.block_number == NO_BLOCK {
        return Err(DecodeError::InvalidBlockNumber {
            owner,
            number: descriptor.block_number,
        });
    }
    Ok(SourceRef {
        node_id: owner,
        block_number: descriptor.block_number,
        tx_number: descriptor.number,
    })
}

fn check_hash(what: &str, claimed: ContentHash, computed: ContentHash) -> Result<(), DecodeError> {
    if claimed != computed {
        return Err(DecodeError::HashMismatch {
            what: what.to_string(),
            claimed,
            computed,
        });
    }
    Ok(())
}
