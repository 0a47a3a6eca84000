use crate::ledger::{Block, MetaKnowledge, Transaction};
use crate::proof::Proof;
use scaleout_common::config::protocol::MAX_MESSAGE_SIZE;
use scaleout_common::{ContentHash, NodeId, ScaleOutError, Timestamp, GENESIS_SENTINEL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Block number of a transaction that is not placed yet, or of the block
/// before genesis
pub const NO_BLOCK: i32 = -1;

/// Protocol message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message type and payload
    pub payload: MessagePayload,

    /// Id of the sending node
    pub sender: i32,

    /// Timestamp when message was created
    pub timestamp: Timestamp,
}

impl Message {
    pub fn new(sender: NodeId, payload: MessagePayload) -> Self {
        Self {
            payload,
            sender: sender.as_i32(),
            timestamp: Timestamp::now(),
        }
    }

    pub fn message_type(&self) -> &str {
        self.payload.message_type()
    }

    /// Serialize, refusing messages over the protocol limit
    pub fn to_bytes(&self) -> scaleout_common::Result<Vec<u8>> {
        let bytes =
            bincode::serialize(self).map_err(|e| ScaleOutError::serialization(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ScaleOutError::MessageTooLarge {
                size: bytes.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> scaleout_common::Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ScaleOutError::MessageTooLarge {
                size: bytes.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }
        bincode::deserialize(bytes).map_err(|e| ScaleOutError::serialization(e.to_string()))
    }
}

/// All possible message types in the protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    /// A transaction and the history needed to verify it
    Proof(ProofMessage),
}

impl MessagePayload {
    pub fn message_type(&self) -> &str {
        match self {
            Self::Proof(_) => "proof",
        }
    }
}

// ============================================================================
// Proof Messages
// ============================================================================

/// Locates a transaction: chain owner, block number, transaction number.
/// Genesis transactions are found in block 0 of their receiver's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceRef {
    pub node_id: i32,
    pub block_number: i32,
    pub tx_number: u32,
}

impl SourceRef {
    pub fn of(transaction: &Transaction) -> Self {
        Self {
            node_id: transaction.chain_owner().as_i32(),
            block_number: transaction
                .block_number()
                .map_or(NO_BLOCK, |number| number as i32),
            tx_number: transaction.number(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDescriptor {
    pub number: u32,

    /// [`GENESIS_SENTINEL`] for genesis transactions
    pub sender_id: i32,

    pub receiver_id: i32,

    pub amount: i64,

    pub remainder: i64,

    /// Sources the receiver holds already
    pub known_sources: Vec<SourceRef>,

    /// Sources carried in this message's chain updates
    pub new_sources: Vec<SourceRef>,

    pub hash: ContentHash,

    /// [`NO_BLOCK`] while unplaced
    pub block_number: i32,
}

impl TransactionDescriptor {
    /// Describe `transaction` for the owner of `meta`
    pub fn new(transaction: &Transaction, meta: &dyn MetaKnowledge) -> Self {
        let (known_sources, new_sources) = transaction
            .sources()
            .iter()
            .partition::<Vec<_>, _>(|source| is_known(source, meta));

        Self {
            number: transaction.number(),
            sender_id: NodeId::to_wire(transaction.sender()),
            receiver_id: transaction.receiver().as_i32(),
            amount: transaction.amount(),
            remainder: transaction.remainder(),
            known_sources: known_sources.into_iter().map(|s| SourceRef::of(s)).collect(),
            new_sources: new_sources.into_iter().map(|s| SourceRef::of(s)).collect(),
            hash: transaction.hash(),
            block_number: transaction
                .block_number()
                .map_or(NO_BLOCK, |number| number as i32),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.sender_id == GENESIS_SENTINEL
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceRef> {
        self.known_sources.iter().chain(self.new_sources.iter())
    }
}

fn is_known(source: &Transaction, meta: &dyn MetaKnowledge) -> bool {
    if source.is_genesis() || source.chain_owner() == meta.owner() {
        return true;
    }
    match (source.block_number(), meta.last_known_block_number(source.chain_owner())) {
        (Some(block), Some(known)) => known >= block,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub number: i32,

    /// [`NO_BLOCK`] for the genesis block
    pub previous_block_number: i32,

    /// [`GENESIS_SENTINEL`] for the genesis block
    pub owner_id: i32,

    pub transactions: Vec<TransactionDescriptor>,

    pub hash: ContentHash,
}

impl BlockDescriptor {
    pub fn new(block: &Block, meta: &dyn MetaKnowledge) -> Self {
        let number = block.number() as i32;
        Self {
            number,
            previous_block_number: if block.is_genesis() { NO_BLOCK } else { number - 1 },
            owner_id: NodeId::to_wire(block.owner()),
            transactions: block
                .transactions()
                .iter()
                .map(|tx| TransactionDescriptor::new(tx, meta))
                .collect(),
            hash: block.hash(),
        }
    }
}

/// A [`Proof`] as it travels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofMessage {
    pub transaction: TransactionDescriptor,

    /// Per chain owner, blocks in increasing order
    pub chain_updates: BTreeMap<i32, Vec<BlockDescriptor>>,

    /// Main-chain height the receiver must reach before verifying
    pub required_height: u64,
}

impl ProofMessage {
    /// Encode `proof` for the owner of `meta`, the transaction's receiver
    pub fn from_proof(proof: &Proof, meta: &dyn MetaKnowledge, required_height: u64) -> Self {
        let chain_updates = proof
            .chain_updates()
            .iter()
            .map(|(owner, blocks)| {
                let blocks = blocks.iter().map(|b| BlockDescriptor::new(b, meta)).collect();
                (owner.as_i32(), blocks)
            })
            .collect();

        Self {
            transaction: TransactionDescriptor::new(proof.transaction(), meta),
            chain_updates,
            required_height,
        }
    }

    pub fn receiver(&self) -> Option<NodeId> {
        NodeId::from_wire(self.transaction.receiver_id)
    }

    pub fn block_count(&self) -> usize {
        self.chain_updates.values().map(Vec::len).sum()
    }
}
