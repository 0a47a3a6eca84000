use super::{ContentHasher, LedgerError};
use scaleout_common::{ContentHash, NodeId};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Identity of a transaction among its siblings.
///
/// Orders genesis transactions first, then by sender, number and receiver.
/// This is the order in which sources are hashed and serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionKey {
    pub sender: Option<NodeId>,
    pub number: u32,
    pub receiver: NodeId,
}

/// A transfer of money from `sender` to `receiver`.
///
/// `remainder` is the change the sender keeps, itself spendable later.
/// Sources are the earlier transactions whose value this one consumes.
pub struct Transaction {
    number: u32,
    sender: Option<NodeId>,
    receiver: NodeId,
    amount: i64,
    remainder: i64,
    sources: Vec<Arc<Transaction>>,
    block_number: OnceLock<u32>,
    hash: OnceLock<ContentHash>,
}

impl Transaction {
    /// Create a regular transaction. It gets its block number when it is
    /// sealed into a block of the sender's chain.
    pub fn new(
        number: u32,
        sender: NodeId,
        receiver: NodeId,
        amount: i64,
        remainder: i64,
        sources: impl IntoIterator<Item = Arc<Transaction>>,
    ) -> Self {
        Self::from_parts(number, Some(sender), receiver, amount, remainder, sources, None)
    }

    /// Create the initial endowment of `receiver`. Genesis transactions
    /// always live in block 0.
    pub fn genesis(number: u32, receiver: NodeId, amount: i64) -> Self {
        Self::from_parts(number, None, receiver, amount, 0, Vec::new(), Some(0))
    }

    /// Reassemble a transaction from its fields, as decoded from the wire.
    pub fn from_parts(
        number: u32,
        sender: Option<NodeId>,
        receiver: NodeId,
        amount: i64,
        remainder: i64,
        sources: impl IntoIterator<Item = Arc<Transaction>>,
        block_number: Option<u32>,
    ) -> Self {
        let mut sources: Vec<Arc<Transaction>> = sources.into_iter().collect();
        sources.sort_by_key(|source| source.key());
        sources.dedup_by_key(|source| source.key());

        let cell = OnceLock::new();
        if let Some(block_number) = block_number {
            let _ = cell.set(block_number);
        }

        Self {
            number,
            sender,
            receiver,
            amount,
            remainder,
            sources,
            block_number: cell,
            hash: OnceLock::new(),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// `None` for genesis transactions
    pub fn sender(&self) -> Option<NodeId> {
        self.sender
    }

    pub fn receiver(&self) -> NodeId {
        self.receiver
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn remainder(&self) -> i64 {
        self.remainder
    }

    /// Sources in [`TransactionKey`] order
    pub fn sources(&self) -> &[Arc<Transaction>] {
        &self.sources
    }

    pub fn is_genesis(&self) -> bool {
        self.sender.is_none()
    }

    pub fn key(&self) -> TransactionKey {
        TransactionKey {
            sender: self.sender,
            number: self.number,
            receiver: self.receiver,
        }
    }

    /// The chain this transaction lives on. Genesis transactions are
    /// reachable through the chain of their receiver.
    pub fn chain_owner(&self) -> NodeId {
        self.sender.unwrap_or(self.receiver)
    }

    pub fn block_number(&self) -> Option<u32> {
        self.block_number.get().copied()
    }

    /// Fails when the transaction already sits in a block other than `number`
    pub(crate) fn check_block_number(&self, number: u32) -> Result<(), LedgerError> {
        match self.block_number() {
            Some(existing) if existing != number => Err(LedgerError::BlockNumberReassigned {
                number: self.number,
                existing,
                requested: number,
            }),
            _ => Ok(()),
        }
    }

    /// Record the block this transaction was placed in. Placing it again in
    /// the same block is a no-op, moving it is an error.
    pub(crate) fn assign_block_number(&self, number: u32) -> Result<(), LedgerError> {
        let existing = *self.block_number.get_or_init(|| number);
        if existing != number {
            return Err(LedgerError::BlockNumberReassigned {
                number: self.number,
                existing,
                requested: number,
            });
        }
        Ok(())
    }

    /// Content hash over number, sender, receiver, amount, remainder and the
    /// ordered source hashes. The block number is not part of it.
    pub fn hash(&self) -> ContentHash {
        *self.hash.get_or_init(|| {
            let mut hasher = ContentHasher::new();
            hasher
                .u32(self.number)
                .node(self.sender)
                .node(Some(self.receiver))
                .i64(self.amount)
                .i64(self.remainder);
            for source in &self.sources {
                hasher.hash(&source.hash());
            }
            hasher.finish()
        })
    }

    /// Money `node` can spend out of this transaction: the amount if it
    /// received it, otherwise the remainder if it sent it.
    pub fn contribution_to(&self, node: NodeId) -> Option<i64> {
        if self.receiver == node {
            Some(self.amount)
        } else if self.sender == Some(node) {
            Some(self.remainder)
        } else {
            None
        }
    }

    /// Whether the two transactions consume at least one common source
    pub fn shares_source_with(&self, other: &Transaction) -> bool {
        if self.sources.is_empty() || other.sources.is_empty() {
            return false;
        }
        let mine: HashSet<ContentHash> = self.sources.iter().map(|s| s.hash()).collect();
        other.sources.iter().any(|s| mine.contains(&s.hash()))
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.sender == other.sender
            && self.receiver == other.receiver
            && self.amount == other.amount
            && self.remainder == other.remainder
            && self.block_number() == other.block_number()
            && self.sources.len() == other.sources.len()
            && self
                .sources
                .iter()
                .zip(&other.sources)
                .all(|(a, b)| a.hash() == b.hash())
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("number", &self.number)
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("amount", &self.amount)
            .field("remainder", &self.remainder)
            .field("sources", &self.sources.iter().map(|s| s.key()).collect::<Vec<_>>())
            .field("block_number", &self.block_number())
            .finish()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sender {
            Some(sender) => write!(
                f,
                "T{}({} -> {}, {} + {})",
                self.number, sender, self.receiver, self.amount, self.remainder
            ),
            None => write!(f, "G{}(-> {}, {})", self.number, self.receiver, self.amount),
        }
    }
}
