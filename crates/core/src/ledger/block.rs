use super::{BlockAbstract, ContentHasher, LedgerError, Transaction};
use crate::identity::KeyPair;
use scaleout_common::{ContentHash, NodeId};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// An ordered batch of one participant's transactions.
///
/// Immutable once built, apart from the lazily computed hash and the
/// `next_committed` pointer filled in by finality feedback.
pub struct Block {
    number: u32,
    owner: Option<NodeId>,
    previous_hash: Option<ContentHash>,
    transactions: Vec<Arc<Transaction>>,
    hash: OnceLock<ContentHash>,
    next_committed: OnceLock<u32>,
}

impl Block {
    /// Build the shared genesis block holding every initial endowment.
    /// It is final by definition.
    pub fn genesis(transactions: Vec<Arc<Transaction>>) -> Result<Self, LedgerError> {
        let block = Self::from_parts(0, None, None, transactions)?;
        let _ = block.next_committed.set(0);
        Ok(block)
    }

    /// Genesis block endowing each of `nodes` with `amount`
    pub fn genesis_for(
        nodes: impl IntoIterator<Item = NodeId>,
        amount: i64,
    ) -> Result<Self, LedgerError> {
        let transactions = nodes
            .into_iter()
            .enumerate()
            .map(|(i, node)| Arc::new(Transaction::genesis(i as u32, node, amount)))
            .collect();
        Self::genesis(transactions)
    }

    /// Build the block following `previous` on `owner`'s chain
    pub fn next(
        previous: &Block,
        owner: NodeId,
        transactions: Vec<Arc<Transaction>>,
    ) -> Result<Self, LedgerError> {
        Self::from_parts(
            previous.number + 1,
            Some(owner),
            Some(previous.hash()),
            transactions,
        )
    }

    /// Assemble a block from its fields. Every transaction is placed in
    /// this block; one already placed elsewhere is rejected.
    pub fn from_parts(
        number: u32,
        owner: Option<NodeId>,
        previous_hash: Option<ContentHash>,
        transactions: Vec<Arc<Transaction>>,
    ) -> Result<Self, LedgerError> {
        // Nothing is placed unless every transaction can be
        for tx in &transactions {
            tx.check_block_number(number)?;
        }
        for tx in &transactions {
            tx.assign_block_number(number)?;
        }

        Ok(Self {
            number,
            owner,
            previous_hash,
            transactions,
            hash: OnceLock::new(),
            next_committed: OnceLock::new(),
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// `None` for the genesis block
    pub fn owner(&self) -> Option<NodeId> {
        self.owner
    }

    pub fn previous_hash(&self) -> Option<ContentHash> {
        self.previous_hash
    }

    pub fn transactions(&self) -> &[Arc<Transaction>] {
        &self.transactions
    }

    pub fn is_genesis(&self) -> bool {
        self.owner.is_none()
    }

    /// Content hash chaining the previous hash, the owner and every
    /// transaction hash in order
    pub fn hash(&self) -> ContentHash {
        *self.hash.get_or_init(|| {
            let mut hasher = ContentHasher::new();
            hasher
                .u32(self.number)
                .hash(&self.previous_hash.unwrap_or(ContentHash::ZERO))
                .node(self.owner);
            for tx in &self.transactions {
                hasher.hash(&tx.hash());
            }
            hasher.finish()
        })
    }

    pub fn contains(&self, transaction: &Transaction) -> bool {
        let hash = transaction.hash();
        self.transactions.iter().any(|tx| tx.hash() == hash)
    }

    /// Look up a transaction of this block by its number
    pub fn transaction(&self, number: u32) -> Option<&Arc<Transaction>> {
        self.transactions.iter().find(|tx| tx.number() == number)
    }

    /// The nearest block at or after this one known to be final
    pub fn next_committed_block(&self) -> Option<u32> {
        self.next_committed.get().copied()
    }

    pub fn is_committed(&self) -> bool {
        self.next_committed_block() == Some(self.number)
    }

    /// Set once by finality feedback; later calls are ignored
    pub(crate) fn mark_next_committed(&self, number: u32) -> bool {
        self.next_committed.set(number).is_ok()
    }

    /// Sign the abstract of one of `caller`'s own blocks
    pub fn calculate_abstract(
        &self,
        caller: NodeId,
        keypair: &KeyPair,
    ) -> Result<BlockAbstract, LedgerError> {
        match self.owner {
            Some(owner) if owner == caller => {
                Ok(BlockAbstract::sign(owner, self.number, self.hash(), keypair))
            }
            owner => Err(LedgerError::NotBlockOwner {
                caller,
                owner,
                number: self.number,
            }),
        }
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
            && self.owner == other.owner
            && self.previous_hash == other.previous_hash
            && self.transactions.len() == other.transactions.len()
            && self
                .transactions
                .iter()
                .zip(&other.transactions)
                .all(|(a, b)| a == b)
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("number", &self.number)
            .field("owner", &self.owner)
            .field("transactions", &self.transactions.len())
            .field("next_committed", &self.next_committed_block())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i32) -> NodeId {
        NodeId::new(id)
    }

    fn genesis() -> Block {
        Block::genesis_for((0..3).map(node), 100).unwrap()
    }

    #[test]
    fn test_genesis_block() {
        let block = genesis();
        assert_eq!(block.number(), 0);
        assert!(block.is_genesis());
        assert!(block.is_committed());
        assert_eq!(block.transactions().len(), 3);
        assert_eq!(block.transaction(2).unwrap().receiver(), node(2));
        assert!(block.transactions().iter().all(|tx| tx.block_number() == Some(0)));
    }

    #[test]
    fn test_block_hash_determinism() {
        let genesis = genesis();
        let source = genesis.transaction(1).unwrap().clone();

        let build = |amount: i64| {
            let tx = Arc::new(Transaction::new(1, node(1), node(2), amount, 100 - amount, vec![source.clone()]));
            Block::next(&genesis, node(1), vec![tx]).unwrap()
        };

        let a = build(40);
        let b = build(40);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);

        // Any changed input changes the hash
        assert_ne!(a.hash(), build(41).hash());

        let other_owner = Block::from_parts(1, Some(node(2)), Some(genesis.hash()), vec![]).unwrap();
        let same_owner = Block::from_parts(1, Some(node(1)), Some(genesis.hash()), vec![]).unwrap();
        assert_ne!(other_owner.hash(), same_owner.hash());

        let other_previous = Block::from_parts(1, Some(node(1)), Some(ContentHash::ZERO), vec![]).unwrap();
        assert_ne!(other_previous.hash(), same_owner.hash());

        let other_number = Block::from_parts(2, Some(node(1)), Some(genesis.hash()), vec![]).unwrap();
        assert_ne!(other_number.hash(), same_owner.hash());
    }

    #[test]
    fn test_transactions_placed_in_block() {
        let genesis = genesis();
        let tx = Arc::new(Transaction::new(1, node(0), node(1), 10, 90, vec![]));
        let block = Block::next(&genesis, node(0), vec![tx.clone()]).unwrap();

        assert_eq!(tx.block_number(), Some(1));
        assert!(block.contains(&tx));

        let err = Block::from_parts(2, Some(node(0)), Some(block.hash()), vec![tx]).unwrap_err();
        assert!(matches!(err, LedgerError::BlockNumberReassigned { .. }));
    }

    #[test]
    fn test_rejected_block_places_nothing() {
        let genesis = genesis();
        let placed = Arc::new(Transaction::new(1, node(0), node(1), 10, 90, vec![]));
        let block = Block::next(&genesis, node(0), vec![placed.clone()]).unwrap();

        let fresh = Arc::new(Transaction::new(2, node(0), node(2), 5, 85, vec![]));
        let err = Block::from_parts(2, Some(node(0)), Some(block.hash()), vec![fresh.clone(), placed.clone()])
            .unwrap_err();
        assert!(matches!(err, LedgerError::BlockNumberReassigned { existing: 1, requested: 2, .. }));
        assert_eq!(fresh.block_number(), None);
        assert_eq!(placed.block_number(), Some(1));

        // Still free to go into the right block
        let retry = Block::from_parts(2, Some(node(0)), Some(block.hash()), vec![fresh.clone()]).unwrap();
        assert!(retry.contains(&fresh));
    }

    #[test]
    fn test_next_committed_set_once() {
        let genesis = genesis();
        let block = Block::next(&genesis, node(0), vec![]).unwrap();
        assert_eq!(block.next_committed_block(), None);

        assert!(block.mark_next_committed(3));
        assert!(!block.mark_next_committed(1));
        assert_eq!(block.next_committed_block(), Some(3));
        assert!(!block.is_committed());
    }

    #[test]
    fn test_abstract_requires_owner() {
        let keypair = KeyPair::generate();
        let genesis = genesis();
        let block = Block::next(&genesis, node(1), vec![]).unwrap();

        let abstract_ = block.calculate_abstract(node(1), &keypair).unwrap();
        assert_eq!(abstract_.block_hash(), block.hash());
        assert!(abstract_.verify(&keypair.public_key()));

        let err = block.calculate_abstract(node(2), &keypair).unwrap_err();
        assert!(matches!(err, LedgerError::NotBlockOwner { .. }));

        assert!(genesis.calculate_abstract(node(1), &keypair).is_err());
    }
}
