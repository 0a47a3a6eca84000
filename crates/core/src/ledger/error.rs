use scaleout_common::NodeId;

/// Misuse of the ledger model
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Chain {owner} has no genesis block")]
    MissingGenesis { owner: NodeId },

    #[error("Chain {owner} already has blocks, cannot install a genesis block")]
    GenesisAlreadySet { owner: NodeId },

    #[error("Block {number} is not a genesis block")]
    NotGenesisBlock { number: u32 },

    #[error("Chain {owner} is not owned by this node")]
    NotOwnChain { owner: NodeId },

    #[error("Chain {owner} is owned by this node and only grows by sealing blocks")]
    OwnChainUpdate { owner: NodeId },

    #[error("Node {caller} cannot compute the abstract of block {number} owned by {owner:?}")]
    NotBlockOwner {
        caller: NodeId,
        owner: Option<NodeId>,
        number: u32,
    },

    #[error("Transaction {number} already placed in block {existing}, cannot place it in block {requested}")]
    BlockNumberReassigned {
        number: u32,
        existing: u32,
        requested: u32,
    },

    #[error("Block {number} is out of range for chain {owner}")]
    BlockOutOfRange { owner: NodeId, number: u32 },

    #[error("Update for chain {owner} does not continue it: expected block {expected}, got {found}")]
    NonContiguousUpdate {
        owner: NodeId,
        expected: u32,
        found: u32,
    },

    #[error("Block {number} of chain {owner} does not link to its predecessor")]
    BrokenLink { owner: NodeId, number: u32 },

    #[error("Invalid block abstract: {0}")]
    InvalidAbstract(String),
}
