pub mod directory;
pub mod identity;
pub mod ledger;
pub mod mainchain;
pub mod network;
pub mod node;
pub mod proof;
pub mod protocol;
pub mod selection;
pub mod store;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_utils;

pub use identity::{KeyPair, KeyPairError, PublicKey};

// Re-export ledger types
pub use ledger::{
    Block, BlockAbstract, Chain, ChainKind, ChainView, ChainViewError, LedgerError,
    MetaKnowledge, OracleMetaKnowledge, OracleSource, TrackedMetaKnowledge, Transaction,
    TransactionKey,
};

// Re-export runtime types
pub use directory::{NodeDirectory, StaticDirectory};
pub use mainchain::{InMemoryMainChain, MainChain, MainChainError};
pub use network::{
    Delivery, LocalTransport, ProofTransport, ReceiveError, SendError, TransactionReceiver,
    TransactionSender,
};
pub use node::{NetworkServices, Node, NodeStats};
pub use store::{LocalStore, Peer, StoreOracle, UnspentSet};

// Re-export proof handling types
pub use proof::{Proof, ProofConstructor, ProofError};
pub use protocol::{DecodeError, ProofDecoder, ProofMessage};
pub use selection::{CostVector, SelectionError, SourceTuple, TransactionCreator, TupleKind};
pub use validation::{StructuralError, ValidationError, Verification};
