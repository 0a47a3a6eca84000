use crate::ledger::{ChainViewError, LedgerError};
use scaleout_common::NodeId;

/// The proof is malformed; nothing in it can be trusted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error(transparent)]
    InvalidView(#[from] ChainViewError),

    #[error("Transaction {transaction} is not in block {block} of chain {owner}")]
    MissingTransaction {
        transaction: String,
        owner: NodeId,
        block: u32,
    },

    #[error("Transaction {transaction} has no block number")]
    Unplaced { transaction: String },

    #[error("Transaction {transaction} spends {dependency}, which is not placed before it")]
    SourceOrder {
        transaction: String,
        dependency: String,
    },

    #[error("Transaction {transaction} depends on itself")]
    Cycle { transaction: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Transaction {transaction} was already received")]
    Replay { transaction: String },

    #[error("Malformed proof: {0}")]
    Structural(#[from] StructuralError),

    #[error("Transaction {transaction} in block {block} is not final yet")]
    NotFinal { transaction: String, block: u32 },

    #[error("Transaction {transaction} moves {actual} but its sources hold {expected}")]
    MoneyMismatch {
        transaction: String,
        expected: i64,
        actual: i64,
    },

    #[error("Source {dependency} of {transaction} neither paid nor was paid by its sender")]
    SourceNotInvolvingSender {
        transaction: String,
        dependency: String,
    },

    #[error("Transaction {transaction} spends a source already spent by {conflicting}")]
    DoubleSpend {
        transaction: String,
        conflicting: String,
    },

    #[error("Invalid genesis transaction {transaction}: {reason}")]
    InvalidGenesis { transaction: String, reason: String },

    #[error("Transaction {transaction} depends on the invalid {dependency}")]
    InvalidSource {
        transaction: String,
        dependency: String,
    },

    #[error("Chain of node {node} cannot be resolved locally")]
    UnknownDependency { node: NodeId },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ValidationError {
    /// Failures that depend only on the transaction's content. Retrying the
    /// same proof later cannot change the verdict.
    pub fn is_intrinsic(&self) -> bool {
        matches!(
            self,
            ValidationError::MoneyMismatch { .. }
                | ValidationError::SourceNotInvolvingSender { .. }
                | ValidationError::DoubleSpend { .. }
                | ValidationError::InvalidGenesis { .. }
                | ValidationError::InvalidSource { .. }
        )
    }
}
