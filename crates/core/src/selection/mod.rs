/// Source selection
///
/// Chooses which unspent transactions pay for a new one, trading amount
/// coverage against how much foreign history the receiver would have to be
/// sent.

mod creator;
mod tuple;

pub use creator::TransactionCreator;
pub use tuple::{CostVector, SourceTuple, TupleKind};

use crate::ledger::LedgerError;
use scaleout_common::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("Insufficient funds: {available} available, {requested} requested")]
    InsufficientFunds { available: i64, requested: i64 },

    #[error("Invalid amount {0}")]
    InvalidAmount(i64),

    #[error("Unknown receiver {0}")]
    UnknownReceiver(NodeId),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
