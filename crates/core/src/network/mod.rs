/// Proof delivery between nodes
///
/// The sender ships the proofs of our own transactions once their blocks are
/// final enough. The receiver verifies incoming proofs one at a time, in
/// arrival order.

pub mod receiver;
pub mod sender;
pub mod transport;

pub use receiver::{Delivery, ReceiveError, TransactionReceiver};
pub use sender::{SendError, TransactionSender};
pub use transport::{LocalTransport, ProofTransport};
