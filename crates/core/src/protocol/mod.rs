/// Wire protocol
///
/// Proofs travel as descriptors: transactions reference their sources by
/// `(chain owner, block number, transaction number)` and blocks carry their
/// claimed hashes, which the decoder recomputes.

pub mod decode;
pub mod messages;

pub use decode::{DecodeError, ProofDecoder};
pub use messages::{
    BlockDescriptor, Message, MessagePayload, ProofMessage, SourceRef, TransactionDescriptor,
    NO_BLOCK,
};
