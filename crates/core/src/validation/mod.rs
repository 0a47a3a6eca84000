/// Proof verification
///
/// An incoming proof is trusted only after its transaction and, recursively,
/// every source it spends pass the structural, finality, conservation and
/// double-spend checks. Nothing is applied to local state before that.

mod error;
mod verification;

pub use error::{StructuralError, ValidationError};
pub use verification::Verification;
