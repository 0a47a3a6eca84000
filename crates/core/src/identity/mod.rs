/// Participant identity: the signing keypair behind block abstracts

mod keypair;

pub use keypair::{KeyPair, KeyPairError, PublicKey};
