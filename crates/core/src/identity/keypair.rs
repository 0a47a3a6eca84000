use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key a participant signs its block abstracts with. The secret half
/// never leaves this type.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Same seed, same key. Simulated clusters derive every
    /// participant's key from its node id this way.
    pub fn from_seed(seed: u64) -> Self {
        let secret = blake3::hash(&seed.to_be_bytes());
        Self {
            signing: SigningKey::from_bytes(secret.as_bytes()),
        }
    }

    /// Raw bytes as published in the participant directory
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: self.signing.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        self.public_key().verify(message, signature)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({})", self.public_key())
    }
}

/// Verifying half of a participant key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(with = "verifying_key_bytes")]
    key: VerifyingKey,
}

impl PublicKey {
    /// Parse a directory entry. Fails on points off the curve.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyPairError> {
        VerifyingKey::from_bytes(bytes)
            .map(|key| Self { key })
            .map_err(|_| KeyPairError::InvalidPublicKey)
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        self.key
            .verify(message, &Signature::from_bytes(signature))
            .is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyPairError {
    #[error("Public key is not a valid curve point")]
    InvalidPublicKey,
}

// VerifyingKey travels as its 32 compressed bytes
mod verifying_key_bytes {
    use ed25519_dalek::VerifyingKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(key: &VerifyingKey, serializer: S) -> Result<S::Ok, S::Error> {
        key.to_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<VerifyingKey, D::Error> {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        VerifyingKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_checks_message_and_signer() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"block abstract");

        assert!(keypair.verify(b"block abstract", &signature));
        assert!(keypair.public_key().verify(b"block abstract", &signature));
        assert!(!keypair.verify(b"other abstract", &signature));
        assert!(!KeyPair::generate().verify(b"block abstract", &signature));
    }

    #[test]
    fn test_seeded_keypair_is_deterministic() {
        assert_eq!(KeyPair::from_seed(7).public_bytes(), KeyPair::from_seed(7).public_bytes());
        assert_ne!(KeyPair::from_seed(7).public_bytes(), KeyPair::from_seed(8).public_bytes());
    }

    #[test]
    fn test_directory_bytes_parse_back() {
        let keypair = KeyPair::from_seed(3);
        let key = PublicKey::from_bytes(&keypair.public_bytes()).unwrap();
        assert_eq!(key, keypair.public_key());
        assert_eq!(key.as_bytes(), keypair.public_bytes());
    }

    #[test]
    fn test_public_key_bincode() {
        let key = KeyPair::from_seed(4).public_key();
        let bytes = bincode::serialize(&key).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bincode::deserialize::<PublicKey>(&bytes).unwrap(), key);
    }
}
