use super::{Block, LedgerError};
use crate::identity::{KeyPair, PublicKey};
use scaleout_common::{ContentHash, NodeId, HASH_LEN};
use serde::{Deserialize, Serialize};

const HEADER_LEN: usize = 4 + 4 + HASH_LEN;
const SIGNATURE_LEN: usize = 64;

/// Signed summary of one block, the unit committed to the main chain.
/// A block counts as final once its abstract is present there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAbstract {
    owner: NodeId,
    block_number: u32,
    block_hash: ContentHash,
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
    main_chain_hash: Option<ContentHash>,
}

impl BlockAbstract {
    pub(crate) fn sign(
        owner: NodeId,
        block_number: u32,
        block_hash: ContentHash,
        keypair: &KeyPair,
    ) -> Self {
        let signature = keypair
            .sign(&Self::signed_bytes(owner, block_number, &block_hash))
            .to_vec();
        Self {
            owner,
            block_number,
            block_hash,
            signature,
            main_chain_hash: None,
        }
    }

    /// `(ownerId, blockNumber, blockHash)` in that order, big-endian
    fn signed_bytes(owner: NodeId, block_number: u32, block_hash: &ContentHash) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN);
        bytes.extend_from_slice(&owner.as_i32().to_be_bytes());
        bytes.extend_from_slice(&(block_number as i32).to_be_bytes());
        bytes.extend_from_slice(block_hash.as_bytes());
        bytes
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn block_number(&self) -> u32 {
        self.block_number
    }

    pub fn block_hash(&self) -> ContentHash {
        self.block_hash
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Hash of the main-chain entry that committed this abstract
    pub fn main_chain_hash(&self) -> Option<ContentHash> {
        self.main_chain_hash
    }

    pub fn set_main_chain_hash(&mut self, hash: ContentHash) {
        self.main_chain_hash = Some(hash);
    }

    pub fn verify(&self, public_key: &PublicKey) -> bool {
        let Ok(signature) = <[u8; SIGNATURE_LEN]>::try_from(self.signature.as_slice()) else {
            return false;
        };
        public_key.verify(
            &Self::signed_bytes(self.owner, self.block_number, &self.block_hash),
            &signature,
        )
    }

    /// Whether this abstract describes `block`
    pub fn check_block_hash(&self, block: &Block) -> bool {
        block.owner() == Some(self.owner)
            && block.number() == self.block_number
            && block.hash() == self.block_hash
    }

    /// Signed fields followed by the signature
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Self::signed_bytes(self.owner, self.block_number, &self.block_hash);
        bytes.extend_from_slice(&self.signature);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LedgerError> {
        if bytes.len() <= HEADER_LEN {
            return Err(LedgerError::InvalidAbstract(format!(
                "expected more than {} bytes, got {}",
                HEADER_LEN,
                bytes.len()
            )));
        }

        let owner = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let number = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let owner = NodeId::from_wire(owner)
            .ok_or_else(|| LedgerError::InvalidAbstract("genesis has no abstract".into()))?;
        let block_number = u32::try_from(number)
            .map_err(|_| LedgerError::InvalidAbstract(format!("negative block number {number}")))?;
        let block_hash = ContentHash::from_slice(&bytes[8..HEADER_LEN])
            .map_err(|e| LedgerError::InvalidAbstract(e.to_string()))?;

        Ok(Self {
            owner,
            block_number,
            block_hash,
            signature: bytes[HEADER_LEN..].to_vec(),
            main_chain_hash: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed() -> (KeyPair, BlockAbstract) {
        let keypair = KeyPair::generate();
        let abstract_ =
            BlockAbstract::sign(NodeId::new(4), 7, ContentHash::from_bytes([9u8; 32]), &keypair);
        (keypair, abstract_)
    }

    #[test]
    fn test_sign_and_verify() {
        let (keypair, abstract_) = signed();
        assert!(abstract_.verify(&keypair.public_key()));

        let stranger = KeyPair::generate();
        assert!(!abstract_.verify(&stranger.public_key()));
    }

    #[test]
    fn test_bytes_layout() {
        let (keypair, abstract_) = signed();
        let bytes = abstract_.to_bytes();

        assert_eq!(&bytes[0..4], &4i32.to_be_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_be_bytes());
        assert_eq!(&bytes[8..40], &[9u8; 32]);
        assert_eq!(bytes.len(), HEADER_LEN + SIGNATURE_LEN);

        let parsed = BlockAbstract::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, abstract_);
        assert!(parsed.verify(&keypair.public_key()));
    }

    #[test]
    fn test_tampered_abstract_fails() {
        let (keypair, abstract_) = signed();
        let mut bytes = abstract_.to_bytes();
        bytes[5] ^= 1;
        let parsed = BlockAbstract::from_bytes(&bytes).unwrap();
        assert!(!parsed.verify(&keypair.public_key()));
    }

    #[test]
    fn test_from_bytes_rejects_short_input() {
        assert!(BlockAbstract::from_bytes(&[0u8; HEADER_LEN]).is_err());
    }
}
