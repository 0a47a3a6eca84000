pub mod config;
pub mod error;
pub mod node_info;
pub mod types;

pub use config::{ConfigError, MetaKnowledgeMode, NodeConfig, SelectionMetric};
pub use error::{Result, ScaleOutError};
pub use node_info::NodeInfo;
pub use types::{NetworkAddress, Timestamp};

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub const HASH_LEN: usize = 32;

/// Wire value standing in for the sender of a genesis transaction and the
/// owner of the genesis block.
pub const GENESIS_SENTINEL: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid hash length: expected {expected}, got {actual}")]
    InvalidHash { expected: usize, actual: usize },
    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),
    #[error("invalid node id: {0}")]
    InvalidNodeId(String),
}

/// Identifier of a participant. Every participant owns exactly one chain,
/// so the same id names the chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(i32);

impl NodeId {
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    pub fn as_i32(&self) -> i32 {
        self.0
    }

    /// Maps a wire id to an optional node, `None` for the genesis sentinel.
    pub fn from_wire(id: i32) -> Option<Self> {
        (id != GENESIS_SENTINEL).then_some(Self(id))
    }

    /// Inverse of [`NodeId::from_wire`].
    pub fn to_wire(id: Option<Self>) -> i32 {
        id.map_or(GENESIS_SENTINEL, |node| node.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

impl From<i32> for NodeId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl FromStr for NodeId {
    type Err = DomainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let raw = s.strip_prefix('N').unwrap_or(s);
        let id: i32 = raw
            .parse()
            .map_err(|_| DomainError::InvalidNodeId(s.to_string()))?;
        if id == GENESIS_SENTINEL {
            return Err(DomainError::InvalidNodeId(s.to_string()));
        }
        Ok(Self(id))
    }
}

/// 32-byte content hash of a transaction, block or main-chain entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    pub const ZERO: ContentHash = ContentHash([0u8; HASH_LEN]);

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, DomainError> {
        if bytes.len() != HASH_LEN {
            return Err(DomainError::InvalidHash {
                expected: HASH_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; HASH_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, DomainError> {
        let decoded =
            hex::decode(hex_str).map_err(|err| DomainError::InvalidHashHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }

    /// First four bytes in hex, enough to tell hashes apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; HASH_LEN]> for ContentHash {
    fn from(value: [u8; HASH_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl TryFrom<&[u8]> for ContentHash {
    type Error = DomainError;

    fn try_from(value: &[u8]) -> std::result::Result<Self, Self::Error> {
        Self::from_slice(value)
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
