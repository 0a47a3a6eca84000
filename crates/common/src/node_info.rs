use crate::types::{NetworkAddress, Timestamp};
use crate::NodeId;
use serde::{Deserialize, Serialize};

/// Directory record for a participant: who it is, how to check its
/// signatures and where to deliver proofs to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,

    /// Ed25519 verifying key, hex encoded on the wire
    #[serde(with = "public_key_hex")]
    pub public_key: [u8; 32],

    /// When the directory last confirmed this record
    pub last_seen: Timestamp,

    pub address: NetworkAddress,
}

impl NodeInfo {
    pub fn new(id: NodeId, public_key: [u8; 32], address: NetworkAddress) -> Self {
        Self {
            id,
            public_key,
            last_seen: Timestamp::now(),
            address,
        }
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn update_last_seen(&mut self) {
        self.last_seen = Timestamp::now();
    }

    pub fn is_stale(&self, max_age_secs: u64) -> bool {
        self.last_seen.elapsed().as_secs() > max_age_secs
    }
}

mod public_key_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))
    }
}
