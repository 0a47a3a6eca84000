/// Node directory
///
/// Pull-based lookup of participant records: public key and address by id.
/// Nothing is pushed; callers refresh when they meet an unknown id.

use parking_lot::RwLock;
use scaleout_common::{NodeId, NodeInfo, Result, ScaleOutError};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

pub trait NodeDirectory: Send + Sync {
    /// Cached record for `id`
    fn lookup(&self, id: NodeId) -> Option<NodeInfo>;

    /// Pull the current membership from the backing source
    fn refresh(&self) -> Result<Vec<NodeInfo>>;

    fn node_ids(&self) -> Vec<NodeId>;
}

/// Directory over a fixed membership list, optionally loaded from a JSON
/// snapshot of a tracker.
pub struct StaticDirectory {
    nodes: RwLock<HashMap<NodeId, NodeInfo>>,
}

impl StaticDirectory {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into_iter().map(|info| (info.id, info)).collect()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let nodes: Vec<NodeInfo> =
            serde_json::from_str(json).map_err(|e| ScaleOutError::serialization(e.to_string()))?;
        Ok(Self::new(nodes))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        let mut nodes: Vec<NodeInfo> = self.nodes.read().values().cloned().collect();
        nodes.sort_by_key(|info| info.id);
        serde_json::to_string_pretty(&nodes).map_err(|e| ScaleOutError::serialization(e.to_string()))
    }

    /// Register or replace a record
    pub fn register(&self, info: NodeInfo) {
        debug!(node = %info.id, address = %info.address, "Registered node");
        self.nodes.write().insert(info.id, info);
    }
}

impl NodeDirectory for StaticDirectory {
    fn lookup(&self, id: NodeId) -> Option<NodeInfo> {
        self.nodes.read().get(&id).cloned()
    }

    fn refresh(&self) -> Result<Vec<NodeInfo>> {
        let mut nodes = self.nodes.write();
        for info in nodes.values_mut() {
            info.update_last_seen();
        }
        Ok(nodes.values().cloned().collect())
    }

    fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.read().keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scaleout_common::NetworkAddress;

    fn info(id: i32) -> NodeInfo {
        NodeInfo::new(
            NodeId::new(id),
            [id as u8; 32],
            NetworkAddress::from_domain("localhost", 40000 + id as u16),
        )
    }

    #[test]
    fn test_lookup_and_register() {
        let directory = StaticDirectory::new(vec![info(1), info(2)]);
        assert_eq!(directory.lookup(NodeId::new(1)).unwrap().port(), 40001);
        assert!(directory.lookup(NodeId::new(3)).is_none());

        directory.register(info(3));
        assert_eq!(directory.node_ids(), vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]);
        assert_eq!(directory.refresh().unwrap().len(), 3);
    }

    #[test]
    fn test_json_snapshot() {
        let directory = StaticDirectory::new(vec![info(2), info(1)]);
        let json = directory.to_json().unwrap();

        let loaded = StaticDirectory::from_json(&json).unwrap();
        assert_eq!(loaded.lookup(NodeId::new(2)), directory.lookup(NodeId::new(2)));
        assert_eq!(loaded.node_ids().len(), 2);

        assert!(StaticDirectory::from_json("{not json").is_err());
    }
}
