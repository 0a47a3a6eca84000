use super::receiver::TransactionReceiver;
use parking_lot::RwLock;
use scaleout_common::{NodeId, Result, ScaleOutError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Moves encoded proof messages between nodes
pub trait ProofTransport: Send + Sync {
    /// Start delivering messages addressed to `node` into `receiver`
    fn attach(&self, node: NodeId, receiver: Arc<TransactionReceiver>) -> Result<()>;

    /// Stop delivering to `node`
    fn detach(&self, node: NodeId);

    /// Hand an encoded message to the receiver's node
    fn send(&self, receiver: NodeId, bytes: Vec<u8>) -> Result<()>;
}

/// In-process transport: a registry of receivers shared by every node of
/// one process
#[derive(Default)]
pub struct LocalTransport {
    receivers: RwLock<HashMap<NodeId, Arc<TransactionReceiver>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self, node: NodeId) -> bool {
        self.receivers.read().contains_key(&node)
    }
}

impl ProofTransport for LocalTransport {
    fn attach(&self, node: NodeId, receiver: Arc<TransactionReceiver>) -> Result<()> {
        let mut receivers = self.receivers.write();
        if receivers.contains_key(&node) {
            return Err(ScaleOutError::network(format!("{} is already attached", node)));
        }
        receivers.insert(node, receiver);
        debug!(node = %node, "Attached to local transport");
        Ok(())
    }

    fn detach(&self, node: NodeId) {
        if self.receivers.write().remove(&node).is_some() {
            debug!(node = %node, "Detached from local transport");
        }
    }

    fn send(&self, receiver: NodeId, bytes: Vec<u8>) -> Result<()> {
        let target = self
            .receivers
            .read()
            .get(&receiver)
            .cloned()
            .ok_or_else(|| ScaleOutError::node_not_found(receiver.to_string()))?;
        target.enqueue(&bytes)
    }
}
