use super::transport::ProofTransport;
use crate::ledger::{Block, BlockAbstract, LedgerError};
use crate::mainchain::MainChainError;
use crate::proof::{ProofConstructor, ProofError};
use crate::protocol::{Message, MessagePayload, ProofMessage};
use crate::store::LocalStore;
use parking_lot::Mutex;
use scaleout_common::config::sender::LARGE_PROOF_BLOCKS;
use scaleout_common::{NodeId, ScaleOutError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Proof(#[from] ProofError),

    #[error(transparent)]
    Transport(#[from] ScaleOutError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("No peer {0}")]
    UnknownReceiver(NodeId),
}

#[derive(Default)]
struct Progress {
    /// Every transaction up to this block went out
    already_sent: u32,

    /// Transactions of the block after `already_sent` that went out
    partial: BTreeSet<u32>,
}

/// Sends the proofs of our transactions once their blocks are final.
///
/// A block goes out when at least `required_commits` committed blocks
/// exist at or after it. Abstracts the main chain could not take yet are
/// kept here and submitted again on every round.
pub struct TransactionSender {
    store: Arc<LocalStore>,
    transport: Arc<dyn ProofTransport>,
    progress: Mutex<Progress>,
    pending_abstracts: Mutex<Vec<BlockAbstract>>,
}

impl TransactionSender {
    pub fn new(store: Arc<LocalStore>, transport: Arc<dyn ProofTransport>) -> Self {
        Self {
            store,
            transport,
            progress: Mutex::new(Progress::default()),
            pending_abstracts: Mutex::new(Vec::new()),
        }
    }

    /// Number of the last block whose transactions all went out
    pub fn already_sent(&self) -> u32 {
        self.progress.lock().already_sent
    }

    pub fn pending_abstracts(&self) -> usize {
        self.pending_abstracts.lock().len()
    }

    /// Submit an abstract, keeping it for retry if the main chain is not
    /// reachable. Returns whether it was accepted.
    pub fn submit_abstract(&self, abstract_: BlockAbstract) -> Result<bool, MainChainError> {
        match self.store.main_chain().commit_abstract(&abstract_) {
            Ok(_) => {
                info!(
                    node = %self.store.own_id(),
                    block = abstract_.block_number(),
                    "Committed abstract"
                );
                Ok(true)
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    node = %self.store.own_id(),
                    block = abstract_.block_number(),
                    "Abstract not committed, will retry: {}",
                    e
                );
                self.pending_abstracts.lock().push(abstract_);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Submit every kept abstract again. Returns how many went through.
    pub fn retry_abstracts(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending_abstracts.lock());
        if pending.is_empty() {
            return 0;
        }

        let mut committed = 0;
        let mut kept = Vec::new();
        for abstract_ in pending {
            match self.store.main_chain().commit_abstract(&abstract_) {
                Ok(_) => committed += 1,
                Err(e) if e.is_retryable() => kept.push(abstract_),
                Err(e) => error!(
                    node = %self.store.own_id(),
                    block = abstract_.block_number(),
                    "Main chain rejected abstract: {}",
                    e
                ),
            }
        }
        if !kept.is_empty() {
            debug!(node = %self.store.own_id(), pending = kept.len(), "Abstracts still pending");
        }
        self.pending_abstracts.lock().extend(kept);
        committed
    }

    /// Send everything that has become final enough. Returns the number of
    /// proofs sent.
    pub fn send_round(&self, required_commits: usize) -> Result<usize, SendError> {
        self.retry_abstracts();
        self.store.refresh_own_finality()?;

        let blocks = self.sendable_blocks(required_commits.max(1));
        let mut sent = 0;
        for block in blocks {
            sent += self.send_block(&block)?;
            let mut progress = self.progress.lock();
            progress.already_sent = block.number();
            progress.partial.clear();
        }
        Ok(sent)
    }

    fn sendable_blocks(&self, required_commits: usize) -> Vec<Arc<Block>> {
        let own = self.store.own_peer();
        let chain = own.chain().read();
        let already_sent = self.already_sent();

        let backlog = chain
            .last_block_number()
            .map_or(0, |last| last.saturating_sub(already_sent)) as usize;
        if backlog > self.store.config().max_blocks_pending {
            warn!(node = %self.store.own_id(), backlog, "Many blocks waiting to be sent");
        }

        let committed = chain.committed_blocks();
        if committed.len() < required_commits {
            return Vec::new();
        }
        let limit = committed[committed.len() - required_commits];
        if limit <= already_sent {
            return Vec::new();
        }

        chain.blocks()[(already_sent + 1) as usize..=limit as usize].to_vec()
    }

    fn send_block(&self, block: &Block) -> Result<usize, SendError> {
        let own_id = self.store.own_id();
        let mut sent = 0;
        for transaction in block.transactions() {
            if transaction.receiver() == own_id {
                continue;
            }
            if self.progress.lock().partial.contains(&transaction.number()) {
                continue;
            }

            let proof = ProofConstructor::new(&self.store, transaction.clone())?.construct()?;
            let receiver = self
                .store
                .peer(transaction.receiver())
                .ok_or(SendError::UnknownReceiver(transaction.receiver()))?;
            let message = ProofMessage::from_proof(
                &proof,
                receiver.meta(),
                self.store.main_chain().current_height(),
            );
            if message.block_count() > LARGE_PROOF_BLOCKS {
                warn!(
                    node = %own_id,
                    transaction = %transaction,
                    blocks = message.block_count(),
                    "Large proof"
                );
            }

            let bytes = Message::new(own_id, MessagePayload::Proof(message)).to_bytes()?;
            let size = bytes.len();
            if let Err(e) = self.transport.send(transaction.receiver(), bytes) {
                error!(node = %own_id, transaction = %transaction, "Failed to send proof: {}", e);
                return Err(e.into());
            }

            self.store.record_sent(&proof);
            self.progress.lock().partial.insert(transaction.number());
            debug!(
                node = %own_id,
                transaction = %transaction,
                blocks = proof.block_count(),
                bytes = size,
                "Sent proof"
            );
            sent += 1;
        }
        Ok(sent)
    }

    /// Run sending rounds until `shutdown` flips, then flush with a single
    /// required commit
    pub fn spawn(
        self: Arc<Self>,
        initial_delay: Duration,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let required_commits = self.store.config().required_commits;

            let stopped = tokio::select! {
                _ = tokio::time::sleep(initial_delay) => false,
                _ = shutdown.changed() => true,
            };

            if !stopped {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = self.send_round(required_commits) {
                                error!(node = %self.store.own_id(), "Sending round failed: {}", e);
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }

            match self.send_round(1) {
                Ok(sent) => info!(node = %self.store.own_id(), flushed = sent, "Sender stopped"),
                Err(e) => error!(node = %self.store.own_id(), "Final sending round failed: {}", e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LocalTransport, TransactionReceiver};
    use crate::test_utils::{keypair, node, TestCluster};

    fn wired(cluster: &TestCluster, from: i32, to: i32) -> (TransactionSender, Arc<TransactionReceiver>) {
        let transport = Arc::new(LocalTransport::new());
        let receiver = Arc::new(TransactionReceiver::new(cluster.store(to).clone()));
        transport.attach(node(to), receiver.clone()).unwrap();
        let sender = TransactionSender::new(cluster.store(from).clone(), transport);
        (sender, receiver)
    }

    #[test]
    fn test_waits_for_required_commits() {
        let cluster = TestCluster::new(2, 100);
        let (sender, receiver) = wired(&cluster, 0, 1);

        cluster.pay(0, 1, 25);
        cluster.seal_and_commit(0);
        assert_eq!(sender.send_round(2).unwrap(), 0);
        assert_eq!(receiver.pending(), 0);

        cluster.seal_and_commit(0);
        assert_eq!(sender.send_round(2).unwrap(), 1);
        assert_eq!(sender.already_sent(), 1);
        assert_eq!(receiver.deliver_all(), crate::network::Delivery::Accepted);
        assert_eq!(cluster.store(1).available_money(), 125);

        // Nothing is sent twice
        cluster.seal_and_commit(0);
        assert_eq!(sender.send_round(2).unwrap(), 0);
        assert_eq!(receiver.pending(), 0);
    }

    #[test]
    fn test_flush_with_single_commit() {
        let cluster = TestCluster::new(2, 100);
        let (sender, receiver) = wired(&cluster, 0, 1);

        cluster.pay(0, 1, 25);
        cluster.seal_and_commit(0);
        assert_eq!(sender.send_round(1).unwrap(), 1);
        assert_eq!(receiver.pending(), 1);
    }

    #[test]
    fn test_self_payment_not_sent() {
        let cluster = TestCluster::new(2, 100);
        let (sender, receiver) = wired(&cluster, 0, 1);

        cluster.pay(0, 0, 25);
        cluster.seal_and_commit(0);
        assert_eq!(sender.send_round(1).unwrap(), 0);
        assert_eq!(sender.already_sent(), 1);
        assert_eq!(receiver.pending(), 0);
    }

    #[test]
    fn test_sending_updates_receiver_knowledge() {
        let cluster = TestCluster::new(2, 100);
        let (sender, _receiver) = wired(&cluster, 0, 1);

        cluster.pay(0, 1, 25);
        cluster.seal_and_commit(0);
        sender.send_round(1).unwrap();

        let peer = cluster.store(0).peer(node(1)).unwrap();
        assert_eq!(peer.meta().last_known_block_number(node(0)), Some(1));
    }

    #[test]
    fn test_failed_send_is_retried() {
        let cluster = TestCluster::new(2, 100);
        let transport = Arc::new(LocalTransport::new());
        let sender = TransactionSender::new(cluster.store(0).clone(), transport.clone());

        cluster.pay(0, 1, 25);
        cluster.seal_and_commit(0);
        assert!(matches!(sender.send_round(1), Err(SendError::Transport(_))));
        assert_eq!(sender.already_sent(), 0);

        let receiver = Arc::new(TransactionReceiver::new(cluster.store(1).clone()));
        transport.attach(node(1), receiver.clone()).unwrap();
        assert_eq!(sender.send_round(1).unwrap(), 1);
        assert_eq!(receiver.pending(), 1);
    }

    #[test]
    fn test_abstracts_retried_until_main_chain_returns() {
        let cluster = TestCluster::new(2, 100);
        let (sender, _receiver) = wired(&cluster, 0, 1);

        cluster.main_chain().set_available(false);
        let block = cluster.seal(0);
        let abstract_ = block.calculate_abstract(node(0), &keypair(0)).unwrap();
        assert!(!sender.submit_abstract(abstract_).unwrap());
        assert_eq!(sender.pending_abstracts(), 1);
        assert_eq!(sender.retry_abstracts(), 0);

        cluster.main_chain().set_available(true);
        assert_eq!(sender.retry_abstracts(), 1);
        assert_eq!(sender.pending_abstracts(), 0);
        assert_eq!(cluster.store(0).refresh_own_finality().unwrap(), Some(1));
    }
}
