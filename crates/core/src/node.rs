/// Ledger node runtime
///
/// Ties a local store to the main chain and the proof transport, and runs
/// the sending and delivery loops in the background.

use crate::directory::NodeDirectory;
use crate::identity::KeyPair;
use crate::ledger::{Block, LedgerError, OracleSource, Transaction};
use crate::mainchain::MainChain;
use crate::network::{ProofTransport, TransactionReceiver, TransactionSender};
use crate::selection::SelectionError;
use crate::store::{LocalStore, StoreOracle};
use anyhow::{bail, Result};
use scaleout_common::{NodeConfig, NodeId};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Services every node of one network shares
#[derive(Clone)]
pub struct NetworkServices {
    /// Block 0 of every chain
    pub genesis: Arc<Block>,

    pub main_chain: Arc<dyn MainChain>,

    pub directory: Arc<dyn NodeDirectory>,

    pub transport: Arc<dyn ProofTransport>,

    /// Ground truth for oracle meta knowledge, shared by every node of an
    /// in-process network. Each node registers its store on creation.
    pub oracle: Option<Arc<StoreOracle>>,
}

/// Node statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStats {
    pub node_id: NodeId,
    pub available_money: i64,
    pub unspent: usize,
    pub last_block: Option<u32>,
    pub last_committed: Option<u32>,
    pub already_sent: u32,
    pub incoming: usize,
    pub pending_abstracts: usize,
    pub known_peers: usize,
    pub is_running: bool,
}

/// A ledger participant
pub struct Node {
    /// Node configuration
    config: NodeConfig,

    /// Signs the abstracts of our blocks
    keypair: KeyPair,

    /// Chains, unspent outputs and verification state
    store: Arc<LocalStore>,

    transport: Arc<dyn ProofTransport>,

    sender: Arc<TransactionSender>,

    receiver: Arc<TransactionReceiver>,

    /// Stops the background tasks
    shutdown: Option<watch::Sender<bool>>,

    tasks: Vec<JoinHandle<()>>,

    /// Whether the node is running
    running: Arc<RwLock<bool>>,
}

impl Node {
    /// Create a node with the given configuration
    pub fn new(config: NodeConfig, keypair: KeyPair, services: NetworkServices) -> Result<Self> {
        config.validate()?;
        let node_id = NodeId::new(config.node_id);
        info!(node = %node_id, "Initializing ledger node");

        match services.directory.lookup(node_id) {
            Some(info) if info.public_key != keypair.public_bytes() => {
                bail!("key pair of {} does not match the directory entry", node_id);
            }
            Some(_) => {}
            None => warn!(node = %node_id, "Node is not listed in the directory"),
        }

        let source = services
            .oracle
            .clone()
            .map(|oracle| oracle as Arc<dyn OracleSource>);
        let store = Arc::new(LocalStore::with_oracle(
            config.clone(),
            services.genesis,
            services.main_chain,
            services.directory,
            source,
        )?);
        if let Some(oracle) = &services.oracle {
            oracle.register(&store);
        }
        let sender = Arc::new(TransactionSender::new(
            store.clone(),
            services.transport.clone(),
        ));
        let receiver = Arc::new(TransactionReceiver::new(store.clone()));

        Ok(Self {
            config,
            keypair,
            store,
            transport: services.transport,
            sender,
            receiver,
            shutdown: None,
            tasks: Vec::new(),
            running: Arc::new(RwLock::new(false)),
        })
    }

    /// Start receiving proofs and sending our own
    pub async fn start(&mut self) -> Result<()> {
        if *self.running.read().await {
            warn!(node = %self.id(), "Node already running");
            return Ok(());
        }

        info!(node = %self.id(), "Starting ledger node");
        self.transport.attach(self.id(), self.receiver.clone())?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.tasks.push(self.receiver.clone().spawn(
            self.config.deliver_recheck(),
            self.config.max_deliver_backoff(),
            shutdown_rx.clone(),
        ));
        self.tasks.push(self.sender.clone().spawn(
            self.config.initial_sending_delay(),
            self.config.sending_wait_time(),
            shutdown_rx,
        ));
        self.shutdown = Some(shutdown);

        *self.running.write().await = true;
        info!(node = %self.id(), money = self.available_money(), "Node started");
        Ok(())
    }

    /// Stop the node, flushing every block with at least one commit
    pub async fn stop(&mut self) -> Result<()> {
        if !*self.running.read().await {
            return Ok(());
        }
        info!(node = %self.id(), "Stopping ledger node");
        *self.running.write().await = false;

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for task in self.tasks.drain(..) {
            task.await?;
        }
        self.transport.detach(self.id());

        info!(node = %self.id(), "Node stopped");
        Ok(())
    }

    /// Check if node is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn id(&self) -> NodeId {
        self.store.own_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn receiver(&self) -> &Arc<TransactionReceiver> {
        &self.receiver
    }

    pub fn sender(&self) -> &Arc<TransactionSender> {
        &self.sender
    }

    pub fn available_money(&self) -> i64 {
        self.store.available_money()
    }

    /// Pay `amount` to `receiver`. The transaction goes out once its block
    /// is final.
    pub fn pay(&self, receiver: NodeId, amount: i64) -> Result<Arc<Transaction>, SelectionError> {
        let transaction = self.store.make_transaction(receiver, amount)?;
        debug!(node = %self.id(), transaction = %transaction, "Queued payment");
        Ok(transaction)
    }

    /// Seal pending payments into a block and, every `commit_every` blocks,
    /// submit its abstract to the main chain
    pub fn seal_block(&self) -> Result<Arc<Block>> {
        let block = self.store.seal_block()?;
        info!(
            node = %self.id(),
            block = block.number(),
            transactions = block.transactions().len(),
            "Sealed block"
        );

        if block.number() % self.config.commit_every == 0 {
            let abstract_ = block.calculate_abstract(self.id(), &self.keypair)?;
            if self.sender.submit_abstract(abstract_)? {
                self.refresh_finality()?;
            }
        }
        Ok(block)
    }

    /// Mark our blocks whose abstracts reached the main chain as final
    pub fn refresh_finality(&self) -> Result<Option<u32>, LedgerError> {
        self.store.refresh_own_finality()
    }

    /// Get node statistics
    pub async fn stats(&self) -> NodeStats {
        let (last_block, last_committed) = {
            let own = self.store.own_peer();
            let chain = own.chain().read();
            (chain.last_block_number(), chain.last_committed_block())
        };

        NodeStats {
            node_id: self.id(),
            available_money: self.available_money(),
            unspent: self.store.unspent().lock().len(),
            last_block,
            last_committed,
            already_sent: self.sender.already_sent(),
            incoming: self.receiver.pending(),
            pending_abstracts: self.sender.pending_abstracts(),
            known_peers: self.store.peers().len(),
            is_running: *self.running.read().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::mainchain::InMemoryMainChain;
    use crate::network::LocalTransport;
    use crate::test_utils::{keypair, node, node_info};
    use scaleout_common::MetaKnowledgeMode;
    use std::time::Duration;

    fn network(n: i32, money: i64) -> (NetworkServices, Arc<InMemoryMainChain>) {
        let directory = Arc::new(StaticDirectory::new((0..n).map(node_info).collect()));
        let main_chain = Arc::new(InMemoryMainChain::new().with_directory(directory.clone()));
        main_chain.init().unwrap();
        let genesis = Arc::new(Block::genesis_for((0..n).map(node), money).unwrap());

        let services = NetworkServices {
            genesis,
            main_chain: main_chain.clone(),
            directory,
            transport: Arc::new(LocalTransport::new()),
            oracle: None,
        };
        (services, main_chain)
    }

    fn config(id: i32, required_commits: usize) -> NodeConfig {
        NodeConfig::new(id)
            .with_initial_money(100)
            .with_required_commits(required_commits)
            .with_timings(10, 5)
    }

    async fn wait_for_money(node: &Node, expected: i64) {
        for _ in 0..200 {
            if node.available_money() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "{} has {} instead of {}",
            node.id(),
            node.available_money(),
            expected
        );
    }

    #[test]
    fn test_rejects_foreign_key_pair() {
        let (services, _) = network(2, 100);
        assert!(Node::new(config(0, 1), keypair(1), services.clone()).is_err());
        assert!(Node::new(config(0, 1), keypair(0), services).is_ok());
    }

    #[test]
    fn test_seal_commits_every_nth_block() {
        let (services, main_chain) = network(2, 100);
        let node0 = Node::new(config(0, 1).with_commit_every(2), keypair(0), services).unwrap();

        node0.seal_block().unwrap();
        assert_eq!(main_chain.current_height(), 0);
        node0.seal_block().unwrap();
        assert_eq!(main_chain.current_height(), 1);
        assert_eq!(node0.refresh_finality().unwrap(), None);

        let own = node0.store().own_peer();
        assert_eq!(own.chain().read().last_committed_block(), Some(2));
        assert_eq!(own.chain().read().committed_anchor(1), Some(2));
    }

    #[test]
    fn test_unavailable_main_chain_keeps_abstract() {
        let (services, main_chain) = network(2, 100);
        let node0 = Node::new(config(0, 1), keypair(0), services).unwrap();

        main_chain.set_available(false);
        node0.seal_block().unwrap();
        assert_eq!(node0.sender().pending_abstracts(), 1);

        main_chain.set_available(true);
        assert_eq!(node0.sender().retry_abstracts(), 1);
        assert_eq!(node0.refresh_finality().unwrap(), Some(1));
    }

    #[test]
    fn test_oracle_nodes_see_actual_chains() {
        let (mut services, _) = network(2, 100);
        services.oracle = Some(Arc::new(StoreOracle::new()));
        let oracle = |id| config(id, 1).with_meta_knowledge(MetaKnowledgeMode::Oracle);
        let node0 = Node::new(oracle(0), keypair(0), services.clone()).unwrap();
        let node1 = Node::new(oracle(1), keypair(1), services).unwrap();

        node1.seal_block().unwrap();
        let peer = node0.store().peer(node(1)).unwrap();
        assert_eq!(peer.meta().last_known_block_number(node(1)), Some(1));
        assert_eq!(peer.meta().last_known_block_number(node(0)), Some(0));
    }

    #[tokio::test]
    async fn test_payment_between_running_nodes() {
        let (services, _) = network(2, 100);
        let mut node0 = Node::new(config(0, 1), keypair(0), services.clone()).unwrap();
        let mut node1 = Node::new(config(1, 1), keypair(1), services).unwrap();
        node0.start().await.unwrap();
        node1.start().await.unwrap();
        assert!(node0.is_running().await);

        node0.pay(node(1), 30).unwrap();
        node0.seal_block().unwrap();
        wait_for_money(&node1, 130).await;
        assert_eq!(node0.available_money(), 70);

        // The received money can be spent onwards
        node1.pay(node(0), 120).unwrap();
        node1.seal_block().unwrap();
        wait_for_money(&node0, 190).await;

        let stats = node1.stats().await;
        assert_eq!(stats.available_money, 10);
        assert_eq!(stats.last_committed, Some(1));
        assert!(stats.is_running);

        node0.stop().await.unwrap();
        node1.stop().await.unwrap();
        assert!(!node0.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_blocks() {
        let (services, _) = network(2, 100);
        let mut node0 = Node::new(config(0, 2), keypair(0), services.clone()).unwrap();
        let mut node1 = Node::new(config(1, 2), keypair(1), services).unwrap();
        node0.start().await.unwrap();
        node1.start().await.unwrap();

        node0.pay(node(1), 40).unwrap();
        node0.seal_block().unwrap();

        // One commit is not enough while running
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node0.sender().already_sent(), 0);

        node0.stop().await.unwrap();
        assert_eq!(node0.sender().already_sent(), 1);
        wait_for_money(&node1, 140).await;
        node1.stop().await.unwrap();
    }
}
