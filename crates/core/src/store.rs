/// Local store
///
/// Everything a node knows: its own chain, its mirrors of foreign chains,
/// what each peer is believed to know, and the money it can still spend.

use crate::directory::NodeDirectory;
use crate::ledger::{
    Block, Chain, ChainKind, LedgerError, MetaKnowledge, OracleMetaKnowledge, OracleSource,
    TrackedMetaKnowledge, Transaction, TransactionKey,
};
use crate::mainchain::MainChain;
use crate::proof::Proof;
use crate::selection::{SelectionError, TransactionCreator};
use crate::validation::{ValidationError, Verification};
use parking_lot::{Mutex, RwLock};
use scaleout_common::{MetaKnowledgeMode, NodeConfig, NodeId, NodeInfo};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// A participant as seen from this node
pub struct Peer {
    id: NodeId,
    info: RwLock<Option<NodeInfo>>,
    chain: RwLock<Chain>,
    meta: Box<dyn MetaKnowledge>,
}

impl Peer {
    fn new(id: NodeId, kind: ChainKind, meta: Box<dyn MetaKnowledge>) -> Self {
        Self {
            id,
            info: RwLock::new(None),
            chain: RwLock::new(Chain::new(id, kind)),
            meta,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn info(&self) -> Option<NodeInfo> {
        self.info.read().clone()
    }

    pub fn set_info(&self, info: NodeInfo) {
        *self.info.write() = Some(info);
    }

    pub fn chain(&self) -> &RwLock<Chain> {
        &self.chain
    }

    /// What this peer is believed to know
    pub fn meta(&self) -> &dyn MetaKnowledge {
        self.meta.as_ref()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("chain", &*self.chain.read())
            .finish()
    }
}

/// Transactions this node can still spend from
#[derive(Debug)]
pub struct UnspentSet {
    owner: NodeId,
    entries: BTreeMap<TransactionKey, Arc<Transaction>>,
    available: i64,
}

impl UnspentSet {
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            entries: BTreeMap::new(),
            available: 0,
        }
    }

    /// Add a transaction that pays or returns money to the owner
    pub fn insert(&mut self, transaction: Arc<Transaction>) -> bool {
        let Some(value) = transaction.contribution_to(self.owner) else {
            return false;
        };
        if self.entries.insert(transaction.key(), transaction).is_some() {
            return false;
        }
        self.available += value;
        true
    }

    pub fn remove(&mut self, transaction: &Transaction) -> bool {
        match self.entries.remove(&transaction.key()) {
            Some(removed) => {
                self.available -= removed.contribution_to(self.owner).unwrap_or(0);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, transaction: &Transaction) -> bool {
        self.entries.contains_key(&transaction.key())
    }

    pub fn available_money(&self) -> i64 {
        self.available
    }

    /// Snapshot in key order
    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct LocalStore {
    own_id: NodeId,
    config: NodeConfig,
    genesis: Arc<Block>,
    peers: RwLock<HashMap<NodeId, Arc<Peer>>>,
    unspent: Mutex<UnspentSet>,
    transaction_counter: AtomicU32,
    verification: Verification,
    main_chain: Arc<dyn MainChain>,
    directory: Arc<dyn NodeDirectory>,
    oracle: Option<Arc<dyn OracleSource>>,
}

impl LocalStore {
    /// Create the store of `config.node_id`, installing `genesis` as block 0
    /// of its own chain.
    pub fn new(
        config: NodeConfig,
        genesis: Arc<Block>,
        main_chain: Arc<dyn MainChain>,
        directory: Arc<dyn NodeDirectory>,
    ) -> Result<Self, LedgerError> {
        Self::with_oracle(config, genesis, main_chain, directory, None)
    }

    /// Like [`LocalStore::new`], with a source of ground truth for
    /// [`MetaKnowledgeMode::Oracle`]
    pub fn with_oracle(
        config: NodeConfig,
        genesis: Arc<Block>,
        main_chain: Arc<dyn MainChain>,
        directory: Arc<dyn NodeDirectory>,
        oracle: Option<Arc<dyn OracleSource>>,
    ) -> Result<Self, LedgerError> {
        let own_id = NodeId::new(config.node_id);
        if config.meta_knowledge == MetaKnowledgeMode::Oracle && oracle.is_none() {
            warn!(node = %own_id, "Oracle meta knowledge requested without a source, tracking instead");
        }

        let store = Self {
            own_id,
            config,
            genesis: genesis.clone(),
            peers: RwLock::new(HashMap::new()),
            unspent: Mutex::new(UnspentSet::new(own_id)),
            transaction_counter: AtomicU32::new(0),
            verification: Verification::new(),
            main_chain,
            directory,
            oracle,
        };

        let own = Arc::new(Peer::new(own_id, ChainKind::Own, store.meta_for(own_id)));
        {
            let mut chain = own.chain().write();
            chain.set_genesis_block(genesis)?;
            let endowment = chain
                .genesis_transaction()
                .cloned()
                .ok_or(LedgerError::MissingGenesis { owner: own_id })?;
            if endowment.amount() > 0 {
                store.unspent.lock().insert(endowment);
            }
        }
        store.peers.write().insert(own_id, own);

        info!(node = %own_id, money = store.available_money(), "Local store ready");
        Ok(store)
    }

    fn meta_for(&self, owner: NodeId) -> Box<dyn MetaKnowledge> {
        match (&self.config.meta_knowledge, &self.oracle) {
            (MetaKnowledgeMode::Oracle, Some(source)) => {
                Box::new(OracleMetaKnowledge::new(owner, source.clone()))
            }
            _ => {
                let meta = TrackedMetaKnowledge::new(owner);
                // Everybody holds the genesis block of every chain
                for tx in self.genesis.transactions() {
                    meta.update_last_known_block_number(tx.receiver(), 0);
                }
                Box::new(meta)
            }
        }
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn genesis(&self) -> &Arc<Block> {
        &self.genesis
    }

    pub fn main_chain(&self) -> &Arc<dyn MainChain> {
        &self.main_chain
    }

    pub fn directory(&self) -> &Arc<dyn NodeDirectory> {
        &self.directory
    }

    pub fn verification(&self) -> &Verification {
        &self.verification
    }

    pub fn own_peer(&self) -> Arc<Peer> {
        self.peers.read()[&self.own_id].clone()
    }

    /// Look up a participant, registering it on first sight when the
    /// directory or the genesis block knows it
    pub fn peer(&self, id: NodeId) -> Option<Arc<Peer>> {
        if let Some(peer) = self.peers.read().get(&id) {
            return Some(peer.clone());
        }

        let info = self.directory.lookup(id);
        let in_genesis = self.genesis.transactions().iter().any(|tx| tx.receiver() == id);
        if info.is_none() && !in_genesis {
            return None;
        }

        let mut peers = self.peers.write();
        if let Some(peer) = peers.get(&id) {
            return Some(peer.clone());
        }
        let peer = Arc::new(Peer::new(id, ChainKind::Foreign, self.meta_for(id)));
        if let Err(err) = peer.chain().write().set_genesis_block(self.genesis.clone()) {
            warn!(node = %id, error = %err, "Cannot install genesis block");
            return None;
        }
        if let Some(info) = info {
            peer.set_info(info);
        }
        debug!(node = %self.own_id, peer = %id, "Registered peer");
        peers.insert(id, peer.clone());
        Some(peer)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|peer| peer.id());
        peers
    }

    pub fn next_transaction_number(&self) -> u32 {
        self.transaction_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn unspent(&self) -> &Mutex<UnspentSet> {
        &self.unspent
    }

    pub fn available_money(&self) -> i64 {
        self.unspent.lock().available_money()
    }

    /// Find a transaction held locally by `(chain, block, number)`
    pub fn find_transaction(&self, chain: NodeId, block: u32, number: u32) -> Option<Arc<Transaction>> {
        let peer = self.peer(chain)?;
        let chain = peer.chain().read();
        chain.find_transaction(block, number).cloned()
    }

    /// Nearest final block of `chain` at or after `number`, asking the main
    /// chain when the local anchor is not set yet
    pub fn finality_anchor(&self, chain: &Chain, number: u32) -> Option<u32> {
        if let Some(anchor) = chain.committed_anchor(number) {
            return Some(anchor);
        }
        chain
            .blocks()
            .get(number as usize..)?
            .iter()
            .find(|block| self.main_chain.is_block_present(block))
            .map(|block| block.number())
    }

    /// Mark every block present on the main chain as committed, oldest
    /// first, so each block is anchored to the nearest one. Returns the
    /// newest block marked.
    pub fn sync_finality(&self, chain: &mut Chain) -> Result<Option<u32>, LedgerError> {
        let start = chain.last_committed_block().map_or(0, |last| last + 1);
        let present: Vec<u32> = chain
            .blocks()
            .iter()
            .skip(start as usize)
            .filter(|block| self.main_chain.is_block_present(block))
            .map(|block| block.number())
            .collect();

        for number in &present {
            chain.mark_committed(*number)?;
        }
        Ok(present.last().copied())
    }

    pub fn refresh_own_finality(&self) -> Result<Option<u32>, LedgerError> {
        let own = self.own_peer();
        let mut chain = own.chain().write();
        self.sync_finality(&mut chain)
    }

    /// Pay `amount` to `receiver` and queue the transaction for our next
    /// block
    pub fn make_transaction(
        &self,
        receiver: NodeId,
        amount: i64,
    ) -> Result<Arc<Transaction>, SelectionError> {
        let transaction = TransactionCreator::new(self, receiver, amount)?.create_transaction()?;
        self.own_peer()
            .chain()
            .write()
            .append_pending(transaction.clone())?;
        Ok(transaction)
    }

    /// Seal our pending transactions into a new block
    pub fn seal_block(&self) -> Result<Arc<Block>, LedgerError> {
        self.own_peer().chain().write().seal_block()
    }

    /// Verify an incoming proof and, only if it holds, apply it.
    pub fn accept_proof(&self, proof: &Proof) -> Result<(), ValidationError> {
        self.verification.validate_new_message(proof, self)?;
        self.apply_updates(proof)?;

        let transaction = proof.transaction();
        if transaction.receiver() == self.own_id && transaction.amount() > 0 {
            self.unspent.lock().insert(transaction.clone());
        }
        info!(
            node = %self.own_id,
            transaction = %transaction,
            blocks = proof.block_count(),
            "Accepted transaction"
        );
        Ok(())
    }

    /// Merge verified updates into our foreign chains and record what the
    /// sender evidently knows.
    ///
    /// Every chain is checked before any of them changes, so a rejected
    /// proof leaves the store as it was. Foreign chains only grow here.
    fn apply_updates(&self, proof: &Proof) -> Result<(), LedgerError> {
        let mut targets = Vec::with_capacity(proof.chain_updates().len());
        for (owner, blocks) in proof.chain_updates() {
            if *owner == self.own_id {
                continue;
            }
            let Some(peer) = self.peer(*owner) else {
                continue;
            };
            peer.chain().read().check_update(blocks)?;
            targets.push((*owner, peer, blocks));
        }

        let sender = proof.transaction().sender();
        for (owner, peer, blocks) in targets {
            {
                let mut chain = peer.chain().write();
                let appended = chain.update(blocks)?;
                if appended > 0 {
                    self.sync_finality(&mut chain)?;
                }
            }

            if let (Some(sender), Some(last)) = (sender, blocks.last()) {
                if let Some(sender_peer) = self.peer(sender) {
                    sender_peer
                        .meta()
                        .update_last_known_block_number(owner, last.number());
                }
            }
        }
        Ok(())
    }

    /// Remember that `receiver` now holds everything `proof` carried
    pub fn record_sent(&self, proof: &Proof) {
        let Some(receiver) = self.peer(proof.transaction().receiver()) else {
            return;
        };
        for (owner, blocks) in proof.chain_updates() {
            if let Some(last) = blocks.last() {
                receiver
                    .meta()
                    .update_last_known_block_number(*owner, last.number());
            }
        }
    }
}

impl OracleSource for LocalStore {
    /// Height of `chain` as held here. Only answers for this store's own
    /// node; [`StoreOracle`] routes other observers to their stores.
    fn last_block_number(&self, observer: NodeId, chain: NodeId) -> Option<u32> {
        if observer != self.own_id {
            return None;
        }
        // May run while this node already reads one of its chains
        if let Some(peer) = self.peers.read_recursive().get(&chain) {
            return peer.chain().read_recursive().last_block_number();
        }
        self.genesis
            .transactions()
            .iter()
            .any(|tx| tx.receiver() == chain)
            .then_some(0)
    }

    fn known_chains(&self, observer: NodeId) -> Vec<NodeId> {
        if observer != self.own_id {
            return Vec::new();
        }
        let mut chains: Vec<NodeId> = self.peers.read_recursive().keys().copied().collect();
        chains.extend(self.genesis.transactions().iter().map(|tx| tx.receiver()));
        chains.sort();
        chains.dedup();
        chains
    }
}

/// Ground truth over every store living in this process, for
/// [`MetaKnowledgeMode::Oracle`].
///
/// Each observer is answered from its own store. Stores are held weakly
/// since every store also holds the oracle.
#[derive(Default)]
pub struct StoreOracle {
    stores: RwLock<HashMap<NodeId, Weak<LocalStore>>>,
}

impl StoreOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, store: &Arc<LocalStore>) {
        self.stores
            .write()
            .insert(store.own_id(), Arc::downgrade(store));
    }

    fn store(&self, id: NodeId) -> Option<Arc<LocalStore>> {
        self.stores.read().get(&id).and_then(Weak::upgrade)
    }
}

impl OracleSource for StoreOracle {
    fn last_block_number(&self, observer: NodeId, chain: NodeId) -> Option<u32> {
        self.store(observer)?.last_block_number(observer, chain)
    }

    fn known_chains(&self, observer: NodeId) -> Vec<NodeId> {
        self.store(observer)
            .map(|store| store.known_chains(observer))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for StoreOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOracle")
            .field("stores", &self.stores.read().len())
            .finish()
    }
}
