//! In-process clusters for unit tests

use crate::directory::StaticDirectory;
use crate::identity::KeyPair;
use crate::ledger::{Block, Transaction};
use crate::mainchain::{InMemoryMainChain, MainChain};
use crate::ledger::OracleSource;
use crate::proof::{Proof, ProofConstructor};
use crate::protocol::{Message, MessagePayload, ProofDecoder, ProofMessage};
use crate::store::{LocalStore, StoreOracle};
use scaleout_common::{MetaKnowledgeMode, NetworkAddress, NodeConfig, NodeId, NodeInfo};
use std::sync::Arc;

pub(crate) fn node(id: i32) -> NodeId {
    NodeId::new(id)
}

pub(crate) fn keypair(id: i32) -> KeyPair {
    KeyPair::from_seed(id as u64)
}

pub(crate) fn node_info(id: i32) -> NodeInfo {
    NodeInfo::new(
        node(id),
        keypair(id).public_bytes(),
        NetworkAddress::from_domain("localhost", 40000 + id as u16),
    )
}

/// `n` stores sharing one genesis block, one directory and one main chain
pub(crate) struct TestCluster {
    main_chain: Arc<InMemoryMainChain>,
    genesis: Arc<Block>,
    stores: Vec<Arc<LocalStore>>,
}

impl TestCluster {
    pub(crate) fn new(n: usize, money: i64) -> Self {
        Self::with_meta_knowledge(n, money, MetaKnowledgeMode::Tracked)
    }

    /// Oracle mode reads every peer's actual store through one shared
    /// [`StoreOracle`]
    pub(crate) fn with_meta_knowledge(n: usize, money: i64, mode: MetaKnowledgeMode) -> Self {
        let directory = Arc::new(StaticDirectory::new(
            (0..n as i32).map(node_info).collect(),
        ));
        let main_chain = Arc::new(InMemoryMainChain::new().with_directory(directory.clone()));
        main_chain.init().unwrap();
        let genesis = Arc::new(Block::genesis_for((0..n as i32).map(node), money).unwrap());
        let oracle = Arc::new(StoreOracle::new());

        let stores: Vec<Arc<LocalStore>> = (0..n as i32)
            .map(|id| {
                let config = NodeConfig::new(id)
                    .with_initial_money(money)
                    .with_meta_knowledge(mode);
                let source = (mode == MetaKnowledgeMode::Oracle)
                    .then(|| oracle.clone() as Arc<dyn OracleSource>);
                Arc::new(
                    LocalStore::with_oracle(
                        config,
                        genesis.clone(),
                        main_chain.clone(),
                        directory.clone(),
                        source,
                    )
                    .unwrap(),
                )
            })
            .collect();
        for store in &stores {
            oracle.register(store);
        }

        Self {
            main_chain,
            genesis,
            stores,
        }
    }

    pub(crate) fn store(&self, id: i32) -> &Arc<LocalStore> {
        &self.stores[id as usize]
    }

    pub(crate) fn main_chain(&self) -> &Arc<InMemoryMainChain> {
        &self.main_chain
    }

    pub(crate) fn genesis_transaction(&self, id: i32) -> Arc<Transaction> {
        self.genesis.transactions()[id as usize].clone()
    }

    pub(crate) fn pay(&self, from: i32, to: i32, amount: i64) -> Arc<Transaction> {
        self.store(from).make_transaction(node(to), amount).unwrap()
    }

    pub(crate) fn seal(&self, id: i32) -> Arc<Block> {
        self.store(id).seal_block().unwrap()
    }

    pub(crate) fn seal_and_commit(&self, id: i32) -> Arc<Block> {
        let block = self.seal(id);
        let abstract_ = block.calculate_abstract(node(id), &keypair(id)).unwrap();
        self.main_chain.commit_abstract(&abstract_).unwrap();
        self.store(id).refresh_own_finality().unwrap();
        block
    }

    /// Commit the abstracts of several sealed blocks, then let the owner
    /// catch up on finality once
    pub(crate) fn commit(&self, id: i32, blocks: &[Arc<Block>]) {
        for block in blocks {
            let abstract_ = block.calculate_abstract(node(id), &keypair(id)).unwrap();
            self.main_chain.commit_abstract(&abstract_).unwrap();
        }
        self.store(id).refresh_own_finality().unwrap();
    }

    /// Place hand-made transactions in a new committed block, bypassing
    /// source selection
    pub(crate) fn forge(&self, id: i32, transactions: Vec<Arc<Transaction>>) -> Arc<Block> {
        {
            let own = self.store(id).own_peer();
            let mut chain = own.chain().write();
            for tx in transactions {
                chain.append_pending(tx).unwrap();
            }
        }
        self.seal_and_commit(id)
    }

    pub(crate) fn proof(&self, transaction: &Arc<Transaction>) -> Proof {
        let sender = transaction.sender().unwrap().as_i32();
        ProofConstructor::new(self.store(sender), transaction.clone())
            .unwrap()
            .construct()
            .unwrap()
    }

    /// Pay, commit, and deliver the proof
    pub(crate) fn transfer(&self, from: i32, to: i32, amount: i64) -> Arc<Transaction> {
        let tx = self.pay(from, to, amount);
        self.seal_and_commit(from);
        let proof = self.proof(&tx);
        self.store(to).accept_proof(&proof).unwrap();
        self.store(from).record_sent(&proof);
        tx
    }

    /// Deliver the proof of an already committed transaction the way a
    /// node does: encoded, sent, decoded against the receiver's store.
    /// Returns the proof as the receiver rebuilt it.
    pub(crate) fn deliver(&self, transaction: &Arc<Transaction>) -> Proof {
        let sender = transaction.sender().unwrap();
        let receiver = transaction.receiver();
        let proof = self.proof(transaction);

        let peer = self.store(sender.as_i32()).peer(receiver).unwrap();
        let message = ProofMessage::from_proof(
            &proof,
            peer.meta(),
            self.main_chain.current_height(),
        );
        let bytes = Message::new(sender, MessagePayload::Proof(message))
            .to_bytes()
            .unwrap();
        let MessagePayload::Proof(message) = Message::from_bytes(&bytes).unwrap().payload;

        let store = self.store(receiver.as_i32());
        let decoded = ProofDecoder::new(store, &message).decode().unwrap();
        store.accept_proof(&decoded).unwrap();
        self.store(sender.as_i32()).record_sent(&proof);
        decoded
    }
}
