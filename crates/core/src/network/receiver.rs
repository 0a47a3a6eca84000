use crate::protocol::{DecodeError, Message, MessagePayload, ProofDecoder, ProofMessage};
use crate::store::LocalStore;
use crate::validation::ValidationError;
use parking_lot::Mutex;
use scaleout_common::{NodeId, ScaleOutError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("Malformed proof: {0}")]
    Decode(#[from] DecodeError),

    #[error("Proof addressed to {actual}, this is {expected}")]
    WrongReceiver { expected: NodeId, actual: i32 },

    #[error("Rejected proof: {0}")]
    Validation(#[from] ValidationError),
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Nothing queued
    Idle,
    Accepted,
    Rejected,
    /// The head of the queue waits for the main chain to reach `required`
    Deferred { required: u64, current: u64 },
}

/// Delivers incoming proofs to the local store, strictly in arrival order.
///
/// A proof whose required main-chain height is above ours stays at the
/// head of the queue until the main chain catches up. Nothing is dropped
/// while waiting.
pub struct TransactionReceiver {
    store: Arc<LocalStore>,
    queue: Mutex<VecDeque<ProofMessage>>,
    notify: Notify,
}

impl TransactionReceiver {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Queue an encoded message for delivery
    pub fn enqueue(&self, bytes: &[u8]) -> scaleout_common::Result<()> {
        let message = Message::from_bytes(bytes)?;
        let MessagePayload::Proof(proof) = message.payload;
        if proof.receiver() != Some(self.store.own_id()) {
            return Err(ScaleOutError::protocol(format!(
                "proof for {} delivered to {}",
                proof.transaction.receiver_id,
                self.store.own_id()
            )));
        }
        debug!(
            node = %self.store.own_id(),
            from = message.sender,
            blocks = proof.block_count(),
            "Queued proof"
        );
        self.push(proof);
        Ok(())
    }

    pub fn push(&self, proof: ProofMessage) {
        self.queue.lock().push_back(proof);
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Try to deliver the head of the queue
    pub fn deliver(&self) -> Delivery {
        let proof = {
            let mut queue = self.queue.lock();
            let Some(head) = queue.front() else {
                return Delivery::Idle;
            };
            let current = self.store.main_chain().current_height();
            if head.required_height > current {
                return Delivery::Deferred {
                    required: head.required_height,
                    current,
                };
            }
            match queue.pop_front() {
                Some(proof) => proof,
                None => return Delivery::Idle,
            }
        };

        match self.process(&proof) {
            Ok(()) => Delivery::Accepted,
            Err(e) => {
                warn!(
                    node = %self.store.own_id(),
                    transaction = proof.transaction.number,
                    sender = proof.transaction.sender_id,
                    "{}",
                    e
                );
                Delivery::Rejected
            }
        }
    }

    /// Deliver until the queue is empty or its head has to wait
    pub fn deliver_all(&self) -> Delivery {
        let mut last = Delivery::Idle;
        loop {
            match self.deliver() {
                Delivery::Idle => return last,
                deferred @ Delivery::Deferred { .. } => return deferred,
                outcome => last = outcome,
            }
        }
    }

    fn process(&self, proof: &ProofMessage) -> Result<(), ReceiveError> {
        let own_id = self.store.own_id();
        if proof.receiver() != Some(own_id) {
            return Err(ReceiveError::WrongReceiver {
                expected: own_id,
                actual: proof.transaction.receiver_id,
            });
        }
        let decoded = ProofDecoder::new(&self.store, proof).decode()?;
        self.store.accept_proof(&decoded)?;
        Ok(())
    }

    /// Run the delivery loop until `shutdown` flips
    pub fn spawn(
        self: Arc<Self>,
        recheck: Duration,
        max_backoff: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = recheck;
            loop {
                if *shutdown.borrow() {
                    break;
                }

                match self.deliver_all() {
                    Delivery::Deferred { required, current } => {
                        debug!(
                            node = %self.store.own_id(),
                            required,
                            current,
                            backoff_ms = backoff.as_millis() as u64,
                            "Deferring proof until main chain catches up"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown.changed() => break,
                        }
                        backoff = (backoff * 2).min(max_backoff);
                    }
                    _ => {
                        backoff = recheck;
                        tokio::select! {
                            _ = self.notify.notified() => {}
                            _ = tokio::time::sleep(recheck) => {}
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }

            let left = self.pending();
            if left > 0 {
                warn!(node = %self.store.own_id(), pending = left, "Receiver stopped with undelivered proofs");
            } else {
                info!(node = %self.store.own_id(), "Receiver stopped");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainchain::MainChain;
    use crate::proof::Proof;
    use crate::test_utils::{node, TestCluster};

    fn message(cluster: &TestCluster, proof: &Proof, required_height: u64) -> ProofMessage {
        let sender = proof.transaction().sender().unwrap().as_i32();
        let receiver = cluster
            .store(sender)
            .peer(proof.transaction().receiver())
            .unwrap();
        ProofMessage::from_proof(proof, receiver.meta(), required_height)
    }

    #[test]
    fn test_deliver_accepts_in_order() {
        let cluster = TestCluster::new(3, 100);
        let receiver = TransactionReceiver::new(cluster.store(2).clone());

        let first = cluster.pay(0, 2, 10);
        cluster.seal_and_commit(0);
        let second = cluster.pay(1, 2, 20);
        cluster.seal_and_commit(1);

        receiver.push(message(&cluster, &cluster.proof(&first), 0));
        receiver.push(message(&cluster, &cluster.proof(&second), 0));
        assert_eq!(receiver.pending(), 2);

        assert_eq!(receiver.deliver(), Delivery::Accepted);
        assert_eq!(cluster.store(2).available_money(), 110);
        assert_eq!(receiver.deliver_all(), Delivery::Accepted);
        assert_eq!(cluster.store(2).available_money(), 130);
        assert_eq!(receiver.deliver(), Delivery::Idle);
    }

    #[test]
    fn test_waits_for_main_chain_height() {
        let cluster = TestCluster::new(3, 100);
        let receiver = TransactionReceiver::new(cluster.store(1).clone());

        let tx = cluster.pay(0, 1, 10);
        cluster.seal_and_commit(0);
        let height = cluster.main_chain().current_height();
        receiver.push(message(&cluster, &cluster.proof(&tx), height + 2));

        assert_eq!(
            receiver.deliver_all(),
            Delivery::Deferred {
                required: height + 2,
                current: height
            }
        );
        assert_eq!(receiver.pending(), 1);

        cluster.seal_and_commit(2);
        cluster.seal_and_commit(2);
        assert_eq!(receiver.deliver_all(), Delivery::Accepted);
        assert_eq!(receiver.pending(), 0);
        assert_eq!(cluster.store(1).available_money(), 110);
    }

    #[test]
    fn test_rejected_proof_is_dropped_and_queue_continues() {
        let cluster = TestCluster::new(3, 100);
        let receiver = TransactionReceiver::new(cluster.store(2).clone());

        let tx = cluster.pay(0, 2, 10);
        cluster.seal_and_commit(0);
        let proof = cluster.proof(&tx);
        let mut tampered = message(&cluster, &proof, 0);
        tampered.transaction.amount = 90;

        receiver.push(tampered);
        receiver.push(message(&cluster, &proof, 0));

        assert_eq!(receiver.deliver(), Delivery::Rejected);
        assert_eq!(receiver.deliver(), Delivery::Accepted);
        assert_eq!(cluster.store(2).available_money(), 110);
    }

    #[test]
    fn test_wrong_receiver_rejected() {
        let cluster = TestCluster::new(3, 100);
        let receiver = TransactionReceiver::new(cluster.store(2).clone());

        let tx = cluster.pay(0, 1, 10);
        cluster.seal_and_commit(0);
        let proof = message(&cluster, &cluster.proof(&tx), 0);

        let bytes = Message::new(node(0), MessagePayload::Proof(proof.clone()))
            .to_bytes()
            .unwrap();
        assert!(receiver.enqueue(&bytes).is_err());

        receiver.push(proof);
        assert_eq!(receiver.deliver(), Delivery::Rejected);
        assert_eq!(cluster.store(2).available_money(), 100);
    }
}
