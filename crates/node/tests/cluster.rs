//! Four-replica loopback cluster tests.
//!
//! Replicas exchange messages through an in-process network that delivers
//! straight into each destination's event queue, and execute against a
//! hash-chained ledger double that acknowledges immediately.

use conclave_core::{AllowAll, CommError, Communicator, Event, EventSender, ExecutionService};
use conclave_messages::{ConsensusMessage, Message};
use conclave_node::Replica;
use conclave_pbft::PbftConfig;
use conclave_types::{Hash, ReplicaId, RequestBatch};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Delivers sends directly into the destination replica's event queue.
#[derive(Default)]
struct LoopbackNetwork {
    queues: Mutex<HashMap<ReplicaId, EventSender>>,
}

impl LoopbackNetwork {
    fn register(&self, id: ReplicaId, queue: EventSender) {
        self.queues.lock().unwrap().insert(id, queue);
    }
}

impl Communicator for LoopbackNetwork {
    fn send(&self, dest: ReplicaId, msg: &ConsensusMessage) -> Result<(), CommError> {
        let queues = self.queues.lock().unwrap();
        match queues.get(&dest) {
            Some(queue) => {
                let _ = queue.send(Event::Incoming(Message::Consensus(msg.clone())));
                Ok(())
            }
            None => Err(CommError::Unreachable(dest)),
        }
    }
}

/// Ledger double: folds executed batch digests into a running state hash
/// and acknowledges each execution immediately.
struct LedgerSim {
    id: ReplicaId,
    queue: Mutex<Option<EventSender>>,
    state: Mutex<Hash>,
    executed_tx: Sender<(ReplicaId, u64, Hash)>,
}

impl LedgerSim {
    fn new(id: ReplicaId, executed_tx: Sender<(ReplicaId, u64, Hash)>) -> Self {
        Self {
            id,
            queue: Mutex::new(None),
            state: Mutex::new(Hash::ZERO),
            executed_tx,
        }
    }

    fn set_queue(&self, queue: EventSender) {
        *self.queue.lock().unwrap() = Some(queue);
    }
}

impl ExecutionService for LedgerSim {
    fn execute(&self, seq_no: u64, batch: &RequestBatch) {
        let digest = batch.digest();
        let mut state = self.state.lock().unwrap();
        *state = Hash::from_parts(&[state.as_bytes(), digest.as_bytes()]);
        let state_digest = *state;
        drop(state);

        let _ = self.executed_tx.send((self.id, seq_no, digest));
        if let Some(queue) = self.queue.lock().unwrap().as_ref() {
            let _ = queue.send(Event::ExecutionComplete {
                seq_no,
                state_digest,
            });
        }
    }
}

struct Cluster {
    replicas: Vec<Replica>,
    executed_rx: Receiver<(ReplicaId, u64, Hash)>,
}

impl Cluster {
    /// Start replicas with the given ids; ids absent from the list are
    /// simply never started, which looks like a crashed replica.
    fn start(config: PbftConfig, ids: &[u64]) -> Self {
        let network = Arc::new(LoopbackNetwork::default());
        let (executed_tx, executed_rx) = unbounded();

        let mut replicas = Vec::new();
        for &i in ids {
            let id = ReplicaId(i);
            let ledger = Arc::new(LedgerSim::new(id, executed_tx.clone()));
            let replica = Replica::new(
                id,
                config.clone(),
                network.clone(),
                ledger.clone(),
                Arc::new(AllowAll),
            )
            .expect("valid config");
            ledger.set_queue(replica.queue());
            network.register(id, replica.queue());
            replicas.push(replica);
        }

        Cluster {
            replicas,
            executed_rx,
        }
    }

    fn replica(&self, id: u64) -> &Replica {
        self.replicas
            .iter()
            .find(|r| r.id() == ReplicaId(id))
            .expect("replica is running")
    }

    /// Wait until every listed replica has executed `seq_no`, and return
    /// the batch digest each one reported.
    fn await_execution(&self, seq_no: u64, ids: &[u64]) -> HashMap<ReplicaId, Hash> {
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut digests: HashMap<ReplicaId, Hash> = HashMap::new();
        while digests.len() < ids.len() {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_default();
            let (id, n, digest) = self
                .executed_rx
                .recv_timeout(remaining)
                .expect("cluster executed the sequence number in time");
            if n == seq_no && ids.contains(&id.0) {
                digests.insert(id, digest);
            }
        }
        digests
    }

    fn halt(mut self) {
        for replica in &mut self.replicas {
            replica.halt();
        }
    }
}

fn cluster_config() -> PbftConfig {
    PbftConfig {
        batch_size: 2,
        // Generous progress timeouts so slow CI never triggers a spurious
        // view change.
        request_timeout: Duration::from_secs(30),
        batch_timeout: Duration::from_secs(20),
        ..Default::default()
    }
}

#[test]
fn test_cluster_orders_and_executes_a_batch() {
    let cluster = Cluster::start(cluster_config(), &[0, 1, 2, 3]);

    // Two transactions at the primary fill a batch.
    cluster.replica(0).submit(b"tx-a".to_vec());
    cluster.replica(0).submit(b"tx-b".to_vec());

    let digests = cluster.await_execution(1, &[0, 1, 2, 3]);
    let reference = digests[&ReplicaId(0)];
    assert!(digests.values().all(|d| *d == reference));

    cluster.halt();
}

#[test]
fn test_transactions_submitted_at_a_backup_are_relayed() {
    let cluster = Cluster::start(cluster_config(), &[0, 1, 2, 3]);

    cluster.replica(2).submit(b"tx-a".to_vec());
    cluster.replica(2).submit(b"tx-b".to_vec());

    let digests = cluster.await_execution(1, &[0, 1, 2, 3]);
    assert_eq!(digests.len(), 4);

    cluster.halt();
}

#[test]
fn test_cluster_orders_successive_batches() {
    let cluster = Cluster::start(cluster_config(), &[0, 1, 2, 3]);

    cluster.replica(0).submit(b"tx-a".to_vec());
    cluster.replica(0).submit(b"tx-b".to_vec());
    let first = cluster.await_execution(1, &[0, 1, 2, 3]);

    cluster.replica(0).submit(b"tx-c".to_vec());
    cluster.replica(0).submit(b"tx-d".to_vec());
    let second = cluster.await_execution(2, &[0, 1, 2, 3]);

    // Same order everywhere, and the second batch is a different one.
    assert!(first.values().all(|d| *d == first[&ReplicaId(0)]));
    assert!(second.values().all(|d| *d == second[&ReplicaId(0)]));
    assert_ne!(first[&ReplicaId(0)], second[&ReplicaId(0)]);

    cluster.halt();
}

#[test]
fn test_silent_primary_is_deposed_and_service_resumes() {
    // Heartbeat detection must stay the shortest-fused timeout here, so
    // the batch and request timeouts shrink with it.
    let config = PbftConfig {
        batch_size: 2,
        batch_timeout: Duration::from_millis(200),
        request_timeout: Duration::from_secs(2),
        null_request_timeout: Duration::from_secs(3),
        ..PbftConfig::default()
    };

    // Replica 0, primary of view 0, never starts.
    let cluster = Cluster::start(config, &[1, 2, 3]);

    // The surviving replicas view-change to view 1 on their own; once
    // replica 1 is primary, submissions order and execute without 0.
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        cluster.replica(1).submit(b"tx-a".to_vec());
        cluster.replica(1).submit(b"tx-b".to_vec());
        match cluster.executed_rx.recv_timeout(Duration::from_secs(2)) {
            Ok((_, n, _)) => {
                assert!(n >= 1);
                break;
            }
            Err(_) if Instant::now() < deadline => continue,
            Err(e) => panic!("no execution after the view change: {e}"),
        }
    }

    cluster.halt();
}
