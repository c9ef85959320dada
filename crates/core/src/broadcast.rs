//! Fan-out broadcaster over a point-to-point [`Communicator`].
//!
//! One worker thread per peer drains a bounded queue, so one slow or dead
//! peer cannot stall the others or the consensus thread. A broadcast is
//! considered complete once `N - f` peer sends succeed or the broadcast
//! timeout elapses; stragglers keep sending in the background.

use crate::{Broadcaster, Communicator};
use conclave_messages::ConsensusMessage;
use conclave_types::ReplicaId;
use crossbeam::channel::{bounded, unbounded, Receiver as ChannelReceiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::warn;

/// Per-peer queue depth before messages to that peer are dropped.
const PEER_QUEUE_DEPTH: usize = 64;

struct WorkItem {
    msg: ConsensusMessage,
    done: Sender<bool>,
}

/// Broadcasts consensus messages to all peer replicas with an f-tolerant
/// completion policy.
pub struct PeerBroadcaster {
    inbox: Option<Sender<ConsensusMessage>>,
    handle: Option<JoinHandle<()>>,
}

impl PeerBroadcaster {
    /// Create a broadcaster for the given peer set.
    ///
    /// `f` is the fault tolerance: a broadcast is complete once
    /// `peers.len() - f` sends succeed. `timeout` bounds how long the
    /// dispatcher waits for that before logging and moving on.
    pub fn new(
        peers: Vec<ReplicaId>,
        f: u64,
        timeout: Duration,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        let handle = std::thread::spawn(move || dispatch_loop(peers, f, timeout, comm, inbox_rx));
        Self {
            inbox: Some(inbox_tx),
            handle: Some(handle),
        }
    }

    /// Shut down the dispatcher and its per-peer workers, draining queued
    /// sends first. Idempotent.
    pub fn close(&mut self) {
        self.inbox.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Broadcaster for PeerBroadcaster {
    fn broadcast(&self, msg: ConsensusMessage) {
        match &self.inbox {
            Some(inbox) => {
                let _ = inbox.send(msg);
            }
            None => warn!(msg = msg.type_name(), "broadcast after close, dropping"),
        }
    }
}

impl Drop for PeerBroadcaster {
    fn drop(&mut self) {
        self.close();
    }
}

fn dispatch_loop(
    peers: Vec<ReplicaId>,
    f: u64,
    timeout: Duration,
    comm: Arc<dyn Communicator>,
    inbox: ChannelReceiver<ConsensusMessage>,
) {
    let workers: Vec<(Sender<WorkItem>, JoinHandle<()>)> = peers
        .iter()
        .map(|&peer| {
            let (work_tx, work_rx) = bounded::<WorkItem>(PEER_QUEUE_DEPTH);
            let comm = comm.clone();
            let handle = std::thread::spawn(move || {
                for item in work_rx {
                    let ok = match comm.send(peer, &item.msg) {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(%peer, error = %err, "peer send failed");
                            false
                        }
                    };
                    let _ = item.done.send(ok);
                }
            });
            (work_tx, handle)
        })
        .collect();

    let needed = peers.len().saturating_sub(f as usize);

    for msg in inbox {
        let (done_tx, done_rx) = bounded(workers.len());
        for (peer, (work_tx, _)) in peers.iter().zip(&workers) {
            let item = WorkItem {
                msg: msg.clone(),
                done: done_tx.clone(),
            };
            if work_tx.try_send(item).is_err() {
                warn!(%peer, msg = msg.type_name(), "peer send queue full, dropping message");
            }
        }
        drop(done_tx);

        // f-tolerant completion: enough successes, or give up at the deadline.
        let deadline = Instant::now() + timeout;
        let mut successes = 0usize;
        while successes < needed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match done_rx.recv_timeout(remaining) {
                Ok(true) => successes += 1,
                Ok(false) => {}
                Err(_) => break,
            }
        }
        if successes < needed {
            warn!(
                msg = msg.type_name(),
                successes, needed, "broadcast did not reach enough peers in time"
            );
        }
    }

    for (work_tx, handle) in workers {
        drop(work_tx);
        let _ = handle.join();
    }
}
