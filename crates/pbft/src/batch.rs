//! Batching front-end for the PBFT core.
//!
//! Sits in front of [`PbftCore`] in the receiver chain. Client
//! transactions are relayed to all replicas and accumulated by the current
//! primary, which cuts a [`RequestBatch`] when a size threshold is reached
//! or the batch timer fires. All other events pass straight through.

use crate::config::PbftConfig;
use crate::state::PbftCore;
use crate::ConfigError;
use conclave_core::{
    Authorizer, Broadcaster, Event, ExecutionService, Receiver, Timer, TimerFactory,
};
use conclave_messages::{ConsensusMessage, Message};
use conclave_types::{ReplicaId, Request, RequestBatch};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// Request batcher wrapping the core state machine.
pub struct Batcher {
    pbft: PbftCore,
    batch_size: usize,
    batch_store: Vec<Request>,
    batch_timer: Box<dyn Timer>,
    batch_timer_active: bool,
    batch_timeout: Duration,
    broadcaster: Arc<dyn Broadcaster>,
}

impl Batcher {
    /// Create the batcher and the wrapped core state machine.
    ///
    /// The configuration is normalized first so dependent timeouts keep
    /// their required ordering.
    pub fn new(
        id: ReplicaId,
        config: PbftConfig,
        broadcaster: Arc<dyn Broadcaster>,
        execution: Arc<dyn ExecutionService>,
        authorizer: Arc<dyn Authorizer>,
        timers: &dyn TimerFactory,
    ) -> Result<Self, ConfigError> {
        let config = config.normalized();
        info!(
            batch_size = config.batch_size,
            batch_timeout = ?config.batch_timeout,
            "PBFT batching parameters"
        );
        let batch_size = config.batch_size;
        let batch_timeout = config.batch_timeout;
        let pbft = PbftCore::new(
            id,
            config,
            broadcaster.clone(),
            execution,
            authorizer,
            timers,
        )?;
        Ok(Self {
            pbft,
            batch_size,
            batch_store: Vec::new(),
            batch_timer: timers.create_timer(),
            batch_timer_active: false,
            batch_timeout,
            broadcaster,
        })
    }

    /// The wrapped core state machine.
    pub fn core(&self) -> &PbftCore {
        &self.pbft
    }

    fn process_message(&mut self, msg: Message) {
        match msg {
            // A client submitted a transaction locally: relay it to the
            // other replicas so the primary sees it even if the client
            // only reached a backup.
            Message::ChainTransaction(payload) => {
                debug!(
                    replica = %self.pbft.id(),
                    bytes = payload.len(),
                    "relaying client transaction"
                );
                self.broadcaster
                    .broadcast(ConsensusMessage::Transaction(payload.clone()));
                self.submit_to_primary(payload);
            }
            // A transaction relayed by a peer.
            Message::Consensus(ConsensusMessage::Transaction(payload)) => {
                self.submit_to_primary(payload);
            }
            Message::Consensus(other) => self.pbft.recv_consensus(other),
        }
    }

    fn submit_to_primary(&mut self, payload: Vec<u8>) {
        if !self.pbft.is_primary() || !self.pbft.active_view() {
            return;
        }
        let request = Request::new(now_ms(), payload, self.pbft.id());
        self.queue_request(request);
    }

    fn queue_request(&mut self, request: Request) {
        self.batch_store.push(request);

        if !self.batch_timer_active {
            self.batch_timer.reset(self.batch_timeout, Event::BatchTimeout);
            self.batch_timer_active = true;
        }

        if self.batch_store.len() >= self.batch_size {
            if let Some(event) = self.cut_batch() {
                // Feed the cut batch straight into the wrapped core.
                self.pbft.process_event(event);
            }
        }
    }

    fn cut_batch(&mut self) -> Option<Event> {
        self.batch_timer.stop();
        self.batch_timer_active = false;

        if self.batch_store.is_empty() {
            error!(replica = %self.pbft.id(), "told to cut an empty batch, ignoring");
            return None;
        }

        info!(
            replica = %self.pbft.id(),
            requests = self.batch_store.len(),
            "cutting request batch"
        );
        let batch = RequestBatch::new(mem::take(&mut self.batch_store));
        Some(Event::RequestBatch(batch))
    }
}

impl Receiver for Batcher {
    fn process_event(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::Incoming(msg) => {
                self.process_message(msg);
                None
            }
            Event::BatchTimeout => {
                self.batch_timer_active = false;
                if self.batch_store.is_empty() {
                    debug!(replica = %self.pbft.id(), "batch timer expired with nothing pending");
                    None
                } else {
                    self.cut_batch()
                }
            }
            other => self.pbft.process_event(other),
        }
    }
}

fn now_ms() -> u64 {
    // Request timestamps only order requests inside one primary's batch;
    // a clock before the epoch degrades to zero rather than failing.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::testing::{MockTimerFactory, RecordingBroadcaster, RecordingExecution};
    use conclave_core::AllowAll;
    use conclave_messages::PrePrepare;
    use tracing_test::traced_test;

    fn batcher(id: u64, config: PbftConfig) -> (Batcher, RecordingBroadcaster, MockTimerFactory) {
        let broadcast = RecordingBroadcaster::new();
        let timers = MockTimerFactory::new();
        let batcher = Batcher::new(
            ReplicaId(id),
            config,
            Arc::new(broadcast.clone()),
            Arc::new(RecordingExecution::new()),
            Arc::new(AllowAll),
            &timers,
        )
        .expect("valid config");
        (batcher, broadcast, timers)
    }

    fn small_batch_config() -> PbftConfig {
        PbftConfig {
            batch_size: 2,
            ..Default::default()
        }
    }

    fn sent_pre_prepares(broadcast: &RecordingBroadcaster) -> Vec<PrePrepare> {
        broadcast
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                ConsensusMessage::PrePrepare(pp) => Some(pp),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_primary_cuts_batch_at_size_threshold() {
        let (mut batcher, broadcast, _) = batcher(0, small_batch_config());

        batcher.process_event(Event::Incoming(Message::ChainTransaction(vec![1])));
        assert!(sent_pre_prepares(&broadcast).is_empty());
        assert_eq!(batcher.batch_store.len(), 1);

        batcher.process_event(Event::Incoming(Message::ChainTransaction(vec![2])));
        assert!(batcher.batch_store.is_empty());

        let pps = sent_pre_prepares(&broadcast);
        assert_eq!(pps.len(), 1);
        assert_eq!(pps[0].seq_no, 1);
        assert_eq!(pps[0].request_batch.len(), 2);
    }

    #[test]
    fn test_client_transactions_are_relayed() {
        let (mut batcher, broadcast, _) = batcher(2, small_batch_config());
        batcher.process_event(Event::Incoming(Message::ChainTransaction(vec![7])));

        // A backup relays but never accumulates.
        assert!(broadcast
            .sent()
            .iter()
            .any(|m| matches!(m, ConsensusMessage::Transaction(p) if p == &vec![7])));
        assert!(batcher.batch_store.is_empty());
    }

    #[test]
    fn test_relayed_transaction_is_not_rebroadcast() {
        let (mut batcher, broadcast, _) = batcher(0, small_batch_config());
        batcher.process_event(Event::Incoming(Message::Consensus(
            ConsensusMessage::Transaction(vec![7]),
        )));

        assert!(!broadcast
            .sent()
            .iter()
            .any(|m| matches!(m, ConsensusMessage::Transaction(_))));
        assert_eq!(batcher.batch_store.len(), 1);
    }

    #[test]
    fn test_batch_timer_flushes_partial_batch() {
        let (mut batcher, broadcast, timers) = batcher(0, PbftConfig::default());
        batcher.process_event(Event::Incoming(Message::ChainTransaction(vec![1])));
        assert!(sent_pre_prepares(&broadcast).is_empty());

        // The batch timer is the fourth created, after the core's three.
        assert_eq!(
            timers.state(3).armed.map(|(_, e)| e),
            Some(Event::BatchTimeout)
        );

        let follow_up = batcher.process_event(Event::BatchTimeout);
        let Some(Event::RequestBatch(batch)) = follow_up else {
            panic!("batch timeout with pending requests must cut a batch");
        };
        assert_eq!(batch.len(), 1);
    }

    #[test]
    #[traced_test]
    fn test_empty_batch_timeout_is_a_no_op() {
        let (mut batcher, _, _) = batcher(0, PbftConfig::default());
        assert_eq!(batcher.process_event(Event::BatchTimeout), None);
        assert!(logs_contain("nothing pending"));
    }

    #[test]
    fn test_consensus_traffic_passes_through() {
        let (mut batcher, broadcast, _) = batcher(1, small_batch_config());
        let requests = vec![Request::new(1, vec![9], ReplicaId(0))];
        let batch = RequestBatch::new(requests);
        let pp = PrePrepare {
            view: 0,
            seq_no: 1,
            batch_digest: batch.digest(),
            request_batch: batch,
            replica_id: ReplicaId(0),
        };
        batcher.process_event(Event::Incoming(Message::Consensus(
            ConsensusMessage::PrePrepare(pp),
        )));

        // The wrapped core voted.
        assert!(broadcast
            .sent()
            .iter()
            .any(|m| matches!(m, ConsensusMessage::Prepare(_))));
    }
}
