//! Replica assembly.
//!
//! Wires a [`Batcher`]-fronted PBFT state machine to its collaborators
//! (transport, execution, authorization) and runs it on a dedicated event
//! manager thread. This crate is the embedding surface: a host provides a
//! [`Communicator`] and an [`ExecutionService`], and drives the replica
//! through [`Replica::deliver`], [`Replica::submit`] and
//! [`Replica::execution_ack`].

use conclave_core::{
    Authorizer, Communicator, Event, EventSender, ExecutionService, Manager, PeerBroadcaster,
};
use conclave_messages::Message;
use conclave_pbft::{Batcher, ConfigError, PbftConfig};
use conclave_types::{Hash, ReplicaId};
use std::sync::Arc;
use tracing::{info, warn};

/// A running consensus replica.
///
/// Dropping without [`Replica::halt`] leaks the event manager thread;
/// halt is idempotent and joins it.
pub struct Replica {
    id: ReplicaId,
    manager: Manager,
    queue: EventSender,
}

impl Replica {
    /// Assemble and start a replica.
    ///
    /// Spawns the event manager thread and the broadcaster's per-peer
    /// workers. Fails only on configuration invariant violations.
    pub fn new(
        id: ReplicaId,
        config: PbftConfig,
        comm: Arc<dyn Communicator>,
        execution: Arc<dyn ExecutionService>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, ConfigError> {
        let peers: Vec<ReplicaId> = (0..config.n).map(ReplicaId).filter(|p| *p != id).collect();
        let broadcaster = Arc::new(PeerBroadcaster::new(
            peers,
            config.f,
            config.broadcast_timeout,
            comm,
        ));

        let mut manager = Manager::new();
        let timers = manager.timer_factory();
        let batcher = Batcher::new(id, config, broadcaster, execution, authorizer, &timers)?;
        manager.set_receiver(Box::new(batcher));
        manager.start();

        let queue = manager.queue();
        info!(replica = %id, "replica started");
        Ok(Self { id, manager, queue })
    }

    /// This replica's id.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// A handle for enqueueing events directly, e.g. from timers owned by
    /// the host.
    pub fn queue(&self) -> EventSender {
        self.queue.clone()
    }

    /// Deliver a message that arrived from the network.
    pub fn deliver(&self, msg: Message) {
        if self.queue.send(Event::Incoming(msg)).is_err() {
            warn!(replica = %self.id, "replica halted, dropping delivered message");
        }
    }

    /// Submit a client transaction at this replica.
    pub fn submit(&self, payload: Vec<u8>) {
        if self
            .queue
            .send(Event::Incoming(Message::ChainTransaction(payload)))
            .is_err()
        {
            warn!(replica = %self.id, "replica halted, dropping submitted transaction");
        }
    }

    /// Acknowledge that the execution collaborator finished a sequence
    /// number, carrying the resulting state digest.
    pub fn execution_ack(&self, seq_no: u64, state_digest: Hash) {
        if self
            .queue
            .send(Event::ExecutionComplete {
                seq_no,
                state_digest,
            })
            .is_err()
        {
            warn!(replica = %self.id, "replica halted, dropping execution acknowledgement");
        }
    }

    /// Stop the event manager thread and join it.
    pub fn halt(&mut self) {
        info!(replica = %self.id, "halting replica");
        self.manager.halt();
    }
}
