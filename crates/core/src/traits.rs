//! Seams between the consensus engine and its collaborators.
//!
//! The engine never performs I/O itself: broadcasting, execution and
//! authorization are trait objects injected at construction. Production
//! wires real transport and ledger implementations; tests inject the
//! recording doubles from [`crate::testing`].

use crate::Event;
use conclave_messages::ConsensusMessage;
use conclave_types::{ReplicaId, RequestBatch};

/// A consumer of events, processed serially as they arrive.
pub trait Receiver: Send {
    /// Deliver an event to the receiver.
    ///
    /// A returned event is the next link in the processing chain and is
    /// delivered immediately, before any queued event.
    fn process_event(&mut self, event: Event) -> Option<Event>;
}

/// Sends a consensus message to all other replicas.
///
/// Fire-and-forget from the caller's perspective; the f-tolerant timeout
/// policy (a send need not reach all N replicas) belongs to the
/// implementation.
pub trait Broadcaster: Send + Sync {
    /// Broadcast a message to all peer replicas.
    fn broadcast(&self, msg: ConsensusMessage);
}

/// Point-to-point message delivery, the transport's contribution to
/// [`crate::PeerBroadcaster`].
pub trait Communicator: Send + Sync {
    /// Synchronously send a message to one peer.
    fn send(&self, dest: ReplicaId, msg: &ConsensusMessage) -> Result<(), CommError>;
}

/// Errors surfaced by a [`Communicator`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommError {
    /// The peer could not be reached.
    #[error("peer {0} unreachable")]
    Unreachable(ReplicaId),

    /// The send did not complete in time.
    #[error("send to {0} timed out")]
    Timeout(ReplicaId),
}

/// The ledger collaborator that applies committed batches.
pub trait ExecutionService: Send + Sync {
    /// Apply a committed batch at the given sequence number.
    ///
    /// Must be idempotent under at-least-once redelivery: a replica
    /// replaying from a checkpoint may invoke it again for an
    /// already-applied sequence number. Completion is acknowledged back to
    /// the engine via [`Event::ExecutionComplete`].
    fn execute(&self, seq_no: u64, batch: &RequestBatch);
}

/// What a replica is asking permission to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Propose batches (send pre-prepares).
    Proposer,

    /// Vote toward quorums (send prepares, commits, checkpoints).
    Voter,
}

/// The identity collaborator consulted before counting a replica's message.
pub trait Authorizer: Send + Sync {
    /// Check whether `replica` is permissioned for `role`.
    fn is_authorized(&self, replica: ReplicaId, role: Role) -> bool;
}

/// Authorizer that admits every replica.
///
/// The permissioning story in deployments where the membership list itself
/// is the access control, and the default for tests.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _replica: ReplicaId, _role: Role) -> bool {
        true
    }
}
