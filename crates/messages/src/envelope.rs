//! Message envelopes: what the transport delivers and what replicas exchange.

use crate::{Checkpoint, Commit, NewView, PrePrepare, Prepare, ViewChange};
use conclave_types::ReplicaId;
use serde::{Deserialize, Serialize};

/// A message exchanged between replicas.
///
/// The transport collaborator serializes these; the engine only ever hands
/// them to the broadcaster or receives them via event delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    /// Ordering proposal from the primary.
    PrePrepare(PrePrepare),

    /// Agreement vote from a backup.
    Prepare(Prepare),

    /// Commitment after a prepared certificate.
    Commit(Commit),

    /// Checkpoint confirmation.
    Checkpoint(Checkpoint),

    /// Vote to move to a new view.
    ViewChange(ViewChange),

    /// New primary's view-change conclusion.
    NewView(NewView),

    /// Raw transaction relayed replica-to-replica so a future view's
    /// primary can recover it.
    Transaction(Vec<u8>),

    /// Primary liveness heartbeat when no client traffic is flowing.
    NullRequest {
        /// The heartbeating primary's view.
        view: u64,
        /// The heartbeating primary.
        replica_id: ReplicaId,
    },
}

impl ConsensusMessage {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::PrePrepare(_) => "PrePrepare",
            ConsensusMessage::Prepare(_) => "Prepare",
            ConsensusMessage::Commit(_) => "Commit",
            ConsensusMessage::Checkpoint(_) => "Checkpoint",
            ConsensusMessage::ViewChange(_) => "ViewChange",
            ConsensusMessage::NewView(_) => "NewView",
            ConsensusMessage::Transaction(_) => "Transaction",
            ConsensusMessage::NullRequest { .. } => "NullRequest",
        }
    }

    /// Check if this is a three-phase agreement message.
    pub fn is_agreement(&self) -> bool {
        matches!(
            self,
            ConsensusMessage::PrePrepare(_)
                | ConsensusMessage::Prepare(_)
                | ConsensusMessage::Commit(_)
        )
    }

    /// Check if this is a view-change sub-protocol message.
    pub fn is_view_change(&self) -> bool {
        matches!(
            self,
            ConsensusMessage::ViewChange(_) | ConsensusMessage::NewView(_)
        )
    }
}

/// A message delivered to a consensus instance by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// A transaction submitted by a client to this replica.
    ChainTransaction(Vec<u8>),

    /// A consensus message relayed from a peer replica.
    Consensus(ConsensusMessage),
}

impl Message {
    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ChainTransaction(_) => "ChainTransaction",
            Message::Consensus(msg) => msg.type_name(),
        }
    }
}
