//! The three-phase agreement messages: pre-prepare, prepare, commit.
//!
//! Each carries the (view, sequence number, batch digest) coordinate of one
//! protocol instance plus the sender's replica id. The pre-prepare also
//! carries the full request batch so backups need not already hold it.

use conclave_types::{Hash, ReplicaId, RequestBatch};
use serde::{Deserialize, Serialize};

/// Ordering proposal broadcast by the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    /// View in which the batch is proposed.
    pub view: u64,

    /// Assigned sequence number, PBFT `n`.
    pub seq_no: u64,

    /// Digest of the proposed batch. The zero hash marks a null request.
    pub batch_digest: Hash,

    /// The proposed batch itself.
    pub request_batch: RequestBatch,

    /// The proposing primary.
    pub replica_id: ReplicaId,
}

/// A backup's agreement to the primary's ordering proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    /// View of the instance being voted on.
    pub view: u64,

    /// Sequence number of the instance being voted on.
    pub seq_no: u64,

    /// Digest the vote is for.
    pub batch_digest: Hash,

    /// The voting replica.
    pub replica_id: ReplicaId,
}

/// A replica's commitment after observing a prepared certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// View of the instance being committed.
    pub view: u64,

    /// Sequence number of the instance being committed.
    pub seq_no: u64,

    /// Digest the commitment is for.
    pub batch_digest: Hash,

    /// The committing replica.
    pub replica_id: ReplicaId,
}
