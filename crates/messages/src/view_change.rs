//! View-change and new-view messages.
//!
//! A view change carries the sending replica's certificate summaries: its
//! stable checkpoints (cset), the instances it holds prepared certificates
//! for (pset) and the instances it holds a pre-prepare for (qset). The new
//! primary aggregates 2f+1 of these into a new-view message whose xset fixes
//! the batch digest for every in-flight sequence number, which backups can
//! verify by recomputing the assignment from the carried view changes.

use conclave_types::{Hash, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One checkpoint the view-changing replica holds, cset entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointProof {
    /// Checkpointed sequence number.
    pub seq_no: u64,

    /// State digest at that sequence number.
    pub state_digest: Hash,
}

/// One certificate the view-changing replica holds, pset/qset entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertProof {
    /// Sequence number of the instance.
    pub seq_no: u64,

    /// Batch digest of the instance.
    pub batch_digest: Hash,

    /// View in which the certificate was formed.
    pub view: u64,
}

/// A replica's vote to move to a new view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    /// The view being voted for.
    pub view: u64,

    /// The sender's low watermark.
    pub h: u64,

    /// The sender's stable checkpoints.
    pub cset: Vec<CheckpointProof>,

    /// Instances the sender holds prepared certificates for, above `h`.
    pub pset: Vec<CertProof>,

    /// Instances the sender holds a pre-prepare for, above `h`.
    pub qset: Vec<CertProof>,

    /// The voting replica.
    pub replica_id: ReplicaId,
}

/// The new primary's announcement that the view change succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    /// The view being entered.
    pub view: u64,

    /// The 2f+1 view-change messages justifying the transition.
    pub vset: Vec<ViewChange>,

    /// Batch digest assigned to each in-flight sequence number; the zero
    /// hash fills gaps with null requests.
    pub xset: BTreeMap<u64, Hash>,

    /// The new primary.
    pub replica_id: ReplicaId,
}
