//! Checkpoint confirmation message.

use conclave_types::{Hash, ReplicaId};
use serde::{Deserialize, Serialize};

/// Announces that a replica reached a checkpoint sequence number.
///
/// 2f+1 matching (seq_no, state_digest) confirmations make the checkpoint
/// stable and let replicas advance their low watermark to `seq_no`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The checkpointed sequence number, a multiple of the checkpoint period.
    pub seq_no: u64,

    /// Digest of the replica's accumulated state at `seq_no`.
    pub state_digest: Hash,

    /// The announcing replica.
    pub replica_id: ReplicaId,
}
