//! Network messages for the consensus protocol.

mod checkpoint;
mod envelope;
mod three_phase;
mod view_change;

pub use checkpoint::Checkpoint;
pub use envelope::{ConsensusMessage, Message};
pub use three_phase::{Commit, PrePrepare, Prepare};
pub use view_change::{CertProof, CheckpointProof, NewView, ViewChange};
