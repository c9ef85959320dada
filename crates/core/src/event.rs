//! The closed set of events driving a consensus instance.

use conclave_messages::Message;
use conclave_types::{Hash, RequestBatch};

/// Events delivered to a consensus instance's receiver chain.
///
/// Every state transition of the engine is caused by exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A transport message delivered by the communication layer.
    Incoming(Message),

    /// A cut batch ready for ordering.
    RequestBatch(RequestBatch),

    /// The batch accumulation timer expired.
    BatchTimeout,

    /// No execution progress within the request timeout.
    RequestTimeout,

    /// No primary activity within the null-request timeout.
    NullRequestTimeout,

    /// A sent view change got no new-view message in time.
    ViewChangeResendTimeout,

    /// The execution collaborator finished applying a batch.
    ExecutionComplete {
        /// Sequence number that finished executing.
        seq_no: u64,
        /// Digest of the accumulated state after executing it.
        state_digest: Hash,
    },
}

impl Event {
    /// Get a human-readable name for this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Incoming(msg) => msg.type_name(),
            Event::RequestBatch(_) => "RequestBatch",
            Event::BatchTimeout => "BatchTimeout",
            Event::RequestTimeout => "RequestTimeout",
            Event::NullRequestTimeout => "NullRequestTimeout",
            Event::ViewChangeResendTimeout => "ViewChangeResendTimeout",
            Event::ExecutionComplete { .. } => "ExecutionComplete",
        }
    }
}
