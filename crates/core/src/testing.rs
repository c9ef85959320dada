//! Recording test doubles for the collaborator seams.
//!
//! Enabled with the `test-utils` feature for use from dependent crates'
//! test suites.

use crate::{Authorizer, Broadcaster, Event, ExecutionService, Role, Timer, TimerFactory};
use conclave_messages::ConsensusMessage;
use conclave_types::{Hash, ReplicaId, RequestBatch};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Broadcaster that records every message instead of sending it.
#[derive(Clone, Default)]
pub struct RecordingBroadcaster {
    sent: Arc<Mutex<Vec<ConsensusMessage>>>,
}

impl RecordingBroadcaster {
    /// Create an empty recording broadcaster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything broadcast so far.
    pub fn sent(&self) -> Vec<ConsensusMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Discard recorded messages.
    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, msg: ConsensusMessage) {
        self.sent.lock().unwrap().push(msg);
    }
}

/// Execution service that records calls and performs no work.
///
/// Completion acks are the test's job: feed `Event::ExecutionComplete`
/// manually to model the collaborator acknowledging.
#[derive(Clone, Default)]
pub struct RecordingExecution {
    executed: Arc<Mutex<Vec<(u64, Hash)>>>,
}

impl RecordingExecution {
    /// Create an empty recording execution service.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(seq_no, batch digest)` pairs in execution order.
    pub fn executed(&self) -> Vec<(u64, Hash)> {
        self.executed.lock().unwrap().clone()
    }
}

impl ExecutionService for RecordingExecution {
    fn execute(&self, seq_no: u64, batch: &RequestBatch) {
        self.executed.lock().unwrap().push((seq_no, batch.digest()));
    }
}

/// Authorizer rejecting a fixed set of replicas.
pub struct DenyList {
    denied: Vec<ReplicaId>,
}

impl DenyList {
    /// Deny the given replicas, admit everyone else.
    pub fn new(denied: Vec<ReplicaId>) -> Self {
        Self { denied }
    }
}

impl Authorizer for DenyList {
    fn is_authorized(&self, replica: ReplicaId, _role: Role) -> bool {
        !self.denied.contains(&replica)
    }
}

/// Observable state of one [`MockTimer`].
#[derive(Debug, Clone, Default)]
pub struct MockTimerState {
    /// The armed deadline and event, if any.
    pub armed: Option<(Duration, Event)>,
    /// Whether the timer was halted.
    pub halted: bool,
}

/// Timer that records arming instead of spawning a thread.
pub struct MockTimer {
    state: Arc<Mutex<MockTimerState>>,
}

impl Timer for MockTimer {
    fn reset(&mut self, after: Duration, event: Event) {
        self.state.lock().unwrap().armed = Some((after, event));
    }

    fn soft_reset(&mut self, after: Duration, event: Event) {
        let mut state = self.state.lock().unwrap();
        if state.armed.is_none() {
            state.armed = Some((after, event));
        }
    }

    fn stop(&mut self) {
        self.state.lock().unwrap().armed = None;
    }

    fn halt(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.armed = None;
        state.halted = true;
    }
}

/// Factory handing out [`MockTimer`]s whose states stay inspectable.
///
/// Timers are observable by creation order via [`MockTimerFactory::state`].
#[derive(Clone, Default)]
pub struct MockTimerFactory {
    states: Arc<Mutex<Vec<Arc<Mutex<MockTimerState>>>>>,
}

impl MockTimerFactory {
    /// Create a factory with no timers yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timers created so far.
    pub fn timer_count(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    /// Snapshot of the `idx`-th created timer's state.
    pub fn state(&self, idx: usize) -> MockTimerState {
        let states = self.states.lock().unwrap();
        let state = states[idx].lock().unwrap().clone();
        state
    }

    /// Find the armed event of any timer, by predicate on the event.
    pub fn armed_event<F: Fn(&Event) -> bool>(&self, pred: F) -> Option<Event> {
        let states = self.states.lock().unwrap();
        for state in states.iter() {
            if let Some((_, event)) = &state.lock().unwrap().armed {
                if pred(event) {
                    return Some(event.clone());
                }
            }
        }
        None
    }
}

impl TimerFactory for MockTimerFactory {
    fn create_timer(&self) -> Box<dyn Timer> {
        let state = Arc::new(Mutex::new(MockTimerState::default()));
        self.states.lock().unwrap().push(state.clone());
        Box::new(MockTimer { state })
    }
}
