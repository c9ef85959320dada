//! Event model for the Conclave consensus engine.
//!
//! # Architecture
//!
//! All consensus state lives behind a single [`Receiver`] driven by one
//! [`Manager`] consumer thread. Producers (transport delivery, timers,
//! client submission) only ever enqueue [`Event`]s; they never touch
//! replica state. This gives the state machine single-writer semantics
//! with no per-field locking:
//!
//! - `Event::Incoming` → a transport message arrived
//! - `Event::RequestBatch` → a cut batch is ready for ordering
//! - `Event::BatchTimeout` / `Event::RequestTimeout` / ... → a timer fired
//! - `Event::ExecutionComplete` → the execution collaborator acknowledged
//!
//! If processing an event returns a follow-up event, the follow-up runs to
//! completion on the same thread before the next queued event is dequeued.
//!
//! All I/O happens in the collaborators ([`Broadcaster`], [`ExecutionService`],
//! [`Authorizer`]), which are injected into the state machine's constructor.

mod broadcast;
mod event;
mod manager;
mod timer;
mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use broadcast::PeerBroadcaster;
pub use event::Event;
pub use manager::{deliver_chain, EventSender, Manager};
pub use timer::{QueueTimerFactory, Timer, TimerFactory};
pub use traits::{
    AllowAll, Authorizer, Broadcaster, CommError, Communicator, ExecutionService, Receiver, Role,
};
