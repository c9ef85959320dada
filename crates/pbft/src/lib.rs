//! PBFT consensus state machine.
//!
//! This crate provides the replica-side consensus logic for a permissioned
//! replicated ledger: N identified replicas agree on a total order of
//! client-submitted transaction batches despite up to f Byzantine replicas
//! (N ≥ 3f+1).
//!
//! # Architecture
//!
//! Two receivers are chained, and both are driven by one event-manager
//! thread (see `conclave-core`):
//!
//! - [`Batcher`] intercepts client/message-arrival events, accumulates
//!   requests on the primary, and cuts `RequestBatch`es on a size threshold
//!   or batch timer. Everything else passes through untouched.
//! - [`PbftCore`] owns the quorum-certificate log, sequence numbering,
//!   watermarks, view/primary selection, and the
//!   pre-prepare/prepare/commit protocol plus the checkpoint and
//!   view-change sub-protocols.
//!
//! All I/O happens through the injected collaborators: a broadcaster, an
//! execution service, and an authorization check.

mod batch;
mod config;
mod state;
mod view_change;

pub use batch::Batcher;
pub use config::{ConfigError, PbftConfig};
pub use state::PbftCore;
