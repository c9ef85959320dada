//! Core types for the Conclave consensus engine.

mod hash;
mod identifiers;
mod request;

pub use hash::{Hash, HexError};
pub use identifiers::ReplicaId;
pub use request::{Request, RequestBatch};
