//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Replica identifier, PBFT `i`.
///
/// Replica ids are dense: a network of N replicas uses ids `0..N`, and the
/// primary of view `v` is replica `v mod N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Get the raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Replica({})", self.0)
    }
}
