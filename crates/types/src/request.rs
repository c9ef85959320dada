//! Client requests and the batches the primary cuts from them.
//!
//! A request batch's digest is its identity everywhere in the protocol: the
//! pre-prepare/prepare/commit messages reference batches only by digest, and
//! two batches with equal digest are the same batch regardless of how they
//! arrived. The digest is Blake3 over a domain-separated, length-prefixed
//! canonical encoding, so it is a pure function of the ordered request
//! sequence and cannot fail.

use crate::{Hash, ReplicaId};
use serde::{Deserialize, Serialize};

/// A timestamped client transaction as recorded by the receiving replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Submission time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,

    /// Opaque transaction payload. The engine never interprets it.
    pub payload: Vec<u8>,

    /// Replica that accepted the transaction from the client.
    pub replica_id: ReplicaId,
}

impl Request {
    /// Create a new request.
    pub fn new(timestamp_ms: u64, payload: Vec<u8>, replica_id: ReplicaId) -> Self {
        Self {
            timestamp_ms,
            payload,
            replica_id,
        }
    }

    /// Append the canonical encoding of this request to `out`.
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.replica_id.0.to_le_bytes());
    }
}

/// An ordered batch of requests cut by the primary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBatch {
    /// The requests, in submission order.
    pub requests: Vec<Request>,
}

impl RequestBatch {
    /// Create a batch from an ordered request sequence.
    pub fn new(requests: Vec<Request>) -> Self {
        Self { requests }
    }

    /// Number of requests in the batch.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Check if the batch holds no requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Content digest, the batch's identity throughout the protocol.
    pub fn digest(&self) -> Hash {
        let mut buf = Vec::with_capacity(32 + self.requests.len() * 64);
        buf.extend_from_slice(b"request_batch:");
        buf.extend_from_slice(&(self.requests.len() as u64).to_le_bytes());
        for request in &self.requests {
            request.encode_into(&mut buf);
        }
        Hash::from_bytes(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(entries: &[(u64, &[u8], u64)]) -> RequestBatch {
        RequestBatch::new(
            entries
                .iter()
                .map(|&(ts, payload, id)| Request::new(ts, payload.to_vec(), ReplicaId(id)))
                .collect(),
        )
    }

    #[test]
    fn test_digest_is_pure() {
        // Identical sequences, including identical timestamps, hash identically.
        let a = batch(&[(1, b"tx1", 0), (1, b"tx2", 0)]);
        let b = batch(&[(1, b"tx1", 0), (1, b"tx2", 0)]);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_sensitive_to_every_field() {
        let base = batch(&[(1, b"tx1", 0)]);
        assert_ne!(base.digest(), batch(&[(2, b"tx1", 0)]).digest());
        assert_ne!(base.digest(), batch(&[(1, b"tx2", 0)]).digest());
        assert_ne!(base.digest(), batch(&[(1, b"tx1", 1)]).digest());
    }

    #[test]
    fn test_digest_sensitive_to_order() {
        let ab = batch(&[(1, b"a", 0), (1, b"b", 0)]);
        let ba = batch(&[(1, b"b", 0), (1, b"a", 0)]);
        assert_ne!(ab.digest(), ba.digest());
    }

    #[test]
    fn test_length_prefix_prevents_boundary_collisions() {
        // Same concatenated payload bytes, different request boundaries.
        let one = batch(&[(0, b"aabb", 0)]);
        let two = batch(&[(0, b"aa", 0), (0, b"bb", 0)]);
        assert_ne!(one.digest(), two.digest());
    }

    #[test]
    fn test_empty_batch_digest_is_stable() {
        assert_eq!(RequestBatch::default().digest(), batch(&[]).digest());
        assert!(!RequestBatch::default().digest().is_zero());
    }
}
