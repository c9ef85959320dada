//! View changes: deposing a faulty primary and installing its successor.
//!
//! A replica that observes a progress failure increments its view,
//! deactivates it, and broadcasts a view-change carrying proof of its
//! checkpoints and prepared certificates. The new view's primary collects
//! 2f+1 such messages, deterministically re-assigns the surviving
//! certificates to sequence numbers, and broadcasts a new-view that every
//! replica verifies by recomputing the assignment.

use crate::state::PbftCore;
use conclave_core::{Event, Role};
use conclave_messages::{
    CertProof, CheckpointProof, ConsensusMessage, NewView, PrePrepare, ViewChange,
};
use conclave_types::{Hash, ReplicaId, RequestBatch};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

impl PbftCore {
    /// Abandon the current view and broadcast a view-change for the next.
    pub(crate) fn send_view_change(&mut self) {
        self.request_timer.stop();
        self.null_request_timer.stop();

        self.view += 1;
        self.active_view = false;

        let cset: Vec<CheckpointProof> = self
            .chkpts
            .iter()
            .map(|(&seq_no, &state_digest)| CheckpointProof {
                seq_no,
                state_digest,
            })
            .collect();

        let mut pset: Vec<CertProof> = Vec::new();
        let mut qset: Vec<CertProof> = Vec::new();
        for (id, cert) in &self.cert_store {
            if id.n <= self.h {
                continue;
            }
            if let Some(pp) = &cert.pre_prepare {
                let proof = CertProof {
                    seq_no: id.n,
                    batch_digest: pp.batch_digest,
                    view: id.v,
                };
                qset.push(proof.clone());
                if self.prepared(&pp.batch_digest, id.v, id.n) {
                    pset.push(proof);
                }
            }
        }

        // Certificates from deposed views can no longer complete; the
        // pset/qset evidence above is all that survives of them.
        let view = self.view;
        self.cert_store.retain(|id, _| id.v >= view);

        let vc = ViewChange {
            view: self.view,
            h: self.h,
            cset,
            pset,
            qset,
            replica_id: self.id,
        };
        info!(
            replica = %self.id,
            view = vc.view,
            h = vc.h,
            prepared = vc.pset.len(),
            "broadcasting view change"
        );
        self.view_change_store
            .insert((vc.view, self.id), vc.clone());
        self.maybe_broadcast(ConsensusMessage::ViewChange(vc));

        let resend = self.config.view_change_resend_timeout;
        self.vc_resend_timer
            .reset(resend, Event::ViewChangeResendTimeout);

        // Each replica counts its own vote toward the quorum.
        self.check_view_change_quorum(self.view);
    }

    /// Nothing installed the new view before the resend timeout; re-issue
    /// the view-change for the same target view.
    pub(crate) fn on_view_change_resend_timeout(&mut self) {
        warn!(
            replica = %self.id,
            view = self.view,
            "view change not resolved within the resend timeout, resending"
        );
        // send_view_change increments again, so step back first.
        self.view -= 1;
        self.send_view_change();
    }

    pub(crate) fn recv_view_change(&mut self, vc: ViewChange) {
        debug!(
            replica = %self.id,
            from = %vc.replica_id,
            view = vc.view,
            "received view change"
        );

        if vc.view < self.view {
            debug!(
                replica = %self.id,
                view = vc.view,
                current = self.view,
                "view change for an old view, dropping"
            );
            return;
        }

        if vc.replica_id != self.id
            && !self.authorizer.is_authorized(vc.replica_id, Role::Voter)
        {
            warn!(replica = %self.id, from = %vc.replica_id, "view change from unauthorized voter, dropping");
            return;
        }

        if self
            .view_change_store
            .insert((vc.view, vc.replica_id), vc.clone())
            .is_some()
        {
            debug!(
                replica = %self.id,
                from = %vc.replica_id,
                view = vc.view,
                "replacing earlier view change from the same replica"
            );
        }

        // f+1 replicas asking for a view beyond ours proves the quorum can
        // move on without us; join the highest view f+1 of them support.
        let mut per_replica: BTreeMap<ReplicaId, u64> = BTreeMap::new();
        for (v, replica) in self.view_change_store.keys() {
            if *v > self.view {
                let highest = per_replica.entry(*replica).or_insert(*v);
                if *v > *highest {
                    *highest = *v;
                }
            }
        }
        let witness_quorum = (self.config.f + 1) as usize;
        if per_replica.len() >= witness_quorum {
            let mut views: Vec<u64> = per_replica.values().copied().collect();
            views.sort_unstable();
            let target = views[views.len() - witness_quorum];
            info!(
                replica = %self.id,
                target,
                "f+1 replicas have moved to a higher view, joining"
            );
            self.view = target - 1;
            self.send_view_change();
            return;
        }

        self.check_view_change_quorum(vc.view);
    }

    fn check_view_change_quorum(&mut self, view: u64) {
        if view < self.view || self.active_view {
            return;
        }
        let count = self
            .view_change_store
            .keys()
            .filter(|(v, _)| *v == view)
            .count();
        if count < self.commit_quorum() {
            return;
        }

        if self.primary(view) == self.id {
            self.send_new_view(view);
        } else {
            // Backup: give the new primary one timeout to produce the
            // new-view, doubling on each successive failure.
            let timeout = self.last_new_view_timeout;
            info!(
                replica = %self.id,
                view,
                ?timeout,
                "view change quorum complete, waiting for the new primary"
            );
            self.request_timer.reset(timeout, Event::RequestTimeout);
            self.last_new_view_timeout = timeout * 2;
        }
    }

    pub(crate) fn send_new_view(&mut self, view: u64) {
        if self.new_view_store.contains_key(&view) {
            debug!(replica = %self.id, view, "new view already issued");
            return;
        }

        let vset: Vec<ViewChange> = self
            .view_change_store
            .iter()
            .filter(|((v, _), _)| *v == view)
            .map(|(_, vc)| vc.clone())
            .collect();

        let Some((cp, xset)) = self.assign_sequence_numbers(&vset) else {
            warn!(
                replica = %self.id,
                view,
                "could not assign sequence numbers from the view change quorum"
            );
            return;
        };

        info!(
            replica = %self.id,
            view,
            checkpoint = cp,
            assignments = xset.len(),
            "primary broadcasting new view"
        );
        let nv = NewView {
            view,
            vset,
            xset,
            replica_id: self.id,
        };
        self.new_view_store.insert(view, nv.clone());
        self.maybe_broadcast(ConsensusMessage::NewView(nv.clone()));
        self.process_new_view(nv);
    }

    pub(crate) fn recv_new_view(&mut self, nv: NewView) {
        debug!(
            replica = %self.id,
            from = %nv.replica_id,
            view = nv.view,
            "received new view"
        );

        if nv.view < self.view {
            debug!(replica = %self.id, view = nv.view, "new view for an old view, dropping");
            return;
        }

        if self.primary(nv.view) != nv.replica_id {
            warn!(
                replica = %self.id,
                from = %nv.replica_id,
                view = nv.view,
                "new view from a replica that is not the view's primary, dropping"
            );
            return;
        }

        if self.new_view_store.contains_key(&nv.view) {
            debug!(replica = %self.id, view = nv.view, "duplicate new view, ignoring");
            return;
        }

        // The carried quorum must be 2f+1 distinct replicas for this view.
        let mut senders: Vec<_> = nv.vset.iter().map(|vc| vc.replica_id).collect();
        senders.sort_unstable_by_key(|r| r.0);
        senders.dedup();
        if senders.len() < self.commit_quorum() || nv.vset.iter().any(|vc| vc.view != nv.view) {
            warn!(
                replica = %self.id,
                view = nv.view,
                carried = senders.len(),
                "new view does not carry a valid view change quorum, dropping"
            );
            return;
        }

        // Verify the primary's assignment by recomputing it.
        match self.assign_sequence_numbers(&nv.vset) {
            Some((_, expected)) if expected == nv.xset => {}
            _ => {
                warn!(
                    replica = %self.id,
                    view = nv.view,
                    "new view sequence number assignment does not match our own, dropping"
                );
                return;
            }
        }

        self.new_view_store.insert(nv.view, nv.clone());
        self.process_new_view(nv);
    }

    /// Deterministic assignment of surviving certificates to sequence
    /// numbers, computed identically by the primary and every verifier.
    ///
    /// Returns the quorum's starting checkpoint and, for every sequence
    /// number from there to the highest prepared one, either the prepared
    /// batch digest (highest view wins) or the null digest.
    pub(crate) fn assign_sequence_numbers(
        &self,
        vset: &[ViewChange],
    ) -> Option<(u64, BTreeMap<u64, Hash>)> {
        let cp = vset.iter().map(|vc| vc.h).max()?;
        let max_seq = vset
            .iter()
            .flat_map(|vc| vc.pset.iter().map(|p| p.seq_no))
            .max()
            .unwrap_or(cp);

        let mut xset = BTreeMap::new();
        for n in cp + 1..=max_seq {
            let assigned = vset
                .iter()
                .flat_map(|vc| vc.pset.iter())
                .filter(|p| p.seq_no == n)
                .max_by_key(|p| p.view)
                .map(|p| p.batch_digest)
                .unwrap_or(Hash::ZERO);
            xset.insert(n, assigned);
        }
        Some((cp, xset))
    }

    /// Install a verified new view.
    pub(crate) fn process_new_view(&mut self, nv: NewView) {
        info!(replica = %self.id, view = nv.view, "installing new view");
        self.view = nv.view;
        self.active_view = true;
        self.vc_resend_timer.stop();
        self.request_timer.stop();
        self.last_new_view_timeout = self.config.view_change_timeout;
        let view = self.view;
        self.view_change_store.retain(|(v, _), _| *v > view);

        if let Some(quorum_h) = nv.vset.iter().map(|vc| vc.h).max() {
            if quorum_h > self.h {
                self.move_watermarks(quorum_h);
            }
        }
        if let Some(&max_assigned) = nv.xset.keys().next_back() {
            if max_assigned > self.seq_no {
                self.seq_no = max_assigned;
            }
        }

        // Re-create certificates for the carried assignments and restart
        // their prepare phase in the new view.
        let assignments: Vec<(u64, Hash)> = nv
            .xset
            .iter()
            .filter(|(&n, _)| n > self.h)
            .map(|(&n, &digest)| (n, digest))
            .collect();
        for (n, digest) in assignments {
            if !digest.is_zero() && !self.req_batch_store.contains_key(&digest) {
                warn!(
                    replica = %self.id,
                    seq_no = n,
                    %digest,
                    "new view assigns a batch we do not hold"
                );
                self.missing_req_batches.insert(digest);
                continue;
            }
            let batch = self
                .req_batch_store
                .get(&digest)
                .cloned()
                .unwrap_or_else(|| RequestBatch::new(Vec::new()));
            let pp = PrePrepare {
                view,
                seq_no: n,
                batch_digest: digest,
                request_batch: batch,
                replica_id: self.primary(view),
            };
            let cert = self.get_cert(view, n);
            cert.pre_prepare = Some(pp);
            cert.digest = digest;
            if self.primary(view) != self.id {
                self.send_prepare(view, n, digest);
            }
        }

        self.execute_outstanding();

        // The new primary re-proposes batches that survived without an
        // assignment.
        if self.is_primary() {
            let orphans: Vec<_> = self
                .outstanding_req_batches
                .iter()
                .filter(|(digest, _)| {
                    !self.cert_store.values().any(|cert| {
                        cert.pre_prepare
                            .as_ref()
                            .is_some_and(|pp| pp.view == view && pp.batch_digest == **digest)
                    })
                })
                .map(|(digest, batch)| (*digest, batch.clone()))
                .collect();
            for (digest, batch) in orphans {
                debug!(replica = %self.id, %digest, "re-proposing outstanding batch in the new view");
                self.send_pre_prepare(batch, digest);
            }
        }

        self.update_view_change_seq_no();
        self.restart_null_timer_after_new_view();
    }

    fn restart_null_timer_after_new_view(&mut self) {
        if self.config.null_request_timeout.is_zero() {
            return;
        }
        let timeout = self.config.null_request_timeout;
        self.null_request_timer
            .reset(timeout, Event::NullRequestTimeout);
    }
}
