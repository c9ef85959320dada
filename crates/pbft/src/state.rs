//! The PBFT core state machine.
//!
//! Owns all per-instance consensus state: the quorum-certificate log keyed
//! by (view, sequence number), the request batch stores, watermarks,
//! checkpoints, and the view-change stores. State is mutated exclusively by
//! the single event-processing path; producers only ever enqueue events.

use crate::config::{ConfigError, PbftConfig};
use conclave_core::{
    Authorizer, Broadcaster, Event, ExecutionService, Receiver, Role, Timer, TimerFactory,
};
use conclave_messages::{
    Checkpoint, Commit, ConsensusMessage, Message, NewView, PrePrepare, Prepare, ViewChange,
};
use conclave_types::{Hash, ReplicaId, RequestBatch};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Coordinate of one three-phase protocol instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MsgId {
    /// View.
    pub(crate) v: u64,
    /// Sequence number.
    pub(crate) n: u64,
}

/// Quorum-certificate record for one protocol instance.
///
/// Created lazily on first reference; removed only by watermark
/// advancement at stable checkpoints.
#[derive(Debug, Clone)]
pub(crate) struct MsgCert {
    pub(crate) digest: Hash,
    pub(crate) pre_prepare: Option<PrePrepare>,
    pub(crate) sent_prepare: bool,
    pub(crate) prepares: Vec<Prepare>,
    pub(crate) sent_commit: bool,
    pub(crate) commits: Vec<Commit>,
}

impl Default for MsgCert {
    fn default() -> Self {
        Self {
            digest: Hash::ZERO,
            pre_prepare: None,
            sent_prepare: false,
            prepares: Vec::new(),
            sent_commit: false,
            commits: Vec::new(),
        }
    }
}

/// The PBFT replica state machine.
pub struct PbftCore {
    pub(crate) id: ReplicaId,
    pub(crate) config: PbftConfig,

    /// Watermark window size, `K * log_multiplier`.
    pub(crate) l: u64,

    pub(crate) view: u64,
    pub(crate) seq_no: u64,
    /// Low watermark `h`.
    pub(crate) h: u64,
    pub(crate) last_exec: u64,
    /// Sequence number currently at the execution collaborator, if any.
    pub(crate) current_exec: Option<u64>,
    pub(crate) active_view: bool,
    /// Set when a checkpoint quorum proves we have fallen behind; execution
    /// pauses until state transfer (an external concern) catches us up.
    pub(crate) skip_in_progress: bool,
    /// Next sequence number at which to perform an automatic view change;
    /// `u64::MAX` when disabled.
    pub(crate) view_change_seq_no: u64,

    pub(crate) cert_store: IndexMap<MsgId, MsgCert>,
    pub(crate) req_batch_store: HashMap<Hash, RequestBatch>,
    pub(crate) outstanding_req_batches: HashMap<Hash, RequestBatch>,
    pub(crate) missing_req_batches: HashSet<Hash>,

    /// Own checkpoints: sequence number to state digest.
    pub(crate) chkpts: BTreeMap<u64, Hash>,
    /// Received checkpoint confirmations, keyed by (seq, state digest).
    pub(crate) checkpoint_store: HashMap<(u64, Hash), HashSet<ReplicaId>>,
    /// Highest out-of-window checkpoint observed per replica.
    pub(crate) h_chkpts: HashMap<ReplicaId, u64>,

    pub(crate) view_change_store: HashMap<(u64, ReplicaId), ViewChange>,
    pub(crate) new_view_store: HashMap<u64, NewView>,

    pub(crate) broadcaster: Arc<dyn Broadcaster>,
    pub(crate) execution: Arc<dyn ExecutionService>,
    pub(crate) authorizer: Arc<dyn Authorizer>,

    /// Progress timeout for outstanding batches; doubles as the new-view
    /// timer while a view change is pending.
    pub(crate) request_timer: Box<dyn Timer>,
    pub(crate) null_request_timer: Box<dyn Timer>,
    pub(crate) vc_resend_timer: Box<dyn Timer>,
    /// Timeout used for the pending view change, doubled on each failure.
    pub(crate) last_new_view_timeout: Duration,
}

impl PbftCore {
    /// Create a replica state machine.
    ///
    /// Timers are created in a fixed order: request, null-request,
    /// view-change-resend. Fails only on configuration invariant
    /// violations, which are fatal.
    pub fn new(
        id: ReplicaId,
        config: PbftConfig,
        broadcaster: Arc<dyn Broadcaster>,
        execution: Arc<dyn ExecutionService>,
        authorizer: Arc<dyn Authorizer>,
        timers: &dyn TimerFactory,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let l = config.log_size();

        info!(n = config.n, f = config.f, "PBFT replica count and fault tolerance");
        info!(byzantine = config.byzantine, "PBFT byzantine debug flag");
        info!(request_timeout = ?config.request_timeout, "PBFT request timeout");
        info!(view_change_timeout = ?config.view_change_timeout, "PBFT view change timeout");
        info!(k = config.k, l, "PBFT checkpoint period and log size");
        if config.null_request_timeout.is_zero() {
            info!("PBFT null requests disabled");
        } else {
            info!(null_request_timeout = ?config.null_request_timeout, "PBFT null request timeout");
        }
        if config.view_change_period > 0 {
            info!(period = config.view_change_period, "PBFT automatic view change period");
        } else {
            info!("PBFT automatic view change disabled");
        }

        let mut instance = Self {
            id,
            l,
            view: 0,
            seq_no: 0,
            h: 0,
            last_exec: 0,
            current_exec: None,
            active_view: true,
            skip_in_progress: false,
            view_change_seq_no: u64::MAX,
            cert_store: IndexMap::new(),
            req_batch_store: HashMap::new(),
            outstanding_req_batches: HashMap::new(),
            missing_req_batches: HashSet::new(),
            chkpts: BTreeMap::new(),
            checkpoint_store: HashMap::new(),
            h_chkpts: HashMap::new(),
            view_change_store: HashMap::new(),
            new_view_store: HashMap::new(),
            broadcaster,
            execution,
            authorizer,
            request_timer: timers.create_timer(),
            null_request_timer: timers.create_timer(),
            vc_resend_timer: timers.create_timer(),
            last_new_view_timeout: config.view_change_timeout,
            config,
        };

        instance.update_view_change_seq_no();
        instance.restart_null_request_timer();
        Ok(instance)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// This replica's id.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// The current view.
    pub fn view(&self) -> u64 {
        self.view
    }

    /// Whether the current view is active (no view change in progress).
    pub fn active_view(&self) -> bool {
        self.active_view
    }

    /// The last executed sequence number.
    pub fn last_exec(&self) -> u64 {
        self.last_exec
    }

    /// The low watermark `h`.
    pub fn low_watermark(&self) -> u64 {
        self.h
    }

    /// The expected primary for a view.
    pub fn primary(&self, v: u64) -> ReplicaId {
        ReplicaId(v % self.config.n)
    }

    /// Whether this replica is the current view's primary.
    pub fn is_primary(&self) -> bool {
        self.primary(self.view) == self.id
    }

    /// Is the sequence number between watermarks?
    pub(crate) fn in_w(&self, n: u64) -> bool {
        n > self.h && n <= self.h + self.l
    }

    /// Is the view current and the sequence number between watermarks?
    pub(crate) fn in_wv(&self, v: u64, n: u64) -> bool {
        self.view == v && self.in_w(n)
    }

    /// Prepares needed on top of a pre-prepare for a prepared certificate.
    pub(crate) fn prepare_quorum(&self) -> usize {
        (2 * self.config.f) as usize
    }

    /// Commits needed for a committed certificate.
    pub(crate) fn commit_quorum(&self) -> usize {
        (2 * self.config.f + 1) as usize
    }

    /// Get the certificate for (view, seq), creating it if absent.
    pub(crate) fn get_cert(&mut self, v: u64, n: u64) -> &mut MsgCert {
        self.cert_store.entry(MsgId { v, n }).or_default()
    }

    /// Whether the certificate for (digest, view, seq) is prepared:
    /// a pre-prepare plus at least 2f matching prepares (own included).
    pub(crate) fn prepared(&self, digest: &Hash, v: u64, n: u64) -> bool {
        if !digest.is_zero() && !self.req_batch_store.contains_key(digest) {
            return false;
        }
        let Some(cert) = self.cert_store.get(&MsgId { v, n }) else {
            return false;
        };
        let Some(pp) = &cert.pre_prepare else {
            return false;
        };
        if pp.view != v || pp.seq_no != n || pp.batch_digest != *digest {
            return false;
        }
        let matching = cert
            .prepares
            .iter()
            .filter(|p| p.view == v && p.seq_no == n && p.batch_digest == *digest)
            .count();
        matching >= self.prepare_quorum()
    }

    /// Whether the certificate is committed: prepared locally plus at
    /// least 2f+1 matching commits.
    pub(crate) fn committed(&self, digest: &Hash, v: u64, n: u64) -> bool {
        if !self.prepared(digest, v, n) {
            return false;
        }
        let Some(cert) = self.cert_store.get(&MsgId { v, n }) else {
            return false;
        };
        let matching = cert
            .commits
            .iter()
            .filter(|c| c.view == v && c.seq_no == n && c.batch_digest == *digest)
            .count();
        matching >= self.commit_quorum()
    }

    /// Broadcast unless the byzantine debug flag suppresses it.
    pub(crate) fn maybe_broadcast(&self, msg: ConsensusMessage) {
        if self.config.byzantine {
            warn!(
                replica = %self.id,
                msg = msg.type_name(),
                "byzantine debug mode, suppressing broadcast"
            );
            return;
        }
        self.broadcaster.broadcast(msg);
    }

    fn restart_null_request_timer(&mut self) {
        if self.config.null_request_timeout.is_zero() {
            return;
        }
        let timeout = self.config.null_request_timeout;
        self.null_request_timer.reset(timeout, Event::NullRequestTimeout);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Consensus message dispatch
    // ═══════════════════════════════════════════════════════════════════════

    /// Dispatch a consensus message from a peer.
    pub(crate) fn recv_consensus(&mut self, msg: ConsensusMessage) {
        match msg {
            ConsensusMessage::PrePrepare(pp) => self.recv_pre_prepare(pp),
            ConsensusMessage::Prepare(p) => self.recv_prepare(p),
            ConsensusMessage::Commit(c) => self.recv_commit(c),
            ConsensusMessage::Checkpoint(ck) => self.recv_checkpoint(ck),
            ConsensusMessage::ViewChange(vc) => self.recv_view_change(vc),
            ConsensusMessage::NewView(nv) => self.recv_new_view(nv),
            ConsensusMessage::NullRequest { view, replica_id } => {
                self.recv_null_request(view, replica_id)
            }
            ConsensusMessage::Transaction(_) => {
                // Transactions are the batching front-end's concern.
                warn!(replica = %self.id, "transaction reached the core state machine, dropping");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Request batches and the pre-prepare phase
    // ═══════════════════════════════════════════════════════════════════════

    /// Accept a cut request batch for ordering.
    ///
    /// Idempotent: re-receiving an already-stored batch is a safe no-op at
    /// the store level, and the duplicate-ordering guard in
    /// [`Self::send_pre_prepare`] prevents double-ordering.
    pub(crate) fn recv_request_batch(&mut self, batch: RequestBatch) {
        let digest = batch.digest();
        debug!(replica = %self.id, %digest, requests = batch.len(), "received request batch");

        self.req_batch_store.insert(digest, batch.clone());
        self.outstanding_req_batches.insert(digest, batch.clone());
        let timeout = self.config.request_timeout;
        self.request_timer.soft_reset(timeout, Event::RequestTimeout);

        // A batch that already committed while we lacked its payload can
        // execute now.
        if self.missing_req_batches.remove(&digest) {
            info!(replica = %self.id, %digest, "previously missing batch arrived");
            self.execute_outstanding();
            return;
        }

        if self.is_primary() && self.active_view {
            // Real traffic supersedes the heartbeat.
            self.null_request_timer.stop();
            self.send_pre_prepare(batch, digest);
        } else {
            debug!(replica = %self.id, %digest, "backup, not sending pre-prepare");
        }
    }

    /// Primary path: assign the next sequence number and broadcast a
    /// pre-prepare for the batch.
    pub(crate) fn send_pre_prepare(&mut self, batch: RequestBatch, digest: Hash) {
        let n = self.seq_no + 1;

        // Another pre-prepare in this view with the same digest but a
        // different sequence number means the batch is already being
        // ordered; issuing a second one would double-order it.
        for cert in self.cert_store.values() {
            if let Some(pp) = &cert.pre_prepare {
                if pp.view == self.view
                    && pp.seq_no != n
                    && pp.batch_digest == digest
                    && !digest.is_zero()
                {
                    info!(
                        replica = %self.id,
                        existing_seq = pp.seq_no,
                        seq_no = n,
                        %digest,
                        "pre-prepare already in flight for this digest"
                    );
                    return;
                }
            }
        }

        // Keep headroom below the high watermark so checkpoints can
        // stabilize before the window is exhausted.
        if !self.in_wv(self.view, n) || n > self.h + self.l / 2 {
            warn!(
                replica = %self.id,
                seq_no = n,
                h = self.h,
                %digest,
                "not sending pre-prepare, out of sequence numbers"
            );
            return;
        }

        if n > self.view_change_seq_no {
            info!(
                replica = %self.id,
                seq_no = n,
                view_change_seq_no = self.view_change_seq_no,
                "about to switch to the next primary, not sending pre-prepare"
            );
            return;
        }

        debug!(
            replica = %self.id,
            view = self.view,
            seq_no = n,
            %digest,
            "primary broadcasting pre-prepare"
        );
        self.seq_no = n;
        let pp = PrePrepare {
            view: self.view,
            seq_no: n,
            batch_digest: digest,
            request_batch: batch,
            replica_id: self.id,
        };
        let cert = self.get_cert(pp.view, pp.seq_no);
        cert.pre_prepare = Some(pp.clone());
        cert.digest = digest;
        self.maybe_broadcast(ConsensusMessage::PrePrepare(pp));
    }

    /// Backup path: validate and record the primary's pre-prepare, then
    /// vote with a prepare.
    pub(crate) fn recv_pre_prepare(&mut self, pp: PrePrepare) {
        debug!(
            replica = %self.id,
            from = %pp.replica_id,
            view = pp.view,
            seq_no = pp.seq_no,
            "received pre-prepare"
        );

        if !self.active_view {
            debug!(replica = %self.id, "ignoring pre-prepare while view change is in progress");
            return;
        }

        if self.primary(pp.view) != pp.replica_id {
            warn!(
                replica = %self.id,
                from = %pp.replica_id,
                view = pp.view,
                "pre-prepare from a replica that is not the view's primary, dropping"
            );
            return;
        }

        if !self.authorizer.is_authorized(pp.replica_id, Role::Proposer) {
            warn!(replica = %self.id, from = %pp.replica_id, "pre-prepare from unauthorized proposer, dropping");
            return;
        }

        if !self.in_wv(pp.view, pp.seq_no) {
            warn!(
                replica = %self.id,
                view = pp.view,
                seq_no = pp.seq_no,
                h = self.h,
                "pre-prepare outside watermark window or wrong view, dropping"
            );
            return;
        }

        if !pp.batch_digest.is_zero() && pp.request_batch.digest() != pp.batch_digest {
            warn!(
                replica = %self.id,
                from = %pp.replica_id,
                claimed = %pp.batch_digest,
                "pre-prepare digest does not match its batch, dropping"
            );
            return;
        }

        let id = self.id;
        let cert = self.get_cert(pp.view, pp.seq_no);
        if let Some(existing) = &cert.pre_prepare {
            if existing.batch_digest != pp.batch_digest {
                warn!(
                    replica = %id,
                    view = pp.view,
                    seq_no = pp.seq_no,
                    existing = %existing.batch_digest,
                    conflicting = %pp.batch_digest,
                    "conflicting pre-prepare for the same view and sequence number, dropping"
                );
                return;
            }
        }
        cert.pre_prepare = Some(pp.clone());
        cert.digest = pp.batch_digest;
        let already_prepared = cert.sent_prepare;

        // The carried batch is authoritative for backups that never saw
        // the client submission.
        if !pp.batch_digest.is_zero() && !self.req_batch_store.contains_key(&pp.batch_digest) {
            self.req_batch_store
                .insert(pp.batch_digest, pp.request_batch.clone());
            self.outstanding_req_batches
                .insert(pp.batch_digest, pp.request_batch.clone());
        }
        self.missing_req_batches.remove(&pp.batch_digest);

        // A pre-prepare is primary activity.
        let timeout = self.config.request_timeout;
        self.request_timer.soft_reset(timeout, Event::RequestTimeout);
        self.restart_null_request_timer();

        if !self.is_primary() && !already_prepared {
            self.send_prepare(pp.view, pp.seq_no, pp.batch_digest);
        }
    }

    pub(crate) fn send_prepare(&mut self, v: u64, n: u64, digest: Hash) {
        debug!(replica = %self.id, view = v, seq_no = n, "sending prepare");
        self.get_cert(v, n).sent_prepare = true;
        let prepare = Prepare {
            view: v,
            seq_no: n,
            batch_digest: digest,
            replica_id: self.id,
        };
        // Count our own vote before broadcasting.
        self.recv_prepare(prepare.clone());
        self.maybe_broadcast(ConsensusMessage::Prepare(prepare));
    }

    pub(crate) fn recv_prepare(&mut self, prepare: Prepare) {
        debug!(
            replica = %self.id,
            from = %prepare.replica_id,
            view = prepare.view,
            seq_no = prepare.seq_no,
            "received prepare"
        );

        // The primary's agreement is its pre-prepare; it must not also
        // count a prepare.
        if self.primary(prepare.view) == prepare.replica_id {
            warn!(
                replica = %self.id,
                from = %prepare.replica_id,
                "prepare from the view's primary, dropping"
            );
            return;
        }

        if !self.in_wv(prepare.view, prepare.seq_no) {
            debug!(
                replica = %self.id,
                view = prepare.view,
                seq_no = prepare.seq_no,
                "prepare outside watermark window or wrong view, dropping"
            );
            return;
        }

        if prepare.replica_id != self.id
            && !self.authorizer.is_authorized(prepare.replica_id, Role::Voter)
        {
            warn!(replica = %self.id, from = %prepare.replica_id, "prepare from unauthorized voter, dropping");
            return;
        }

        let cert = self.get_cert(prepare.view, prepare.seq_no);
        if cert
            .prepares
            .iter()
            .any(|p| p.replica_id == prepare.replica_id)
        {
            warn!(
                replica = %self.id,
                from = %prepare.replica_id,
                seq_no = prepare.seq_no,
                "duplicate prepare, ignoring"
            );
            return;
        }
        cert.prepares.push(prepare.clone());

        self.maybe_send_commit(prepare.batch_digest, prepare.view, prepare.seq_no);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commit phase and execution
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn maybe_send_commit(&mut self, digest: Hash, v: u64, n: u64) {
        let already_committing = self
            .cert_store
            .get(&MsgId { v, n })
            .is_some_and(|cert| cert.sent_commit);
        if already_committing || !self.prepared(&digest, v, n) {
            return;
        }

        debug!(replica = %self.id, view = v, seq_no = n, "certificate prepared, sending commit");
        self.get_cert(v, n).sent_commit = true;
        let commit = Commit {
            view: v,
            seq_no: n,
            batch_digest: digest,
            replica_id: self.id,
        };
        self.recv_commit(commit.clone());
        self.maybe_broadcast(ConsensusMessage::Commit(commit));
    }

    pub(crate) fn recv_commit(&mut self, commit: Commit) {
        debug!(
            replica = %self.id,
            from = %commit.replica_id,
            view = commit.view,
            seq_no = commit.seq_no,
            "received commit"
        );

        if !self.in_wv(commit.view, commit.seq_no) {
            debug!(
                replica = %self.id,
                view = commit.view,
                seq_no = commit.seq_no,
                "commit outside watermark window or wrong view, dropping"
            );
            return;
        }

        if commit.replica_id != self.id
            && !self.authorizer.is_authorized(commit.replica_id, Role::Voter)
        {
            warn!(replica = %self.id, from = %commit.replica_id, "commit from unauthorized voter, dropping");
            return;
        }

        let cert = self.get_cert(commit.view, commit.seq_no);
        if cert
            .commits
            .iter()
            .any(|c| c.replica_id == commit.replica_id)
        {
            warn!(
                replica = %self.id,
                from = %commit.replica_id,
                seq_no = commit.seq_no,
                "duplicate commit, ignoring"
            );
            return;
        }
        cert.commits.push(commit.clone());

        if self.committed(&commit.batch_digest, commit.view, commit.seq_no) {
            debug!(
                replica = %self.id,
                view = commit.view,
                seq_no = commit.seq_no,
                "certificate committed"
            );
            self.execute_outstanding();
        }
    }

    /// Hand committed batches to the execution collaborator strictly in
    /// sequence order, one at a time.
    pub(crate) fn execute_outstanding(&mut self) {
        if self.current_exec.is_some() {
            // Execution of the next sequence number must not begin before
            // the previous one is acknowledged.
            return;
        }
        if self.skip_in_progress {
            debug!(replica = %self.id, "fallen behind, not executing until state transfer");
            return;
        }

        loop {
            let n = self.last_exec + 1;
            let Some(digest) = self.cert_store.iter().find_map(|(id, cert)| {
                (id.n == n && self.committed(&cert.digest, id.v, id.n)).then_some(cert.digest)
            }) else {
                break;
            };

            if digest.is_zero() {
                info!(replica = %self.id, seq_no = n, "null request, nothing to execute");
                self.last_exec = n;
                continue;
            }

            let Some(batch) = self.req_batch_store.get(&digest) else {
                warn!(replica = %self.id, seq_no = n, %digest, "committed batch missing from store");
                self.missing_req_batches.insert(digest);
                break;
            };

            info!(replica = %self.id, seq_no = n, %digest, "executing request batch");
            self.current_exec = Some(n);
            self.execution.execute(n, batch);
            break;
        }
    }

    /// The execution collaborator acknowledged a sequence number.
    pub(crate) fn on_execution_complete(&mut self, seq_no: u64, state_digest: Hash) {
        if self.current_exec != Some(seq_no) {
            warn!(
                replica = %self.id,
                seq_no,
                current = ?self.current_exec,
                "unexpected execution acknowledgement, ignoring"
            );
            return;
        }
        debug!(replica = %self.id, seq_no, "execution complete");
        self.current_exec = None;
        self.last_exec = seq_no;

        // The executed batch is no longer outstanding.
        if let Some(digest) = self
            .cert_store
            .iter()
            .find_map(|(id, cert)| (id.n == seq_no).then_some(cert.digest))
        {
            self.outstanding_req_batches.remove(&digest);
        }

        if self.outstanding_req_batches.is_empty() {
            self.request_timer.stop();
        } else {
            let timeout = self.config.request_timeout;
            self.request_timer.reset(timeout, Event::RequestTimeout);
        }
        // Execution progress counts as primary activity.
        self.restart_null_request_timer();

        if seq_no % self.config.k == 0 {
            self.send_checkpoint(seq_no, state_digest);
        }

        if self.view_change_seq_no != u64::MAX && seq_no >= self.view_change_seq_no {
            info!(replica = %self.id, seq_no, "view change period reached");
            self.send_view_change();
            return;
        }

        self.execute_outstanding();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Checkpoints and watermarks
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn send_checkpoint(&mut self, seq_no: u64, state_digest: Hash) {
        info!(replica = %self.id, seq_no, %state_digest, "broadcasting checkpoint");
        self.chkpts.insert(seq_no, state_digest);
        let checkpoint = Checkpoint {
            seq_no,
            state_digest,
            replica_id: self.id,
        };
        self.recv_checkpoint(checkpoint.clone());
        self.maybe_broadcast(ConsensusMessage::Checkpoint(checkpoint));
    }

    pub(crate) fn recv_checkpoint(&mut self, checkpoint: Checkpoint) {
        debug!(
            replica = %self.id,
            from = %checkpoint.replica_id,
            seq_no = checkpoint.seq_no,
            "received checkpoint"
        );

        if checkpoint.replica_id != self.id
            && !self
                .authorizer
                .is_authorized(checkpoint.replica_id, Role::Voter)
        {
            warn!(replica = %self.id, from = %checkpoint.replica_id, "checkpoint from unauthorized voter, dropping");
            return;
        }

        if !self.in_w(checkpoint.seq_no) && checkpoint.seq_no != self.h {
            self.witness_checkpoint(&checkpoint);
            return;
        }

        let confirmations = self
            .checkpoint_store
            .entry((checkpoint.seq_no, checkpoint.state_digest))
            .or_default();
        if !confirmations.insert(checkpoint.replica_id) {
            debug!(
                replica = %self.id,
                from = %checkpoint.replica_id,
                seq_no = checkpoint.seq_no,
                "duplicate checkpoint, ignoring"
            );
            return;
        }
        let matching = confirmations.len();

        if matching < self.commit_quorum() {
            return;
        }

        if self.chkpts.contains_key(&checkpoint.seq_no) {
            self.move_watermarks(checkpoint.seq_no);
        } else {
            debug!(
                replica = %self.id,
                seq_no = checkpoint.seq_no,
                "checkpoint quorum for a sequence number we have not reached yet"
            );
        }
    }

    /// Track an out-of-window checkpoint. f+1 replicas checkpointing
    /// beyond our high watermark proves we have fallen behind.
    fn witness_checkpoint(&mut self, checkpoint: &Checkpoint) {
        let high = self.h + self.l;
        if checkpoint.seq_no <= self.h {
            debug!(
                replica = %self.id,
                seq_no = checkpoint.seq_no,
                h = self.h,
                "stale checkpoint below the low watermark, ignoring"
            );
            return;
        }

        self.h_chkpts.insert(checkpoint.replica_id, checkpoint.seq_no);
        let witness_quorum = (self.config.f + 1) as usize;
        if self.h_chkpts.len() < witness_quorum {
            return;
        }

        let mut highs: Vec<u64> = self.h_chkpts.values().copied().collect();
        highs.sort_unstable();
        let witnessed = highs[highs.len() - witness_quorum];
        if witnessed > high {
            warn!(
                replica = %self.id,
                witnessed,
                h = self.h,
                "f+1 replicas have checkpointed beyond our high watermark, we have fallen behind"
            );
            self.skip_in_progress = true;
            self.move_watermarks(witnessed);
        }
    }

    /// Advance the low watermark and garbage-collect everything below it.
    pub(crate) fn move_watermarks(&mut self, n: u64) {
        if n <= self.h {
            return;
        }

        let mut stale_digests: Vec<Hash> = Vec::new();
        self.cert_store.retain(|id, cert| {
            if id.n <= n {
                stale_digests.push(cert.digest);
                false
            } else {
                true
            }
        });
        for digest in stale_digests {
            self.req_batch_store.remove(&digest);
            self.outstanding_req_batches.remove(&digest);
        }
        self.checkpoint_store.retain(|(seq, _), _| *seq > n);
        self.chkpts.retain(|seq, _| *seq >= n);

        self.h = n;
        if self.last_exec < n {
            self.last_exec = n;
        }
        if self.seq_no < n {
            self.seq_no = n;
        }
        debug!(replica = %self.id, h = n, "moved low watermark");
        self.update_view_change_seq_no();
    }

    pub(crate) fn update_view_change_seq_no(&mut self) {
        if self.config.view_change_period == 0 {
            self.view_change_seq_no = u64::MAX;
            return;
        }
        self.view_change_seq_no = self.seq_no + self.config.view_change_period * self.config.k;
        debug!(
            replica = %self.id,
            view_change_seq_no = self.view_change_seq_no,
            "next automatic view change scheduled"
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Null requests and timeouts
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn recv_null_request(&mut self, view: u64, replica_id: ReplicaId) {
        if view != self.view || self.primary(view) != replica_id {
            warn!(
                replica = %self.id,
                from = %replica_id,
                view,
                "null request from a replica that is not the current primary, dropping"
            );
            return;
        }
        debug!(replica = %self.id, from = %replica_id, "primary heartbeat received");
        self.restart_null_request_timer();
    }

    pub(crate) fn on_null_request_timeout(&mut self) {
        if self.is_primary() {
            debug!(replica = %self.id, "null request timer expired on the primary, heartbeating");
            self.maybe_broadcast(ConsensusMessage::NullRequest {
                view: self.view,
                replica_id: self.id,
            });
            self.restart_null_request_timer();
        } else {
            warn!(
                replica = %self.id,
                view = self.view,
                "primary silent beyond the null request timeout, initiating view change"
            );
            self.send_view_change();
        }
    }

    pub(crate) fn on_request_timeout(&mut self) {
        warn!(
            replica = %self.id,
            view = self.view,
            outstanding = self.outstanding_req_batches.len(),
            "no execution progress within the request timeout, initiating view change"
        );
        self.send_view_change();
    }
}

impl Receiver for PbftCore {
    fn process_event(&mut self, event: Event) -> Option<Event> {
        debug!(replica = %self.id, event = event.type_name(), "processing event");
        match event {
            Event::RequestBatch(batch) => self.recv_request_batch(batch),
            Event::Incoming(Message::Consensus(msg)) => self.recv_consensus(msg),
            Event::Incoming(other) => {
                // Client traffic is intercepted by the batching front-end;
                // anything arriving here is unexpected but never fatal.
                warn!(
                    replica = %self.id,
                    msg = other.type_name(),
                    "unexpected message type at the core state machine, dropping"
                );
            }
            Event::RequestTimeout => self.on_request_timeout(),
            Event::NullRequestTimeout => self.on_null_request_timeout(),
            Event::ViewChangeResendTimeout => self.on_view_change_resend_timeout(),
            Event::ExecutionComplete {
                seq_no,
                state_digest,
            } => self.on_execution_complete(seq_no, state_digest),
            Event::BatchTimeout => {
                warn!(replica = %self.id, "batch timeout reached the core state machine, dropping");
            }
        }
        None
    }
}
