//! View changes.
//!
//! A backup that stops hearing from its primary proposes `view + 1`
//! with `start_view_change`. Once a quorum agrees, everyone sends
//! `do_view_change` — log position, authoritative `log_view`, and the
//! uncommitted header suffix — to the new primary. The new primary
//! picks the canonical log (highest `log_view`, ties by highest op),
//! repairs what it is missing, truncates what is provably absent, and
//! broadcasts `start_view`.
//!
//! Safety turns on two rules:
//!
//! - **Nack rule**: an op counts as nacked by a replica only if that
//!   replica has no header for it, its `commit_max` is below it, and
//!   the op's slot was not reported faulty. An op nacked by `f + 1`
//!   replicas was acked by no quorum and may be truncated; anything
//!   less must be repaired, never dropped.
//! - **Forfeit rule**: a primary-elect whose checkpoint lags the
//!   quorum forfeits to the next candidate rather than blocking
//!   progress behind a state sync.

use std::collections::{BTreeMap, HashSet};

use corundum_io::Storage;
use corundum_storage::Wal;
use corundum_types::{Checksum, OpNumber, ReplicaStatus, ViewNumber};
use corundum_wire::{body, decode_headers, encode_headers, Command, Header, Message};

use super::{Replica, ReplicaOutput};
use crate::StateMachine;

/// One replica's do_view_change contribution.
#[derive(Debug, Clone)]
pub(crate) struct DvcReceived {
    pub log_view: ViewNumber,
    pub op_head: OpNumber,
    pub commit_max: OpNumber,
    pub checkpoint_op: OpNumber,
    pub headers: BTreeMap<u64, Header>,
    pub faulty_slots: HashSet<u32>,
}

impl DvcReceived {
    fn header_for(&self, op: OpNumber) -> Option<&Header> {
        self.headers.get(&op.as_u64())
    }

    /// The nack predicate: no header, commit below the op,
    /// and the op's slot not reported faulty.
    fn nacks(&self, op: OpNumber) -> bool {
        self.header_for(op).is_none()
            && self.commit_max < op
            && !self.faulty_slots.contains(&(op.slot() as u32))
    }
}

impl<S: Storage, M: StateMachine> Replica<S, M> {
    // ========================================================================
    // Initiation
    // ========================================================================

    /// Enters view-change status for `new_view` and broadcasts
    /// `start_view_change`.
    pub(crate) fn start_view_change(&mut self, new_view: ViewNumber, output: &mut ReplicaOutput) {
        assert!(new_view > self.view || self.status == ReplicaStatus::Normal);
        assert!(!self.standby, "standbys do not vote");

        tracing::info!(
            replica = %self.replica_id,
            old_view = %self.view,
            new_view = %new_view,
            "starting view change"
        );

        self.view = new_view;
        self.status = ReplicaStatus::ViewChange;
        self.pipeline.clear();
        self.svc_votes.clear();
        self.svc_votes.insert(self.replica_id);
        self.dvc_received.clear();
        self.vc_target_commit = None;

        // The vote is durable before it is visible: a replica must not
        // forget mid-election that it moved to this view.
        self.persist_view_state();

        let header = self.base_header(Command::StartViewChange);
        output.broadcast(self.message(header));
        self.reset_role_timeouts();
    }

    /// Durably records `view` and `log_view` in the superblock.
    pub(crate) fn persist_view_state(&mut self) {
        let mut image = self.superblock.working().clone();
        image.vsr_state.view = self.view;
        image.vsr_state.log_view = self.log_view;
        self.superblock
            .update(&mut self.storage, image)
            .expect("superblock view persist failed; halting to avoid divergence");
    }

    /// The view-change timeout: trigger in normal status, resend in
    /// view-change status.
    pub(crate) fn on_view_change_timeout(&mut self, output: &mut ReplicaOutput) {
        self.timeouts.rearm_view_change(&mut self.prng);
        if self.standby {
            return;
        }
        match self.status {
            ReplicaStatus::Normal => {
                if !self.is_primary() && self.config.replica_count() > 1 {
                    self.start_view_change(self.view.next(), output);
                }
            }
            ReplicaStatus::ViewChange => {
                // Stalled election: re-announce, and re-send our DVC if
                // the SVC quorum was already reached.
                let header = self.base_header(Command::StartViewChange);
                output.broadcast(self.message(header));
                if self.svc_votes.len() >= self.config.quorum() {
                    self.send_do_view_change(output);
                }
            }
            ReplicaStatus::Recovering | ReplicaStatus::RecoveringHead => {}
        }
    }

    // ========================================================================
    // start_view_change
    // ========================================================================

    pub(crate) fn on_start_view_change(&mut self, header: &Header, output: &mut ReplicaOutput) {
        if self.standby || self.votes_suppressed() {
            return;
        }
        if !self.config.is_active(header.replica) {
            return;
        }
        if header.view < self.view {
            return;
        }

        if header.view > self.view {
            self.start_view_change(header.view, output);
            self.svc_votes.insert(header.replica);
        } else if self.status == ReplicaStatus::ViewChange {
            self.svc_votes.insert(header.replica);
        } else {
            // Same view, normal status: the election already resolved.
            return;
        }

        if self.status == ReplicaStatus::ViewChange && self.svc_votes.len() >= self.config.quorum()
        {
            self.send_do_view_change(output);
        }
    }

    fn send_do_view_change(&mut self, output: &mut ReplicaOutput) {
        let headers = self
            .journal
            .headers_in_range(self.commit_min.next(), self.op_head);
        let dvc_body = body::DoViewChangeBody {
            log_view: self.log_view,
            checkpoint_op: self.op_checkpoint(),
            headers: encode_headers(&headers),
            faulty_slots: self.journal.faulty_slots(),
        };

        let mut header = self.base_header(Command::DoViewChange);
        header.op = self.op_head;
        header.commit = corundum_types::CommitNumber::new(self.commit_max);
        let message = self.message_with_body(header, body::encode(&dvc_body));

        let primary = self.primary();
        if primary == self.replica_id {
            self.record_do_view_change(self.replica_id, &message, output);
        } else {
            output.send_replica(primary, message);
        }
    }

    // ========================================================================
    // do_view_change (primary-elect)
    // ========================================================================

    pub(crate) fn on_do_view_change(&mut self, message: &Message, output: &mut ReplicaOutput) {
        let header = *message.header();
        if self.standby || !self.config.is_active(header.replica) {
            return;
        }
        if self.config.primary_for(header.view) != self.replica_id {
            return;
        }
        if header.view < self.view {
            return;
        }
        if header.view == self.view && self.status == ReplicaStatus::Normal {
            // Already formed this view; the sender missed start_view.
            self.send_start_view(header.replica, output);
            return;
        }
        if header.view > self.view {
            self.start_view_change(header.view, output);
        }
        if self.status != ReplicaStatus::ViewChange {
            return;
        }

        self.record_do_view_change(header.replica, message, output);
    }

    fn record_do_view_change(
        &mut self,
        from: corundum_types::ReplicaId,
        message: &Message,
        output: &mut ReplicaOutput,
    ) {
        let header = message.header();
        let Ok(dvc) = body::decode::<body::DoViewChangeBody>(message.body()) else {
            return;
        };
        let Some(headers) = decode_headers(&dvc.headers) else {
            return;
        };

        self.dvc_received.insert(
            from,
            DvcReceived {
                log_view: dvc.log_view,
                op_head: header.op,
                commit_max: header.commit.as_op_number(),
                checkpoint_op: dvc.checkpoint_op,
                headers: headers.into_iter().map(|h| (h.op.as_u64(), h)).collect(),
                faulty_slots: dvc.faulty_slots.into_iter().collect(),
            },
        );

        if self.dvc_received.len() >= self.config.quorum() {
            self.form_view(output);
        }
    }

    /// With a DVC quorum collected: select the canonical log, repair
    /// or truncate the uncertain range, and complete when the log is
    /// whole.
    fn form_view(&mut self, output: &mut ReplicaOutput) {
        // Forfeit rule: a primary that must state-sync would block the
        // view; hand leadership to the next in line instead.
        let quorum_checkpoint = self
            .dvc_received
            .values()
            .map(|d| d.checkpoint_op)
            .max()
            .unwrap();
        if quorum_checkpoint > self.op_checkpoint() {
            tracing::warn!(
                replica = %self.replica_id,
                ours = %self.op_checkpoint(),
                quorum = %quorum_checkpoint,
                "checkpoint lags the quorum; forfeiting leadership"
            );
            let next = self.view.next();
            self.start_view_change(next, output);
            return;
        }

        // Canonical log: highest log_view, ties by highest op head.
        let canonical = self
            .dvc_received
            .values()
            .max_by_key(|d| (d.log_view, d.op_head))
            .unwrap()
            .clone();
        let commit_max = self
            .dvc_received
            .values()
            .map(|d| d.commit_max)
            .max()
            .unwrap()
            .max(self.commit_min);
        let mut op_head = canonical.op_head.max(commit_max);

        // Assemble the canonical chain for (commit_min, op_head],
        // filling canonical gaps from other quorum members where the
        // checksum provably chains.
        let mut chain: BTreeMap<u64, Header> = canonical
            .headers
            .iter()
            .filter(|(op, _)| OpNumber::new(**op) <= op_head)
            .map(|(op, h)| (*op, *h))
            .collect();
        for op in (self.commit_min.next().as_u64()..=op_head.as_u64()).rev() {
            if chain.contains_key(&op) {
                continue;
            }
            let required: Option<Checksum> = chain.get(&(op + 1)).map(|next| next.parent);
            for dvc in self.dvc_received.values() {
                if let Some(candidate) = dvc.header_for(OpNumber::new(op)) {
                    let chains = match required {
                        Some(checksum) => candidate.checksum == checksum,
                        // Without a successor to pin it, only a header
                        // from the same log_view as the canonical log
                        // is trustworthy here.
                        None => dvc.log_view == canonical.log_view,
                    };
                    if chains {
                        chain.insert(op, *candidate);
                        break;
                    }
                }
            }
        }

        // Uncertain ops: present in no quorum log. Certainly committed
        // (some commit_max covers it) → must repair. Certainly absent
        // (f+1 nacks) → truncate. Otherwise wait for repair.
        let mut truncate_from: Option<OpNumber> = None;
        for op in commit_max.next().as_u64()..=op_head.as_u64() {
            let op = OpNumber::new(op);
            if chain.contains_key(&op.as_u64()) {
                continue;
            }
            let nacks = self
                .dvc_received
                .values()
                .filter(|d| d.nacks(op))
                .count();
            if nacks >= self.config.quorum_nack() {
                truncate_from = Some(op);
                break;
            }
        }
        if let Some(op) = truncate_from {
            tracing::info!(
                replica = %self.replica_id,
                from = %op,
                old_head = %op_head,
                "truncating uncommitted suffix nacked by a quorum"
            );
            op_head = op.prev();
            chain.retain(|&o, _| o <= op_head.as_u64());
        }

        // Install the chain: keep matching local entries, adopt the
        // rest as dirty headers (bodies repaired below).
        for header in chain.values() {
            let have = self.journal.checksum_for_op(header.op);
            if have == Some(header.checksum) && self.journal.has_prepare(header.op) {
                continue;
            }
            let _ = Wal::repair_header(&mut self.storage, header);
            self.journal.set_header_dirty(*header);
        }
        // Anything we logged above the canonical head is uncommitted
        // debris from a dead view.
        if self.op_head > op_head {
            for op in (op_head.next().as_u64())..=self.op_head.as_u64() {
                let op = OpNumber::new(op);
                if self.journal.header_for_op(op).is_some() {
                    self.journal.clear_slot(op.slot());
                }
            }
        }
        self.op_head = op_head;
        self.vc_target_commit = Some(commit_max);

        self.maybe_complete_view_change(output);
    }

    /// Completes the view change once every op in
    /// `(commit_min, op_head]` has an intact body locally; otherwise
    /// sends the repair requests that will get us there.
    pub(crate) fn maybe_complete_view_change(&mut self, output: &mut ReplicaOutput) {
        let Some(commit_max) = self.vc_target_commit else {
            return;
        };

        let missing: Vec<OpNumber> = self
            .journal
            .repair_candidates(self.commit_min.next(), self.op_head)
            .collect();
        if !missing.is_empty() {
            for op in missing {
                let checksum = self.journal.checksum_for_op(op).unwrap_or(Checksum::ZERO);
                self.send_request_prepare(op, checksum, output);
            }
            return;
        }

        // The log is canonical and complete: the view starts.
        self.status = ReplicaStatus::Normal;
        self.log_view = self.view;
        self.advance_commit_max(commit_max);
        self.vc_target_commit = None;
        self.dvc_received.clear();
        self.svc_votes.clear();
        self.persist_view_state();

        tracing::info!(
            replica = %self.replica_id,
            view = %self.view,
            op_head = %self.op_head,
            commit_max = %self.commit_max,
            "view formed"
        );

        // Re-stage the uncommitted suffix for quorum in the new view.
        self.pipeline.clear();
        for op in self.commit_max.next().as_u64()..=self.op_head.as_u64() {
            let op = OpNumber::new(op);
            let checksum = self.journal.checksum_for_op(op).unwrap();
            if self.pipeline.prepare_queue_full() {
                break;
            }
            match Wal::read_prepare_if(
                &mut self.storage,
                self.config.cluster(),
                op.slot(),
                checksum,
            ) {
                corundum_storage::PrepareRead::Ok(prepare) => {
                    self.pipeline.push_prepare(prepare, self.replica_id);
                }
                corundum_storage::PrepareRead::Missing => break,
            }
        }

        self.broadcast_start_view(output);
        self.reset_role_timeouts();
        self.commit_journal(output);
        self.try_commit_pipeline(output);
    }

    fn broadcast_start_view(&mut self, output: &mut ReplicaOutput) {
        let message = self.build_start_view();
        output.broadcast(message);
    }

    fn send_start_view(&mut self, to: corundum_types::ReplicaId, output: &mut ReplicaOutput) {
        let message = self.build_start_view();
        output.send_replica(to, message);
    }

    fn build_start_view(&mut self) -> Message {
        // Anchor at commit_max plus the uncommitted suffix.
        let anchor = self.commit_max.max(OpNumber::new(1));
        let headers = self.journal.headers_in_range(anchor, self.op_head);
        let sv_body = body::StartViewBody {
            checkpoint_op: self.op_checkpoint(),
            checkpoint_id: self.checkpoint_id(),
            headers: encode_headers(&headers),
        };
        let mut header = self.base_header(Command::StartView);
        header.op = self.op_head;
        header.commit = corundum_types::CommitNumber::new(self.commit_max);
        self.message_with_body(header, body::encode(&sv_body))
    }

    // ========================================================================
    // start_view (backups, recovering_head, standbys)
    // ========================================================================

    pub(crate) fn on_start_view(&mut self, message: &Message, output: &mut ReplicaOutput) {
        let header = *message.header();
        if header.view < self.view {
            return;
        }
        if header.view == self.view
            && self.status == ReplicaStatus::Normal
            && self.log_view == self.view
        {
            return; // Already in this view.
        }
        if self.config.primary_for(header.view) != header.replica {
            return;
        }
        let Ok(sv) = body::decode::<body::StartViewBody>(message.body()) else {
            return;
        };
        let Some(headers) = decode_headers(&sv.headers) else {
            return;
        };

        // Too far behind for the WAL: state-sync to the primary's
        // checkpoint instead of adopting a log we cannot hold.
        if sv.checkpoint_op > self.op_checkpoint()
            && header.commit.as_op_number() > self.prepare_max()
        {
            self.begin_sync(sv.checkpoint_op, sv.checkpoint_id, output);
            return;
        }

        tracing::info!(
            replica = %self.replica_id,
            view = %header.view,
            op_head = %header.op,
            "adopting start_view"
        );

        self.view = header.view;
        self.log_view = header.view;
        self.status = ReplicaStatus::Normal;
        self.pipeline.clear();
        self.svc_votes.clear();
        self.dvc_received.clear();
        self.vc_target_commit = None;

        // Adopt the canonical suffix.
        for canonical in &headers {
            let have = self.journal.checksum_for_op(canonical.op);
            if have == Some(canonical.checksum) && self.journal.has_prepare(canonical.op) {
                continue;
            }
            let _ = Wal::repair_header(&mut self.storage, canonical);
            self.journal.set_header_dirty(*canonical);
        }
        // Drop uncommitted debris beyond the canonical head.
        if self.op_head > header.op {
            for op in header.op.next().as_u64()..=self.op_head.as_u64() {
                let op = OpNumber::new(op);
                if self.journal.header_for_op(op).is_some() && !self.journal.has_prepare(op) {
                    self.journal.clear_slot(op.slot());
                }
            }
        }
        self.op_head = header.op.max(self.commit_min);

        self.persist_view_state();
        self.advance_commit_max(header.commit.as_op_number());

        // Ack the uncommitted suffix so the new primary can commit it.
        for op in self.commit_max.next().as_u64()..=self.op_head.as_u64() {
            let op = OpNumber::new(op);
            if self.journal.has_prepare(op) {
                let prepare = *self.journal.header_for_op(op).unwrap();
                let mut ok = self.base_header(Command::PrepareOk);
                ok.op = op;
                ok.parent = prepare.checksum;
                output.send_replica(self.primary(), self.message(ok));
            }
        }

        self.reset_role_timeouts();
        self.commit_journal(output);
    }

    // ========================================================================
    // request_start_view
    // ========================================================================

    /// Asks the primary of `view` for `start_view` — sent when we learn
    /// of a newer view, and periodically while `recovering_head`.
    pub(crate) fn request_start_view(&mut self, view: ViewNumber, output: &mut ReplicaOutput) {
        let mut header = self.base_header(Command::RequestStartView);
        header.view = view;
        let target = self.config.primary_for(view);
        output.send_replica(target, self.message(header));
    }

    pub(crate) fn on_request_start_view(&mut self, header: &Header, output: &mut ReplicaOutput) {
        if self.standby {
            return;
        }
        if !self.is_primary() || self.status != ReplicaStatus::Normal {
            return;
        }
        if header.view > self.view {
            return;
        }
        self.send_start_view(header.replica, output);
    }
}
