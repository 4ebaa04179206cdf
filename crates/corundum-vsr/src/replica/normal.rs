//! Normal-operation handlers.
//!
//! Request admission and the prepare / prepare_ok / commit flow, plus
//! the ping/pong liveness and census traffic. The happy path:
//!
//! 1. Client sends `request`; the primary assigns the next op, logs
//!    the prepare, and broadcasts it.
//! 2. Each backup logs the prepare and acks with `prepare_ok`.
//! 3. On a quorum of acks the primary commits in pipeline order,
//!    replies to the client, and advertises the new `commit_max`.
//! 4. Backups commit as `commit_max` reaches them, respecting the
//!    hash chain.

use corundum_io::Storage;
use corundum_storage::{ClientReplies, ReplyRead, Wal};
use corundum_types::{ReplicaStatus, Timestamp};
use corundum_wire::{body, Command, Header, Message, Operation};

use super::{Recipient, Replica, ReplicaOutput};
use crate::StateMachine;

impl<S: Storage, M: StateMachine> Replica<S, M> {
    // ========================================================================
    // Liveness (ping / pong)
    // ========================================================================

    pub(crate) fn send_ping(&mut self, output: &mut ReplicaOutput) {
        let mut header = self.base_header(Command::Ping);
        header.op = self.op_head;
        output.broadcast(self.message(header));
    }

    pub(crate) fn on_ping(&mut self, header: &Header, output: &mut ReplicaOutput) {
        self.observe_view(header, output);
        if header.replica == self.primary() && header.view == self.view {
            self.note_primary_liveness();
        }

        let mut pong = self.base_header(Command::Pong);
        pong.op = self.op_head;
        let pong_body = body::encode(&body::PongBody {
            checkpoint_op: self.op_checkpoint(),
            checkpoint_id: self.checkpoint_id(),
            release_max: self.upgrade.release_max(),
        });
        output.send_replica(header.replica, self.message_with_body(pong, pong_body));
    }

    pub(crate) fn on_pong(&mut self, message: &Message, output: &mut ReplicaOutput) {
        let header = message.header();
        let Ok(pong) = body::decode::<body::PongBody>(message.body()) else {
            return;
        };

        self.peer_checkpoints
            .insert(header.replica, (pong.checkpoint_op, pong.checkpoint_id));
        if self.config.is_active(header.replica) {
            self.upgrade.learn_peer(header.replica, pong.release_max);
            self.upgrade.decide_target(
                self.release,
                self.config.active_replicas(),
                self.replica_id,
            );
        }

        self.observe_view(header, output);
        self.advance_commit_max(header.commit.as_op_number());
        self.maybe_start_sync(output);
        self.commit_journal(output);
    }

    /// Reacts to evidence of a newer view: ask its primary for
    /// `start_view`. The log is adopted there, never from hearsay.
    pub(crate) fn observe_view(&mut self, header: &Header, output: &mut ReplicaOutput) {
        if header.view > self.view && self.config.is_active(header.replica) {
            self.request_start_view(header.view, output);
        }
    }

    pub(crate) fn note_primary_liveness(&mut self) {
        if !self.standby
            && !self.is_primary()
            && self.status == ReplicaStatus::Normal
            && self.timeouts.view_change.ticking()
        {
            self.timeouts.view_change.reset();
        }
    }

    // ========================================================================
    // Request admission (primary)
    // ========================================================================

    pub(crate) fn on_request(&mut self, request: Message, output: &mut ReplicaOutput) {
        let header = *request.header();

        if self.standby || !self.is_primary() || self.status != ReplicaStatus::Normal {
            // Clients find the primary by retrying against the
            // cluster; a non-primary stays silent.
            return;
        }
        if self.abdicating || self.sync.is_some() {
            return;
        }
        if header.client.is_none() {
            tracing::warn!("request without client id dropped");
            return;
        }
        if header.operation != Operation::REGISTER && !header.operation.is_application() {
            tracing::warn!(operation = %header.operation, "request with reserved operation dropped");
            return;
        }
        if header.release < corundum_types::constants::RELEASE_CLIENT_MIN {
            tracing::warn!(release = %header.release, "request from unsupported client release dropped");
            return;
        }

        match self.sessions.get(header.client) {
            None => {
                if header.operation == Operation::REGISTER {
                    if !self.pipeline.push_request(request) {
                        tracing::debug!(client = %header.client, "request queue full, dropping");
                    }
                } else {
                    // Unknown or evicted session: tell the client to
                    // register again.
                    let mut reply = self.base_header(Command::Reply);
                    reply.client = header.client;
                    reply.request = header.request;
                    reply.operation = Operation::REGISTER;
                    output.send(Recipient::Client(header.client), self.message(reply));
                }
            }
            Some(session) => {
                let session = *session;
                if header.request == session.request
                    || (header.operation == Operation::REGISTER && session.request.as_u64() == 0)
                {
                    // Duplicate of the latest committed request: serve
                    // the cached reply.
                    self.replay_reply(&header, session.slot, session.reply_checksum, output);
                } else if header.request < session.request {
                    tracing::debug!(client = %header.client, "stale request dropped");
                } else if header.request == session.request.next() {
                    if !self.pipeline.push_request(request) {
                        tracing::debug!(client = %header.client, "request queue full, dropping");
                    }
                } else {
                    // More than one ahead: the client broke the
                    // one-in-flight discipline.
                    tracing::warn!(
                        client = %header.client,
                        request = %header.request,
                        committed = %session.request,
                        "request number gap dropped"
                    );
                }
            }
        }

        self.process_request_queue(output);
    }

    /// Serves a duplicate request from the reply cache; a corrupt slot
    /// is repaired from a backup first.
    fn replay_reply(
        &mut self,
        request: &Header,
        slot: u32,
        reply_checksum: corundum_types::Checksum,
        output: &mut ReplicaOutput,
    ) {
        match ClientReplies::read_reply_if(
            &mut self.storage,
            self.config.cluster(),
            slot as usize,
            reply_checksum,
        ) {
            ReplyRead::Ok(reply) => output.send(Recipient::Client(request.client), reply),
            ReplyRead::Missing => {
                tracing::warn!(client = %request.client, "reply slot corrupt, repairing from peers");
                let mut req = self.base_header(Command::RequestReply);
                req.client = request.client;
                req.request = request.request;
                req.parent = reply_checksum;
                let message = self.message(req);
                if let Some(peer) = self.next_repair_peer() {
                    output.send_replica(peer, message);
                }
            }
        }
    }

    /// Drains the request queue into the pipeline while bounds allow.
    /// While an upgrade is pending, upgrade prepares take priority and
    /// client requests wait.
    pub(crate) fn process_request_queue(&mut self, output: &mut ReplicaOutput) {
        loop {
            if self.pipeline.prepare_queue_full() {
                return;
            }
            // WAL slack: never prepare past what the current
            // checkpoint allows, or the next checkpoint's prepares
            // would overwrite this one's.
            if self.op_head.next() > self.prepare_max() {
                return;
            }

            if let Some(target) = self.upgrade.target() {
                if target > self.release {
                    let upgrade_body = body::encode(&body::UpgradeBody { release: target });
                    self.primary_prepare(Operation::UPGRADE, None, upgrade_body, output);
                    continue;
                }
            }

            let Some(request) = self.pipeline.pop_request() else {
                return;
            };
            let body_bytes = request.body().to_vec();
            self.primary_prepare(
                request.header().operation,
                Some(*request.header()),
                body_bytes,
                output,
            );
        }
    }

    /// Logs and broadcasts the next prepare.
    fn primary_prepare(
        &mut self,
        operation: Operation,
        request: Option<Header>,
        body_bytes: Vec<u8>,
        output: &mut ReplicaOutput,
    ) {
        debug_assert!(self.is_primary() && self.status == ReplicaStatus::Normal);

        let op = self.op_head.next();
        let parent = self
            .journal
            .checksum_for_op(self.op_head)
            .unwrap_or(self.commit_parent);
        self.timestamp = self
            .timestamp
            .advance_to(Timestamp::from_nanos(self.timestamp.as_nanos() + 1));

        let mut header = self.base_header(Command::Prepare);
        header.op = op;
        header.parent = parent;
        header.operation = operation;
        header.timestamp = self.timestamp;
        if let Some(request) = request {
            header.client = request.client;
            header.request = request.request;
        }
        let prepare = self.message_with_body(header, body_bytes);

        match Wal::write_prepare(&mut self.storage, &prepare) {
            Ok(()) => self.journal.set_header_clean(*prepare.header()),
            Err(fault) => {
                // The primary's own copy is repairable from backups
                // once they ack; the header is still authoritative.
                tracing::warn!(%fault, op = %op, "primary WAL write fault");
                self.journal.set_header_dirty(*prepare.header());
            }
        }

        self.op_head = op;
        self.pipeline.push_prepare(prepare.clone(), self.replica_id);
        output.broadcast(prepare);
        self.timeouts.prepare.reset();

        self.try_commit_pipeline(output);
    }

    // ========================================================================
    // Prepare (backup)
    // ========================================================================

    pub(crate) fn on_prepare(&mut self, prepare: Message, output: &mut ReplicaOutput) {
        let header = *prepare.header();

        // Repair responses arrive as plain prepares, possibly from old
        // views and from peers other than the current primary. They
        // fill holes the journal already vouches for and bypass the
        // normal-path guards below.
        if self.try_repair_fill(&prepare, output) {
            return;
        }

        match self.status {
            ReplicaStatus::Normal => {}
            // A torn-head replica may only learn state via start_view.
            ReplicaStatus::RecoveringHead
            | ReplicaStatus::Recovering
            | ReplicaStatus::ViewChange => {
                self.observe_view(&header, output);
                return;
            }
        }
        if header.view > self.view {
            self.request_start_view(header.view, output);
            return;
        }
        if header.view < self.view || header.replica != self.primary() {
            return;
        }
        self.note_primary_liveness();

        if header.op > self.prepare_max() {
            // Accepting would overwrite prepares of the current
            // checkpoint; this replica is too far behind to follow.
            self.advance_commit_max(header.commit.as_op_number());
            self.maybe_start_sync(output);
            return;
        }

        if header.op <= self.op_head {
            match self.journal.checksum_for_op(header.op) {
                Some(checksum) if checksum == header.checksum => {
                    // Duplicate (our ack was lost): re-ack. The body is
                    // intact — a dirty body was taken by the repair
                    // path above.
                    self.send_prepare_ok(&header, output);
                }
                Some(_) => {
                    // Same op, same view, different content: the
                    // invariant "one prepare per (op, log_view)" is
                    // broken. Halt before diverging.
                    assert!(
                        header.view != self.log_view,
                        "two prepares for {} in {}",
                        header.op,
                        header.view
                    );
                }
                None => {
                    // A hole behind the head (lost earlier): take it.
                    self.accept_prepare(&prepare, output);
                }
            }
        } else if header.op == self.op_head.next() {
            if let Some(expected_parent) = self.journal.checksum_for_op(self.op_head) {
                assert_eq!(
                    header.parent, expected_parent,
                    "prepare {} does not chain onto local head",
                    header.op
                );
            }
            self.accept_prepare(&prepare, output);
            self.op_head = header.op;
        } else {
            // Gap: accept the prepare (it is self-contained) and let
            // repair fill the hole; its parent pins the hole content.
            tracing::debug!(
                replica = %self.replica_id,
                expected = %self.op_head.next(),
                got = %header.op,
                "gap in prepare sequence, repairing"
            );
            self.accept_prepare(&prepare, output);
            self.op_head = header.op;
        }

        self.advance_commit_max(header.commit.as_op_number());
        self.commit_journal(output);
    }

    fn accept_prepare(&mut self, prepare: &Message, output: &mut ReplicaOutput) {
        let header = *prepare.header();
        match Wal::write_prepare(&mut self.storage, prepare) {
            Ok(()) => {
                self.journal.set_header_clean(header);
                self.send_prepare_ok(&header, output);
            }
            Err(fault) => {
                // Not durable: no ack. The header is known, the body
                // will be repaired.
                tracing::warn!(%fault, op = %header.op, "backup WAL write fault");
                self.journal.set_header_dirty(header);
            }
        }
    }

    pub(crate) fn send_prepare_ok(&mut self, prepare: &Header, output: &mut ReplicaOutput) {
        let mut ok = self.base_header(Command::PrepareOk);
        ok.op = prepare.op;
        ok.parent = prepare.checksum;
        output.send_replica(self.primary(), self.message(ok));
    }

    // ========================================================================
    // PrepareOk (primary)
    // ========================================================================

    pub(crate) fn on_prepare_ok(&mut self, header: &Header, output: &mut ReplicaOutput) {
        if !self.is_primary() || self.status != ReplicaStatus::Normal {
            return;
        }
        if header.view != self.view {
            return;
        }
        // Standby acks signal liveness but never count toward quorum.
        if !self.config.is_active(header.replica) {
            return;
        }

        self.abdicating = false;
        self.timeouts.primary_abdicate.reset();
        self.pipeline.record_ok(header.op, header.replica);
        self.try_commit_pipeline(output);
    }

    /// Commits pipeline prepares in FIFO order as they reach quorum.
    pub(crate) fn try_commit_pipeline(&mut self, output: &mut ReplicaOutput) {
        let mut committed = false;
        while let Some(head) = self.pipeline.head() {
            if head.op() <= self.commit_min {
                // Already committed through the journal path.
                self.pipeline.pop_head();
                continue;
            }
            if head.ok_from.len() < self.config.quorum() {
                break;
            }
            let pending = self.pipeline.pop_head().unwrap();
            self.commit_prepare(&pending.message, output);
            committed = true;
            if output.exit.is_some() {
                return;
            }
        }
        if committed {
            self.broadcast_commit(output);
            self.process_request_queue(output);
        }
    }

    /// Advertises `commit_max` to everyone (heartbeat and post-commit).
    pub(crate) fn broadcast_commit(&mut self, output: &mut ReplicaOutput) {
        let mut header = self.base_header(Command::Commit);
        header.op = self.op_head;
        output.broadcast(self.message(header));
    }

    // ========================================================================
    // Commit (backup)
    // ========================================================================

    pub(crate) fn on_commit(&mut self, header: &Header, output: &mut ReplicaOutput) {
        if self.status != ReplicaStatus::Normal {
            self.observe_view(header, output);
            return;
        }
        if header.view > self.view {
            self.request_start_view(header.view, output);
            return;
        }
        if header.view < self.view || header.replica != self.primary() {
            return;
        }
        self.note_primary_liveness();

        self.advance_commit_max(header.commit.as_op_number());
        self.maybe_start_sync(output);
        self.commit_journal(output);
    }

    // ========================================================================
    // Forwarded replies (reply-cache repair)
    // ========================================================================

    /// A peer answered our `request_reply` with the cached reply:
    /// re-persist it and deliver to the client.
    pub(crate) fn on_reply_forwarded(&mut self, reply: &Message, output: &mut ReplicaOutput) {
        let header = reply.header();
        let Some(session) = self.sessions.get(header.client).copied() else {
            return;
        };
        if session.reply_checksum != header.checksum {
            return;
        }
        if let Err(fault) =
            ClientReplies::write_reply(&mut self.storage, session.slot as usize, reply)
        {
            tracing::warn!(%fault, "reply cache repair write fault");
            return;
        }
        if self.is_primary() && self.status == ReplicaStatus::Normal {
            output.send(Recipient::Client(header.client), reply.clone());
        }
    }
}
