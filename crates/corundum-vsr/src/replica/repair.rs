//! Repair.
//!
//! Everything durable is content-addressed, so repair is always "name
//! the content, take it from whoever has it":
//!
//! - WAL bodies: `request_prepare(op, checksum)` → the stored prepare
//! - WAL headers: `request_headers(range)` → `headers`
//! - replies: `request_reply(client, request)` → the cached reply
//! - grid blocks: `request_block(address, checksum)` → `block`
//!
//! Serving is safe in any status — a peer that is itself recovering
//! can still hand out content that validates. Requesting is driven by
//! the repair timeout and bounded per round so repair never starves
//! production traffic.

use corundum_io::Storage;
use corundum_storage::{ClientReplies, PrepareRead, ReplyRead, ScrubResult, Wal};
use corundum_types::{Checksum, OpNumber, ReplicaId, ReplicaStatus};
use corundum_wire::{body, encode_headers, Command, Header, Message};

use super::{Replica, ReplicaOutput};
use crate::StateMachine;

/// Repair requests issued per repair round.
const REPAIR_REQUESTS_PER_ROUND: usize = 4;

impl<S: Storage, M: StateMachine> Replica<S, M> {
    // ========================================================================
    // Repair driving (repair timeout)
    // ========================================================================

    pub(crate) fn on_repair_timeout(&mut self, output: &mut ReplicaOutput) {
        if self.sync.is_some() {
            // A stalled sync request is re-sent until the checkpoint
            // arrives; everything else waits behind the install.
            self.send_request_sync_checkpoint(output);
            return;
        }
        match self.status {
            ReplicaStatus::Normal => self.repair_journal(output),
            ReplicaStatus::ViewChange => {
                if self.vc_target_commit.is_some() {
                    self.maybe_complete_view_change(output);
                }
            }
            ReplicaStatus::RecoveringHead => self.repair_recovering_head(output),
            ReplicaStatus::Recovering => {}
        }
        self.repair_grid(output);
    }

    /// Requests bodies (and headers) for holes in
    /// `(commit_min, op_head]`, and headers for the range the cluster
    /// has committed past our head.
    fn repair_journal(&mut self, output: &mut ReplicaOutput) {
        if self.op_head < self.commit_max {
            // The cluster committed ops we never received (we were
            // down or cut off). Learn their headers first; bodies
            // follow through the hole repair below.
            let op_max = self.commit_max.min(self.prepare_max());
            self.send_request_headers(self.op_head.next(), op_max, output);
        }

        let mut sent = 0;
        let holes: Vec<OpNumber> = self
            .journal
            .repair_candidates(self.commit_min.next(), self.op_head)
            .take(REPAIR_REQUESTS_PER_ROUND)
            .collect();
        for op in holes {
            match self.journal.checksum_for_op(op) {
                Some(checksum) => self.send_request_prepare(op, checksum, output),
                None => {
                    // No header: the successor's parent pins the
                    // content; without one, ask for headers first.
                    if let Some(next) = self.journal.header_for_op(op.next()) {
                        let checksum = next.parent;
                        self.send_request_prepare(op, checksum, output);
                    } else {
                        self.send_request_headers(self.commit_min.next(), self.op_head, output);
                    }
                }
            }
            sent += 1;
            if sent >= REPAIR_REQUESTS_PER_ROUND {
                break;
            }
        }
    }

    /// A torn-head replica learns the head from the primary; on a
    /// single-replica cluster the standby's headers play that role.
    fn repair_recovering_head(&mut self, output: &mut ReplicaOutput) {
        if self.config.replica_count() == 1 {
            self.send_request_headers(self.commit_min.next(), self.prepare_max(), output);
            self.repair_journal_holes_as_recovering(output);
        } else {
            self.request_start_view(self.view, output);
        }
    }

    fn repair_journal_holes_as_recovering(&mut self, output: &mut ReplicaOutput) {
        let holes: Vec<(OpNumber, Checksum)> = self
            .journal
            .repair_candidates(self.commit_min.next(), self.op_head)
            .filter_map(|op| self.journal.checksum_for_op(op).map(|c| (op, c)))
            .take(REPAIR_REQUESTS_PER_ROUND)
            .collect();
        for (op, checksum) in holes {
            self.send_request_prepare(op, checksum, output);
        }
        self.maybe_finish_recovering_head(output);
    }

    /// On a single-replica cluster, `recovering_head` ends once every
    /// known op has an intact body again.
    pub(crate) fn maybe_finish_recovering_head(&mut self, output: &mut ReplicaOutput) {
        if self.status != ReplicaStatus::RecoveringHead || self.config.replica_count() != 1 {
            return;
        }
        let holes = self
            .journal
            .repair_candidates(self.commit_min.next(), self.op_head)
            .count();
        if holes == 0 {
            tracing::info!(replica = %self.replica_id, op_head = %self.op_head, "head recovered");
            self.status = ReplicaStatus::Normal;
            self.log_view = self.view;
            self.reset_role_timeouts();
            self.advance_commit_max(self.op_head);
            self.commit_journal(output);
        }
    }

    /// Requests the next faulty grid block from a peer.
    fn repair_grid(&mut self, output: &mut ReplicaOutput) {
        let Some(block) = self.scrubber.next_repair(&self.grid) else {
            return;
        };
        let request = body::RequestBlockBody {
            address: block.address.as_u64(),
            checksum: block.checksum,
        };
        let header = self.base_header(Command::RequestBlock);
        let message = self.message_with_body(header, body::encode(&request));
        if let Some(peer) = self.next_repair_peer() {
            output.send_replica(peer, message);
        }
    }

    // ========================================================================
    // Request senders
    // ========================================================================

    pub(crate) fn send_request_prepare(
        &mut self,
        op: OpNumber,
        checksum: Checksum,
        output: &mut ReplicaOutput,
    ) {
        let request = body::RequestPrepareBody { op, checksum };
        let mut header = self.base_header(Command::RequestPrepare);
        header.op = op;
        let message = self.message_with_body(header, body::encode(&request));
        if let Some(peer) = self.next_repair_peer() {
            output.send_replica(peer, message);
        }
    }

    /// Headers are only ever requested from the view's primary — its
    /// log is the one place a header for a committed height is
    /// guaranteed canonical. (On a single-replica cluster the standby
    /// serves instead: its headers all came from this replica.)
    pub(crate) fn send_request_headers(
        &mut self,
        op_min: OpNumber,
        op_max: OpNumber,
        output: &mut ReplicaOutput,
    ) {
        let target = if self.config.replica_count() == 1 {
            self.next_repair_peer()
        } else if self.primary() != self.replica_id {
            Some(self.primary())
        } else {
            None
        };
        let Some(target) = target else { return };
        let request = body::RequestHeadersBody { op_min, op_max };
        let header = self.base_header(Command::RequestHeaders);
        let message = self.message_with_body(header, body::encode(&request));
        output.send_replica(target, message);
    }

    /// Round-robin over the other cluster members (standbys included —
    /// they hold repair content too).
    pub(crate) fn next_repair_peer(&mut self) -> Option<ReplicaId> {
        let members = self.config.member_count();
        if members <= 1 {
            return None;
        }
        for _ in 0..members {
            self.repair_round_robin = (self.repair_round_robin + 1) % members;
            if self.repair_round_robin != self.replica_id.as_u8() {
                return Some(ReplicaId::new(self.repair_round_robin));
            }
        }
        None
    }

    // ========================================================================
    // Repair fills (incoming prepares that answer our requests)
    // ========================================================================

    /// Accepts a prepare that fills a hole the journal vouches for.
    /// Returns true when the message was consumed as a repair.
    pub(crate) fn try_repair_fill(
        &mut self,
        prepare: &Message,
        output: &mut ReplicaOutput,
    ) -> bool {
        let header = *prepare.header();
        if header.op > self.op_head || header.op <= self.op_checkpoint() {
            return false;
        }

        match self.journal.checksum_for_op(header.op) {
            Some(checksum) if checksum == header.checksum => {
                if self.journal.has_prepare(header.op) {
                    return false; // Nothing to repair; normal path decides.
                }
                if Wal::write_prepare(&mut self.storage, prepare).is_ok() {
                    self.journal.set_header_clean(header);
                    tracing::debug!(replica = %self.replica_id, op = %header.op, "repaired prepare body");
                    self.ack_repaired(&header, output);
                    self.after_repair(output);
                }
                true
            }
            Some(_) => false,
            None => {
                // No header for this op: only accept content pinned by
                // the successor's hash chain.
                let Some(next) = self.journal.header_for_op(header.op.next()) else {
                    return false;
                };
                if next.parent != header.checksum {
                    return false;
                }
                if Wal::write_prepare(&mut self.storage, prepare).is_ok() {
                    self.journal.set_header_clean(header);
                    tracing::debug!(replica = %self.replica_id, op = %header.op, "repaired missing prepare");
                    self.ack_repaired(&header, output);
                    self.after_repair(output);
                }
                true
            }
        }
    }

    /// A freshly repaired prepare may be one the current primary is
    /// still counting acks for — re-ack it so repair never starves the
    /// pipeline.
    fn ack_repaired(&mut self, header: &Header, output: &mut ReplicaOutput) {
        if self.status == ReplicaStatus::Normal && !self.is_primary() {
            self.send_prepare_ok(header, output);
        }
    }

    fn after_repair(&mut self, output: &mut ReplicaOutput) {
        match self.status {
            ReplicaStatus::Normal => self.commit_journal(output),
            ReplicaStatus::ViewChange => self.maybe_complete_view_change(output),
            ReplicaStatus::RecoveringHead => self.maybe_finish_recovering_head(output),
            ReplicaStatus::Recovering => {}
        }
    }

    // ========================================================================
    // Serving peers
    // ========================================================================

    pub(crate) fn on_request_prepare(&mut self, message: &Message, output: &mut ReplicaOutput) {
        let Ok(request) = body::decode::<body::RequestPrepareBody>(message.body()) else {
            return;
        };
        let Some(header) = self.journal.header_for_op(request.op).copied() else {
            return;
        };
        if !request.checksum.is_zero() && header.checksum != request.checksum {
            return;
        }
        if !self.journal.has_prepare(request.op) {
            return;
        }
        match Wal::read_prepare_if(
            &mut self.storage,
            self.config.cluster(),
            request.op.slot(),
            header.checksum,
        ) {
            PrepareRead::Ok(prepare) => {
                output.send_replica(message.header().replica, prepare);
            }
            PrepareRead::Missing => {
                // The journal was wrong about the media; reclassify so
                // our own repair picks it up.
                self.journal.set_header_dirty(header);
            }
        }
    }

    pub(crate) fn on_request_headers(&mut self, message: &Message, output: &mut ReplicaOutput) {
        let Ok(request) = body::decode::<body::RequestHeadersBody>(message.body()) else {
            return;
        };
        // Serve only when this log is authoritative: normal status in a
        // view at least as new as the requester's. A stale log could
        // hand out dead-view entries at heights the cluster has since
        // committed differently.
        if self.status != ReplicaStatus::Normal
            || self.log_view != self.view
            || self.view < message.header().view
        {
            return;
        }
        let headers = self
            .journal
            .headers_in_range(request.op_min, request.op_max.min(self.op_head));
        if headers.is_empty() {
            return;
        }
        let response = body::HeadersBody {
            headers: encode_headers(&headers),
        };
        let header = self.base_header(Command::Headers);
        output.send_replica(
            message.header().replica,
            self.message_with_body(header, body::encode(&response)),
        );
    }

    pub(crate) fn on_headers(&mut self, message: &Message, output: &mut ReplicaOutput) {
        let Ok(response) = body::decode::<body::HeadersBody>(message.body()) else {
            return;
        };
        let Some(headers) = corundum_wire::decode_headers(&response.headers) else {
            return;
        };

        for header in &headers {
            if header.op <= self.commit_min {
                continue; // The committed prefix is settled.
            }
            if self.journal.checksum_for_op(header.op) == Some(header.checksum) {
                continue; // Already have it.
            }
            // Adopt (or replace a stale entry with) a header only when
            // it chains with something we already trust; free-floating
            // headers wait for start_view.
            let pinned_by_next = self
                .journal
                .header_for_op(header.op.next())
                .is_some_and(|next| next.parent == header.checksum);
            let pins_prev = header.op.as_u64() > 1
                && self
                    .journal
                    .header_for_op(header.op.prev())
                    .is_some_and(|prev| prev.checksum == header.parent);
            let chains_to_anchor =
                header.op == self.commit_min.next() && header.parent == self.commit_parent;
            let extends_head_on_sole_replica = self.config.replica_count() == 1
                && self.status == ReplicaStatus::RecoveringHead
                && header.op > self.op_head
                && (header.op == self.op_head.next() || self.journal.has_header(header.op.prev()));

            if pinned_by_next || pins_prev || chains_to_anchor || extends_head_on_sole_replica {
                let _ = Wal::repair_header(&mut self.storage, header);
                self.journal.set_header_dirty(*header);
                if header.op > self.op_head {
                    self.op_head = header.op;
                }
            }
        }

        self.after_repair(output);
        if self.status == ReplicaStatus::Normal {
            self.repair_journal(output);
        }
    }

    // ========================================================================
    // Reply repair
    // ========================================================================

    pub(crate) fn on_request_reply(&mut self, header: &Header, output: &mut ReplicaOutput) {
        let Some(session) = self.sessions.get(header.client).copied() else {
            return;
        };
        if session.reply_checksum != header.parent {
            return;
        }
        match ClientReplies::read_reply_if(
            &mut self.storage,
            self.config.cluster(),
            session.slot as usize,
            session.reply_checksum,
        ) {
            ReplyRead::Ok(reply) => output.send_replica(header.replica, reply),
            ReplyRead::Missing => {}
        }
    }

    // ========================================================================
    // Grid block repair
    // ========================================================================

    pub(crate) fn on_request_block(&mut self, message: &Message, output: &mut ReplicaOutput) {
        let Ok(request) = body::decode::<body::RequestBlockBody>(message.body()) else {
            return;
        };
        let address = corundum_types::GridAddress::new(request.address);
        // Content addressing: serve if and only if our copy hashes to
        // the requested checksum.
        let Ok(payload) = self
            .grid
            .read_block_expect(&mut self.storage, address, request.checksum)
        else {
            return;
        };
        let response = body::BlockBody {
            address: request.address,
            checksum: request.checksum,
            payload: payload.to_vec(),
        };
        let header = self.base_header(Command::Block);
        output.send_replica(
            message.header().replica,
            self.message_with_body(header, body::encode(&response)),
        );
    }

    pub(crate) fn on_block(&mut self, message: &Message, _output: &mut ReplicaOutput) {
        let Ok(block) = body::decode::<body::BlockBody>(message.body()) else {
            return;
        };
        let address = corundum_types::GridAddress::new(block.address);
        if self.grid.lookup(address) != Some(block.checksum) {
            return; // Stale response; the block was released.
        }
        if self.grid.read_block(&mut self.storage, address).is_ok() {
            self.scrubber.mark_repaired(address);
            return; // Already intact.
        }
        match self
            .grid
            .repair_block(&mut self.storage, address, &block.payload)
        {
            Ok(()) => {
                tracing::info!(replica = %self.replica_id, %address, "grid block repaired from peer");
                self.scrubber.mark_repaired(address);
            }
            Err(error) => {
                tracing::warn!(%address, %error, "grid block repair rejected");
            }
        }
    }

    // ========================================================================
    // Scrubbing (scrub timeout)
    // ========================================================================

    pub(crate) fn on_scrub_timeout(&mut self, _output: &mut ReplicaOutput) {
        match self.scrubber.step(&mut self.storage, &self.grid) {
            ScrubResult::Clean { .. } | ScrubResult::TourComplete => {}
            ScrubResult::Corrupt { addresses } => {
                tracing::warn!(
                    replica = %self.replica_id,
                    count = addresses.len(),
                    "scrub step found corrupt blocks"
                );
            }
        }
    }
}
