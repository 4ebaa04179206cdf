//! State sync.
//!
//! A replica whose `commit_max` has moved beyond what its WAL can ever
//! repair (`prepare_max` for its checkpoint) cannot catch up op by op:
//! the cluster has already overwritten the slots it would need. It
//! must adopt a whole peer checkpoint instead:
//!
//! 1. Discover a target: the highest checkpoint on which `f + 1`
//!    peers agree (checkpoint ids travel in pongs).
//! 2. Fetch `sync_checkpoint` from any peer holding it.
//! 3. Install it: superblock, grid index, sessions, state root. The
//!    install never touches WAL slots above the target — prepares
//!    acked in a higher view than the checkpoint's must survive
//!    (truncation safety).
//! 4. Re-enter via `recovering_head`, learning the post-checkpoint
//!    head from the primary. Grid blocks are fetched lazily by the
//!    scrubber/repair path as reads demand them.
//!
//! A synced checkpoint may carry a release this binary does not
//! bundle: the install still completes (the data file is then owned by
//! the new release) and the process exits cleanly for the operator to
//! restart with the right binary.

use std::collections::HashMap;

use corundum_io::Storage;
use corundum_storage::SessionSnapshot;
use corundum_types::{Checksum, OpNumber, Release, ReplicaStatus};
use corundum_wire::{body, Command, Message};
use serde::{Deserialize, Serialize};

use super::{ExitReason, Replica, ReplicaOutput};
use crate::{ClientSessions, StateMachine};

/// An in-progress state sync.
#[derive(Debug, Clone)]
pub(crate) struct SyncState {
    pub target_op: OpNumber,
    pub target_id: Checksum,
}

/// The transferred checkpoint: the serialized checkpoint state and
/// free set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SyncCheckpointPayload {
    checkpoint_op: OpNumber,
    checkpoint_id: Checksum,
    commit_min_checksum: Checksum,
    release: Release,
    free_set: Vec<u8>,
    grid_index: Vec<(u64, Checksum)>,
    sessions: Vec<SessionSnapshot>,
    state_payload: Vec<u8>,
}

impl<S: Storage, M: StateMachine> Replica<S, M> {
    // ========================================================================
    // Trigger and target selection
    // ========================================================================

    /// Starts a sync if the cluster has provably outrun our WAL.
    pub(crate) fn maybe_start_sync(&mut self, output: &mut ReplicaOutput) {
        if self.sync.is_some() {
            return;
        }
        if self.commit_max <= self.prepare_max() {
            return; // WAL repair can still reach the cluster.
        }

        // f+1 agreement on the highest checkpoint id.
        let mut counts: HashMap<(OpNumber, Checksum), usize> = HashMap::new();
        for &(op, id) in self.peer_checkpoints.values() {
            *counts.entry((op, id)).or_default() += 1;
        }
        let target = counts
            .into_iter()
            .filter(|&((op, _), count)| {
                op > self.op_checkpoint() && count >= self.config.quorum_nack()
            })
            .max_by_key(|&((op, _), _)| op);
        let Some(((target_op, target_id), _)) = target else {
            return; // Not enough pong evidence yet; retry later.
        };

        self.begin_sync(target_op, target_id, output);
    }

    /// Locks onto a sync target and requests the checkpoint.
    pub(crate) fn begin_sync(
        &mut self,
        target_op: OpNumber,
        target_id: Checksum,
        output: &mut ReplicaOutput,
    ) {
        if self.sync.is_some() || target_op <= self.op_checkpoint() {
            return;
        }
        tracing::info!(
            replica = %self.replica_id,
            target = %target_op,
            id = %target_id,
            "state sync started"
        );
        self.sync = Some(SyncState {
            target_op,
            target_id,
        });
        self.pipeline.clear();
        self.send_request_sync_checkpoint(output);
    }

    pub(crate) fn send_request_sync_checkpoint(&mut self, output: &mut ReplicaOutput) {
        let Some(sync) = &self.sync else { return };
        let request = body::RequestSyncCheckpointBody {
            checkpoint_op: sync.target_op,
            checkpoint_id: sync.target_id,
        };
        // Prefer a peer that advertised exactly this checkpoint.
        let peer = self
            .peer_checkpoints
            .iter()
            .find(|(_, &(op, id))| op == sync.target_op && id == sync.target_id)
            .map(|(&peer, _)| peer)
            .or_else(|| self.next_repair_peer());
        let Some(peer) = peer else { return };
        let header = self.base_header(Command::RequestSyncCheckpoint);
        let message = self.message_with_body(header, body::encode(&request));
        output.send_replica(peer, message);
    }

    // ========================================================================
    // Serving
    // ========================================================================

    pub(crate) fn on_request_sync_checkpoint(
        &mut self,
        message: &Message,
        output: &mut ReplicaOutput,
    ) {
        let Ok(request) = body::decode::<body::RequestSyncCheckpointBody>(message.body()) else {
            return;
        };
        let image = self.superblock.working();
        if image.vsr_state.op_checkpoint != request.checkpoint_op
            || image.vsr_state.checkpoint_id != request.checkpoint_id
        {
            return; // We hold a different checkpoint; someone else serves.
        }

        let payload = SyncCheckpointPayload {
            checkpoint_op: image.vsr_state.op_checkpoint,
            checkpoint_id: image.vsr_state.checkpoint_id,
            commit_min_checksum: image.vsr_state.commit_min_checksum,
            release: image.release,
            free_set: image.free_set.clone(),
            grid_index: image.grid_index.clone(),
            sessions: image.sessions.clone(),
            state_payload: image.state_payload.clone(),
        };
        let encoded = postcard::to_allocvec(&payload).expect("sync payload is serializable");
        let header = self.base_header(Command::SyncCheckpoint);
        output.send_replica(
            message.header().replica,
            self.message_with_body(header, encoded),
        );
    }

    // ========================================================================
    // Installing
    // ========================================================================

    pub(crate) fn on_sync_checkpoint(&mut self, message: &Message, output: &mut ReplicaOutput) {
        let Some(sync) = self.sync.clone() else {
            return; // Unsolicited.
        };
        let Ok(payload) = postcard::from_bytes::<SyncCheckpointPayload>(message.body()) else {
            return;
        };
        if payload.checkpoint_op != sync.target_op || payload.checkpoint_id != sync.target_id {
            return;
        }
        let Some(grid) =
            corundum_storage::Grid::from_snapshot(&payload.free_set, &payload.grid_index)
        else {
            tracing::warn!("sync checkpoint with inconsistent grid snapshot rejected");
            return;
        };

        tracing::info!(
            replica = %self.replica_id,
            target = %sync.target_op,
            "installing synced checkpoint"
        );

        let old_checkpoint = self.op_checkpoint();
        self.grid = grid;
        self.sessions = ClientSessions::from_snapshot(&payload.sessions);
        self.state_machine.install_checkpoint(&payload.state_payload);
        self.scrubber.retain_live(&self.grid);

        // WAL: slots at or below the target are superseded by the
        // checkpoint. Slots above it are kept verbatim — they may hold
        // prepares acked in a view higher than the one that produced
        // this checkpoint, and truncating those could retract a commit.
        for slot in 0..corundum_types::constants::SLOT_COUNT {
            if let Some(header) = self.journal.header_in_slot(slot) {
                if header.op <= sync.target_op {
                    self.journal.clear_slot(slot);
                }
            }
        }

        self.commit_min = sync.target_op;
        self.commit_parent = payload.commit_min_checksum;
        self.advance_commit_max(sync.target_op);
        self.op_head = self.journal.op_head(self.commit_min);
        self.release = payload.release;

        let mut image = self.superblock.working().clone();
        image.release = payload.release;
        image.vsr_state.view = self.view;
        image.vsr_state.log_view = self.log_view;
        image.vsr_state.commit_min = sync.target_op;
        image.vsr_state.commit_min_checksum = payload.commit_min_checksum;
        image.vsr_state.op_checkpoint = sync.target_op;
        image.vsr_state.checkpoint_id = sync.target_id;
        image.vsr_state.sync_op_min = old_checkpoint.next();
        image.vsr_state.sync_op_max = sync.target_op;
        image.free_set = payload.free_set;
        image.grid_index = payload.grid_index;
        image.sessions = payload.sessions;
        image.state_payload = payload.state_payload;
        self.superblock
            .update(&mut self.storage, image)
            .expect("superblock sync install failed; halting to avoid divergence");

        self.sync = None;
        self.status = ReplicaStatus::RecoveringHead;
        self.reset_role_timeouts();

        if !self.upgrade.bundles(payload.release) {
            tracing::info!(
                required = %payload.release,
                "synced checkpoint requires a newer release; exiting for restart"
            );
            output.exit = Some(ExitReason::ReleaseMismatch {
                required: payload.release,
            });
            return;
        }

        // Learn the post-checkpoint head from the primary.
        self.request_start_view(self.view, output);
    }
}
