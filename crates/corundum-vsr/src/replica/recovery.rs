//! Open-time recovery.
//!
//! After the superblock opens, the WAL scan classifies every slot and
//! the journal is rebuilt from it. The replica then decides its
//! starting status:
//!
//! - head intact, `log_view == view` → `normal` (view preserved)
//! - head torn → `recovering_head`: the replica learns the
//!   authoritative head from the primary's `start_view` before it may
//!   ack, nack, or vote — it only failed to persist, and must not
//!   retract ops it may have acked
//! - `log_view < view` → the crash interrupted a view change; rejoin
//!   it
//! - single-replica cluster with unrepairable slots and no standbys →
//!   the process exits (there is no peer that could supply the data)

use corundum_storage::{RecoveredSlot, Wal};
use corundum_types::{OpNumber, ReplicaStatus};

use super::{OpenError, Replica};
use crate::StateMachine;
use corundum_io::Storage;

impl<S: Storage, M: StateMachine> Replica<S, M> {
    /// Rebuilds the journal from the WAL scan and picks the starting
    /// status. Called once from `open`.
    pub(crate) fn recover_journal(&mut self) -> Result<(), OpenError> {
        let slots = Wal::recover(&mut self.storage, self.config.cluster());

        for (slot, recovered) in slots.into_iter().enumerate() {
            match recovered {
                RecoveredSlot::Empty => {}
                RecoveredSlot::Intact(header) => self.journal.set_header_clean(header),
                RecoveredSlot::Torn(header) => self.journal.set_header_dirty(header),
                RecoveredSlot::Recovered(header) => {
                    // Header cell lost but the body is whole: rewrite
                    // the header locally and the slot is intact again.
                    if Wal::repair_header(&mut self.storage, &header).is_ok() {
                        self.journal.set_header_clean(header);
                    } else {
                        self.journal.set_header_dirty(header);
                    }
                }
                RecoveredSlot::Faulty => self.journal.set_faulty(slot),
            }
        }

        self.op_head = self.journal.op_head(self.commit_min);

        let head_torn = self.op_head > self.commit_min && !self.journal.has_prepare(self.op_head);
        let holes: Vec<OpNumber> = self
            .journal
            .repair_candidates(self.commit_min.next(), self.op_head)
            .collect();

        if self.config.replica_count() == 1 && self.config.standby_count() == 0 {
            if !holes.is_empty() {
                // No peer can ever supply these bodies.
                tracing::error!(
                    replica = %self.replica_id,
                    missing = holes.len(),
                    "unrecoverable WAL corruption on a single-replica cluster"
                );
                return Err(OpenError::WalCorrupt);
            }
            self.status = ReplicaStatus::Normal;
            self.log_view = self.view;
            return Ok(());
        }

        self.status = if head_torn {
            tracing::warn!(
                replica = %self.replica_id,
                op_head = %self.op_head,
                "torn log head; recovering head from peers"
            );
            ReplicaStatus::RecoveringHead
        } else if self.log_view < self.view {
            // The crash interrupted a view change; rejoin it.
            ReplicaStatus::ViewChange
        } else {
            ReplicaStatus::Normal
        };

        if !holes.is_empty() {
            tracing::info!(
                replica = %self.replica_id,
                missing = holes.len(),
                "WAL holes will be repaired from peers"
            );
        }
        Ok(())
    }

    /// True while this replica must not contribute nacks or
    /// view-change votes: it may have acked ops it merely failed to
    /// persist, and a vote from it could retract them.
    pub(crate) fn votes_suppressed(&self) -> bool {
        self.standby || self.status == ReplicaStatus::RecoveringHead
    }
}
