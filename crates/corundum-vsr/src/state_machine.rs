//! The seam to the application state machine.
//!
//! The replication core treats the application (the LSM forest, in
//! production) as an opaque deterministic sink. The contract is
//! narrow: apply committed operations in op order, checkpoint
//! atomically into the grid, and serialize/restore checkpoint state
//! for peers that must state-sync.
//!
//! [`HashStateMachine`] is the deterministic implementation used by
//! the simulator and the test suites: its state is a running digest of
//! everything applied, so two replicas agree exactly when their
//! histories agree.

use bytes::Bytes;
use corundum_crypto::checksum_pair;
use corundum_io::Storage;
use corundum_storage::{Grid, GridError};
use corundum_types::{Checksum, GridAddress, OpNumber, Timestamp};
use corundum_wire::Operation;
use serde::{Deserialize, Serialize};

/// The application contract.
///
/// All methods are called from the replica's event loop, in op order,
/// exactly once per committed op. Determinism is a hard requirement:
/// identical histories must produce identical replies, checkpoint
/// payloads, and grid contents.
pub trait StateMachine {
    /// Warms caches for an operation about to commit; may read grid
    /// blocks.
    fn prefetch<S: Storage>(
        &mut self,
        storage: &mut S,
        grid: &Grid,
        operation: Operation,
        body: &[u8],
    );

    /// Applies a committed operation and returns the reply body.
    fn commit(
        &mut self,
        op: OpNumber,
        timestamp: Timestamp,
        operation: Operation,
        body: &[u8],
    ) -> Bytes;

    /// Durably flushes state into the grid. Blocks no longer
    /// referenced must be released (`Grid::release`); reclamation
    /// happens when the checkpoint installs.
    fn checkpoint<S: Storage>(&mut self, storage: &mut S, grid: &mut Grid)
        -> Result<(), GridError>;

    /// Serialized checkpoint state for state sync, captured at the
    /// moment `checkpoint` returns.
    fn checkpoint_payload(&self) -> Vec<u8>;

    /// Installs a peer's checkpoint payload, replacing local state.
    fn install_checkpoint(&mut self, payload: &[u8]);
}

// ============================================================================
// Deterministic test state machine
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HashState {
    digest: Checksum,
    applied: u64,
    /// Grid block holding the state as of the last checkpoint.
    block: Option<(u64, Checksum)>,
}

/// A state machine whose state is a running digest of applied ops.
///
/// `commit` folds `(op, timestamp, operation, body)` into the digest
/// and echoes the digest plus the request body back as the reply.
/// `checkpoint` writes the serialized state into one grid block and
/// releases the previous one, exercising block allocation, the free
/// set, and scrub/repair end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashStateMachine {
    state: HashState,
}

impl HashStateMachine {
    pub fn new() -> Self {
        Self {
            state: HashState {
                digest: Checksum::ZERO,
                applied: 0,
                block: None,
            },
        }
    }

    /// The current state digest (test observability).
    pub fn digest(&self) -> Checksum {
        self.state.digest
    }

    pub fn applied(&self) -> u64 {
        self.state.applied
    }

    /// The grid block holding the last checkpoint, if any.
    pub fn checkpoint_block(&self) -> Option<GridAddress> {
        self.state.block.map(|(address, _)| GridAddress::new(address))
    }
}

impl Default for HashStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for HashStateMachine {
    fn prefetch<S: Storage>(
        &mut self,
        storage: &mut S,
        grid: &Grid,
        _operation: Operation,
        _body: &[u8],
    ) {
        // Touch the checkpoint block, mirroring a forest reading its
        // tables. A fault here is repaired by the grid/scrubber path,
        // never surfaced to commit.
        if let Some((address, _)) = self.state.block {
            let _ = grid.read_block(storage, GridAddress::new(address));
        }
    }

    fn commit(
        &mut self,
        op: OpNumber,
        timestamp: Timestamp,
        operation: Operation,
        body: &[u8],
    ) -> Bytes {
        let mut seed = Vec::with_capacity(24 + body.len());
        seed.extend_from_slice(&op.as_u64().to_le_bytes());
        seed.extend_from_slice(&timestamp.as_nanos().to_le_bytes());
        seed.push(operation.as_u8());
        seed.extend_from_slice(body);
        self.state.digest = checksum_pair(&self.state.digest.to_le_bytes(), &seed);
        self.state.applied += 1;

        let mut reply = Vec::with_capacity(16 + body.len());
        reply.extend_from_slice(&self.state.digest.to_le_bytes());
        reply.extend_from_slice(body);
        Bytes::from(reply)
    }

    fn checkpoint<S: Storage>(
        &mut self,
        storage: &mut S,
        grid: &mut Grid,
    ) -> Result<(), GridError> {
        let previous = self.state.block.take();
        let payload =
            postcard::to_allocvec(&self.state).expect("hash state is always serializable");
        let id = grid.write_block(storage, &payload)?;
        self.state.block = Some((id.address.as_u64(), id.checksum));
        if let Some((address, _)) = previous {
            grid.release(GridAddress::new(address));
        }
        Ok(())
    }

    fn checkpoint_payload(&self) -> Vec<u8> {
        postcard::to_allocvec(&self.state).expect("hash state is always serializable")
    }

    fn install_checkpoint(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            // A freshly formatted replica has no checkpoint yet.
            *self = Self::new();
            return;
        }
        self.state = postcard::from_bytes(payload).expect("peer checkpoint payload is valid");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_histories_yield_identical_digests() {
        let mut a = HashStateMachine::new();
        let mut b = HashStateMachine::new();
        for op in 1..=10u64 {
            let body = op.to_le_bytes();
            let ra = a.commit(
                OpNumber::new(op),
                Timestamp::from_nanos(op),
                Operation::new(16),
                &body,
            );
            let rb = b.commit(
                OpNumber::new(op),
                Timestamp::from_nanos(op),
                Operation::new(16),
                &body,
            );
            assert_eq!(ra, rb, "replies must be byte-identical");
        }
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn histories_diverge_on_any_difference() {
        let mut a = HashStateMachine::new();
        let mut b = HashStateMachine::new();
        a.commit(OpNumber::new(1), Timestamp::from_nanos(1), Operation::new(16), b"x");
        b.commit(OpNumber::new(1), Timestamp::from_nanos(1), Operation::new(16), b"y");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn checkpoint_payload_roundtrip() {
        let mut a = HashStateMachine::new();
        a.commit(OpNumber::new(1), Timestamp::from_nanos(1), Operation::new(16), b"x");

        let mut b = HashStateMachine::new();
        b.install_checkpoint(&a.checkpoint_payload());
        assert_eq!(a, b);
    }
}
