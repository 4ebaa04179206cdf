//! The primary's pipeline.
//!
//! Two bounded FIFOs: prepares in flight (uncommitted, awaiting
//! quorum) and client requests waiting for a pipeline slot. Both
//! bounds apply backpressure — an over-bound request is dropped and
//! the client retries idempotently by request number.

use std::collections::{HashSet, VecDeque};

use corundum_types::constants::{PIPELINE_PREPARE_QUEUE_MAX, PIPELINE_REQUEST_QUEUE_MAX};
use corundum_types::{OpNumber, ReplicaId};
use corundum_wire::Message;

/// One uncommitted prepare and its quorum progress.
#[derive(Debug, Clone)]
pub struct PendingPrepare {
    pub message: Message,
    /// Active replicas (including the primary) that persisted it.
    pub ok_from: HashSet<ReplicaId>,
}

impl PendingPrepare {
    pub fn op(&self) -> OpNumber {
        self.message.header().op
    }
}

/// The primary's in-flight state.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    prepares: VecDeque<PendingPrepare>,
    requests: VecDeque<Message>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepare_queue_full(&self) -> bool {
        self.prepares.len() >= PIPELINE_PREPARE_QUEUE_MAX
    }

    /// Queues a client request. Returns false (request dropped) when
    /// the request queue is at its bound.
    pub fn push_request(&mut self, request: Message) -> bool {
        if self.requests.len() >= PIPELINE_REQUEST_QUEUE_MAX {
            return false;
        }
        self.requests.push_back(request);
        true
    }

    pub fn pop_request(&mut self) -> Option<Message> {
        self.requests.pop_front()
    }

    pub fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Admits a prepare the primary just logged.
    pub fn push_prepare(&mut self, message: Message, primary: ReplicaId) {
        assert!(!self.prepare_queue_full(), "pipeline over bound");
        if let Some(back) = self.prepares.back() {
            assert_eq!(
                back.op().next(),
                message.header().op,
                "pipeline must stay contiguous"
            );
        }
        let mut ok_from = HashSet::new();
        ok_from.insert(primary);
        self.prepares.push_back(PendingPrepare { message, ok_from });
    }

    /// Records a prepare_ok vote. Duplicate votes are counted once
    /// (set semantics).
    pub fn record_ok(&mut self, op: OpNumber, from: ReplicaId) {
        if let Some(pending) = self.prepares.iter_mut().find(|p| p.op() == op) {
            pending.ok_from.insert(from);
        }
    }

    /// The head prepare, committed in FIFO order only.
    pub fn head(&self) -> Option<&PendingPrepare> {
        self.prepares.front()
    }

    /// Pops the head once it reached quorum and was committed.
    pub fn pop_head(&mut self) -> Option<PendingPrepare> {
        self.prepares.pop_front()
    }

    pub fn prepare_count(&self) -> usize {
        self.prepares.len()
    }

    /// Looks up an uncommitted prepare by op.
    pub fn prepare_by_op(&self, op: OpNumber) -> Option<&PendingPrepare> {
        self.prepares.iter().find(|p| p.op() == op)
    }

    /// Drops everything — on view change the new primary rebuilds its
    /// pipeline from the canonical log, and queued requests are
    /// re-sent by their clients.
    pub fn clear(&mut self) {
        self.prepares.clear();
        self.requests.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use corundum_types::ClusterId;
    use corundum_wire::{Command, Header};

    fn prepare(op: u64) -> Message {
        let mut header = Header::new(ClusterId::new(1), Command::Prepare);
        header.op = OpNumber::new(op);
        header.set_checksum_body(b"x");
        header.set_checksum();
        Message::new(header, Bytes::from_static(b"x"))
    }

    fn request(n: u64) -> Message {
        let mut header = Header::new(ClusterId::new(1), Command::Request);
        header.request = corundum_types::RequestNumber::new(n);
        header.set_checksum_body(&[]);
        header.set_checksum();
        Message::from_header(header)
    }

    #[test]
    fn request_queue_applies_backpressure() {
        let mut pipeline = Pipeline::new();
        for n in 0..PIPELINE_REQUEST_QUEUE_MAX as u64 {
            assert!(pipeline.push_request(request(n)));
        }
        assert!(!pipeline.push_request(request(99)), "over-bound request dropped");
    }

    #[test]
    fn prepares_commit_in_fifo_order() {
        let primary = ReplicaId::new(0);
        let mut pipeline = Pipeline::new();
        pipeline.push_prepare(prepare(1), primary);
        pipeline.push_prepare(prepare(2), primary);

        pipeline.record_ok(OpNumber::new(1), ReplicaId::new(1));
        // Duplicate vote counts once.
        pipeline.record_ok(OpNumber::new(1), ReplicaId::new(1));
        assert_eq!(pipeline.head().unwrap().ok_from.len(), 2);

        let head = pipeline.pop_head().unwrap();
        assert_eq!(head.op(), OpNumber::new(1));
        assert_eq!(pipeline.head().unwrap().op(), OpNumber::new(2));
    }

    #[test]
    #[should_panic(expected = "contiguous")]
    fn pipeline_rejects_op_gaps() {
        let primary = ReplicaId::new(0);
        let mut pipeline = Pipeline::new();
        pipeline.push_prepare(prepare(1), primary);
        pipeline.push_prepare(prepare(3), primary);
    }

    #[test]
    #[should_panic(expected = "over bound")]
    fn pipeline_rejects_overflow() {
        let primary = ReplicaId::new(0);
        let mut pipeline = Pipeline::new();
        for op in 1..=(PIPELINE_PREPARE_QUEUE_MAX as u64 + 1) {
            pipeline.push_prepare(prepare(op), primary);
        }
    }
}
