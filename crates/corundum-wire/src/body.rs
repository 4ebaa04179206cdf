//! Typed bodies for control messages.
//!
//! Prepares, replies, and blocks carry opaque application payloads;
//! control messages carry small structured bodies, postcard-encoded for
//! a canonical byte representation. Header lists travel as concatenated
//! fixed-layout headers (see [`crate::encode_headers`]) inside these
//! bodies, so every embedded header is individually checksummed.

use corundum_types::{Checksum, OpNumber, Release, ViewNumber};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Encodes a control body to canonical bytes.
pub fn encode<T: Serialize>(body: &T) -> Vec<u8> {
    postcard::to_allocvec(body).expect("control bodies are always serializable")
}

/// Decodes a control body, surfacing malformed bodies as a wire error.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, WireError> {
    postcard::from_bytes(bytes).map_err(|_| WireError::BodyInvalid)
}

/// `pong` body: the responder's checkpoint position (used by lagging
/// replicas to discover state-sync targets) and the newest release its
/// binary bundles (used by the upgrade census).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongBody {
    pub checkpoint_op: OpNumber,
    pub checkpoint_id: Checksum,
    pub release_max: Release,
}

/// `do_view_change` body. The header carries `view` (new view), `op`
/// (op head), and `commit` (commit max); the body carries what the
/// header cannot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoViewChangeBody {
    /// The view whose prepares this replica's log is authoritative for.
    pub log_view: ViewNumber,
    /// The sender's current checkpoint (for the forfeit rule).
    pub checkpoint_op: OpNumber,
    /// Concatenated headers for `[commit_min + 1 ..= op_head]`.
    /// A missing op in this range is the sender's nack for that op —
    /// unless the op's slot appears in `faulty_slots`.
    pub headers: Vec<u8>,
    /// Slots whose header and prepare were both unreadable. The sender
    /// cannot vouch for or against the ops mapping here, so they never
    /// count as nacks.
    pub faulty_slots: Vec<u32>,
}

/// `start_view` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartViewBody {
    pub checkpoint_op: OpNumber,
    pub checkpoint_id: Checksum,
    /// Concatenated headers for the suffix `[commit_max + 1 ..= op_head]`,
    /// plus the header at `commit_max` itself as a chain anchor.
    pub headers: Vec<u8>,
}

/// `headers` body (repair response).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadersBody {
    pub headers: Vec<u8>,
}

/// `request_prepare` body: the prepare wanted, identified by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPrepareBody {
    pub op: OpNumber,
    /// Checksum of the wanted prepare, or `Checksum::ZERO` when the
    /// requester has no header and will take any matching op.
    pub checksum: Checksum,
}

/// `request_headers` body: an inclusive op range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeadersBody {
    pub op_min: OpNumber,
    pub op_max: OpNumber,
}

/// `request_block` / `block` identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBlockBody {
    pub address: u64,
    pub checksum: Checksum,
}

/// `block` body: the identified block and its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    pub address: u64,
    pub checksum: Checksum,
    pub payload: Vec<u8>,
}

/// `request_sync_checkpoint` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSyncCheckpointBody {
    pub checkpoint_op: OpNumber,
    pub checkpoint_id: Checksum,
}

/// `upgrade` prepare payload: the release being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeBody {
    pub release: Release,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_body_roundtrip() {
        let body = DoViewChangeBody {
            log_view: ViewNumber::new(4),
            checkpoint_op: OpNumber::new(20),
            headers: vec![1, 2, 3],
            faulty_slots: vec![7],
        };
        let bytes = encode(&body);
        let decoded: DoViewChangeBody = decode(&bytes).expect("decode");
        assert_eq!(decoded, body);
    }

    #[test]
    fn malformed_body_is_a_wire_error() {
        let result: Result<PongBody, _> = decode(&[0xFF]);
        assert_eq!(result.unwrap_err(), WireError::BodyInvalid);
    }
}
