//! # corundum-types: Core types for Corundum
//!
//! Shared identifiers and protocol numbers used across the replication
//! core:
//! - Cluster identity ([`ClusterId`], [`ReplicaId`], [`ClientId`])
//! - Log positions ([`OpNumber`], [`CommitNumber`], [`ViewNumber`])
//! - Request identity ([`RequestNumber`])
//! - Software releases ([`Release`])
//! - Integrity ([`Checksum`])
//! - Grid addressing ([`GridAddress`])
//! - Temporal types ([`Timestamp`])
//! - Replica lifecycle ([`ReplicaStatus`])
//! - Static bounds and checkpoint arithmetic ([`constants`])

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

pub mod constants;

// ============================================================================
// Cluster Identity - All Copy (cheap fixed-size values)
// ============================================================================

/// Unique identifier for a cluster.
///
/// Assigned at `format` time and stamped into every message header and
/// on-disk structure. Messages from a different cluster are dropped at
/// the wire boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClusterId(u128);

impl ClusterId {
    pub const fn new(id: u128) -> Self {
        Self(id)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<u128> for ClusterId {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl From<ClusterId> for u128 {
    fn from(id: ClusterId) -> Self {
        id.0
    }
}

/// Index of a replica within the cluster.
///
/// Active replicas are numbered `0..replica_count`; standbys follow at
/// `replica_count..replica_count + standby_count`. The primary for view
/// `v` is `v mod replica_count` — standbys never hold leadership.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaId(u8);

impl ReplicaId {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "replica#{}", self.0)
    }
}

impl From<u8> for ReplicaId {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Unique identifier for a client session.
///
/// Clients draw their id once at startup; all requests from that client
/// carry it. Reply-cache slots are keyed by client id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClientId(u64);

impl ClientId {
    pub const NONE: ClientId = ClientId(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the reserved "no client" id used by
    /// protocol-internal prepares (upgrades, pulses).
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

impl From<u64> for ClientId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Log Positions
// ============================================================================

/// Position of a prepare in the replicated log.
///
/// Ops are 1-indexed: op 0 is the log root and never carries a client
/// operation. `op mod SLOT_COUNT` determines the WAL slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct OpNumber(u64);

impl OpNumber {
    pub const ZERO: OpNumber = OpNumber(0);

    pub const fn new(op: u64) -> Self {
        Self(op)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Returns the next op number.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the previous op number.
    ///
    /// # Panics
    ///
    /// Panics in debug builds when called on op 0.
    pub fn prev(&self) -> Self {
        debug_assert!(self.0 > 0, "op 0 has no predecessor");
        Self(self.0 - 1)
    }

    /// Returns the WAL slot this op occupies.
    pub fn slot(&self) -> usize {
        (self.0 % constants::SLOT_COUNT as u64) as usize
    }

    /// Distance from `other` to `self` (saturating).
    pub fn distance_from(&self, other: OpNumber) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Display for OpNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op:{}", self.0)
    }
}

impl From<u64> for OpNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<OpNumber> for u64 {
    fn from(op: OpNumber) -> Self {
        op.0
    }
}

/// Highest committed op number.
///
/// A distinct type from [`OpNumber`] so that commit and prepare
/// positions cannot be confused at call sites.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CommitNumber(u64);

impl CommitNumber {
    pub const ZERO: CommitNumber = CommitNumber(0);

    pub const fn new(op: OpNumber) -> Self {
        Self(op.as_u64())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_op_number(&self) -> OpNumber {
        OpNumber(self.0)
    }
}

impl Display for CommitNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "commit:{}", self.0)
    }
}

/// Era of primary leadership.
///
/// Incremented on every leadership change. `log_view <= view` always;
/// they are equal exactly when the replica's log is authoritative for
/// the current view (status normal).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewNumber(u32);

impl ViewNumber {
    pub const ZERO: ViewNumber = ViewNumber(0);

    pub const fn new(view: u32) -> Self {
        Self(view)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "view:{}", self.0)
    }
}

impl From<u32> for ViewNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Per-client request sequence number.
///
/// Clients number requests sequentially and keep at most one in flight.
/// Duplicate request numbers are served from the reply cache, which is
/// what makes client retry idempotent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RequestNumber(u64);

impl RequestNumber {
    pub const ZERO: RequestNumber = RequestNumber(0);

    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for RequestNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "request:{}", self.0)
    }
}

// ============================================================================
// Releases
// ============================================================================

/// A software release version, packed as `(major, minor, patch)`.
///
/// Every prepare header carries the release that produced it; a replica
/// refuses to apply a prepare whose release it does not bundle. The
/// superblock carries the replica's current release.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Release(u32);

impl Release {
    /// The reserved zero release, used only by the log root.
    pub const ZERO: Release = Release(0);

    pub const fn new(packed: u32) -> Self {
        Self(packed)
    }

    pub const fn from_parts(major: u8, minor: u8, patch: u16) -> Self {
        Self((major as u32) << 24 | (minor as u32) << 16 | (patch as u32))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn major(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn minor(&self) -> u8 {
        (self.0 >> 16 & 0xFF) as u8
    }

    pub fn patch(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl Display for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

// ============================================================================
// Integrity - 128-bit content checksum
// ============================================================================

/// A 128-bit content checksum.
///
/// Used for message header/body integrity, grid block addressing, and
/// checkpoint identity. The digest algorithm lives in `corundum-crypto`;
/// this type only stores the 128-bit value. Equality is constant-time
/// in the sense that it compares a single `u128`.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Checksum(u128);

impl Checksum {
    /// The zero checksum, used as the parent of the log root and as the
    /// id of the empty checkpoint.
    pub const ZERO: Checksum = Checksum(0);

    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Checksum({:08x}...)", (self.0 >> 96) as u32)
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

// ============================================================================
// Grid Addressing
// ============================================================================

/// Address of a grid block.
///
/// 1-based: address 0 is reserved and never allocated. Each address maps
/// to one fixed-size cell in the grid zone and one bit in the free set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GridAddress(u64);

impl GridAddress {
    pub const fn new(address: u64) -> Self {
        debug_assert!(address > 0, "grid addresses are 1-based");
        Self(address)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Zero-based index into the grid zone and free set.
    pub fn index(&self) -> usize {
        (self.0 - 1) as usize
    }

    pub fn from_index(index: usize) -> Self {
        Self(index as u64 + 1)
    }
}

impl Display for GridAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

// ============================================================================
// Temporal
// ============================================================================

/// Cluster timestamp in nanoseconds.
///
/// Assigned by the primary when a prepare is created and strictly
/// monotonic across the log. In simulation this is virtual time; the
/// core never reads a wall clock directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Returns `max(self + 1, candidate)`, preserving strict
    /// monotonicity when the underlying clock stalls or regresses.
    pub fn advance_to(&self, candidate: Timestamp) -> Self {
        Self(candidate.0.max(self.0 + 1))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{secs}.{nanos:09}")
    }
}

// ============================================================================
// Replica Status
// ============================================================================

/// Lifecycle status of a replica.
///
/// There is no terminal variant: a replica either runs or the process
/// exits (only for unrecoverable WAL corruption on a single-replica
/// cluster, or a release mismatch discovered during state sync).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// Processing prepares and commits in the current view.
    Normal,
    /// Participating in the election of a new primary.
    ViewChange,
    /// Replaying local state after a restart.
    Recovering,
    /// Restarted with a torn log head; learning the authoritative head
    /// from peers before rejoining. Must not nack while in this state.
    RecoveringHead,
}

impl Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaStatus::Normal => write!(f, "normal"),
            ReplicaStatus::ViewChange => write!(f, "view_change"),
            ReplicaStatus::Recovering => write!(f, "recovering"),
            ReplicaStatus::RecoveringHead => write!(f, "recovering_head"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::*;

    #[test]
    fn op_number_slot_wraps() {
        assert_eq!(OpNumber::new(0).slot(), 0);
        assert_eq!(OpNumber::new(1).slot(), 1);
        assert_eq!(OpNumber::new(SLOT_COUNT as u64).slot(), 0);
        assert_eq!(OpNumber::new(SLOT_COUNT as u64 + 3).slot(), 3);
    }

    #[test]
    fn release_parts_roundtrip() {
        let r = Release::from_parts(1, 4, 260);
        assert_eq!(r.major(), 1);
        assert_eq!(r.minor(), 4);
        assert_eq!(r.patch(), 260);
        assert!(r > Release::from_parts(1, 3, 999));
    }

    #[test]
    fn grid_address_is_one_based() {
        let a = GridAddress::new(1);
        assert_eq!(a.index(), 0);
        assert_eq!(GridAddress::from_index(5).as_u64(), 6);
    }

    #[test]
    fn timestamp_advance_is_strictly_monotonic() {
        let t = Timestamp::from_nanos(100);
        assert_eq!(t.advance_to(Timestamp::from_nanos(50)).as_nanos(), 101);
        assert_eq!(t.advance_to(Timestamp::from_nanos(200)).as_nanos(), 200);
    }

    #[test]
    fn checkpoint_arithmetic() {
        assert_eq!(checkpoint_op(1).as_u64(), CHECKPOINT_INTERVAL);
        assert_eq!(trigger_for_checkpoint(1), checkpoint_op(1));
        assert!(
            prepare_max_for_checkpoint(1).as_u64()
                > checkpoint_op(2).as_u64() + PIPELINE_PREPARE_QUEUE_MAX as u64,
            "the WAL must retain slack for a full pipeline past the next checkpoint"
        );
    }
}
