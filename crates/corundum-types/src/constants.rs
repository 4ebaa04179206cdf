//! Static bounds and checkpoint arithmetic.
//!
//! Every buffer in the core is preallocated from these bounds; nothing
//! on the hot path allocates. The values here are compile-time
//! constants so that zone offsets are stable across processes of the
//! same format version.

use crate::{OpNumber, Release};

/// Sector size assumed atomic by the storage driver.
pub const SECTOR_SIZE: usize = 512;

/// Fixed size of every message header, on disk and on the wire.
pub const HEADER_SIZE: usize = 128;

/// Upper bound on a full message (header + body).
///
/// Also the size of one WAL prepare slot and one client-reply slot.
/// Sized so a full sync_checkpoint payload (superblock trailer plus
/// state root) always fits in one message.
pub const MESSAGE_SIZE_MAX: usize = 32 * 1024;

/// Upper bound on a message body.
pub const MESSAGE_BODY_SIZE_MAX: usize = MESSAGE_SIZE_MAX - HEADER_SIZE;

/// Number of WAL slots. Power of two.
///
/// Must exceed `CHECKPOINT_INTERVAL + PIPELINE_PREPARE_QUEUE_MAX` so
/// that the prepares of the current checkpoint cannot be overwritten
/// before the next checkpoint is durable.
pub const SLOT_COUNT: usize = 64;

/// Maximum uncommitted prepares in flight at the primary.
pub const PIPELINE_PREPARE_QUEUE_MAX: usize = 4;

/// Maximum client requests queued at the primary beyond the pipeline.
pub const PIPELINE_REQUEST_QUEUE_MAX: usize = 4;

/// Ops between checkpoints.
pub const CHECKPOINT_INTERVAL: u64 = 20;

/// Ops per bar (batch boundary used by the upgrade protocol).
pub const BAR_LENGTH: u64 = 4;

/// Maximum concurrent client sessions (reply-cache slots).
pub const CLIENTS_MAX: usize = 32;

/// Size of one grid block.
pub const GRID_BLOCK_SIZE: usize = 64 * 1024;

/// Maximum grid blocks per replica.
pub const GRID_BLOCKS_MAX: usize = 256;

/// Number of superblock copies; open requires `SUPERBLOCK_QUORUM` of
/// them to agree on the highest sequence.
pub const SUPERBLOCK_COPIES: usize = 4;

/// Copies that must agree for the superblock to open.
pub const SUPERBLOCK_QUORUM: usize = SUPERBLOCK_COPIES / 2 + 1;

/// Oldest client release the cluster accepts. Requests stamped with an
/// older release are dropped at admission.
pub const RELEASE_CLIENT_MIN: Release = Release::from_parts(0, 1, 0);

/// Size of one superblock copy (fixed head + snapshot trailer + CRC).
///
/// Sized for the worst-case trailer: a full grid index plus a full
/// session table.
pub const SUPERBLOCK_COPY_SIZE: usize = 16384;

// ============================================================================
// Timeout ticks
// ============================================================================
//
// All timeouts count scheduler ticks, never wall time. One tick is one
// call to `Replica::on_tick`.

pub const PING_TIMEOUT_TICKS: u64 = 10;
pub const COMMIT_HEARTBEAT_TICKS: u64 = 10;
pub const VIEW_CHANGE_TIMEOUT_TICKS: u64 = 50;
pub const VIEW_CHANGE_JITTER_TICKS: u64 = 10;
pub const PRIMARY_ABDICATE_TICKS: u64 = 100;
pub const REPAIR_TIMEOUT_TICKS: u64 = 5;
pub const SCRUB_TIMEOUT_TICKS: u64 = 20;

const _: () = assert!(SLOT_COUNT.is_power_of_two());
const _: () = assert!(
    SLOT_COUNT as u64 > CHECKPOINT_INTERVAL + PIPELINE_PREPARE_QUEUE_MAX as u64,
    "WAL must hold a full checkpoint interval plus the pipeline"
);
const _: () = assert!(CHECKPOINT_INTERVAL % BAR_LENGTH == 0);
const _: () = assert!(MESSAGE_SIZE_MAX % SECTOR_SIZE == 0);
const _: () = assert!(SUPERBLOCK_COPY_SIZE % SECTOR_SIZE == 0);
const _: () = assert!(GRID_BLOCK_SIZE % SECTOR_SIZE == 0);

/// The op at which checkpoint `c` is taken (1-based checkpoint number).
pub fn checkpoint_op(checkpoint: u64) -> OpNumber {
    OpNumber::new(checkpoint * CHECKPOINT_INTERVAL)
}

/// The checkpoint number that op `op` belongs to (the latest checkpoint
/// at or below it).
pub fn checkpoint_for_op(op: OpNumber) -> u64 {
    op.as_u64() / CHECKPOINT_INTERVAL
}

/// The op whose commit triggers writing checkpoint `c`.
pub fn trigger_for_checkpoint(checkpoint: u64) -> OpNumber {
    checkpoint_op(checkpoint)
}

/// The highest op that may live in the WAL while checkpoint `c` is
/// current. Beyond this, a lagging replica can no longer WAL-repair and
/// must state-sync.
pub fn prepare_max_for_checkpoint(checkpoint: u64) -> OpNumber {
    OpNumber::new(
        checkpoint_op(checkpoint).as_u64() + (SLOT_COUNT - PIPELINE_PREPARE_QUEUE_MAX) as u64,
    )
}
