//! # corundum-storage: Durable state for Corundum replicas
//!
//! Everything a replica persists lives in one data file, partitioned by
//! `corundum-io` zones. This crate owns the on-disk formats and their
//! recovery semantics:
//!
//! - [`wal`]: circular prepare log with header/prepare separation and
//!   torn-write classification
//! - [`superblock`]: the quorum-replicated durable root
//! - [`client_replies`]: persisted reply slots for at-most-once
//!   execution
//! - [`grid`] / [`free_set`]: content-addressed block storage and its
//!   liveness bitmap
//! - [`scrubber`]: background grid integrity sweep
//!
//! The replica state machine in `corundum-vsr` composes these; nothing
//! here knows about views or quorums except the superblock's record of
//! them.

pub mod client_replies;
pub mod free_set;
pub mod grid;
pub mod scrubber;
pub mod superblock;
pub mod wal;

pub use client_replies::{ClientReplies, ReplyRead};
pub use free_set::FreeSet;
pub use grid::{BlockId, Grid, GridError};
pub use scrubber::{GridScrubber, ScrubResult};
pub use superblock::{SessionSnapshot, Superblock, SuperblockError, SuperblockImage, VsrState};
pub use wal::{PrepareRead, RecoveredSlot, Wal};
