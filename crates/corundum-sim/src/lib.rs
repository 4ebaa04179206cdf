//! # corundum-sim: Deterministic simulation for Corundum
//!
//! Everything the replica touches is injectable, so a whole cluster —
//! storage faults, crashes, partitions, message loss — runs in memory
//! under one seed and replays exactly:
//!
//! - [`SimStorage`]: in-memory zoned storage with byte-level
//!   corruption, sector read faults, and torn-write crash semantics
//! - [`SimNetwork`]: drop / duplicate / reorder / partition
//! - [`Cluster`]: replicas + clients + invariant checking in one
//!   steppable harness
//!
//! The scenario suite in `tests/` drives the end-to-end fault cases
//! (WAL corruption, torn heads, partitions, dueling primaries,
//! checkpoint crashes, state sync, scrub healing) against real
//! replicas — the same code that runs in production, minus the file
//! descriptors.

mod cluster;
mod network;
mod storage;

pub use cluster::{Cluster, ClusterOptions, ReplicaSlot};
pub use network::{Endpoint, NetworkOptions, SimNetwork};
pub use storage::SimStorage;
