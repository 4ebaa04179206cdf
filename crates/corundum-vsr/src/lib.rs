//! # corundum-vsr: The Corundum replica
//!
//! This crate implements the Viewstamped Replication state machine
//! over the storage substrate from `corundum-storage`:
//!
//! - [`Journal`]: the in-memory index over the WAL (headers plus
//!   dirty/faulty slot bitmaps)
//! - [`Pipeline`]: the primary's bounded prepare and request queues
//! - [`ClientSessions`]: the session table backing the reply cache
//! - [`Replica`]: the protocol itself — normal operation, view change,
//!   recovery, repair, checkpointing, state sync, and upgrades
//! - [`StateMachine`]: the seam to the application (the "forest"),
//!   with a deterministic test implementation
//!
//! # Concurrency model
//!
//! A replica is strictly single-threaded and event-driven: the owner
//! feeds it messages ([`Replica::on_message`]) and ticks
//! ([`Replica::on_tick`]) and sends whatever [`ReplicaOutput`] asks
//! for. All I/O happens synchronously through the injected
//! [`corundum_io::Storage`] driver, which is what makes the whole
//! protocol deterministic under simulation.

mod client_sessions;
mod config;
mod journal;
mod pipeline;
mod state_machine;
mod timeouts;
mod upgrade;

mod replica;


pub use client_sessions::{ClientSessions, Session};
pub use config::ClusterConfig;
pub use journal::Journal;
pub use pipeline::Pipeline;
pub use replica::{
    ExitReason, OpenError, Outbound, Recipient, Replica, ReplicaOptions, ReplicaOutput,
};
pub use state_machine::{HashStateMachine, StateMachine};
pub use timeouts::{Timeout, Timeouts};
pub use upgrade::UpgradeState;
