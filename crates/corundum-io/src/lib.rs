//! # corundum-io: Storage driver abstraction for Corundum
//!
//! One data file per replica, partitioned into fixed zones. This crate
//! provides:
//!
//! - [`Zone`]: the fixed partition of the data file, with stable byte
//!   arithmetic across releases of the same format version
//! - [`Storage`]: the sector-granular driver trait with truthful fault
//!   reporting
//! - [`FileStorage`]: the production backend over positional file I/O
//!
//! # Fault model
//!
//! Reads may observe zeros, stale data, or corrupt bytes — the driver
//! surfaces whatever is on the media and leaves integrity checking to
//! the caller's checksums. Explicit I/O errors are reported as
//! [`StorageFault`]s. Writes may be torn at sector granularity on
//! crash; the WAL's body-then-header ordering is what makes torn
//! prepares detectable.
//!
//! # Ordering
//!
//! The driver never reorders completions within a zone. The replica is
//! single-threaded; all calls are made from its event loop.

mod file;
mod storage;
mod zone;

pub use file::FileStorage;
pub use storage::{FaultKind, Storage, StorageFault};
pub use zone::{Zone, DATA_FILE_SIZE};
