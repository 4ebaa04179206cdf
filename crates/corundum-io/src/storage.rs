//! Storage driver trait.
//!
//! Abstracts the replica data file so that production I/O and the
//! deterministic simulation storage are interchangeable. The replica is
//! single-threaded; implementations are called only from its event loop
//! and must not reorder operations within a zone.

use bytes::Bytes;
use thiserror::Error;

use crate::Zone;

/// The kind of fault a driver operation reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The read failed outright (media error, simulated sector fault).
    Read,
    /// The write failed outright.
    Write,
    /// The sync barrier failed.
    Sync,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::Read => write!(f, "read"),
            FaultKind::Write => write!(f, "write"),
            FaultKind::Sync => write!(f, "sync"),
        }
    }
}

/// A per-operation storage fault.
///
/// Faults are reported truthfully and recovered locally (repair,
/// scrubbing); they are never an excuse to guess at content.
#[derive(Debug, Clone, Error)]
#[error("storage {kind} fault in {zone:?} at offset {offset}")]
pub struct StorageFault {
    pub kind: FaultKind,
    pub zone: Zone,
    pub offset: u64,
}

/// Sector-granular access to the replica data file.
///
/// # Contract
///
/// - `read` returns whatever bytes are on the media — possibly zeros,
///   stale, or corrupt. Callers validate with checksums.
/// - `write` is durable only after a subsequent `sync` returns `Ok`.
/// - Writes may tear at sector granularity on crash; a driver must
///   never tear within a sector.
/// - Operations within one zone complete in submission order.
pub trait Storage {
    /// Reads `len` bytes at `offset` within `zone`.
    fn read(&mut self, zone: Zone, offset: u64, len: usize) -> Result<Bytes, StorageFault>;

    /// Writes `data` at `offset` within `zone`.
    fn write(&mut self, zone: Zone, offset: u64, data: &[u8]) -> Result<(), StorageFault>;

    /// Durability barrier for all previously written data.
    fn sync(&mut self) -> Result<(), StorageFault>;

    /// Reads one whole cell of a zone.
    fn read_cell(&mut self, zone: Zone, index: usize) -> Result<Bytes, StorageFault> {
        let offset = (index * zone.cell_size()) as u64;
        self.read(zone, offset, zone.cell_size())
    }

    /// Writes into a cell of a zone, starting at the cell boundary.
    ///
    /// `data` may be shorter than the cell; the remainder keeps its
    /// previous content.
    fn write_cell(&mut self, zone: Zone, index: usize, data: &[u8]) -> Result<(), StorageFault> {
        assert!(
            data.len() <= zone.cell_size(),
            "cell write of {} bytes exceeds {} cell size {}",
            data.len(),
            zone.name(),
            zone.cell_size()
        );
        let offset = (index * zone.cell_size()) as u64;
        self.write(zone, offset, data)
    }
}
