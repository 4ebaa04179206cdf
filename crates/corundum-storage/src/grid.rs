//! Content-addressed block storage.
//!
//! Grid blocks are fixed-size cells identified by `(address,
//! checksum)`. Blocks are immutable once written; an address is reused
//! only after its block is released at a checkpoint boundary. Because
//! identity is content-derived, any peer whose block at an address
//! hashes to the expected checksum is a valid repair source.
//!
//! # Cell layout
//!
//! ```text
//! [0..4)   length   u32
//! [4..4+length)     payload
//! ...               stale bytes from previous occupants
//! ```
//!
//! The checksum is over the payload alone and lives in the in-memory
//! index (persisted via the superblock trailer), not in the cell: the
//! index is the authority on what a cell *should* contain, reads only
//! verify it.

use bytes::Bytes;
use corundum_crypto::checksum;
use corundum_io::{Storage, StorageFault, Zone};
use corundum_types::constants::{GRID_BLOCKS_MAX, GRID_BLOCK_SIZE};
use corundum_types::{Checksum, GridAddress};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::FreeSet;

/// Maximum payload per block (cell minus the length prefix).
pub const BLOCK_PAYLOAD_MAX: usize = GRID_BLOCK_SIZE - 4;

/// A content address: constant-time equality on the checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub address: GridAddress,
    pub checksum: Checksum,
}

/// Grid errors.
#[derive(Debug, Error)]
pub enum GridError {
    #[error("grid is full ({GRID_BLOCKS_MAX} blocks)")]
    Full,
    #[error("grid {address} is not live")]
    NotLive { address: GridAddress },
    #[error("grid {address} failed checksum verification")]
    ChecksumMismatch { address: GridAddress },
    #[error("grid block payload of {len} bytes exceeds {BLOCK_PAYLOAD_MAX}")]
    PayloadTooLarge { len: usize },
    #[error("grid storage fault: {0}")]
    Fault(#[from] StorageFault),
}

/// The grid: free set plus the live-block index.
///
/// Invariant: an address is in the index exactly when it is acquired in
/// the free set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    free_set: FreeSet,
    index: BTreeMap<GridAddress, Checksum>,
    /// Addresses released this checkpoint interval; the free set bits
    /// clear only when the checkpoint installs.
    to_release: Vec<GridAddress>,
}

impl Grid {
    pub fn new() -> Self {
        Self {
            free_set: FreeSet::new(),
            index: BTreeMap::new(),
            to_release: Vec::new(),
        }
    }

    /// Restores the grid from superblock snapshots.
    pub fn from_snapshot(free_set: &[u8], grid_index: &[(u64, Checksum)]) -> Option<Self> {
        let free_set = FreeSet::decode(free_set)?;
        let index: BTreeMap<GridAddress, Checksum> = grid_index
            .iter()
            .map(|&(address, checksum)| (GridAddress::new(address), checksum))
            .collect();
        // The invariant must hold for a snapshot to be usable.
        if index.len() != free_set.acquired_count() {
            return None;
        }
        if index.keys().any(|a| free_set.is_free(*a)) {
            return None;
        }
        Some(Self {
            free_set,
            index,
            to_release: Vec::new(),
        })
    }

    /// Snapshot for the superblock trailer.
    pub fn snapshot(&self) -> (Vec<u8>, Vec<(u64, Checksum)>) {
        let index = self
            .index
            .iter()
            .map(|(address, checksum)| (address.as_u64(), *checksum))
            .collect();
        (self.free_set.encode(), index)
    }

    /// The expected checksum of a live block.
    pub fn lookup(&self, address: GridAddress) -> Option<Checksum> {
        self.index.get(&address).copied()
    }

    /// Iterates live blocks in address order.
    pub fn iter_live(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.index.iter().map(|(&address, &checksum)| BlockId {
            address,
            checksum,
        })
    }

    pub fn live_count(&self) -> usize {
        self.index.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_set.free_count()
    }

    /// Writes a new block, acquiring the lowest free address.
    ///
    /// The write is durable (synced) before this returns: a block must
    /// be on disk before the checkpoint that references it installs.
    pub fn write_block<S: Storage>(
        &mut self,
        storage: &mut S,
        payload: &[u8],
    ) -> Result<BlockId, GridError> {
        if payload.len() > BLOCK_PAYLOAD_MAX {
            return Err(GridError::PayloadTooLarge { len: payload.len() });
        }
        let address = self.free_set.acquire().ok_or(GridError::Full)?;

        let mut cell = Vec::with_capacity(4 + payload.len());
        cell.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        cell.extend_from_slice(payload);
        if let Err(fault) = storage.write_cell(Zone::Grid, address.index(), &cell) {
            self.free_set.release(address);
            return Err(fault.into());
        }
        if let Err(fault) = storage.sync() {
            self.free_set.release(address);
            return Err(fault.into());
        }

        let block_checksum = checksum(payload);
        self.index.insert(address, block_checksum);
        Ok(BlockId {
            address,
            checksum: block_checksum,
        })
    }

    /// Repairs a block at a known address with known content, e.g.
    /// from a peer's `block` message. The address must be live and the
    /// payload must hash to the indexed checksum.
    pub fn repair_block<S: Storage>(
        &mut self,
        storage: &mut S,
        address: GridAddress,
        payload: &[u8],
    ) -> Result<(), GridError> {
        let expected = self
            .lookup(address)
            .ok_or(GridError::NotLive { address })?;
        if checksum(payload) != expected {
            return Err(GridError::ChecksumMismatch { address });
        }
        let mut cell = Vec::with_capacity(4 + payload.len());
        cell.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        cell.extend_from_slice(payload);
        storage.write_cell(Zone::Grid, address.index(), &cell)?;
        storage.sync()?;
        Ok(())
    }

    /// Reads and verifies a live block.
    pub fn read_block<S: Storage>(
        &self,
        storage: &mut S,
        address: GridAddress,
    ) -> Result<Bytes, GridError> {
        let expected = self
            .lookup(address)
            .ok_or(GridError::NotLive { address })?;
        self.read_block_expect(storage, address, expected)
    }

    /// Reads a block verifying against an explicit checksum — the
    /// repair-serving path, where the requester names the content.
    pub fn read_block_expect<S: Storage>(
        &self,
        storage: &mut S,
        address: GridAddress,
        expected: Checksum,
    ) -> Result<Bytes, GridError> {
        let cell = storage
            .read_cell(Zone::Grid, address.index())
            .map_err(GridError::Fault)?;
        let length = u32::from_le_bytes(cell[0..4].try_into().unwrap()) as usize;
        if length > BLOCK_PAYLOAD_MAX {
            return Err(GridError::ChecksumMismatch { address });
        }
        let payload = cell.slice(4..4 + length);
        if checksum(&payload) != expected {
            return Err(GridError::ChecksumMismatch { address });
        }
        Ok(payload)
    }

    /// Marks a block for release at the next checkpoint boundary.
    pub fn release(&mut self, address: GridAddress) {
        assert!(
            self.index.contains_key(&address),
            "release of non-live grid {address}"
        );
        self.to_release.push(address);
    }

    /// Applies deferred releases. Called exactly when a checkpoint
    /// installs — never between checkpoints.
    pub fn checkpoint(&mut self) {
        for address in self.to_release.drain(..) {
            self.index.remove(&address);
            self.free_set.release(address);
        }
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemStorage {
        data: Vec<u8>,
    }

    impl MemStorage {
        fn new() -> Self {
            Self {
                data: vec![0u8; Zone::Grid.size() as usize],
            }
        }

        fn corrupt_block(&mut self, address: GridAddress) {
            let start = address.index() * GRID_BLOCK_SIZE;
            for byte in &mut self.data[start + 4..start + 64] {
                *byte ^= 0x55;
            }
        }
    }

    impl Storage for MemStorage {
        fn read(&mut self, zone: Zone, offset: u64, len: usize) -> Result<Bytes, StorageFault> {
            assert_eq!(zone, Zone::Grid);
            let start = offset as usize;
            Ok(Bytes::copy_from_slice(&self.data[start..start + len]))
        }

        fn write(&mut self, zone: Zone, offset: u64, data: &[u8]) -> Result<(), StorageFault> {
            assert_eq!(zone, Zone::Grid);
            let start = offset as usize;
            self.data[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn sync(&mut self) -> Result<(), StorageFault> {
            Ok(())
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut storage = MemStorage::new();
        let mut grid = Grid::new();
        let id = grid.write_block(&mut storage, b"table data").unwrap();
        assert_eq!(id.address, GridAddress::new(1));
        let read = grid.read_block(&mut storage, id.address).unwrap();
        assert_eq!(&read[..], b"table data");
    }

    #[test]
    fn corruption_is_detected() {
        let mut storage = MemStorage::new();
        let mut grid = Grid::new();
        let id = grid.write_block(&mut storage, b"table data").unwrap();
        storage.corrupt_block(id.address);
        assert!(matches!(
            grid.read_block(&mut storage, id.address),
            Err(GridError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn repair_restores_content() {
        let mut storage = MemStorage::new();
        let mut grid = Grid::new();
        let id = grid.write_block(&mut storage, b"table data").unwrap();
        storage.corrupt_block(id.address);

        grid.repair_block(&mut storage, id.address, b"table data")
            .unwrap();
        let read = grid.read_block(&mut storage, id.address).unwrap();
        assert_eq!(&read[..], b"table data");
    }

    #[test]
    fn repair_rejects_wrong_content() {
        let mut storage = MemStorage::new();
        let mut grid = Grid::new();
        let id = grid.write_block(&mut storage, b"table data").unwrap();
        assert!(matches!(
            grid.repair_block(&mut storage, id.address, b"not the data"),
            Err(GridError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn release_defers_to_checkpoint() {
        let mut storage = MemStorage::new();
        let mut grid = Grid::new();
        let id = grid.write_block(&mut storage, b"short lived").unwrap();

        grid.release(id.address);
        // Still readable until the checkpoint installs.
        assert!(grid.read_block(&mut storage, id.address).is_ok());

        grid.checkpoint();
        assert!(matches!(
            grid.read_block(&mut storage, id.address),
            Err(GridError::NotLive { .. })
        ));
        assert_eq!(grid.free_count(), GRID_BLOCKS_MAX);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut storage = MemStorage::new();
        let mut grid = Grid::new();
        grid.write_block(&mut storage, b"one").unwrap();
        grid.write_block(&mut storage, b"two").unwrap();

        let (free_set, index) = grid.snapshot();
        let restored = Grid::from_snapshot(&free_set, &index).unwrap();
        assert_eq!(restored, grid);
    }

    #[test]
    fn inconsistent_snapshot_is_rejected() {
        let mut storage = MemStorage::new();
        let mut grid = Grid::new();
        grid.write_block(&mut storage, b"one").unwrap();
        let (free_set, mut index) = grid.snapshot();
        index.clear(); // index no longer matches the bitmap
        assert!(Grid::from_snapshot(&free_set, &index).is_none());
    }
}
