//! Background grid scrubber.
//!
//! The scrubber tours every live block (per the current free set) at a
//! bounded rate, re-reading and verifying checksums. Corruption found
//! by the tour is marked faulty and queued for repair from peers;
//! repairs shrink the faulty set, so under no new faults the faulty
//! count is non-increasing — a property the test suite checks.
//!
//! # Design
//!
//! - **Tour-based**: sweeps the whole live address space, then begins a
//!   new tour.
//! - **PRNG-based origin**: each tour starts at a randomized address so
//!   replicas don't scrub the same region simultaneously.
//! - **Rate-limited**: at most [`SCRUB_READS_PER_STEP`] block reads per
//!   step, reserving I/O for production traffic.
//!
//! Latent sector errors are predominantly found by scrubbers rather
//! than by foreground reads; scrubbing while all replicas are healthy
//! is what keeps a later double fault from becoming data loss.

use corundum_io::Storage;
use corundum_types::constants::GRID_BLOCKS_MAX;
use corundum_types::{GridAddress, ReplicaId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;

use crate::{BlockId, Grid, GridError};

/// Block reads allowed per scrub step.
pub const SCRUB_READS_PER_STEP: usize = 4;

/// Result of one scrub step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrubResult {
    /// All blocks touched this step verified clean.
    Clean { scrubbed: usize },
    /// Corruption found; the addresses are now queued for repair.
    Corrupt { addresses: Vec<GridAddress> },
    /// The tour wrapped; a new tour has begun.
    TourComplete,
}

/// Tour state and the faulty-block queue.
#[derive(Debug, Clone)]
pub struct GridScrubber {
    replica: ReplicaId,
    /// Zero-based cursor into the address space.
    cursor: usize,
    origin: usize,
    tour_count: u64,
    /// Addresses remaining in this tour.
    remaining: usize,
    /// Blocks that failed verification and await repair.
    faulty: BTreeSet<GridAddress>,
}

impl GridScrubber {
    pub fn new(replica: ReplicaId) -> Self {
        let origin = Self::randomize_origin(replica, 0);
        Self {
            replica,
            cursor: origin,
            origin,
            tour_count: 0,
            remaining: GRID_BLOCKS_MAX,
            faulty: BTreeSet::new(),
        }
    }

    /// Deterministic per-(replica, tour) origin; prevents all replicas
    /// from sweeping the same region at once.
    fn randomize_origin(replica: ReplicaId, tour_count: u64) -> usize {
        let seed = (u64::from(replica.as_u8()) << 32) | tour_count;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.gen_range(0..GRID_BLOCKS_MAX)
    }

    /// Runs one bounded scrub step over the grid.
    pub fn step<S: Storage>(&mut self, storage: &mut S, grid: &Grid) -> ScrubResult {
        let mut scrubbed = 0;
        let mut corrupt = Vec::new();

        while scrubbed < SCRUB_READS_PER_STEP {
            if self.remaining == 0 {
                self.start_new_tour();
                return ScrubResult::TourComplete;
            }
            let address = GridAddress::from_index(self.cursor);
            self.cursor = (self.cursor + 1) % GRID_BLOCKS_MAX;
            self.remaining -= 1;

            if grid.lookup(address).is_none() {
                continue; // free address, nothing to verify
            }
            scrubbed += 1;
            match grid.read_block(storage, address) {
                Ok(_) => {
                    // A block that re-verifies was either never faulty
                    // or has been repaired behind our back.
                    self.faulty.remove(&address);
                }
                Err(GridError::ChecksumMismatch { .. } | GridError::Fault(_)) => {
                    if self.faulty.insert(address) {
                        tracing::warn!(
                            replica = %self.replica,
                            %address,
                            tour = self.tour_count,
                            "scrubber detected corrupt grid block"
                        );
                    }
                    corrupt.push(address);
                }
                Err(error) => {
                    // NotLive cannot happen (checked above); treat any
                    // other error as a fault to stay monotone.
                    tracing::warn!(%address, %error, "unexpected scrub error");
                    self.faulty.insert(address);
                    corrupt.push(address);
                }
            }
        }

        if corrupt.is_empty() {
            ScrubResult::Clean { scrubbed }
        } else {
            ScrubResult::Corrupt { addresses: corrupt }
        }
    }

    fn start_new_tour(&mut self) {
        self.tour_count += 1;
        self.origin = Self::randomize_origin(self.replica, self.tour_count);
        self.cursor = self.origin;
        self.remaining = GRID_BLOCKS_MAX;
        tracing::debug!(
            replica = %self.replica,
            tour = self.tour_count,
            origin = self.origin,
            "starting new grid scrub tour"
        );
    }

    /// The next faulty block to repair, with its expected content id.
    pub fn next_repair(&self, grid: &Grid) -> Option<BlockId> {
        self.faulty.iter().find_map(|&address| {
            grid.lookup(address)
                .map(|checksum| BlockId { address, checksum })
        })
    }

    /// Records that a block was repaired (or released).
    pub fn mark_repaired(&mut self, address: GridAddress) {
        self.faulty.remove(&address);
    }

    /// Drops faulty entries for addresses that are no longer live.
    pub fn retain_live(&mut self, grid: &Grid) {
        self.faulty.retain(|address| grid.lookup(*address).is_some());
    }

    pub fn faulty_count(&self) -> usize {
        self.faulty.len()
    }

    pub fn tour_count(&self) -> u64 {
        self.tour_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use corundum_io::{StorageFault, Zone};
    use corundum_types::constants::GRID_BLOCK_SIZE;

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
            for byte in &mut self.data[start + 4..start + 32] {
                *byte ^= 0xFF;
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

    fn run_full_tour(
        scrubber: &mut GridScrubber,
        storage: &mut MemStorage,
        grid: &Grid,
    ) {
        loop {
            if scrubber.step(storage, grid) == ScrubResult::TourComplete {
                break;
            }
        }
    }

    #[test]
    fn clean_grid_scrubs_clean() {
        let mut storage = MemStorage::new();
        let mut grid = Grid::new();
        for i in 0..8u8 {
            grid.write_block(&mut storage, &[i; 100]).unwrap();
        }
        let mut scrubber = GridScrubber::new(ReplicaId::new(0));
        run_full_tour(&mut scrubber, &mut storage, &grid);
        assert_eq!(scrubber.faulty_count(), 0);
        assert_eq!(scrubber.tour_count(), 1);
    }

    #[test]
    fn tour_finds_all_corruption() {
        let mut storage = MemStorage::new();
        let mut grid = Grid::new();
        let mut ids = Vec::new();
        for i in 0..8u8 {
            ids.push(grid.write_block(&mut storage, &[i; 100]).unwrap());
        }
        storage.corrupt_block(ids[2].address);
        storage.corrupt_block(ids[5].address);

        let mut scrubber = GridScrubber::new(ReplicaId::new(0));
        run_full_tour(&mut scrubber, &mut storage, &grid);
        assert_eq!(scrubber.faulty_count(), 2);
    }

    #[test]
    fn repair_shrinks_faulty_set_monotonically() {
        let mut storage = MemStorage::new();
        let mut grid = Grid::new();
        let id = grid.write_block(&mut storage, b"payload").unwrap();
        storage.corrupt_block(id.address);

        let mut scrubber = GridScrubber::new(ReplicaId::new(0));
        run_full_tour(&mut scrubber, &mut storage, &grid);
        assert_eq!(scrubber.faulty_count(), 1);

        let repair = scrubber.next_repair(&grid).unwrap();
        assert_eq!(repair.address, id.address);
        assert_eq!(repair.checksum, id.checksum);

        grid.repair_block(&mut storage, id.address, b"payload").unwrap();
        scrubber.mark_repaired(id.address);
        assert_eq!(scrubber.faulty_count(), 0);

        // The next tour confirms the repair and stays at zero.
        run_full_tour(&mut scrubber, &mut storage, &grid);
        assert_eq!(scrubber.faulty_count(), 0);
    }

    #[test]
    fn origins_differ_across_replicas() {
        let origins: BTreeSet<usize> = (0..8u8)
            .map(|id| GridScrubber::new(ReplicaId::new(id)).origin)
            .collect();
        assert!(origins.len() > 1, "origins should not all coincide");
    }
}
