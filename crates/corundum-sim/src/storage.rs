//! In-memory faulting storage.
//!
//! Backs one replica's data file with plain memory while modelling the
//! fault surface of real disks truthfully:
//!
//! - **Corruption**: bytes flip in place; readers see the corrupt data
//!   and their checksums catch it.
//! - **Read faults**: injected per sector range; reads overlapping a
//!   faulted range report a `StorageFault` instead of data.
//! - **Crash semantics**: unsynced writes are rolled back on
//!   [`SimStorage::crash`], each torn independently at sector
//!   granularity — a prefix of a write's sectors may survive.

use bytes::Bytes;
use corundum_io::{FaultKind, Storage, StorageFault, Zone};
use corundum_types::constants::SECTOR_SIZE;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn zone_index(zone: Zone) -> usize {
    Zone::ALL.iter().position(|z| *z == zone).unwrap()
}

/// One write not yet covered by a sync, with the bytes it replaced.
#[derive(Debug, Clone)]
struct PendingWrite {
    zone: usize,
    offset: usize,
    old: Vec<u8>,
}

/// In-memory zoned storage with fault injection.
#[derive(Debug, Clone)]
pub struct SimStorage {
    zones: Vec<Vec<u8>>,
    pending: Vec<PendingWrite>,
    /// Sector ranges (zone, sector index) that fault on read.
    read_faults: std::collections::HashSet<(usize, usize)>,
    rng: ChaCha8Rng,
}

impl SimStorage {
    pub fn new(seed: u64) -> Self {
        Self {
            zones: Zone::ALL
                .iter()
                .map(|zone| vec![0u8; zone.size() as usize])
                .collect(),
            pending: Vec::new(),
            read_faults: std::collections::HashSet::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    // ========================================================================
    // Fault injection (harness controls)
    // ========================================================================

    /// Flips bytes in place. Readers observe the corruption; their
    /// checksums are what detects it.
    pub fn corrupt(&mut self, zone: Zone, offset: usize, len: usize) {
        let data = &mut self.zones[zone_index(zone)];
        for byte in &mut data[offset..(offset + len).min(zone.size() as usize)] {
            *byte ^= 0xA5;
        }
    }

    /// Corrupts one cell of a zone.
    pub fn corrupt_cell(&mut self, zone: Zone, index: usize) {
        self.corrupt(zone, index * zone.cell_size(), zone.cell_size());
    }

    /// Corrupts an entire zone.
    pub fn corrupt_zone(&mut self, zone: Zone) {
        self.corrupt(zone, 0, zone.size() as usize);
    }

    /// Makes reads overlapping the range report faults.
    pub fn inject_read_fault(&mut self, zone: Zone, offset: usize, len: usize) {
        let first = offset / SECTOR_SIZE;
        let last = (offset + len - 1) / SECTOR_SIZE;
        for sector in first..=last {
            self.read_faults.insert((zone_index(zone), sector));
        }
    }

    pub fn clear_read_faults(&mut self) {
        self.read_faults.clear();
    }

    /// Crash: every unsynced write is rolled back, torn independently
    /// at sector granularity — a random prefix of its sectors may
    /// survive.
    pub fn crash(&mut self) {
        let pending: Vec<PendingWrite> = self.pending.drain(..).rev().collect();
        for write in pending {
            let sectors = write.old.len().div_ceil(SECTOR_SIZE);
            let surviving = if sectors <= 1 {
                // A single-sector write is atomic: all or nothing.
                if self.rng.gen_bool(0.5) { sectors } else { 0 }
            } else {
                self.rng.gen_range(0..=sectors)
            };
            let keep_bytes = (surviving * SECTOR_SIZE).min(write.old.len());
            let data = &mut self.zones[write.zone];
            data[write.offset + keep_bytes..write.offset + write.old.len()]
                .copy_from_slice(&write.old[keep_bytes..]);
        }
    }

    /// Raw zone bytes, for byte-level comparisons in tests.
    pub fn zone_bytes(&self, zone: Zone) -> &[u8] {
        &self.zones[zone_index(zone)]
    }
}

impl Storage for SimStorage {
    fn read(&mut self, zone: Zone, offset: u64, len: usize) -> Result<Bytes, StorageFault> {
        let zi = zone_index(zone);
        let start = offset as usize;
        assert!(start + len <= zone.size() as usize, "read beyond zone");

        let first = start / SECTOR_SIZE;
        let last = (start + len).saturating_sub(1) / SECTOR_SIZE;
        for sector in first..=last {
            if self.read_faults.contains(&(zi, sector)) {
                return Err(StorageFault {
                    kind: FaultKind::Read,
                    zone,
                    offset,
                });
            }
        }
        Ok(Bytes::copy_from_slice(&self.zones[zi][start..start + len]))
    }

    fn write(&mut self, zone: Zone, offset: u64, data: &[u8]) -> Result<(), StorageFault> {
        let zi = zone_index(zone);
        let start = offset as usize;
        assert!(start + data.len() <= zone.size() as usize, "write beyond zone");

        self.pending.push(PendingWrite {
            zone: zi,
            offset: start,
            old: self.zones[zi][start..start + data.len()].to_vec(),
        });
        self.zones[zi][start..start + data.len()].copy_from_slice(data);
        // A write over a previously faulted sector rewrites it whole.
        let first = start / SECTOR_SIZE;
        let last = (start + data.len()).saturating_sub(1) / SECTOR_SIZE;
        for sector in first..=last {
            self.read_faults.remove(&(zi, sector));
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageFault> {
        self.pending.clear();
        Ok(())
    }
}
