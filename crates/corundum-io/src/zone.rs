//! Zone layout of the replica data file.
//!
//! The file is a fixed partition; offsets are computed, never stored.
//! Layout (all sizes derive from `corundum_types::constants`):
//!
//! ```text
//! Offset                        Zone            Size
//! ──────────────────────────────────────────────────────────────────
//! 0                             superblock      SUPERBLOCK_COPIES × SUPERBLOCK_COPY_SIZE
//! superblock.end                wal_headers     SLOT_COUNT × HEADER_SIZE
//! wal_headers.end               wal_prepares    SLOT_COUNT × MESSAGE_SIZE_MAX
//! wal_prepares.end              client_replies  CLIENTS_MAX × MESSAGE_SIZE_MAX
//! client_replies.end            grid            GRID_BLOCKS_MAX × GRID_BLOCK_SIZE
//! ```

use corundum_types::constants::{
    CLIENTS_MAX, GRID_BLOCKS_MAX, GRID_BLOCK_SIZE, HEADER_SIZE, MESSAGE_SIZE_MAX, SECTOR_SIZE,
    SLOT_COUNT, SUPERBLOCK_COPIES, SUPERBLOCK_COPY_SIZE,
};

/// A fixed region of the replica data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Zone {
    /// Quorum-replicated superblock copies.
    Superblock,
    /// Dense ring of prepare headers, one per WAL slot.
    WalHeaders,
    /// Prepare bodies (full messages), one slot per WAL entry.
    WalPrepares,
    /// Persisted client replies, one slot per session.
    ClientReplies,
    /// Content-addressed block storage.
    Grid,
}

impl Zone {
    /// All zones in file order.
    pub const ALL: [Zone; 5] = [
        Zone::Superblock,
        Zone::WalHeaders,
        Zone::WalPrepares,
        Zone::ClientReplies,
        Zone::Grid,
    ];

    /// Size of one cell in this zone.
    pub const fn cell_size(self) -> usize {
        match self {
            Zone::Superblock => SUPERBLOCK_COPY_SIZE,
            Zone::WalHeaders => HEADER_SIZE,
            Zone::WalPrepares => MESSAGE_SIZE_MAX,
            Zone::ClientReplies => MESSAGE_SIZE_MAX,
            Zone::Grid => GRID_BLOCK_SIZE,
        }
    }

    /// Number of cells in this zone.
    pub const fn cell_count(self) -> usize {
        match self {
            Zone::Superblock => SUPERBLOCK_COPIES,
            Zone::WalHeaders => SLOT_COUNT,
            Zone::WalPrepares => SLOT_COUNT,
            Zone::ClientReplies => CLIENTS_MAX,
            Zone::Grid => GRID_BLOCKS_MAX,
        }
    }

    /// Total zone size in bytes.
    pub const fn size(self) -> u64 {
        (self.cell_size() * self.cell_count()) as u64
    }

    /// Byte offset of this zone within the data file.
    pub const fn start(self) -> u64 {
        match self {
            Zone::Superblock => 0,
            Zone::WalHeaders => Zone::Superblock.start() + Zone::Superblock.size(),
            Zone::WalPrepares => Zone::WalHeaders.start() + Zone::WalHeaders.size(),
            Zone::ClientReplies => Zone::WalPrepares.start() + Zone::WalPrepares.size(),
            Zone::Grid => Zone::ClientReplies.start() + Zone::ClientReplies.size(),
        }
    }

    /// Byte offset of cell `index` within the data file.
    pub fn offset(self, index: usize) -> u64 {
        assert!(
            index < self.cell_count(),
            "cell {index} out of range for zone {self:?}"
        );
        self.start() + (index * self.cell_size()) as u64
    }

    pub fn name(self) -> &'static str {
        match self {
            Zone::Superblock => "superblock",
            Zone::WalHeaders => "wal_headers",
            Zone::WalPrepares => "wal_prepares",
            Zone::ClientReplies => "client_replies",
            Zone::Grid => "grid",
        }
    }
}

/// Total size of the replica data file.
pub const DATA_FILE_SIZE: u64 = Zone::Grid.start() + Zone::Grid.size();

const _: () = assert!(DATA_FILE_SIZE % SECTOR_SIZE as u64 == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zones_are_contiguous_and_disjoint() {
        let mut expected_start = 0u64;
        for zone in Zone::ALL {
            assert_eq!(zone.start(), expected_start, "{zone:?}");
            expected_start += zone.size();
        }
        assert_eq!(expected_start, DATA_FILE_SIZE);
    }

    #[test]
    fn cell_offsets_stay_in_zone() {
        for zone in Zone::ALL {
            let last = zone.cell_count() - 1;
            let end = zone.offset(last) + zone.cell_size() as u64;
            assert!(end <= zone.start() + zone.size());
        }
    }

    #[test]
    fn cells_are_sector_aligned() {
        for zone in Zone::ALL {
            assert_eq!(zone.start() % SECTOR_SIZE as u64, 0, "{zone:?}");
            assert_eq!(zone.cell_size() % SECTOR_SIZE, 0, "{zone:?}");
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn offset_rejects_out_of_range_cell() {
        let _ = Zone::Superblock.offset(Zone::Superblock.cell_count());
    }
}
