//! Grid liveness bitmap.
//!
//! One bit per grid address: set means acquired (live as of the last
//! checkpoint plus any blocks written since), clear means free.
//! Acquisition happens when the state machine asks for an address;
//! release is deferred to checkpoint boundaries — a block freed by the
//! current checkpoint may still be read by a peer syncing the previous
//! one.

use corundum_types::constants::GRID_BLOCKS_MAX;
use corundum_types::GridAddress;

const WORD_BITS: usize = 64;
const WORDS: usize = GRID_BLOCKS_MAX.div_ceil(WORD_BITS);

/// Fixed-size bitmap over the grid address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSet {
    acquired: [u64; WORDS],
}

impl FreeSet {
    /// A free set with every address free.
    pub fn new() -> Self {
        Self {
            acquired: [0; WORDS],
        }
    }

    pub fn is_free(&self, address: GridAddress) -> bool {
        let index = address.index();
        self.acquired[index / WORD_BITS] & (1 << (index % WORD_BITS)) == 0
    }

    /// Acquires the lowest free address.
    ///
    /// Returns `None` when the grid is full.
    pub fn acquire(&mut self) -> Option<GridAddress> {
        for (word_index, word) in self.acquired.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let index = word_index * WORD_BITS + bit;
                if index >= GRID_BLOCKS_MAX {
                    return None;
                }
                *word |= 1 << bit;
                return Some(GridAddress::from_index(index));
            }
        }
        None
    }

    /// Releases an acquired address.
    ///
    /// # Panics
    ///
    /// Panics if the address is already free — a double release means
    /// the free set and the grid index have diverged, which is a
    /// correctness bug, not a recoverable condition.
    pub fn release(&mut self, address: GridAddress) {
        assert!(
            !self.is_free(address),
            "double release of grid {address}"
        );
        let index = address.index();
        self.acquired[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
    }

    /// Number of acquired addresses.
    pub fn acquired_count(&self) -> usize {
        self.acquired.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Number of free addresses.
    pub fn free_count(&self) -> usize {
        GRID_BLOCKS_MAX - self.acquired_count()
    }

    /// Iterates acquired addresses in address order.
    pub fn iter_acquired(&self) -> impl Iterator<Item = GridAddress> + '_ {
        (0..GRID_BLOCKS_MAX)
            .map(GridAddress::from_index)
            .filter(move |a| !self.is_free(*a))
    }

    /// Snapshot for the superblock trailer.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(WORDS * 8);
        for word in &self.acquired {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Restores a snapshot. An empty snapshot (fresh format) yields an
    /// all-free set.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return Some(Self::new());
        }
        if bytes.len() != WORDS * 8 {
            return None;
        }
        let mut acquired = [0u64; WORDS];
        for (word, chunk) in acquired.iter_mut().zip(bytes.chunks_exact(8)) {
            *word = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        Some(Self { acquired })
    }
}

impl Default for FreeSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_lowest_free() {
        let mut set = FreeSet::new();
        assert_eq!(set.acquire(), Some(GridAddress::new(1)));
        assert_eq!(set.acquire(), Some(GridAddress::new(2)));
        set.release(GridAddress::new(1));
        assert_eq!(set.acquire(), Some(GridAddress::new(1)));
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut set = FreeSet::new();
        for _ in 0..GRID_BLOCKS_MAX {
            assert!(set.acquire().is_some());
        }
        assert_eq!(set.acquire(), None);
        assert_eq!(set.free_count(), 0);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_panics() {
        let mut set = FreeSet::new();
        let address = set.acquire().unwrap();
        set.release(address);
        set.release(address);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut set = FreeSet::new();
        for _ in 0..5 {
            set.acquire();
        }
        set.release(GridAddress::new(3));
        let restored = FreeSet::decode(&set.encode()).unwrap();
        assert_eq!(restored, set);
        assert_eq!(restored.acquired_count(), 4);
    }

    #[test]
    fn empty_snapshot_is_all_free() {
        let set = FreeSet::decode(&[]).unwrap();
        assert_eq!(set.free_count(), GRID_BLOCKS_MAX);
    }
}
