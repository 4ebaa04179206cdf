//! 128-bit content checksums (BLAKE3, truncated).
//!
//! The protocol identifies content by checksum: a prepare by its header
//! checksum, a grid block by its block checksum, a checkpoint by the
//! digest of its superblock state. 128 bits keeps headers compact while
//! making accidental collision negligible; BLAKE3 keeps hashing off the
//! commit-latency critical path.

use corundum_types::Checksum;

/// Computes the 128-bit checksum of `data`.
pub fn checksum(data: &[u8]) -> Checksum {
    let hash = blake3::hash(data);
    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&hash.as_bytes()[..16]);
    Checksum::from_le_bytes(truncated)
}

/// Computes the checksum of the concatenation of two slices without
/// copying them into one buffer.
pub fn checksum_pair(a: &[u8], b: &[u8]) -> Checksum {
    let mut hasher = blake3::Hasher::new();
    hasher.update(a);
    hasher.update(b);
    let hash = hasher.finalize();
    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&hash.as_bytes()[..16]);
    Checksum::from_le_bytes(truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(checksum(b"abc"), checksum(b"abc"));
        assert_ne!(checksum(b"abc"), checksum(b"abd"));
    }

    #[test]
    fn never_zero_for_content() {
        // The zero checksum is reserved for the log root.
        assert!(!checksum(b"").is_zero());
        assert!(!checksum(b"\0\0\0\0").is_zero());
    }

    #[test]
    fn pair_matches_concatenation() {
        let joined = [b"left".as_ref(), b"right".as_ref()].concat();
        assert_eq!(checksum_pair(b"left", b"right"), checksum(&joined));
    }
}
