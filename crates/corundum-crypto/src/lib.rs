//! # corundum-crypto: Integrity primitives for Corundum
//!
//! Two digests, two jobs:
//!
//! - [`crc32`]: table-driven CRC32 (IEEE 802.3) for small fixed-layout
//!   cells (superblock copies, reply-cache slots) where a 4-byte check
//!   value is enough and auditability matters.
//! - [`checksum`]: BLAKE3 truncated to 128 bits for message headers,
//!   bodies, grid blocks, and checkpoint ids — everywhere a checksum is
//!   also an identity.

pub mod crc32;

mod checksum;

pub use checksum::{checksum, checksum_pair};
pub use crc32::crc32;
