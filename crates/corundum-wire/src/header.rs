//! The fixed 128-byte message header.
//!
//! # Layout (little-endian, no implicit padding)
//!
//! ```text
//! [0..16)    checksum        u128  over header bytes [16..128)
//! [16..32)   checksum_body   u128  over the body
//! [32..48)   parent          u128  checksum of the prepare at op-1
//! [48..64)   cluster         u128
//! [64..72)   client          u64
//! [72..80)   op              u64
//! [80..88)   commit          u64
//! [88..96)   timestamp       u64
//! [96..104)  request         u64
//! [104..108) view            u32
//! [108..112) size            u32   header + body length
//! [112..116) release         u32
//! [116]      command         u8
//! [117]      operation       u8
//! [118]      replica         u8
//! [119..128) reserved        zeroes
//! ```
//!
//! Two checksums allow independent validation of header and body: a
//! torn write can invalidate the body while the header still parses,
//! which recovery treats as a torn (not faulty) slot.

use corundum_crypto::checksum;
use corundum_types::constants::{HEADER_SIZE, MESSAGE_SIZE_MAX};
use corundum_types::{
    Checksum, ClientId, ClusterId, CommitNumber, OpNumber, Release, ReplicaId, RequestNumber,
    Timestamp, ViewNumber,
};

use crate::{Command, Operation};

/// A parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Checksum over header bytes `[16..128)`.
    pub checksum: Checksum,
    /// Checksum over the message body.
    pub checksum_body: Checksum,
    /// Checksum of the prepare at `op - 1` (hash chain link).
    pub parent: Checksum,
    pub cluster: ClusterId,
    pub client: ClientId,
    pub op: OpNumber,
    pub commit: CommitNumber,
    pub timestamp: Timestamp,
    pub request: RequestNumber,
    pub view: ViewNumber,
    /// Total message size: `HEADER_SIZE + body.len()`.
    pub size: u32,
    pub release: Release,
    pub command: Command,
    pub operation: Operation,
    pub replica: ReplicaId,
}

impl Header {
    /// Builds a header for `command` with every protocol field zeroed.
    ///
    /// Callers fill in the fields their command carries, then call
    /// [`Header::set_checksum_body`] and [`Header::set_checksum`].
    pub fn new(cluster: ClusterId, command: Command) -> Self {
        Self {
            checksum: Checksum::ZERO,
            checksum_body: Checksum::ZERO,
            parent: Checksum::ZERO,
            cluster,
            client: ClientId::NONE,
            op: OpNumber::ZERO,
            commit: CommitNumber::ZERO,
            timestamp: Timestamp::EPOCH,
            request: RequestNumber::ZERO,
            view: ViewNumber::ZERO,
            size: HEADER_SIZE as u32,
            release: Release::ZERO,
            command,
            operation: Operation::NOOP,
            replica: ReplicaId::new(0),
        }
    }

    /// Body length implied by `size`.
    pub fn body_len(&self) -> usize {
        self.size as usize - HEADER_SIZE
    }

    /// Sets `checksum_body` and `size` from the body bytes.
    pub fn set_checksum_body(&mut self, body: &[u8]) {
        assert!(
            HEADER_SIZE + body.len() <= MESSAGE_SIZE_MAX,
            "body of {} bytes exceeds message bound",
            body.len()
        );
        self.size = (HEADER_SIZE + body.len()) as u32;
        self.checksum_body = checksum(body);
    }

    /// Seals the header: computes `checksum` over the encoded covered
    /// region. Must be called after every other field is final.
    pub fn set_checksum(&mut self) {
        let encoded = self.encode();
        self.checksum = checksum(&encoded[16..]);
    }

    /// Returns true if `checksum` matches the covered region.
    pub fn valid_checksum(&self) -> bool {
        let encoded = self.encode();
        self.checksum == checksum(&encoded[16..])
    }

    /// Returns true if `checksum_body` matches `body`.
    pub fn valid_checksum_body(&self, body: &[u8]) -> bool {
        body.len() == self.body_len() && self.checksum_body == checksum(body)
    }

    /// Encodes the header into its fixed 128-byte layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..16].copy_from_slice(&self.checksum.to_le_bytes());
        buf[16..32].copy_from_slice(&self.checksum_body.to_le_bytes());
        buf[32..48].copy_from_slice(&self.parent.to_le_bytes());
        buf[48..64].copy_from_slice(&self.cluster.as_u128().to_le_bytes());
        buf[64..72].copy_from_slice(&self.client.as_u64().to_le_bytes());
        buf[72..80].copy_from_slice(&self.op.as_u64().to_le_bytes());
        buf[80..88].copy_from_slice(&self.commit.as_u64().to_le_bytes());
        buf[88..96].copy_from_slice(&self.timestamp.as_nanos().to_le_bytes());
        buf[96..104].copy_from_slice(&self.request.as_u64().to_le_bytes());
        buf[104..108].copy_from_slice(&self.view.as_u32().to_le_bytes());
        buf[108..112].copy_from_slice(&self.size.to_le_bytes());
        buf[112..116].copy_from_slice(&self.release.as_u32().to_le_bytes());
        buf[116] = self.command.as_u8();
        buf[117] = self.operation.as_u8();
        buf[118] = self.replica.as_u8();
        // [119..128) reserved, zero
        buf
    }

    /// Decodes a header from its fixed layout.
    ///
    /// Returns `None` when the bytes cannot be a header at all (wrong
    /// length, unknown command, size out of bounds, nonzero reserved
    /// bytes) or when the header checksum does not match. A decoded
    /// header is therefore always internally consistent; body validity
    /// is checked separately.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HEADER_SIZE {
            return None;
        }

        let command = Command::from_u8(bytes[116])?;
        let size = u32::from_le_bytes(bytes[108..112].try_into().unwrap());
        if (size as usize) < HEADER_SIZE || size as usize > MESSAGE_SIZE_MAX {
            return None;
        }
        if bytes[119..128].iter().any(|&b| b != 0) {
            return None;
        }

        let header = Self {
            checksum: Checksum::from_le_bytes(bytes[0..16].try_into().unwrap()),
            checksum_body: Checksum::from_le_bytes(bytes[16..32].try_into().unwrap()),
            parent: Checksum::from_le_bytes(bytes[32..48].try_into().unwrap()),
            cluster: ClusterId::new(u128::from_le_bytes(bytes[48..64].try_into().unwrap())),
            client: ClientId::new(u64::from_le_bytes(bytes[64..72].try_into().unwrap())),
            op: OpNumber::new(u64::from_le_bytes(bytes[72..80].try_into().unwrap())),
            commit: CommitNumber::new(OpNumber::new(u64::from_le_bytes(
                bytes[80..88].try_into().unwrap(),
            ))),
            timestamp: Timestamp::from_nanos(u64::from_le_bytes(bytes[88..96].try_into().unwrap())),
            request: RequestNumber::new(u64::from_le_bytes(bytes[96..104].try_into().unwrap())),
            view: ViewNumber::new(u32::from_le_bytes(bytes[104..108].try_into().unwrap())),
            size,
            release: Release::new(u32::from_le_bytes(bytes[112..116].try_into().unwrap())),
            command,
            operation: Operation::new(bytes[117]),
            replica: ReplicaId::new(bytes[118]),
        };

        if !header.valid_checksum() {
            return None;
        }
        Some(header)
    }

    /// Returns true if `bytes` is an all-zero cell (a formatted, never
    /// written WAL slot).
    pub fn is_zeroed_cell(bytes: &[u8]) -> bool {
        bytes.len() == HEADER_SIZE && bytes.iter().all(|&b| b == 0)
    }
}

// ============================================================================
// Header lists (do_view_change / start_view / headers bodies)
// ============================================================================

/// Encodes a list of headers by concatenation.
pub fn encode_headers(headers: &[Header]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(headers.len() * HEADER_SIZE);
    for header in headers {
        buf.extend_from_slice(&header.encode());
    }
    buf
}

/// Decodes a concatenated header list, rejecting any entry that fails
/// header validation.
pub fn decode_headers(bytes: &[u8]) -> Option<Vec<Header>> {
    if bytes.len() % HEADER_SIZE != 0 {
        return None;
    }
    bytes
        .chunks_exact(HEADER_SIZE)
        .map(Header::decode)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_header() -> Header {
        let mut header = Header::new(ClusterId::new(7), Command::Prepare);
        header.op = OpNumber::new(42);
        header.view = ViewNumber::new(3);
        header.operation = Operation::new(Operation::APPLICATION_MIN);
        header.set_checksum_body(b"payload");
        header.set_checksum();
        header
    }

    #[test]
    fn encode_decode_roundtrip() {
        let header = sealed_header();
        let decoded = Header::decode(&header.encode()).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn decode_rejects_corrupt_checksum() {
        let header = sealed_header();
        let mut bytes = header.encode();
        bytes[80] ^= 0xFF; // flip a commit byte, invalidating the checksum
        assert!(Header::decode(&bytes).is_none());
    }

    #[test]
    fn decode_rejects_unknown_command() {
        let header = sealed_header();
        let mut bytes = header.encode();
        bytes[116] = 0xEE;
        assert!(Header::decode(&bytes).is_none());
    }

    #[test]
    fn body_checksum_is_independent_of_header() {
        let header = sealed_header();
        assert!(header.valid_checksum());
        assert!(header.valid_checksum_body(b"payload"));
        // A zeroed body (torn tail) fails the body check while the
        // header still parses.
        assert!(!header.valid_checksum_body(&[0u8; 7]));
        assert!(Header::decode(&header.encode()).is_some());
    }

    #[test]
    fn header_list_roundtrip() {
        let a = sealed_header();
        let mut b = sealed_header();
        b.op = OpNumber::new(43);
        b.set_checksum();
        let encoded = encode_headers(&[a, b]);
        let decoded = decode_headers(&encoded).expect("decode list");
        assert_eq!(decoded, vec![a, b]);
        assert!(decode_headers(&encoded[1..]).is_none());
    }

    #[test]
    fn zeroed_cell_detection() {
        assert!(Header::is_zeroed_cell(&[0u8; HEADER_SIZE]));
        assert!(!Header::is_zeroed_cell(&sealed_header().encode()));
    }
}
