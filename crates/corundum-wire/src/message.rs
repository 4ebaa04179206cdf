//! Message envelope and validation.

use bytes::Bytes;
use corundum_types::constants::{HEADER_SIZE, MESSAGE_SIZE_MAX};
use corundum_types::ClusterId;
use thiserror::Error;

use crate::Header;

/// Why a received buffer was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("message shorter than a header")]
    Truncated,
    #[error("header invalid (checksum, command, or size)")]
    HeaderInvalid,
    #[error("body length {actual} does not match header size field {expected}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("body checksum mismatch")]
    BodyInvalid,
    #[error("message from foreign cluster")]
    WrongCluster,
}

/// A validated protocol message: header plus opaque body.
///
/// Constructing a `Message` through [`Message::new`] or
/// [`Message::decode`] guarantees both checksums hold; everything
/// downstream can trust the header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    body: Bytes,
}

impl Message {
    /// Wraps a sealed header and its body.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the header was not sealed against this
    /// body — sending an unsealed message is a programming error, not a
    /// runtime condition.
    pub fn new(header: Header, body: Bytes) -> Self {
        debug_assert!(header.valid_checksum(), "header not sealed");
        debug_assert!(
            header.valid_checksum_body(&body),
            "body does not match header"
        );
        Self { header, body }
    }

    /// Builds a body-less message from a sealed header.
    pub fn from_header(mut header: Header) -> Self {
        if header.size as usize != HEADER_SIZE {
            header.set_checksum_body(&[]);
            header.set_checksum();
        }
        debug_assert!(header.valid_checksum());
        Self {
            header,
            body: Bytes::new(),
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Total encoded size.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Encodes the message as `header || body`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decodes and fully validates a message for `cluster`.
    ///
    /// Validity requires: header checksum, known command, size within
    /// bounds, matching body length, body checksum, and matching
    /// cluster id.
    pub fn decode(cluster: ClusterId, bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        if bytes.len() > MESSAGE_SIZE_MAX {
            return Err(WireError::SizeMismatch {
                expected: MESSAGE_SIZE_MAX,
                actual: bytes.len(),
            });
        }
        let header = Header::decode(&bytes[..HEADER_SIZE]).ok_or(WireError::HeaderInvalid)?;
        if header.size as usize != bytes.len() {
            return Err(WireError::SizeMismatch {
                expected: header.size as usize,
                actual: bytes.len(),
            });
        }
        let body = &bytes[HEADER_SIZE..];
        if !header.valid_checksum_body(body) {
            return Err(WireError::BodyInvalid);
        }
        if header.cluster != cluster {
            return Err(WireError::WrongCluster);
        }
        Ok(Self {
            header,
            body: Bytes::copy_from_slice(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Command, Header};

    fn message(cluster: ClusterId) -> Message {
        let mut header = Header::new(cluster, Command::Request);
        header.set_checksum_body(b"hello");
        header.set_checksum();
        Message::new(header, Bytes::from_static(b"hello"))
    }

    #[test]
    fn encode_decode_roundtrip() {
        let cluster = ClusterId::new(11);
        let msg = message(cluster);
        let decoded = Message::decode(cluster, &msg.encode()).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_rejects_wrong_cluster() {
        let msg = message(ClusterId::new(11));
        let err = Message::decode(ClusterId::new(12), &msg.encode()).unwrap_err();
        assert_eq!(err, WireError::WrongCluster);
    }

    #[test]
    fn decode_rejects_flipped_body_bit() {
        let cluster = ClusterId::new(11);
        let mut bytes = message(cluster).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert_eq!(
            Message::decode(cluster, &bytes).unwrap_err(),
            WireError::BodyInvalid
        );
    }

    #[test]
    fn decode_rejects_truncation() {
        let cluster = ClusterId::new(11);
        let bytes = message(cluster).encode();
        assert_eq!(
            Message::decode(cluster, &bytes[..HEADER_SIZE - 1]).unwrap_err(),
            WireError::Truncated
        );
        // Truncating the body invalidates the size field.
        assert!(matches!(
            Message::decode(cluster, &bytes[..bytes.len() - 2]).unwrap_err(),
            WireError::SizeMismatch { .. }
        ));
    }
}
