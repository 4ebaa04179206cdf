//! Incremental frame decoding for stream transports.
//!
//! A frame is exactly one encoded message; the header's `size` field
//! delimits it. The buffer accumulates bytes from a nonblocking socket
//! and yields validated messages as they complete. Garbage on the
//! stream (a header that fails validation) poisons the connection —
//! resynchronizing inside a corrupt TCP stream is not worth the
//! ambiguity, the peer simply reconnects.

use corundum_types::constants::HEADER_SIZE;
use corundum_types::ClusterId;

use crate::{Header, Message, WireError};

/// Accumulates stream bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameBuffer {
    cluster: ClusterId,
    buffer: Vec<u8>,
    poisoned: bool,
}

impl FrameBuffer {
    pub fn new(cluster: ClusterId) -> Self {
        Self {
            cluster,
            buffer: Vec::new(),
            poisoned: false,
        }
    }

    /// Appends bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        if !self.poisoned {
            self.buffer.extend_from_slice(bytes);
        }
    }

    /// Returns true once the stream has produced an invalid frame.
    pub fn poisoned(&self) -> bool {
        self.poisoned
    }

    /// Pops the next complete message, if one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed. An `Err` poisons the
    /// buffer; the caller should drop the connection.
    pub fn next_message(&mut self) -> Result<Option<Message>, WireError> {
        if self.poisoned {
            return Err(WireError::HeaderInvalid);
        }
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = match Header::decode(&self.buffer[..HEADER_SIZE]) {
            Some(header) => header,
            None => {
                self.poisoned = true;
                return Err(WireError::HeaderInvalid);
            }
        };

        let frame_len = header.size as usize;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buffer.drain(..frame_len).collect();
        match Message::decode(self.cluster, &frame) {
            Ok(message) => Ok(Some(message)),
            Err(error) => {
                self.poisoned = true;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Command;
    use bytes::Bytes;

    fn message(cluster: ClusterId, body: &'static [u8]) -> Message {
        let mut header = Header::new(cluster, Command::Ping);
        header.set_checksum_body(body);
        header.set_checksum();
        Message::new(header, Bytes::from_static(body))
    }

    #[test]
    fn yields_messages_across_partial_reads() {
        let cluster = ClusterId::new(1);
        let first = message(cluster, b"one");
        let second = message(cluster, b"two!");
        let stream = [first.encode(), second.encode()].concat();

        let mut frames = FrameBuffer::new(cluster);
        let mut received = Vec::new();
        for chunk in stream.chunks(13) {
            frames.extend(chunk);
            while let Some(msg) = frames.next_message().expect("valid stream") {
                received.push(msg);
            }
        }
        assert_eq!(received, vec![first, second]);
    }

    #[test]
    fn garbage_poisons_the_buffer() {
        let cluster = ClusterId::new(1);
        let mut frames = FrameBuffer::new(cluster);
        frames.extend(&[0xAB; HEADER_SIZE]);
        assert!(frames.next_message().is_err());
        assert!(frames.poisoned());
        // Once poisoned, further bytes are ignored.
        frames.extend(&message(cluster, b"ok").encode());
        assert!(frames.next_message().is_err());
    }
}
