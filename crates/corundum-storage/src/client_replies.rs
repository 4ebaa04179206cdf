//! Persisted client replies.
//!
//! One `MESSAGE_SIZE_MAX` cell per session slot holds the latest reply
//! message for that session. Replies are rewritten in place — the slot
//! is an at-most-once cache, not a log. A corrupt slot is repaired by
//! asking a peer for the reply (`request_reply`), identified by the
//! reply checksum recorded in the session table.

use corundum_io::{Storage, StorageFault, Zone};
use corundum_types::constants::{CLIENTS_MAX, HEADER_SIZE, MESSAGE_SIZE_MAX};
use corundum_types::{Checksum, ClusterId};
use corundum_wire::{Command, Header, Message};

/// Result of reading a reply slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyRead {
    Ok(Message),
    /// The slot holds no valid reply (never written or corrupt).
    Missing,
}

/// Namespace for reply-cache operations; the session table in
/// `corundum-vsr` owns slot assignment.
pub struct ClientReplies;

impl ClientReplies {
    /// Zeroes every reply slot's header region so reads classify them
    /// as missing.
    pub fn format<S: Storage>(storage: &mut S) -> Result<(), StorageFault> {
        let zero_header = [0u8; HEADER_SIZE];
        for slot in 0..CLIENTS_MAX {
            storage.write(
                Zone::ClientReplies,
                (slot * MESSAGE_SIZE_MAX) as u64,
                &zero_header,
            )?;
        }
        storage.sync()
    }

    /// Durably writes a reply into a session slot.
    pub fn write_reply<S: Storage>(
        storage: &mut S,
        slot: usize,
        reply: &Message,
    ) -> Result<(), StorageFault> {
        assert_eq!(reply.header().command, Command::Reply);
        assert!(slot < CLIENTS_MAX);
        storage.write_cell(Zone::ClientReplies, slot, &reply.encode())?;
        storage.sync()
    }

    /// Reads the reply in a session slot, validating both checksums.
    pub fn read_reply<S: Storage>(storage: &mut S, cluster: ClusterId, slot: usize) -> ReplyRead {
        assert!(slot < CLIENTS_MAX);
        let cell = match storage.read_cell(Zone::ClientReplies, slot) {
            Ok(cell) => cell,
            Err(fault) => {
                tracing::debug!(slot, %fault, "reply slot read fault");
                return ReplyRead::Missing;
            }
        };
        let Some(header) = Header::decode(&cell[..HEADER_SIZE]) else {
            return ReplyRead::Missing;
        };
        if header.command != Command::Reply || header.size as usize > cell.len() {
            return ReplyRead::Missing;
        }
        match Message::decode(cluster, &cell[..header.size as usize]) {
            Ok(message) => ReplyRead::Ok(message),
            Err(_) => ReplyRead::Missing,
        }
    }

    /// Reads a reply only if it matches an expected checksum — used
    /// when serving a peer's `request_reply`.
    pub fn read_reply_if<S: Storage>(
        storage: &mut S,
        cluster: ClusterId,
        slot: usize,
        expected: Checksum,
    ) -> ReplyRead {
        match Self::read_reply(storage, cluster, slot) {
            ReplyRead::Ok(message) if message.header().checksum == expected => {
                ReplyRead::Ok(message)
            }
            _ => ReplyRead::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use corundum_types::{ClientId, OpNumber, RequestNumber};

    struct MemStorage {
        data: Vec<u8>,
        corrupt_reads: bool,
    }

    impl MemStorage {
        fn new() -> Self {
            Self {
                data: vec![0u8; Zone::ClientReplies.size() as usize],
                corrupt_reads: false,
            }
        }
    }

    impl Storage for MemStorage {
        fn read(&mut self, zone: Zone, offset: u64, len: usize) -> Result<Bytes, StorageFault> {
            assert_eq!(zone, Zone::ClientReplies);
            let start = offset as usize;
            let mut bytes = self.data[start..start + len].to_vec();
            if self.corrupt_reads {
                bytes.iter_mut().for_each(|b| *b ^= 0x0F);
            }
            Ok(Bytes::from(bytes))
        }

        fn write(&mut self, zone: Zone, offset: u64, data: &[u8]) -> Result<(), StorageFault> {
            assert_eq!(zone, Zone::ClientReplies);
            let start = offset as usize;
            self.data[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn sync(&mut self) -> Result<(), StorageFault> {
            Ok(())
        }
    }

    const CLUSTER: ClusterId = ClusterId::new(3);

    fn reply(client: u64, request: u64, body: &[u8]) -> Message {
        let mut header = Header::new(CLUSTER, Command::Reply);
        header.client = ClientId::new(client);
        header.request = RequestNumber::new(request);
        header.op = OpNumber::new(9);
        header.set_checksum_body(body);
        header.set_checksum();
        Message::new(header, Bytes::copy_from_slice(body))
    }

    #[test]
    fn formatted_slots_are_missing() {
        let mut storage = MemStorage::new();
        ClientReplies::format(&mut storage).unwrap();
        for slot in 0..CLIENTS_MAX {
            assert_eq!(
                ClientReplies::read_reply(&mut storage, CLUSTER, slot),
                ReplyRead::Missing
            );
        }
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut storage = MemStorage::new();
        ClientReplies::format(&mut storage).unwrap();
        let msg = reply(7, 3, b"result bytes");
        ClientReplies::write_reply(&mut storage, 4, &msg).unwrap();
        assert_eq!(
            ClientReplies::read_reply(&mut storage, CLUSTER, 4),
            ReplyRead::Ok(msg)
        );
    }

    #[test]
    fn rewrite_replaces_previous_reply() {
        let mut storage = MemStorage::new();
        ClientReplies::format(&mut storage).unwrap();
        ClientReplies::write_reply(&mut storage, 0, &reply(7, 3, b"first")).unwrap();
        let second = reply(7, 4, b"second");
        ClientReplies::write_reply(&mut storage, 0, &second).unwrap();
        assert_eq!(
            ClientReplies::read_reply(&mut storage, CLUSTER, 0),
            ReplyRead::Ok(second)
        );
    }

    #[test]
    fn corrupt_slot_reads_missing() {
        let mut storage = MemStorage::new();
        ClientReplies::format(&mut storage).unwrap();
        ClientReplies::write_reply(&mut storage, 2, &reply(7, 3, b"bytes")).unwrap();
        storage.corrupt_reads = true;
        assert_eq!(
            ClientReplies::read_reply(&mut storage, CLUSTER, 2),
            ReplyRead::Missing
        );
    }

    #[test]
    fn read_if_matches_checksum() {
        let mut storage = MemStorage::new();
        ClientReplies::format(&mut storage).unwrap();
        let msg = reply(7, 3, b"bytes");
        ClientReplies::write_reply(&mut storage, 2, &msg).unwrap();

        assert_eq!(
            ClientReplies::read_reply_if(&mut storage, CLUSTER, 2, msg.header().checksum),
            ReplyRead::Ok(msg)
        );
        assert_eq!(
            ClientReplies::read_reply_if(&mut storage, CLUSTER, 2, Checksum::new(1)),
            ReplyRead::Missing
        );
    }
}
