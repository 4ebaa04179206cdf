//! The write-ahead log.
//!
//! Two parallel regions back the log: a dense header ring (one
//! 128-byte header per slot) and a prepare region (one
//! `MESSAGE_SIZE_MAX` slot per entry). A prepare for op `o` lives at
//! slot `o mod SLOT_COUNT` in both.
//!
//! # Write ordering
//!
//! `write_prepare` writes the body (the full message, so the prepare
//! region is self-describing), syncs, then writes the header cell and
//! syncs again. A crash between the two leaves a valid prepare under a
//! stale header — recoverable locally. A torn body under a fresh
//! header is the signature of a torn write and marks the slot torn.
//!
//! # Recovery classification
//!
//! For each slot, recovery cross-checks the header cell against the
//! prepare region:
//!
//! | header cell      | prepare region        | classification |
//! |------------------|-----------------------|----------------|
//! | zeroed           | invalid               | `Empty`        |
//! | valid            | matches checksum      | `Intact`       |
//! | valid            | missing / mismatched  | `Torn` (dirty) |
//! | zeroed / corrupt | valid                 | `Recovered`    |
//! | corrupt          | invalid               | `Faulty`       |
//!
//! `Torn` slots have a trustworthy header but no body: the op may have
//! been acked, so the body must be repaired from a peer and the slot
//! must never be nacked. `Faulty` slots carry no information at all.

use corundum_io::{Storage, StorageFault, Zone};
use corundum_types::constants::{HEADER_SIZE, MESSAGE_SIZE_MAX, SLOT_COUNT};
use corundum_types::{Checksum, ClusterId};
use corundum_wire::{Command, Header, Message};

/// Result of recovering one WAL slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveredSlot {
    /// Formatted, never written.
    Empty,
    /// Header and prepare agree.
    Intact(Header),
    /// Header is valid but the prepare body is missing or mismatched.
    /// The op may be committed; only the body needs repair.
    Torn(Header),
    /// The header cell is unusable but the prepare region holds a full
    /// valid message: the header can be rewritten locally.
    Recovered(Header),
    /// Neither region is usable.
    Faulty,
}

impl RecoveredSlot {
    /// The header this slot vouches for, if any.
    pub fn header(&self) -> Option<&Header> {
        match self {
            RecoveredSlot::Intact(h) | RecoveredSlot::Torn(h) | RecoveredSlot::Recovered(h) => {
                Some(h)
            }
            RecoveredSlot::Empty | RecoveredSlot::Faulty => None,
        }
    }
}

/// Result of reading one prepare slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareRead {
    Ok(Message),
    /// The slot holds no valid message (never written, overwritten, or
    /// corrupt) — indistinguishable cases, all requiring repair.
    Missing,
}

/// Namespace for WAL operations. The WAL itself is stateless: the
/// in-memory view of it (`Journal` in `corundum-vsr`) is rebuilt from
/// [`Wal::recover`] at open.
pub struct Wal;

impl Wal {
    /// Formats both WAL regions: zeroes every header cell so recovery
    /// classifies all slots as `Empty`.
    ///
    /// The prepare region is left as-is (zeros on a fresh file); a
    /// prepare is only trusted when its header ring entry vouches for
    /// it or it decodes as a complete valid message.
    pub fn format<S: Storage>(storage: &mut S) -> Result<(), StorageFault> {
        let zero_header = [0u8; HEADER_SIZE];
        for slot in 0..SLOT_COUNT {
            storage.write_cell(Zone::WalHeaders, slot, &zero_header)?;
        }
        storage.sync()
    }

    /// Durably writes a prepare: body first, then header.
    pub fn write_prepare<S: Storage>(
        storage: &mut S,
        prepare: &Message,
    ) -> Result<(), StorageFault> {
        assert_eq!(prepare.header().command, Command::Prepare);
        let slot = prepare.header().op.slot();

        storage.write_cell(Zone::WalPrepares, slot, &prepare.encode())?;
        storage.sync()?;

        storage.write_cell(Zone::WalHeaders, slot, &prepare.header().encode())?;
        storage.sync()
    }

    /// Writes only the header cell for a slot.
    ///
    /// Used when a peer supplies a canonical header without the body:
    /// the slot becomes `Torn` on recovery (header trusted, body
    /// dirty), which is exactly the repair state we want to persist.
    pub fn repair_header<S: Storage>(storage: &mut S, header: &Header) -> Result<(), StorageFault> {
        assert_eq!(header.command, Command::Prepare);
        storage.write_cell(Zone::WalHeaders, header.op.slot(), &header.encode())?;
        storage.sync()
    }

    /// Reads the prepare at `slot`, validating it as a full message.
    ///
    /// Storage faults are folded into `Missing`: a failed read and a
    /// corrupt body both mean "repair the body from a peer".
    pub fn read_prepare<S: Storage>(storage: &mut S, cluster: ClusterId, slot: usize) -> PrepareRead {
        let cell = match storage.read_cell(Zone::WalPrepares, slot) {
            Ok(cell) => cell,
            Err(fault) => {
                tracing::debug!(slot, %fault, "prepare read fault");
                return PrepareRead::Missing;
            }
        };
        match Self::decode_prepare_cell(cluster, &cell) {
            Some(message) => PrepareRead::Ok(message),
            None => PrepareRead::Missing,
        }
    }

    /// Reads the prepare at `slot` and checks it against an expected
    /// header checksum.
    pub fn read_prepare_if<S: Storage>(
        storage: &mut S,
        cluster: ClusterId,
        slot: usize,
        expected: Checksum,
    ) -> PrepareRead {
        match Self::read_prepare(storage, cluster, slot) {
            PrepareRead::Ok(message) if message.header().checksum == expected => {
                PrepareRead::Ok(message)
            }
            _ => PrepareRead::Missing,
        }
    }

    /// Scans all slots and classifies each (see module docs).
    pub fn recover<S: Storage>(storage: &mut S, cluster: ClusterId) -> Vec<RecoveredSlot> {
        let mut slots = Vec::with_capacity(SLOT_COUNT);
        for slot in 0..SLOT_COUNT {
            slots.push(Self::recover_slot(storage, cluster, slot));
        }

        let intact = slots
            .iter()
            .filter(|s| matches!(s, RecoveredSlot::Intact(_)))
            .count();
        let torn = slots
            .iter()
            .filter(|s| matches!(s, RecoveredSlot::Torn(_)))
            .count();
        let faulty = slots.iter().filter(|s| matches!(s, RecoveredSlot::Faulty)).count();
        tracing::info!(intact, torn, faulty, "WAL recovery scan complete");

        slots
    }

    fn recover_slot<S: Storage>(storage: &mut S, cluster: ClusterId, slot: usize) -> RecoveredSlot {
        let header_cell = storage.read_cell(Zone::WalHeaders, slot).ok();
        let prepare = match Self::read_prepare(storage, cluster, slot) {
            PrepareRead::Ok(message) => Some(message),
            PrepareRead::Missing => None,
        };
        // A prepare whose op does not map to this slot is stale debris
        // from a previous lap of the ring, not a recoverable entry.
        let prepare = prepare.filter(|m| m.header().op.slot() == slot);

        let header = header_cell.as_deref().and_then(Header::decode);
        match header {
            Some(header) => {
                debug_assert_eq!(header.command, Command::Prepare);
                if header.op.slot() != slot {
                    // Misdirected header write; nothing here is usable.
                    return match prepare {
                        Some(message) => RecoveredSlot::Recovered(*message.header()),
                        None => RecoveredSlot::Faulty,
                    };
                }
                match prepare {
                    Some(message) if message.header().checksum == header.checksum => {
                        RecoveredSlot::Intact(header)
                    }
                    Some(message) if message.header().op > header.op => {
                        // Newer body under an older header: the crash
                        // hit between body and header writes of a later
                        // lap. The body is complete, trust it.
                        RecoveredSlot::Recovered(*message.header())
                    }
                    Some(_) | None => RecoveredSlot::Torn(header),
                }
            }
            None => {
                let zeroed = header_cell
                    .as_deref()
                    .map(Header::is_zeroed_cell)
                    .unwrap_or(false);
                match (zeroed, prepare) {
                    (_, Some(message)) => RecoveredSlot::Recovered(*message.header()),
                    (true, None) => RecoveredSlot::Empty,
                    (false, None) => RecoveredSlot::Faulty,
                }
            }
        }
    }

    fn decode_prepare_cell(cluster: ClusterId, cell: &[u8]) -> Option<Message> {
        let header = Header::decode(&cell[..HEADER_SIZE])?;
        if header.command != Command::Prepare {
            return None;
        }
        let size = header.size as usize;
        if size > MESSAGE_SIZE_MAX || size > cell.len() {
            return None;
        }
        Message::decode(cluster, &cell[..size]).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use corundum_types::{OpNumber, ViewNumber};
    use corundum_wire::Operation;

    // A minimal in-memory Storage for WAL-only tests. The full
    // fault-injecting simulation storage lives in corundum-sim.
    struct MemStorage {
        zones: std::collections::HashMap<&'static str, Vec<u8>>,
    }

    impl MemStorage {
        fn new() -> Self {
            let mut zones = std::collections::HashMap::new();
            for zone in Zone::ALL {
                zones.insert(zone.name(), vec![0u8; zone.size() as usize]);
            }
            Self { zones }
        }

        fn corrupt(&mut self, zone: Zone, offset: usize, len: usize) {
            let data = self.zones.get_mut(zone.name()).unwrap();
            for byte in &mut data[offset..offset + len] {
                *byte ^= 0xA5;
            }
        }
    }

    impl Storage for MemStorage {
        fn read(&mut self, zone: Zone, offset: u64, len: usize) -> Result<Bytes, StorageFault> {
            let data = &self.zones[zone.name()];
            let start = offset as usize;
            Ok(Bytes::copy_from_slice(&data[start..start + len]))
        }

        fn write(&mut self, zone: Zone, offset: u64, data: &[u8]) -> Result<(), StorageFault> {
            let cell = self.zones.get_mut(zone.name()).unwrap();
            let start = offset as usize;
            cell[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn sync(&mut self) -> Result<(), StorageFault> {
            Ok(())
        }
    }

    const CLUSTER: ClusterId = ClusterId::new(9);

    fn prepare(op: u64, body: &[u8]) -> Message {
        let mut header = Header::new(CLUSTER, Command::Prepare);
        header.op = OpNumber::new(op);
        header.view = ViewNumber::new(1);
        header.operation = Operation::new(Operation::APPLICATION_MIN);
        header.set_checksum_body(body);
        header.set_checksum();
        Message::new(header, Bytes::copy_from_slice(body))
    }

    #[test]
    fn fresh_wal_recovers_all_empty() {
        let mut storage = MemStorage::new();
        Wal::format(&mut storage).unwrap();
        let slots = Wal::recover(&mut storage, CLUSTER);
        assert_eq!(slots.len(), SLOT_COUNT);
        assert!(slots.iter().all(|s| *s == RecoveredSlot::Empty));
    }

    #[test]
    fn written_prepare_recovers_intact() {
        let mut storage = MemStorage::new();
        Wal::format(&mut storage).unwrap();
        let msg = prepare(5, b"hello");
        Wal::write_prepare(&mut storage, &msg).unwrap();

        let slots = Wal::recover(&mut storage, CLUSTER);
        assert_eq!(slots[5], RecoveredSlot::Intact(*msg.header()));
        assert_eq!(
            Wal::read_prepare(&mut storage, CLUSTER, 5),
            PrepareRead::Ok(msg)
        );
    }

    #[test]
    fn corrupt_body_recovers_torn() {
        let mut storage = MemStorage::new();
        Wal::format(&mut storage).unwrap();
        let msg = prepare(5, b"hello");
        Wal::write_prepare(&mut storage, &msg).unwrap();

        storage.corrupt(Zone::WalPrepares, 5 * MESSAGE_SIZE_MAX + HEADER_SIZE, 3);

        let slots = Wal::recover(&mut storage, CLUSTER);
        assert_eq!(slots[5], RecoveredSlot::Torn(*msg.header()));
        assert_eq!(Wal::read_prepare(&mut storage, CLUSTER, 5), PrepareRead::Missing);
    }

    #[test]
    fn corrupt_header_with_valid_body_recovers_locally() {
        let mut storage = MemStorage::new();
        Wal::format(&mut storage).unwrap();
        let msg = prepare(5, b"hello");
        Wal::write_prepare(&mut storage, &msg).unwrap();

        storage.corrupt(Zone::WalHeaders, 5 * HEADER_SIZE, 16);

        let slots = Wal::recover(&mut storage, CLUSTER);
        assert_eq!(slots[5], RecoveredSlot::Recovered(*msg.header()));
    }

    #[test]
    fn corrupt_header_and_body_recovers_faulty() {
        let mut storage = MemStorage::new();
        Wal::format(&mut storage).unwrap();
        let msg = prepare(5, b"hello");
        Wal::write_prepare(&mut storage, &msg).unwrap();

        storage.corrupt(Zone::WalHeaders, 5 * HEADER_SIZE, 16);
        storage.corrupt(Zone::WalPrepares, 5 * MESSAGE_SIZE_MAX, 256);

        let slots = Wal::recover(&mut storage, CLUSTER);
        assert_eq!(slots[5], RecoveredSlot::Faulty);
    }

    #[test]
    fn repair_header_persists_a_torn_slot() {
        let mut storage = MemStorage::new();
        Wal::format(&mut storage).unwrap();
        let msg = prepare(7, b"body unseen");
        Wal::repair_header(&mut storage, msg.header()).unwrap();

        let slots = Wal::recover(&mut storage, CLUSTER);
        assert_eq!(slots[7], RecoveredSlot::Torn(*msg.header()));
    }

    #[test]
    fn ring_overwrite_replaces_slot() {
        let mut storage = MemStorage::new();
        Wal::format(&mut storage).unwrap();
        let old = prepare(3, b"old lap");
        let new = prepare(3 + SLOT_COUNT as u64, b"new lap");
        assert_eq!(old.header().op.slot(), new.header().op.slot());

        Wal::write_prepare(&mut storage, &old).unwrap();
        Wal::write_prepare(&mut storage, &new).unwrap();

        let slots = Wal::recover(&mut storage, CLUSTER);
        assert_eq!(slots[3], RecoveredSlot::Intact(*new.header()));
    }

    #[test]
    fn newer_body_under_stale_header_is_recovered() {
        // Crash between the body write and the header write of a
        // second lap: the body is newer than the header ring entry.
        let mut storage = MemStorage::new();
        Wal::format(&mut storage).unwrap();
        let old = prepare(3, b"old lap");
        let new = prepare(3 + SLOT_COUNT as u64, b"new lap");

        Wal::write_prepare(&mut storage, &old).unwrap();
        storage
            .write_cell(Zone::WalPrepares, 3, &new.encode())
            .unwrap();

        let slots = Wal::recover(&mut storage, CLUSTER);
        assert_eq!(slots[3], RecoveredSlot::Recovered(*new.header()));
    }
}
