//! The quorum-replicated superblock.
//!
//! The superblock is the durable root of a replica: everything needed
//! to reopen — identity, release, the VSR positions, the checkpoint
//! reference, and the free-set / session snapshots — in one record,
//! written in `SUPERBLOCK_COPIES` copies at fixed offsets.
//!
//! # Copy layout (one zone cell, `SUPERBLOCK_COPY_SIZE` bytes)
//!
//! ```text
//! [0..8)    magic       b"CRNDMSB1"
//! [8..12)   version     u32
//! [12]      copy        u8 (copy index, detects misdirected writes)
//! [13..16)  reserved    zeroes
//! [16..20)  length      u32 (postcard image length)
//! [20..20+length)       postcard-encoded SuperblockImage
//! [..-4)    padding     zeroes
//! [-4..)    crc32       over everything before it
//! ```
//!
//! # Update protocol
//!
//! The new image (sequence + 1) is written to every copy offset, each
//! write followed by a sync; only after all copies are durable is the
//! in-memory working copy replaced. A crash mid-update therefore leaves
//! either the old quorum, the new quorum, or an adjacent old/new split.
//!
//! # Open protocol
//!
//! Read all copies, keep the valid ones, and select the highest
//! sequence backed by `SUPERBLOCK_QUORUM` matching copies. If no
//! sequence is quorate but every valid copy sits on two adjacent
//! sequences, the update was interrupted: the newer image is chosen —
//! it is a legal successor of the old one and recovery completes the
//! installation. Anything else is `SuperblockError::Corrupt`.

use corundum_crypto::{checksum, crc32};
use corundum_io::{Storage, StorageFault, Zone};
use corundum_types::constants::{SUPERBLOCK_COPIES, SUPERBLOCK_COPY_SIZE, SUPERBLOCK_QUORUM};
use corundum_types::{
    Checksum, ClientId, ClusterId, OpNumber, Release, ReplicaId, RequestNumber, ViewNumber,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAGIC: [u8; 8] = *b"CRNDMSB1";
const VERSION: u32 = 1;
const FRAME_HEAD: usize = 20;
const CRC_OFFSET: usize = SUPERBLOCK_COPY_SIZE - 4;

/// Errors opening or updating the superblock.
#[derive(Debug, Error)]
pub enum SuperblockError {
    /// No quorum of copies agrees on any sequence. Fatal on open.
    #[error("superblock corrupt: no quorum among {valid} valid copies")]
    Corrupt { valid: usize },
    #[error("superblock storage fault: {0}")]
    Fault(#[from] StorageFault),
}

/// The replicated VSR positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VsrState {
    pub view: ViewNumber,
    pub log_view: ViewNumber,
    pub commit_min: OpNumber,
    /// Checksum of the prepare at `commit_min`: the hash-chain anchor
    /// for replay after reopen.
    pub commit_min_checksum: Checksum,
    pub op_checkpoint: OpNumber,
    pub checkpoint_id: Checksum,
    /// Bounds of an in-progress state sync, zero when none.
    pub sync_op_min: OpNumber,
    pub sync_op_max: OpNumber,
}

/// One client session as persisted at checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub client: ClientId,
    pub request: RequestNumber,
    pub reply_checksum: Checksum,
    pub committed_op: OpNumber,
    /// Reply-cache slot assigned to this session.
    pub slot: u32,
}

/// The durable superblock content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperblockImage {
    /// Monotonic update sequence; the open vote keys on this.
    pub sequence: u64,
    pub cluster: ClusterId,
    pub replica: ReplicaId,
    pub replica_count: u8,
    pub standby_count: u8,
    /// The replica's current release.
    pub release: Release,
    pub vsr_state: VsrState,
    /// Free-set bitmap as of the checkpoint.
    pub free_set: Vec<u8>,
    /// Grid index (address, checksum) pairs as of the checkpoint.
    pub grid_index: Vec<(u64, Checksum)>,
    /// Client sessions as of the checkpoint.
    pub sessions: Vec<SessionSnapshot>,
    /// The state machine's serialized checkpoint root (the forest's
    /// manifest references). Opaque to replication; empty on a fresh
    /// format.
    pub state_payload: Vec<u8>,
}

impl SuperblockImage {
    /// The image written by `format`.
    pub fn initial(
        cluster: ClusterId,
        replica: ReplicaId,
        replica_count: u8,
        standby_count: u8,
        release: Release,
    ) -> Self {
        Self {
            sequence: 0,
            cluster,
            replica,
            replica_count,
            standby_count,
            release,
            vsr_state: VsrState::default(),
            free_set: Vec::new(),
            grid_index: Vec::new(),
            sessions: Vec::new(),
            state_payload: Vec::new(),
        }
    }

    /// The checkpoint identity: the digest of the durable state.
    ///
    /// The id must be identical on every replica that installs the
    /// same checkpoint — state sync targets require `f + 1` agreement
    /// on it — so everything replica-local is zeroed before hashing:
    /// the update sequence, the replica id, the view positions (a
    /// backup may install the same checkpoint in a later view), and
    /// the sync bounds.
    pub fn checkpoint_id(&self) -> Checksum {
        let mut normalized = self.clone();
        normalized.sequence = 0;
        normalized.replica = ReplicaId::new(0);
        normalized.vsr_state.view = ViewNumber::ZERO;
        normalized.vsr_state.log_view = ViewNumber::ZERO;
        normalized.vsr_state.sync_op_min = OpNumber::ZERO;
        normalized.vsr_state.sync_op_max = OpNumber::ZERO;
        normalized.vsr_state.checkpoint_id = Checksum::ZERO;
        let bytes =
            postcard::to_allocvec(&normalized).expect("superblock image is always serializable");
        checksum(&bytes)
    }

    fn encode_copy(&self, copy: u8) -> Vec<u8> {
        let image = postcard::to_allocvec(self).expect("superblock image is always serializable");
        assert!(
            FRAME_HEAD + image.len() + 4 <= SUPERBLOCK_COPY_SIZE,
            "superblock image of {} bytes exceeds copy size",
            image.len()
        );

        let mut buf = vec![0u8; SUPERBLOCK_COPY_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[12] = copy;
        buf[16..20].copy_from_slice(&(image.len() as u32).to_le_bytes());
        buf[FRAME_HEAD..FRAME_HEAD + image.len()].copy_from_slice(&image);
        let crc = crc32(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode_copy(copy: u8, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SUPERBLOCK_COPY_SIZE {
            return None;
        }
        if bytes[0..8] != MAGIC {
            return None;
        }
        if u32::from_le_bytes(bytes[8..12].try_into().unwrap()) != VERSION {
            return None;
        }
        if bytes[12] != copy {
            // Misdirected write: a copy landed at the wrong offset.
            return None;
        }
        let stored_crc = u32::from_le_bytes(bytes[CRC_OFFSET..].try_into().unwrap());
        if crc32(&bytes[..CRC_OFFSET]) != stored_crc {
            return None;
        }
        let length = u32::from_le_bytes(bytes[16..20].try_into().unwrap()) as usize;
        if FRAME_HEAD + length + 4 > SUPERBLOCK_COPY_SIZE {
            return None;
        }
        postcard::from_bytes(&bytes[FRAME_HEAD..FRAME_HEAD + length]).ok()
    }
}

/// The in-memory working copy plus its durable update protocol.
#[derive(Debug)]
pub struct Superblock {
    working: SuperblockImage,
}

impl Superblock {
    /// Formats the superblock zone with an initial image and returns
    /// the working copy.
    pub fn format<S: Storage>(
        storage: &mut S,
        image: SuperblockImage,
    ) -> Result<Self, SuperblockError> {
        assert_eq!(image.sequence, 0, "format writes sequence 0");
        let mut superblock = Self {
            working: image.clone(),
        };
        superblock.write_all_copies(storage, &image)?;
        Ok(superblock)
    }

    /// Opens the superblock from storage (see module docs for the
    /// vote).
    pub fn open<S: Storage>(storage: &mut S) -> Result<Self, SuperblockError> {
        let mut valid: Vec<SuperblockImage> = Vec::with_capacity(SUPERBLOCK_COPIES);
        for copy in 0..SUPERBLOCK_COPIES {
            match storage.read_cell(Zone::Superblock, copy) {
                Ok(bytes) => {
                    if let Some(image) = SuperblockImage::decode_copy(copy as u8, &bytes) {
                        valid.push(image);
                    }
                }
                Err(fault) => {
                    tracing::warn!(copy, %fault, "superblock copy unreadable");
                }
            }
        }

        let chosen = Self::vote(&valid).ok_or(SuperblockError::Corrupt { valid: valid.len() })?;
        tracing::info!(
            sequence = chosen.sequence,
            view = %chosen.vsr_state.view,
            commit_min = %chosen.vsr_state.commit_min,
            op_checkpoint = %chosen.vsr_state.op_checkpoint,
            "superblock opened"
        );
        Ok(Self { working: chosen })
    }

    fn vote(valid: &[SuperblockImage]) -> Option<SuperblockImage> {
        if valid.is_empty() {
            return None;
        }
        let highest = valid.iter().map(|image| image.sequence).max().unwrap();
        let highest_count = valid.iter().filter(|i| i.sequence == highest).count();
        if highest_count >= SUPERBLOCK_QUORUM {
            return valid.iter().find(|i| i.sequence == highest).cloned();
        }

        // Interrupted update: all valid copies on two adjacent
        // sequences. The newer image is a legal successor of the old;
        // adopting it completes the interrupted installation.
        let adjacent = valid
            .iter()
            .all(|i| i.sequence == highest || i.sequence + 1 == highest);
        let total_adjacent = valid.len();
        if adjacent && total_adjacent >= SUPERBLOCK_QUORUM {
            tracing::warn!(
                sequence = highest,
                copies = highest_count,
                "superblock update was interrupted; adopting newer image"
            );
            return valid.iter().find(|i| i.sequence == highest).cloned();
        }
        None
    }

    /// The current working copy.
    pub fn working(&self) -> &SuperblockImage {
        &self.working
    }

    /// Durably installs a new image.
    ///
    /// The caller builds the successor from [`Superblock::working`];
    /// this bumps the sequence, writes every copy (each synced), and
    /// only then replaces the working copy.
    pub fn update<S: Storage>(
        &mut self,
        storage: &mut S,
        mut image: SuperblockImage,
    ) -> Result<(), SuperblockError> {
        image.sequence = self.working.sequence + 1;
        assert_eq!(image.cluster, self.working.cluster);
        assert_eq!(image.replica, self.working.replica);
        assert!(
            image.vsr_state.view >= self.working.vsr_state.view,
            "superblock view must not regress: {} < {}",
            image.vsr_state.view,
            self.working.vsr_state.view
        );
        assert!(
            image.vsr_state.commit_min >= self.working.vsr_state.commit_min,
            "superblock commit_min must not regress"
        );

        self.write_all_copies(storage, &image)?;
        self.working = image;
        Ok(())
    }

    fn write_all_copies<S: Storage>(
        &mut self,
        storage: &mut S,
        image: &SuperblockImage,
    ) -> Result<(), SuperblockError> {
        for copy in 0..SUPERBLOCK_COPIES {
            let bytes = image.encode_copy(copy as u8);
            storage.write_cell(Zone::Superblock, copy, &bytes)?;
            storage.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct MemStorage {
        data: Vec<u8>,
    }

    impl MemStorage {
        fn new() -> Self {
            Self {
                data: vec![0u8; Zone::Superblock.size() as usize],
            }
        }

        fn corrupt_copy(&mut self, copy: usize) {
            let start = copy * SUPERBLOCK_COPY_SIZE;
            for byte in &mut self.data[start + 100..start + 200] {
                *byte ^= 0xFF;
            }
        }
    }

    impl Storage for MemStorage {
        fn read(&mut self, zone: Zone, offset: u64, len: usize) -> Result<Bytes, StorageFault> {
            assert_eq!(zone, Zone::Superblock);
            let start = offset as usize;
            Ok(Bytes::copy_from_slice(&self.data[start..start + len]))
        }

        fn write(&mut self, zone: Zone, offset: u64, data: &[u8]) -> Result<(), StorageFault> {
            assert_eq!(zone, Zone::Superblock);
            let start = offset as usize;
            self.data[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn sync(&mut self) -> Result<(), StorageFault> {
            Ok(())
        }
    }

    fn initial_image() -> SuperblockImage {
        SuperblockImage::initial(
            ClusterId::new(5),
            ReplicaId::new(1),
            3,
            0,
            Release::from_parts(0, 3, 0),
        )
    }

    #[test]
    fn format_then_open() {
        let mut storage = MemStorage::new();
        Superblock::format(&mut storage, initial_image()).unwrap();
        let opened = Superblock::open(&mut storage).unwrap();
        assert_eq!(opened.working().sequence, 0);
        assert_eq!(opened.working().replica, ReplicaId::new(1));
    }

    #[test]
    fn update_advances_sequence_and_survives_reopen() {
        let mut storage = MemStorage::new();
        let mut sb = Superblock::format(&mut storage, initial_image()).unwrap();

        let mut next = sb.working().clone();
        next.vsr_state.view = ViewNumber::new(3);
        next.vsr_state.commit_min = OpNumber::new(17);
        sb.update(&mut storage, next).unwrap();

        let opened = Superblock::open(&mut storage).unwrap();
        assert_eq!(opened.working().sequence, 1);
        assert_eq!(opened.working().vsr_state.view, ViewNumber::new(3));
        assert_eq!(opened.working().vsr_state.commit_min, OpNumber::new(17));
    }

    #[test]
    fn open_tolerates_one_corrupt_copy() {
        let mut storage = MemStorage::new();
        Superblock::format(&mut storage, initial_image()).unwrap();
        storage.corrupt_copy(2);
        let opened = Superblock::open(&mut storage).unwrap();
        assert_eq!(opened.working().sequence, 0);
    }

    #[test]
    fn open_fails_without_quorum() {
        let mut storage = MemStorage::new();
        Superblock::format(&mut storage, initial_image()).unwrap();
        storage.corrupt_copy(0);
        storage.corrupt_copy(1);
        match Superblock::open(&mut storage) {
            Err(SuperblockError::Corrupt { valid }) => assert_eq!(valid, 2),
            other => panic!("expected corrupt, got {other:?}"),
        }
    }

    #[test]
    fn interrupted_update_adopts_newer_image() {
        let mut storage = MemStorage::new();
        let mut sb = Superblock::format(&mut storage, initial_image()).unwrap();

        // Simulate a crash after two of four copies of the next image
        // were written: hand-write copies 0 and 1 at sequence 1.
        let mut next = sb.working().clone();
        next.sequence = 1;
        next.vsr_state.view = ViewNumber::new(1);
        for copy in 0..2 {
            let bytes = next.encode_copy(copy as u8);
            storage.write_cell(Zone::Superblock, copy, &bytes).unwrap();
        }
        let _ = &mut sb; // original working copy is now stale

        let opened = Superblock::open(&mut storage).unwrap();
        assert_eq!(opened.working().sequence, 1);
        assert_eq!(opened.working().vsr_state.view, ViewNumber::new(1));
    }

    #[test]
    fn misdirected_copy_is_rejected() {
        let mut storage = MemStorage::new();
        Superblock::format(&mut storage, initial_image()).unwrap();

        // Write copy 0's bytes at copy 3's offset; the embedded copy
        // index no longer matches and the cell must not count.
        let image = Superblock::open(&mut storage).unwrap().working().clone();
        let bytes = image.encode_copy(0);
        storage.write_cell(Zone::Superblock, 3, &bytes).unwrap();

        // Still three good copies (0, 1, 2) — open succeeds.
        let opened = Superblock::open(&mut storage).unwrap();
        assert_eq!(opened.working().sequence, 0);
    }

    #[test]
    fn checkpoint_id_ignores_replica_local_state() {
        let image = initial_image();
        let mut later = image.clone();
        later.sequence = 9;
        later.replica = ReplicaId::new(2);
        later.vsr_state.view = ViewNumber::new(5);
        later.vsr_state.log_view = ViewNumber::new(5);
        later.vsr_state.sync_op_max = OpNumber::new(40);
        assert_eq!(image.checkpoint_id(), later.checkpoint_id());

        let mut changed = image.clone();
        changed.vsr_state.commit_min = OpNumber::new(1);
        assert_ne!(image.checkpoint_id(), changed.checkpoint_id());
    }
}
