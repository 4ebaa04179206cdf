//! File-backed storage driver.
//!
//! Positional reads and writes against a single preallocated data file.
//! This is the production backend; the deterministic simulation backend
//! lives in `corundum-sim`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use bytes::Bytes;

use crate::{FaultKind, Storage, StorageFault, Zone, DATA_FILE_SIZE};

#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Storage driver over one replica data file.
#[derive(Debug)]
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    /// Creates and preallocates a fresh data file.
    ///
    /// Fails if the file already exists — `format` must never clobber a
    /// replica's data behind the operator's back.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(DATA_FILE_SIZE)?;
        file.sync_all()?;
        Ok(Self { file })
    }

    /// Opens an existing data file.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len != DATA_FILE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("data file is {len} bytes, expected {DATA_FILE_SIZE} (wrong format version?)"),
            ));
        }
        Ok(Self { file })
    }

    fn absolute(zone: Zone, offset: u64, len: usize) -> u64 {
        assert!(
            offset + len as u64 <= zone.size(),
            "access beyond {} zone: offset={offset} len={len}",
            zone.name()
        );
        zone.start() + offset
    }
}

impl Storage for FileStorage {
    fn read(&mut self, zone: Zone, offset: u64, len: usize) -> Result<Bytes, StorageFault> {
        let position = Self::absolute(zone, offset, len);
        let mut buffer = vec![0u8; len];
        self.file
            .read_exact_at(&mut buffer, position)
            .map_err(|error| {
                tracing::warn!(zone = zone.name(), offset, %error, "read fault");
                StorageFault {
                    kind: FaultKind::Read,
                    zone,
                    offset,
                }
            })?;
        Ok(Bytes::from(buffer))
    }

    fn write(&mut self, zone: Zone, offset: u64, data: &[u8]) -> Result<(), StorageFault> {
        let position = Self::absolute(zone, offset, data.len());
        self.file.write_all_at(data, position).map_err(|error| {
            tracing::warn!(zone = zone.name(), offset, %error, "write fault");
            StorageFault {
                kind: FaultKind::Write,
                zone,
                offset,
            }
        })
    }

    fn sync(&mut self) -> Result<(), StorageFault> {
        self.file.sync_data().map_err(|error| {
            tracing::error!(%error, "fsync fault");
            StorageFault {
                kind: FaultKind::Sync,
                zone: Zone::Superblock,
                offset: 0,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica.corundum");

        let mut storage = FileStorage::create(&path).unwrap();
        storage.write(Zone::Grid, 4096, b"block bytes").unwrap();
        storage.sync().unwrap();
        drop(storage);

        let mut storage = FileStorage::open(&path).unwrap();
        let read = storage.read(Zone::Grid, 4096, 11).unwrap();
        assert_eq!(&read[..], b"block bytes");
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica.corundum");
        let _first = FileStorage::create(&path).unwrap();
        assert!(FileStorage::create(&path).is_err());
    }

    #[test]
    fn open_rejects_wrong_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica.corundum");
        std::fs::write(&path, b"too small").unwrap();
        assert!(FileStorage::open(&path).is_err());
    }

    #[test]
    fn fresh_file_reads_zeros() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica.corundum");
        let mut storage = FileStorage::create(&path).unwrap();
        let read = storage.read_cell(Zone::WalHeaders, 0).unwrap();
        assert!(read.iter().all(|&b| b == 0));
    }
}
