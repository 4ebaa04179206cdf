//! `corundum format` — initialize a replica data file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use corundum_io::{FileStorage, Storage, Zone};
use corundum_types::{ClusterId, Release, ReplicaId};
use corundum_vsr::{ClusterConfig, HashStateMachine, Replica};

/// The release this binary runs.
pub fn current_release() -> Release {
    Release::from_parts(0, 3, 0)
}

pub fn run(
    cluster: u128,
    replica: u8,
    replica_count: u8,
    standby_count: u8,
    path: &str,
) -> Result<()> {
    // Odd active counts only (1, 3, 5, ...).
    if replica_count == 0 || replica_count % 2 == 0 {
        bail!("replica count must be odd, got {replica_count}");
    }
    if replica >= replica_count + standby_count {
        bail!(
            "replica index {replica} out of range for {replica_count} replicas + {standby_count} standbys"
        );
    }

    let config = ClusterConfig::new(ClusterId::new(cluster), replica_count, standby_count);
    let mut storage = FileStorage::create(Path::new(path))
        .with_context(|| format!("creating data file {path}"))?;

    Replica::<FileStorage, HashStateMachine>::format(
        &mut storage,
        config,
        ReplicaId::new(replica),
        current_release(),
    )
    .context("formatting data file")?;

    // Canary: read every zone boundary back before declaring the file
    // usable.
    for zone in Zone::ALL {
        storage
            .read(zone, 0, zone.cell_size())
            .with_context(|| format!("verifying {} zone", zone.name()))?;
        let last = zone.cell_count() - 1;
        storage
            .read_cell(zone, last)
            .with_context(|| format!("verifying {} zone tail", zone.name()))?;
    }

    println!("formatted {path}: cluster {cluster:x}, replica {replica}/{replica_count}");
    Ok(())
}
