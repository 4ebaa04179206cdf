//! End-to-end fault scenarios.
//!
//! Each test drives real replicas over simulated storage and network:
//! WAL corruption left and right of the head, torn heads on
//! single-replica clusters, partitions, dueling primaries, crashes
//! around checkpoints, state sync, and scrub healing of a fully
//! corrupted grid.

use corundum_io::Zone;
use corundum_sim::{Cluster, ClusterOptions};
use corundum_types::{OpNumber, ReplicaStatus};
use corundum_vsr::OpenError;

fn quiesce(cluster: &mut Cluster, max_steps: u64) {
    cluster.run_until(max_steps, |c| c.clients_idle());
    // Let commit heartbeats propagate the tail to backups.
    cluster.run_until(max_steps, |c| c.converged());
}

/// S1: prepare corruption right of a stopped replica's head (R = 3).
/// The corrupted replica reopens in recovering_head and must not help
/// form a quorum; with a third replica back, the cluster commits
/// onward and heals everyone.
#[test]
fn wal_prepare_corruption_right_of_head() {
    let mut cluster = Cluster::new(ClusterOptions::new(3, 0, 101));
    cluster.add_client(1, 20);
    quiesce(&mut cluster, 20_000);
    let committed = cluster.commit_max();
    assert!(committed >= OpNumber::new(20));

    cluster.stop(0);
    cluster.stop(1);
    cluster.stop(2);

    // Corrupt R0's prepare body at its head slot: torn head.
    let head_slot = committed.as_u64() as usize % corundum_types::constants::SLOT_COUNT;
    cluster
        .storage_mut(0)
        .corrupt_cell(Zone::WalPrepares, head_slot);

    cluster.restart(0).expect("R0 reopens");
    assert_eq!(cluster.replica(0).status(), ReplicaStatus::RecoveringHead);

    cluster.restart(1).expect("R1 reopens");
    // One healthy replica plus one recovering head: no quorum, no
    // new commits.
    cluster.add_requests(1, 1);
    cluster.run(500);
    assert!(cluster.commit_max() <= committed, "commit advanced without a quorum");

    cluster.restart(2).expect("R2 reopens");
    cluster.add_requests(1, 23);
    quiesce(&mut cluster, 40_000);

    assert!(cluster.converged());
    assert!(cluster.commit_max() >= OpNumber::new(committed.as_u64() + 24));
    assert_eq!(cluster.replica(0).status(), ReplicaStatus::Normal);
}

/// S2: torn WAL header on a single-replica cluster with a standby.
/// The header cell is corrupt but the prepare body survives, so the
/// replica repairs its own header ring and keeps going; the standby
/// converges with it.
#[test]
fn single_replica_wal_header_corruption() {
    let mut cluster = Cluster::new(ClusterOptions::new(1, 1, 202));
    cluster.add_client(1, 20);
    quiesce(&mut cluster, 20_000);
    let committed = cluster.commit_max();

    cluster.stop(0);
    let head_slot = committed.as_u64() as usize % corundum_types::constants::SLOT_COUNT;
    cluster
        .storage_mut(0)
        .corrupt_cell(Zone::WalHeaders, head_slot);

    cluster.restart(0).expect("R0 reopens from body-intact slot");
    assert_eq!(cluster.replica(0).status(), ReplicaStatus::Normal);
    assert_eq!(cluster.replica(0).commit_min(), committed);

    cluster.add_requests(1, 10);
    quiesce(&mut cluster, 20_000);

    assert!(cluster.converged());
    assert_eq!(
        cluster.replica(1).commit_min(),
        cluster.replica(0).commit_min(),
        "standby must converge with the replica"
    );
}

/// S2 (corollary): corrupting both regions of a committed slot on a
/// standalone single replica is unrecoverable — the process refuses to
/// open rather than serve a log it cannot verify.
#[test]
fn single_replica_unrecoverable_corruption_fails_open() {
    let mut cluster = Cluster::new(ClusterOptions::new(1, 0, 203));
    cluster.add_client(1, 8);
    quiesce(&mut cluster, 20_000);
    let committed = cluster.commit_max();

    cluster.stop(0);
    let slot = committed.as_u64() as usize % corundum_types::constants::SLOT_COUNT;
    cluster.storage_mut(0).corrupt_cell(Zone::WalHeaders, slot);
    cluster.storage_mut(0).corrupt_cell(Zone::WalPrepares, slot);

    match cluster.restart(0) {
        Err(OpenError::WalCorrupt) => {}
        other => panic!("expected WalCorrupt, got {other:?}"),
    }
}

/// S3: a fully partitioned backup stalls alone; the remaining two keep
/// committing; reunion converges everyone with nothing lost.
#[test]
fn isolated_backup_stalls_then_converges() {
    let mut cluster = Cluster::new(ClusterOptions::new(3, 0, 303));
    cluster.add_client(1, 10);
    quiesce(&mut cluster, 20_000);
    let before = cluster.commit_max();

    let b2 = corundum_types::ReplicaId::new(2);
    cluster.network().isolate(b2);
    let b2_commit = cluster.replica(2).commit_min();

    cluster.add_requests(1, 10);
    cluster.run_until(30_000, |c| c.clients_idle());
    assert!(cluster.commit_max() > before, "majority must keep committing");
    assert_eq!(
        cluster.replica(2).commit_min(),
        b2_commit,
        "isolated backup must not advance"
    );

    cluster.network().rejoin(b2);
    cluster.run_until(40_000, |c| c.converged());
    assert!(cluster.single_primary());
}

/// S4: dueling primaries. The old primary is cut off, a new view forms
/// without it, and on reunion the cluster settles on a single
/// normal-status primary with no divergence (the agreement checker
/// runs throughout).
#[test]
fn dueling_primaries_converge() {
    let mut cluster = Cluster::new(ClusterOptions::new(3, 0, 404));
    cluster.add_client(1, 10);
    quiesce(&mut cluster, 20_000);
    let before = cluster.commit_max();

    // Cut the view-0 primary off from both backups; they elect view 1.
    let a0 = corundum_types::ReplicaId::new(0);
    let b1 = corundum_types::ReplicaId::new(1);
    let b2 = corundum_types::ReplicaId::new(2);
    cluster.network().partition(a0, b1);
    cluster.network().partition(a0, b2);

    cluster.run_until(30_000, |c| {
        c.replica(1).status() == ReplicaStatus::Normal
            && c.replica(1).view() > c.replica(0).view()
            || c.replica(2).status() == ReplicaStatus::Normal
                && c.replica(2).view() > c.replica(0).view()
    });

    // Two replicas now believe they lead distinct views.
    cluster.network().rejoin(a0);
    cluster.run_until(40_000, |c| c.single_primary() && c.converged());
    assert!(cluster.commit_max() >= before);
}

/// S5: a backup crashes around the first checkpoint and reopens with a
/// corrupt early WAL slot. The primary's pipeline bound means the slot
/// is still repairable; the backup catches all the way up.
#[test]
fn backup_crash_before_checkpoint_repairs() {
    let mut cluster = Cluster::new(ClusterOptions::new(3, 0, 505));
    cluster.add_client(1, 15);
    quiesce(&mut cluster, 20_000);

    // B1 crashes before the checkpoint trigger commits everywhere.
    cluster.stop(1);
    cluster.add_requests(1, 10);
    cluster.run_until(30_000, |c| {
        c.replica(0).op_checkpoint() >= OpNumber::new(corundum_types::constants::CHECKPOINT_INTERVAL)
    });

    // B1's first WAL entry is corrupt on restart.
    cluster.storage_mut(1).corrupt_cell(Zone::WalPrepares, 1);
    cluster.restart(1).expect("B1 reopens");

    cluster.run_until(40_000, |c| c.clients_idle() && c.converged());
    assert!(
        cluster.replica(1).op_checkpoint()
            >= OpNumber::new(corundum_types::constants::CHECKPOINT_INTERVAL)
    );
}

/// S6: a replica left behind across multiple checkpoints cannot WAL
/// repair — its slots were overwritten cluster-side. It must state
/// sync to a quorum-agreed checkpoint and then converge. Run twice so
/// two of the four replicas go through the sync path.
#[test]
fn lagging_replicas_state_sync() {
    let mut cluster = Cluster::new(ClusterOptions::new(4, 0, 606));
    cluster.add_client(1, 10);
    quiesce(&mut cluster, 30_000);

    for lagging in [3u8, 2u8] {
        cluster.stop(lagging);
        let stopped_at = cluster.commit_max();

        // Drive far past the lagging replica's WAL horizon.
        let horizon = corundum_types::constants::prepare_max_for_checkpoint(
            corundum_types::constants::checkpoint_for_op(stopped_at),
        );
        cluster.add_requests(1, horizon.as_u64() + 30 - stopped_at.as_u64());
        cluster.run_until(120_000, |c| c.clients_idle());
        assert!(cluster.commit_max() > horizon);

        cluster.restart(lagging).expect("lagging replica reopens");
        // The replica must go through the sync path (WAL repair cannot
        // reach this far), then converge.
        cluster.run_until(120_000, |c| {
            c.replica(lagging).sync_bounds().1 > OpNumber::ZERO
        });
        cluster.run_until(120_000, |c| c.converged());
    }
}

/// S7: one replica's entire grid zone is corrupted in place while it
/// keeps serving. Under continued traffic the scrubber finds the
/// damage and repair heals it from peers, monotonically, to zero —
/// after which the grid is byte-identical to a healthy peer's.
#[test]
fn scrubber_heals_fully_corrupted_grid() {
    let mut cluster = Cluster::new(ClusterOptions::new(3, 0, 707));
    cluster.add_client(1, 25); // past the first checkpoint: live grid blocks exist
    quiesce(&mut cluster, 30_000);
    assert!(cluster.replica(2).grid().live_count() > 0);

    cluster.storage_mut(2).corrupt_zone(Zone::Grid);
    let damaged = cluster.grid_corrupt_count(2);
    assert!(damaged > 0);

    // The scrubber must notice...
    cluster.run_until(60_000, |c| c.replica(2).grid_faulty_count() > 0);

    // ...and with no new faults injected, actual corruption only ever
    // decreases until it reaches zero.
    let mut last = damaged;
    cluster.run_until(120_000, |c| {
        let now = c.grid_corrupt_count(2);
        assert!(now <= last, "grid corruption increased without new faults");
        last = now;
        now == 0
    });

    cluster.add_requests(1, 5);
    quiesce(&mut cluster, 30_000);
    assert_eq!(cluster.replica(2).grid_faulty_count(), 0);
    assert!(cluster.grids_identical(0, 2), "healed grid must match a healthy peer");
}
