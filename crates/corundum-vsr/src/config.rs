//! Cluster configuration.

use corundum_types::{ClusterId, ReplicaId, ViewNumber};

/// Static cluster membership: an odd number of active replicas (1, 3,
/// or 5 in practice) plus optional standbys.
///
/// Standbys replicate prepares and serve repair content but never count
/// toward a quorum and never hold leadership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterConfig {
    cluster: ClusterId,
    replica_count: u8,
    standby_count: u8,
}

impl ClusterConfig {
    pub fn new(cluster: ClusterId, replica_count: u8, standby_count: u8) -> Self {
        assert!(replica_count >= 1, "a cluster needs at least one replica");
        Self {
            cluster,
            replica_count,
            standby_count,
        }
    }

    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    /// Active (quorum-eligible) replicas.
    pub fn replica_count(&self) -> u8 {
        self.replica_count
    }

    pub fn standby_count(&self) -> u8 {
        self.standby_count
    }

    /// All members, active then standby.
    pub fn member_count(&self) -> u8 {
        self.replica_count + self.standby_count
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        id.as_u8() < self.member_count()
    }

    pub fn is_standby(&self, id: ReplicaId) -> bool {
        id.as_u8() >= self.replica_count && self.contains(id)
    }

    pub fn is_active(&self, id: ReplicaId) -> bool {
        id.as_u8() < self.replica_count
    }

    /// Maximum simultaneous replica faults tolerated: `⌊(R−1)/2⌋`.
    pub fn fault_max(&self) -> u8 {
        (self.replica_count - 1) / 2
    }

    /// Replication / view-change quorum: `⌊R/2⌋ + 1`. Any two quorums
    /// intersect.
    pub fn quorum(&self) -> usize {
        self.replica_count as usize / 2 + 1
    }

    /// Nacks required to deem an op certainly absent: `f + 1`.
    pub fn quorum_nack(&self) -> usize {
        self.fault_max() as usize + 1
    }

    /// The primary for a view: `view mod replica_count`. Standbys are
    /// outside the rotation.
    pub fn primary_for(&self, view: ViewNumber) -> ReplicaId {
        ReplicaId::new((view.as_u32() % u32::from(self.replica_count)) as u8)
    }

    /// Active replicas in id order.
    pub fn active_replicas(&self) -> impl Iterator<Item = ReplicaId> {
        (0..self.replica_count).map(ReplicaId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(replicas: u8) -> ClusterConfig {
        ClusterConfig::new(ClusterId::new(1), replicas, 0)
    }

    #[test]
    fn quorums() {
        assert_eq!(config(1).quorum(), 1);
        assert_eq!(config(3).quorum(), 2);
        assert_eq!(config(4).quorum(), 3);
        assert_eq!(config(5).quorum(), 3);

        assert_eq!(config(3).fault_max(), 1);
        assert_eq!(config(5).fault_max(), 2);
        assert_eq!(config(3).quorum_nack(), 2);
    }

    #[test]
    fn any_two_quorums_intersect() {
        for replicas in [1u8, 3, 4, 5, 7] {
            let q = config(replicas).quorum();
            assert!(2 * q > replicas as usize, "R={replicas}");
        }
    }

    #[test]
    fn primary_rotation_skips_standbys() {
        let config = ClusterConfig::new(ClusterId::new(1), 3, 2);
        for view in 0..10u32 {
            let primary = config.primary_for(ViewNumber::new(view));
            assert!(config.is_active(primary));
        }
        assert!(config.is_standby(ReplicaId::new(3)));
        assert!(config.is_standby(ReplicaId::new(4)));
        assert!(!config.contains(ReplicaId::new(5)));
    }
}
