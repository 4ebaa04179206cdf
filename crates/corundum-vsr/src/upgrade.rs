//! Rolling release upgrades.
//!
//! Every prepare header carries the release that produced it; the
//! superblock carries the replica's installed release. An upgrade is a
//! distinguished operation: once every active replica advertises the
//! target release in its pongs, the primary stops admitting client
//! requests and fills the last bar before the next checkpoint with
//! `operation = upgrade` prepares announcing the target. When that
//! checkpoint installs with an upgrade-only final bar, the cluster
//! continues on the new release; a replica whose binary does not
//! bundle it exits cleanly to be restarted on the right version.

use std::collections::HashMap;

use corundum_types::{Release, ReplicaId};

/// Release census and upgrade intent.
#[derive(Debug, Clone)]
pub struct UpgradeState {
    /// Releases bundled in this binary, ascending. The last is the
    /// newest this process can run.
    bundled: Vec<Release>,
    /// Newest release each peer's binary bundles (from pongs).
    peer_bundled: HashMap<ReplicaId, Release>,
    /// The release the cluster is upgrading to, once decided.
    target: Option<Release>,
}

impl UpgradeState {
    pub fn new(mut bundled: Vec<Release>) -> Self {
        assert!(!bundled.is_empty(), "a binary bundles at least one release");
        bundled.sort();
        bundled.dedup();
        Self {
            bundled,
            peer_bundled: HashMap::new(),
            target: None,
        }
    }

    /// The newest release this binary can run.
    pub fn release_max(&self) -> Release {
        *self.bundled.last().unwrap()
    }

    pub fn bundles(&self, release: Release) -> bool {
        self.bundled.binary_search(&release).is_ok()
    }

    /// Records a peer's newest bundled release (from its pong).
    pub fn learn_peer(&mut self, peer: ReplicaId, release_max: Release) {
        self.peer_bundled.insert(peer, release_max);
    }

    /// Re-evaluates the upgrade target: the newest release bundled by
    /// this replica and advertised by every active peer, if newer than
    /// `current`.
    pub fn decide_target(
        &mut self,
        current: Release,
        active: impl Iterator<Item = ReplicaId>,
        this_replica: ReplicaId,
    ) -> Option<Release> {
        let candidate = self.release_max();
        if candidate <= current {
            self.target = None;
            return None;
        }
        let all_ready = active
            .filter(|&id| id != this_replica)
            .all(|id| self.peer_bundled.get(&id).is_some_and(|r| *r >= candidate));
        if all_ready {
            if self.target != Some(candidate) {
                tracing::info!(release = %candidate, "upgrade target decided");
            }
            self.target = Some(candidate);
        } else {
            self.target = None;
        }
        self.target
    }

    pub fn target(&self) -> Option<Release> {
        self.target
    }

    pub fn clear_target(&mut self) {
        self.target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(minor: u8) -> Release {
        Release::from_parts(0, minor, 0)
    }

    #[test]
    fn no_target_without_newer_release() {
        let mut state = UpgradeState::new(vec![release(3)]);
        let decided = state.decide_target(
            release(3),
            [ReplicaId::new(0), ReplicaId::new(1)].into_iter(),
            ReplicaId::new(0),
        );
        assert_eq!(decided, None);
    }

    #[test]
    fn target_requires_every_peer_ready() {
        let mut state = UpgradeState::new(vec![release(3), release(4)]);
        let active = || [ReplicaId::new(0), ReplicaId::new(1), ReplicaId::new(2)].into_iter();

        assert_eq!(state.decide_target(release(3), active(), ReplicaId::new(0)), None);

        state.learn_peer(ReplicaId::new(1), release(4));
        assert_eq!(state.decide_target(release(3), active(), ReplicaId::new(0)), None);

        state.learn_peer(ReplicaId::new(2), release(4));
        assert_eq!(
            state.decide_target(release(3), active(), ReplicaId::new(0)),
            Some(release(4))
        );
    }

    #[test]
    fn bundles_is_exact() {
        let state = UpgradeState::new(vec![release(3), release(4)]);
        assert!(state.bundles(release(3)));
        assert!(state.bundles(release(4)));
        assert!(!state.bundles(release(5)));
    }
}
