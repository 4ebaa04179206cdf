//! Tick-counting timeouts.
//!
//! All timing in the core is in scheduler ticks — one tick per
//! `Replica::on_tick` call. Wall time never enters the protocol, which
//! is what lets the simulator compress hours of cluster time into
//! milliseconds and replay any schedule exactly.

use corundum_types::constants::{
    COMMIT_HEARTBEAT_TICKS, PING_TIMEOUT_TICKS, PRIMARY_ABDICATE_TICKS, REPAIR_TIMEOUT_TICKS,
    SCRUB_TIMEOUT_TICKS, VIEW_CHANGE_JITTER_TICKS, VIEW_CHANGE_TIMEOUT_TICKS,
};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// One timeout: counts ticks while ticking, fires at `after`.
///
/// A fired timeout stays fired until reset — the handler decides
/// whether firing in the current status means anything (a timer firing
/// in an incompatible state is a no-op).
#[derive(Debug, Clone)]
pub struct Timeout {
    name: &'static str,
    after: u64,
    ticks: u64,
    ticking: bool,
}

impl Timeout {
    pub fn new(name: &'static str, after: u64) -> Self {
        Self {
            name,
            after,
            ticks: 0,
            ticking: false,
        }
    }

    pub fn start(&mut self) {
        self.ticking = true;
        self.ticks = 0;
    }

    pub fn stop(&mut self) {
        self.ticking = false;
        self.ticks = 0;
    }

    pub fn reset(&mut self) {
        assert!(self.ticking, "reset of stopped timeout {}", self.name);
        self.ticks = 0;
    }

    pub fn tick(&mut self) {
        if self.ticking && self.ticks < u64::MAX {
            self.ticks += 1;
        }
    }

    pub fn fired(&self) -> bool {
        self.ticking && self.ticks >= self.after
    }

    pub fn ticking(&self) -> bool {
        self.ticking
    }

    /// Re-arms with deterministic jitter in `[after, after + jitter)`.
    ///
    /// Spreads replicas' view-change initiations so two candidates
    /// don't perpetually collide.
    pub fn reset_with_jitter(&mut self, base: u64, jitter: u64, prng: &mut ChaCha8Rng) {
        assert!(self.ticking);
        self.after = base + prng.gen_range(0..jitter.max(1));
        self.ticks = 0;
    }
}

/// The replica's timer set (ping, prepare, commit,
/// view_change, primary_abdicate, repair, scrub).
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Liveness probe, all replicas, always ticking.
    pub ping: Timeout,
    /// Primary: re-broadcast the unacked pipeline head.
    pub prepare: Timeout,
    /// Primary: heartbeat commit_max to backups.
    pub commit: Timeout,
    /// Backup: no word from the primary → start a view change.
    /// In view-change status: resend the stalled view-change messages.
    pub view_change: Timeout,
    /// Primary: no prepare_ok from a majority → stop heartbeats.
    pub primary_abdicate: Timeout,
    /// Drive one repair round (WAL bodies, replies, grid blocks).
    pub repair: Timeout,
    /// Drive one grid scrub step.
    pub scrub: Timeout,
}

impl Timeouts {
    pub fn new() -> Self {
        Self {
            ping: Timeout::new("ping", PING_TIMEOUT_TICKS),
            prepare: Timeout::new("prepare", REPAIR_TIMEOUT_TICKS),
            commit: Timeout::new("commit", COMMIT_HEARTBEAT_TICKS),
            view_change: Timeout::new("view_change", VIEW_CHANGE_TIMEOUT_TICKS),
            primary_abdicate: Timeout::new("primary_abdicate", PRIMARY_ABDICATE_TICKS),
            repair: Timeout::new("repair", REPAIR_TIMEOUT_TICKS),
            scrub: Timeout::new("scrub", SCRUB_TIMEOUT_TICKS),
        }
    }

    pub fn tick_all(&mut self) {
        self.ping.tick();
        self.prepare.tick();
        self.commit.tick();
        self.view_change.tick();
        self.primary_abdicate.tick();
        self.repair.tick();
        self.scrub.tick();
    }

    /// Re-arms the view-change timeout with fresh jitter.
    pub fn rearm_view_change(&mut self, prng: &mut ChaCha8Rng) {
        if !self.view_change.ticking() {
            self.view_change.start();
        }
        self.view_change
            .reset_with_jitter(VIEW_CHANGE_TIMEOUT_TICKS, VIEW_CHANGE_JITTER_TICKS, prng);
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn fires_after_configured_ticks() {
        let mut timeout = Timeout::new("test", 3);
        timeout.start();
        for _ in 0..2 {
            timeout.tick();
            assert!(!timeout.fired());
        }
        timeout.tick();
        assert!(timeout.fired());
        timeout.reset();
        assert!(!timeout.fired());
    }

    #[test]
    fn stopped_timeout_never_fires() {
        let mut timeout = Timeout::new("test", 1);
        timeout.tick();
        timeout.tick();
        assert!(!timeout.fired());
    }

    #[test]
    fn jitter_is_deterministic_per_seed() {
        let mut a = Timeout::new("a", 10);
        let mut b = Timeout::new("b", 10);
        a.start();
        b.start();
        let mut prng_a = ChaCha8Rng::seed_from_u64(7);
        let mut prng_b = ChaCha8Rng::seed_from_u64(7);
        a.reset_with_jitter(10, 5, &mut prng_a);
        b.reset_with_jitter(10, 5, &mut prng_b);
        assert_eq!(a.after, b.after);
        assert!((10..15).contains(&a.after));
    }
}
