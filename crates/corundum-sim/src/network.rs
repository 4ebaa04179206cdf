//! Simulated network.
//!
//! Carries whole messages between endpoints under an adversarial
//! fault model: arbitrary drop, duplication, and reordering, plus explicit
//! partitions. Delivery order is deterministic under a seed — the same
//! seed replays the same schedule.

use std::collections::{HashSet, VecDeque};

use corundum_types::{ClientId, ReplicaId};
use corundum_wire::Message;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A message destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Replica(ReplicaId),
    Client(ClientId),
}

/// Probabilistic fault knobs. All zero by default: the scenario tests
/// prefer explicit faults over noise.
#[derive(Debug, Clone, Copy)]
pub struct NetworkOptions {
    pub drop_probability: f64,
    pub duplicate_probability: f64,
    pub reorder_probability: f64,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            drop_probability: 0.0,
            duplicate_probability: 0.0,
            reorder_probability: 0.0,
        }
    }
}

/// The in-flight message queue plus partition state.
#[derive(Debug)]
pub struct SimNetwork {
    queue: VecDeque<(ReplicaId, Endpoint, Message)>,
    /// Directed replica links currently severed.
    cut: HashSet<(ReplicaId, ReplicaId)>,
    /// Replicas cut off from clients as well.
    isolated: HashSet<ReplicaId>,
    options: NetworkOptions,
    rng: ChaCha8Rng,
}

impl SimNetwork {
    pub fn new(seed: u64, options: NetworkOptions) -> Self {
        Self {
            queue: VecDeque::new(),
            cut: HashSet::new(),
            isolated: HashSet::new(),
            options,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    // ========================================================================
    // Topology controls
    // ========================================================================

    /// Severs both directions between two replicas.
    pub fn partition(&mut self, a: ReplicaId, b: ReplicaId) {
        self.cut.insert((a, b));
        self.cut.insert((b, a));
    }

    pub fn heal(&mut self, a: ReplicaId, b: ReplicaId) {
        self.cut.remove(&(a, b));
        self.cut.remove(&(b, a));
    }

    /// Fully isolates a replica from replicas and clients.
    pub fn isolate(&mut self, replica: ReplicaId) {
        self.isolated.insert(replica);
    }

    pub fn rejoin(&mut self, replica: ReplicaId) {
        self.isolated.remove(&replica);
        self.cut.retain(|&(a, b)| a != replica && b != replica);
    }

    fn link_up(&self, from: ReplicaId, to: Endpoint) -> bool {
        if self.isolated.contains(&from) {
            return false;
        }
        match to {
            Endpoint::Replica(replica) => {
                !self.isolated.contains(&replica) && !self.cut.contains(&(from, replica))
            }
            Endpoint::Client(_) => true,
        }
    }

    // ========================================================================
    // Transmission
    // ========================================================================

    /// Submits a message. Partition checks apply at submission — a
    /// message in flight when the link was up still arrives.
    pub fn submit(&mut self, from: ReplicaId, to: Endpoint, message: Message) {
        if !self.link_up(from, to) {
            return;
        }
        if self.options.drop_probability > 0.0 && self.rng.gen_bool(self.options.drop_probability)
        {
            return;
        }
        self.queue.push_back((from, to, message.clone()));
        if self.options.duplicate_probability > 0.0
            && self.rng.gen_bool(self.options.duplicate_probability)
        {
            self.queue.push_back((from, to, message));
        }
    }

    /// Client-to-replica submission (clients are never partitioned
    /// from each other, only isolated replicas are unreachable).
    pub fn submit_from_client(&mut self, to: ReplicaId, message: Message) {
        if self.isolated.contains(&to) {
            return;
        }
        // Client traffic enters the same queue; the sender field is
        // unused for link checks once the recipient is known up.
        self.queue.push_back((to, Endpoint::Replica(to), message));
    }

    /// Takes everything currently in flight, possibly reordered.
    pub fn drain(&mut self) -> Vec<(Endpoint, Message)> {
        let mut batch: Vec<(Endpoint, Message)> = self
            .queue
            .drain(..)
            .map(|(_, to, message)| (to, message))
            .collect();
        if self.options.reorder_probability > 0.0 && batch.len() > 1 {
            for i in (1..batch.len()).rev() {
                if self.rng.gen_bool(self.options.reorder_probability) {
                    let j = self.rng.gen_range(0..=i);
                    batch.swap(i, j);
                }
            }
        }
        batch
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }
}
