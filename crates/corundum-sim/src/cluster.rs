//! Cluster harness.
//!
//! Owns every replica's storage across crash/restart cycles, routes
//! replica output through the simulated network, models clients with
//! one-in-flight retry discipline, and checks the protocol's global
//! invariants (agreement above all) after every step.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use corundum_io::Zone;
use corundum_types::{
    Checksum, ClientId, ClusterId, OpNumber, Release, ReplicaId, ReplicaStatus, RequestNumber,
};
use corundum_vsr::{
    ClusterConfig, ExitReason, HashStateMachine, OpenError, Outbound, Recipient, Replica,
    ReplicaOptions, ReplicaOutput,
};
use corundum_wire::{Command, Header, Message, Operation};

use crate::{Endpoint, NetworkOptions, SimNetwork, SimStorage};

/// The application echo operation used by the simulated workload.
pub const OP_ECHO: Operation = Operation::new(Operation::APPLICATION_MIN);

/// Client retry interval in steps.
const CLIENT_RETRY_STEPS: u64 = 40;

type SimReplica = Replica<SimStorage, HashStateMachine>;

/// One replica's lifecycle slot.
pub enum ReplicaSlot {
    Running(Box<SimReplica>),
    Stopped(SimStorage),
    Exited(ExitReason, SimStorage),
}

impl ReplicaSlot {
    pub fn running(&self) -> Option<&SimReplica> {
        match self {
            ReplicaSlot::Running(replica) => Some(replica),
            _ => None,
        }
    }
}

/// Harness construction knobs.
pub struct ClusterOptions {
    pub replica_count: u8,
    pub standby_count: u8,
    pub seed: u64,
    pub network: NetworkOptions,
}

impl ClusterOptions {
    pub fn new(replica_count: u8, standby_count: u8, seed: u64) -> Self {
        Self {
            replica_count,
            standby_count,
            seed,
            network: NetworkOptions::default(),
        }
    }
}

struct SimClient {
    id: ClientId,
    registered: bool,
    request: RequestNumber,
    in_flight: Option<Message>,
    /// Requests still to issue after the in-flight one completes.
    pending: u64,
    replies: Vec<(RequestNumber, Bytes)>,
    since_send: u64,
}

/// The whole simulated cluster.
pub struct Cluster {
    config: ClusterConfig,
    release: Release,
    slots: Vec<ReplicaSlot>,
    network: SimNetwork,
    clients: HashMap<ClientId, SimClient>,
    /// Agreement record: op → the one checksum every replica committed.
    committed: BTreeMap<u64, Checksum>,
    commit_seen: Vec<u64>,
    steps: u64,
}

impl Cluster {
    /// Formats and opens every replica.
    pub fn new(options: ClusterOptions) -> Self {
        let cluster_id = ClusterId::new(0xC0_5EED ^ u128::from(options.seed));
        let config =
            ClusterConfig::new(cluster_id, options.replica_count, options.standby_count);
        let release = Release::from_parts(0, 3, 0);

        let mut slots = Vec::new();
        for id in 0..config.member_count() {
            let replica_id = ReplicaId::new(id);
            let mut storage = SimStorage::new(options.seed.wrapping_add(u64::from(id) * 7919));
            SimReplica::format(&mut storage, config, replica_id, release).expect("format");
            let replica = SimReplica::open(ReplicaOptions {
                storage,
                state_machine: HashStateMachine::new(),
                releases_bundled: vec![release],
            })
            .expect("open freshly formatted replica");
            slots.push(ReplicaSlot::Running(Box::new(replica)));
        }

        Self {
            config,
            release,
            slots,
            network: SimNetwork::new(options.seed.rotate_left(17) ^ 0x4E45_5457, options.network),
            clients: HashMap::new(),
            committed: BTreeMap::new(),
            commit_seen: vec![0; config.member_count() as usize],
            steps: 0,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Steps taken so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn network(&mut self) -> &mut SimNetwork {
        &mut self.network
    }

    // ========================================================================
    // Replica lifecycle controls
    // ========================================================================

    pub fn replica(&self, id: u8) -> &SimReplica {
        self.slots[id as usize]
            .running()
            .expect("replica is not running")
    }

    pub fn is_running(&self, id: u8) -> bool {
        matches!(self.slots[id as usize], ReplicaSlot::Running(_))
    }

    pub fn exit_reason(&self, id: u8) -> Option<&ExitReason> {
        match &self.slots[id as usize] {
            ReplicaSlot::Exited(reason, _) => Some(reason),
            _ => None,
        }
    }

    /// Crash-stops a replica: unsynced writes are lost (torn per
    /// sector) and the storage is kept for a later restart.
    pub fn stop(&mut self, id: u8) {
        let slot = std::mem::replace(
            &mut self.slots[id as usize],
            ReplicaSlot::Stopped(SimStorage::new(0)),
        );
        let mut storage = match slot {
            ReplicaSlot::Running(replica) => replica.into_storage(),
            ReplicaSlot::Stopped(storage) | ReplicaSlot::Exited(_, storage) => storage,
        };
        storage.crash();
        self.slots[id as usize] = ReplicaSlot::Stopped(storage);
    }

    /// Restarts a stopped replica from its surviving storage.
    pub fn restart(&mut self, id: u8) -> Result<(), OpenError> {
        let slot = std::mem::replace(
            &mut self.slots[id as usize],
            ReplicaSlot::Stopped(SimStorage::new(0)),
        );
        let storage = match slot {
            ReplicaSlot::Stopped(storage) | ReplicaSlot::Exited(_, storage) => storage,
            ReplicaSlot::Running(_) => panic!("replica {id} is already running"),
        };
        match SimReplica::open(ReplicaOptions {
            storage,
            state_machine: HashStateMachine::new(),
            releases_bundled: vec![self.release],
        }) {
            Ok(replica) => {
                self.commit_seen[id as usize] = replica.op_checkpoint().as_u64();
                self.slots[id as usize] = ReplicaSlot::Running(Box::new(replica));
                Ok(())
            }
            Err(error) => {
                // The storage is consumed by the failed open; tests
                // that need it again reformat.
                self.slots[id as usize] = ReplicaSlot::Stopped(SimStorage::new(0));
                Err(error)
            }
        }
    }

    /// Direct storage access for fault injection on a stopped or
    /// running replica.
    pub fn storage_mut(&mut self, id: u8) -> &mut SimStorage {
        match &mut self.slots[id as usize] {
            ReplicaSlot::Running(replica) => replica.storage_mut(),
            ReplicaSlot::Stopped(storage) | ReplicaSlot::Exited(_, storage) => storage,
        }
    }

    // ========================================================================
    // Client workload
    // ========================================================================

    /// Creates a client that will register and then issue `requests`
    /// echo operations, one in flight at a time, retrying as needed.
    pub fn add_client(&mut self, id: u64, requests: u64) {
        let client = ClientId::new(id);
        self.clients.insert(
            client,
            SimClient {
                id: client,
                registered: false,
                request: RequestNumber::ZERO,
                in_flight: None,
                pending: requests,
                replies: Vec::new(),
                since_send: 0,
            },
        );
    }

    /// Queues more work on an existing client.
    pub fn add_requests(&mut self, id: u64, requests: u64) {
        self.clients
            .get_mut(&ClientId::new(id))
            .expect("unknown client")
            .pending += requests;
    }

    pub fn client_replies(&self, id: u64) -> &[(RequestNumber, Bytes)] {
        &self.clients[&ClientId::new(id)].replies
    }

    pub fn clients_idle(&self) -> bool {
        self.clients
            .values()
            .all(|c| c.pending == 0 && c.in_flight.is_none())
    }

    // ========================================================================
    // Stepping
    // ========================================================================

    /// One step: every running replica ticks, clients act, and all
    /// in-flight messages are delivered.
    pub fn step(&mut self) {
        self.steps += 1;

        for id in 0..self.slots.len() {
            let output = match &mut self.slots[id] {
                ReplicaSlot::Running(replica) => replica.on_tick(),
                _ => continue,
            };
            self.route(ReplicaId::new(id as u8), output);
        }

        self.step_clients();

        // Deliver until the network quiesces for this step.
        loop {
            let batch = self.network.drain();
            if batch.is_empty() {
                break;
            }
            for (to, message) in batch {
                match to {
                    Endpoint::Replica(replica_id) => self.deliver_to_replica(replica_id, message),
                    Endpoint::Client(client_id) => self.deliver_to_client(client_id, message),
                }
            }
        }

        self.check_agreement();
    }

    /// Runs `steps` steps.
    pub fn run(&mut self, steps: u64) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Steps until `predicate` holds, panicking after `max_steps`.
    pub fn run_until(&mut self, max_steps: u64, mut predicate: impl FnMut(&Cluster) -> bool) {
        for _ in 0..max_steps {
            if predicate(self) {
                return;
            }
            self.step();
        }
        panic!("predicate not reached within {max_steps} steps");
    }

    fn deliver_to_replica(&mut self, id: ReplicaId, message: Message) {
        let output = match &mut self.slots[id.as_usize()] {
            ReplicaSlot::Running(replica) => replica.on_message(message),
            _ => return,
        };
        self.route(id, output);
    }

    fn route(&mut self, from: ReplicaId, output: ReplicaOutput) {
        if let Some(reason) = output.exit {
            tracing::info!(replica = %from, ?reason, "replica exited");
            let slot = std::mem::replace(
                &mut self.slots[from.as_usize()],
                ReplicaSlot::Stopped(SimStorage::new(0)),
            );
            if let ReplicaSlot::Running(replica) = slot {
                self.slots[from.as_usize()] = ReplicaSlot::Exited(reason, replica.into_storage());
            }
            return;
        }
        for Outbound { to, message } in output.outbound {
            match to {
                Recipient::Replica(id) => {
                    self.network.submit(from, Endpoint::Replica(id), message);
                }
                Recipient::AllReplicas => {
                    for id in 0..self.config.member_count() {
                        let id = ReplicaId::new(id);
                        if id != from {
                            self.network
                                .submit(from, Endpoint::Replica(id), message.clone());
                        }
                    }
                }
                Recipient::Client(id) => {
                    self.network.submit(from, Endpoint::Client(id), message);
                }
            }
        }
    }

    // ========================================================================
    // Clients
    // ========================================================================

    fn step_clients(&mut self) {
        let cluster = self.config.cluster();
        // Clients address the primary of the highest view they can
        // see; resolution is approximated by broadcasting to actives.
        let mut sends: Vec<Message> = Vec::new();
        for client in self.clients.values_mut() {
            client.since_send += 1;
            if let Some(message) = &client.in_flight {
                if client.since_send >= CLIENT_RETRY_STEPS {
                    client.since_send = 0;
                    sends.push(message.clone());
                }
                continue;
            }
            if !client.registered {
                let message = client_request(cluster, client.id, RequestNumber::ZERO, Operation::REGISTER, &[]);
                client.in_flight = Some(message.clone());
                client.since_send = 0;
                sends.push(message);
                continue;
            }
            if client.pending > 0 {
                let request = client.request.next();
                let body = request.as_u64().to_le_bytes();
                let message = client_request(cluster, client.id, request, OP_ECHO, &body);
                client.in_flight = Some(message.clone());
                client.since_send = 0;
                sends.push(message);
            }
        }
        for message in sends {
            // Deliver the request to every active replica; non-primaries
            // ignore it (clients in production track the primary, the
            // sim keeps it simple and idempotent).
            for id in self.config.active_replicas() {
                self.network.submit_from_client(id, message.clone());
            }
        }
    }

    fn deliver_to_client(&mut self, id: ClientId, reply: Message) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let header = reply.header();
        if header.command != Command::Reply {
            return;
        }
        let Some(in_flight) = &client.in_flight else {
            return; // Duplicate reply after completion.
        };
        let sent_request = in_flight.header().request;
        let sent_operation = in_flight.header().operation;

        if !client.registered {
            if header.request == RequestNumber::ZERO {
                client.registered = true;
                client.in_flight = None;
            }
            return;
        }
        if header.operation == Operation::REGISTER && sent_operation != Operation::REGISTER {
            // Session evicted: re-register, then re-issue.
            client.registered = false;
            client.in_flight = None;
            return;
        }
        if header.request == sent_request {
            client.replies.push((header.request, reply.body().clone()));
            client.request = header.request;
            client.pending = client.pending.saturating_sub(1);
            client.in_flight = None;
        }
    }

    // ========================================================================
    // Invariant checking and convergence probes
    // ========================================================================

    /// Agreement (property 1): every replica that commits op `o`
    /// commits the same prepare.
    fn check_agreement(&mut self) {
        for id in 0..self.slots.len() {
            let ReplicaSlot::Running(replica) = &self.slots[id] else {
                continue;
            };
            let commit = replica.commit_min().as_u64();
            let seen = &mut self.commit_seen[id];
            if *seen < replica.op_checkpoint().as_u64() {
                // A sync jumped this replica over ops it never held.
                *seen = replica.op_checkpoint().as_u64();
            }
            for op in (*seen + 1)..=commit {
                let Some(checksum) = replica.journal().checksum_for_op(OpNumber::new(op)) else {
                    continue; // Slot already reused; checked when committed.
                };
                match self.committed.get(&op) {
                    Some(expected) => assert_eq!(
                        *expected, checksum,
                        "agreement violation at op {op}: replica {id} diverged"
                    ),
                    None => {
                        self.committed.insert(op, checksum);
                    }
                }
            }
            *seen = commit;
        }
    }

    /// True when every running replica reports the same commit and the
    /// same state digest.
    pub fn converged(&self) -> bool {
        let mut commits = Vec::new();
        let mut digests = Vec::new();
        for slot in &self.slots {
            if let Some(replica) = slot.running() {
                commits.push(replica.commit_min());
                digests.push(replica.state_machine().digest());
            }
        }
        commits.windows(2).all(|w| w[0] == w[1]) && digests.windows(2).all(|w| w[0] == w[1])
    }

    /// The highest commit across running replicas.
    pub fn commit_max(&self) -> OpNumber {
        self.slots
            .iter()
            .filter_map(|slot| slot.running().map(|r| r.commit_min()))
            .max()
            .unwrap_or(OpNumber::ZERO)
    }

    /// True if exactly one running active replica is a normal-status
    /// primary.
    pub fn single_primary(&self) -> bool {
        let primaries = self
            .slots
            .iter()
            .filter_map(|slot| slot.running())
            .filter(|r| r.is_primary() && r.status() == ReplicaStatus::Normal)
            .count();
        primaries == 1
    }

    /// Actual grid corruption on a replica: live blocks whose stored
    /// bytes no longer hash to their indexed checksum. This is the
    /// ground truth the scrubber's monotonicity property is stated
    /// over (its own faulty set lags discovery).
    pub fn grid_corrupt_count(&self, id: u8) -> usize {
        let replica = self.replica(id);
        let zone = replica.storage().zone_bytes(Zone::Grid);
        let cell = Zone::Grid.cell_size();
        replica
            .grid()
            .iter_live()
            .filter(|block| {
                let start = block.address.index() * cell;
                let len = u32::from_le_bytes(zone[start..start + 4].try_into().unwrap()) as usize;
                if len > cell - 4 {
                    return true;
                }
                corundum_crypto::checksum(&zone[start + 4..start + 4 + len]) != block.checksum
            })
            .count()
    }

    /// Compares two replicas' grids byte-for-byte over every live
    /// address (free addresses may hold divergent stale bytes).
    pub fn grids_identical(&self, a: u8, b: u8) -> bool {
        let ra = self.replica(a);
        let rb = self.replica(b);
        if ra.grid().snapshot() != rb.grid().snapshot() {
            return false;
        }
        let za = ra.storage().zone_bytes(Zone::Grid);
        let zb = rb.storage().zone_bytes(Zone::Grid);
        let cell = Zone::Grid.cell_size();
        for block in ra.grid().iter_live() {
            let start = block.address.index() * cell;
            let len = u32::from_le_bytes(za[start..start + 4].try_into().unwrap()) as usize;
            let span = (4 + len).min(cell);
            if za[start..start + span] != zb[start..start + span] {
                return false;
            }
        }
        true
    }
}

/// Builds a sealed client request message.
fn client_request(
    cluster: ClusterId,
    client: ClientId,
    request: RequestNumber,
    operation: Operation,
    body_bytes: &[u8],
) -> Message {
    let mut header = Header::new(cluster, Command::Request);
    header.client = client;
    header.request = request;
    header.operation = operation;
    header.release = Release::from_parts(0, 3, 0);
    header.set_checksum_body(body_bytes);
    header.set_checksum();
    Message::new(header, Bytes::copy_from_slice(body_bytes))
}
