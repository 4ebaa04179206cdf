//! The VSR replica.
//!
//! [`Replica`] composes the durable substrate (superblock, WAL, grid,
//! reply cache) with the protocol state machine. It is driven entirely
//! from outside: the owner delivers validated messages via
//! [`Replica::on_message`] and scheduler ticks via
//! [`Replica::on_tick`], and transmits whatever the returned
//! [`ReplicaOutput`] asks for. No wall clock, no sockets, no threads —
//! which is what makes every protocol decision reproducible under the
//! simulator.
//!
//! Handler modules:
//! - [`normal`]: requests, prepares, acks, commits, liveness
//! - [`view_change`]: start_view_change / do_view_change / start_view
//! - [`recovery`]: open-time classification and `recovering_head`
//! - [`repair`]: WAL body, header, reply, and grid block repair
//! - [`sync`]: checkpoint-level state sync

mod normal;
mod recovery;
mod repair;
mod sync;
mod view_change;

use std::collections::HashMap;

use bytes::Bytes;
use corundum_io::Storage;
use corundum_storage::{
    ClientReplies, Grid, GridScrubber, Superblock, SuperblockError, SuperblockImage, Wal,
};
use corundum_types::constants::{
    checkpoint_for_op, prepare_max_for_checkpoint, trigger_for_checkpoint, BAR_LENGTH,
};
use corundum_types::{
    Checksum, ClientId, CommitNumber, OpNumber, Release, ReplicaId, ReplicaStatus, Timestamp,
    ViewNumber,
};
use corundum_wire::{body, Command, Header, Message, Operation};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::{ClientSessions, ClusterConfig, Journal, Pipeline, StateMachine, Timeouts, UpgradeState};

pub(crate) use sync::SyncState;
pub(crate) use view_change::DvcReceived;

// ============================================================================
// Output
// ============================================================================

/// Where a message goes. The transport resolves recipients to
/// addresses; the replica only names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Replica(ReplicaId),
    /// Every other cluster member, standbys included.
    AllReplicas,
    Client(ClientId),
}

/// One message to transmit.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: Recipient,
    pub message: Message,
}

/// Why the process must stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Unrecoverable WAL corruption with no peers to repair from.
    WalCorrupt,
    /// The cluster moved to a release this binary does not bundle;
    /// the operator must restart with the right binary.
    ReleaseMismatch { required: Release },
}

/// Everything a handler decided: messages to send, and possibly a
/// clean process exit.
#[derive(Debug, Default)]
pub struct ReplicaOutput {
    pub outbound: Vec<Outbound>,
    pub exit: Option<ExitReason>,
}

impl ReplicaOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn send(&mut self, to: Recipient, message: Message) {
        self.outbound.push(Outbound { to, message });
    }

    pub(crate) fn send_replica(&mut self, to: ReplicaId, message: Message) {
        self.send(Recipient::Replica(to), message);
    }

    pub(crate) fn broadcast(&mut self, message: Message) {
        self.send(Recipient::AllReplicas, message);
    }
}

// ============================================================================
// Options and errors
// ============================================================================

/// Inputs to [`Replica::open`].
pub struct ReplicaOptions<S, M> {
    pub storage: S,
    pub state_machine: M,
    /// Releases this binary bundles, any order.
    pub releases_bundled: Vec<Release>,
}

/// Why a replica failed to open.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Superblock(#[from] SuperblockError),
    #[error("unrecoverable WAL corruption and no peers to repair from")]
    WalCorrupt,
    #[error("data file is at release {release}, which this binary does not bundle")]
    ReleaseNotBundled { release: Release },
    #[error("superblock snapshot is internally inconsistent")]
    SnapshotCorrupt,
}

// ============================================================================
// Replica
// ============================================================================

/// A single Corundum replica.
pub struct Replica<S: Storage, M: StateMachine> {
    // --- identity ---
    pub(crate) config: ClusterConfig,
    pub(crate) replica_id: ReplicaId,
    pub(crate) standby: bool,
    pub(crate) release: Release,

    // --- durable substrate ---
    pub(crate) storage: S,
    pub(crate) superblock: Superblock,
    pub(crate) journal: Journal,
    pub(crate) grid: Grid,
    pub(crate) scrubber: GridScrubber,
    pub(crate) sessions: ClientSessions,
    pub(crate) state_machine: M,

    // --- protocol positions ---
    pub(crate) status: ReplicaStatus,
    pub(crate) view: ViewNumber,
    pub(crate) log_view: ViewNumber,
    pub(crate) op_head: OpNumber,
    pub(crate) commit_min: OpNumber,
    pub(crate) commit_max: OpNumber,
    /// Checksum of the prepare at `commit_min` — the hash-chain anchor.
    pub(crate) commit_parent: Checksum,
    pub(crate) timestamp: Timestamp,

    // --- primary state ---
    pub(crate) pipeline: Pipeline,
    pub(crate) abdicating: bool,

    // --- view change state ---
    pub(crate) svc_votes: std::collections::HashSet<ReplicaId>,
    pub(crate) dvc_received: HashMap<ReplicaId, DvcReceived>,
    /// While the primary-elect repairs its canonical log: the
    /// commit_max the formed view will start from.
    pub(crate) vc_target_commit: Option<OpNumber>,

    // --- recovery / sync ---
    pub(crate) sync: Option<SyncState>,
    pub(crate) peer_checkpoints: HashMap<ReplicaId, (OpNumber, Checksum)>,

    // --- upgrades ---
    pub(crate) upgrade: UpgradeState,

    // --- scheduling ---
    pub(crate) timeouts: Timeouts,
    pub(crate) prng: ChaCha8Rng,
    pub(crate) repair_round_robin: u8,
}

impl<S: Storage, M: StateMachine> Replica<S, M> {
    // ========================================================================
    // Format
    // ========================================================================

    /// Initializes a data file for a new replica: superblock, WAL, and
    /// reply cache. The grid starts empty (all addresses free).
    pub fn format(
        storage: &mut S,
        config: ClusterConfig,
        replica_id: ReplicaId,
        release: Release,
    ) -> Result<(), SuperblockError> {
        assert!(config.contains(replica_id), "replica must be a cluster member");
        let image = SuperblockImage::initial(
            config.cluster(),
            replica_id,
            config.replica_count(),
            config.standby_count(),
            release,
        );
        Superblock::format(storage, image)?;
        Wal::format(storage)?;
        ClientReplies::format(storage)?;
        tracing::info!(cluster = %config.cluster(), replica = %replica_id, "formatted data file");
        Ok(())
    }

    // ========================================================================
    // Open
    // ========================================================================

    /// Opens a formatted data file and recovers the replica. The
    /// returned replica is ready for `on_message` / `on_tick`.
    pub fn open(options: ReplicaOptions<S, M>) -> Result<Self, OpenError> {
        let ReplicaOptions {
            mut storage,
            mut state_machine,
            releases_bundled,
        } = options;

        let superblock = Superblock::open(&mut storage)?;
        let image = superblock.working().clone();
        let config = ClusterConfig::new(image.cluster, image.replica_count, image.standby_count);
        let replica_id = image.replica;
        let standby = config.is_standby(replica_id);

        let upgrade = UpgradeState::new(releases_bundled);
        if !upgrade.bundles(image.release) {
            return Err(OpenError::ReleaseNotBundled {
                release: image.release,
            });
        }

        let grid = Grid::from_snapshot(&image.free_set, &image.grid_index)
            .ok_or(OpenError::SnapshotCorrupt)?;
        let sessions = ClientSessions::from_snapshot(&image.sessions);
        state_machine.install_checkpoint(&image.state_payload);

        let seed = (image.cluster.as_u128() as u64) ^ (u64::from(replica_id.as_u8()) << 56);
        let mut replica = Self {
            config,
            replica_id,
            standby,
            release: image.release,
            storage,
            superblock,
            journal: Journal::new(),
            grid,
            scrubber: GridScrubber::new(replica_id),
            sessions,
            state_machine,
            status: ReplicaStatus::Recovering,
            view: image.vsr_state.view,
            log_view: image.vsr_state.log_view,
            op_head: image.vsr_state.commit_min,
            commit_min: image.vsr_state.commit_min,
            commit_max: image.vsr_state.commit_min,
            commit_parent: image.vsr_state.commit_min_checksum,
            timestamp: Timestamp::EPOCH,
            pipeline: Pipeline::new(),
            abdicating: false,
            svc_votes: Default::default(),
            dvc_received: HashMap::new(),
            vc_target_commit: None,
            sync: None,
            peer_checkpoints: HashMap::new(),
            upgrade,
            timeouts: Timeouts::new(),
            prng: ChaCha8Rng::seed_from_u64(seed),
            repair_round_robin: 0,
        };

        replica.recover_journal()?;
        replica.start_timeouts();

        // A single-replica cluster is its own quorum: everything in
        // the journal re-commits immediately (WAL replay re-derives
        // the state from the last checkpoint).
        if replica.config.replica_count() == 1 && replica.status == ReplicaStatus::Normal {
            let mut replay = ReplicaOutput::empty();
            replica.advance_commit_max(replica.op_head);
            replica.commit_journal(&mut replay);
            if let Some(ExitReason::ReleaseMismatch { required }) = replay.exit {
                return Err(OpenError::ReleaseNotBundled { release: required });
            }
        }

        replica.invariants();
        Ok(replica)
    }

    // ========================================================================
    // Accessors (tests and harnesses)
    // ========================================================================

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn status(&self) -> ReplicaStatus {
        self.status
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn op_head(&self) -> OpNumber {
        self.op_head
    }

    pub fn commit_min(&self) -> OpNumber {
        self.commit_min
    }

    pub fn commit_max(&self) -> OpNumber {
        self.commit_max
    }

    pub fn op_checkpoint(&self) -> OpNumber {
        self.superblock.working().vsr_state.op_checkpoint
    }

    pub fn checkpoint_id(&self) -> Checksum {
        self.superblock.working().vsr_state.checkpoint_id
    }

    pub fn release(&self) -> Release {
        self.release
    }

    /// The persisted state-sync bounds: nonzero while the installed
    /// checkpoint was adopted from a peer rather than produced by
    /// local commits (cleared by the next local checkpoint).
    pub fn sync_bounds(&self) -> (OpNumber, OpNumber) {
        let vsr = &self.superblock.working().vsr_state;
        (vsr.sync_op_min, vsr.sync_op_max)
    }

    pub fn is_standby(&self) -> bool {
        self.standby
    }

    pub fn is_primary(&self) -> bool {
        !self.standby && self.config.primary_for(self.view) == self.replica_id
    }

    pub fn primary(&self) -> ReplicaId {
        self.config.primary_for(self.view)
    }

    pub fn state_machine(&self) -> &M {
        &self.state_machine
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Tears the replica down, handing back its storage (the sim
    /// harness keeps the "disk" across crash/restart cycles).
    pub fn into_storage(self) -> S {
        self.storage
    }

    pub fn grid_faulty_count(&self) -> usize {
        self.scrubber.faulty_count()
    }

    // ========================================================================
    // Event entry points
    // ========================================================================

    /// Handles one validated message. The caller has already verified
    /// cluster id and both checksums (`Message::decode`).
    pub fn on_message(&mut self, message: Message) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        let header = *message.header();

        // Replica-originated messages must come from a cluster member.
        let from = header.replica;
        if header.command != Command::Request && !self.config.contains(from) {
            tracing::warn!(from = %from, command = %header.command, "message from unknown replica");
            return output;
        }

        match header.command {
            Command::Request => self.on_request(message, &mut output),
            Command::Prepare => self.on_prepare(message, &mut output),
            Command::PrepareOk => self.on_prepare_ok(&header, &mut output),
            Command::Commit => self.on_commit(&header, &mut output),
            Command::Ping => self.on_ping(&header, &mut output),
            Command::Pong => self.on_pong(&message, &mut output),
            Command::Reply => self.on_reply_forwarded(&message, &mut output),
            Command::StartViewChange => self.on_start_view_change(&header, &mut output),
            Command::DoViewChange => self.on_do_view_change(&message, &mut output),
            Command::StartView => self.on_start_view(&message, &mut output),
            Command::RequestStartView => self.on_request_start_view(&header, &mut output),
            Command::RequestPrepare => self.on_request_prepare(&message, &mut output),
            Command::RequestHeaders => self.on_request_headers(&message, &mut output),
            Command::Headers => self.on_headers(&message, &mut output),
            Command::RequestReply => self.on_request_reply(&header, &mut output),
            Command::RequestBlock => self.on_request_block(&message, &mut output),
            Command::Block => self.on_block(&message, &mut output),
            Command::RequestSyncCheckpoint => self.on_request_sync_checkpoint(&message, &mut output),
            Command::SyncCheckpoint => self.on_sync_checkpoint(&message, &mut output),
        }

        self.invariants();
        output
    }

    /// One scheduler tick: advances every timeout and runs the
    /// handlers of those that fired. A timeout firing in a status its
    /// handler does not apply to is a no-op.
    pub fn on_tick(&mut self) -> ReplicaOutput {
        let mut output = ReplicaOutput::empty();
        self.timeouts.tick_all();

        if self.timeouts.ping.fired() {
            self.timeouts.ping.reset();
            self.send_ping(&mut output);
        }

        if self.timeouts.commit.fired() {
            self.timeouts.commit.reset();
            if self.is_primary() && self.status == ReplicaStatus::Normal && !self.abdicating {
                self.broadcast_commit(&mut output);
            }
        }

        if self.timeouts.prepare.fired() {
            self.timeouts.prepare.reset();
            if self.is_primary() && self.status == ReplicaStatus::Normal && !self.abdicating {
                if let Some(head) = self.pipeline.head() {
                    output.broadcast(head.message.clone());
                }
            }
        }

        if self.timeouts.primary_abdicate.fired() {
            self.timeouts.primary_abdicate.reset();
            if self.is_primary()
                && self.status == ReplicaStatus::Normal
                && self.pipeline.prepare_count() > 0
                && !self.abdicating
            {
                // Prepares outstanding with no ack from a majority for
                // a long time: this side of the partition can send but
                // not hear. Go quiet and let a new view form.
                tracing::warn!(replica = %self.replica_id, view = %self.view, "primary abdicating");
                self.abdicating = true;
            }
        }

        if self.timeouts.view_change.fired() {
            self.on_view_change_timeout(&mut output);
        }

        if self.timeouts.repair.fired() {
            self.timeouts.repair.reset();
            self.on_repair_timeout(&mut output);
        }

        if self.timeouts.scrub.fired() {
            self.timeouts.scrub.reset();
            self.on_scrub_timeout(&mut output);
        }

        self.invariants();
        output
    }

    // ========================================================================
    // Message building
    // ========================================================================

    /// A header stamped with this replica's identity and view.
    pub(crate) fn base_header(&self, command: Command) -> Header {
        let mut header = Header::new(self.config.cluster(), command);
        header.replica = self.replica_id;
        header.view = self.view;
        header.commit = CommitNumber::new(self.commit_max);
        header.release = self.release;
        header
    }

    /// Seals a header with a body into a message.
    pub(crate) fn message_with_body(&self, mut header: Header, body_bytes: Vec<u8>) -> Message {
        header.set_checksum_body(&body_bytes);
        header.set_checksum();
        Message::new(header, Bytes::from(body_bytes))
    }

    /// Seals a body-less header into a message.
    pub(crate) fn message(&self, mut header: Header) -> Message {
        header.set_checksum_body(&[]);
        header.set_checksum();
        Message::from_header(header)
    }

    // ========================================================================
    // Commit path (shared by primary and backups)
    // ========================================================================

    /// Raises the cluster commit high-water mark.
    pub(crate) fn advance_commit_max(&mut self, commit: OpNumber) {
        if commit > self.commit_max {
            self.commit_max = commit;
        }
    }

    /// Applies committed ops from the WAL, in order, as far as the
    /// journal allows. Stops at the first op whose body is not locally
    /// intact — repair fills the hole and commit resumes later.
    pub(crate) fn commit_journal(&mut self, output: &mut ReplicaOutput) {
        while self.commit_min < self.commit_max.min(self.op_head) {
            if output.exit.is_some() {
                return;
            }
            let next = self.commit_min.next();
            if !self.journal.has_prepare(next) {
                return;
            }
            let checksum = self.journal.checksum_for_op(next).unwrap();
            let prepare = match Wal::read_prepare_if(
                &mut self.storage,
                self.config.cluster(),
                next.slot(),
                checksum,
            ) {
                corundum_storage::PrepareRead::Ok(prepare) => prepare,
                corundum_storage::PrepareRead::Missing => {
                    // The journal believed the body was intact; the
                    // media disagrees. Reclassify and repair.
                    let header = *self.journal.header_for_op(next).unwrap();
                    self.journal.set_header_dirty(header);
                    return;
                }
            };
            self.commit_prepare(&prepare, output);
        }
    }

    /// Applies one committed prepare: hash chain check, release gate,
    /// state machine, reply cache, checkpoint trigger.
    pub(crate) fn commit_prepare(&mut self, prepare: &Message, output: &mut ReplicaOutput) {
        let header = *prepare.header();
        assert_eq!(header.op, self.commit_min.next(), "commits are in op order");

        // A backup never commits an op whose parent does not match the
        // committed prefix. A mismatch here means the local entry is a
        // leftover from a dead view: discard it and repair the
        // canonical content from peers.
        if header.parent != self.commit_parent {
            tracing::warn!(
                replica = %self.replica_id,
                op = %header.op,
                "entry does not chain onto the committed prefix; repairing"
            );
            self.journal.clear_slot(header.op.slot());
            self.send_request_headers(self.commit_min.next(), self.op_head, output);
            return;
        }

        if !self.upgrade.bundles(header.release) {
            tracing::error!(
                required = %header.release,
                "prepare requires a release this binary does not bundle"
            );
            output.exit = Some(ExitReason::ReleaseMismatch {
                required: header.release,
            });
            return;
        }

        self.timestamp = self.timestamp.max(header.timestamp);

        let reply_body = match header.operation {
            Operation::NOOP => Bytes::new(),
            Operation::UPGRADE => Bytes::new(),
            Operation::REGISTER => {
                self.sessions.register(header.client, header.op);
                Bytes::new()
            }
            operation => {
                self.state_machine.prefetch(
                    &mut self.storage,
                    &self.grid,
                    operation,
                    prepare.body(),
                );
                self.state_machine
                    .commit(header.op, header.timestamp, operation, prepare.body())
            }
        };

        self.commit_min = header.op;
        self.commit_parent = header.checksum;
        self.advance_commit_max(header.op);

        if !header.client.is_none() {
            self.persist_reply(&header, reply_body, output);
        }

        self.maybe_checkpoint(output);
    }

    /// Builds the reply, persists it in the session's cache slot, and
    /// (on the primary) delivers it.
    ///
    /// Every reply field derives from the prepare alone, never from
    /// the committing replica's state: replies must be byte-identical
    /// across replicas and across replays, because their checksums
    /// live in the session table and the session table is part of the
    /// checkpoint identity.
    fn persist_reply(&mut self, prepare: &Header, body: Bytes, output: &mut ReplicaOutput) {
        let mut reply = Header::new(self.config.cluster(), Command::Reply);
        reply.replica = prepare.replica;
        reply.view = prepare.view;
        reply.release = prepare.release;
        reply.commit = prepare.commit;
        reply.client = prepare.client;
        reply.request = prepare.request;
        reply.op = prepare.op;
        reply.operation = prepare.operation;
        reply.timestamp = prepare.timestamp;
        // Bind the reply to the exact prepare it answers.
        reply.parent = prepare.checksum;
        let reply = self.message_with_body(reply, body.to_vec());

        let session = match self.sessions.get(prepare.client) {
            Some(session) => *session,
            None => {
                // The session was evicted between prepare and commit.
                // The reply cannot be cached; the client re-registers.
                tracing::warn!(client = %prepare.client, "reply for evicted session dropped");
                return;
            }
        };

        if let Err(fault) =
            ClientReplies::write_reply(&mut self.storage, session.slot as usize, &reply)
        {
            // A failed cache write is repairable from peers later; the
            // reply itself still goes out.
            tracing::warn!(%fault, "reply cache write fault");
        }

        if prepare.operation == Operation::REGISTER {
            self.sessions
                .set_reply_checksum(prepare.client, reply.header().checksum);
        } else {
            self.sessions.commit_request(
                prepare.client,
                prepare.request,
                reply.header().checksum,
                prepare.op,
            );
        }

        if self.is_primary() && self.status == ReplicaStatus::Normal {
            output.send(Recipient::Client(prepare.client), reply);
        }
    }

    // ========================================================================
    // Checkpointing
    // ========================================================================

    /// The checkpoint number currently installed.
    pub(crate) fn checkpoint_number(&self) -> u64 {
        checkpoint_for_op(self.op_checkpoint())
    }

    /// The highest op this replica may hold in its WAL.
    pub(crate) fn prepare_max(&self) -> OpNumber {
        prepare_max_for_checkpoint(self.checkpoint_number())
    }

    fn maybe_checkpoint(&mut self, output: &mut ReplicaOutput) {
        let next = self.checkpoint_number() + 1;
        if self.commit_min != trigger_for_checkpoint(next) {
            return;
        }

        // Upgrade rule: a checkpoint whose final bar is
        // upgrade-only installs the announced release.
        let new_release = self.upgrade_bar_release();

        self.state_machine
            .checkpoint(&mut self.storage, &mut self.grid)
            .expect("checkpoint flush failed; halting to avoid divergence");
        self.grid.checkpoint();
        self.scrubber.retain_live(&self.grid);

        if let Some(release) = new_release {
            self.release = release;
        }

        let mut image = self.superblock.working().clone();
        image.release = self.release;
        image.vsr_state.view = self.view;
        image.vsr_state.log_view = self.log_view;
        image.vsr_state.commit_min = self.commit_min;
        image.vsr_state.commit_min_checksum = self.commit_parent;
        image.vsr_state.op_checkpoint = self.commit_min;
        image.vsr_state.sync_op_min = OpNumber::ZERO;
        image.vsr_state.sync_op_max = OpNumber::ZERO;
        let (free_set, grid_index) = self.grid.snapshot();
        image.free_set = free_set;
        image.grid_index = grid_index;
        image.sessions = self.sessions.snapshot();
        image.state_payload = self.state_machine.checkpoint_payload();
        image.vsr_state.checkpoint_id = Checksum::ZERO;
        let id = image.checkpoint_id();
        image.vsr_state.checkpoint_id = id;

        self.superblock
            .update(&mut self.storage, image)
            .expect("superblock install failed; halting to avoid divergence");

        tracing::info!(
            replica = %self.replica_id,
            op = %self.commit_min,
            checkpoint_id = %id,
            release = %self.release,
            "checkpoint installed"
        );

        if let Some(release) = new_release {
            if !self.upgrade.bundles(release) {
                output.exit = Some(ExitReason::ReleaseMismatch { required: release });
            }
        }
    }

    /// If the final bar before the just-committed trigger is entirely
    /// upgrade prepares announcing one release, returns that release.
    fn upgrade_bar_release(&mut self) -> Option<Release> {
        let trigger = self.commit_min;
        let bar_first = OpNumber::new(trigger.as_u64().saturating_sub(BAR_LENGTH - 1));
        let mut announced: Option<Release> = None;
        for op in bar_first.as_u64()..=trigger.as_u64() {
            let header = self.journal.header_for_op(OpNumber::new(op))?;
            if header.operation != Operation::UPGRADE {
                return None;
            }
            // The announced release travels in the body; re-read it.
            let prepare = match Wal::read_prepare_if(
                &mut self.storage,
                self.config.cluster(),
                OpNumber::new(op).slot(),
                header.checksum,
            ) {
                corundum_storage::PrepareRead::Ok(prepare) => prepare,
                corundum_storage::PrepareRead::Missing => return None,
            };
            let upgrade: body::UpgradeBody = body::decode(prepare.body()).ok()?;
            match announced {
                None => announced = Some(upgrade.release),
                Some(release) if release == upgrade.release => {}
                Some(_) => return None,
            }
        }
        announced
    }

    // ========================================================================
    // Timeout plumbing
    // ========================================================================

    pub(crate) fn start_timeouts(&mut self) {
        self.timeouts.ping.start();
        self.timeouts.repair.start();
        self.timeouts.scrub.start();
        self.reset_role_timeouts();
    }

    /// Re-arms role-dependent timeouts after a view or status change.
    pub(crate) fn reset_role_timeouts(&mut self) {
        self.timeouts.commit.stop();
        self.timeouts.prepare.stop();
        self.timeouts.primary_abdicate.stop();
        self.timeouts.view_change.stop();
        self.abdicating = false;
        if self.standby {
            return;
        }
        if self.is_primary() && self.status == ReplicaStatus::Normal {
            self.timeouts.commit.start();
            self.timeouts.prepare.start();
            self.timeouts.primary_abdicate.start();
        } else if self.config.replica_count() > 1
            && matches!(
                self.status,
                ReplicaStatus::Normal | ReplicaStatus::ViewChange
            )
        {
            self.timeouts.rearm_view_change(&mut self.prng);
        }
    }

    // ========================================================================
    // Invariants (checked at every quiescent point)
    // ========================================================================

    #[inline]
    pub(crate) fn invariants(&self) {
        debug_assert!(self.commit_min <= self.commit_max, "commit_min > commit_max");
        debug_assert!(self.commit_min <= self.op_head || self.sync.is_some());
        debug_assert!(self.log_view <= self.view, "log_view > view");
        if self.status == ReplicaStatus::Normal {
            debug_assert_eq!(self.log_view, self.view, "normal implies log_view = view");
        }
        debug_assert!(self.op_checkpoint() <= self.commit_min, "checkpoint > commit_min");
    }
}
