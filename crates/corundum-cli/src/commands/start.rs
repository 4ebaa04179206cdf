//! `corundum start` — run a replica over TCP.
//!
//! A single-threaded mio poll loop: one listener, one outgoing
//! connection per peer (re-dialed on a timer), and whatever client
//! connections arrive. Each connection carries length-delimited frames
//! (`Header || body`); a connection that produces an invalid frame is
//! dropped and the peer re-dials.
//!
//! The replica itself never blocks on the network: its output messages
//! go into per-connection write buffers, and undeliverable messages
//! are simply dropped — every protocol message is re-sent by a timer
//! or re-requested by repair.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use corundum_io::FileStorage;
use corundum_types::{ClientId, ClusterId, ReplicaId};
use corundum_vsr::{
    ExitReason, HashStateMachine, OpenError, Outbound, Recipient, Replica, ReplicaOptions,
    ReplicaOutput,
};
use corundum_wire::{Command, FrameBuffer, Message};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::{EXIT_CORRUPT, EXIT_RELEASE_MISMATCH};

/// Scheduler tick interval.
const TICK: Duration = Duration::from_millis(20);
/// Peer re-dial interval.
const REDIAL: Duration = Duration::from_secs(1);

const LISTENER: Token = Token(0);

struct Connection {
    stream: TcpStream,
    frames: FrameBuffer,
    outbox: Vec<u8>,
    /// Learned from the first valid frame.
    peer_replica: Option<ReplicaId>,
    peer_client: Option<ClientId>,
}

impl Connection {
    fn new(stream: TcpStream, cluster: ClusterId) -> Self {
        Self {
            stream,
            frames: FrameBuffer::new(cluster),
            outbox: Vec::new(),
            peer_replica: None,
            peer_client: None,
        }
    }

    fn queue(&mut self, message: &Message) {
        self.outbox.extend_from_slice(&message.encode());
    }

    /// Writes as much of the outbox as the socket accepts.
    fn flush(&mut self) -> std::io::Result<()> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads available bytes into the frame buffer; returns false when
    /// the connection is gone.
    fn fill(&mut self) -> bool {
        let mut buf = [0u8; 64 * 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => self.frames.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }
}

pub fn run(addresses: &[String], replica_index: u8, path: &str) -> Result<()> {
    let addrs: Vec<SocketAddr> = addresses
        .iter()
        .map(|a| a.parse().with_context(|| format!("bad address {a}")))
        .collect::<Result<_>>()?;
    if (replica_index as usize) >= addrs.len() {
        bail!("replica index {replica_index} out of range for {} addresses", addrs.len());
    }

    let storage = FileStorage::open(Path::new(path))
        .with_context(|| format!("opening data file {path}"))?;
    let mut replica = match Replica::open(ReplicaOptions {
        storage,
        state_machine: HashStateMachine::new(),
        releases_bundled: vec![super::format::current_release()],
    }) {
        Ok(replica) => replica,
        Err(error @ (OpenError::Superblock(_) | OpenError::WalCorrupt | OpenError::SnapshotCorrupt)) => {
            tracing::error!(%error, "unrecoverable data file");
            std::process::exit(EXIT_CORRUPT);
        }
        Err(error @ OpenError::ReleaseNotBundled { .. }) => {
            tracing::error!(%error, "restart with the matching release");
            std::process::exit(EXIT_RELEASE_MISMATCH);
        }
    };

    if replica.replica_id() != ReplicaId::new(replica_index) {
        bail!(
            "data file belongs to {}, started as replica {replica_index}",
            replica.replica_id()
        );
    }
    if addrs.len() != replica.config().member_count() as usize {
        bail!(
            "{} addresses for a cluster of {} members",
            addrs.len(),
            replica.config().member_count()
        );
    }
    let cluster = replica.config().cluster();

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(256);
    let mut listener = TcpListener::bind(addrs[replica_index as usize])?;
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;

    tracing::info!(
        replica = %replica.replica_id(),
        address = %addrs[replica_index as usize],
        "replica started"
    );

    let mut connections: HashMap<Token, Connection> = HashMap::new();
    let mut next_token: usize = 1;
    let mut last_tick = Instant::now();
    let mut last_dial = Instant::now() - REDIAL;

    loop {
        poll.poll(&mut events, Some(TICK))?;

        // Accept inbound connections.
        for event in events.iter() {
            if event.token() == LISTENER {
                loop {
                    match listener.accept() {
                        Ok((mut stream, _)) => {
                            let token = Token(next_token);
                            next_token += 1;
                            poll.registry().register(
                                &mut stream,
                                token,
                                Interest::READABLE | Interest::WRITABLE,
                            )?;
                            connections.insert(token, Connection::new(stream, cluster));
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            tracing::warn!(%e, "accept failed");
                            break;
                        }
                    }
                }
                continue;
            }

            let token = event.token();
            let mut drop_connection = false;
            let mut inbound: Vec<Message> = Vec::new();
            if let Some(connection) = connections.get_mut(&token) {
                if event.is_readable() && !connection.fill() {
                    drop_connection = true;
                }
                loop {
                    match connection.frames.next_message() {
                        Ok(Some(message)) => {
                            let header = message.header();
                            if header.command == Command::Request {
                                connection.peer_client = Some(header.client);
                            } else {
                                connection.peer_replica = Some(header.replica);
                            }
                            inbound.push(message);
                        }
                        Ok(None) => break,
                        Err(error) => {
                            tracing::warn!(%error, "invalid frame; dropping connection");
                            drop_connection = true;
                            break;
                        }
                    }
                }
                if event.is_writable() && connection.flush().is_err() {
                    drop_connection = true;
                }
            }
            if drop_connection {
                connections.remove(&token);
            }
            for message in inbound {
                let output = replica.on_message(message);
                dispatch(&mut connections, output);
            }
        }

        // Scheduler tick.
        if last_tick.elapsed() >= TICK {
            last_tick = Instant::now();
            let output = replica.on_tick();
            dispatch(&mut connections, output);
        }

        // Re-dial missing peers.
        if last_dial.elapsed() >= REDIAL {
            last_dial = Instant::now();
            for (id, addr) in addrs.iter().enumerate() {
                let id = ReplicaId::new(id as u8);
                if id == replica.replica_id() {
                    continue;
                }
                let connected = connections.values().any(|c| c.peer_replica == Some(id));
                if connected {
                    continue;
                }
                match TcpStream::connect(*addr) {
                    Ok(mut stream) => {
                        let token = Token(next_token);
                        next_token += 1;
                        if poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                            .is_ok()
                        {
                            let mut connection = Connection::new(stream, cluster);
                            connection.peer_replica = Some(id);
                            connections.insert(token, connection);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer = %id, %e, "dial failed");
                    }
                }
            }
        }

        // Opportunistic flush of queued output.
        connections.retain(|_, connection| connection.flush().is_ok());
    }
}

/// Queues replica output onto connections; exits the process when the
/// replica asks to stop.
fn dispatch(connections: &mut HashMap<Token, Connection>, output: ReplicaOutput) {
    if let Some(reason) = &output.exit {
        match reason {
            ExitReason::WalCorrupt => {
                tracing::error!("unrecoverable WAL corruption");
                std::process::exit(EXIT_CORRUPT);
            }
            ExitReason::ReleaseMismatch { required } => {
                tracing::info!(%required, "exiting for release upgrade restart");
                std::process::exit(EXIT_RELEASE_MISMATCH);
            }
        }
    }
    for Outbound { to, message } in output.outbound {
        match to {
            Recipient::Replica(id) => {
                for connection in connections.values_mut() {
                    if connection.peer_replica == Some(id) {
                        connection.queue(&message);
                        break;
                    }
                }
            }
            Recipient::AllReplicas => {
                for connection in connections.values_mut() {
                    if connection.peer_replica.is_some() {
                        connection.queue(&message);
                    }
                }
            }
            Recipient::Client(id) => {
                for connection in connections.values_mut() {
                    if connection.peer_client == Some(id) {
                        connection.queue(&message);
                        break;
                    }
                }
            }
        }
    }
}
