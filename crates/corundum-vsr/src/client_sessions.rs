//! Client session table.
//!
//! One session per registered client, at most `CLIENTS_MAX` at a time.
//! Each session records the latest committed request number, the
//! checksum of its cached reply, and the reply-cache slot holding it.
//! Duplicate request numbers are served from the cache — that, plus
//! clients keeping one request in flight, is what makes execution
//! at-most-once.
//!
//! # Eviction
//!
//! When a registration arrives with the table full, the session with
//! the lowest committed op is evicted. Eviction keys on committed op
//! (not wall time), so every replica evicts the same session at the
//! same op. An evicted client's next request is answered with a
//! re-register signal.
//!
//! # Registration
//!
//! Sessions are created only by a committed `register` operation.
//! Updating the table at prepare time would let a view change lose the
//! update while the client believes it is registered; committing the
//! registration makes the table identical on every replica.

use std::collections::HashMap;

use corundum_storage::SessionSnapshot;
use corundum_types::constants::CLIENTS_MAX;
use corundum_types::{Checksum, ClientId, OpNumber, RequestNumber};

/// One client's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub client: ClientId,
    /// Latest committed request number.
    pub request: RequestNumber,
    /// Checksum of the cached reply for `request`.
    pub reply_checksum: Checksum,
    /// Op at which `request` committed (eviction key).
    pub committed_op: OpNumber,
    /// Reply-cache slot owned by this session.
    pub slot: u32,
}

/// The session table.
#[derive(Debug, Clone, Default)]
pub struct ClientSessions {
    by_client: HashMap<ClientId, Session>,
}

impl ClientSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client: ClientId) -> Option<&Session> {
        self.by_client.get(&client)
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    /// Registers a client at its committed register op. Returns the
    /// evicted session, if the table was full.
    ///
    /// Re-registering an existing client resets its session in place.
    pub fn register(&mut self, client: ClientId, op: OpNumber) -> Option<Session> {
        assert!(!client.is_none(), "protocol prepares have no session");

        if let Some(existing) = self.by_client.get_mut(&client) {
            existing.request = RequestNumber::ZERO;
            existing.reply_checksum = Checksum::ZERO;
            existing.committed_op = op;
            return None;
        }

        let evicted = if self.by_client.len() >= CLIENTS_MAX {
            // Deterministic: lowest committed op, client id breaking
            // ties. Every replica evicts the same session.
            let victim = self
                .by_client
                .values()
                .min_by_key(|s| (s.committed_op, s.client))
                .copied()
                .expect("table is non-empty when full");
            self.by_client.remove(&victim.client);
            tracing::debug!(
                evicted = %victim.client,
                committed_op = %victim.committed_op,
                "session table full, evicting least-recently-committed"
            );
            Some(victim)
        } else {
            None
        };

        let slot = evicted.map(|s| s.slot).unwrap_or_else(|| self.lowest_free_slot());
        self.by_client.insert(
            client,
            Session {
                client,
                request: RequestNumber::ZERO,
                reply_checksum: Checksum::ZERO,
                committed_op: op,
                slot,
            },
        );
        evicted
    }

    fn lowest_free_slot(&self) -> u32 {
        let used: std::collections::HashSet<u32> =
            self.by_client.values().map(|s| s.slot).collect();
        (0..CLIENTS_MAX as u32)
            .find(|slot| !used.contains(slot))
            .expect("a free slot exists when the table is not full")
    }

    /// Records a committed request and its cached reply.
    pub fn commit_request(
        &mut self,
        client: ClientId,
        request: RequestNumber,
        reply_checksum: Checksum,
        op: OpNumber,
    ) {
        let session = self
            .by_client
            .get_mut(&client)
            .expect("commit for unregistered client");
        assert!(
            request > session.request,
            "committed requests are strictly increasing per client: {request} <= {}",
            session.request
        );
        session.request = request;
        session.reply_checksum = reply_checksum;
        session.committed_op = op;
    }

    /// Caches the reply checksum for a freshly registered session
    /// (request number stays at zero).
    pub fn set_reply_checksum(&mut self, client: ClientId, reply_checksum: Checksum) {
        let session = self
            .by_client
            .get_mut(&client)
            .expect("reply for unregistered client");
        session.reply_checksum = reply_checksum;
    }

    /// Snapshot for the superblock trailer, in client order.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .by_client
            .values()
            .map(|s| SessionSnapshot {
                client: s.client,
                request: s.request,
                reply_checksum: s.reply_checksum,
                committed_op: s.committed_op,
                slot: s.slot,
            })
            .collect();
        sessions.sort_by_key(|s| s.client);
        sessions
    }

    /// Restores the table from a superblock snapshot.
    pub fn from_snapshot(snapshot: &[SessionSnapshot]) -> Self {
        let by_client = snapshot
            .iter()
            .map(|s| {
                (
                    s.client,
                    Session {
                        client: s.client,
                        request: s.request,
                        reply_checksum: s.reply_checksum,
                        committed_op: s.committed_op,
                        slot: s.slot,
                    },
                )
            })
            .collect();
        Self { by_client }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_commit() {
        let mut sessions = ClientSessions::new();
        let client = ClientId::new(10);
        assert!(sessions.register(client, OpNumber::new(1)).is_none());

        sessions.commit_request(
            client,
            RequestNumber::new(1),
            Checksum::new(99),
            OpNumber::new(2),
        );
        let session = sessions.get(client).unwrap();
        assert_eq!(session.request, RequestNumber::new(1));
        assert_eq!(session.reply_checksum, Checksum::new(99));
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn duplicate_commit_panics() {
        let mut sessions = ClientSessions::new();
        let client = ClientId::new(10);
        sessions.register(client, OpNumber::new(1));
        sessions.commit_request(client, RequestNumber::new(1), Checksum::ZERO, OpNumber::new(2));
        sessions.commit_request(client, RequestNumber::new(1), Checksum::ZERO, OpNumber::new(3));
    }

    #[test]
    fn eviction_takes_least_recently_committed() {
        let mut sessions = ClientSessions::new();
        for i in 0..CLIENTS_MAX as u64 {
            sessions.register(ClientId::new(100 + i), OpNumber::new(1 + i));
        }
        assert_eq!(sessions.len(), CLIENTS_MAX);

        // Client 100 (committed_op 1) is the victim.
        let evicted = sessions
            .register(ClientId::new(999), OpNumber::new(1000))
            .expect("table was full");
        assert_eq!(evicted.client, ClientId::new(100));
        assert_eq!(sessions.len(), CLIENTS_MAX);
        // The newcomer inherits the evicted slot.
        assert_eq!(sessions.get(ClientId::new(999)).unwrap().slot, evicted.slot);
    }

    #[test]
    fn snapshot_roundtrip_is_deterministic() {
        let mut sessions = ClientSessions::new();
        for i in 0..5u64 {
            sessions.register(ClientId::new(100 + i), OpNumber::new(1 + i));
        }
        let snapshot = sessions.snapshot();
        let restored = ClientSessions::from_snapshot(&snapshot);
        assert_eq!(restored.snapshot(), snapshot);
    }
}
