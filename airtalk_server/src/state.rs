//! Server state management for the signaling server
//!
//! This module owns every live session, the waiting pool and the match
//! table. All of it sits behind one lock inside [`ServerState`]; every
//! mutation goes through [`Registry`] so pairing stays consistent under
//! concurrent arrivals and departures. Messages are pushed onto each
//! connection's unbounded outbound queue, so nothing here waits on the
//! network while the lock is held.

use crate::config::ServerConfig;
use airtalk_protocol::{DEFAULT_COUNTRY, ServerMessage, UserId};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Identifies one transport connection for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one live pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchId(u64);

/// What a connection's writer task should do next
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Transport-level liveness probe
    Probe,
    Close,
}

/// Push side of a connection's outbound queue
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// A handle together with the queue its writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Whether the writer is still draining the queue
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    fn probe(&self) {
        let _ = self.tx.send(Outbound::Probe);
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Where a session currently stands in matchmaking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Connected but not looking for a partner
    Idle,
    /// In the waiting pool
    Waiting,
    /// Part of a live match
    Matched(MatchId),
}

/// One connected participant
#[derive(Debug)]
pub struct UserSession {
    pub user_id: UserId,
    pub country: String,
    /// When the session last entered the waiting pool (or connected)
    pub joined_at: Instant,
    handle: ConnectionHandle,
    presence: Presence,
    /// Cleared on every probe, set by any sign of life
    alive: bool,
    last_partner: Option<UserId>,
}

impl UserSession {
    pub fn presence(&self) -> Presence {
        self.presence
    }
}

#[derive(Debug)]
struct Match {
    users: [ConnectionId; 2],
}

impl Match {
    fn other(&self, conn: ConnectionId) -> Option<ConnectionId> {
        match self.users {
            [a, b] if a == conn => Some(b),
            [a, b] if b == conn => Some(a),
            _ => None,
        }
    }
}

/// Result of a `find`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Matched { partner: UserId },
    Waiting,
}

/// Snapshot for the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub active_connections: usize,
    pub waiting_users: usize,
}

/// Snapshot for the stats endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub waiting_users: usize,
    pub active_matches: usize,
}

/// Sessions, waiting pool and matches
pub struct Registry {
    sessions: HashMap<ConnectionId, UserSession>,
    users: HashMap<UserId, ConnectionId>,
    pool: Vec<ConnectionId>,
    matches: HashMap<MatchId, Match>,
    next_match: u64,
    avoid_repeat_partner: bool,
    closing: bool,
    rng: StdRng,
}

impl Registry {
    pub fn new(avoid_repeat_partner: bool) -> Self {
        Self::with_rng(avoid_repeat_partner, StdRng::from_os_rng())
    }

    /// Registry with a caller-chosen random source for partner selection
    pub fn with_rng(avoid_repeat_partner: bool, rng: StdRng) -> Self {
        Self {
            sessions: HashMap::new(),
            users: HashMap::new(),
            pool: Vec::new(),
            matches: HashMap::new(),
            next_match: 0,
            avoid_repeat_partner,
            closing: false,
            rng,
        }
    }

    /// Register a freshly opened connection
    ///
    /// The session gets a generated user ID until its first `find`.
    pub fn connect(&mut self, handle: ConnectionHandle, now: Instant) -> ConnectionId {
        let conn = ConnectionId::new();
        let user_id = UserId(conn.to_string());
        self.users.insert(user_id.clone(), conn);
        self.sessions.insert(
            conn,
            UserSession {
                user_id,
                country: DEFAULT_COUNTRY.to_string(),
                joined_at: now,
                handle,
                presence: Presence::Idle,
                alive: true,
                last_partner: None,
            },
        );
        conn
    }

    pub fn session(&self, conn: ConnectionId) -> Option<&UserSession> {
        self.sessions.get(&conn)
    }

    pub fn connection_of(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.users.get(user_id).copied()
    }

    /// Current partner of a session, if matched
    pub fn partner_of(&self, conn: ConnectionId) -> Option<ConnectionId> {
        match self.sessions.get(&conn)?.presence {
            Presence::Matched(id) => self.matches.get(&id)?.other(conn),
            _ => None,
        }
    }

    /// Handle a `find`: pair with a random waiting user or enter the pool
    ///
    /// A session that is already matched leaves its match first; one that
    /// is already waiting has its pool entry refreshed. Returns `None` for
    /// an unknown connection.
    pub fn join(
        &mut self,
        conn: ConnectionId,
        user_id: Option<UserId>,
        country: Option<String>,
        now: Instant,
    ) -> Option<JoinOutcome> {
        if !self.sessions.contains_key(&conn) {
            return None;
        }
        self.leave(conn, now);

        if let Some(user_id) = user_id.filter(|id| !id.as_str().is_empty()) {
            self.rebind(conn, user_id, now);
        }
        if let Some(session) = self.sessions.get_mut(&conn) {
            if let Some(country) = country.filter(|c| !c.is_empty()) {
                session.country = country;
            }
            info!(user_id = %session.user_id, country = %session.country, "User joined");
        }

        let outcome = self.match_or_wait(conn, now, true);
        self.debug_check();
        Some(outcome)
    }

    /// Take the user ID a client asked for, replacing any older connection
    /// that still holds it
    fn rebind(&mut self, conn: ConnectionId, user_id: UserId, now: Instant) {
        let Some(current) = self.sessions.get(&conn).map(|s| s.user_id.clone()) else {
            return;
        };
        if current == user_id {
            return;
        }
        if let Some(previous) = self.users.get(&user_id).copied() {
            if previous != conn {
                info!(user_id = %user_id, "Replacing older connection for user");
                self.disconnect(previous, now);
            }
        }
        if self.users.get(&current) == Some(&conn) {
            self.users.remove(&current);
        }
        self.users.insert(user_id.clone(), conn);
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.user_id = user_id;
        }
    }

    /// Pick a partner for `conn` from the pool, or put `conn` in the pool
    ///
    /// `conn` must not currently be waiting or matched.
    fn match_or_wait(&mut self, conn: ConnectionId, now: Instant, announce: bool) -> JoinOutcome {
        let candidates: Vec<usize> = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, other)| self.can_pair(conn, **other))
            .map(|(index, _)| index)
            .collect();

        if candidates.is_empty() {
            self.enqueue(conn, now, announce);
            return JoinOutcome::Waiting;
        }

        let pick = candidates[self.rng.random_range(0..candidates.len())];
        let partner = self.pool.swap_remove(pick);
        let partner_id = self.pair(partner, conn);
        JoinOutcome::Matched {
            partner: partner_id,
        }
    }

    fn can_pair(&self, conn: ConnectionId, other: ConnectionId) -> bool {
        if conn == other {
            return false;
        }
        let (Some(me), Some(them)) = (self.sessions.get(&conn), self.sessions.get(&other)) else {
            return false;
        };
        if me.user_id == them.user_id || !them.handle.is_open() {
            return false;
        }
        if self.avoid_repeat_partner
            && (me.last_partner.as_ref() == Some(&them.user_id)
                || them.last_partner.as_ref() == Some(&me.user_id))
        {
            return false;
        }
        true
    }

    fn enqueue(&mut self, conn: ConnectionId, now: Instant, announce: bool) {
        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };
        session.presence = Presence::Waiting;
        session.joined_at = now;
        self.pool.push(conn);
        info!(
            user_id = %session.user_id,
            waiting = self.pool.len(),
            "User added to waiting pool"
        );
        if announce {
            session.handle.send(ServerMessage::Searching);
        }
    }

    /// Create a match; `waiting` was already in the pool and makes the offer
    fn pair(&mut self, waiting: ConnectionId, arriving: ConnectionId) -> UserId {
        let id = MatchId(self.next_match);
        self.next_match += 1;
        self.matches.insert(
            id,
            Match {
                users: [waiting, arriving],
            },
        );

        let (waiting_id, waiting_country) = self.mark_matched(waiting, id);
        let (arriving_id, arriving_country) = self.mark_matched(arriving, id);
        if let Some(session) = self.sessions.get_mut(&waiting) {
            session.last_partner = Some(arriving_id.clone());
            session.handle.send(ServerMessage::Match {
                country: arriving_country.clone(),
                partner_id: arriving_id.clone(),
                initiator: Some(true),
            });
        }
        if let Some(session) = self.sessions.get_mut(&arriving) {
            session.last_partner = Some(waiting_id.clone());
            session.handle.send(ServerMessage::Match {
                country: waiting_country.clone(),
                partner_id: waiting_id.clone(),
                initiator: Some(false),
            });
        }
        info!(
            "Match found: {} ({}) <-> {} ({})",
            arriving_id, arriving_country, waiting_id, waiting_country
        );
        waiting_id
    }

    fn mark_matched(&mut self, conn: ConnectionId, id: MatchId) -> (UserId, String) {
        match self.sessions.get_mut(&conn) {
            Some(session) => {
                session.presence = Presence::Matched(id);
                (session.user_id.clone(), session.country.clone())
            }
            None => (UserId(conn.to_string()), DEFAULT_COUNTRY.to_string()),
        }
    }

    /// Drop the session out of the pool or out of its match
    ///
    /// A surviving partner is told `partnerDisconnected` and re-enters the
    /// pool if its connection is still open.
    pub fn leave(&mut self, conn: ConnectionId, now: Instant) {
        let Some(presence) = self.sessions.get(&conn).map(|s| s.presence) else {
            return;
        };
        match presence {
            Presence::Idle => {}
            Presence::Waiting => {
                self.pool.retain(|c| *c != conn);
                self.set_idle(conn);
            }
            Presence::Matched(id) => self.dissolve(id, conn, now),
        }
    }

    fn dissolve(&mut self, id: MatchId, leaving: ConnectionId, now: Instant) {
        let Some(pairing) = self.matches.remove(&id) else {
            return;
        };
        self.set_idle(leaving);
        let Some(partner) = pairing.other(leaving) else {
            return;
        };
        self.set_idle(partner);

        let Some(session) = self.sessions.get(&partner) else {
            return;
        };
        session.handle.send(ServerMessage::PartnerDisconnected);
        if self.closing || !session.handle.is_open() {
            return;
        }
        debug!(user_id = %session.user_id, "Returning partner to the waiting pool");
        session.handle.send(ServerMessage::Searching);
        self.match_or_wait(partner, now, false);
    }

    fn set_idle(&mut self, conn: ConnectionId) {
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.presence = Presence::Idle;
        }
    }

    /// Remove a session for good
    ///
    /// Returns `false` if it was already gone, so teardown paths racing each
    /// other remove it exactly once.
    pub fn disconnect(&mut self, conn: ConnectionId, now: Instant) -> bool {
        if !self.sessions.contains_key(&conn) {
            return false;
        }
        self.leave(conn, now);
        let Some(session) = self.sessions.remove(&conn) else {
            return false;
        };
        if self.users.get(&session.user_id) == Some(&conn) {
            self.users.remove(&session.user_id);
        }
        session.handle.close();
        info!(user_id = %session.user_id, "User disconnected");
        self.debug_check();
        true
    }

    /// Leave the current match and search again under the same identity
    pub fn reconnect(&mut self, conn: ConnectionId, now: Instant) -> Option<JoinOutcome> {
        info!(%conn, "Reconnection request");
        self.join(conn, None, None, now)
    }

    /// Forward an opaque negotiation envelope to the sender's partner
    ///
    /// Without a reachable partner this does nothing; the partner may
    /// already have left.
    pub fn relay(&self, from: ConnectionId, data: Value) -> bool {
        let delivered = self
            .partner_of(from)
            .and_then(|partner| self.sessions.get(&partner))
            .filter(|partner| partner.handle.is_open())
            .is_some_and(|partner| partner.handle.send(ServerMessage::Signal { data }));
        if !delivered {
            debug!(%from, "Cannot relay signal: partner not available");
        }
        delivered
    }

    /// Answer an application-level keepalive
    pub fn pong(&self, conn: ConnectionId, timestamp: i64) {
        if let Some(session) = self.sessions.get(&conn) {
            session.handle.send(ServerMessage::Pong { timestamp });
        }
    }

    /// Record a sign of life from the connection
    pub fn mark_alive(&mut self, conn: ConnectionId) {
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.alive = true;
        }
    }

    /// One heartbeat round
    ///
    /// Sessions that never answered the previous probe are disconnected;
    /// every other session is marked unconfirmed and probed again.
    pub fn heartbeat(&mut self, now: Instant) -> Vec<UserId> {
        let mut dead = Vec::new();
        for (conn, session) in self.sessions.iter_mut() {
            if session.alive {
                session.alive = false;
                session.handle.probe();
            } else {
                dead.push(*conn);
            }
        }

        let mut removed = Vec::with_capacity(dead.len());
        for conn in dead {
            if let Some(user_id) = self.sessions.get(&conn).map(|s| s.user_id.clone()) {
                info!(user_id = %user_id, "Terminating dead connection");
                if self.disconnect(conn, now) {
                    removed.push(user_id);
                }
            }
        }
        removed
    }

    /// Evict users who waited longer than `max_wait`, telling them `timeout`
    pub fn sweep_stale(&mut self, max_wait: std::time::Duration, now: Instant) -> Vec<UserId> {
        let sessions = &mut self.sessions;
        let mut evicted = Vec::new();
        self.pool.retain(|conn| {
            let Some(session) = sessions.get_mut(conn) else {
                return false;
            };
            if now.saturating_duration_since(session.joined_at) <= max_wait {
                return true;
            }
            info!(user_id = %session.user_id, "Removing stale user from waiting pool");
            session.presence = Presence::Idle;
            session.handle.send(ServerMessage::Timeout);
            evicted.push(session.user_id.clone());
            false
        });
        self.debug_check();
        evicted
    }

    /// Tell every connection the server is going away, then close them all
    pub fn shutdown(&mut self) -> usize {
        self.closing = true;
        for session in self.sessions.values() {
            session.handle.send(ServerMessage::ServerShutdown);
            session.handle.close();
        }
        self.sessions.len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            active_connections: self.sessions.len(),
            waiting_users: self.pool.len(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_connections: self.sessions.len(),
            waiting_users: self.pool.len(),
            active_matches: self.matches.len(),
        }
    }

    /// Verify pool membership, match symmetry and the user index
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for conn in &self.pool {
            if !seen.insert(*conn) {
                return Err(format!("{conn} is in the pool twice"));
            }
            match self.sessions.get(conn).map(|s| s.presence) {
                Some(Presence::Waiting) => {}
                other => return Err(format!("{conn} is pooled with presence {other:?}")),
            }
        }

        for (conn, session) in &self.sessions {
            match session.presence {
                Presence::Waiting if !seen.contains(conn) => {
                    return Err(format!("{conn} is waiting but not pooled"));
                }
                Presence::Matched(id) => {
                    let partner = self
                        .matches
                        .get(&id)
                        .and_then(|m| m.other(*conn))
                        .ok_or_else(|| format!("{conn} points at missing match {id:?}"))?;
                    if self.partner_of(partner) != Some(*conn) {
                        return Err(format!("match between {conn} and {partner} is one-sided"));
                    }
                }
                _ => {}
            }
            if self.users.get(&session.user_id) != Some(conn) {
                return Err(format!("user index lost {}", session.user_id));
            }
        }

        for (id, pairing) in &self.matches {
            for conn in pairing.users {
                match self.sessions.get(&conn).map(|s| s.presence) {
                    Some(Presence::Matched(other)) if other == *id => {}
                    other => return Err(format!("{id:?} holds {conn} with presence {other:?}")),
                }
            }
        }

        if self.users.len() != self.sessions.len() {
            return Err("user index out of sync with sessions".to_string());
        }
        Ok(())
    }

    fn debug_check(&self) {
        if cfg!(debug_assertions) {
            let checked = self.check_invariants();
            debug_assert!(checked.is_ok(), "registry invariant violated: {checked:?}");
        }
    }
}

/// Shared server state handed to every connection task
#[derive(Clone)]
pub struct ServerState {
    pub registry: Arc<Mutex<Registry>>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Registry::new(config.avoid_repeat_partner);
        Self::with_registry(config, registry)
    }

    pub fn with_registry(config: ServerConfig, registry: Registry) -> Self {
        Self {
            registry: Arc::new(Mutex::new(registry)),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }

    /// Broadcast `serverShutdown` and close every connection
    pub fn shutdown(&self) {
        let notified = self.registry.lock().shutdown();
        info!(connections = notified, "Server shutdown broadcast sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct Client {
        conn: ConnectionId,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn messages(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(item) = self.rx.try_recv() {
                if let Outbound::Message(msg) = item {
                    out.push(msg);
                }
            }
            out
        }

        fn drain(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(item) = self.rx.try_recv() {
                out.push(item);
            }
            out
        }
    }

    fn registry() -> Registry {
        Registry::with_rng(false, StdRng::seed_from_u64(7))
    }

    fn connect(registry: &mut Registry, now: Instant) -> Client {
        let (handle, rx) = ConnectionHandle::channel();
        let conn = registry.connect(handle, now);
        Client { conn, rx }
    }

    fn find(registry: &mut Registry, client: &Client, id: &str, now: Instant) -> JoinOutcome {
        registry
            .join(client.conn, Some(UserId::from(id)), Some(format!("flag-{id}")), now)
            .unwrap()
    }

    #[test]
    fn first_waits_second_matches_with_waiting_side_initiating() {
        let now = Instant::now();
        let mut reg = registry();
        let mut a = connect(&mut reg, now);
        let mut b = connect(&mut reg, now);

        assert_eq!(find(&mut reg, &a, "a", now), JoinOutcome::Waiting);
        assert_eq!(a.messages(), vec![ServerMessage::Searching]);

        assert_eq!(
            find(&mut reg, &b, "b", now),
            JoinOutcome::Matched {
                partner: UserId::from("a")
            }
        );
        assert_eq!(
            a.messages(),
            vec![ServerMessage::Match {
                country: "flag-b".to_string(),
                partner_id: UserId::from("b"),
                initiator: Some(true),
            }]
        );
        assert_eq!(
            b.messages(),
            vec![ServerMessage::Match {
                country: "flag-a".to_string(),
                partner_id: UserId::from("a"),
                initiator: Some(false),
            }]
        );
        assert_eq!(reg.partner_of(a.conn), Some(b.conn));
        assert_eq!(reg.partner_of(b.conn), Some(a.conn));
        assert_eq!(reg.stats().active_matches, 1);
        assert_eq!(reg.status().waiting_users, 0);
    }

    #[test]
    fn never_matches_with_itself() {
        let now = Instant::now();
        let mut reg = registry();
        let mut a = connect(&mut reg, now);

        assert_eq!(find(&mut reg, &a, "a", now), JoinOutcome::Waiting);
        // a second find from the only waiting user just refreshes the entry
        assert_eq!(find(&mut reg, &a, "a", now), JoinOutcome::Waiting);
        assert_eq!(reg.status().waiting_users, 1);
        assert_eq!(reg.partner_of(a.conn), None);
        assert_eq!(
            a.messages(),
            vec![ServerMessage::Searching, ServerMessage::Searching]
        );
    }

    #[test]
    fn missing_id_keeps_generated_identity_and_default_flag() {
        let now = Instant::now();
        let mut reg = registry();
        let a = connect(&mut reg, now);
        reg.join(a.conn, None, None, now);
        let session = reg.session(a.conn).unwrap();
        assert_eq!(session.user_id, UserId(a.conn.to_string()));
        assert_eq!(session.country, DEFAULT_COUNTRY);
    }

    #[test]
    fn disconnect_notifies_partner_once_and_requeues_it() {
        let now = Instant::now();
        let mut reg = registry();
        let a = connect(&mut reg, now);
        let mut b = connect(&mut reg, now);
        find(&mut reg, &a, "a", now);
        find(&mut reg, &b, "b", now);
        b.messages();

        assert!(reg.disconnect(a.conn, now));
        assert!(!reg.disconnect(a.conn, now));

        assert_eq!(
            b.messages(),
            vec![ServerMessage::PartnerDisconnected, ServerMessage::Searching]
        );
        assert_eq!(reg.status().waiting_users, 1);
        assert_eq!(reg.session(b.conn).unwrap().presence(), Presence::Waiting);
        assert_eq!(reg.stats().active_matches, 0);
        assert_eq!(reg.status().active_connections, 1);
    }

    #[test]
    fn requeued_partner_pairs_with_someone_already_waiting() {
        let now = Instant::now();
        let mut reg = registry();
        let a = connect(&mut reg, now);
        let mut b = connect(&mut reg, now);
        find(&mut reg, &a, "a", now);
        find(&mut reg, &b, "b", now);
        let mut c = connect(&mut reg, now);
        find(&mut reg, &c, "c", now);
        b.messages();
        c.messages();

        reg.disconnect(a.conn, now);
        let b_msgs = b.messages();
        assert_eq!(b_msgs[0], ServerMessage::PartnerDisconnected);
        assert_eq!(b_msgs[1], ServerMessage::Searching);
        assert!(matches!(
            &b_msgs[2],
            ServerMessage::Match { partner_id, initiator: Some(false), .. } if partner_id.as_str() == "c"
        ));
        assert!(matches!(
            &c.messages()[..],
            [ServerMessage::Match { initiator: Some(true), .. }]
        ));
    }

    #[test]
    fn partner_with_closed_connection_is_not_requeued() {
        let now = Instant::now();
        let mut reg = registry();
        let a = connect(&mut reg, now);
        let b = connect(&mut reg, now);
        find(&mut reg, &a, "a", now);
        find(&mut reg, &b, "b", now);
        drop(b.rx);

        reg.disconnect(a.conn, now);
        assert_eq!(reg.status().waiting_users, 0);
        assert_eq!(reg.session(b.conn).unwrap().presence(), Presence::Idle);
    }

    #[test]
    fn relay_forwards_verbatim_only_within_a_match() {
        let now = Instant::now();
        let mut reg = registry();
        let mut a = connect(&mut reg, now);
        let mut b = connect(&mut reg, now);
        let mut c = connect(&mut reg, now);

        let offer = json!({"sdp": {"type": "offer", "sdp": "v=0"}});
        assert!(!reg.relay(a.conn, offer.clone()));

        find(&mut reg, &a, "a", now);
        find(&mut reg, &b, "b", now);
        a.messages();
        b.messages();

        assert!(reg.relay(a.conn, offer.clone()));
        let candidate = json!({"candidate": {"candidate": "candidate:1 1 udp 1 1.2.3.4 5 typ host"}});
        assert!(reg.relay(b.conn, candidate.clone()));

        assert_eq!(b.messages(), vec![ServerMessage::Signal { data: offer }]);
        assert_eq!(a.messages(), vec![ServerMessage::Signal { data: candidate }]);
        assert!(c.messages().is_empty());
        assert!(!reg.relay(c.conn, json!({})));
    }

    #[test]
    fn reconnect_breaks_match_and_searches_again() {
        let now = Instant::now();
        let mut reg = registry();
        let mut a = connect(&mut reg, now);
        let mut b = connect(&mut reg, now);
        find(&mut reg, &a, "a", now);
        find(&mut reg, &b, "b", now);
        a.messages();
        b.messages();

        // b is requeued first, so a's re-join pairs them up again
        let outcome = reg.reconnect(a.conn, now).unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Matched {
                partner: UserId::from("b")
            }
        );
        let b_msgs = b.messages();
        assert_eq!(
            &b_msgs[..2],
            &[ServerMessage::PartnerDisconnected, ServerMessage::Searching]
        );
        assert!(matches!(b_msgs[2], ServerMessage::Match { initiator: Some(true), .. }));
        assert_eq!(reg.session(a.conn).unwrap().user_id, UserId::from("a"));
    }

    #[test]
    fn repeat_partner_avoidance_keeps_them_apart() {
        let now = Instant::now();
        let mut reg = Registry::with_rng(true, StdRng::seed_from_u64(1));
        let mut a = connect(&mut reg, now);
        let mut b = connect(&mut reg, now);
        find(&mut reg, &a, "a", now);
        find(&mut reg, &b, "b", now);
        a.messages();
        b.messages();

        assert_eq!(reg.reconnect(a.conn, now), Some(JoinOutcome::Waiting));
        assert_eq!(reg.status().waiting_users, 2);
        assert_eq!(reg.stats().active_matches, 0);

        let c = connect(&mut reg, now);
        assert!(matches!(
            find(&mut reg, &c, "c", now),
            JoinOutcome::Matched { .. }
        ));
        assert_eq!(reg.status().waiting_users, 1);
    }

    #[test]
    fn duplicate_user_id_replaces_older_connection() {
        let now = Instant::now();
        let mut reg = registry();
        let mut old = connect(&mut reg, now);
        let new = connect(&mut reg, now);
        find(&mut reg, &old, "same", now);

        assert_eq!(find(&mut reg, &new, "same", now), JoinOutcome::Waiting);
        assert!(reg.session(old.conn).is_none());
        assert_eq!(reg.connection_of(&UserId::from("same")), Some(new.conn));
        assert_eq!(old.drain().last(), Some(&Outbound::Close));
        assert_eq!(reg.status().active_connections, 1);
    }

    #[test]
    fn empty_user_id_keeps_generated_identity() {
        let now = Instant::now();
        let mut reg = registry();
        let a = connect(&mut reg, now);
        let b = connect(&mut reg, now);
        let generated = reg.session(a.conn).unwrap().user_id.clone();

        reg.join(a.conn, Some(UserId::from("")), None, now).unwrap();
        let outcome = reg.join(b.conn, Some(UserId::from("")), None, now).unwrap();

        assert_eq!(outcome, JoinOutcome::Matched { partner: generated.clone() });
        assert!(reg.session(a.conn).is_some());
        assert!(reg.session(b.conn).is_some());
        assert_eq!(reg.connection_of(&generated), Some(a.conn));
        assert_eq!(reg.connection_of(&UserId::from("")), None);
        assert_eq!(reg.status().active_connections, 2);
        assert_eq!(reg.partner_of(a.conn), Some(b.conn));
    }

    #[test]
    fn invariant_checker_catches_a_double_pooled_session() {
        let now = Instant::now();
        let mut reg = registry();
        let a = connect(&mut reg, now);
        find(&mut reg, &a, "a", now);
        assert_eq!(reg.check_invariants(), Ok(()));

        reg.pool.push(a.conn);
        assert!(reg.check_invariants().unwrap_err().contains("twice"));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "registry invariant violated")]
    fn debug_builds_assert_invariants_after_mutation() {
        let now = Instant::now();
        let mut reg = registry();
        let a = connect(&mut reg, now);
        let b = connect(&mut reg, now);
        find(&mut reg, &a, "a", now);
        reg.pool.push(a.conn);
        find(&mut reg, &b, "b", now);
    }

    #[test]
    fn stale_waiters_time_out_and_are_never_matched_afterwards() {
        let start = Instant::now();
        let mut reg = registry();
        let mut a = connect(&mut reg, start);
        find(&mut reg, &a, "a", start);
        a.messages();

        let max_wait = Duration::from_secs(60);
        assert!(reg.sweep_stale(max_wait, start + Duration::from_secs(30)).is_empty());

        let later = start + Duration::from_secs(61);
        assert_eq!(reg.sweep_stale(max_wait, later), vec![UserId::from("a")]);
        assert_eq!(a.messages(), vec![ServerMessage::Timeout]);
        assert_eq!(reg.session(a.conn).unwrap().presence(), Presence::Idle);

        let b = connect(&mut reg, later);
        assert_eq!(find(&mut reg, &b, "b", later), JoinOutcome::Waiting);
        assert!(a.messages().is_empty());
    }

    #[test]
    fn heartbeat_drops_connections_that_missed_a_probe() {
        let now = Instant::now();
        let mut reg = registry();
        let mut a = connect(&mut reg, now);
        let mut b = connect(&mut reg, now);
        find(&mut reg, &a, "a", now);
        find(&mut reg, &b, "b", now);
        a.drain();
        b.drain();

        assert!(reg.heartbeat(now).is_empty());
        assert_eq!(a.drain(), vec![Outbound::Probe]);
        assert_eq!(b.drain(), vec![Outbound::Probe]);

        // only b answers
        reg.mark_alive(b.conn);
        assert_eq!(reg.heartbeat(now), vec![UserId::from("a")]);
        assert_eq!(a.drain(), vec![Outbound::Close]);
        assert_eq!(
            b.drain(),
            vec![
                Outbound::Probe,
                Outbound::Message(ServerMessage::PartnerDisconnected),
                Outbound::Message(ServerMessage::Searching),
            ]
        );
        assert!(reg.session(a.conn).is_none());
    }

    #[test]
    fn shutdown_notifies_everyone_and_stops_requeueing() {
        let now = Instant::now();
        let mut reg = registry();
        let mut a = connect(&mut reg, now);
        let mut b = connect(&mut reg, now);
        find(&mut reg, &a, "a", now);
        find(&mut reg, &b, "b", now);
        a.drain();
        b.drain();

        assert_eq!(reg.shutdown(), 2);
        assert_eq!(
            a.drain(),
            vec![
                Outbound::Message(ServerMessage::ServerShutdown),
                Outbound::Close
            ]
        );
        reg.disconnect(a.conn, now);
        assert_eq!(reg.status().waiting_users, 0);
        assert!(reg.is_closing());
    }

    #[test]
    fn random_join_leave_sequences_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut reg = Registry::with_rng(false, StdRng::seed_from_u64(43));
        let start = Instant::now();
        let mut clients: Vec<Client> = Vec::new();

        for step in 0..2_000u64 {
            let now = start + Duration::from_millis(step * 10);
            match rng.random_range(0..6) {
                0 => clients.push(connect(&mut reg, now)),
                1 | 2 if !clients.is_empty() => {
                    let i = rng.random_range(0..clients.len());
                    let id = format!("u{}", rng.random_range(0..40));
                    reg.join(clients[i].conn, Some(UserId(id)), None, now);
                }
                3 if !clients.is_empty() => {
                    let i = rng.random_range(0..clients.len());
                    let client = clients.swap_remove(i);
                    reg.disconnect(client.conn, now);
                }
                4 if !clients.is_empty() => {
                    let i = rng.random_range(0..clients.len());
                    reg.reconnect(clients[i].conn, now);
                }
                5 => {
                    reg.sweep_stale(Duration::from_millis(500), now);
                }
                _ => {}
            }
            reg.check_invariants()
                .unwrap_or_else(|e| panic!("step {step}: {e}"));

            for client in &clients {
                let Some(session) = reg.session(client.conn) else {
                    continue;
                };
                if session.presence() == Presence::Waiting {
                    assert_eq!(reg.partner_of(client.conn), None);
                }
                if let Some(partner) = reg.partner_of(client.conn) {
                    assert_ne!(partner, client.conn);
                    assert_eq!(reg.partner_of(partner), Some(client.conn));
                }
            }
        }
    }
}
