//! The server-side session registry.
//!
//! One `Session` per registered client, keyed by the log index of the
//! `Register` entry which created it. The registry is owned exclusively by
//! the runtime core task and is only ever mutated while applying entries,
//! which is what makes session expiry deterministic: every replica sees the
//! same entries, with the same timestamps, in the same order.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::AppResponse;
use crate::LogIndex;
use crate::SessionId;

/// The lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// The session is live and may propose commands.
    Open,
    /// The session idled past the session timeout.
    ///
    /// Expiry is terminal: a session never reopens, the client must
    /// register a new one.
    Expired,
    /// The session was closed by the client.
    Closed,
}

/// A registered client session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session<R: AppResponse> {
    /// The session's ID, equal to the index of its `Register` entry.
    pub id: SessionId,
    /// Descriptor of the client endpoint, if one was supplied.
    pub client_addr: Option<String>,
    /// The greatest log index at which this session was observed alive.
    pub last_index: LogIndex,
    /// Log-derived time of the last observed activity, in milliseconds.
    pub last_timestamp: u64,
    /// Cached command results, keyed by the client's request number.
    ///
    /// Keys are strictly ascending; entries at or below the client's
    /// acknowledged watermark are trimmed as commands apply.
    #[serde(bound = "R: AppResponse")]
    pub responses: BTreeMap<u64, R>,
    /// The session's lifecycle state.
    pub state: SessionState,
}

impl<R: AppResponse> Session<R> {
    /// The plain-record projection handed to state machine callbacks.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            client_addr: self.client_addr.clone(),
            state: self.state,
        }
    }
}

/// The view of a session handed to user state machine callbacks.
///
/// A plain record: state machines must not hold onto registry internals
/// across callbacks, so they only ever see this projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// The session's ID.
    pub id: SessionId,
    /// Descriptor of the client endpoint, if one was supplied.
    pub client_addr: Option<String>,
    /// The session's lifecycle state at the time of the callback.
    ///
    /// Compaction filters may be handed a synthesized `Expired` session
    /// when the real one is already gone.
    pub state: SessionState,
}

impl SessionInfo {
    /// Synthesize an expired session record for a session which no longer
    /// exists in the registry.
    pub(crate) fn expired(id: SessionId) -> Self {
        SessionInfo {
            id,
            client_addr: None,
            state: SessionState::Expired,
        }
    }
}

/// The outcome of touching a session.
#[derive(Debug)]
pub(crate) enum Touch<R: AppResponse> {
    /// The session is alive; its activity markers were advanced.
    Alive,
    /// The session idled past the timeout; it has been removed from the
    /// registry and is returned so the caller can run the user `expire`
    /// callback exactly once.
    Expired(Session<R>),
    /// No session with the given ID is registered.
    Missing,
}

/// The registry of live sessions, owned by the runtime core.
#[derive(Debug)]
pub(crate) struct SessionRegistry<R: AppResponse> {
    sessions: BTreeMap<SessionId, Session<R>>,
    /// Idle window, in log-derived milliseconds.
    timeout: u64,
}

impl<R: AppResponse> SessionRegistry<R> {
    pub(crate) fn new(timeout: u64) -> Self {
        Self {
            sessions: BTreeMap::new(),
            timeout,
        }
    }

    /// Create a new open session keyed by the registering entry's index.
    ///
    /// Never fails: log indices are unique, so the key can not collide
    /// except when replaying, where the replay is byte-identical anyway.
    pub(crate) fn register(&mut self, index: LogIndex, timestamp: u64, client_addr: Option<String>) -> SessionId {
        let session = Session {
            id: index,
            client_addr,
            last_index: index,
            last_timestamp: timestamp,
            responses: BTreeMap::new(),
            state: SessionState::Open,
        };
        self.sessions.insert(index, session);
        index
    }

    /// Mark the session as observed alive at `(index, timestamp)`.
    ///
    /// If the session's idle window has elapsed it is removed & returned
    /// instead. `last_timestamp` only ever moves forward, even if the log
    /// layer hands us a stale timestamp.
    pub(crate) fn touch(&mut self, id: SessionId, index: LogIndex, timestamp: u64) -> Touch<R> {
        let session = match self.sessions.get_mut(&id) {
            Some(session) => session,
            None => return Touch::Missing,
        };
        if timestamp.saturating_sub(session.last_timestamp) > self.timeout {
            let mut expired = self.sessions.remove(&id).unwrap();
            expired.state = SessionState::Expired;
            return Touch::Expired(expired);
        }
        session.last_index = index.max(session.last_index);
        session.last_timestamp = timestamp.max(session.last_timestamp);
        Touch::Alive
    }

    pub(crate) fn lookup(&self, id: SessionId) -> Option<&Session<R>> {
        self.sessions.get(&id)
    }

    /// Like `lookup`, but reports nothing for a session whose idle window
    /// has already elapsed at `timestamp`.
    ///
    /// Read-only on purpose: queries use this so that serving a query on
    /// one replica never mutates state the other replicas don't see. The
    /// authoritative removal happens at the next applied entry.
    pub(crate) fn live(&self, id: SessionId, timestamp: u64) -> Option<&Session<R>> {
        self.sessions
            .get(&id)
            .filter(|session| timestamp.saturating_sub(session.last_timestamp) <= self.timeout)
    }

    pub(crate) fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// The cached result for `(session, request)`, if any.
    pub(crate) fn cached(&self, id: SessionId, request: u64) -> Option<&R> {
        self.sessions.get(&id).and_then(|session| session.responses.get(&request))
    }

    /// Cache a command result under its request number.
    pub(crate) fn cache_response(&mut self, id: SessionId, request: u64, response: R) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.responses.insert(request, response);
        }
    }

    /// Drop cached responses with keys at or below `ack`.
    pub(crate) fn trim_responses(&mut self, id: SessionId, ack: u64) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.responses = session.responses.split_off(&(ack + 1));
        }
    }

    /// Expire every session whose idle window has elapsed at `timestamp`.
    ///
    /// Run opportunistically while applying any entry; the removed sessions
    /// are returned so the caller can fire user `expire` callbacks.
    pub(crate) fn expire_due(&mut self, timestamp: u64) -> Vec<Session<R>> {
        let timeout = self.timeout;
        let due: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| timestamp.saturating_sub(session.last_timestamp) > timeout)
            .map(|session| session.id)
            .collect();
        due.into_iter()
            .map(|id| {
                let mut expired = self.sessions.remove(&id).unwrap();
                expired.state = SessionState::Expired;
                expired
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Total number of cached responses across all sessions.
    pub(crate) fn cached_responses(&self) -> usize {
        self.sessions.values().map(|session| session.responses.len()).sum()
    }

    /// The full registry state, for snapshots.
    pub(crate) fn export(&self) -> Vec<Session<R>> {
        self.sessions.values().cloned().collect()
    }

    /// Replace the registry state from a snapshot.
    pub(crate) fn import(&mut self, sessions: Vec<Session<R>>) {
        self.sessions = sessions.into_iter().map(|session| (session.id, session)).collect();
    }
}
