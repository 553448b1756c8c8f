//! Replicated log entry shapes.
//!
//! The log layer owns storage & replication of these entries; this crate
//! only dispatches on them. Encoding is the log layer's business, which is
//! why everything here is plain serde-derived data.

use serde::Deserialize;
use serde::Serialize;

use crate::AppData;
use crate::LogIndex;
use crate::MessageSummary;
use crate::SessionId;

/// A committed entry of the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    /// The index this entry was committed at.
    pub log_index: LogIndex,

    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> Entry<D> {
    /// Create a new `Register` entry.
    pub fn register(log_index: LogIndex, timestamp: u64, client_addr: Option<String>) -> Self {
        Entry {
            log_index,
            payload: EntryPayload::Register(RegisterEntry { timestamp, client_addr }),
        }
    }

    /// Create a new `KeepAlive` entry for the given session.
    pub fn keep_alive(log_index: LogIndex, session: SessionId, timestamp: u64) -> Self {
        Entry {
            log_index,
            payload: EntryPayload::KeepAlive(KeepAliveEntry { session, timestamp }),
        }
    }

    /// Create a new `Command` entry.
    pub fn command(log_index: LogIndex, command: CommandEntry<D>) -> Self {
        Entry {
            log_index,
            payload: EntryPayload::Command(command),
        }
    }

    /// Create a new `NoOp` entry.
    ///
    /// No-ops carry no payload but still advance `last_applied`, which is
    /// what releases parked queries and drives the session expiry sweep on
    /// an otherwise idle cluster.
    pub fn no_op(log_index: LogIndex, timestamp: u64) -> Self {
        Entry {
            log_index,
            payload: EntryPayload::NoOp(NoOpEntry { timestamp }),
        }
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_index, self.payload.summary())
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// Establishes a new client session.
    Register(RegisterEntry),
    /// Marks a session as alive at the entry's log-derived timestamp.
    KeepAlive(KeepAliveEntry),
    /// A state-mutating, exactly-once application command.
    #[serde(bound = "D: AppData")]
    Command(CommandEntry<D>),
    /// A read-only operation with a staleness bound.
    ///
    /// Queries normally bypass the log and reach the runtime through its
    /// query path, but they share the entry shape so a log layer which
    /// chooses to sequence them can do so.
    #[serde(bound = "D: AppData")]
    Query(QueryEntry<D>),
    /// An empty entry; advances `last_applied` without side effects.
    NoOp(NoOpEntry),
}

impl<D: AppData> EntryPayload<D> {
    /// The log-derived timestamp carried by this payload.
    pub fn timestamp(&self) -> u64 {
        match self {
            EntryPayload::Register(e) => e.timestamp,
            EntryPayload::KeepAlive(e) => e.timestamp,
            EntryPayload::Command(e) => e.timestamp,
            EntryPayload::Query(e) => e.timestamp,
            EntryPayload::NoOp(e) => e.timestamp,
        }
    }
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Register(_) => "register".to_string(),
            EntryPayload::KeepAlive(e) => format!("keep-alive: session={}", e.session),
            EntryPayload::Command(e) => {
                format!("command: session={}, request={}, ack={}", e.session, e.request, e.response_ack)
            }
            EntryPayload::Query(e) => format!("query: session={}, version={}", e.session, e.version),
            EntryPayload::NoOp(_) => "no-op".to_string(),
        }
    }
}

/// A log entry establishing a new client session.
///
/// The created session's ID is the entry's log index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    /// Log-derived wall-clock time, in milliseconds.
    pub timestamp: u64,
    /// An optional descriptor of the client's endpoint, used by hosts to
    /// route published events.
    pub client_addr: Option<String>,
}

/// A log entry marking a session as alive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveEntry {
    /// The session being kept alive.
    pub session: SessionId,
    /// Log-derived wall-clock time, in milliseconds.
    pub timestamp: u64,
}

/// A log entry carrying an application command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry<D: AppData> {
    /// The proposing session.
    pub session: SessionId,
    /// The session's monotonic request number; the dedup key.
    pub request: u64,
    /// The highest request number the client has seen a response for.
    ///
    /// Cached responses with keys at or below this are dropped when the
    /// command applies.
    pub response_ack: u64,
    /// Log-derived wall-clock time, in milliseconds.
    pub timestamp: u64,
    /// The application specific contents of this command.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// A query against the replicated state machine.
///
/// `version` is typically the querying client's version watermark: the
/// query must not be answered from a state earlier than that log index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryEntry<D: AppData> {
    /// The querying session.
    pub session: SessionId,
    /// Do not answer from a state earlier than this log index.
    pub version: u64,
    /// Log-derived wall-clock time, in milliseconds.
    pub timestamp: u64,
    /// The application specific contents of this query.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

impl<D: AppData> MessageSummary for QueryEntry<D> {
    fn summary(&self) -> String {
        format!("session={}, version={}, timestamp={}", self.session, self.version, self.timestamp)
    }
}

/// An empty log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoOpEntry {
    /// Log-derived wall-clock time, in milliseconds.
    pub timestamp: u64,
}
