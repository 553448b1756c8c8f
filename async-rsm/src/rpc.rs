//! Client/server RPC message shapes.
//!
//! These are abstract shapes, not a wire format: the transport collaborator
//! decides how they are encoded. Requests flow client → member; `Publish`
//! flows server → client over the session's open connection, fire & forget.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::AppData;
use crate::AppResponse;
use crate::LogIndex;
use crate::MessageSummary;
use crate::NodeId;
use crate::SessionId;

/// The outcome classification carried by every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The request was applied; the payload fields are valid.
    Ok,
    /// The server does not know the request's session.
    UnknownSession,
    /// The contacted member does not currently know a leader.
    NoLeader,
    /// The request reached the state machine and was rejected by it.
    Error,
}

/// A request to establish a new session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// An optional descriptor of this client's endpoint.
    pub client_addr: Option<String>,
}

/// The response to a `RegisterRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: Status,
    /// The responding member's current term.
    pub term: u64,
    /// The leader known to the responding member, if any.
    pub leader: Option<NodeId>,
    /// The newly established session; valid when `status` is `Ok`.
    pub session: SessionId,
    /// The cluster membership known to the responding member.
    pub members: BTreeSet<NodeId>,
}

impl MessageSummary for RegisterResponse {
    fn summary(&self) -> String {
        format!(
            "status={:?}, term={}, leader={:?}, session={}, members={}",
            self.status,
            self.term,
            self.leader,
            self.session,
            self.members.len()
        )
    }
}

/// A request to mark a session as alive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session: SessionId,
}

/// The response to a `KeepAliveRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub status: Status,
    /// The responding member's current term.
    pub term: u64,
    /// The leader known to the responding member, if any.
    pub leader: Option<NodeId>,
    /// The index of the highest entry applied on the responding member.
    pub version: LogIndex,
    /// The cluster membership known to the responding member.
    pub members: BTreeSet<NodeId>,
}

/// A state-mutating client request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRequest<D: AppData> {
    pub session: SessionId,
    /// This session's monotonic request number.
    pub request: u64,
    /// The highest request number this client considers fully delivered;
    /// lets the server garbage-collect its response cache.
    pub response_ack: u64,
    /// The application specific contents of this request.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

impl<D: AppData> MessageSummary for CommandRequest<D> {
    fn summary(&self) -> String {
        format!("session={}, request={}, ack={}", self.session, self.request, self.response_ack)
    }
}

/// The response to a `CommandRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResponse<R: AppResponse> {
    pub status: Status,
    /// The log index the command applied at (or the applied index observed
    /// when the request failed); advances the client's version watermark.
    pub version: LogIndex,
    /// The state machine's result; valid when `status` is `Ok`.
    #[serde(bound = "R: AppResponse")]
    pub result: Option<R>,
    /// The rejection text; valid when `status` is `Error`.
    pub error: Option<String>,
}

/// A read-only client request with a staleness bound.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest<D: AppData> {
    pub session: SessionId,
    /// Do not answer from a state earlier than this log index.
    pub version: LogIndex,
    /// The application specific contents of this request.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

impl<D: AppData> MessageSummary for QueryRequest<D> {
    fn summary(&self) -> String {
        format!("session={}, version={}", self.session, self.version)
    }
}

/// The response to a `QueryRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse<R: AppResponse> {
    pub status: Status,
    /// The applied index the query executed against.
    pub version: LogIndex,
    /// The state machine's result; valid when `status` is `Ok`.
    #[serde(bound = "R: AppResponse")]
    pub result: Option<R>,
    /// The rejection text; valid when `status` is `Error`.
    pub error: Option<String>,
}

/// An asynchronous event published by the state machine to one session.
///
/// Publishing is a deterministic state machine decision, but delivery is
/// best-effort and unreplicated: a client which misses events detects the
/// gap through its version watermark and queries on resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Publish<D: AppData> {
    /// The session this event is addressed to.
    pub session: SessionId,
    /// The application specific contents of this event.
    #[serde(bound = "D: AppData")]
    pub data: D,
}
