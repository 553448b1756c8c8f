//! The user state machine contract.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::AppData;
use crate::AppResponse;
use crate::LogIndex;
use crate::Publish;
use crate::SessionId;
use crate::SessionInfo;

/// A committed operation handed to the state machine.
#[derive(Debug)]
pub struct Commit<D: AppData> {
    /// The log index this operation executes at.
    ///
    /// For queries, the index of the highest applied entry.
    pub index: LogIndex,
    /// The proposing session.
    pub session: SessionInfo,
    /// Log-derived wall-clock time, in milliseconds.
    pub timestamp: u64,
    /// The application specific payload.
    pub data: D,

    events: mpsc::UnboundedSender<Publish<D>>,
}

impl<D: AppData> Commit<D> {
    pub(crate) fn new(
        index: LogIndex,
        session: SessionInfo,
        timestamp: u64,
        data: D,
        events: mpsc::UnboundedSender<Publish<D>>,
    ) -> Self {
        Self {
            index,
            session,
            timestamp,
            data,
            events,
        }
    }

    /// Publish an asynchronous event addressed to the given session.
    ///
    /// The decision to publish must be a deterministic function of the
    /// commit, so that every replica makes the same call. Only the replica
    /// a client is connected to actually delivers, best-effort; a client
    /// which misses events detects the gap through its version watermark.
    pub fn publish(&self, session: SessionId, data: D) {
        let _ = self.events.send(Publish { session, data });
    }
}

/// Which flavor of log cleaning a compaction pass is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionKind {
    /// An incremental pass over a bounded window of the log.
    Minor,
    /// A full pass, also reclaiming tombstones.
    Major,
}

/// Context for one compaction filtering decision.
#[derive(Clone, Copy, Debug)]
pub struct Compaction {
    /// The index the compaction pass has cleaned up to.
    pub index: LogIndex,
    /// The flavor of the running pass.
    pub kind: CompactionKind,
}

/// The application state machine driven by the runtime.
///
/// All callbacks run on the runtime's single core task: no two callbacks
/// ever execute concurrently for the same machine, so implementations can
/// mutate freely without further synchronization.
///
/// ### errors
/// An error from `apply` is treated as an application-level rejection: it
/// propagates to the requesting client and the session remains open. Errors
/// from every other method leave the machine in an unknown state and shut
/// the runtime down.
///
/// ### determinism
/// `apply` and `filter` must be deterministic functions of their arguments:
/// every replica feeds them the same committed entries in the same order
/// and their state must not diverge. In particular, wall-clock time must
/// never be read; use `Commit::timestamp`.
#[async_trait]
pub trait StateMachine: Send + 'static {
    /// The command & query payload handled by this machine.
    type Command: AppData;
    /// The result of applying a commit.
    type Response: AppResponse;

    /// A new session was established.
    async fn register(&mut self, session: &SessionInfo) -> Result<()>;

    /// A session idled past the session timeout.
    ///
    /// Called exactly once per session, at the first applied entry whose
    /// timestamp exceeds the session's idle window.
    async fn expire(&mut self, session: &SessionInfo) -> Result<()>;

    /// Apply a committed command, or execute a query.
    ///
    /// Commands are invoked at most once per `(session, request)`; retries
    /// are answered from the response cache without reaching this method.
    /// Queries must not mutate state observable by later commands.
    async fn apply(&mut self, commit: Commit<Self::Command>) -> Result<Self::Response>;

    /// Decide whether a command entry survives log compaction.
    ///
    /// The session on the commit may be in the `Expired` state when the
    /// real session is already gone; filters must tolerate that.
    async fn filter(&mut self, commit: Commit<Self::Command>, compaction: Compaction) -> Result<bool>;

    /// Capture the machine's full state.
    async fn snapshot(&mut self) -> Result<Vec<u8>>;

    /// Replace the machine's state from a prior `snapshot`.
    async fn restore(&mut self, snapshot: Vec<u8>) -> Result<()>;
}
