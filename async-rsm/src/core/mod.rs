//! The core logic of the state machine runtime.
//!
//! All entry application, query execution, compaction filtering and user
//! state machine callbacks run on one spawned task, the runtime core. The
//! core owns the user machine and the session registry outright; nothing
//! else ever touches them, which is what makes every user callback
//! observably atomic with respect to state machine state.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::entry::CommandEntry;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::entry::KeepAliveEntry;
use crate::entry::QueryEntry;
use crate::entry::RegisterEntry;
use crate::error::ApplyError;
use crate::error::RuntimeError;
use crate::error::RuntimeResult;
use crate::machine::Commit;
use crate::machine::Compaction;
use crate::machine::StateMachine;
use crate::metrics::RuntimeMetrics;
use crate::rpc::Publish;
use crate::runtime::RuntimeSnapshot;
use crate::sessions::SessionInfo;
use crate::sessions::SessionRegistry;
use crate::sessions::SessionState;
use crate::sessions::Touch;
use crate::AppResponse;
use crate::LogIndex;
use crate::MessageSummary;
use crate::SessionId;

/// The channel used to answer an `apply` call.
pub(crate) type ApplyTx<R> = oneshot::Sender<Result<Applied<R>, ApplyError>>;
/// The channel used to answer a `query` call.
pub(crate) type QueryTx<R> = oneshot::Sender<Result<R, ApplyError>>;

/// The user-visible completion of applying one log entry.
#[derive(Debug, PartialEq)]
pub enum Applied<R: AppResponse> {
    /// A `Register` entry created this session.
    Registered {
        /// The new session's ID; equal to the entry's log index.
        session: SessionId,
    },
    /// A `KeepAlive` entry refreshed this session.
    KeptAlive {
        /// The refreshed session.
        session: SessionId,
    },
    /// A `Command` or `Query` produced this state machine result.
    Response(R),
    /// A `NoOp` advanced the applied index without side effects.
    NoOp {
        /// The entry's log index.
        index: LogIndex,
    },
}

impl<R: AppResponse> Applied<R> {
    /// The state machine result, if this completion carries one.
    pub fn into_response(self) -> Option<R> {
        match self {
            Applied::Response(response) => Some(response),
            _ => None,
        }
    }

    /// The session created by a `Register` entry, if any.
    pub fn registered_session(&self) -> Option<SessionId> {
        match self {
            Applied::Registered { session } => Some(*session),
            _ => None,
        }
    }
}

/// A message coming from the runtime handle.
pub(crate) enum RuntimeMsg<M: StateMachine> {
    Apply {
        entry: Entry<M::Command>,
        tx: ApplyTx<M::Response>,
    },
    Query {
        query: QueryEntry<M::Command>,
        tx: QueryTx<M::Response>,
    },
    Filter {
        entry: Entry<M::Command>,
        compaction: Compaction,
        tx: oneshot::Sender<RuntimeResult<bool>>,
    },
    Snapshot {
        tx: oneshot::Sender<RuntimeResult<RuntimeSnapshot<M::Response>>>,
    },
    Restore {
        snapshot: RuntimeSnapshot<M::Response>,
        tx: oneshot::Sender<RuntimeResult<()>>,
    },
}

/// Either flavor of reply channel a query can answer into.
///
/// Queries normally arrive through the query path, but a log layer which
/// sequences them will hand them in as entries; both park the same way.
#[derive(derive_more::From)]
pub(crate) enum QueryReply<R: AppResponse> {
    Direct(QueryTx<R>),
    Entry(ApplyTx<R>),
}

impl<R: AppResponse> QueryReply<R> {
    fn send(self, res: Result<R, ApplyError>) {
        match self {
            QueryReply::Direct(tx) => {
                let _ = tx.send(res);
            }
            QueryReply::Entry(tx) => {
                let _ = tx.send(res.map(Applied::Response));
            }
        }
    }
}

/// A query parked until `last_applied` reaches its required version.
struct PendingQuery<M: StateMachine> {
    query: QueryEntry<M::Command>,
    reply: QueryReply<M::Response>,
}

/// The core task driving a user state machine.
pub(crate) struct RuntimeCore<M: StateMachine> {
    /// The runtime config.
    config: Arc<Config>,
    /// The user state machine; only ever touched from this task.
    machine: M,
    /// Live sessions, keyed by registering log index.
    sessions: SessionRegistry<M::Response>,

    /// The index of the highest applied log entry.
    ///
    /// Strictly monotonic across entry application; an entry which does not
    /// advance it is a protocol violation from the log layer.
    last_applied: LogIndex,

    /// Parked queries, keyed by required version.
    ///
    /// Values fire in insertion order once `last_applied` reaches the key,
    /// before the releasing entry's own logic runs.
    pending: BTreeMap<LogIndex, Vec<PendingQuery<M>>>,

    /// Outbound state-machine-originated events.
    tx_events: mpsc::UnboundedSender<Publish<M::Command>>,

    rx_api: mpsc::UnboundedReceiver<(RuntimeMsg<M>, Span)>,
    tx_metrics: watch::Sender<RuntimeMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<M: StateMachine> RuntimeCore<M> {
    pub(crate) fn spawn(
        config: Arc<Config>,
        machine: M,
        rx_api: mpsc::UnboundedReceiver<(RuntimeMsg<M>, Span)>,
        tx_events: mpsc::UnboundedSender<Publish<M::Command>>,
        tx_metrics: watch::Sender<RuntimeMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RuntimeResult<()>> {
        let sessions = SessionRegistry::new(config.session_timeout);
        let this = Self {
            config,
            machine,
            sessions,
            last_applied: 0,
            pending: BTreeMap::new(),
            tx_events,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the runtime core.
    #[tracing::instrument(level="debug", skip(self), fields(cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RuntimeResult<()> {
        tracing::debug!("state machine runtime is initializing");
        loop {
            tokio::select! {
                msg = self.rx_api.recv() => match msg {
                    Some((msg, span)) => {
                        let _ent = span.enter();
                        if let Err(err) = self.handle_msg(msg).await {
                            tracing::error!(error=%err, "fatal state machine runtime error, shutting down");
                            return Err(err);
                        }
                    }
                    // All handles are gone; nothing can reach us anymore.
                    None => {
                        tracing::info!("all runtime handles dropped, shutting down");
                        return Ok(());
                    }
                },
                _ = &mut self.rx_shutdown => {
                    tracing::info!("runtime received shutdown signal");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: RuntimeMsg<M>) -> RuntimeResult<()> {
        let res = match msg {
            RuntimeMsg::Apply { entry, tx } => self.apply_entry(entry, tx).await,
            RuntimeMsg::Query { query, tx } => self.schedule_query(query, tx.into()).await,
            RuntimeMsg::Filter { entry, compaction, tx } => {
                let res = self.filter_entry(entry, compaction).await;
                match res {
                    Ok(keep) => {
                        let _ = tx.send(Ok(keep));
                        Ok(())
                    }
                    // The reply channel is dropped on fatal errors; callers
                    // observe the shutdown through it.
                    Err(err) => Err(err),
                }
            }
            RuntimeMsg::Snapshot { tx } => {
                let snapshot = self.take_snapshot().await?;
                let _ = tx.send(Ok(snapshot));
                Ok(())
            }
            RuntimeMsg::Restore { snapshot, tx } => {
                self.restore_snapshot(snapshot).await?;
                let _ = tx.send(Ok(()));
                Ok(())
            }
        };
        self.report_metrics();
        res
    }

    /// Apply one committed log entry.
    ///
    /// Dispatch order on every entry: advance `last_applied`, run the
    /// expiry sweep at the entry's timestamp, release parked queries, then
    /// the entry-specific logic.
    #[tracing::instrument(level="debug", skip(self, entry, tx), fields(entry=%entry.summary()))]
    async fn apply_entry(&mut self, entry: Entry<M::Command>, tx: ApplyTx<M::Response>) -> RuntimeResult<()> {
        let index = entry.log_index;
        if index <= self.last_applied {
            let msg = format!(
                "entry index {} does not advance last applied index {}",
                index, self.last_applied
            );
            let _ = tx.send(Err(ApplyError::Runtime(RuntimeError::ProtocolViolation(msg.clone()))));
            return Err(RuntimeError::ProtocolViolation(msg));
        }
        self.last_applied = index;

        let timestamp = entry.payload.timestamp();
        self.expire_due_sessions(timestamp).await?;
        self.release_pending_queries().await?;

        let res = match entry.payload {
            EntryPayload::Register(e) => self.apply_register(index, e).await?,
            EntryPayload::KeepAlive(e) => self.apply_keep_alive(index, e).await?,
            EntryPayload::Command(e) => self.apply_command(index, e).await?,
            EntryPayload::Query(e) => {
                return self.schedule_query(e, tx.into()).await;
            }
            EntryPayload::NoOp(_) => Ok(Applied::NoOp { index }),
        };
        let _ = tx.send(res);
        Ok(())
    }

    /// Create a session for a `Register` entry; its ID is the log index.
    #[tracing::instrument(level = "trace", skip(self, e))]
    async fn apply_register(
        &mut self,
        index: LogIndex,
        e: RegisterEntry,
    ) -> RuntimeResult<Result<Applied<M::Response>, ApplyError>> {
        let info = SessionInfo {
            id: index,
            client_addr: e.client_addr.clone(),
            state: SessionState::Open,
        };
        self.sessions.register(index, e.timestamp, e.client_addr);
        self.machine.register(&info).await.map_err(RuntimeError::StateMachine)?;
        tracing::debug!(session = index, "session registered");
        Ok(Ok(Applied::Registered { session: index }))
    }

    /// Refresh a session for a `KeepAlive` entry.
    #[tracing::instrument(level = "trace", skip(self, e), fields(session=e.session))]
    async fn apply_keep_alive(
        &mut self,
        index: LogIndex,
        e: KeepAliveEntry,
    ) -> RuntimeResult<Result<Applied<M::Response>, ApplyError>> {
        match self.sessions.touch(e.session, index, e.timestamp) {
            Touch::Alive => Ok(Ok(Applied::KeptAlive { session: e.session })),
            Touch::Expired(session) => {
                self.machine.expire(&session.info()).await.map_err(RuntimeError::StateMachine)?;
                Ok(Err(ApplyError::UnknownSession(e.session)))
            }
            Touch::Missing => Ok(Err(ApplyError::UnknownSession(e.session))),
        }
    }

    /// Apply a `Command` entry: dedup against the response cache, invoke
    /// the user machine at most once, cache & trim.
    #[tracing::instrument(level = "trace", skip(self, e), fields(session=e.session, request=e.request))]
    async fn apply_command(
        &mut self,
        index: LogIndex,
        e: CommandEntry<M::Command>,
    ) -> RuntimeResult<Result<Applied<M::Response>, ApplyError>> {
        let info = match self.sessions.touch(e.session, index, e.timestamp) {
            Touch::Alive => match self.sessions.lookup(e.session) {
                Some(session) => session.info(),
                None => return Ok(Err(ApplyError::UnknownSession(e.session))),
            },
            Touch::Expired(session) => {
                self.machine.expire(&session.info()).await.map_err(RuntimeError::StateMachine)?;
                return Ok(Err(ApplyError::UnknownSession(e.session)));
            }
            Touch::Missing => return Ok(Err(ApplyError::UnknownSession(e.session))),
        };

        // A retried command is answered from the cache; the user machine
        // must not observe it twice.
        if let Some(cached) = self.sessions.cached(e.session, e.request) {
            tracing::debug!(session = e.session, request = e.request, "answering command from response cache");
            return Ok(Ok(Applied::Response(cached.clone())));
        }

        let commit = Commit::new(index, info, e.timestamp, e.data, self.tx_events.clone());
        match self.machine.apply(commit).await {
            Ok(response) => {
                self.sessions.cache_response(e.session, e.request, response.clone());
                self.sessions.trim_responses(e.session, e.response_ack);
                Ok(Ok(Applied::Response(response)))
            }
            // Application-level rejection: the session stays open and only
            // successful results are cached.
            Err(err) => Ok(Err(ApplyError::User(err.to_string()))),
        }
    }

    /// Execute a query now, or park it until its version is applied.
    #[tracing::instrument(level = "trace", skip(self, query, reply), fields(query=%query.summary()))]
    async fn schedule_query(
        &mut self,
        query: QueryEntry<M::Command>,
        reply: QueryReply<M::Response>,
    ) -> RuntimeResult<()> {
        if query.version > self.last_applied {
            tracing::debug!(
                session = query.session,
                version = query.version,
                last_applied = self.last_applied,
                "parking query until its version is applied"
            );
            self.pending.entry(query.version).or_insert_with(Vec::new).push(PendingQuery { query, reply });
            return Ok(());
        }
        let res = self.run_query(query).await?;
        reply.send(res);
        Ok(())
    }

    /// Run a query against the current state.
    ///
    /// Queries never mutate the session registry: a session whose idle
    /// window has elapsed at the query's timestamp is reported unknown, but
    /// its removal (and the user `expire` callback) is left to the next
    /// applied entry so that replicated state stays identical on replicas
    /// which never saw this query.
    async fn run_query(
        &mut self,
        query: QueryEntry<M::Command>,
    ) -> RuntimeResult<Result<M::Response, ApplyError>> {
        let info = match self.sessions.live(query.session, query.timestamp) {
            Some(session) => session.info(),
            None => return Ok(Err(ApplyError::UnknownSession(query.session))),
        };
        let commit = Commit::new(self.last_applied, info, query.timestamp, query.data, self.tx_events.clone());
        match self.machine.apply(commit).await {
            Ok(response) => Ok(Ok(response)),
            Err(err) => Ok(Err(ApplyError::User(err.to_string()))),
        }
    }

    /// Fire parked queries whose required version has been applied.
    async fn release_pending_queries(&mut self) -> RuntimeResult<()> {
        loop {
            let version = match self.pending.keys().next() {
                Some(&version) if version <= self.last_applied => version,
                _ => return Ok(()),
            };
            let parked = self.pending.remove(&version).unwrap_or_default();
            for PendingQuery { query, reply } in parked {
                tracing::debug!(version, session = query.session, "releasing parked query");
                let res = self.run_query(query).await?;
                reply.send(res);
            }
        }
    }

    /// Expire every session whose idle window elapsed at `timestamp`.
    ///
    /// Driven exclusively by log-derived time, so all replicas expire the
    /// same sessions at the same entry.
    async fn expire_due_sessions(&mut self, timestamp: u64) -> RuntimeResult<()> {
        for session in self.sessions.expire_due(timestamp) {
            tracing::debug!(session = session.id, "session expired");
            self.machine.expire(&session.info()).await.map_err(RuntimeError::StateMachine)?;
        }
        Ok(())
    }

    /// Decide whether one entry survives log compaction.
    ///
    /// Must be a deterministic function of `(entry, compaction)` and the
    /// applied state; replicas compare notes by replaying, not by voting.
    #[tracing::instrument(level="debug", skip(self, entry, compaction), fields(entry=%entry.summary()))]
    async fn filter_entry(&mut self, entry: Entry<M::Command>, compaction: Compaction) -> RuntimeResult<bool> {
        let index = entry.log_index;
        match entry.payload {
            // A registration is only worth replaying while its session lives.
            EntryPayload::Register(_) => Ok(self.sessions.contains(index)),
            // Only the latest keep-alive per session survives.
            EntryPayload::KeepAlive(e) => Ok(self
                .sessions
                .lookup(e.session)
                .map(|session| session.last_index == index)
                .unwrap_or(false)),
            EntryPayload::Command(e) => {
                let info = self
                    .sessions
                    .lookup(e.session)
                    .map(|session| session.info())
                    .unwrap_or_else(|| SessionInfo::expired(e.session));
                let commit = Commit::new(index, info, e.timestamp, e.data, self.tx_events.clone());
                self.machine.filter(commit, compaction).await.map_err(RuntimeError::StateMachine)
            }
            EntryPayload::Query(_) | EntryPayload::NoOp(_) => Ok(false),
        }
    }

    /// Capture the runtime's replicated state: applied index, sessions with
    /// their response caches, and the user machine's own snapshot.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn take_snapshot(&mut self) -> RuntimeResult<RuntimeSnapshot<M::Response>> {
        let machine = self.machine.snapshot().await.map_err(RuntimeError::StateMachine)?;
        Ok(RuntimeSnapshot {
            last_applied: self.last_applied,
            sessions: self.sessions.export(),
            machine,
        })
    }

    /// Replace the runtime's replicated state from a snapshot.
    #[tracing::instrument(level = "debug", skip(self, snapshot), fields(last_applied=snapshot.last_applied))]
    async fn restore_snapshot(&mut self, snapshot: RuntimeSnapshot<M::Response>) -> RuntimeResult<()> {
        self.machine.restore(snapshot.machine).await.map_err(RuntimeError::StateMachine)?;
        self.sessions.import(snapshot.sessions);
        self.last_applied = snapshot.last_applied;
        self.release_pending_queries().await
    }

    /// Report a metrics payload on the current state of the runtime.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let pending_queries = self.pending.values().map(Vec::len).sum();
        let res = self.tx_metrics.send(RuntimeMetrics {
            last_applied: self.last_applied,
            open_sessions: self.sessions.len(),
            pending_queries,
            cached_responses: self.sessions.cached_responses(),
        });
        if let Err(err) = res {
            tracing::error!(error=%err, "error reporting metrics");
        }
    }
}
