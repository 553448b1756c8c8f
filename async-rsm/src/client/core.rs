//! The core logic of a client session.
//!
//! One spawned task owns all session state: the session id, the
//! request/response/version watermarks, the leadership view and the single
//! live connection. Request attempts run as short-lived spawned drivers
//! which report back over an internal channel, so the context itself never
//! blocks on the network and the keep-alive timer keeps beating while a
//! command rides out a slow member.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Interval;
use tracing::Instrument;
use tracing::Span;

use crate::client::ClientMetrics;
use crate::client::Consistency;
use crate::config::Config;
use crate::error::ClientError;
use crate::rpc::CommandRequest;
use crate::rpc::CommandResponse;
use crate::rpc::KeepAliveRequest;
use crate::rpc::KeepAliveResponse;
use crate::rpc::Publish;
use crate::rpc::QueryRequest;
use crate::rpc::QueryResponse;
use crate::rpc::RegisterRequest;
use crate::rpc::RegisterResponse;
use crate::rpc::Status;
use crate::transport::Connection;
use crate::transport::SessionTransport;
use crate::AppData;
use crate::AppResponse;
use crate::LogIndex;
use crate::MessageSummary;
use crate::NodeId;
use crate::SessionId;

/// The channel used to answer a submit call.
pub(crate) type SubmitTx<R> = oneshot::Sender<Result<R, ClientError>>;

/// A message coming from the client handle.
pub(crate) enum ClientMsg<D: AppData, R: AppResponse> {
    Command {
        data: D,
        tx: SubmitTx<R>,
    },
    Query {
        data: D,
        consistency: Consistency,
        tx: SubmitTx<R>,
    },
}

/// A completion event from a spawned request driver.
enum ClientEvent<C, R: AppResponse> {
    Registered {
        target: NodeId,
        conn: Option<Arc<C>>,
        result: Result<RegisterResponse>,
    },
    KeptAlive {
        target: NodeId,
        conn: Option<Arc<C>>,
        result: Result<KeepAliveResponse>,
    },
    CommandDone {
        /// The session the attempt ran under.
        session: SessionId,
        /// The request number the attempt carried.
        request: u64,
        target: NodeId,
        conn: Option<Arc<C>>,
        result: Result<CommandResponse<R>>,
    },
    QueryDone {
        id: u64,
        session: SessionId,
        target: NodeId,
        conn: Option<Arc<C>>,
        result: Result<QueryResponse<R>>,
    },
}

/// The command currently travelling through the pipeline.
///
/// At most one command is in flight per session; later submissions queue
/// behind it. This per-session serialization is what lets the server apply
/// a session's commands in strictly increasing request order.
struct InflightCommand<D: AppData, R: AppResponse> {
    /// The assigned request number; 0 until (re)numbered at dispatch.
    request: u64,
    /// True while an attempt is on the wire.
    dispatched: bool,
    data: D,
    tx: SubmitTx<R>,
}

/// A query in flight; queries run concurrently and retry freely.
struct InflightQuery<D: AppData, R: AppResponse> {
    consistency: Consistency,
    /// True while an attempt is on the wire.
    dispatched: bool,
    data: D,
    tx: SubmitTx<R>,
}

/// The task owning all state of one client session.
pub(crate) struct ClientCore<D: AppData, R: AppResponse, T: SessionTransport<D, R>> {
    config: Arc<Config>,
    transport: Arc<T>,
    client_addr: Option<String>,

    /// The cluster view; refreshed from register & keep-alive responses.
    members: BTreeSet<NodeId>,
    /// The leader known to this client, if any.
    leader: Option<NodeId>,
    /// The highest term observed; a higher term invalidates a lower-term
    /// leader.
    term: u64,

    /// The established session, if any.
    session: Option<SessionId>,
    /// The next outgoing request number, monotonic per session.
    request: u64,
    /// The highest request number known fully delivered; sent as the ack
    /// watermark so the server can trim its response cache.
    response: u64,
    /// The highest applied log index observed in any response.
    version: LogIndex,
    open: bool,

    /// The single live connection, tagged with its member.
    conn: Option<(NodeId, Arc<T::Conn>)>,
    /// Where transport implementations deliver server-pushed events.
    tx_publish: mpsc::UnboundedSender<Publish<D>>,

    /// True while a registration round is running; registration is
    /// single-flight, concurrent triggers coalesce onto it.
    registering: bool,
    register_attempts: u32,
    /// Re-entrancy guard: at most one keep-alive on the wire.
    keep_alive_inflight: bool,
    keep_alive: Interval,

    command: Option<InflightCommand<D, R>>,
    queued: VecDeque<(D, SubmitTx<R>)>,
    queries: HashMap<u64, InflightQuery<D, R>>,
    next_query_id: u64,

    rx_api: mpsc::UnboundedReceiver<(ClientMsg<D, R>, Span)>,
    tx_internal: mpsc::UnboundedSender<(ClientEvent<T::Conn, R>, Span)>,
    rx_internal: mpsc::UnboundedReceiver<(ClientEvent<T::Conn, R>, Span)>,
    tx_metrics: watch::Sender<ClientMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D: AppData, R: AppResponse, T: SessionTransport<D, R>> ClientCore<D, R, T> {
    pub(crate) fn spawn(
        config: Arc<Config>,
        members: BTreeSet<NodeId>,
        transport: Arc<T>,
        client_addr: Option<String>,
        rx_api: mpsc::UnboundedReceiver<(ClientMsg<D, R>, Span)>,
        tx_publish: mpsc::UnboundedSender<Publish<D>>,
        tx_metrics: watch::Sender<ClientMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let keep_alive = interval(Duration::from_millis(config.keep_alive_interval));
        let (tx_internal, rx_internal) = mpsc::unbounded_channel();
        let this = Self {
            config,
            transport,
            client_addr,
            members,
            leader: None,
            term: 0,
            session: None,
            request: 0,
            response: 0,
            version: 0,
            open: true,
            conn: None,
            tx_publish,
            registering: false,
            register_attempts: 0,
            keep_alive_inflight: false,
            keep_alive,
            command: None,
            queued: VecDeque::new(),
            queries: HashMap::new(),
            next_query_id: 0,
            rx_api,
            tx_internal,
            rx_internal,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the client context.
    #[tracing::instrument(level="debug", skip(self), fields(cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        tracing::debug!("client session runtime is initializing");
        self.report_metrics();
        loop {
            if !self.open {
                return;
            }

            tokio::select! {
                msg = self.rx_api.recv() => match msg {
                    Some((msg, span)) => {
                        let _ent = span.enter();
                        self.handle_msg(msg);
                    }
                    // All handles are gone; close the session.
                    None => {
                        self.handle_close();
                        return;
                    }
                },
                Some((event, span)) = self.rx_internal.recv() => {
                    let _ent = span.enter();
                    self.handle_event(event);
                }
                _ = self.keep_alive.tick() => self.beat(),
                _ = &mut self.rx_shutdown => {
                    self.handle_close();
                    return;
                }
            }
        }
    }

    fn handle_msg(&mut self, msg: ClientMsg<D, R>) {
        match msg {
            ClientMsg::Command { data, tx } => {
                if self.command.is_some() {
                    // Pipeline: one command on the wire, the rest queue in
                    // submission order behind it.
                    self.queued.push_back((data, tx));
                    return;
                }
                self.command = Some(InflightCommand {
                    request: 0,
                    dispatched: false,
                    data,
                    tx,
                });
                self.dispatch_command();
            }
            ClientMsg::Query { data, consistency, tx } => {
                let id = self.next_query_id;
                self.next_query_id += 1;
                self.queries.insert(id, InflightQuery {
                    consistency,
                    dispatched: false,
                    data,
                    tx,
                });
                self.dispatch_query(id);
            }
        }
    }

    fn handle_event(&mut self, event: ClientEvent<T::Conn, R>) {
        match event {
            ClientEvent::Registered { target, conn, result } => self.handle_registered(target, conn, result),
            ClientEvent::KeptAlive { target, conn, result } => self.handle_kept_alive(target, conn, result),
            ClientEvent::CommandDone {
                session,
                request,
                target,
                conn,
                result,
            } => self.handle_command_done(session, request, target, conn, result),
            ClientEvent::QueryDone {
                id,
                session,
                target,
                conn,
                result,
            } => self.handle_query_done(id, session, target, conn, result),
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Registration

    /// Kick off a registration round unless one is already running.
    #[tracing::instrument(level = "trace", skip(self))]
    fn ensure_registered(&mut self) {
        if self.registering || self.session.is_some() {
            return;
        }
        self.registering = true;
        self.register_attempts = 0;
        self.spawn_register();
    }

    /// Launch one registration attempt, delayed by the current backoff.
    fn spawn_register(&mut self) {
        let attempts = self.register_attempts;
        let delay = if attempts == 0 {
            0
        } else {
            let shift = (attempts - 1).min(16);
            self.config
                .register_backoff_min
                .saturating_mul(1u64 << shift)
                .min(self.config.register_backoff_max)
        };
        let target = self.select_member(true);
        let existing = self.connection_for(target);
        let transport = self.transport.clone();
        let publishes = self.tx_publish.clone();
        let tx = self.tx_internal.clone();
        let deadline = Duration::from_millis(self.config.request_timeout);
        let req = RegisterRequest {
            client_addr: self.client_addr.clone(),
        };
        tracing::debug!(target, attempts, delay, "launching register attempt");
        tokio::spawn(
            async move {
                if delay > 0 {
                    sleep(Duration::from_millis(delay)).await;
                }
                let span = tracing::debug_span!("CH");
                let conn = match Self::dial(transport.as_ref(), target, existing, publishes).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = tx.send((
                            ClientEvent::Registered {
                                target,
                                conn: None,
                                result: Err(err),
                            },
                            span,
                        ));
                        return;
                    }
                };
                let result = match timeout(deadline, conn.register(req)).await {
                    Ok(res) => res,
                    Err(_) => Err(anyhow!("timeout while sending register request to member {}", target)),
                };
                let _ = tx.send((
                    ClientEvent::Registered {
                        target,
                        conn: Some(conn),
                        result,
                    },
                    span,
                ));
            }
            .instrument(tracing::debug_span!("spawn")),
        );
    }

    #[tracing::instrument(level = "trace", skip(self, conn, result))]
    fn handle_registered(&mut self, target: NodeId, conn: Option<Arc<T::Conn>>, result: Result<RegisterResponse>) {
        if !self.registering {
            return;
        }
        if let Some(conn) = conn {
            self.conn = Some((target, conn));
        }
        match result {
            Ok(resp) if resp.status == Status::Ok => {
                tracing::info!("registered {}", resp.summary());
                self.registering = false;
                self.register_attempts = 0;
                self.update_leadership(resp.term, resp.leader);
                if !resp.members.is_empty() {
                    self.members = resp.members;
                }
                self.session = Some(resp.session);
                self.request = 0;
                self.response = 0;
                self.report_metrics();

                // Release everything that was waiting on a session.
                self.dispatch_command();
                let ids: Vec<u64> = self.queries.keys().copied().collect();
                for id in ids {
                    self.dispatch_query(id);
                }
            }
            Ok(resp) => {
                tracing::debug!(status = ?resp.status, "register attempt rejected");
                match resp.leader {
                    Some(_) => self.update_leadership(resp.term, resp.leader),
                    None => self.leader = None,
                }
                self.register_attempts += 1;
                self.spawn_register();
            }
            Err(err) => {
                tracing::warn!(error=%err, target, "error sending register request to member");
                self.leader = None;
                self.register_attempts += 1;
                self.spawn_register();
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Keep-alive

    /// Fire one keep-alive if the session exists and none is in flight.
    #[tracing::instrument(level = "trace", skip(self))]
    fn beat(&mut self) {
        if self.keep_alive_inflight || self.registering {
            return;
        }
        let session = match self.session {
            Some(session) => session,
            None => return,
        };
        self.keep_alive_inflight = true;

        // Prefer the member we already talk to; beats should not churn the
        // connection.
        let cached = self.conn.as_ref().map(|(member, _)| *member);
        let target = match cached {
            Some(member) => member,
            None => self.select_member(true),
        };
        let existing = self.connection_for(target);
        let transport = self.transport.clone();
        let publishes = self.tx_publish.clone();
        let tx = self.tx_internal.clone();
        let deadline = Duration::from_millis(self.config.request_timeout);
        tokio::spawn(
            async move {
                let span = tracing::debug_span!("CH");
                let conn = match Self::dial(transport.as_ref(), target, existing, publishes).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = tx.send((
                            ClientEvent::KeptAlive {
                                target,
                                conn: None,
                                result: Err(err),
                            },
                            span,
                        ));
                        return;
                    }
                };
                let result = match timeout(deadline, conn.keep_alive(KeepAliveRequest { session })).await {
                    Ok(res) => res,
                    Err(_) => Err(anyhow!("timeout while sending keep-alive request to member {}", target)),
                };
                let _ = tx.send((
                    ClientEvent::KeptAlive {
                        target,
                        conn: Some(conn),
                        result,
                    },
                    span,
                ));
            }
            .instrument(tracing::debug_span!("spawn")),
        );
    }

    #[tracing::instrument(level = "trace", skip(self, conn, result))]
    fn handle_kept_alive(&mut self, target: NodeId, conn: Option<Arc<T::Conn>>, result: Result<KeepAliveResponse>) {
        self.keep_alive_inflight = false;
        if let Some(conn) = conn {
            self.conn = Some((target, conn));
        }
        match result {
            Ok(resp) if resp.status == Status::Ok => {
                self.update_leadership(resp.term, resp.leader);
                self.version = self.version.max(resp.version);
                if !resp.members.is_empty() {
                    self.members = resp.members;
                }
                self.report_metrics();
            }
            // No corrective action on failure: the next command or query
            // will re-register if the session is actually gone.
            Ok(resp) => tracing::debug!(status = ?resp.status, "keep-alive rejected"),
            Err(err) => tracing::debug!(error=%err, target, "keep-alive failed"),
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Commands

    /// Put the current command on the wire, numbering it if needed.
    #[tracing::instrument(level = "trace", skip(self))]
    fn dispatch_command(&mut self) {
        if self.command.is_none() {
            return;
        }
        let session = match self.session {
            Some(session) => session,
            None => {
                self.ensure_registered();
                return;
            }
        };
        let (request, data) = match self.command.as_mut() {
            Some(cmd) if !cmd.dispatched => {
                if cmd.request == 0 {
                    // Numbered lazily so a session reset restarts the
                    // sequence under the new session.
                    self.request += 1;
                    cmd.request = self.request;
                }
                cmd.dispatched = true;
                (cmd.request, cmd.data.clone())
            }
            // An attempt is already on the wire; its completion drives the
            // next step.
            _ => return,
        };
        let req = CommandRequest {
            session,
            request,
            response_ack: self.response,
            data,
        };
        let target = self.select_member(true);
        tracing::debug!(target, "sending command {}", req.summary());
        self.spawn_command(target, session, request, req);
    }

    fn spawn_command(&mut self, target: NodeId, session: SessionId, request: u64, req: CommandRequest<D>) {
        let existing = self.connection_for(target);
        let transport = self.transport.clone();
        let publishes = self.tx_publish.clone();
        let tx = self.tx_internal.clone();
        let deadline = Duration::from_millis(self.config.request_timeout);
        tokio::spawn(
            async move {
                let span = tracing::debug_span!("CH");
                let conn = match Self::dial(transport.as_ref(), target, existing, publishes).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = tx.send((
                            ClientEvent::CommandDone {
                                session,
                                request,
                                target,
                                conn: None,
                                result: Err(err),
                            },
                            span,
                        ));
                        return;
                    }
                };
                let result = match timeout(deadline, conn.command(req)).await {
                    Ok(res) => res,
                    Err(_) => Err(anyhow!("timeout while sending command request to member {}", target)),
                };
                let _ = tx.send((
                    ClientEvent::CommandDone {
                        session,
                        request,
                        target,
                        conn: Some(conn),
                        result,
                    },
                    span,
                ));
            }
            .instrument(tracing::debug_span!("spawn")),
        );
    }

    #[tracing::instrument(level = "trace", skip(self, conn, result), fields(request=request))]
    fn handle_command_done(
        &mut self,
        session: SessionId,
        request: u64,
        target: NodeId,
        conn: Option<Arc<T::Conn>>,
        result: Result<CommandResponse<R>>,
    ) {
        if let Some(conn) = conn {
            self.conn = Some((target, conn));
        }
        match self.command.as_mut() {
            Some(cmd) if cmd.request == request => cmd.dispatched = false,
            // The command this attempt belonged to is gone.
            _ => return,
        }
        match result {
            Err(err) => {
                // Timeouts & transport failures retry with the same request
                // number: the server's response cache makes that safe.
                tracing::warn!(error=%err, target, "error sending command request to member");
                self.leader = None;
                self.report_metrics();
                self.dispatch_command();
            }
            Ok(resp) => match resp.status {
                Status::Ok => {
                    self.version = self.version.max(resp.version);
                    if self.session == Some(session) {
                        self.response = self.response.max(request);
                    }
                    if let Some(cmd) = self.command.take() {
                        match resp.result {
                            Some(result) => {
                                let _ = cmd.tx.send(Ok(result));
                            }
                            None => {
                                let _ = cmd.tx.send(Err(ClientError::ProtocolViolation(
                                    "ok command response carried no result".into(),
                                )));
                            }
                        }
                    }
                    self.report_metrics();
                    self.next_command();
                }
                Status::UnknownSession => {
                    tracing::debug!(session, "session is gone, re-registering");
                    self.reset_session(session);
                    if let Some(cmd) = self.command.as_mut() {
                        cmd.request = 0;
                    }
                    self.report_metrics();
                    if self.session.is_some() {
                        // Another path already re-registered; go straight
                        // back out under the new session.
                        self.dispatch_command();
                    } else {
                        self.ensure_registered();
                    }
                }
                Status::NoLeader => {
                    self.leader = None;
                    self.dispatch_command();
                }
                Status::Error => {
                    self.version = self.version.max(resp.version);
                    if let Some(cmd) = self.command.take() {
                        let _ = cmd.tx.send(Err(ClientError::Remote(resp.error.unwrap_or_default())));
                    }
                    self.report_metrics();
                    self.next_command();
                }
            },
        }
    }

    /// Pull the next queued command into the pipeline.
    fn next_command(&mut self) {
        if let Some((data, tx)) = self.queued.pop_front() {
            self.command = Some(InflightCommand {
                request: 0,
                dispatched: false,
                data,
                tx,
            });
            self.dispatch_command();
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Queries

    #[tracing::instrument(level = "trace", skip(self), fields(id=id))]
    fn dispatch_query(&mut self, id: u64) {
        let session = match self.session {
            Some(session) => session,
            None => {
                self.ensure_registered();
                return;
            }
        };
        let (data, leader_required) = match self.queries.get_mut(&id) {
            Some(query) if !query.dispatched => {
                query.dispatched = true;
                (query.data.clone(), query.consistency == Consistency::Linearizable)
            }
            _ => return,
        };
        let req = QueryRequest {
            session,
            version: self.version,
            data,
        };
        let target = self.select_member(leader_required);
        tracing::debug!(target, "sending query {}", req.summary());
        self.spawn_query(id, target, session, req);
    }

    fn spawn_query(&mut self, id: u64, target: NodeId, session: SessionId, req: QueryRequest<D>) {
        let existing = self.connection_for(target);
        let transport = self.transport.clone();
        let publishes = self.tx_publish.clone();
        let tx = self.tx_internal.clone();
        let deadline = Duration::from_millis(self.config.request_timeout);
        tokio::spawn(
            async move {
                let span = tracing::debug_span!("CH");
                let conn = match Self::dial(transport.as_ref(), target, existing, publishes).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = tx.send((
                            ClientEvent::QueryDone {
                                id,
                                session,
                                target,
                                conn: None,
                                result: Err(err),
                            },
                            span,
                        ));
                        return;
                    }
                };
                let result = match timeout(deadline, conn.query(req)).await {
                    Ok(res) => res,
                    Err(_) => Err(anyhow!("timeout while sending query request to member {}", target)),
                };
                let _ = tx.send((
                    ClientEvent::QueryDone {
                        id,
                        session,
                        target,
                        conn: Some(conn),
                        result,
                    },
                    span,
                ));
            }
            .instrument(tracing::debug_span!("spawn")),
        );
    }

    #[tracing::instrument(level = "trace", skip(self, conn, result), fields(id=id))]
    fn handle_query_done(
        &mut self,
        id: u64,
        session: SessionId,
        target: NodeId,
        conn: Option<Arc<T::Conn>>,
        result: Result<QueryResponse<R>>,
    ) {
        if let Some(conn) = conn {
            self.conn = Some((target, conn));
        }
        match self.queries.get_mut(&id) {
            Some(query) => query.dispatched = false,
            None => return,
        }
        match result {
            Err(err) => {
                // Queries are idempotent; re-issue freely.
                tracing::warn!(error=%err, target, "error sending query request to member");
                self.leader = None;
                self.dispatch_query(id);
            }
            Ok(resp) => match resp.status {
                Status::Ok => {
                    self.version = self.version.max(resp.version);
                    if let Some(query) = self.queries.remove(&id) {
                        match resp.result {
                            Some(result) => {
                                let _ = query.tx.send(Ok(result));
                            }
                            None => {
                                let _ = query.tx.send(Err(ClientError::ProtocolViolation(
                                    "ok query response carried no result".into(),
                                )));
                            }
                        }
                    }
                    self.report_metrics();
                }
                Status::UnknownSession => {
                    tracing::debug!(session, "session is gone, re-registering");
                    self.reset_session(session);
                    self.report_metrics();
                    if self.session.is_some() {
                        self.dispatch_query(id);
                    } else {
                        self.ensure_registered();
                    }
                }
                Status::NoLeader => {
                    self.leader = None;
                    self.dispatch_query(id);
                }
                Status::Error => {
                    self.version = self.version.max(resp.version);
                    if let Some(query) = self.queries.remove(&id) {
                        let _ = query.tx.send(Err(ClientError::Remote(resp.error.unwrap_or_default())));
                    }
                    self.report_metrics();
                }
            },
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Shared plumbing

    /// Pick the member for the next attempt: the leader when known &
    /// wanted, else uniformly at random from the cluster view.
    fn select_member(&mut self, leader: bool) -> NodeId {
        if leader {
            if let Some(member) = self.leader {
                return member;
            }
        }
        let members: Vec<NodeId> = self.members.iter().copied().collect();
        match members.len() {
            0 => self.leader.unwrap_or(0),
            1 => members[0],
            n => members[rand::thread_rng().gen_range(0..n)],
        }
    }

    /// Reuse the live connection when it already points at `target`; else
    /// drop it, honoring the one-connection-at-a-time rule, and let the
    /// driver dial fresh.
    fn connection_for(&mut self, target: NodeId) -> Option<Arc<T::Conn>> {
        let reuse = match &self.conn {
            Some((member, conn)) if *member == target => Some(conn.clone()),
            _ => None,
        };
        if reuse.is_none() {
            self.conn = None;
        }
        reuse
    }

    /// Forget the session the server rejected, unless a newer one has
    /// already replaced it.
    fn reset_session(&mut self, rejected: SessionId) {
        if self.session == Some(rejected) {
            self.session = None;
            self.request = 0;
            self.response = 0;
        }
    }

    /// Adopt a leadership observation; a higher term always wins, a stale
    /// term never overwrites.
    fn update_leadership(&mut self, term: u64, leader: Option<NodeId>) {
        if term > self.term {
            self.term = term;
            self.leader = leader;
        } else if term == self.term && leader.is_some() {
            self.leader = leader;
        }
    }

    /// Fail everything outstanding and release the connection.
    #[tracing::instrument(level = "debug", skip(self))]
    fn handle_close(&mut self) {
        tracing::info!("closing client session");
        self.open = false;
        self.registering = false;
        if let Some(cmd) = self.command.take() {
            let _ = cmd.tx.send(Err(ClientError::Closed));
        }
        while let Some((_, tx)) = self.queued.pop_front() {
            let _ = tx.send(Err(ClientError::Closed));
        }
        for (_, query) in self.queries.drain() {
            let _ = query.tx.send(Err(ClientError::Closed));
        }
        self.conn = None;
        self.report_metrics();
    }

    /// Report a metrics payload on the current state of the session.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(ClientMetrics {
            session: self.session,
            leader: self.leader,
            term: self.term,
            version: self.version,
            open: self.open,
        });
        if let Err(err) = res {
            tracing::error!(error=%err, "error reporting metrics");
        }
    }

    /// Resolve a connection for a driver: reuse the handed-down one, else
    /// dial the member fresh.
    async fn dial(
        transport: &T,
        target: NodeId,
        existing: Option<Arc<T::Conn>>,
        publishes: mpsc::UnboundedSender<Publish<D>>,
    ) -> Result<Arc<T::Conn>> {
        match existing {
            Some(conn) => Ok(conn),
            None => Ok(Arc::new(transport.connect(target, publishes).await?)),
        }
    }
}
