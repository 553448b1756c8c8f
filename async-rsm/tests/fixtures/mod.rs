//! Fixtures for testing the session runtime.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_rsm::async_trait::async_trait;
use async_rsm::client::SessionClient;
use async_rsm::Applied;
use async_rsm::ApplyError;
use async_rsm::CommandEntry;
use async_rsm::CommandRequest;
use async_rsm::CommandResponse;
use async_rsm::Config;
use async_rsm::Connection;
use async_rsm::Entry;
use async_rsm::KeepAliveRequest;
use async_rsm::KeepAliveResponse;
use async_rsm::NodeId;
use async_rsm::Publish;
use async_rsm::QueryEntry;
use async_rsm::QueryRequest;
use async_rsm::QueryResponse;
use async_rsm::RegisterRequest;
use async_rsm::RegisterResponse;
use async_rsm::Runtime;
use async_rsm::SessionId;
use async_rsm::SessionTransport;
use async_rsm::Status;
use memapp::ClientRequest;
use memapp::ClientResponse;
use memapp::MemApp;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete client type used during testing.
pub type MemClient = SessionClient<ClientRequest, ClientResponse, LocalTransport>;

/// Initialize the tracing system.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::Layer::default()
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
            .with_ansi(false);
        let subscriber = tracing_subscriber::Registry::default()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber).expect("error setting global tracing subscriber");
    });
}

/// A standard runtime config for tests: log-time session timeout of 5s,
/// fast real-time keep-alive & backoff so tests stay quick.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .session_timeout(5_000)
            .keep_alive_interval(50)
            .register_backoff_min(10)
            .register_backoff_max(100)
            .validate()
            .expect("failed to build config"),
    )
}

/// Shorthand for a `Set` request.
pub fn set(key: &str, value: &str) -> ClientRequest {
    ClientRequest::Set {
        key: key.into(),
        value: value.into(),
    }
}

/// Shorthand for a `Read` request.
pub fn read(key: &str) -> ClientRequest {
    ClientRequest::Read { key: key.into() }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

struct Node {
    runtime: Runtime<MemApp>,
    app: MemApp,
}

struct ClusterState {
    nodes: BTreeMap<NodeId, Node>,
    /// Nodes which are isolated can neither send nor receive frames, and
    /// stop applying committed entries (they are "down").
    isolated: HashSet<NodeId>,
    /// Nodes which apply committed commands but lose the response frame.
    lossy: HashSet<NodeId>,
    leader: Option<NodeId>,
    term: u64,
    /// The next log index to assign.
    next_index: u64,
    /// The log-derived clock stamped into committed entries, in ms. Only
    /// ever moved by the test itself; wall-clock time never leaks in.
    clock: u64,
    /// Every committed entry, for replay & compaction tests.
    log: Vec<Entry<ClientRequest>>,
    /// Where to deliver published events, per session.
    publish_routes: BTreeMap<SessionId, mpsc::UnboundedSender<Publish<ClientRequest>>>,
}

/// An in-process cluster emulating the log layer & transport around the
/// session runtime: entries get indices & log-clock timestamps from a
/// scripted shared log, committed entries apply to every live node, and the
/// leader's completion answers the client.
pub struct TestCluster {
    config: Arc<Config>,
    state: RwLock<ClusterState>,
}

impl TestCluster {
    /// Create a new cluster with no nodes.
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: RwLock::new(ClusterState {
                nodes: BTreeMap::new(),
                isolated: HashSet::new(),
                lossy: HashSet::new(),
                leader: None,
                term: 0,
                next_index: 1,
                clock: 1_000,
                log: Vec::new(),
                publish_routes: BTreeMap::new(),
            }),
        })
    }

    /// Create and register a new runtime node bearing the given ID.
    pub async fn new_node(self: &Arc<Self>, id: NodeId) {
        let app = MemApp::new();
        let (runtime, rx_events) = Runtime::new(self.config.clone(), app.clone());
        self.spawn_publish_forwarder(id, rx_events);
        let mut state = self.state.write().await;
        state.nodes.insert(id, Node { runtime, app });
    }

    /// Forward the node's published events to connected sessions, but only
    /// while the node is the leader (each server delivers only to sessions
    /// connected to it; in these tests clients talk to the leader).
    fn spawn_publish_forwarder(self: &Arc<Self>, id: NodeId, mut rx_events: mpsc::UnboundedReceiver<Publish<ClientRequest>>) {
        let cluster = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx_events.recv().await {
                let state = cluster.state.read().await;
                if state.leader != Some(id) {
                    continue;
                }
                if let Some(route) = state.publish_routes.get(&event.session) {
                    let _ = route.send(event);
                }
            }
        });
    }

    /// Declare the given node the leader, advancing the term.
    pub async fn set_leader(&self, id: NodeId) {
        let mut state = self.state.write().await;
        state.leader = Some(id);
        state.term += 1;
    }

    /// Isolate the given node: connections fail and it stops applying.
    pub async fn isolate_node(&self, id: NodeId) {
        self.state.write().await.isolated.insert(id);
    }

    /// Make the given node apply commands but lose response frames.
    pub async fn lose_responses_from(&self, id: NodeId) {
        self.state.write().await.lossy.insert(id);
    }

    /// Set the log-derived clock, in milliseconds.
    pub async fn set_clock(&self, clock: u64) {
        self.state.write().await.clock = clock;
    }

    /// Advance the log-derived clock by `delta` milliseconds.
    pub async fn advance_clock(&self, delta: u64) {
        self.state.write().await.clock += delta;
    }

    /// Commit a `NoOp` entry, advancing `last_applied` everywhere and
    /// running the expiry sweep at the current log clock.
    pub async fn commit_no_op(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let index = state.next_index;
        state.next_index += 1;
        let entry = Entry::no_op(index, state.clock);
        state.log.push(entry.clone());
        let _ = apply_everywhere(&mut state, &entry).await;
        Ok(())
    }

    /// Get a handle to the application state for the target node.
    pub async fn app_handle(&self, id: NodeId) -> Result<MemApp> {
        let state = self.state.read().await;
        let node = state.nodes.get(&id).with_context(|| format!("node {} not found in cluster", id))?;
        Ok(node.app.clone())
    }

    /// Get a handle to the runtime for the target node.
    pub async fn runtime(&self, id: NodeId) -> Result<Runtime<MemApp>> {
        let state = self.state.read().await;
        let node = state.nodes.get(&id).with_context(|| format!("node {} not found in cluster", id))?;
        Ok(node.runtime.clone())
    }

    /// A copy of every committed entry.
    pub async fn log(&self) -> Vec<Entry<ClientRequest>> {
        self.state.read().await.log.clone()
    }

    /// Build a client session runtime talking to this cluster.
    pub fn client(self: &Arc<Self>, members: BTreeSet<NodeId>) -> (MemClient, mpsc::UnboundedReceiver<Publish<ClientRequest>>) {
        let transport = Arc::new(LocalTransport { cluster: self.clone() });
        SessionClient::new(self.config.clone(), members, transport, None)
    }

    //////////////////////////////////////////////////////////////////////////
    // Request handling (the server side of `LocalTransport`)

    async fn handle_register(
        &self,
        target: NodeId,
        req: RegisterRequest,
        route: mpsc::UnboundedSender<Publish<ClientRequest>>,
    ) -> Result<RegisterResponse> {
        let mut state = self.state.write().await;
        check_reachable(&state, target)?;
        if state.leader != Some(target) {
            return Ok(RegisterResponse {
                status: Status::NoLeader,
                term: state.term,
                leader: state.leader,
                session: 0,
                members: state.nodes.keys().copied().collect(),
            });
        }

        let index = state.next_index;
        state.next_index += 1;
        let entry = Entry::<ClientRequest>::register(index, state.clock, req.client_addr);
        state.log.push(entry.clone());
        let res = apply_everywhere(&mut state, &entry).await;

        let term = state.term;
        let leader = state.leader;
        let members = state.nodes.keys().copied().collect();
        match res {
            Ok(applied) => {
                let session = applied.registered_session().ok_or_else(|| anyhow!("register entry produced no session"))?;
                state.publish_routes.insert(session, route);
                Ok(RegisterResponse {
                    status: Status::Ok,
                    term,
                    leader,
                    session,
                    members,
                })
            }
            Err(err) => Err(anyhow!("error applying register entry: {}", err)),
        }
    }

    async fn handle_keep_alive(
        &self,
        target: NodeId,
        req: KeepAliveRequest,
        route: mpsc::UnboundedSender<Publish<ClientRequest>>,
    ) -> Result<KeepAliveResponse> {
        let mut state = self.state.write().await;
        check_reachable(&state, target)?;
        if state.leader != Some(target) {
            return Ok(KeepAliveResponse {
                status: Status::NoLeader,
                term: state.term,
                leader: state.leader,
                version: 0,
                members: state.nodes.keys().copied().collect(),
            });
        }

        let index = state.next_index;
        state.next_index += 1;
        let entry = Entry::<ClientRequest>::keep_alive(index, req.session, state.clock);
        state.log.push(entry.clone());
        let res = apply_everywhere(&mut state, &entry).await;

        let term = state.term;
        let leader = state.leader;
        let members = state.nodes.keys().copied().collect();
        let status = match res {
            Ok(_) => {
                state.publish_routes.insert(req.session, route);
                Status::Ok
            }
            Err(ApplyError::UnknownSession(_)) => Status::UnknownSession,
            Err(err) => return Err(anyhow!("error applying keep-alive entry: {}", err)),
        };
        Ok(KeepAliveResponse {
            status,
            term,
            leader,
            version: index,
            members,
        })
    }

    async fn handle_command(
        &self,
        target: NodeId,
        req: CommandRequest<ClientRequest>,
        route: mpsc::UnboundedSender<Publish<ClientRequest>>,
    ) -> Result<CommandResponse<ClientResponse>> {
        let mut state = self.state.write().await;
        check_reachable(&state, target)?;
        if state.leader != Some(target) {
            return Ok(CommandResponse {
                status: Status::NoLeader,
                version: 0,
                result: None,
                error: None,
            });
        }

        let index = state.next_index;
        state.next_index += 1;
        let entry = Entry::command(index, CommandEntry {
            session: req.session,
            request: req.request,
            response_ack: req.response_ack,
            timestamp: state.clock,
            data: req.data,
        });
        state.log.push(entry.clone());
        let res = apply_everywhere(&mut state, &entry).await;

        // A lossy node did all the work but the response frame never makes
        // it back; the client sees a transport failure and retries.
        if state.lossy.contains(&target) {
            return Err(anyhow!("connection to member {} lost", target));
        }

        state.publish_routes.insert(req.session, route);
        match res {
            Ok(applied) => Ok(CommandResponse {
                status: Status::Ok,
                version: index,
                result: applied.into_response(),
                error: None,
            }),
            Err(ApplyError::UnknownSession(_)) => Ok(CommandResponse {
                status: Status::UnknownSession,
                version: index,
                result: None,
                error: None,
            }),
            Err(ApplyError::User(msg)) => Ok(CommandResponse {
                status: Status::Error,
                version: index,
                result: None,
                error: Some(msg),
            }),
            Err(err) => Err(anyhow!("error applying command entry: {}", err)),
        }
    }

    async fn handle_query(
        &self,
        target: NodeId,
        req: QueryRequest<ClientRequest>,
    ) -> Result<QueryResponse<ClientResponse>> {
        // Queries are served by the contacted member without touching the
        // log; grab what we need and release the lock, a parked query must
        // not block commits.
        let (runtime, clock) = {
            let state = self.state.read().await;
            check_reachable(&state, target)?;
            let node = state.nodes.get(&target).with_context(|| format!("node {} not found in cluster", target))?;
            (node.runtime.clone(), state.clock)
        };

        let query = QueryEntry {
            session: req.session,
            version: req.version,
            timestamp: clock,
            data: req.data,
        };
        let res = runtime.query(query).await;
        let version = runtime.metrics().borrow().last_applied;
        match res {
            Ok(result) => Ok(QueryResponse {
                status: Status::Ok,
                version,
                result: Some(result),
                error: None,
            }),
            Err(ApplyError::UnknownSession(_)) => Ok(QueryResponse {
                status: Status::UnknownSession,
                version,
                result: None,
                error: None,
            }),
            Err(ApplyError::User(msg)) => Ok(QueryResponse {
                status: Status::Error,
                version,
                result: None,
                error: Some(msg),
            }),
            Err(err) => Err(anyhow!("error executing query: {}", err)),
        }
    }
}

/// Fail if the target is unreachable (down or unknown).
fn check_reachable(state: &ClusterState, target: NodeId) -> Result<()> {
    if state.isolated.contains(&target) || !state.nodes.contains_key(&target) {
        return Err(anyhow!("connection refused by member {}", target));
    }
    Ok(())
}

/// Apply a committed entry to every live node, returning the leader's (or
/// first live node's) completion.
async fn apply_everywhere(
    state: &mut ClusterState,
    entry: &Entry<ClientRequest>,
) -> Result<Applied<ClientResponse>, ApplyError> {
    let leader = state.leader;
    let mut answer = None;
    for (id, node) in state.nodes.iter() {
        if state.isolated.contains(id) {
            continue;
        }
        let res = node.runtime.apply(entry.clone()).await;
        if Some(*id) == leader || answer.is_none() {
            answer = Some(res);
        }
    }
    answer.unwrap_or_else(|| Err(ApplyError::Runtime(async_rsm::RuntimeError::ShuttingDown)))
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates the client's network transport against the
/// in-process cluster.
pub struct LocalTransport {
    cluster: Arc<TestCluster>,
}

#[async_trait]
impl SessionTransport<ClientRequest, ClientResponse> for LocalTransport {
    type Conn = LocalConnection;

    async fn connect(
        &self,
        member: NodeId,
        publishes: mpsc::UnboundedSender<Publish<ClientRequest>>,
    ) -> Result<Self::Conn> {
        {
            let state = self.cluster.state.read().await;
            check_reachable(&state, member)?;
        }
        Ok(LocalConnection {
            cluster: self.cluster.clone(),
            target: member,
            publishes,
        })
    }
}

/// One live connection from a client to one cluster member.
pub struct LocalConnection {
    cluster: Arc<TestCluster>,
    target: NodeId,
    publishes: mpsc::UnboundedSender<Publish<ClientRequest>>,
}

#[async_trait]
impl Connection<ClientRequest, ClientResponse> for LocalConnection {
    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        self.cluster.handle_register(self.target, req, self.publishes.clone()).await
    }

    async fn keep_alive(&self, req: KeepAliveRequest) -> Result<KeepAliveResponse> {
        self.cluster.handle_keep_alive(self.target, req, self.publishes.clone()).await
    }

    async fn command(&self, req: CommandRequest<ClientRequest>) -> Result<CommandResponse<ClientResponse>> {
        self.cluster.handle_command(self.target, req, self.publishes.clone()).await
    }

    async fn query(&self, req: QueryRequest<ClientRequest>) -> Result<QueryResponse<ClientResponse>> {
        self.cluster.handle_query(self.target, req).await
    }
}
