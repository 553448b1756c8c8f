//! The client-side session runtime.
//!
//! A [`SessionClient`] owns one logical session against the cluster: it
//! registers the session, beats it with keep-alives, tracks the leader,
//! retries submissions across member failures, and maintains the
//! request/response/version watermarks which make commands exactly-once
//! and queries monotonic. All session state lives on a single spawned
//! context task; the public handle marshals work onto it and returns
//! futures.

mod core;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::Span;

use crate::client::core::ClientCore;
use crate::client::core::ClientMsg;
use crate::config::Config;
use crate::error::ClientError;
use crate::error::WaitError;
use crate::rpc::Publish;
use crate::transport::SessionTransport;
use crate::AppData;
use crate::AppResponse;
use crate::LogIndex;
use crate::NodeId;
use crate::SessionId;

/// The consistency demanded of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Route to the leader; combined with the version watermark this
    /// yields linearizable reads.
    Linearizable,
    /// Route to any member; reads are bounded-stale, never older than the
    /// client's version watermark.
    Sequential,
}

struct ClientInner<D: AppData, R: AppResponse, T: SessionTransport<D, R>> {
    tx_api: mpsc::UnboundedSender<(ClientMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<ClientMetrics>,
    core_handle: Mutex<Option<JoinHandle<()>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_t: std::marker::PhantomData<T>,
}

/// A handle to a client session against the cluster.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally: all clones
/// share the one session and its watermarks.
pub struct SessionClient<D: AppData, R: AppResponse, T: SessionTransport<D, R>> {
    inner: Arc<ClientInner<D, R, T>>,
}

impl<D: AppData, R: AppResponse, T: SessionTransport<D, R>> SessionClient<D, R, T> {
    /// Create and spawn a new client session runtime.
    ///
    /// `members` is the initial cluster view and must be non-empty; the
    /// view is refreshed from every registration & keep-alive response.
    /// Returns the handle together with the stream of events the cluster
    /// publishes to this session.
    ///
    /// Registration is lazy: the session is established by the first
    /// submitted command or query.
    #[tracing::instrument(level="debug", skip(config, transport), fields(cluster=%config.cluster_name))]
    pub fn new(
        config: Arc<Config>,
        members: BTreeSet<NodeId>,
        transport: Arc<T>,
        client_addr: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Publish<D>>) {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_publish, rx_publish) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(ClientMetrics::default());
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle =
            ClientCore::spawn(config, members, transport, client_addr, rx_api, tx_publish, tx_metrics, rx_shutdown);
        let inner = ClientInner {
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_t: std::marker::PhantomData,
        };
        (Self { inner: Arc::new(inner) }, rx_publish)
    }

    /// Submit a command to the replicated state machine.
    ///
    /// Commands are linearizable and exactly-once: the session runtime
    /// assigns a monotonic request number, retries transparently through
    /// timeouts, missing leaders, transport failures and session expiry,
    /// and the server's response cache guarantees the state machine applies
    /// the command at most once. Per session, commands apply in submission
    /// order.
    #[tracing::instrument(level = "debug", skip(self, data))]
    pub async fn command(&self, data: D) -> Result<R, ClientError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((ClientMsg::Command { data, tx }, span))
            .map_err(|_| ClientError::Closed)?;

        rx.await.map_err(|_| ClientError::Closed).and_then(|res| res)
    }

    /// Submit a query to the replicated state machine.
    ///
    /// Queries are read-only and freely re-issued on failure. The client's
    /// version watermark rides along, so a query never observes state older
    /// than anything this session has already seen.
    #[tracing::instrument(level = "debug", skip(self, data))]
    pub async fn query(&self, data: D, consistency: Consistency) -> Result<R, ClientError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((ClientMsg::Query { data, consistency, tx }, span))
            .map_err(|_| ClientError::Closed)?;

        rx.await.map_err(|_| ClientError::Closed).and_then(|res| res)
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<ClientMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> ClientWait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        ClientWait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Close this client session.
    ///
    /// Cancels the keep-alive timer, fails queued submissions with
    /// [`ClientError::Closed`], and releases the connection. In-flight
    /// request attempts complete or time out naturally.
    pub async fn close(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            handle.await?;
        }
        Ok(())
    }
}

impl<D: AppData, R: AppResponse, T: SessionTransport<D, R>> Clone for SessionClient<D, R, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A set of metrics describing the current state of a client session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetrics {
    /// The established session, if any.
    pub session: Option<SessionId>,
    /// The leader known to this client, if any.
    pub leader: Option<NodeId>,
    /// The highest term observed from any response.
    pub term: u64,
    /// The highest applied log index observed from any response.
    ///
    /// Never decreases.
    pub version: LogIndex,
    /// False once the client has been closed.
    pub open: bool,
}

/// A handle for waiting on client metrics to satisfy some condition.
pub struct ClientWait {
    timeout: Duration,
    rx: watch::Receiver<ClientMetrics>,
}

impl ClientWait {
    /// Wait until the metrics satisfy `func`, or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<F>(&self, func: F, msg: &str) -> Result<ClientMetrics, WaitError>
    where F: Fn(&ClientMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }
            let changed = timeout(self.timeout, rx.changed())
                .await
                .map_err(|_| WaitError::Timeout(self.timeout, msg.to_string()))?;
            changed.map_err(|_| WaitError::Shutdown)?;
        }
    }

    /// Wait until the client holds an established session.
    pub async fn registered(&self, msg: &str) -> Result<ClientMetrics, WaitError> {
        self.metrics(|m| m.session.is_some(), &format!("{} session registered", msg)).await
    }
}
