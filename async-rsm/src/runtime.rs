//! The public runtime interface.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::Applied;
use crate::core::RuntimeCore;
use crate::core::RuntimeMsg;
use crate::entry::Entry;
use crate::entry::QueryEntry;
use crate::error::ApplyError;
use crate::error::RuntimeError;
use crate::error::RuntimeResult;
use crate::machine::Compaction;
use crate::machine::StateMachine;
use crate::metrics::RuntimeMetrics;
use crate::metrics::Wait;
use crate::rpc::Publish;
use crate::sessions::Session;
use crate::AppResponse;
use crate::LogIndex;
use crate::MessageSummary;

struct RuntimeInner<M: StateMachine> {
    tx_api: mpsc::UnboundedSender<(RuntimeMsg<M>, Span)>,
    rx_metrics: watch::Receiver<RuntimeMetrics>,
    core_handle: Mutex<Option<JoinHandle<RuntimeResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The server-side state machine runtime.
///
/// This is the interface the log layer drives: committed entries go in
/// through [`apply`](Runtime::apply), queries through
/// [`query`](Runtime::query), and log cleaning asks
/// [`filter`](Runtime::filter) what to retain. The runtime serializes
/// everything onto one core task owning the user [`StateMachine`].
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone
/// itself is very cheap and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns `RuntimeError::ShuttingDown`, the
/// runtime core has stopped (possibly due to a fatal state machine error)
/// and `shutdown` should be called to await it.
pub struct Runtime<M: StateMachine> {
    inner: Arc<RuntimeInner<M>>,
}

impl<M: StateMachine> Runtime<M> {
    /// Create and spawn a new runtime task around the given state machine.
    ///
    /// Returns the handle together with the stream of events the machine
    /// publishes to sessions; the host is responsible for forwarding each
    /// event to its session's open connection, best-effort.
    #[tracing::instrument(level="debug", skip(config, machine), fields(cluster=%config.cluster_name))]
    pub fn new(config: Arc<Config>, machine: M) -> (Self, mpsc::UnboundedReceiver<Publish<M::Command>>) {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RuntimeMetrics::default());
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = RuntimeCore::spawn(config, machine, rx_api, tx_events, tx_metrics, rx_shutdown);
        let inner = RuntimeInner {
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        (Self { inner: Arc::new(inner) }, rx_events)
    }

    /// Apply a committed log entry to the state machine.
    ///
    /// Entries must arrive in strict log order; `last_applied` advances
    /// before any entry-specific work and parked queries for the reached
    /// version fire before the entry's own logic.
    #[tracing::instrument(level = "debug", skip(self, entry), fields(entry=%entry.summary()))]
    pub async fn apply(&self, entry: Entry<M::Command>) -> Result<Applied<M::Response>, ApplyError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RuntimeMsg::Apply { entry, tx }, span))
            .map_err(|_| ApplyError::Runtime(RuntimeError::ShuttingDown))?;

        rx.await.map_err(|_| ApplyError::Runtime(RuntimeError::ShuttingDown)).and_then(|res| res)
    }

    /// Execute a query with a staleness bound.
    ///
    /// Resolves once the runtime has applied at least `query.version`; a
    /// query demanding a version beyond the applied index parks until the
    /// log catches up.
    #[tracing::instrument(level = "debug", skip(self, query), fields(query=%query.summary()))]
    pub async fn query(&self, query: QueryEntry<M::Command>) -> Result<M::Response, ApplyError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RuntimeMsg::Query { query, tx }, span))
            .map_err(|_| ApplyError::Runtime(RuntimeError::ShuttingDown))?;

        rx.await.map_err(|_| ApplyError::Runtime(RuntimeError::ShuttingDown)).and_then(|res| res)
    }

    /// Decide whether an entry staged for compaction should be retained.
    #[tracing::instrument(level = "debug", skip(self, entry, compaction), fields(entry=%entry.summary()))]
    pub async fn filter(&self, entry: Entry<M::Command>, compaction: Compaction) -> RuntimeResult<bool> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RuntimeMsg::Filter { entry, compaction, tx }, span))
            .map_err(|_| RuntimeError::ShuttingDown)?;

        rx.await.map_err(|_| RuntimeError::ShuttingDown).and_then(|res| res)
    }

    /// Capture the runtime's replicated state for the log layer's snapshot.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn snapshot(&self) -> RuntimeResult<RuntimeSnapshot<M::Response>> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RuntimeMsg::Snapshot { tx }, span))
            .map_err(|_| RuntimeError::ShuttingDown)?;

        rx.await.map_err(|_| RuntimeError::ShuttingDown).and_then(|res| res)
    }

    /// Replace the runtime's replicated state from a snapshot.
    ///
    /// Replaying the remaining log suffix afterwards reproduces the same
    /// applied index, the same session set and the same response caches on
    /// every replica.
    #[tracing::instrument(level = "debug", skip(self, snapshot), fields(last_applied=snapshot.last_applied))]
    pub async fn restore(&self, snapshot: RuntimeSnapshot<M::Response>) -> RuntimeResult<()> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RuntimeMsg::Restore { snapshot, tx }, span))
            .map_err(|_| RuntimeError::ShuttingDown)?;

        rx.await.map_err(|_| RuntimeError::ShuttingDown).and_then(|res| res)
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RuntimeMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// // wait for the runtime to apply up to log index 3:
    /// runtime.wait(Some(timeout)).applied(3, "apply log-3").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown the runtime.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<M: StateMachine> Clone for Runtime<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The runtime's replicated state, captured for log compaction.
///
/// Holds everything replay needs beyond the log itself: the applied index,
/// the session set with cached responses, and the user machine's opaque
/// snapshot blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSnapshot<R: AppResponse> {
    /// The index of the highest entry covered by this snapshot.
    pub last_applied: LogIndex,
    /// The full session set, response caches included.
    #[serde(bound = "R: AppResponse")]
    pub sessions: Vec<Session<R>>,
    /// The user state machine's snapshot.
    pub machine: Vec<u8>,
}
