//! An in-memory key-value implementation of the `async-rsm::StateMachine`
//! trait, intended for testing & demonstration.
//!
//! The machine keeps a string key-value map, tracks the latest write per
//! key so the compaction filter can discard superseded commands, and lets
//! sessions watch keys: every surviving write to a watched key is published
//! to the watching sessions.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use async_rsm::async_trait::async_trait;
use async_rsm::Commit;
use async_rsm::Compaction;
use async_rsm::LogIndex;
use async_rsm::SessionId;
use async_rsm::SessionInfo;
use async_rsm::SessionState;
use async_rsm::StateMachine;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// The application data request type for the key-value machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Set `key` to `value`; answers with the previous value.
    Set { key: String, value: String },
    /// Remove `key`; answers with the removed value.
    Delete { key: String },
    /// Read `key`. Side-effect free, usable as a query.
    Read { key: String },
    /// Subscribe the proposing session to writes on `key`.
    Watch { key: String },
    /// Always rejected; exercises application-level error propagation.
    Reject { message: String },
}

/// The application data response type for the key-value machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse(pub Option<String>);

/// Errors raised inside the key-value machine.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The command asked to be rejected.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// The full state of the key-value machine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemAppState {
    /// The key-value data.
    pub kv: BTreeMap<String, String>,
    /// Per key, the log index of the latest write. Drives the compaction
    /// filter: an older write to the same key is dead weight in the log.
    pub last_write: BTreeMap<String, LogIndex>,
    /// Per key, the sessions watching it.
    pub watchers: BTreeMap<String, BTreeSet<SessionId>>,
    /// Every session the machine saw register, in order.
    pub registered: Vec<SessionId>,
    /// Every session the machine saw expire, in order.
    pub expired: Vec<SessionId>,
    /// How many mutating commands reached the machine. Deduplicated
    /// retries are answered from the runtime's response cache and must not
    /// move this counter.
    pub applies: u64,
    /// How many reads reached the machine.
    pub reads: u64,
}

/// An in-memory key-value state machine.
///
/// Clones share the same underlying state, so tests can keep a handle
/// before moving the machine into a runtime and inspect it afterwards via
/// [`MemApp::state`].
#[derive(Clone, Default)]
pub struct MemApp {
    sm: Arc<RwLock<MemAppState>>,
}

impl MemApp {
    /// Create a new `MemApp` instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of the current state machine state, for assertions.
    pub async fn state(&self) -> MemAppState {
        self.sm.read().await.clone()
    }
}

#[async_trait]
impl StateMachine for MemApp {
    type Command = ClientRequest;
    type Response = ClientResponse;

    #[tracing::instrument(level = "trace", skip(self), fields(session=session.id))]
    async fn register(&mut self, session: &SessionInfo) -> Result<()> {
        let mut sm = self.sm.write().await;
        sm.registered.push(session.id);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self), fields(session=session.id))]
    async fn expire(&mut self, session: &SessionInfo) -> Result<()> {
        let mut sm = self.sm.write().await;
        sm.expired.push(session.id);
        for watchers in sm.watchers.values_mut() {
            watchers.remove(&session.id);
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, commit), fields(index=commit.index, session=commit.session.id))]
    async fn apply(&mut self, commit: Commit<ClientRequest>) -> Result<ClientResponse> {
        let mut sm = self.sm.write().await;
        match &commit.data {
            ClientRequest::Set { key, value } => {
                sm.applies += 1;
                let previous = sm.kv.insert(key.clone(), value.clone());
                sm.last_write.insert(key.clone(), commit.index);
                if let Some(watchers) = sm.watchers.get(key) {
                    for watcher in watchers {
                        commit.publish(*watcher, commit.data.clone());
                    }
                }
                Ok(ClientResponse(previous))
            }
            ClientRequest::Delete { key } => {
                sm.applies += 1;
                let previous = sm.kv.remove(key);
                sm.last_write.insert(key.clone(), commit.index);
                if let Some(watchers) = sm.watchers.get(key) {
                    for watcher in watchers {
                        commit.publish(*watcher, commit.data.clone());
                    }
                }
                Ok(ClientResponse(previous))
            }
            ClientRequest::Read { key } => {
                sm.reads += 1;
                Ok(ClientResponse(sm.kv.get(key).cloned()))
            }
            ClientRequest::Watch { key } => {
                sm.applies += 1;
                sm.watchers.entry(key.clone()).or_insert_with(BTreeSet::new).insert(commit.session.id);
                Ok(ClientResponse(None))
            }
            ClientRequest::Reject { message } => Err(AppError::Rejected(message.clone()).into()),
        }
    }

    #[tracing::instrument(level = "trace", skip(self, commit, _compaction), fields(index=commit.index))]
    async fn filter(&mut self, commit: Commit<ClientRequest>, _compaction: Compaction) -> Result<bool> {
        let sm = self.sm.read().await;
        match &commit.data {
            // A write survives while it is still the latest for its key.
            ClientRequest::Set { key, .. } | ClientRequest::Delete { key } => {
                Ok(sm.last_write.get(key) == Some(&commit.index))
            }
            // A watch survives while its session is open and still watching.
            ClientRequest::Watch { key } => Ok(commit.session.state == SessionState::Open
                && sm.watchers.get(key).map(|watchers| watchers.contains(&commit.session.id)).unwrap_or(false)),
            ClientRequest::Read { .. } | ClientRequest::Reject { .. } => Ok(false),
        }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn snapshot(&mut self) -> Result<Vec<u8>> {
        let sm = self.sm.read().await;
        Ok(serde_json::to_vec(&*sm)?)
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot))]
    async fn restore(&mut self, snapshot: Vec<u8>) -> Result<()> {
        let state: MemAppState = serde_json::from_slice(&snapshot)?;
        let mut sm = self.sm.write().await;
        *sm = state;
        Ok(())
    }
}
