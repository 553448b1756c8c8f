//! A session-aware replicated state machine runtime.
//!
//! This crate implements the execution half of a consensus system. A
//! Raft-style log layer (storage, replication and leader election are all
//! external collaborators) hands committed entries to the [`Runtime`],
//! which drives a user-supplied [`StateMachine`] on a single logical thread
//! of execution, tracks client sessions, deduplicates commands, schedules
//! bounded-staleness queries and answers compaction filtering questions.
//!
//! The other half is the [`client::SessionClient`]: it registers a session,
//! keeps it alive, tracks the cluster leader, retries across member
//! failures and maintains the request/response/version watermarks that make
//! commands exactly-once and queries monotonic.
//!
//! Both halves share a small protocol: a session is identified by the log
//! index of the `Register` entry that created it, commands carry a
//! monotonic per-session request number keyed into a server-side response
//! cache, and every response carries the applied log index so the client
//! can refuse to read older state after a leader change.

pub mod client;
mod config;
mod core;
mod entry;
mod error;
mod machine;
pub mod metrics;
mod rpc;
mod runtime;
mod sessions;
mod transport;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use async_trait;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::ConfigError;
pub use crate::core::Applied;
pub use crate::entry::CommandEntry;
pub use crate::entry::Entry;
pub use crate::entry::EntryPayload;
pub use crate::entry::KeepAliveEntry;
pub use crate::entry::NoOpEntry;
pub use crate::entry::QueryEntry;
pub use crate::entry::RegisterEntry;
pub use crate::error::ApplyError;
pub use crate::error::ClientError;
pub use crate::error::RuntimeError;
pub use crate::error::RuntimeResult;
pub use crate::error::WaitError;
pub use crate::machine::Commit;
pub use crate::machine::Compaction;
pub use crate::machine::CompactionKind;
pub use crate::machine::StateMachine;
pub use crate::metrics::RuntimeMetrics;
pub use crate::rpc::CommandRequest;
pub use crate::rpc::CommandResponse;
pub use crate::rpc::KeepAliveRequest;
pub use crate::rpc::KeepAliveResponse;
pub use crate::rpc::Publish;
pub use crate::rpc::QueryRequest;
pub use crate::rpc::QueryResponse;
pub use crate::rpc::RegisterRequest;
pub use crate::rpc::RegisterResponse;
pub use crate::rpc::Status;
pub use crate::runtime::Runtime;
pub use crate::runtime::RuntimeSnapshot;
pub use crate::sessions::Session;
pub use crate::sessions::SessionInfo;
pub use crate::sessions::SessionState;
pub use crate::transport::Connection;
pub use crate::transport::SessionTransport;

/// A Raft cluster node's ID.
pub type NodeId = u64;

/// An index into the replicated log.
pub type LogIndex = u64;

/// A client session's ID.
///
/// Equal to the index of the log entry which registered the session, which
/// makes session IDs unique across the lifetime of the cluster without any
/// extra coordination.
pub type SessionId = u64;

/// A trait defining application specific command & query payloads.
///
/// ## Note
///
/// The trait is automatically implemented for any type which satisfies its
/// supertraits, application types need only derive the serde traits.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// Responses are cached per session and request number; a retried command
/// is answered from that cache without re-invoking the state machine, which
/// is why `Clone` is required.
pub trait AppResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait to summarize a message for tracing output.
pub trait MessageSummary {
    /// Return a brief, single-line summary of the message.
    fn summary(&self) -> String;
}
