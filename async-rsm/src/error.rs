//! Error types exposed by this crate.

use std::time::Duration;

use crate::SessionId;

/// A result type where the error variant is always a `RuntimeError`.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Fatal errors of the state machine runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The runtime is shutting down and can not accept further work.
    #[error("runtime is shutting down")]
    ShuttingDown,
    /// The log layer handed the runtime an entry it must not apply.
    ///
    /// This is fatal on the server: the log is the single source of truth,
    /// and an entry which can not be dispatched (or which would move
    /// `last_applied` backwards) indicates a corrupted collaborator.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The user state machine failed outside of its `apply` callback.
    ///
    /// Errors from `register`, `expire`, `filter`, `snapshot` & `restore`
    /// leave the machine in an unknown state and trigger shutdown.
    #[error("state machine error: {0}")]
    StateMachine(anyhow::Error),
}

/// Errors produced while applying a single entry or query.
///
/// Unlike [`RuntimeError`], these are per-request: the runtime stays up and
/// keeps applying subsequent entries.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// The named session is not in the registry, or expired just now.
    ///
    /// Surfaced to the submitting client, which responds by registering a
    /// fresh session and resubmitting.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    /// The user state machine rejected the command.
    ///
    /// The session stays open; the error text propagates to the caller.
    #[error("command rejected by state machine: {0}")]
    User(String),
    /// The runtime itself failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors surfaced by the client session runtime.
///
/// Transient conditions (timeouts, missing leaders, transport failures,
/// expired sessions) are recovered internally and never escape a submit
/// call; the variants below are what callers actually observe.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The remote state machine rejected the request.
    #[error("remote error: {0}")]
    Remote(String),
    /// The server answered with a frame the client can not interpret.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// The client was closed before the request completed.
    #[error("client session is closed")]
    Closed,
}

/// Errors from waiting on metrics conditions.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// Timed out waiting for the condition.
    #[error("timeout after {0:?} when waiting for condition: {1}")]
    Timeout(Duration, String),
    /// The watched task is gone.
    #[error("the watched task has shut down")]
    Shutdown,
}
