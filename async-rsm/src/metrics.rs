//! Observable runtime state & wait utilities.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::LogIndex;
use crate::WaitError;

/// A set of metrics describing the current state of a runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    /// The index of the highest applied log entry.
    pub last_applied: LogIndex,
    /// The number of open sessions.
    pub open_sessions: usize,
    /// The number of queries parked waiting for their version.
    pub pending_queries: usize,
    /// The total number of cached command responses across all sessions.
    pub cached_responses: usize,
}

/// A handle for waiting on runtime metrics to satisfy some condition.
///
/// ```ignore
/// // wait for the runtime to apply up to log index 3:
/// runtime.wait(None).applied(3, "apply log-3").await?;
/// ```
pub struct Wait {
    pub(crate) timeout: Duration,
    pub(crate) rx: watch::Receiver<RuntimeMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy `func`, or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<RuntimeMetrics, WaitError>
    where T: Fn(&RuntimeMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            tracing::debug!("wait metrics: {:?}", latest);
            if func(&latest) {
                return Ok(latest);
            }
            let changed = timeout(self.timeout, rx.changed())
                .await
                .map_err(|_| WaitError::Timeout(self.timeout, msg.to_string()))?;
            changed.map_err(|_| WaitError::Shutdown)?;
        }
    }

    /// Wait for `last_applied` to reach `want` (inclusive).
    pub async fn applied(&self, want: LogIndex, msg: &str) -> Result<RuntimeMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= want, &format!("{} last_applied >= {}", msg, want)).await
    }

    /// Wait for the number of open sessions to become `want`.
    pub async fn sessions(&self, want: usize, msg: &str) -> Result<RuntimeMetrics, WaitError> {
        self.metrics(|m| m.open_sessions == want, &format!("{} open_sessions == {}", msg, want)).await
    }
}
