//! Runtime & client configuration.

/// Errors encountered while building a `Config`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given values for session timeout & keep-alive are invalid.
    ///
    /// The keep-alive interval must be shorter than the session timeout,
    /// else a perfectly healthy client will expire between two beats.
    #[error("keep-alive interval must be less than the session timeout")]
    KeepAliveTooSlow,
    /// A duration was configured as zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    /// The registration backoff bounds are inverted.
    #[error("registration backoff min must not exceed backoff max")]
    InvalidBackoff,
}

/// The runtime configuration shared by the server executor & the client
/// session runtime.
///
/// All durations are in milliseconds. Use [`Config::build`] to construct an
/// instance; the builder applies defaults for anything left unset and
/// `validate` rejects inconsistent combinations.
///
/// ```
/// let config = async_rsm::Config::build("cluster0".into())
///     .session_timeout(5_000)
///     .validate()
///     .expect("failed to build config");
/// assert_eq!(config.keep_alive_interval, 1_000);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// The application specific name of the cluster, used in tracing.
    pub cluster_name: String,
    /// Idle window after which a session is expired, in log-derived time.
    ///
    /// Expiration is driven exclusively by the timestamps carried inside
    /// log entries, never by a replica's wall clock, so every replica
    /// expires every session at the same entry.
    pub session_timeout: u64,
    /// How often the client beats its session, in milliseconds.
    pub keep_alive_interval: u64,
    /// Per-RPC deadline on the client, in milliseconds.
    pub request_timeout: u64,
    /// Initial delay between failed registration rounds, in milliseconds.
    pub register_backoff_min: u64,
    /// Cap on the registration backoff, in milliseconds.
    pub register_backoff_max: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            session_timeout: None,
            keep_alive_interval: None,
            request_timeout: None,
            register_backoff_min: None,
            register_backoff_max: None,
        }
    }
}

/// A configuration builder.
pub struct ConfigBuilder {
    cluster_name: String,
    session_timeout: Option<u64>,
    keep_alive_interval: Option<u64>,
    request_timeout: Option<u64>,
    register_backoff_min: Option<u64>,
    register_backoff_max: Option<u64>,
}

impl ConfigBuilder {
    /// Set the session timeout, in milliseconds.
    pub fn session_timeout(mut self, val: u64) -> Self {
        self.session_timeout = Some(val);
        self
    }

    /// Set the client keep-alive interval, in milliseconds.
    pub fn keep_alive_interval(mut self, val: u64) -> Self {
        self.keep_alive_interval = Some(val);
        self
    }

    /// Set the per-RPC deadline, in milliseconds.
    pub fn request_timeout(mut self, val: u64) -> Self {
        self.request_timeout = Some(val);
        self
    }

    /// Set the minimum registration backoff, in milliseconds.
    pub fn register_backoff_min(mut self, val: u64) -> Self {
        self.register_backoff_min = Some(val);
        self
    }

    /// Set the maximum registration backoff, in milliseconds.
    pub fn register_backoff_max(mut self, val: u64) -> Self {
        self.register_backoff_max = Some(val);
        self
    }

    /// Validate the state of this builder & build a new `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let session_timeout = self.session_timeout.unwrap_or(5_000);
        let keep_alive_interval = self.keep_alive_interval.unwrap_or(1_000);
        let request_timeout = self.request_timeout.unwrap_or(10_000);
        let register_backoff_min = self.register_backoff_min.unwrap_or(100);
        let register_backoff_max = self.register_backoff_max.unwrap_or(5_000);

        if session_timeout == 0 {
            return Err(ConfigError::ZeroDuration("session_timeout"));
        }
        if keep_alive_interval == 0 {
            return Err(ConfigError::ZeroDuration("keep_alive_interval"));
        }
        if request_timeout == 0 {
            return Err(ConfigError::ZeroDuration("request_timeout"));
        }
        if keep_alive_interval >= session_timeout {
            return Err(ConfigError::KeepAliveTooSlow);
        }
        if register_backoff_min > register_backoff_max {
            return Err(ConfigError::InvalidBackoff);
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            session_timeout,
            keep_alive_interval,
            request_timeout,
            register_backoff_min,
            register_backoff_max,
        })
    }
}
