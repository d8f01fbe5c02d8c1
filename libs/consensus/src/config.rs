//! Partition configuration

use crate::error::RaftError;
use rand::Rng;
use std::time::Duration;

/// Configuration for one Raft partition instance.
///
/// Built through [`RaftConfigBuilder`], which validates cross-field
/// invariants at construction time. An invalid combination (for example
/// a heartbeat interval that is not shorter than the election timeout)
/// is a `ConfigurationError` up front, never a runtime surprise.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Base election timeout. The effective timeout is randomized
    /// uniformly in `[election_timeout, 2 * election_timeout)` on every
    /// role transition to avoid synchronized re-elections.
    pub election_timeout: Duration,

    /// How often the leader sends append-entries (heartbeats included).
    /// Must be strictly less than `election_timeout`.
    pub heartbeat_interval: Duration,

    /// Upper bound on concurrently in-flight append-entries requests per
    /// follower. Bounds memory growth against a slow follower while still
    /// allowing pipelining.
    pub max_appends_per_follower: usize,

    /// Upper bound in bytes on the entries batched into one
    /// append-entries request.
    pub max_append_batch_size: usize,

    /// Lower bound accepted for a client session timeout.
    pub session_min_timeout: Duration,

    /// Upper bound accepted for a client session timeout.
    pub session_max_timeout: Duration,

    /// Take a snapshot once this many entries have been applied past the
    /// last compaction boundary. Zero disables automatic snapshotting.
    pub snapshot_threshold: u64,

    /// Entries kept behind the snapshot boundary so slightly-behind
    /// followers can still catch up without a snapshot transfer.
    pub snapshot_trailing: u64,

    /// Chunk size for snapshot transfers to far-behind followers.
    pub snapshot_chunk_size: usize,
}

impl RaftConfig {
    pub fn builder() -> RaftConfigBuilder {
        RaftConfigBuilder::new()
    }

    /// A fresh randomized election timeout, uniform within the window.
    pub fn random_election_timeout(&self) -> Duration {
        let base = self.election_timeout.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..base);
        Duration::from_millis(base + jitter)
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(150),
            heartbeat_interval: Duration::from_millis(50),
            max_appends_per_follower: 2,
            max_append_batch_size: 32 * 1024,
            session_min_timeout: Duration::from_millis(250),
            session_max_timeout: Duration::from_secs(30),
            snapshot_threshold: 10_000,
            snapshot_trailing: 1_000,
            snapshot_chunk_size: 64 * 1024,
        }
    }
}

/// Builder for [`RaftConfig`]
pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RaftConfig::default(),
        }
    }

    pub fn election_timeout(mut self, timeout: Duration) -> Self {
        self.config.election_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn max_appends_per_follower(mut self, max: usize) -> Self {
        self.config.max_appends_per_follower = max;
        self
    }

    pub fn max_append_batch_size(mut self, bytes: usize) -> Self {
        self.config.max_append_batch_size = bytes;
        self
    }

    pub fn session_timeouts(mut self, min: Duration, max: Duration) -> Self {
        self.config.session_min_timeout = min;
        self.config.session_max_timeout = max;
        self
    }

    pub fn snapshot_threshold(mut self, threshold: u64) -> Self {
        self.config.snapshot_threshold = threshold;
        self
    }

    pub fn snapshot_trailing(mut self, trailing: u64) -> Self {
        self.config.snapshot_trailing = trailing;
        self
    }

    pub fn snapshot_chunk_size(mut self, bytes: usize) -> Self {
        self.config.snapshot_chunk_size = bytes;
        self
    }

    pub fn build(self) -> Result<RaftConfig, RaftError> {
        let c = &self.config;

        if c.heartbeat_interval >= c.election_timeout {
            return Err(RaftError::ConfigurationError(format!(
                "heartbeat interval {:?} must be less than election timeout {:?}",
                c.heartbeat_interval, c.election_timeout
            )));
        }
        if c.election_timeout.is_zero() {
            return Err(RaftError::ConfigurationError(
                "election timeout must be non-zero".into(),
            ));
        }
        if c.max_appends_per_follower == 0 {
            return Err(RaftError::ConfigurationError(
                "max appends per follower must be at least 1".into(),
            ));
        }
        if c.max_append_batch_size == 0 || c.snapshot_chunk_size == 0 {
            return Err(RaftError::ConfigurationError(
                "batch and chunk sizes must be non-zero".into(),
            ));
        }
        if c.session_min_timeout > c.session_max_timeout {
            return Err(RaftError::ConfigurationError(format!(
                "session min timeout {:?} exceeds max timeout {:?}",
                c.session_min_timeout, c.session_max_timeout
            )));
        }

        Ok(self.config)
    }
}

impl Default for RaftConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RaftConfigBuilder::new().build().unwrap();
        assert!(config.heartbeat_interval < config.election_timeout);
        assert_eq!(config.max_appends_per_follower, 2);
        assert_eq!(config.max_append_batch_size, 32 * 1024);
    }

    #[test]
    fn test_builder_overrides() {
        let config = RaftConfigBuilder::new()
            .election_timeout(Duration::from_millis(400))
            .heartbeat_interval(Duration::from_millis(100))
            .max_appends_per_follower(4)
            .max_append_batch_size(8 * 1024)
            .build()
            .unwrap();

        assert_eq!(config.election_timeout, Duration::from_millis(400));
        assert_eq!(config.max_appends_per_follower, 4);
        assert_eq!(config.max_append_batch_size, 8 * 1024);
    }

    #[test]
    fn test_heartbeat_must_be_below_election_timeout() {
        let err = RaftConfigBuilder::new()
            .election_timeout(Duration::from_millis(100))
            .heartbeat_interval(Duration::from_millis(150))
            .build()
            .unwrap_err();

        assert!(matches!(err, RaftError::ConfigurationError(_)));
    }

    #[test]
    fn test_session_bounds_validated() {
        let err = RaftConfigBuilder::new()
            .session_timeouts(Duration::from_secs(60), Duration::from_secs(1))
            .build()
            .unwrap_err();

        assert!(matches!(err, RaftError::ConfigurationError(_)));
    }

    #[test]
    fn test_randomized_timeout_within_window() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let t = config.random_election_timeout();
            assert!(t >= config.election_timeout);
            assert!(t < config.election_timeout * 2);
        }
    }
}
