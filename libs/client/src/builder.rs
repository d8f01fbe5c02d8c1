//! Session configuration and construction.

use crate::session::ClientSession;
use logplane_consensus::{RaftError, RaftNode, ReadConsistency, Result};
use std::time::Duration;

/// Which node a session sends operations to.
///
/// Commands always go to the leader regardless of this setting; it only
/// affects queries, and only at the `Sequential` consistency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommunicationStrategy {
    /// Route everything through the leader.
    Leader,
    /// Spread sequential queries over all nodes.
    Any,
}

/// What a session does when the cluster reports it expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Transparently open a replacement session and continue. The new
    /// session has a fresh sequence stream, so a command that was in
    /// flight when the old session died may apply twice.
    Recover,
    /// Surface the error and leave the session closed.
    Close,
}

/// Tunables for a client session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub read_consistency: ReadConsistency,
    pub communication_strategy: CommunicationStrategy,
    pub recovery_strategy: RecoveryStrategy,
    /// Server-side session timeout; keep-alives are sent at half this.
    pub timeout: Duration,
    /// Attempts per operation before the error is surfaced.
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_consistency: ReadConsistency::Sequential,
            communication_strategy: CommunicationStrategy::Leader,
            recovery_strategy: RecoveryStrategy::Recover,
            timeout: Duration::from_secs(10),
            max_retries: 16,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Fluent builder for a [`ClientSession`].
pub struct SessionBuilder {
    client_id: String,
    nodes: Vec<RaftNode>,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            nodes: vec![],
            config: SessionConfig::default(),
        }
    }

    /// The nodes of the partition this session talks to.
    pub fn nodes(mut self, nodes: Vec<RaftNode>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn read_consistency(mut self, consistency: ReadConsistency) -> Self {
        self.config.read_consistency = consistency;
        self
    }

    pub fn communication_strategy(mut self, strategy: CommunicationStrategy) -> Self {
        self.config.communication_strategy = strategy;
        self
    }

    pub fn recovery_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.config.recovery_strategy = strategy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Open the session on the cluster.
    pub async fn build(self) -> Result<ClientSession> {
        if self.nodes.is_empty() {
            return Err(RaftError::ConfigurationError(
                "a session needs at least one node".into(),
            ));
        }
        ClientSession::connect(self.client_id, self.nodes, self.config).await
    }
}
