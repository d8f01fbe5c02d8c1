//! Multi-partition routing
//!
//! A partitioned client owns one session per partition and routes each
//! keyed operation to the partition that owns the key. Routing must be
//! stable: every client maps a given key to the same partition, or
//! related commands would land on unrelated logs.

use crate::builder::SessionBuilder;
use crate::session::ClientSession;
use logplane_consensus::{RaftError, RaftNode, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Maps a key to one of `partitions` slots.
pub trait Partitioner: Send + Sync {
    fn partition(&self, key: &[u8], partitions: usize) -> usize;
}

/// Default partitioner: hash of the key, modulo the partition count.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn partition(&self, key: &[u8], partitions: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % partitions.max(1) as u64) as usize
    }
}

/// Builder for a [`PartitionedClient`].
pub struct PartitionedClientBuilder {
    client_id: String,
    partitions: Vec<Vec<RaftNode>>,
    partitioner: Box<dyn Partitioner>,
    configure: Box<dyn Fn(SessionBuilder) -> SessionBuilder + Send>,
}

impl PartitionedClientBuilder {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            partitions: vec![],
            partitioner: Box::new(HashPartitioner),
            configure: Box::new(|b| b),
        }
    }

    /// Add a partition by its member nodes, in partition-id order.
    pub fn partition(mut self, nodes: Vec<RaftNode>) -> Self {
        self.partitions.push(nodes);
        self
    }

    pub fn partitioner(mut self, partitioner: Box<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    /// Apply session settings to every per-partition session.
    pub fn session_settings(
        mut self,
        configure: impl Fn(SessionBuilder) -> SessionBuilder + Send + 'static,
    ) -> Self {
        self.configure = Box::new(configure);
        self
    }

    /// Open one session per partition.
    pub async fn build(self) -> Result<PartitionedClient> {
        if self.partitions.is_empty() {
            return Err(RaftError::ConfigurationError(
                "at least one partition is required".into(),
            ));
        }

        let mut sessions = Vec::with_capacity(self.partitions.len());
        for (i, nodes) in self.partitions.into_iter().enumerate() {
            let builder = SessionBuilder::new(format!("{}-p{i}", self.client_id)).nodes(nodes);
            let session = (self.configure)(builder).build().await?;
            sessions.push(session);
        }

        Ok(PartitionedClient {
            sessions,
            partitioner: self.partitioner,
        })
    }
}

/// A client spanning every partition of a logplane deployment.
pub struct PartitionedClient {
    sessions: Vec<ClientSession>,
    partitioner: Box<dyn Partitioner>,
}

impl PartitionedClient {
    pub fn partition_count(&self) -> usize {
        self.sessions.len()
    }

    /// The partition a key routes to.
    pub fn partition_of(&self, key: &[u8]) -> usize {
        self.partitioner.partition(key, self.sessions.len())
    }

    /// Session for direct access to one partition.
    pub fn session(&self, partition: usize) -> Option<&ClientSession> {
        self.sessions.get(partition)
    }

    /// Submit a command on the partition owning `key`.
    pub async fn command(&self, key: &[u8], op: Vec<u8>) -> Result<Vec<u8>> {
        self.sessions[self.partition_of(key)].command(op).await
    }

    /// Run a query on the partition owning `key`.
    pub async fn query(&self, key: &[u8], op: Vec<u8>) -> Result<Vec<u8>> {
        self.sessions[self.partition_of(key)].query(op).await
    }

    /// Run the same query on every partition, in partition order.
    pub async fn broadcast_query(&self, op: Vec<u8>) -> Vec<Result<Vec<u8>>> {
        let mut results = Vec::with_capacity(self.sessions.len());
        for session in &self.sessions {
            results.push(session.query(op.clone()).await);
        }
        results
    }

    /// Close every partition session.
    pub async fn close(&self) -> Result<()> {
        for session in &self.sessions {
            session.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_partitioner_is_stable_and_bounded() {
        let partitioner = HashPartitioner;
        for key in [b"alpha".as_slice(), b"beta", b"", b"a-much-longer-key"] {
            let first = partitioner.partition(key, 7);
            assert!(first < 7);
            assert_eq!(first, partitioner.partition(key, 7));
        }
    }

    #[test]
    fn test_hash_partitioner_single_partition() {
        assert_eq!(HashPartitioner.partition(b"anything", 1), 0);
    }

    #[test]
    fn test_hash_partitioner_spreads_keys() {
        let partitioner = HashPartitioner;
        let mut seen = std::collections::HashSet::new();
        for i in 0..64u32 {
            seen.insert(partitioner.partition(&i.to_le_bytes(), 8));
        }
        // 64 hashed keys over 8 partitions should touch most of them.
        assert!(seen.len() >= 4);
    }
}
