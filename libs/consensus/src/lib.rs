//! # logplane-consensus
//!
//! A Raft consensus core for partitioned replicated logs.
//!
//! Each partition runs an independent consensus instance: a replicated
//! log, a role state machine (inactive, passive, promotable, follower,
//! candidate, leader), and the election and replication engines that
//! drive it. Committed entries feed a pluggable [`StateMachine`], and a
//! session layer on top of the log gives clients exactly-once command
//! semantics and three read-consistency levels.
//!
//! ## Design
//!
//! All state for one partition is owned by a single serialized context
//! (an event-loop task). RPC handling, timers, and client operations are
//! funneled through it as events, so consensus state never needs a lock.
//! Outbound RPCs run on spawned tasks; their completions come back as
//! events tagged with the term they were issued in and are dropped when
//! stale.
//!
//! ## Example
//!
//! ```no_run
//! use logplane_consensus::{
//!     LocalTransport, NodeId, RaftMember, RaftNode, StateMachine,
//! };
//!
//! struct Counter(u64);
//!
//! impl StateMachine for Counter {
//!     fn apply(&mut self, _op: &[u8]) -> Result<Vec<u8>, String> {
//!         self.0 += 1;
//!         Ok(self.0.to_le_bytes().to_vec())
//!     }
//!     fn query(&self, _op: &[u8]) -> Result<Vec<u8>, String> {
//!         Ok(self.0.to_le_bytes().to_vec())
//!     }
//!     fn snapshot(&self) -> Vec<u8> {
//!         self.0.to_le_bytes().to_vec()
//!     }
//!     fn restore(&mut self, data: &[u8]) {
//!         let mut buf = [0u8; 8];
//!         buf.copy_from_slice(data);
//!         self.0 = u64::from_le_bytes(buf);
//!     }
//! }
//!
//! # async fn run() -> logplane_consensus::Result<()> {
//! let transport = LocalTransport::new();
//! let node = RaftNode::builder(NodeId(1))
//!     .members(vec![RaftMember::active(NodeId(1))])
//!     .protocol(transport.handle_for(NodeId(1)))
//!     .build(Counter(0))?;
//! transport.register(node.clone());
//! node.bootstrap().await?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod election;
pub mod error;
pub mod log;
pub mod node;
pub mod replication;
pub mod rpc;
pub mod sessions;
pub mod state;
pub mod types;

pub use cluster::{ClusterView, MemberStatus, MemberType, RaftMember};
pub use config::{RaftConfig, RaftConfigBuilder};
pub use error::{ErrorCode, RaftError};
pub use log::{LogStorage, MemoryLog, RaftLog};
pub use node::{
    NodeStatus, OperationOutput, RaftNode, RaftNodeBuilder, SnapshotReplicationListener,
    StateMachine,
};
pub use rpc::{LocalTransport, RaftProtocol};
pub use state::{MemoryMetaStore, MetaStore, PersistentState, Role};
pub use types::{
    Entry, EntryPayload, LogIndex, NodeId, ReadConsistency, SessionId, Snapshot, SnapshotMetadata,
    Term,
};

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RaftError>;
