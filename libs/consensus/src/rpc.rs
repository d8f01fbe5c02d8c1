//! Wire boundary of the consensus core
//!
//! Message shapes are implementation-agnostic: a network layer maps them
//! onto whatever transport it likes. The crate ships an in-process
//! [`LocalTransport`] used by demos and the cluster test harness, with
//! link-level partition controls for failure-injection tests.

use crate::types::{Entry, LogIndex, NodeId, Term};
use crate::{RaftError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sent by candidates to gather votes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicates log entries and doubles as the heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Empty for a pure heartbeat.
    pub entries: Vec<Entry>,
    pub leader_commit: LogIndex,
    /// Read-barrier round, echoed back by the follower.
    pub round: u64,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success, the highest index now present on the follower.
    pub match_index: LogIndex,
    /// On rejection, a hint at where the follower's log ends so the
    /// leader can skip ahead in its backtracking.
    pub conflict_index: Option<LogIndex>,
    /// Echo of the request's read-barrier round.
    pub round: u64,
}

/// Chunked snapshot transfer used to fast-forward a follower whose
/// next index precedes the leader's compaction boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// Byte offset of this chunk within the snapshot.
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// Outbound RPC surface a node uses to reach its peers.
///
/// Sends must not block the caller's serialized context; the node issues
/// them from spawned tasks and feeds completions back as events.
#[async_trait]
pub trait RaftProtocol: Send + Sync + 'static {
    async fn request_vote(
        &self,
        to: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        to: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// In-process message fabric connecting the nodes of one partition.
///
/// Stands in for the real network layer. Links can be cut and healed at
/// runtime, which the scenario tests use to simulate partitions.
pub struct LocalTransport {
    nodes: DashMap<NodeId, crate::node::RaftNode>,
    blocked: DashMap<(NodeId, NodeId), ()>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            blocked: DashMap::new(),
        })
    }

    pub fn register(&self, node: crate::node::RaftNode) {
        self.nodes.insert(node.id(), node);
    }

    /// Cut the link between two nodes in both directions.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        self.blocked.insert((a, b), ());
        self.blocked.insert((b, a), ());
    }

    /// Restore the link between two nodes.
    pub fn heal(&self, a: NodeId, b: NodeId) {
        self.blocked.remove(&(a, b));
        self.blocked.remove(&(b, a));
    }

    /// Cut all links to and from a node.
    pub fn isolate(&self, id: NodeId) {
        for entry in self.nodes.iter() {
            let other = *entry.key();
            if other != id {
                self.partition(id, other);
            }
        }
    }

    /// Restore all links to and from a node.
    pub fn reconnect(&self, id: NodeId) {
        for entry in self.nodes.iter() {
            let other = *entry.key();
            if other != id {
                self.heal(id, other);
            }
        }
    }

    /// A per-node protocol handle that tags outbound traffic with the
    /// sender so link cuts apply.
    pub fn handle_for(self: &Arc<Self>, from: NodeId) -> Arc<dyn RaftProtocol> {
        Arc::new(LocalPeer {
            transport: Arc::clone(self),
            from,
        })
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<crate::node::RaftNode> {
        if self.blocked.contains_key(&(from, to)) {
            return Err(RaftError::Unavailable(format!(
                "link {from} -> {to} is down"
            )));
        }
        self.nodes
            .get(&to)
            .map(|n| n.clone())
            .ok_or_else(|| RaftError::Unavailable(format!("{to} not registered")))
    }
}

struct LocalPeer {
    transport: Arc<LocalTransport>,
    from: NodeId,
}

#[async_trait]
impl RaftProtocol for LocalPeer {
    async fn request_vote(
        &self,
        to: NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let node = self.transport.route(self.from, to)?;
        node.handle_request_vote(request).await
    }

    async fn append_entries(
        &self,
        to: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let node = self.transport.route(self.from, to)?;
        node.handle_append_entries(request).await
    }

    async fn install_snapshot(
        &self,
        to: NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let node = self.transport.route(self.from, to)?;
        node.handle_install_snapshot(request).await
    }
}
