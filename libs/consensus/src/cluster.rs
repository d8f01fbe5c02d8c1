//! Cluster membership
//!
//! Membership is part of the replicated state: configuration entries are
//! stored in the log and the current view is derived by replaying them up
//! to the commit index. Only `Active` members vote and count toward
//! quorum; `Passive` members receive appends without participating in
//! elections, and `Promotable` members are passive until they catch up.

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a member participates in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberType {
    /// Full voting participant.
    Active,
    /// Receives the log but never votes or counts toward quorum.
    Passive,
    /// Joining member, treated as passive until its log catches up.
    Promotable,
}

/// Liveness as observed by the leader's replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Available,
    Unavailable,
}

/// A single member of the replication group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RaftMember {
    pub id: NodeId,
    pub member_type: MemberType,
    pub status: MemberStatus,
}

impl RaftMember {
    pub fn active(id: NodeId) -> Self {
        Self {
            id,
            member_type: MemberType::Active,
            status: MemberStatus::Available,
        }
    }

    pub fn passive(id: NodeId) -> Self {
        Self {
            id,
            member_type: MemberType::Passive,
            status: MemberStatus::Available,
        }
    }

    pub fn promotable(id: NodeId) -> Self {
        Self {
            id,
            member_type: MemberType::Promotable,
            status: MemberStatus::Available,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.member_type == MemberType::Active
    }
}

impl fmt::Display for RaftMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:?}/{:?}]", self.id, self.member_type, self.status)
    }
}

/// The local node's view of the cluster, rebuilt from configuration
/// entries as they commit.
#[derive(Debug, Clone)]
pub struct ClusterView {
    local: NodeId,
    members: Vec<RaftMember>,
}

impl ClusterView {
    pub fn new(local: NodeId, members: Vec<RaftMember>) -> Self {
        Self { local, members }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn members(&self) -> &[RaftMember] {
        &self.members
    }

    pub fn member(&self, id: NodeId) -> Option<&RaftMember> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn local_member(&self) -> Option<&RaftMember> {
        self.member(self.local)
    }

    /// Replace the configuration; called when a configuration entry is
    /// appended (and re-derived on truncation by replaying the log).
    pub fn apply_configuration(&mut self, members: Vec<RaftMember>) {
        self.members = members;
    }

    pub fn set_status(&mut self, id: NodeId, status: MemberStatus) {
        if let Some(m) = self.members.iter_mut().find(|m| m.id == id) {
            m.status = status;
        }
    }

    /// All members except the local node, voting or not. These are the
    /// replication targets for a leader.
    pub fn remote_ids(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| m.id != self.local)
            .map(|m| m.id)
            .collect()
    }

    /// Ids of members allowed to vote.
    pub fn voter_ids(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| m.is_voter())
            .map(|m| m.id)
            .collect()
    }

    pub fn is_voter(&self, id: NodeId) -> bool {
        self.member(id).map(|m| m.is_voter()).unwrap_or(false)
    }

    /// Strict majority of active members.
    pub fn quorum_size(&self) -> usize {
        let voters = self.members.iter().filter(|m| m.is_voter()).count();
        voters / 2 + 1
    }
}
