//! Core types used throughout the consensus crate

use crate::cluster::RaftMember;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Election term number
///
/// Terms are strictly increasing and never reused. A term is persisted
/// before any message referencing it leaves the node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Hash,
)]
pub struct Term(pub u64);

impl Term {
    pub fn increment(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Term({})", self.0)
    }
}

/// Index into the replicated log
///
/// Indexes are contiguous starting at 1, or at the snapshot boundary + 1
/// after compaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Hash,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn increment(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogIndex({})", self.0)
    }
}

impl std::ops::Add<u64> for LogIndex {
    type Output = LogIndex;

    fn add(self, rhs: u64) -> Self::Output {
        LogIndex(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for LogIndex {
    type Output = LogIndex;

    fn sub(self, rhs: u64) -> Self::Output {
        LogIndex(self.0.saturating_sub(rhs))
    }
}

/// Identifier of a client session, assigned from the log index of the
/// entry that opened it.
pub type SessionId = u64;

/// Payload carried by a log entry.
///
/// Cluster membership and client sessions are replicated through the log
/// like any other command, so the current cluster view and session table
/// can be rebuilt by replaying entries up to the commit index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Entry appended by a fresh leader to commit entries from prior terms.
    Noop,

    /// A client command, deduplicated by (session, sequence).
    Command {
        session: SessionId,
        sequence: u64,
        op: Vec<u8>,
    },

    /// Opens a client session; the session id is the entry's log index.
    OpenSession { client_id: String, timeout_ms: u64 },

    /// Refreshes a session's expiry deadline.
    KeepAlive { session: SessionId },

    /// Closes a session explicitly or after timeout expiry.
    CloseSession { session: SessionId },

    /// Replaces the cluster membership configuration.
    Configuration { members: Vec<RaftMember> },
}

/// A single entry in the replicated log
///
/// An entry's (index, term) pair identifies it uniquely cluster-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The term under which this entry was created
    pub term: Term,

    /// The log index of this entry
    pub index: LogIndex,

    /// What to apply when the entry commits
    pub payload: EntryPayload,
}

impl Entry {
    pub fn new(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    /// Approximate wire size, used to bound append-entries batches.
    pub fn approx_size(&self) -> usize {
        const HEADER: usize = 24;
        HEADER
            + match &self.payload {
                EntryPayload::Noop => 0,
                EntryPayload::Command { op, .. } => op.len() + 16,
                EntryPayload::OpenSession { client_id, .. } => client_id.len() + 8,
                EntryPayload::KeepAlive { .. } | EntryPayload::CloseSession { .. } => 8,
                EntryPayload::Configuration { members } => members.len() * 16,
            }
    }
}

/// Consistency level applied to queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    /// Served by any node once its applied index has caught up to the
    /// client's last observed index (monotonic reads).
    Sequential,

    /// Served locally by the leader while its lease holds; downgrades to
    /// `Linearizable` when majority contact is stale.
    LinearizableLease,

    /// Leader confirms leadership with a fresh quorum round before
    /// answering, so the read reflects all prior commits.
    Linearizable,
}

/// Snapshot metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Index of the last entry covered by the snapshot
    pub last_included_index: LogIndex,

    /// Term of the last entry covered by the snapshot
    pub last_included_term: Term,

    /// Cluster configuration at the time of the snapshot
    pub members: Vec<RaftMember>,
}

/// A complete snapshot of the state machine and session table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}
