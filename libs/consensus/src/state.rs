//! Node state and role management
//!
//! Exactly one role is active per node at a time. Role transitions are
//! the defining behavior of the core: every transition resets the
//! election timer with a fresh randomized duration, and leader/candidate
//! bookkeeping is dropped the moment the node leaves that role so stale
//! responses can never mutate it.

use crate::cluster::ClusterView;
use crate::types::{LogIndex, NodeId, Term};
use crate::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

/// The role a node plays in its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Not participating in the log; the only quiescent state.
    Inactive,
    /// Receives the log but never votes.
    Passive,
    /// Joining member catching up before becoming a follower.
    Promotable,
    /// Accepts entries from the leader, votes in elections.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Accepts client commands and replicates the log.
    Leader,
}

impl Role {
    /// Roles that run an election timer and may start elections.
    pub fn is_voting(&self) -> bool {
        matches!(self, Role::Follower | Role::Candidate | Role::Leader)
    }

    /// Roles that accept append-entries from a leader.
    pub fn accepts_appends(&self) -> bool {
        !matches!(self, Role::Inactive)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// State that must survive crashes.
///
/// Persisted through a [`MetaStore`] before any message referencing it
/// is sent; sending first would allow double voting after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this node has seen; increases monotonically.
    pub current_term: Term,

    /// Candidate voted for in the current term, if any.
    pub voted_for: Option<NodeId>,
}

/// Durable store for the (term, voted-for) tuple.
pub trait MetaStore: Send + Sync {
    fn save(&self, state: &PersistentState) -> Result<()>;
    fn load(&self) -> Result<PersistentState>;
}

/// In-memory meta store for tests and in-process clusters.
#[derive(Default)]
pub struct MemoryMetaStore {
    state: Mutex<PersistentState>,
}

impl MetaStore for MemoryMetaStore {
    fn save(&self, state: &PersistentState) -> Result<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }

    fn load(&self) -> Result<PersistentState> {
        Ok(self.state.lock().clone())
    }
}

/// Volatile per-node watermarks. Both only ever move forward.
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Highest index known committed; `advance_commit` keeps it monotonic.
    pub commit_index: LogIndex,

    /// Highest index applied to the state machine; never exceeds
    /// `commit_index`.
    pub last_applied: LogIndex,
}

impl VolatileState {
    /// Advance the commit index, ignoring regressions from stale inputs.
    pub fn advance_commit(&mut self, index: LogIndex) -> bool {
        if index > self.commit_index {
            self.commit_index = index;
            true
        } else {
            false
        }
    }
}

/// Leader-side replication progress for one follower.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Next entry index to send.
    pub next_index: LogIndex,

    /// Highest index known replicated on the follower.
    pub match_index: LogIndex,

    /// Append requests currently in flight (pipelining bound).
    pub in_flight: usize,

    /// When the follower last answered any request.
    pub last_contact: Option<Instant>,

    /// Highest heartbeat round the follower has acknowledged; drives
    /// linearizable read barriers.
    pub acked_round: u64,

    /// Offset of the next snapshot chunk to send, when a snapshot
    /// transfer is in progress.
    pub snapshot_offset: Option<u64>,
}

impl Progress {
    pub fn new(next_index: LogIndex) -> Self {
        Self {
            next_index,
            match_index: LogIndex::ZERO,
            in_flight: 0,
            last_contact: None,
            acked_round: 0,
            snapshot_offset: None,
        }
    }
}

/// Volatile leader state, rebuilt from scratch on every election win.
#[derive(Debug)]
pub struct LeaderState {
    pub progress: HashMap<NodeId, Progress>,

    /// Heartbeat round counter for read barriers. Incremented when a
    /// linearizable query registers; followers echo the round they last
    /// saw.
    pub round: u64,

    /// When leadership was assumed. Stands in for quorum contact until
    /// the first full quorum of replies arrives.
    pub since: Instant,
}

impl LeaderState {
    pub fn new(remotes: &[NodeId], last_log_index: LogIndex) -> Self {
        Self {
            progress: remotes
                .iter()
                .map(|&id| (id, Progress::new(last_log_index + 1)))
                .collect(),
            round: 0,
            since: Instant::now(),
        }
    }

    pub fn progress_mut(&mut self, id: NodeId) -> Option<&mut Progress> {
        self.progress.get_mut(&id)
    }

    /// Highest index N replicated on a quorum of voters, counting the
    /// leader itself at its own last log index. The caller must still
    /// check that the entry at N belongs to the current term before
    /// committing it.
    pub fn quorum_match_index(&self, view: &ClusterView, leader_last: LogIndex) -> LogIndex {
        let mut matches: Vec<LogIndex> = view
            .voter_ids()
            .into_iter()
            .map(|id| {
                if id == view.local_id() {
                    leader_last
                } else {
                    self.progress
                        .get(&id)
                        .map(|p| p.match_index)
                        .unwrap_or(LogIndex::ZERO)
                }
            })
            .collect();

        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = view.quorum_size();
        matches.get(quorum - 1).copied().unwrap_or(LogIndex::ZERO)
    }

    /// Highest round acknowledged by a quorum of voters (the leader
    /// implicitly acknowledges every round it issues).
    pub fn quorum_acked_round(&self, view: &ClusterView) -> u64 {
        let mut rounds: Vec<u64> = view
            .voter_ids()
            .into_iter()
            .map(|id| {
                if id == view.local_id() {
                    self.round
                } else {
                    self.progress.get(&id).map(|p| p.acked_round).unwrap_or(0)
                }
            })
            .collect();

        rounds.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = view.quorum_size();
        rounds.get(quorum - 1).copied().unwrap_or(0)
    }

    /// The instant at which a quorum of voters had most recently been
    /// heard from; `None` before a full quorum has answered. Drives the
    /// leader-lease freshness check.
    pub fn quorum_contact(&self, view: &ClusterView, now: Instant) -> Option<Instant> {
        let mut contacts: Vec<Option<Instant>> = view
            .voter_ids()
            .into_iter()
            .map(|id| {
                if id == view.local_id() {
                    Some(now)
                } else {
                    self.progress.get(&id).and_then(|p| p.last_contact)
                }
            })
            .collect();

        contacts.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = view.quorum_size();
        contacts.get(quorum - 1).copied().flatten()
    }
}

/// Vote bookkeeping while campaigning.
#[derive(Debug, Clone)]
pub struct CandidateState {
    pub votes: HashSet<NodeId>,
}

impl CandidateState {
    pub fn new(self_id: NodeId) -> Self {
        let mut votes = HashSet::new();
        votes.insert(self_id);
        Self { votes }
    }

    pub fn record_vote(&mut self, from: NodeId) {
        self.votes.insert(from);
    }

    pub fn has_majority(&self, view: &ClusterView) -> bool {
        let granted = self
            .votes
            .iter()
            .filter(|id| view.is_voter(**id))
            .count();
        granted >= view.quorum_size()
    }
}

/// Complete mutable state of a node, owned by its serialized context.
#[derive(Debug)]
pub struct NodeState {
    pub id: NodeId,
    pub role: Role,
    pub leader_id: Option<NodeId>,
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    pub leader: Option<LeaderState>,
    pub candidate: Option<CandidateState>,
}

impl NodeState {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Inactive,
            leader_id: None,
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            leader: None,
            candidate: None,
        }
    }

    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        debug_assert!(term >= self.persistent.current_term);
        self.role = Role::Follower;
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
        }
        self.leader_id = leader;
        self.leader = None;
        self.candidate = None;
    }

    pub fn become_candidate(&mut self) {
        self.role = Role::Candidate;
        self.persistent.current_term.increment();
        self.persistent.voted_for = Some(self.id);
        self.leader_id = None;
        self.candidate = Some(CandidateState::new(self.id));
        self.leader = None;
    }

    pub fn become_leader(&mut self, remotes: &[NodeId], last_log_index: LogIndex) {
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.leader = Some(LeaderState::new(remotes, last_log_index));
        self.candidate = None;
    }

    pub fn become_passive(&mut self) {
        self.role = Role::Passive;
        self.leader = None;
        self.candidate = None;
    }

    pub fn become_promotable(&mut self) {
        self.role = Role::Promotable;
        self.leader = None;
        self.candidate = None;
    }

    pub fn become_inactive(&mut self) {
        self.role = Role::Inactive;
        self.leader_id = None;
        self.leader = None;
        self.candidate = None;
    }

    /// Adopt a higher term observed in any message and fall back to
    /// follower. Returns true if the term advanced.
    pub fn observe_term(&mut self, term: Term, leader: Option<NodeId>) -> bool {
        if term > self.persistent.current_term {
            let next_role = match self.role {
                Role::Inactive => Role::Inactive,
                Role::Passive => Role::Passive,
                Role::Promotable => Role::Promotable,
                _ => Role::Follower,
            };
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
            self.leader_id = leader;
            self.leader = None;
            self.candidate = None;
            self.role = next_role;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::RaftMember;

    fn view() -> ClusterView {
        ClusterView::new(
            NodeId(1),
            vec![
                RaftMember::active(NodeId(1)),
                RaftMember::active(NodeId(2)),
                RaftMember::active(NodeId(3)),
            ],
        )
    }

    #[test]
    fn test_role_transitions() {
        let mut state = NodeState::new(NodeId(1));
        assert_eq!(state.role, Role::Inactive);

        state.become_follower(Term(0), None);
        assert_eq!(state.role, Role::Follower);

        state.become_candidate();
        assert_eq!(state.role, Role::Candidate);
        assert_eq!(state.persistent.current_term, Term(1));
        assert_eq!(state.persistent.voted_for, Some(NodeId(1)));

        state.become_leader(&[NodeId(2), NodeId(3)], LogIndex(10));
        assert_eq!(state.role, Role::Leader);
        assert!(state.leader.is_some());
        assert!(state.candidate.is_none());

        state.become_follower(Term(2), Some(NodeId(2)));
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.persistent.current_term, Term(2));
        assert_eq!(state.leader_id, Some(NodeId(2)));
        assert!(state.leader.is_none());

        state.become_inactive();
        assert_eq!(state.role, Role::Inactive);
    }

    #[test]
    fn test_observe_higher_term_steps_down() {
        let mut state = NodeState::new(NodeId(1));
        state.become_follower(Term(0), None);
        state.become_candidate();
        state.become_leader(&[NodeId(2), NodeId(3)], LogIndex(5));

        assert!(state.observe_term(Term(5), Some(NodeId(3))));
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.persistent.current_term, Term(5));
        assert_eq!(state.persistent.voted_for, None);
        assert!(state.leader.is_none());

        // Same or lower terms change nothing.
        assert!(!state.observe_term(Term(5), None));
        assert!(!state.observe_term(Term(3), None));
    }

    #[test]
    fn test_passive_stays_passive_on_higher_term() {
        let mut state = NodeState::new(NodeId(4));
        state.become_passive();

        state.observe_term(Term(3), Some(NodeId(1)));
        assert_eq!(state.role, Role::Passive);
    }

    #[test]
    fn test_commit_index_monotonic() {
        let mut volatile = VolatileState::default();
        assert!(volatile.advance_commit(LogIndex(5)));
        assert!(!volatile.advance_commit(LogIndex(3)));
        assert_eq!(volatile.commit_index, LogIndex(5));
    }

    #[test]
    fn test_candidate_majority() {
        let view = view();
        let mut candidate = CandidateState::new(NodeId(1));
        assert!(!candidate.has_majority(&view));

        candidate.record_vote(NodeId(2));
        assert!(candidate.has_majority(&view));

        // Votes from non-voters never count.
        let mut lone = CandidateState::new(NodeId(1));
        lone.record_vote(NodeId(9));
        assert!(!lone.has_majority(&view));
    }

    #[test]
    fn test_quorum_match_index() {
        let view = view();
        let mut leader = LeaderState::new(&[NodeId(2), NodeId(3)], LogIndex(10));

        // Nothing replicated yet: only the leader holds index 10.
        assert_eq!(leader.quorum_match_index(&view, LogIndex(10)), LogIndex::ZERO);

        leader.progress_mut(NodeId(2)).unwrap().match_index = LogIndex(7);
        assert_eq!(leader.quorum_match_index(&view, LogIndex(10)), LogIndex(7));

        leader.progress_mut(NodeId(3)).unwrap().match_index = LogIndex(9);
        assert_eq!(leader.quorum_match_index(&view, LogIndex(10)), LogIndex(9));
    }

    #[test]
    fn test_quorum_acked_round() {
        let view = view();
        let mut leader = LeaderState::new(&[NodeId(2), NodeId(3)], LogIndex(0));
        leader.round = 4;

        assert_eq!(leader.quorum_acked_round(&view), 0);

        leader.progress_mut(NodeId(2)).unwrap().acked_round = 3;
        assert_eq!(leader.quorum_acked_round(&view), 3);

        leader.progress_mut(NodeId(3)).unwrap().acked_round = 4;
        assert_eq!(leader.quorum_acked_round(&view), 4);
    }

    #[test]
    fn test_meta_store_round_trip() {
        let store = MemoryMetaStore::default();
        let state = PersistentState {
            current_term: Term(7),
            voted_for: Some(NodeId(2)),
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }
}
