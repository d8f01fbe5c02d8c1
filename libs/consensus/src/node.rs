//! The partition node and its serialized execution context
//!
//! All state transitions, log appends, and vote/append handling for one
//! partition run on a single event loop task; concurrent access is
//! structurally excluded, so no internal locking is needed. Network I/O
//! never blocks the loop: RPCs are issued from spawned tasks whose
//! completions are posted back as events tagged with the term they were
//! issued in, and completions carrying a stale term are discarded.

use crate::cluster::{ClusterView, MemberType, RaftMember};
use crate::config::RaftConfig;
use crate::log::RaftLog;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftProtocol, RequestVoteRequest, RequestVoteResponse,
};
use crate::sessions::{CommandDisposition, SessionManager};
use crate::state::{MemoryMetaStore, MetaStore, NodeState, Role};
use crate::types::{
    Entry, EntryPayload, LogIndex, NodeId, ReadConsistency, SessionId, Snapshot, SnapshotMetadata,
    Term,
};
use crate::{RaftError, Result};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval at which the election deadline is checked.
const TICK: Duration = Duration::from_millis(10);

/// Replicated application logic plugged into a partition.
///
/// `apply` is invoked in log order for committed commands on every node;
/// it must be deterministic. An `Err` is propagated to the proposer as an
/// application error without affecting the log.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, op: &[u8]) -> std::result::Result<Vec<u8>, String>;

    fn query(&self, op: &[u8]) -> std::result::Result<Vec<u8>, String>;

    fn snapshot(&self) -> Vec<u8>;

    fn restore(&mut self, data: &[u8]);

    /// Highest log index the application has fully consumed. Compaction
    /// never removes entries above it, so an application that reads the
    /// log out of band (an exporter, say) can hold entries back until it
    /// has processed them. The default places no bound of its own.
    fn compactable_index(&self) -> LogIndex {
        LogIndex(u64::MAX)
    }
}

/// Observer of destructive snapshot-based catch-up on a follower.
///
/// The follower's log is reset rather than incrementally reconciled in
/// exactly one scenario: a snapshot transfer because its log fell behind
/// the leader's compaction boundary. Downstream consumers of the log
/// register here so they can reset consistently; `on_started` always
/// precedes `on_completed`.
pub trait SnapshotReplicationListener: Send + Sync {
    fn on_snapshot_replication_started(&self);
    fn on_snapshot_replication_completed(&self, term: Term);
}

/// Result of a command or query, with the log position it reflects.
#[derive(Debug, Clone)]
pub struct OperationOutput {
    /// For commands, the entry's index; for queries, the applied index
    /// the answer reflects. Clients track this for monotonic reads.
    pub index: LogIndex,
    pub data: Vec<u8>,
}

/// Point-in-time observable state of a node.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

/// Events processed by the partition's serialized context.
pub(crate) enum RaftEvent {
    Bootstrap {
        tx: oneshot::Sender<Result<()>>,
    },
    Command {
        payload: EntryPayload,
        tx: oneshot::Sender<Result<OperationOutput>>,
    },
    Query {
        consistency: ReadConsistency,
        op: Vec<u8>,
        min_index: LogIndex,
        tx: oneshot::Sender<Result<OperationOutput>>,
    },
    RequestVote {
        request: RequestVoteRequest,
        tx: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        tx: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        tx: oneshot::Sender<InstallSnapshotResponse>,
    },
    VoteReply {
        from: NodeId,
        sent_term: Term,
        reply: Result<RequestVoteResponse>,
    },
    AppendReply {
        from: NodeId,
        sent_term: Term,
        reply: Result<AppendEntriesResponse>,
    },
    SnapshotReply {
        from: NodeId,
        sent_term: Term,
        last_included: LogIndex,
        next_offset: u64,
        done: bool,
        reply: Result<InstallSnapshotResponse>,
    },
    Promote,
    StepDown,
    GoInactive,
    Status {
        tx: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Handle to a running partition node. Cheap to clone; all operations
/// are forwarded to the node's serialized context.
#[derive(Clone)]
pub struct RaftNode {
    id: NodeId,
    events: mpsc::UnboundedSender<RaftEvent>,
    role_rx: watch::Receiver<(Role, Term)>,
    cancel: CancellationToken,
}

impl fmt::Debug for RaftNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl RaftNode {
    pub fn builder(id: NodeId) -> RaftNodeBuilder {
        RaftNodeBuilder::new(id)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Observe role changes as `(Role, Term)` pairs.
    pub fn role_watch(&self) -> watch::Receiver<(Role, Term)> {
        self.role_rx.clone()
    }

    /// Join the replication group and start participating. Active
    /// members become followers; passive and promotable members enter
    /// their transitional roles.
    pub async fn bootstrap(&self) -> Result<()> {
        self.request(|tx| RaftEvent::Bootstrap { tx }).await?
    }

    /// Open a client session. Returns the session id.
    pub async fn open_session(&self, client_id: &str, timeout: Duration) -> Result<SessionId> {
        let output = self
            .request(|tx| RaftEvent::Command {
                payload: EntryPayload::OpenSession {
                    client_id: client_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                },
                tx,
            })
            .await??;
        Ok(output.index.0)
    }

    pub async fn keep_alive(&self, session: SessionId) -> Result<()> {
        self.request(|tx| RaftEvent::Command {
            payload: EntryPayload::KeepAlive { session },
            tx,
        })
        .await??;
        Ok(())
    }

    pub async fn close_session(&self, session: SessionId) -> Result<()> {
        self.request(|tx| RaftEvent::Command {
            payload: EntryPayload::CloseSession { session },
            tx,
        })
        .await??;
        Ok(())
    }

    /// Submit a sequenced command. Retrying with the same sequence number
    /// is safe: the state machine deduplicates on (session, sequence).
    pub async fn command(
        &self,
        session: SessionId,
        sequence: u64,
        op: Vec<u8>,
    ) -> Result<OperationOutput> {
        self.request(|tx| RaftEvent::Command {
            payload: EntryPayload::Command {
                session,
                sequence,
                op,
            },
            tx,
        })
        .await?
    }

    /// Submit a query at the given consistency level. `min_index` is the
    /// client's last observed index, used for sequential reads.
    pub async fn query(
        &self,
        consistency: ReadConsistency,
        op: Vec<u8>,
        min_index: LogIndex,
    ) -> Result<OperationOutput> {
        self.request(|tx| RaftEvent::Query {
            consistency,
            op,
            min_index,
            tx,
        })
        .await?
    }

    /// Replace the cluster membership configuration.
    pub async fn configure(&self, members: Vec<RaftMember>) -> Result<OperationOutput> {
        self.request(|tx| RaftEvent::Command {
            payload: EntryPayload::Configuration { members },
            tx,
        })
        .await?
    }

    /// Force an immediate candidacy attempt.
    pub fn promote(&self) {
        let _ = self.events.send(RaftEvent::Promote);
    }

    /// Ask a leader to relinquish leadership.
    pub fn step_down(&self) {
        let _ = self.events.send(RaftEvent::StepDown);
    }

    /// Leave the replication group without shutting the node down.
    pub fn go_inactive(&self) {
        let _ = self.events.send(RaftEvent::GoInactive);
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.request(|tx| RaftEvent::Status { tx }).await
    }

    /// Stop the node. Pending operations fail with a shutdown error.
    pub fn shutdown(&self) {
        let _ = self.events.send(RaftEvent::Shutdown);
        self.cancel.cancel();
    }

    // RPC entry points, invoked by the transport layer.

    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.request(|tx| RaftEvent::RequestVote { request, tx })
            .await
    }

    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.request(|tx| RaftEvent::AppendEntries { request, tx })
            .await
    }

    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.request(|tx| RaftEvent::InstallSnapshot { request, tx })
            .await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RaftEvent,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(make(tx))
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }
}

/// Fluent builder for a partition node.
pub struct RaftNodeBuilder {
    id: NodeId,
    members: Vec<RaftMember>,
    config: RaftConfig,
    log: Option<RaftLog>,
    meta: Option<Arc<dyn MetaStore>>,
    protocol: Option<Arc<dyn RaftProtocol>>,
    snapshot_listeners: Vec<Arc<dyn SnapshotReplicationListener>>,
}

impl RaftNodeBuilder {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            members: vec![],
            config: RaftConfig::default(),
            log: None,
            meta: None,
            protocol: None,
            snapshot_listeners: vec![],
        }
    }

    /// Bootstrap membership. Must be identical on every bootstrapped
    /// node; mismatched sets risk split brain.
    pub fn members(mut self, members: Vec<RaftMember>) -> Self {
        self.members = members;
        self
    }

    pub fn config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    pub fn log(mut self, log: RaftLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn meta_store(mut self, meta: Arc<dyn MetaStore>) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn protocol(mut self, protocol: Arc<dyn RaftProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn snapshot_listener(mut self, listener: Arc<dyn SnapshotReplicationListener>) -> Self {
        self.snapshot_listeners.push(listener);
        self
    }

    /// Spawn the node's serialized context and return its handle.
    pub fn build<SM: StateMachine>(self, state_machine: SM) -> Result<RaftNode> {
        let protocol = self.protocol.ok_or_else(|| {
            RaftError::ConfigurationError("a protocol implementation is required".into())
        })?;
        if !self.members.iter().any(|m| m.id == self.id) {
            return Err(RaftError::ConfigurationError(format!(
                "local node {} missing from bootstrap members",
                self.id
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (role_tx, role_rx) = watch::channel((Role::Inactive, Term(0)));
        let cancel = CancellationToken::new();

        let meta = self.meta.unwrap_or_else(|| Arc::new(MemoryMetaStore::default()));
        let persistent = meta.load()?;

        let mut state = NodeState::new(self.id);
        state.persistent = persistent;

        let inner = RaftInner {
            state,
            view: ClusterView::new(self.id, self.members),
            log: self.log.unwrap_or_else(RaftLog::new_memory),
            config: self.config,
            state_machine,
            sessions: SessionManager::new(),
            meta,
            protocol,
            events: events_tx.clone(),
            election_deadline: Instant::now(),
            pending_commands: HashMap::new(),
            pending_sequential: Vec::new(),
            pending_reads: Vec::new(),
            snapshot_listeners: self.snapshot_listeners,
            install_buffer: None,
            role_tx,
        };

        tokio::spawn(run_node(inner, events_rx, cancel.clone()));

        Ok(RaftNode {
            id: self.id,
            events: events_tx,
            role_rx,
            cancel,
        })
    }
}

/// A sequential query waiting for the applied index to catch up.
struct PendingSequential {
    min_index: LogIndex,
    op: Vec<u8>,
    tx: oneshot::Sender<Result<OperationOutput>>,
}

/// A linearizable query waiting on a quorum read barrier.
struct PendingRead {
    round: u64,
    read_index: LogIndex,
    op: Vec<u8>,
    tx: oneshot::Sender<Result<OperationOutput>>,
}

/// Follower-side accumulation of an in-flight snapshot transfer.
struct InstallBuffer {
    last_included_index: LogIndex,
    last_included_term: Term,
    data: Vec<u8>,
}

/// The node's entire mutable state boundary; owned by the event loop.
pub(crate) struct RaftInner<SM> {
    pub(crate) state: NodeState,
    pub(crate) view: ClusterView,
    pub(crate) log: RaftLog,
    pub(crate) config: RaftConfig,
    pub(crate) state_machine: SM,
    pub(crate) sessions: SessionManager,
    pub(crate) meta: Arc<dyn MetaStore>,
    pub(crate) protocol: Arc<dyn RaftProtocol>,
    pub(crate) events: mpsc::UnboundedSender<RaftEvent>,
    pub(crate) election_deadline: Instant,
    pub(crate) pending_commands: HashMap<LogIndex, oneshot::Sender<Result<OperationOutput>>>,
    pending_sequential: Vec<PendingSequential>,
    pending_reads: Vec<PendingRead>,
    snapshot_listeners: Vec<Arc<dyn SnapshotReplicationListener>>,
    install_buffer: Option<InstallBuffer>,
    role_tx: watch::Sender<(Role, Term)>,
}

enum Flow {
    Continue,
    Stop,
}

async fn run_node<SM: StateMachine>(
    mut inner: RaftInner<SM>,
    mut events: mpsc::UnboundedReceiver<RaftEvent>,
    cancel: CancellationToken,
) {
    let mut tick = interval(TICK);
    let mut heartbeat = interval(inner.config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv() => {
                match event {
                    Some(event) => {
                        if let Flow::Stop = inner.handle_event(event) {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = tick.tick() => inner.on_tick(),

            _ = heartbeat.tick() => inner.on_heartbeat_tick(),
        }
    }

    info!("{} stopped", inner.state.id);
    inner.fail_pending(|| RaftError::ShuttingDown);
}

impl<SM: StateMachine> RaftInner<SM> {
    fn handle_event(&mut self, event: RaftEvent) -> Flow {
        match event {
            RaftEvent::Bootstrap { tx } => {
                let _ = tx.send(self.bootstrap());
            }
            RaftEvent::Command { payload, tx } => self.handle_command(payload, tx),
            RaftEvent::Query {
                consistency,
                op,
                min_index,
                tx,
            } => self.handle_query(consistency, op, min_index, tx),
            RaftEvent::RequestVote { request, tx } => {
                let reply = self.handle_request_vote(request);
                let _ = tx.send(reply);
            }
            RaftEvent::AppendEntries { request, tx } => {
                let reply = self.handle_append_entries(request);
                let _ = tx.send(reply);
            }
            RaftEvent::InstallSnapshot { request, tx } => {
                let reply = self.handle_install_snapshot(request);
                let _ = tx.send(reply);
            }
            RaftEvent::VoteReply {
                from,
                sent_term,
                reply,
            } => self.handle_vote_reply(from, sent_term, reply),
            RaftEvent::AppendReply {
                from,
                sent_term,
                reply,
            } => self.handle_append_reply(from, sent_term, reply),
            RaftEvent::SnapshotReply {
                from,
                sent_term,
                last_included,
                next_offset,
                done,
                reply,
            } => self.handle_snapshot_reply(from, sent_term, last_included, next_offset, done, reply),
            RaftEvent::Promote => self.handle_promote(),
            RaftEvent::StepDown => self.handle_step_down(),
            RaftEvent::GoInactive => {
                info!("{} going inactive", self.state.id);
                self.state.become_inactive();
                self.publish_role();
                self.fail_pending(|| RaftError::IllegalMemberState("node went inactive".into()));
            }
            RaftEvent::Status { tx } => {
                let _ = tx.send(self.status());
            }
            RaftEvent::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    fn bootstrap(&mut self) -> Result<()> {
        if self.state.role != Role::Inactive {
            return Err(RaftError::IllegalMemberState(format!(
                "cannot bootstrap from {}",
                self.state.role
            )));
        }

        let member_type = self
            .view
            .local_member()
            .map(|m| m.member_type)
            .ok_or_else(|| {
                RaftError::ConfigurationError("local node not in membership".into())
            })?;

        match member_type {
            MemberType::Active => {
                let term = self.state.persistent.current_term;
                self.state.become_follower(term, None);
            }
            MemberType::Passive => self.state.become_passive(),
            MemberType::Promotable => self.state.become_promotable(),
        }

        info!("{} bootstrapped as {}", self.state.id, self.state.role);
        self.reset_election_timer();
        self.publish_role();
        Ok(())
    }

    // ---- client commands -------------------------------------------------

    fn handle_command(
        &mut self,
        payload: EntryPayload,
        tx: oneshot::Sender<Result<OperationOutput>>,
    ) {
        if self.state.role != Role::Leader {
            let _ = tx.send(Err(RaftError::NoLeader {
                hint: self.state.leader_id,
            }));
            return;
        }

        // Reject commands on sessions that are already gone before
        // paying for an append.
        if let EntryPayload::Command { session, .. } | EntryPayload::KeepAlive { session } =
            &payload
        {
            if self.sessions.get(*session).is_none() {
                let _ = tx.send(Err(self.sessions.missing(*session)));
                return;
            }
        }

        match self.append_as_leader(payload) {
            Ok(index) => {
                self.pending_commands.insert(index, tx);
                self.replicate(false);
                self.maybe_commit();
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    }

    /// Append an entry under the current term. Leader only.
    pub(crate) fn append_as_leader(&mut self, payload: EntryPayload) -> Result<LogIndex> {
        let term = self.state.persistent.current_term;
        let index = self.log.last_index() + 1;
        self.log.append(vec![Entry::new(term, index, payload)])?;
        Ok(index)
    }

    // ---- queries ---------------------------------------------------------

    fn handle_query(
        &mut self,
        consistency: ReadConsistency,
        op: Vec<u8>,
        min_index: LogIndex,
        tx: oneshot::Sender<Result<OperationOutput>>,
    ) {
        match consistency {
            ReadConsistency::Sequential => {
                if self.state.volatile.last_applied >= min_index {
                    let _ = tx.send(self.run_query(&op));
                } else {
                    // Queue until this node catches up to the client's
                    // last observed index.
                    self.pending_sequential.push(PendingSequential {
                        min_index,
                        op,
                        tx,
                    });
                }
            }
            ReadConsistency::LinearizableLease | ReadConsistency::Linearizable => {
                if self.state.role != Role::Leader {
                    let _ = tx.send(Err(RaftError::NoLeader {
                        hint: self.state.leader_id,
                    }));
                    return;
                }

                if consistency == ReadConsistency::LinearizableLease && self.lease_valid() {
                    let _ = tx.send(self.run_query(&op));
                    return;
                }

                // Full linearizable path: a fresh quorum round must
                // confirm leadership before the query is answered.
                let read_index = self.state.volatile.commit_index;
                let round = match self.state.leader.as_mut() {
                    Some(leader) => {
                        leader.round += 1;
                        leader.round
                    }
                    None => {
                        let _ = tx.send(Err(RaftError::NoLeader {
                            hint: self.state.leader_id,
                        }));
                        return;
                    }
                };
                self.pending_reads.push(PendingRead {
                    round,
                    read_index,
                    op,
                    tx,
                });
                self.replicate(true);
                self.try_complete_reads();
            }
        }
    }

    fn run_query(&self, op: &[u8]) -> Result<OperationOutput> {
        match self.state_machine.query(op) {
            Ok(data) => Ok(OperationOutput {
                index: self.state.volatile.last_applied,
                data,
            }),
            Err(msg) => Err(RaftError::ApplicationError(msg)),
        }
    }

    /// Lease freshness: a quorum answered within the election timeout,
    /// so no other node can have been elected in the meantime.
    pub(crate) fn lease_valid(&self) -> bool {
        let leader = match &self.state.leader {
            Some(l) => l,
            None => return false,
        };
        if self.view.quorum_size() == 1 {
            return true;
        }
        match leader.quorum_contact(&self.view, Instant::now()) {
            Some(contact) => contact.elapsed() < self.config.election_timeout,
            None => false,
        }
    }

    /// Answer linearizable reads whose barrier round a quorum has
    /// acknowledged and whose read index has been applied.
    pub(crate) fn try_complete_reads(&mut self) {
        let leader = match &self.state.leader {
            Some(l) => l,
            None => return,
        };
        let acked = leader.quorum_acked_round(&self.view);
        let applied = self.state.volatile.last_applied;

        let mut i = 0;
        while i < self.pending_reads.len() {
            if self.pending_reads[i].round <= acked && self.pending_reads[i].read_index <= applied {
                let read = self.pending_reads.swap_remove(i);
                let _ = read.tx.send(self.run_query(&read.op));
            } else {
                i += 1;
            }
        }
    }

    fn drain_sequential(&mut self) {
        let applied = self.state.volatile.last_applied;
        let mut i = 0;
        while i < self.pending_sequential.len() {
            if self.pending_sequential[i].min_index <= applied {
                let query = self.pending_sequential.swap_remove(i);
                let _ = query.tx.send(self.run_query(&query.op));
            } else {
                i += 1;
            }
        }
    }

    // ---- timers ----------------------------------------------------------

    fn on_tick(&mut self) {
        let can_elect = matches!(self.state.role, Role::Follower | Role::Candidate)
            && self.view.is_voter(self.state.id);
        if can_elect && Instant::now() >= self.election_deadline {
            self.start_election();
        }
    }

    fn on_heartbeat_tick(&mut self) {
        if self.state.role != Role::Leader {
            return;
        }
        self.expire_sessions();
        self.check_quorum();
        self.replicate(true);
    }

    /// Fail leadership-scoped obligations once no quorum has answered
    /// for a full election timeout. A leader cut off from its majority
    /// cannot commit, and the retryable error lets clients look for a
    /// healthier leader instead of waiting forever.
    fn check_quorum(&mut self) {
        if self.view.quorum_size() == 1 {
            return;
        }
        if self.pending_commands.is_empty() && self.pending_reads.is_empty() {
            return;
        }
        let reference = match &self.state.leader {
            Some(leader) => {
                let now = Instant::now();
                leader.quorum_contact(&self.view, now).unwrap_or(leader.since)
            }
            None => return,
        };
        if reference.elapsed() < self.config.election_timeout {
            return;
        }

        warn!(
            "{} lost quorum contact, failing pending operations",
            self.state.id
        );
        for (_, tx) in self.pending_commands.drain() {
            let _ = tx.send(Err(RaftError::CommandFailure(
                "no quorum contact within the election timeout".into(),
            )));
        }
        for read in self.pending_reads.drain(..) {
            let _ = read.tx.send(Err(RaftError::QueryFailure(
                "no quorum contact within the election timeout".into(),
            )));
        }
    }

    /// Leader-side session expiry sweep. Closes go through the log so
    /// every node removes the session at the same point in history.
    fn expire_sessions(&mut self) {
        for session in self.sessions.expired(Instant::now()) {
            debug!("{} expiring session {session}", self.state.id);
            if let Err(e) = self.append_as_leader(EntryPayload::CloseSession { session }) {
                warn!("{} failed to append session expiry: {e}", self.state.id);
            }
        }
    }

    pub(crate) fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    // ---- control ---------------------------------------------------------

    fn handle_promote(&mut self) {
        match self.state.role {
            Role::Follower => {
                info!("{} promoted, forcing candidacy", self.state.id);
                self.start_election();
            }
            Role::Promotable => {
                let term = self.state.persistent.current_term;
                self.state.become_follower(term, self.state.leader_id);
                self.reset_election_timer();
                self.publish_role();
            }
            other => debug!("{} ignoring promote in role {other}", self.state.id),
        }
    }

    fn handle_step_down(&mut self) {
        if self.state.role != Role::Leader {
            return;
        }
        info!("{} stepping down", self.state.id);
        let term = self.state.persistent.current_term;
        self.state.become_follower(term, None);
        self.reset_election_timer();
        self.publish_role();
        self.fail_leader_pending();
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.state.id,
            role: self.state.role,
            term: self.state.persistent.current_term,
            leader_id: self.state.leader_id,
            commit_index: self.state.volatile.commit_index,
            last_applied: self.state.volatile.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    // ---- shared transition plumbing -------------------------------------

    pub(crate) fn publish_role(&self) {
        let _ = self
            .role_tx
            .send((self.state.role, self.state.persistent.current_term));
    }

    pub(crate) fn persist(&self) -> Result<()> {
        self.meta.save(&self.state.persistent)
    }

    /// Discard leadership-scoped obligations when leadership is lost.
    pub(crate) fn fail_leader_pending(&mut self) {
        let hint = self.state.leader_id;
        for (_, tx) in self.pending_commands.drain() {
            let _ = tx.send(Err(RaftError::NoLeader { hint }));
        }
        for read in self.pending_reads.drain(..) {
            let _ = read.tx.send(Err(RaftError::NoLeader { hint }));
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> RaftError) {
        for (_, tx) in self.pending_commands.drain() {
            let _ = tx.send(Err(err()));
        }
        for read in self.pending_reads.drain(..) {
            let _ = read.tx.send(Err(err()));
        }
        for query in self.pending_sequential.drain(..) {
            let _ = query.tx.send(Err(err()));
        }
    }

    /// Step down if a higher term is observed in any message. Returns
    /// true when the term advanced (and leadership-scoped state was
    /// dropped).
    pub(crate) fn observe_term(&mut self, term: Term, leader: Option<NodeId>) -> bool {
        let was_leader = self.state.role == Role::Leader;
        if self.state.observe_term(term, leader) {
            if let Err(e) = self.persist() {
                warn!("{} failed to persist term: {e}", self.state.id);
            }
            if was_leader {
                self.fail_leader_pending();
            }
            self.reset_election_timer();
            self.publish_role();
            true
        } else {
            false
        }
    }

    // ---- apply path ------------------------------------------------------

    /// Apply everything committed but not yet applied, in log order,
    /// completing proposer futures and releasing queued reads.
    pub(crate) fn apply_committed(&mut self) {
        while self.state.volatile.last_applied < self.state.volatile.commit_index {
            let next = self.state.volatile.last_applied + 1;
            let entry = match self.log.get(next) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("{} apply halted: {e}", self.state.id);
                    break;
                }
            };

            self.state.volatile.last_applied = next;
            let result = self.apply_entry(&entry);

            if let Some(tx) = self.pending_commands.remove(&next) {
                let _ = tx.send(result.map(|data| OperationOutput { index: next, data }));
            }
        }

        self.drain_sequential();
        self.try_complete_reads();
        self.check_promotion();
        self.maybe_snapshot();
    }

    fn apply_entry(&mut self, entry: &Entry) -> Result<Vec<u8>> {
        let now = Instant::now();
        match &entry.payload {
            EntryPayload::Noop => Ok(vec![]),

            EntryPayload::Command {
                session,
                sequence,
                op,
            } => match self.sessions.check_command(*session, *sequence, now)? {
                CommandDisposition::Duplicate(cached) => Ok(cached),
                CommandDisposition::Fresh => match self.state_machine.apply(op) {
                    Ok(response) => {
                        self.sessions.record(*session, *sequence, response.clone());
                        Ok(response)
                    }
                    Err(msg) => {
                        // The command consumed its sequence slot even
                        // though the application rejected it.
                        self.sessions.record(*session, *sequence, vec![]);
                        Err(RaftError::ApplicationError(msg))
                    }
                },
            },

            EntryPayload::OpenSession {
                client_id,
                timeout_ms,
            } => {
                let timeout = Duration::from_millis(*timeout_ms).clamp(
                    self.config.session_min_timeout,
                    self.config.session_max_timeout,
                );
                self.sessions
                    .open(entry.index.0, client_id.clone(), timeout, now);
                debug!(
                    "{} opened session {} for {client_id}",
                    self.state.id, entry.index.0
                );
                Ok(entry.index.0.to_le_bytes().to_vec())
            }

            EntryPayload::KeepAlive { session } => {
                self.sessions.keep_alive(*session, now)?;
                Ok(vec![])
            }

            EntryPayload::CloseSession { session } => {
                self.sessions.close(*session);
                Ok(vec![])
            }

            EntryPayload::Configuration { members } => {
                info!("{} applying configuration {members:?}", self.state.id);
                self.view.apply_configuration(members.clone());
                self.sync_leader_progress();
                Ok(vec![])
            }
        }
    }

    /// Keep the leader's progress map aligned with the membership view
    /// after a configuration change.
    fn sync_leader_progress(&mut self) {
        let remotes = self.view.remote_ids();
        let next = self.log.last_index() + 1;
        if let Some(leader) = self.state.leader.as_mut() {
            leader.progress.retain(|id, _| remotes.contains(id));
            for id in remotes {
                leader
                    .progress
                    .entry(id)
                    .or_insert_with(|| crate::state::Progress::new(next));
            }
        }
    }

    /// A promotable member that has caught up to the commit index joins
    /// the voters as a follower.
    fn check_promotion(&mut self) {
        if self.state.role == Role::Promotable
            && self.log.last_index() >= self.state.volatile.commit_index
            && self.state.volatile.commit_index > LogIndex::ZERO
        {
            info!("{} caught up, promoting to follower", self.state.id);
            let term = self.state.persistent.current_term;
            self.state.become_follower(term, self.state.leader_id);
            self.reset_election_timer();
            self.publish_role();
        }
    }

    // ---- snapshots -------------------------------------------------------

    /// Take a snapshot and compact once enough entries have been applied
    /// past the previous boundary, keeping a trailing window so
    /// slightly-behind followers avoid a full snapshot transfer.
    fn maybe_snapshot(&mut self) {
        if self.config.snapshot_threshold == 0 {
            return;
        }
        let applied = self.state.volatile.last_applied;
        let first = self.log.first_index();
        if applied.0 < first.0 || applied.0 - first.0 + 1 < self.config.snapshot_threshold {
            return;
        }

        // The application can hold entries back from compaction until
        // it has consumed them. When nothing below that bound remains
        // in the log, compacting would free nothing.
        let compact_to = (applied - self.config.snapshot_trailing)
            .min(self.state_machine.compactable_index());
        if compact_to < first {
            return;
        }

        let last_term = match self.log.term_of(applied) {
            Ok(Some(term)) => term,
            _ => return,
        };
        let sessions = match self.sessions.to_snapshot() {
            Ok(s) => s,
            Err(e) => {
                warn!("{} snapshot skipped: {e}", self.state.id);
                return;
            }
        };
        let data = match bincode::serialize(&(
            self.view.members().to_vec(),
            self.state_machine.snapshot(),
            sessions,
        )) {
            Ok(d) => d,
            Err(e) => {
                warn!("{} snapshot encode failed: {e}", self.state.id);
                return;
            }
        };

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: applied,
                last_included_term: last_term,
                members: self.view.members().to_vec(),
            },
            data,
        };

        if let Err(e) = self
            .log
            .set_snapshot(snapshot)
            .and_then(|_| self.log.compact_up_to(compact_to))
        {
            warn!("{} compaction failed: {e}", self.state.id);
            return;
        }
        info!(
            "{} snapshotted at {applied}, compacted through {compact_to}",
            self.state.id
        );
    }

    /// Install a complete snapshot received from the leader: reset the
    /// log, restore the state machine and session table, adopt the
    /// snapshot's membership.
    fn install_snapshot_data(&mut self, buffer: InstallBuffer) -> Result<()> {
        let (members, machine, sessions): (Vec<RaftMember>, Vec<u8>, Vec<u8>) =
            bincode::deserialize(&buffer.data)
                .map_err(|e| RaftError::ProtocolError(format!("snapshot decode: {e}")))?;

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: buffer.last_included_index,
                last_included_term: buffer.last_included_term,
                members: members.clone(),
            },
            data: buffer.data,
        };

        self.log.reset(snapshot)?;
        self.state_machine.restore(&machine);
        self.sessions.restore(&sessions, Instant::now())?;
        self.view.apply_configuration(members);
        self.state.volatile.commit_index = buffer.last_included_index;
        self.state.volatile.last_applied = buffer.last_included_index;
        Ok(())
    }

    pub(crate) fn notify_snapshot_started(&self) {
        for listener in &self.snapshot_listeners {
            listener.on_snapshot_replication_started();
        }
    }

    pub(crate) fn notify_snapshot_completed(&self, term: Term) {
        for listener in &self.snapshot_listeners {
            listener.on_snapshot_replication_completed(term);
        }
    }

    /// Follower side of the chunked snapshot transfer.
    fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        self.observe_term(req.term, Some(req.leader_id));
        let current = self.state.persistent.current_term;

        if req.term < current || !self.state.role.accepts_appends() {
            return InstallSnapshotResponse { term: current };
        }

        self.reset_election_timer();
        self.state.leader_id = Some(req.leader_id);

        if req.offset == 0 {
            if self.install_buffer.is_none() {
                self.notify_snapshot_started();
            }
            self.install_buffer = Some(InstallBuffer {
                last_included_index: req.last_included_index,
                last_included_term: req.last_included_term,
                data: req.data,
            });
        } else {
            match self.install_buffer.as_mut() {
                Some(buffer) if buffer.data.len() as u64 == req.offset => {
                    buffer.data.extend_from_slice(&req.data);
                }
                _ => {
                    // Out-of-sequence chunk; drop the transfer and let
                    // the leader restart it.
                    self.install_buffer = None;
                    return InstallSnapshotResponse { term: current };
                }
            }
        }

        if req.done {
            if let Some(buffer) = self.install_buffer.take() {
                match self.install_snapshot_data(buffer) {
                    Ok(()) => {
                        info!(
                            "{} installed snapshot through {}",
                            self.state.id, req.last_included_index
                        );
                        self.notify_snapshot_completed(current);
                        self.check_promotion();
                    }
                    Err(e) => warn!("{} snapshot install failed: {e}", self.state.id),
                }
            }
        }

        InstallSnapshotResponse { term: current }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LocalTransport;

    struct Echo;

    impl StateMachine for Echo {
        fn apply(&mut self, op: &[u8]) -> std::result::Result<Vec<u8>, String> {
            Ok(op.to_vec())
        }

        fn query(&self, op: &[u8]) -> std::result::Result<Vec<u8>, String> {
            Ok(op.to_vec())
        }

        fn snapshot(&self) -> Vec<u8> {
            vec![]
        }

        fn restore(&mut self, _data: &[u8]) {}
    }

    #[tokio::test]
    async fn test_builder_requires_protocol() {
        let err = RaftNode::builder(NodeId(1))
            .members(vec![RaftMember::active(NodeId(1))])
            .build(Echo)
            .unwrap_err();
        assert!(matches!(err, RaftError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_builder_requires_local_membership() {
        let transport = LocalTransport::new();
        let err = RaftNode::builder(NodeId(1))
            .members(vec![RaftMember::active(NodeId(2))])
            .protocol(transport.handle_for(NodeId(1)))
            .build(Echo)
            .unwrap_err();
        assert!(matches!(err, RaftError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_commands_rejected_before_bootstrap() {
        let transport = LocalTransport::new();
        let node = RaftNode::builder(NodeId(1))
            .members(vec![RaftMember::active(NodeId(1))])
            .protocol(transport.handle_for(NodeId(1)))
            .build(Echo)
            .unwrap();

        let err = node
            .open_session("client", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::NoLeader { .. }));

        node.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_elects_itself_and_serves() {
        let transport = LocalTransport::new();
        let node = RaftNode::builder(NodeId(1))
            .members(vec![RaftMember::active(NodeId(1))])
            .protocol(transport.handle_for(NodeId(1)))
            .build(Echo)
            .unwrap();
        transport.register(node.clone());

        node.bootstrap().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = node.status().await.unwrap();
        assert_eq!(status.role, Role::Leader);

        let session = node
            .open_session("client", Duration::from_secs(5))
            .await
            .unwrap();

        let output = node.command(session, 1, b"hello".to_vec()).await.unwrap();
        assert_eq!(output.data, b"hello");

        // Same sequence again: deduplicated, same answer.
        let output = node.command(session, 1, b"hello".to_vec()).await.unwrap();
        assert_eq!(output.data, b"hello");

        let read = node
            .query(ReadConsistency::Linearizable, b"peek".to_vec(), LogIndex::ZERO)
            .await
            .unwrap();
        assert_eq!(read.data, b"peek");

        node.shutdown();
    }
}
