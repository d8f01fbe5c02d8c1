//! Client sessions
//!
//! A session pairs a server-side registration (which deduplicates
//! commands) with client-side sequence assignment and retry. Commands
//! are serialized per session: each carries the next sequence number,
//! and a retried command reuses its number, so the state machine applies
//! it at most once no matter how many times the network made us resend.

use crate::builder::{CommunicationStrategy, RecoveryStrategy, SessionConfig};
use logplane_consensus::{LogIndex, NodeId, RaftError, RaftNode, ReadConsistency, Result, SessionId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct SessionState {
    session_id: SessionId,
    sequence: u64,
    /// Highest log index observed in any response; queries carry it so
    /// reads never travel backwards in time.
    last_index: LogIndex,
    rotation: usize,
    closed: bool,
}

struct SessionInner {
    client_id: String,
    nodes: Vec<RaftNode>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    leader_hint: parking_lot::Mutex<Option<NodeId>>,
    cancel: CancellationToken,
}

/// A live client session on one partition. Clone freely; all clones
/// share the session and its sequence stream.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("client_id", &self.inner.client_id)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    pub(crate) async fn connect(
        client_id: String,
        nodes: Vec<RaftNode>,
        config: SessionConfig,
    ) -> Result<Self> {
        let inner = Arc::new(SessionInner {
            client_id,
            nodes,
            config,
            state: Mutex::new(SessionState {
                session_id: 0,
                sequence: 0,
                last_index: LogIndex::ZERO,
                rotation: 0,
                closed: false,
            }),
            leader_hint: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let session_id = inner.open_session().await?;
        inner.state.lock().await.session_id = session_id;
        info!("session {session_id} opened for {}", inner.client_id);

        let keep_alive = Arc::clone(&inner);
        tokio::spawn(async move { keep_alive.keep_alive_loop().await });

        Ok(Self { inner })
    }

    pub async fn session_id(&self) -> SessionId {
        self.inner.state.lock().await.session_id
    }

    /// Highest log index this session has observed.
    pub async fn last_index(&self) -> LogIndex {
        self.inner.state.lock().await.last_index
    }

    /// Submit a command, retrying through leader changes. Returns the
    /// state machine's response.
    pub async fn command(&self, op: Vec<u8>) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.closed {
            return Err(RaftError::ClosedSession(state.session_id));
        }

        let mut attempts = 0;
        loop {
            let sequence = state.sequence + 1;
            let node = match inner.leader().await {
                Some(node) => node,
                None => {
                    inner.backoff(&mut attempts).await?;
                    continue;
                }
            };

            match node.command(state.session_id, sequence, op.clone()).await {
                Ok(output) => {
                    state.sequence = sequence;
                    state.last_index = state.last_index.max(output.index);
                    return Ok(output.data);
                }
                Err(e) if e.needs_new_session() => {
                    inner.handle_session_loss(&mut state, e).await?;
                }
                Err(e) if e.is_retryable() => {
                    inner.update_hint(&e);
                    debug!("command retry after: {e}");
                    inner.backoff(&mut attempts).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a query at the session's configured consistency level.
    pub async fn query(&self, op: Vec<u8>) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.closed {
            return Err(RaftError::ClosedSession(state.session_id));
        }

        let consistency = inner.config.read_consistency;
        let mut attempts = 0;
        loop {
            let node = match (consistency, inner.config.communication_strategy) {
                (ReadConsistency::Sequential, CommunicationStrategy::Any) => {
                    let node = inner.nodes[state.rotation % inner.nodes.len()].clone();
                    state.rotation += 1;
                    node
                }
                _ => match inner.leader().await {
                    Some(node) => node,
                    None => {
                        inner.backoff(&mut attempts).await?;
                        continue;
                    }
                },
            };

            match node.query(consistency, op.clone(), state.last_index).await {
                Ok(output) => {
                    state.last_index = state.last_index.max(output.index);
                    return Ok(output.data);
                }
                Err(e) if e.is_retryable() => {
                    inner.update_hint(&e);
                    debug!("query retry after: {e}");
                    inner.backoff(&mut attempts).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close the session on the cluster and stop keep-alives.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        inner.cancel.cancel();

        if let Some(node) = inner.leader().await {
            if let Err(e) = node.close_session(state.session_id).await {
                debug!("close left session {} to expire: {e}", state.session_id);
            }
        }
        Ok(())
    }
}

impl SessionInner {
    /// Resolve the leader: trust the cached hint, otherwise ask around.
    async fn leader(&self) -> Option<RaftNode> {
        if let Some(id) = *self.leader_hint.lock() {
            if let Some(node) = self.nodes.iter().find(|n| n.id() == id) {
                return Some(node.clone());
            }
        }

        for node in &self.nodes {
            if let Ok(status) = node.status().await {
                if let Some(leader_id) = status.leader_id {
                    if let Some(leader) = self.nodes.iter().find(|n| n.id() == leader_id) {
                        *self.leader_hint.lock() = Some(leader_id);
                        return Some(leader.clone());
                    }
                }
            }
        }
        None
    }

    /// Replace the cached leader with the server's hint, or drop it so
    /// the next attempt rediscovers the leader.
    fn update_hint(&self, error: &RaftError) {
        *self.leader_hint.lock() = match error {
            RaftError::NoLeader { hint } => *hint,
            _ => None,
        };
    }

    async fn backoff(&self, attempts: &mut usize) -> Result<()> {
        *attempts += 1;
        if *attempts > self.config.max_retries {
            return Err(RaftError::Unavailable(format!(
                "gave up after {} attempts",
                self.config.max_retries
            )));
        }
        tokio::time::sleep(self.config.retry_delay).await;
        Ok(())
    }

    /// Open (or reopen) a session on the current leader.
    async fn open_session(&self) -> Result<SessionId> {
        let mut attempts = 0;
        loop {
            let node = match self.leader().await {
                Some(node) => node,
                None => {
                    self.backoff(&mut attempts).await?;
                    continue;
                }
            };
            match node.open_session(&self.client_id, self.config.timeout).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_retryable() => {
                    self.update_hint(&e);
                    self.backoff(&mut attempts).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_session_loss(
        &self,
        state: &mut SessionState,
        cause: RaftError,
    ) -> Result<()> {
        match self.config.recovery_strategy {
            RecoveryStrategy::Recover => {
                warn!(
                    "session {} lost ({cause}), recovering for {}",
                    state.session_id, self.client_id
                );
                let replacement = self.open_session().await?;
                state.session_id = replacement;
                state.sequence = 0;
                info!("recovered as session {replacement}");
                Ok(())
            }
            RecoveryStrategy::Close => {
                state.closed = true;
                Err(cause)
            }
        }
    }

    async fn keep_alive_loop(self: Arc<Self>) {
        let period = self.config.timeout / 2;
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            let session_id = state.session_id;

            let node = match self.leader().await {
                Some(node) => node,
                None => continue,
            };
            match node.keep_alive(session_id).await {
                Ok(()) => {}
                Err(e) if e.needs_new_session() => {
                    if self.handle_session_loss(&mut state, e).await.is_err() {
                        return;
                    }
                }
                Err(e) => debug!("keep-alive for {session_id} failed: {e}"),
            }
        }
    }
}
