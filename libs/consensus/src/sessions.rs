//! Server-side client sessions
//!
//! Sessions are replicated state: they are opened, refreshed, and closed
//! by entries in the log, so every node rebuilds the same session table
//! by applying committed entries. A session's id is the log index of the
//! entry that opened it. Commands carry a per-session sequence number;
//! re-delivery of an already-applied (session, sequence) pair returns the
//! cached response instead of re-applying, which is what makes client
//! retries exactly-once.

use crate::types::SessionId;
use crate::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// One open session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub client_id: String,
    pub timeout: Duration,
    /// Highest command sequence applied for this session.
    pub last_sequence: u64,
    /// Response of the last applied command, replayed on re-delivery.
    pub last_response: Vec<u8>,
    /// Refreshed by keep-alives and commands; not part of snapshots.
    last_contact: Instant,
}

/// Serializable form of a session for snapshots. Contact times restart
/// from the moment of restore.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
    id: SessionId,
    client_id: String,
    timeout_ms: u64,
    last_sequence: u64,
    last_response: Vec<u8>,
}

/// What to do with an incoming command.
#[derive(Debug)]
pub enum CommandDisposition {
    /// Not seen before; apply it and record the response.
    Fresh,
    /// Already applied; answer with the cached response.
    Duplicate(Vec<u8>),
}

/// The replicated session table.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    /// Ids of sessions that were closed, so a late command can be told
    /// apart from one on a session that never existed.
    closed: HashSet<SessionId>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, id: SessionId, client_id: String, timeout: Duration, now: Instant) {
        self.closed.remove(&id);
        self.sessions.insert(
            id,
            Session {
                id,
                client_id,
                timeout,
                last_sequence: 0,
                last_response: vec![],
                last_contact: now,
            },
        );
    }

    pub fn close(&mut self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            self.closed.insert(id);
        }
    }

    pub fn keep_alive(&mut self, id: SessionId, now: Instant) -> Result<()> {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.last_contact = now;
                Ok(())
            }
            None => Err(self.missing(id)),
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Classify a command before applying it. Sequence numbers must
    /// arrive in order; a gap means the client and server disagree about
    /// history, which is a protocol error rather than something to paper
    /// over.
    pub fn check_command(
        &mut self,
        id: SessionId,
        sequence: u64,
        now: Instant,
    ) -> Result<CommandDisposition> {
        let session = match self.sessions.get_mut(&id) {
            Some(s) => s,
            None => return Err(self.missing(id)),
        };
        session.last_contact = now;

        if sequence == session.last_sequence && sequence > 0 {
            return Ok(CommandDisposition::Duplicate(session.last_response.clone()));
        }
        if sequence != session.last_sequence + 1 {
            return Err(RaftError::ProtocolError(format!(
                "session {id}: sequence {sequence} does not follow {}",
                session.last_sequence
            )));
        }
        Ok(CommandDisposition::Fresh)
    }

    /// Record the response of a freshly applied command.
    pub fn record(&mut self, id: SessionId, sequence: u64, response: Vec<u8>) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_sequence = sequence;
            session.last_response = response;
        }
    }

    /// Sessions whose timeout elapsed without contact.
    pub fn expired(&self, now: Instant) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| now.duration_since(s.last_contact) > s.timeout)
            .map(|s| s.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The error for an absent session id: closed sessions are reported
    /// distinctly so clients know recovery is pointless.
    pub fn missing(&self, id: SessionId) -> RaftError {
        if self.closed.contains(&id) {
            RaftError::ClosedSession(id)
        } else {
            RaftError::UnknownSession(id)
        }
    }

    /// Serialize the table into a snapshot section.
    pub fn to_snapshot(&self) -> Result<Vec<u8>> {
        let persisted: Vec<PersistedSession> = self
            .sessions
            .values()
            .map(|s| PersistedSession {
                id: s.id,
                client_id: s.client_id.clone(),
                timeout_ms: s.timeout.as_millis() as u64,
                last_sequence: s.last_sequence,
                last_response: s.last_response.clone(),
            })
            .collect();
        let closed: Vec<SessionId> = self.closed.iter().copied().collect();

        bincode::serialize(&(persisted, closed))
            .map_err(|e| RaftError::Unavailable(format!("session snapshot encode: {e}")))
    }

    /// Rebuild the table from a snapshot section.
    pub fn restore(&mut self, data: &[u8], now: Instant) -> Result<()> {
        let (persisted, closed): (Vec<PersistedSession>, Vec<SessionId>) =
            bincode::deserialize(data)
                .map_err(|e| RaftError::Unavailable(format!("session snapshot decode: {e}")))?;

        self.sessions = persisted
            .into_iter()
            .map(|p| {
                (
                    p.id,
                    Session {
                        id: p.id,
                        client_id: p.client_id,
                        timeout: Duration::from_millis(p.timeout_ms),
                        last_sequence: p.last_sequence,
                        last_response: p.last_response,
                        last_contact: now,
                    },
                )
            })
            .collect();
        self.closed = closed.into_iter().collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_open_and_command_flow() {
        let mut mgr = SessionManager::new();
        mgr.open(5, "client-a".into(), Duration::from_secs(10), now());

        assert!(matches!(
            mgr.check_command(5, 1, now()).unwrap(),
            CommandDisposition::Fresh
        ));
        mgr.record(5, 1, b"ok-1".to_vec());

        // Re-delivery of the same sequence returns the cached response.
        match mgr.check_command(5, 1, now()).unwrap() {
            CommandDisposition::Duplicate(resp) => assert_eq!(resp, b"ok-1"),
            other => panic!("expected duplicate, got {other:?}"),
        }

        // The next sequence is fresh again.
        assert!(matches!(
            mgr.check_command(5, 2, now()).unwrap(),
            CommandDisposition::Fresh
        ));
    }

    #[test]
    fn test_sequence_gap_is_protocol_error() {
        let mut mgr = SessionManager::new();
        mgr.open(5, "client-a".into(), Duration::from_secs(10), now());

        let err = mgr.check_command(5, 3, now()).unwrap_err();
        assert!(matches!(err, RaftError::ProtocolError(_)));
    }

    #[test]
    fn test_unknown_vs_closed() {
        let mut mgr = SessionManager::new();
        assert!(matches!(
            mgr.check_command(9, 1, now()).unwrap_err(),
            RaftError::UnknownSession(9)
        ));

        mgr.open(9, "client-b".into(), Duration::from_secs(10), now());
        mgr.close(9);
        assert!(matches!(
            mgr.check_command(9, 1, now()).unwrap_err(),
            RaftError::ClosedSession(9)
        ));
        assert!(matches!(
            mgr.keep_alive(9, now()).unwrap_err(),
            RaftError::ClosedSession(9)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_requires_missed_keepalives() {
        let mut mgr = SessionManager::new();
        mgr.open(1, "client-a".into(), Duration::from_millis(500), Instant::now());
        mgr.open(2, "client-b".into(), Duration::from_millis(500), Instant::now());

        tokio::time::advance(Duration::from_millis(400)).await;
        mgr.keep_alive(1, Instant::now()).unwrap();

        tokio::time::advance(Duration::from_millis(300)).await;
        let expired = mgr.expired(Instant::now());
        assert_eq!(expired, vec![2]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut mgr = SessionManager::new();
        mgr.open(5, "client-a".into(), Duration::from_secs(10), now());
        mgr.record(5, 3, b"resp".to_vec());
        mgr.open(8, "client-b".into(), Duration::from_secs(10), now());
        mgr.close(8);

        let data = mgr.to_snapshot().unwrap();

        let mut restored = SessionManager::new();
        restored.restore(&data, now()).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.get(5).unwrap().last_sequence, 3);
        assert!(matches!(
            restored.check_command(8, 1, now()).unwrap_err(),
            RaftError::ClosedSession(8)
        ));
    }
}
