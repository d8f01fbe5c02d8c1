//! Error taxonomy for the consensus core
//!
//! Failures cross the wire as small tagged [`ErrorCode`]s rather than full
//! exception payloads. Each code maps deterministically to a typed
//! [`RaftError`] on the receiving side, so callers can apply their configured
//! retry policy without parsing message strings.

use crate::types::{LogIndex, NodeId};
use serde::{Deserialize, Serialize};

/// Tagged error kinds transmitted over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NoLeader,
    QueryFailure,
    CommandFailure,
    ApplicationError,
    IllegalMemberState,
    UnknownClient,
    UnknownSession,
    UnknownService,
    ClosedSession,
    ProtocolError,
    ConfigurationError,
    Unavailable,
}

impl ErrorCode {
    /// Reconstruct the typed failure for a code received over the wire.
    pub fn into_error(self, detail: String) -> RaftError {
        match self {
            ErrorCode::NoLeader => RaftError::NoLeader { hint: None },
            ErrorCode::QueryFailure => RaftError::QueryFailure(detail),
            ErrorCode::CommandFailure => RaftError::CommandFailure(detail),
            ErrorCode::ApplicationError => RaftError::ApplicationError(detail),
            ErrorCode::IllegalMemberState => RaftError::IllegalMemberState(detail),
            ErrorCode::UnknownClient => RaftError::UnknownClient(detail),
            ErrorCode::UnknownSession => RaftError::UnknownSession(detail.parse().unwrap_or(0)),
            ErrorCode::UnknownService => RaftError::UnknownService(detail),
            ErrorCode::ClosedSession => RaftError::ClosedSession(detail.parse().unwrap_or(0)),
            ErrorCode::ProtocolError => RaftError::ProtocolError(detail),
            ErrorCode::ConfigurationError => RaftError::ConfigurationError(detail),
            ErrorCode::Unavailable => RaftError::Unavailable(detail),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Errors raised by Raft operations.
///
/// Wire-visible kinds carry an [`ErrorCode`]; purely local kinds
/// (storage, corruption, shutdown) surface as `Unavailable` if they
/// ever have to cross a node boundary.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("no leader known (hint: {hint:?})")]
    NoLeader { hint: Option<NodeId> },

    #[error("query failed: {0}")]
    QueryFailure(String),

    #[error("command failed: {0}")]
    CommandFailure(String),

    #[error("application error: {0}")]
    ApplicationError(String),

    #[error("illegal member state: {0}")]
    IllegalMemberState(String),

    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("unknown session: {0}")]
    UnknownSession(u64),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("session closed: {0}")]
    ClosedSession(u64),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("log corruption at index {index}: {detail}")]
    LogCorruption { index: LogIndex, detail: String },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("node is shutting down")]
    ShuttingDown,
}

impl RaftError {
    /// The wire code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            RaftError::NoLeader { .. } => ErrorCode::NoLeader,
            RaftError::QueryFailure(_) => ErrorCode::QueryFailure,
            RaftError::CommandFailure(_) => ErrorCode::CommandFailure,
            RaftError::ApplicationError(_) => ErrorCode::ApplicationError,
            RaftError::IllegalMemberState(_) => ErrorCode::IllegalMemberState,
            RaftError::UnknownClient(_) => ErrorCode::UnknownClient,
            RaftError::UnknownSession(_) => ErrorCode::UnknownSession,
            RaftError::UnknownService(_) => ErrorCode::UnknownService,
            RaftError::ClosedSession(_) => ErrorCode::ClosedSession,
            RaftError::ProtocolError(_) => ErrorCode::ProtocolError,
            RaftError::ConfigurationError(_) => ErrorCode::ConfigurationError,
            RaftError::Unavailable(_)
            | RaftError::LogCorruption { .. }
            | RaftError::Storage(_)
            | RaftError::ShuttingDown => ErrorCode::Unavailable,
        }
    }

    /// Whether the caller may retry after rediscovering the leader or
    /// waiting out a transient quorum loss. Session, protocol, and
    /// configuration failures are not retryable on the same session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::NoLeader
                | ErrorCode::QueryFailure
                | ErrorCode::CommandFailure
                | ErrorCode::IllegalMemberState
                | ErrorCode::Unavailable
        )
    }

    /// Whether re-establishing the session could clear this failure.
    pub fn needs_new_session(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::UnknownClient | ErrorCode::UnknownSession | ErrorCode::ClosedSession
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        let err = RaftError::QueryFailure("quorum lost".into());
        assert_eq!(err.code(), ErrorCode::QueryFailure);

        let rebuilt = err.code().into_error("quorum lost".into());
        assert!(matches!(rebuilt, RaftError::QueryFailure(_)));
    }

    #[test]
    fn test_session_errors_need_new_session() {
        assert!(RaftError::UnknownSession(7).needs_new_session());
        assert!(RaftError::ClosedSession(7).needs_new_session());
        assert!(!RaftError::UnknownSession(7).is_retryable());
    }

    #[test]
    fn test_leadership_errors_are_retryable() {
        assert!(RaftError::NoLeader { hint: None }.is_retryable());
        assert!(RaftError::CommandFailure("quorum".into()).is_retryable());
        assert!(!RaftError::ProtocolError("bad bootstrap".into()).is_retryable());
        assert!(!RaftError::ConfigurationError("mismatch".into()).is_retryable());
    }

    #[test]
    fn test_local_kinds_surface_as_unavailable() {
        let err = RaftError::LogCorruption {
            index: LogIndex(3),
            detail: "term mismatch".into(),
        };
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert_eq!(RaftError::ShuttingDown.code(), ErrorCode::Unavailable);
    }

    #[test]
    fn test_session_code_carries_id() {
        let err = ErrorCode::UnknownSession.into_error("42".into());
        assert!(matches!(err, RaftError::UnknownSession(42)));
    }
}
