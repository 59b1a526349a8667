use crate::ids::UserId;

/// Failures surfaced by the session and call collaborators.
///
/// These are the "unhandled" failures: expected terminal states (no session,
/// no calls, explicit stop) are decisions, never errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("no session for user {0}")]
    SessionNotFound(UserId),

    #[error("stream closed: {0}")]
    StreamClosed(&'static str),

    #[error("{0}")]
    Internal(String),
}

impl CallError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::SessionNotFound(_) => "session_not_found",
            Self::StreamClosed(_) => "stream_closed",
            Self::Internal(_) => "internal",
        }
    }
}
