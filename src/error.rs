use thiserror::Error;

/// Failure taxonomy for every engine operation.
///
/// Callers branch on this: transport failures are safe to retry, semantic
/// rejections and conflicts are authoritative and must not be replayed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A submission is already awaiting its reply on this session.
    #[error("a message is already awaiting its reply")]
    SubmissionInFlight,

    /// The backend refused because another actor got there first
    /// (e.g. the conversation was already forked by a racing client).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend processed the request and said no.
    #[error("rejected by backend: {0}")]
    Rejected(String),

    /// Network failure, unexpected status, or a malformed response body.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transport(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(error: reqwest::Error) -> Self {
        EngineError::Transport(error.to_string())
    }
}
