//! Error types for auditq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-bounds input, rejected at the API boundary.
    #[error("validation error: {0}")]
    Validation(String),

    /// Enqueue refused because the (student, area) pair is blocked.
    #[error("queue blocked for {student_id}/{area_code}")]
    QueueBlocked {
        student_id: String,
        area_code: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// An activation lost the revision-ordering race. Resolved
    /// deterministically by the store; never surfaced to submitters.
    #[error("activation superseded by an equal or higher revision")]
    ConcurrencyConflict,

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("rules engine error: {0}")]
    Rules(#[from] RulesError),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Other(format!("io error: {e}"))
    }
}

/// Failure reported by the external rules engine. The variant decides the
/// retry policy: transient failures are retried with backoff, permanent
/// failures are persisted immediately with a failed status.
#[derive(Debug, Error)]
pub enum RulesError {
    #[error("transient rules engine failure: {0}")]
    Transient(String),

    #[error("permanent rules engine failure: {0}")]
    Permanent(String),
}

impl Error {
    /// Whether a compute failure carrying this error should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rules(RulesError::Transient(_)) | Error::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
