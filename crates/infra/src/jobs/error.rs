use thiserror::Error;

use super::types::JobId;

/// Errors from job persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint (deduplication key, primary key) rejected the write.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The row exists but is not in a state that permits the operation.
    #[error("invalid job state: {0}")]
    InvalidState(String),

    #[error("failed to decode job row: {0}")]
    Decode(String),

    /// The backing store cannot be reached (pool closed, connection refused).
    #[error("job store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Failure reported by a job handler.
///
/// The variant decides what happens to the job: `Execution` and `Timeout` are
/// retried, `Cancelled` is released without consuming an attempt, while
/// `Config` and `Fatal` fail the job immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// The job itself is malformed (bad payload, missing settings).
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient failure; try again later.
    #[error("execution error: {0}")]
    Execution(String),

    /// Unrecoverable failure; retrying cannot succeed.
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The handler observed cooperative cancellation and stopped.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl JobError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Execution(format!("{err:#}"))
    }
}

/// A payload that does not deserialize is a configuration problem, not a
/// transient one.
impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("invalid payload: {err}"))
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        Self::Execution(err.to_string())
    }
}
