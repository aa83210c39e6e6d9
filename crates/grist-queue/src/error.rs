//! Queue error taxonomy

use crate::job::JobId;

/// Errors surfaced by queue operations and captured on failed jobs.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Malformed input to `add` or `register_handler`; rejected synchronously.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No handler registered for the job's type at claim time. Not retried.
    #[error("No handler registered for job type '{0}'")]
    NoHandler(String),

    /// The handler returned an error or panicked. Retried until the budget
    /// is exhausted.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The handler did not settle within the job's timeout. Retried like an
    /// execution failure.
    #[error("Execution timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    /// No job with the given id.
    #[error("Job not found: {0}")]
    NotFound(JobId),
}

impl QueueError {
    /// Whether the retry policy applies to this error. `NoHandler` is a
    /// configuration fault and fails the job outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_) | Self::Timeout { .. })
    }
}
