//! Stage failure taxonomy. The retry policy keys off the variant, not the
//! message: transient and timeout failures go back on the queue with
//! backoff, everything else is terminal for the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    /// Recoverable failure (upstream service hiccup, I/O). Retried with
    /// exponential backoff until attempts are exhausted.
    #[error("transient failure: {0}")]
    Transient(String),

    /// No answer arrived for an outstanding question within the wait
    /// window. The attempt fails and the job is re-queued.
    #[error("no answer received within the wait window")]
    QuestionTimeout,

    /// The user requested cancellation. Terminal, never retried.
    #[error("cancelled by user")]
    Cancelled,

    /// The payload or stage output is structurally invalid. Terminal.
    #[error("invalid payload: {0}")]
    Validation(String),

    /// A stage asked a second question while one was still outstanding
    /// for the same job. This is a stage bug, so the job fails fast.
    #[error("a question is already outstanding for this job")]
    QuestionConflict,
}

impl StageError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether a failed attempt should be re-queued (subject to the
    /// remaining attempt budget).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::QuestionTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(StageError::transient("econnreset").is_retryable());
        assert!(StageError::QuestionTimeout.is_retryable());
        assert!(!StageError::Cancelled.is_retryable());
        assert!(!StageError::validation("missing companyName").is_retryable());
        assert!(!StageError::QuestionConflict.is_retryable());
    }
}
