//! # Pending-Answer Waiters
//!
//! Correlation table for the question/answer bridge: one resolvable
//! oneshot per job, keyed by job id and guarded by the question id so a
//! stale or mismatched answer never resumes the wrong wait.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::error::StageError;

struct PendingAnswer {
    question_id: String,
    tx: oneshot::Sender<String>,
}

/// Shared waiter table. One outstanding question per job; registering a
/// second while the first is pending is a stage bug and fails fast.
#[derive(Default)]
pub struct AnswerWaiters {
    inner: Mutex<HashMap<String, PendingAnswer>>,
}

impl AnswerWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, PendingAnswer>>, StageError> {
        self.inner
            .lock()
            .map_err(|e| StageError::transient(format!("Lock error: {}", e)))
    }

    /// Register a waiter for `job_id`. The returned receiver resolves
    /// with the answer text when a matching answer arrives.
    pub fn register(
        &self,
        job_id: &str,
        question_id: &str,
    ) -> Result<oneshot::Receiver<String>, StageError> {
        let mut inner = self.lock()?;
        if inner.contains_key(job_id) {
            return Err(StageError::QuestionConflict);
        }
        let (tx, rx) = oneshot::channel();
        inner.insert(
            job_id.to_string(),
            PendingAnswer {
                question_id: question_id.to_string(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Resolve the waiter for `job_id` if the question id matches.
    /// A mismatch leaves the waiter pending and returns `Ok(false)`,
    /// which makes duplicate and out-of-order answer delivery a no-op.
    pub fn resolve(
        &self,
        job_id: &str,
        question_id: &str,
        answer: &str,
    ) -> Result<bool, StageError> {
        let mut inner = self.lock()?;
        let matches = inner
            .get(job_id)
            .is_some_and(|pending| pending.question_id == question_id);
        if !matches {
            return Ok(false);
        }
        match inner.remove(job_id) {
            Some(pending) => Ok(pending.tx.send(answer.to_string()).is_ok()),
            None => Ok(false),
        }
    }

    /// Drop a waiter without resolving it (timeout, cancellation or an
    /// abandoned stage). The pending receiver observes a closed channel.
    pub fn remove(&self, job_id: &str) -> Result<bool, StageError> {
        Ok(self.lock()?.remove(job_id).is_some())
    }

    pub fn pending_question_id(&self, job_id: &str) -> Result<Option<String>, StageError> {
        Ok(self.lock()?.get(job_id).map(|p| p.question_id.clone()))
    }

    /// Number of jobs currently waiting on an answer.
    pub fn outstanding(&self) -> Result<usize, StageError> {
        Ok(self.lock()?.len())
    }
}
