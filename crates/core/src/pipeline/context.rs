//! # Stage Context
//!
//! The API a stage author sees while a job runs: progress reporting,
//! cooperative cancellation checkpoints, and `ask` — a blocking-looking
//! question that suspends the stage's future (never a pool thread) until
//! the answer arrives or the wait times out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::events::WorkerEvent;
use crate::channel::waiters::AnswerWaiters;
use crate::error::StageError;
use crate::job::{Job, JobStore};
use crate::pipeline::stage::Stage;
use crate::status::extract_progress;
use crate::types::Question;

pub struct StageContext {
    job_id: String,
    project_id: String,
    session_id: String,
    stage: Stage,
    store: Arc<JobStore>,
    waiters: Arc<AnswerWaiters>,
    events: mpsc::Sender<WorkerEvent>,
    question_timeout: Duration,
}

impl StageContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: &Job,
        project_id: &str,
        session_id: &str,
        stage: Stage,
        store: Arc<JobStore>,
        waiters: Arc<AnswerWaiters>,
        events: mpsc::Sender<WorkerEvent>,
        question_timeout: Duration,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            project_id: project_id.to_string(),
            session_id: session_id.to_string(),
            stage,
            store,
            waiters,
            events,
            question_timeout,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Record and publish a progress update. The store clamps the
    /// percent so progress never moves backwards.
    pub async fn progress(&self, percent: u8, step: &str) -> Result<(), StageError> {
        self.store
            .update_progress(
                &self.job_id,
                serde_json::json!({"progress": percent, "currentStep": step}),
            )
            .map_err(StageError::transient)?;
        let _ = self
            .events
            .send(WorkerEvent::Progress {
                job_id: self.job_id.clone(),
                session_id: self.session_id.clone(),
                progress: percent,
                step: step.to_string(),
            })
            .await;
        Ok(())
    }

    /// Cancellation checkpoint. Call before each expensive external
    /// call; aborts the attempt with `Cancelled` when the user asked.
    pub fn checkpoint(&self) -> Result<(), StageError> {
        let cancelled = self
            .store
            .is_cancel_requested(&self.job_id)
            .map_err(StageError::transient)?;
        if cancelled {
            return Err(StageError::Cancelled);
        }
        Ok(())
    }

    /// Ask the end user a clarifying question and wait for the answer.
    ///
    /// The question is recorded in the job's progress (so polling and
    /// reconnect replay see the `waiting_for_input` state), pushed over
    /// the channel, and then awaited on a oneshot with a bounded
    /// timeout. An answer previously recorded in the payload for the
    /// same question id short-circuits the wait, which is how a re-ask
    /// after a retry picks up an answer that arrived too late.
    pub async fn ask(&self, question: Question) -> Result<String, StageError> {
        self.checkpoint()?;

        if let Some(answer) = self.recorded_answer(&question.id)? {
            debug!(job_id = %self.job_id, question_id = %question.id, "answered from record");
            return Ok(answer);
        }

        let rx = self.waiters.register(&self.job_id, &question.id)?;

        let snapshot = self.current_progress()?;
        self.store
            .update_progress(
                &self.job_id,
                serde_json::json!({
                    "progress": snapshot.0,
                    "currentStep": snapshot.1,
                    "question": question,
                }),
            )
            .map_err(StageError::transient)?;

        let _ = self
            .events
            .send(WorkerEvent::Question {
                job_id: self.job_id.clone(),
                session_id: self.session_id.clone(),
                question: question.clone(),
            })
            .await;

        match tokio::time::timeout(self.question_timeout, rx).await {
            Ok(Ok(answer)) => {
                self.clear_question(snapshot)?;
                Ok(answer)
            }
            // The waiter was dropped out from under us. A cancellation
            // pulls it deliberately, so check the flag before writing
            // this off as a transient fault.
            Ok(Err(_)) => {
                self.waiters.remove(&self.job_id)?;
                self.clear_question(snapshot)?;
                self.checkpoint()?;
                Err(StageError::transient("answer channel closed"))
            }
            Err(_) => {
                self.waiters.remove(&self.job_id)?;
                self.clear_question(snapshot)?;
                Err(StageError::QuestionTimeout)
            }
        }
    }

    fn recorded_answer(&self, question_id: &str) -> Result<Option<String>, StageError> {
        let job = self
            .store
            .get(&self.job_id)
            .map_err(StageError::transient)?
            .ok_or_else(|| StageError::transient("job record disappeared"))?;
        Ok(job
            .payload
            .get("answers")
            .and_then(|a| a.get(question_id))
            .and_then(|a| a.as_str())
            .map(|a| a.to_string()))
    }

    fn current_progress(&self) -> Result<(u8, String), StageError> {
        let job = self
            .store
            .get(&self.job_id)
            .map_err(StageError::transient)?
            .ok_or_else(|| StageError::transient("job record disappeared"))?;
        let snap = job
            .progress
            .as_ref()
            .map(extract_progress)
            .unwrap_or_default();
        Ok((snap.percent, snap.step))
    }

    fn clear_question(&self, snapshot: (u8, String)) -> Result<(), StageError> {
        self.store
            .update_progress(
                &self.job_id,
                serde_json::json!({"progress": snapshot.0, "currentStep": snapshot.1}),
            )
            .map_err(StageError::transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::db::PipelineDb;
    use crate::status::{project_status, GenerationState};

    fn test_setup(timeout: Duration) -> (Arc<JobStore>, Arc<AnswerWaiters>, mpsc::Sender<WorkerEvent>, mpsc::Receiver<WorkerEvent>) {
        let db = PipelineDb::open_in_memory().unwrap();
        let store = Arc::new(JobStore::new(
            &db,
            PipelineConfig {
                question_timeout: timeout,
                ..PipelineConfig::default()
            },
        ));
        let waiters = Arc::new(AnswerWaiters::new());
        let (tx, rx) = mpsc::channel(16);
        (store, waiters, tx, rx)
    }

    fn context(
        store: &Arc<JobStore>,
        waiters: &Arc<AnswerWaiters>,
        tx: &mpsc::Sender<WorkerEvent>,
        job: &Job,
        timeout: Duration,
    ) -> StageContext {
        StageContext::new(
            job,
            "proj-1",
            "sess-1",
            Stage::Planner,
            Arc::clone(store),
            Arc::clone(waiters),
            tx.clone(),
            timeout,
        )
    }

    #[tokio::test]
    async fn ask_resolves_when_answer_arrives() {
        let timeout = Duration::from_secs(5);
        let (store, waiters, tx, mut events) = test_setup(timeout);
        let job = store.enqueue("planner", serde_json::json!({})).unwrap();
        store.lease("planner").unwrap().unwrap();
        let ctx = context(&store, &waiters, &tx, &job, timeout);

        let answerer = {
            let waiters = Arc::clone(&waiters);
            let job_id = job.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                waiters.resolve(&job_id, "q1", "terracotta").unwrap()
            })
        };

        let answer = ctx.ask(Question::new("q1", "Which palette?")).await.unwrap();
        assert_eq!(answer, "terracotta");
        assert!(answerer.await.unwrap());

        // The question event went out while the wait was pending.
        assert!(matches!(events.recv().await, Some(WorkerEvent::Question { .. })));

        // And the projected state is back to processing.
        let job = store.get(&job.id).unwrap().unwrap();
        assert_eq!(project_status(&job).state, GenerationState::Processing);
    }

    #[tokio::test]
    async fn ask_times_out_and_clears_the_waiter() {
        let timeout = Duration::from_millis(50);
        let (store, waiters, tx, _events) = test_setup(timeout);
        let job = store.enqueue("planner", serde_json::json!({})).unwrap();
        store.lease("planner").unwrap().unwrap();
        let ctx = context(&store, &waiters, &tx, &job, timeout);

        let err = ctx.ask(Question::new("q1", "Which palette?")).await.unwrap_err();
        assert!(matches!(err, StageError::QuestionTimeout));
        assert_eq!(waiters.outstanding().unwrap(), 0);
    }

    #[tokio::test]
    async fn ask_exposes_waiting_state_while_pending() {
        let timeout = Duration::from_millis(120);
        let (store, waiters, tx, _events) = test_setup(timeout);
        let job = store.enqueue("planner", serde_json::json!({})).unwrap();
        store.lease("planner").unwrap().unwrap();
        let ctx = context(&store, &waiters, &tx, &job, timeout);

        let store_probe = Arc::clone(&store);
        let job_id = job.id.clone();
        let probe = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let job = store_probe.get(&job_id).unwrap().unwrap();
            project_status(&job).state
        });

        let _ = ctx.ask(Question::new("q1", "Which palette?")).await;
        assert_eq!(probe.await.unwrap(), GenerationState::WaitingForInput);
    }

    #[tokio::test]
    async fn second_question_is_a_contract_violation() {
        let timeout = Duration::from_secs(5);
        let (store, waiters, tx, _events) = test_setup(timeout);
        let job = store.enqueue("planner", serde_json::json!({})).unwrap();
        store.lease("planner").unwrap().unwrap();
        let ctx = context(&store, &waiters, &tx, &job, timeout);

        let _pending = waiters.register(&job.id, "q1").unwrap();
        let err = ctx.ask(Question::new("q2", "Another?")).await.unwrap_err();
        assert!(matches!(err, StageError::QuestionConflict));
    }

    #[tokio::test]
    async fn recorded_answer_short_circuits_a_re_ask() {
        let timeout = Duration::from_millis(50);
        let (store, waiters, tx, _events) = test_setup(timeout);
        let job = store.enqueue("planner", serde_json::json!({})).unwrap();
        store.lease("planner").unwrap().unwrap();
        store.merge_answer(&job.id, "q1", "terracotta").unwrap();
        let ctx = context(&store, &waiters, &tx, &job, timeout);

        let answer = ctx.ask(Question::new("q1", "Which palette?")).await.unwrap();
        assert_eq!(answer, "terracotta");
        assert_eq!(waiters.outstanding().unwrap(), 0);
    }

    #[tokio::test]
    async fn checkpoint_observes_cancel_flag() {
        let timeout = Duration::from_secs(5);
        let (store, waiters, tx, _events) = test_setup(timeout);
        let job = store.enqueue("generator", serde_json::json!({})).unwrap();
        store.lease("generator").unwrap().unwrap();
        let ctx = context(&store, &waiters, &tx, &job, timeout);

        assert!(ctx.checkpoint().is_ok());
        store.request_cancel(&job.id).unwrap();
        assert!(matches!(ctx.checkpoint().unwrap_err(), StageError::Cancelled));
    }
}
