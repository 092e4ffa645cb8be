//! # Channel Hub
//!
//! The routing core of the push channel. Stage workers (in-process or
//! over the authenticated worker socket) feed `WorkerEvent`s into one
//! mpsc; the hub forwards the client-facing copy to the owning browser
//! session and tears down job routing on terminal events. Answers and
//! cancellations from browsers come back through the hub too, so the
//! waiter table and the job store stay consistent.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::{AnswerReceipt, ClientEvent, WorkerEvent};
use super::registry::SessionRegistry;
use super::waiters::AnswerWaiters;
use crate::job::{CancelOutcome, JobStore};
use crate::status::{extract_progress, project_status};

pub struct ChannelHub {
    store: Arc<JobStore>,
    registry: Arc<SessionRegistry>,
    waiters: Arc<AnswerWaiters>,
    events_tx: mpsc::Sender<WorkerEvent>,
}

impl ChannelHub {
    /// Build the hub and hand back the receiver its run loop consumes.
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<SessionRegistry>,
        waiters: Arc<AnswerWaiters>,
    ) -> (Arc<Self>, mpsc::Receiver<WorkerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let hub = Arc::new(Self {
            store,
            registry,
            waiters,
            events_tx,
        });
        (hub, events_rx)
    }

    /// Sender that workers use to publish events into the hub.
    pub fn events_sender(&self) -> mpsc::Sender<WorkerEvent> {
        self.events_tx.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Routing loop. Runs until the shutdown token fires or every
    /// sender is gone.
    pub async fn run(self: Arc<Self>, mut events_rx: mpsc::Receiver<WorkerEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.dispatch(event).await;
                }
            }
        }
    }

    async fn dispatch(&self, event: WorkerEvent) {
        let job_id = event.job_id().to_string();
        let session_id = event.session_id().to_string();

        // Workers bind new jobs at enqueue time, but an event can also
        // arrive for a job that was bound before a restart lost the map.
        if self.registry.session_for_job(&job_id).await.is_none() && !session_id.is_empty() {
            self.registry.bind_job(&job_id, &session_id).await;
        }

        let delivered = self
            .registry
            .send_to_session(&session_id, event.to_client())
            .await;
        if !delivered {
            debug!(job_id = %job_id, session_id = %session_id, "no live session, event dropped");
        }

        if event.is_terminal() {
            self.registry.release_job(&job_id).await;
        }
    }

    /// Handle an answer from a browser or the REST endpoint. The answer
    /// is always merged into the job's durable payload; delivery to a
    /// live waiter is best-effort and a question-id mismatch is a no-op.
    pub fn submit_answer(
        &self,
        job_id: &str,
        question_id: &str,
        answer: &str,
    ) -> Result<AnswerReceipt> {
        let recorded = self.store.merge_answer(job_id, question_id, answer)?;
        let delivered = self.waiters.resolve(job_id, question_id, answer)?;
        if recorded && !delivered {
            debug!(job_id, question_id, "answer recorded but no matching waiter");
        }
        Ok(AnswerReceipt {
            recorded,
            delivered,
        })
    }

    /// Handle a cancellation request. A queued job is removed outright
    /// and its session told immediately; an active job is flagged for
    /// the worker's next checkpoint.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let outcome = self.store.request_cancel(job_id)?;
        match outcome {
            CancelOutcome::Removed => {
                let _ = self
                    .registry
                    .route(
                        job_id,
                        ClientEvent::Failed {
                            job_id: job_id.to_string(),
                            error: "cancelled by user".to_string(),
                        },
                    )
                    .await;
                self.registry.release_job(job_id).await;
            }
            CancelOutcome::Flagged => {
                // A stage parked in a question wait would otherwise run
                // out the full wait window before seeing the flag.
                self.waiters.remove(job_id)?;
            }
            CancelOutcome::Finished | CancelOutcome::NotFound => {}
        }
        Ok(outcome)
    }

    /// Catch a reconnecting session up: push the projected status of
    /// every bound job, and re-deliver a still-pending question so the
    /// page can answer it without waiting for a re-ask.
    pub async fn replay_for_session(&self, session_id: &str) {
        for job_id in self.registry.jobs_for_session(session_id).await {
            let job = match self.store.get(&job_id) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    self.registry.release_job(&job_id).await;
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job_id, "status replay failed: {}", e);
                    continue;
                }
            };

            let status = project_status(&job);
            let _ = self
                .registry
                .send_to_session(
                    session_id,
                    ClientEvent::Status {
                        job_id: job_id.clone(),
                        status,
                    },
                )
                .await;

            if let Some(progress) = job.progress.as_ref() {
                if let Some(question) = extract_progress(progress).question {
                    if !job.state.is_terminal() {
                        let _ = self
                            .registry
                            .send_to_session(
                                session_id,
                                ClientEvent::Question {
                                    job_id: job_id.clone(),
                                    question,
                                },
                            )
                            .await;
                    }
                }
            }
        }
    }
}
