//! # Stage Worker Pools
//!
//! One pool of worker tasks per queue. Each worker leases a job, runs
//! the stage handler, and on success enqueues exactly one job into the
//! adjacent next queue. Failures are classified at this boundary:
//! retryable ones go back through the store's backoff machinery,
//! terminal ones mark the project failed and push the failure event.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::context::StageContext;
use super::handlers::{StageHandlers, StageOutcome};
use super::stage::Stage;
use crate::channel::events::WorkerEvent;
use crate::channel::registry::SessionRegistry;
use crate::channel::waiters::AnswerWaiters;
use crate::collaborators::Collaborators;
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::job::{Job, JobState, JobStore};
use crate::project::ProjectManager;

/// The embedded worker runtime: worker pools for all six queues plus
/// the lease-reaper/retention maintenance task.
pub struct PipelineRuntime {
    store: Arc<JobStore>,
    projects: Arc<ProjectManager>,
    registry: Arc<SessionRegistry>,
    waiters: Arc<AnswerWaiters>,
    handlers: Arc<StageHandlers>,
    events: mpsc::Sender<WorkerEvent>,
    config: PipelineConfig,
}

impl PipelineRuntime {
    pub fn new(
        store: Arc<JobStore>,
        projects: Arc<ProjectManager>,
        registry: Arc<SessionRegistry>,
        waiters: Arc<AnswerWaiters>,
        collaborators: Collaborators,
        events: mpsc::Sender<WorkerEvent>,
        config: PipelineConfig,
    ) -> Self {
        let handlers = Arc::new(StageHandlers::new(
            Arc::clone(&projects),
            collaborators,
            config.auto_approve_plans,
        ));
        Self {
            store,
            projects,
            registry,
            waiters,
            handlers,
            events,
            config,
        }
    }

    /// Spawn every worker pool and the maintenance loop. Tasks run
    /// until the shutdown token fires.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for stage in Stage::ALL {
            let slots = self.config.concurrency_for(stage);
            info!(stage = %stage, slots, "starting worker pool");
            for _ in 0..slots {
                let runtime = Arc::clone(self);
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    runtime.worker_loop(stage, shutdown).await;
                }));
            }
        }

        let runtime = Arc::clone(self);
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            runtime.maintenance_loop(shutdown).await;
        }));
        handles
    }

    async fn worker_loop(&self, stage: Stage, shutdown: CancellationToken) {
        let queue = stage.queue();
        loop {
            let job = match self.store.next_job(queue, &shutdown).await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    error!(queue, "lease failed: {}", e);
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };
            self.run_job(stage, job).await;
        }
    }

    async fn run_job(&self, stage: Stage, job: Job) {
        let project_id = str_field(&job.payload, "projectId");
        let session_id = str_field(&job.payload, "sessionId");
        info!(
            stage = %stage,
            job_id = %job.id,
            project_id = %project_id,
            attempt = job.attempts_made,
            "stage started"
        );

        let ctx = StageContext::new(
            &job,
            &project_id,
            &session_id,
            stage,
            Arc::clone(&self.store),
            Arc::clone(&self.waiters),
            self.events.clone(),
            self.config.question_timeout,
        );

        match self.handlers.run(stage, &ctx, job.payload.clone()).await {
            Ok(outcome) => {
                if let Err(e) = self
                    .finish_job(stage, &job, &project_id, &session_id, outcome)
                    .await
                {
                    error!(job_id = %job.id, "handoff failed: {}", e);
                }
            }
            Err(e) => {
                self.fail_job(stage, &job, &project_id, &session_id, e)
                    .await;
            }
        }
    }

    /// Success path. The handler has already persisted its durable
    /// output, so completing the job and enqueuing the successor can be
    /// redone safely if the process dies between the two.
    async fn finish_job(
        &self,
        stage: Stage,
        job: &Job,
        project_id: &str,
        session_id: &str,
        outcome: StageOutcome,
    ) -> anyhow::Result<()> {
        self.store.complete(&job.id, outcome.result.clone())?;

        if let (Some(next_stage), Some(payload)) = (stage.next(), outcome.next) {
            let next_job = self.store.enqueue(next_stage.queue(), payload)?;
            if !session_id.is_empty() {
                self.registry.bind_job(&next_job.id, session_id).await;
            }
            info!(
                from = %stage,
                to = %next_stage,
                job_id = %next_job.id,
                "stage handoff"
            );
        }
        self.registry.release_job(&job.id).await;

        if stage.next().is_none() {
            let _ = self
                .events
                .send(WorkerEvent::Completed {
                    job_id: job.id.clone(),
                    session_id: session_id.to_string(),
                    result: outcome.result,
                })
                .await;
            info!(project_id = %project_id, "pipeline run completed");
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        stage: Stage,
        job: &Job,
        project_id: &str,
        session_id: &str,
        err: StageError,
    ) {
        let reason = err.to_string();
        let retryable = err.is_retryable();

        let state = match self
            .store
            .fail(&job.id, &reason, stage.module_name(), retryable)
        {
            Ok(state) => state,
            Err(e) => {
                error!(job_id = %job.id, "failed to record failure: {}", e);
                return;
            }
        };

        match state {
            JobState::Delayed => {
                warn!(
                    stage = %stage,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    "attempt failed, retrying: {}",
                    reason
                );
            }
            _ => {
                error!(
                    stage = %stage,
                    job_id = %job.id,
                    "terminal failure: {}",
                    reason
                );
                if !project_id.is_empty() {
                    if let Err(e) =
                        self.projects
                            .mark_failed(project_id, stage.module_name(), &reason)
                    {
                        warn!(project_id, "could not mark project failed: {}", e);
                    }
                }
                // Only the short classified message crosses the channel.
                let _ = self
                    .events
                    .send(WorkerEvent::Failed {
                        job_id: job.id.clone(),
                        session_id: session_id.to_string(),
                        error: reason,
                    })
                    .await;
            }
        }
    }

    async fn maintenance_loop(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.store.reap_expired_leases() {
                Ok(n) if n > 0 => warn!(count = n, "redelivered jobs with expired leases"),
                Ok(_) => {}
                Err(e) => error!("lease reaper failed: {}", e),
            }
            match self.store.purge_finished() {
                Ok(n) if n > 0 => info!(count = n, "purged finished jobs past retention"),
                Ok(_) => {}
                Err(e) => error!("retention purge failed: {}", e),
            }
        }
    }
}

fn str_field(payload: &serde_json::Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
