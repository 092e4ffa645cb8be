//! # Durable Job Store
//!
//! SQLite-backed named queues with leases, retry/backoff, cooperative
//! cancellation and retention purging. Jobs survive process restarts; a
//! leased job is invisible to other consumers until it completes, fails,
//! or its lease expires and it is redelivered (at-least-once).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::types::{generate_job_id, CancelOutcome, Job, JobState};
use crate::config::PipelineConfig;
use crate::db::PipelineDb;
use crate::pipeline::stage::Stage;
use crate::status::extract_progress;

pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
    config: PipelineConfig,
    /// One wakeup per queue so `next_job` reacts to enqueues immediately
    /// instead of waiting out the poll interval.
    notifies: HashMap<&'static str, Arc<Notify>>,
}

impl JobStore {
    pub fn new(db: &PipelineDb, config: PipelineConfig) -> Self {
        let notifies = Stage::ALL
            .iter()
            .map(|s| (s.queue(), Arc::new(Notify::new())))
            .collect();
        Self {
            conn: db.connection(),
            config,
            notifies,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    fn notify_queue(&self, queue: &str) {
        if let Some(notify) = self.notifies.get(queue) {
            notify.notify_one();
        }
    }

    /// Add a job to the tail of a queue. It becomes visible to workers
    /// immediately.
    pub fn enqueue(&self, queue: &str, payload: serde_json::Value) -> Result<Job> {
        self.enqueue_with_priority(queue, payload, 0)
    }

    pub fn enqueue_with_priority(
        &self,
        queue: &str,
        payload: serde_json::Value,
        priority: i64,
    ) -> Result<Job> {
        let id = generate_job_id(queue);
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.lock()?;
            conn.execute(
                r#"
                INSERT INTO jobs
                (id, queue, payload, state, priority, attempts_made, max_attempts,
                 cancel_requested, available_at, created_at, updated_at)
                VALUES (?1, ?2, ?3, 'waiting', ?4, 0, ?5, 0, ?6, ?6, ?6)
                "#,
                params![
                    id,
                    queue,
                    serde_json::to_string(&payload)?,
                    priority,
                    self.config.max_attempts,
                    now,
                ],
            )
            .context("Failed to enqueue job")?;
        }
        self.notify_queue(queue);
        self.get(&id)?
            .ok_or_else(|| anyhow::anyhow!("Enqueued job vanished: {}", id))
    }

    /// Claim the next available job in a queue, if any. The claim bumps
    /// the attempt counter and sets a lease deadline; until then the job
    /// is invisible to other consumers.
    pub fn lease(&self, queue: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(self.config.lease_duration)
                .context("lease duration out of range")?;
        let conn = self.lock()?;

        let id: Option<String> = conn
            .query_row(
                r#"
                SELECT id FROM jobs
                WHERE queue = ?1
                  AND state IN ('waiting', 'delayed')
                  AND available_at <= ?2
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
                "#,
                params![queue, now.to_rfc3339()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = id else {
            return Ok(None);
        };

        conn.execute(
            r#"
            UPDATE jobs
            SET state = 'active',
                attempts_made = attempts_made + 1,
                lease_expires_at = ?1,
                updated_at = ?2
            WHERE id = ?3
            "#,
            params![lease_until.to_rfc3339(), now.to_rfc3339(), id],
        )?;

        Self::load_row(&conn, &id)
    }

    /// Wait for the next job in a queue. Returns `None` once the shutdown
    /// token fires. The poll interval is a fallback for delayed jobs
    /// becoming available and for cross-process enqueues.
    pub async fn next_job(&self, queue: &str, shutdown: &CancellationToken) -> Result<Option<Job>> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(job) = self.lease(queue)? {
                return Ok(Some(job));
            }
            let notified = self
                .notifies
                .get(queue)
                .map(|n| Arc::clone(n))
                .unwrap_or_default();
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = notified.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.lock()?;
        Self::load_row(&conn, id)
    }

    /// Jobs currently in a queue, newest last. Mostly an operational and
    /// test aid.
    pub fn jobs_in_queue(&self, queue: &str) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM jobs WHERE queue = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![queue], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = Self::load_row(&conn, &id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Record a progress payload on an active job. The embedded percent
    /// is clamped so progress never moves backwards while the job lives;
    /// the step and any embedded question are taken as given.
    pub fn update_progress(&self, id: &str, progress: serde_json::Value) -> Result<()> {
        let conn = self.lock()?;
        let Some(job) = Self::load_row(&conn, id)? else {
            anyhow::bail!("No such job: {}", id);
        };
        if job.state.is_terminal() {
            return Ok(());
        }

        let prev = job
            .progress
            .as_ref()
            .map(extract_progress)
            .map(|s| s.percent)
            .unwrap_or(0);
        let incoming = extract_progress(&progress);
        let mut progress = progress;
        if let Some(obj) = progress.as_object_mut() {
            obj.insert(
                "progress".to_string(),
                serde_json::json!(incoming.percent.max(prev)),
            );
        }

        conn.execute(
            "UPDATE jobs SET progress = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&progress)?,
                Utc::now().to_rfc3339(),
                id
            ],
        )?;
        Ok(())
    }

    /// Terminate a job successfully and record its result.
    pub fn complete(&self, id: &str, result: serde_json::Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let affected = conn.execute(
            r#"
            UPDATE jobs
            SET state = 'completed', result = ?1, lease_expires_at = NULL,
                updated_at = ?2, finished_at = ?2
            WHERE id = ?3
            "#,
            params![serde_json::to_string(&result)?, now, id],
        )?;
        if affected == 0 {
            anyhow::bail!("No such job: {}", id);
        }
        Ok(())
    }

    /// Record a failed attempt. Retryable failures with attempt budget
    /// remaining are parked as `delayed` with exponential backoff;
    /// everything else is terminal and tagged with the failing module.
    pub fn fail(&self, id: &str, reason: &str, module: &str, retryable: bool) -> Result<JobState> {
        let conn = self.lock()?;
        let Some(job) = Self::load_row(&conn, id)? else {
            anyhow::bail!("No such job: {}", id);
        };
        let now = Utc::now();

        if retryable && job.attempts_made < job.max_attempts {
            let delay = self.config.backoff_for(job.attempts_made);
            let available = now
                + chrono::Duration::from_std(delay).context("backoff delay out of range")?;
            conn.execute(
                r#"
                UPDATE jobs
                SET state = 'delayed', failed_reason = ?1, lease_expires_at = NULL,
                    available_at = ?2, updated_at = ?3
                WHERE id = ?4
                "#,
                params![reason, available.to_rfc3339(), now.to_rfc3339(), id],
            )?;
            Ok(JobState::Delayed)
        } else {
            conn.execute(
                r#"
                UPDATE jobs
                SET state = 'failed', failed_reason = ?1, failed_module = ?2,
                    lease_expires_at = NULL, updated_at = ?3, finished_at = ?3
                WHERE id = ?4
                "#,
                params![reason, module, now.to_rfc3339(), id],
            )?;
            Ok(JobState::Failed)
        }
    }

    /// Cooperative cancellation. A job that has not started is removed
    /// outright; an active job gets a flag that the owning worker checks
    /// at its next checkpoint.
    pub fn request_cancel(&self, id: &str) -> Result<CancelOutcome> {
        let conn = self.lock()?;
        let Some(job) = Self::load_row(&conn, id)? else {
            return Ok(CancelOutcome::NotFound);
        };
        match job.state {
            JobState::Waiting | JobState::Delayed => {
                conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
                Ok(CancelOutcome::Removed)
            }
            JobState::Active => {
                conn.execute(
                    "UPDATE jobs SET cancel_requested = 1, updated_at = ?1 WHERE id = ?2",
                    params![Utc::now().to_rfc3339(), id],
                )?;
                Ok(CancelOutcome::Flagged)
            }
            JobState::Completed | JobState::Failed => Ok(CancelOutcome::Finished),
        }
    }

    pub fn is_cancel_requested(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    /// Merge an answer into the job's payload under `answers`, keyed by
    /// question id, so a re-ask on a later attempt can be satisfied from
    /// the record even if no waiter is live. Returns false when the job
    /// no longer exists.
    pub fn merge_answer(&self, id: &str, question_id: &str, answer: &str) -> Result<bool> {
        let conn = self.lock()?;
        let Some(job) = Self::load_row(&conn, id)? else {
            return Ok(false);
        };
        let mut payload = job.payload;
        if !payload.is_object() {
            payload = serde_json::json!({});
        }
        let obj = payload.as_object_mut().expect("payload forced to object");
        let answers = obj
            .entry("answers")
            .or_insert_with(|| serde_json::json!({}));
        if let Some(map) = answers.as_object_mut() {
            map.insert(question_id.to_string(), serde_json::json!(answer));
        }
        let now = Utc::now().to_rfc3339();
        obj.insert("lastAnsweredAt".to_string(), serde_json::json!(now));

        conn.execute(
            "UPDATE jobs SET payload = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(&payload)?, now, id],
        )?;
        Ok(true)
    }

    /// Return jobs whose lease expired to `waiting` for redelivery.
    /// This is what makes delivery at-least-once after a worker crash.
    pub fn reap_expired_leases(&self) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        let reaped = {
            let conn = self.lock()?;
            conn.execute(
                r#"
                UPDATE jobs
                SET state = 'waiting', lease_expires_at = NULL,
                    available_at = ?1, updated_at = ?1
                WHERE state = 'active' AND lease_expires_at < ?1
                "#,
                params![now],
            )?
        };
        if reaped > 0 {
            for notify in self.notifies.values() {
                notify.notify_one();
            }
        }
        Ok(reaped)
    }

    /// Drop finished jobs past their retention window. A resource bound,
    /// not a correctness requirement.
    pub fn purge_finished(&self) -> Result<usize> {
        let now = Utc::now();
        let completed_cutoff = now
            - chrono::Duration::from_std(self.config.completed_retention)
                .context("retention out of range")?;
        let failed_cutoff = now
            - chrono::Duration::from_std(self.config.failed_retention)
                .context("retention out of range")?;
        let conn = self.lock()?;
        let mut purged = conn.execute(
            "DELETE FROM jobs WHERE state = 'completed' AND finished_at < ?1",
            params![completed_cutoff.to_rfc3339()],
        )?;
        purged += conn.execute(
            "DELETE FROM jobs WHERE state = 'failed' AND finished_at < ?1",
            params![failed_cutoff.to_rfc3339()],
        )?;
        Ok(purged)
    }

    fn load_row(conn: &Connection, id: &str) -> Result<Option<Job>> {
        let job = conn
            .query_row(
                r#"
                SELECT id, queue, payload, state, priority, attempts_made, max_attempts,
                       progress, result, failed_reason, failed_module, cancel_requested,
                       available_at, created_at, updated_at, finished_at
                FROM jobs WHERE id = ?1
                "#,
                params![id],
                |row| {
                    let payload: String = row.get(2)?;
                    let state: String = row.get(3)?;
                    let progress: Option<String> = row.get(7)?;
                    let result: Option<String> = row.get(8)?;
                    let available_at: String = row.get(12)?;
                    let created_at: String = row.get(13)?;
                    let updated_at: String = row.get(14)?;
                    let finished_at: Option<String> = row.get(15)?;
                    Ok(Job {
                        id: row.get(0)?,
                        queue: row.get(1)?,
                        payload: serde_json::from_str(&payload)
                            .unwrap_or(serde_json::Value::Null),
                        state: JobState::from_str(&state).unwrap_or(JobState::Waiting),
                        priority: row.get(4)?,
                        attempts_made: row.get(5)?,
                        max_attempts: row.get(6)?,
                        progress: progress.and_then(|p| serde_json::from_str(&p).ok()),
                        result: result.and_then(|r| serde_json::from_str(&r).ok()),
                        failed_reason: row.get(9)?,
                        failed_module: row.get(10)?,
                        cancel_requested: row.get::<_, i64>(11)? != 0,
                        available_at: parse_time(&available_at),
                        created_at: parse_time(&created_at),
                        updated_at: parse_time(&updated_at),
                        finished_at: finished_at.map(|t| parse_time(&t)),
                    })
                },
            )
            .optional()?;
        Ok(job)
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
