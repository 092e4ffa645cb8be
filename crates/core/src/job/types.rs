//! Queue job record and lifecycle states.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a queued job.
///
/// `waiting -> active -> {completed | failed}` on the happy path, with
/// `delayed` as the backoff parking state between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<JobState> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "delayed" => Some(JobState::Delayed),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A persisted queue job. `payload`, `progress` and `result` are opaque
/// JSON owned by the stage the queue belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub priority: i64,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub failed_reason: Option<String>,
    pub failed_module: Option<String>,
    pub cancel_requested: bool,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What `request_cancel` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started; it was removed from the queue outright.
    Removed,
    /// The job is running; a cancel flag was set for the worker to
    /// observe at its next checkpoint.
    Flagged,
    /// Already completed or failed. Nothing to do.
    Finished,
    /// No such job.
    NotFound,
}

impl CancelOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, CancelOutcome::Removed | CancelOutcome::Flagged)
    }
}

/// Collision-resistant id with a readable queue prefix, e.g.
/// `generator-18f3a9c2d41-7b9e`.
pub fn generate_job_id(queue: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(nanos);
    format!("{}-{:x}-{:04x}", queue, nanos, hasher.finish() & 0xffff)
}
