//! # Job Status Projector
//!
//! Folds the queue's native job state and the latest progress payload
//! into the single `GenerationStatus` shape the browser sees, via push
//! and via the polling endpoint alike.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobState};
use crate::types::Question;

/// Externally visible lifecycle vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Queued,
    Processing,
    WaitingForInput,
    Completed,
    Failed,
}

/// Snapshot handed to clients. At most one of `question`, `result` and
/// `error` is populated, matching the state: a question only while
/// waiting for input, a result only when completed, an error only when
/// failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub state: GenerationState,
    pub progress: u8,
    pub current_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<Question>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a progress payload boils down to once its shape is normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub percent: u8,
    pub step: String,
    pub question: Option<Question>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            percent: 0,
            step: "analysis".to_string(),
            question: None,
        }
    }
}

/// Normalize a progress payload. Workers emit a flat
/// `{progress, currentStep}` object, but payloads that crossed the wire
/// may arrive wrapped one level deeper under a `progress` key.
/// Precedence: flat fields first, then the nested envelope, then the
/// defaults `(0, "analysis")`.
pub fn extract_progress(value: &serde_json::Value) -> ProgressSnapshot {
    let mut snap = ProgressSnapshot::default();

    let nested = value.get("progress").filter(|v| v.is_object());
    let sources = [Some(value), nested];

    for source in sources.iter().flatten() {
        if let Some(pct) = source.get("progress").and_then(|p| p.as_u64()) {
            snap.percent = pct.min(100) as u8;
            if let Some(step) = source.get("currentStep").and_then(|s| s.as_str()) {
                snap.step = step.to_string();
            }
            snap.question = source
                .get("question")
                .and_then(|q| serde_json::from_value(q.clone()).ok());
            return snap;
        }
    }

    // No percent anywhere; still surface a step or question if present.
    for source in sources.iter().flatten() {
        if let Some(step) = source.get("currentStep").and_then(|s| s.as_str()) {
            snap.step = step.to_string();
        }
        if snap.question.is_none() {
            snap.question = source
                .get("question")
                .and_then(|q| serde_json::from_value(q.clone()).ok());
        }
    }
    snap
}

/// Project a queue job into the external status. `waiting` and `delayed`
/// both read as `queued`; an active job with an embedded question reads
/// as `waiting_for_input`.
pub fn project_status(job: &Job) -> GenerationStatus {
    let snap = job
        .progress
        .as_ref()
        .map(extract_progress)
        .unwrap_or_default();

    match job.state {
        JobState::Waiting | JobState::Delayed => GenerationStatus {
            state: GenerationState::Queued,
            progress: snap.percent,
            current_step: snap.step,
            question: None,
            result: None,
            error: None,
        },
        JobState::Active => match snap.question {
            Some(question) => GenerationStatus {
                state: GenerationState::WaitingForInput,
                progress: snap.percent,
                current_step: snap.step,
                question: Some(question),
                result: None,
                error: None,
            },
            None => GenerationStatus {
                state: GenerationState::Processing,
                progress: snap.percent,
                current_step: snap.step,
                question: None,
                result: None,
                error: None,
            },
        },
        JobState::Completed => GenerationStatus {
            state: GenerationState::Completed,
            progress: 100,
            current_step: snap.step,
            question: None,
            result: job.result.clone(),
            error: None,
        },
        JobState::Failed => GenerationStatus {
            state: GenerationState::Failed,
            progress: snap.percent,
            current_step: snap.step,
            question: None,
            result: None,
            error: job.failed_reason.clone(),
        },
    }
}
