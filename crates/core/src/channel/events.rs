//! # Channel Events
//!
//! The wire contract of the push channel. Worker events carry the
//! routing `sessionId`; the client-facing copies drop it because the
//! session is implicit in the connection.

use serde::{Deserialize, Serialize};

use crate::status::GenerationStatus;
use crate::types::Question;

/// Events emitted by the stage worker process, routed by session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    Progress {
        job_id: String,
        session_id: String,
        progress: u8,
        step: String,
    },
    Question {
        job_id: String,
        session_id: String,
        question: Question,
    },
    Completed {
        job_id: String,
        session_id: String,
        result: serde_json::Value,
    },
    Failed {
        job_id: String,
        session_id: String,
        error: String,
    },
}

impl WorkerEvent {
    pub fn job_id(&self) -> &str {
        match self {
            WorkerEvent::Progress { job_id, .. }
            | WorkerEvent::Question { job_id, .. }
            | WorkerEvent::Completed { job_id, .. }
            | WorkerEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            WorkerEvent::Progress { session_id, .. }
            | WorkerEvent::Question { session_id, .. }
            | WorkerEvent::Completed { session_id, .. }
            | WorkerEvent::Failed { session_id, .. } => session_id,
        }
    }

    /// Terminal events release the job's routing entry after delivery.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::Completed { .. } | WorkerEvent::Failed { .. })
    }

    /// The browser-facing copy, minus the routing key.
    pub fn to_client(&self) -> ClientEvent {
        match self.clone() {
            WorkerEvent::Progress {
                job_id,
                progress,
                step,
                ..
            } => ClientEvent::Progress {
                job_id,
                progress,
                step,
            },
            WorkerEvent::Question {
                job_id, question, ..
            } => ClientEvent::Question { job_id, question },
            WorkerEvent::Completed { job_id, result, .. } => {
                ClientEvent::Completed { job_id, result }
            }
            WorkerEvent::Failed { job_id, error, .. } => ClientEvent::Failed { job_id, error },
        }
    }
}

/// Events pushed to a browser session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Progress {
        job_id: String,
        progress: u8,
        step: String,
    },
    Question {
        job_id: String,
        question: Question,
    },
    Completed {
        job_id: String,
        result: serde_json::Value,
    },
    Failed {
        job_id: String,
        error: String,
    },
    /// Full projected snapshot, sent on reconnect so a refreshed page
    /// catches up without polling.
    Status {
        job_id: String,
        status: GenerationStatus,
    },
}

/// Commands a browser session sends upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BrowserCommand {
    Answer {
        job_id: String,
        question_id: String,
        answer: String,
    },
    Cancel {
        job_id: String,
    },
}

/// What happened to a submitted answer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerReceipt {
    /// The answer was merged into the job's durable payload.
    pub recorded: bool,
    /// A live waiter matched and stage execution resumed.
    pub delivered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_events_serialize_with_type_tag() {
        let event = WorkerEvent::Progress {
            job_id: "generator-1".to_string(),
            session_id: "sess-1".to_string(),
            progress: 55,
            step: "generation".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["jobId"], "generator-1");
        assert_eq!(json["sessionId"], "sess-1");
    }

    #[test]
    fn client_copy_drops_session_id() {
        let event = WorkerEvent::Question {
            job_id: "planner-1".to_string(),
            session_id: "sess-1".to_string(),
            question: Question::new("q1", "Which palette?"),
        };
        let client = serde_json::to_value(event.to_client()).unwrap();
        assert_eq!(client["type"], "question");
        assert_eq!(client["question"]["id"], "q1");
        assert!(client.get("sessionId").is_none());
    }

    #[test]
    fn browser_commands_parse_from_wire_shape() {
        let cmd: BrowserCommand = serde_json::from_value(serde_json::json!({
            "type": "answer",
            "jobId": "planner-1",
            "questionId": "q1",
            "answer": "terracotta"
        }))
        .unwrap();
        assert_eq!(
            cmd,
            BrowserCommand::Answer {
                job_id: "planner-1".to_string(),
                question_id: "q1".to_string(),
                answer: "terracotta".to_string(),
            }
        );

        let cmd: BrowserCommand =
            serde_json::from_value(serde_json::json!({"type": "cancel", "jobId": "planner-1"}))
                .unwrap();
        assert!(matches!(cmd, BrowserCommand::Cancel { .. }));
    }

    #[test]
    fn terminal_classification() {
        let failed = WorkerEvent::Failed {
            job_id: "j".to_string(),
            session_id: "s".to_string(),
            error: "boom".to_string(),
        };
        assert!(failed.is_terminal());
        let progress = WorkerEvent::Progress {
            job_id: "j".to_string(),
            session_id: "s".to_string(),
            progress: 1,
            step: "analysis".to_string(),
        };
        assert!(!progress.is_terminal());
    }
}
