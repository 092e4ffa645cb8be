//! The fixed stage chain and the project lifecycle vocabulary.

use serde::{Deserialize, Serialize};

/// The six pipeline stages, in execution order. Each stage owns exactly
/// one queue; handoff between stages is an enqueue into the successor's
/// queue and never skips ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Researcher,
    Planner,
    Generator,
    Deployer,
    Documents,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Intake,
        Stage::Researcher,
        Stage::Planner,
        Stage::Generator,
        Stage::Deployer,
        Stage::Documents,
    ];

    /// Queue name, doubling as the job id prefix.
    pub fn queue(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Researcher => "researcher",
            Stage::Planner => "planner",
            Stage::Generator => "generator",
            Stage::Deployer => "deployer",
            Stage::Documents => "documents",
        }
    }

    /// Module name recorded on the project when this stage fails
    /// permanently, so triage knows where the run died.
    pub fn module_name(&self) -> &'static str {
        self.queue()
    }

    pub fn from_queue(name: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.queue() == name)
    }

    /// The successor stage, or `None` for the tail of the chain.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Intake => Some(Stage::Researcher),
            Stage::Researcher => Some(Stage::Planner),
            Stage::Planner => Some(Stage::Generator),
            Stage::Generator => Some(Stage::Deployer),
            Stage::Deployer => Some(Stage::Documents),
            Stage::Documents => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.queue())
    }
}

/// Coarse project lifecycle, persisted on the project record as each
/// stage picks the run up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    New,
    IntakeComplete,
    Researching,
    Planning,
    AwaitingApproval,
    Approved,
    Generating,
    Deploying,
    GeneratingDocuments,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::New => "new",
            ProjectStatus::IntakeComplete => "intake_complete",
            ProjectStatus::Researching => "researching",
            ProjectStatus::Planning => "planning",
            ProjectStatus::AwaitingApproval => "awaiting_approval",
            ProjectStatus::Approved => "approved",
            ProjectStatus::Generating => "generating",
            ProjectStatus::Deploying => "deploying",
            ProjectStatus::GeneratingDocuments => "generating_documents",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<ProjectStatus> {
        match s {
            "new" => Some(ProjectStatus::New),
            "intake_complete" => Some(ProjectStatus::IntakeComplete),
            "researching" => Some(ProjectStatus::Researching),
            "planning" => Some(ProjectStatus::Planning),
            "awaiting_approval" => Some(ProjectStatus::AwaitingApproval),
            "approved" => Some(ProjectStatus::Approved),
            "generating" => Some(ProjectStatus::Generating),
            "deploying" => Some(ProjectStatus::Deploying),
            "generating_documents" => Some(ProjectStatus::GeneratingDocuments),
            "completed" => Some(ProjectStatus::Completed),
            "failed" => Some(ProjectStatus::Failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_fixed_and_ends_at_documents() {
        let mut stage = Stage::Intake;
        let mut order = vec![stage];
        while let Some(next) = stage.next() {
            order.push(next);
            stage = next;
        }
        assert_eq!(order.len(), 6);
        assert_eq!(order.last(), Some(&Stage::Documents));
    }

    #[test]
    fn queue_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_queue(stage.queue()), Some(stage));
        }
        assert_eq!(Stage::from_queue("mailer"), None);
    }

    #[test]
    fn project_status_round_trips() {
        for s in [
            ProjectStatus::New,
            ProjectStatus::AwaitingApproval,
            ProjectStatus::GeneratingDocuments,
            ProjectStatus::Failed,
        ] {
            assert_eq!(ProjectStatus::from_str(s.as_str()), Some(s));
        }
    }
}
