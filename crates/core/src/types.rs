//! # Domain Types
//!
//! Shared data contracts flowing through the pipeline: the client intake,
//! per-stage outputs, and the queue job payloads that hand work between
//! stages. Field names follow the wire format (camelCase) because these
//! types cross the push channel and the REST API unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client-submitted description of the business a proposal is generated for.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientIntake {
    pub company_name: String,
    pub business_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_description: Option<String>,
    #[serde(default)]
    pub target_audience: String,
    #[serde(default)]
    pub competitors: Vec<String>,
    #[serde(default)]
    pub site_goals: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design_preferences: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_notes: Option<String>,
    #[serde(default)]
    pub contact_name: String,
    #[serde(default)]
    pub contact_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
}

/// One analyzed competitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetitorAnalysis {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

/// Output of the Researcher stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResearchResult {
    #[serde(default)]
    pub competitors: Vec<CompetitorAnalysis>,
    #[serde(default)]
    pub industry_trends: Vec<String>,
    #[serde(default)]
    pub target_audience_insights: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// One epic inside a project plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epic {
    pub id: String,
    pub title: String,
    pub description: String,
}

/// A page in the planned site structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SitePage {
    pub name: String,
    pub path: String,
    pub purpose: String,
}

/// Output of the Planner stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPlan {
    pub summary: String,
    #[serde(default)]
    pub epics: Vec<Epic>,
    #[serde(default)]
    pub site_structure: Vec<SitePage>,
    #[serde(default)]
    pub estimated_features: Vec<String>,
}

/// A single generated source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// Output of the Generator stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSite {
    pub project_path: String,
    #[serde(default)]
    pub files: Vec<GeneratedFile>,
    #[serde(default)]
    pub screenshots: Vec<String>,
}

/// Output of the Deployer stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    pub url: String,
    pub preview_url: String,
    pub deployment_id: String,
}

/// Output of the Documents stage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocumentsResult {
    pub proposal_pdf_url: String,
    pub presentation_pdf_url: String,
    #[serde(default)]
    pub email_sent: bool,
}

/// Terminal artifact bundle pushed to the browser when a pipeline run
/// finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub pdf_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    /// Always present, possibly empty.
    #[serde(default)]
    pub screenshots: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// A clarifying question raised by a stage mid-execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    /// Correlation id: an answer must echo this back to resolve the wait.
    pub id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl Question {
    pub fn new(id: &str, prompt: &str) -> Self {
        Self {
            id: id.to_string(),
            prompt: prompt.to_string(),
            options: None,
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = Some(options);
        self
    }
}

// === Queue job payloads ===
//
// Each payload carries `project_id` (linking the chain of jobs that make up
// one run) and `session_id` (routing key for push events). Everything else
// is the handoff data owned by the receiving stage.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeJob {
    pub project_id: String,
    pub session_id: String,
    pub intake: ClientIntake,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearcherJob {
    pub project_id: String,
    pub session_id: String,
    pub intake: ClientIntake,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannerJob {
    pub project_id: String,
    pub session_id: String,
    pub intake: ClientIntake,
    pub research: ResearchResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorJob {
    pub project_id: String,
    pub session_id: String,
    pub intake: ClientIntake,
    pub plan: ProjectPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployerJob {
    pub project_id: String,
    pub session_id: String,
    pub generated_site: GeneratedSite,
    pub company_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentsJob {
    pub project_id: String,
    pub session_id: String,
    pub deployment_url: String,
    pub preview_url: String,
    pub intake: ClientIntake,
    pub plan: ProjectPlan,
    pub research: ResearchResult,
    #[serde(default)]
    pub screenshots: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intake_round_trips_camel_case() {
        let json = serde_json::json!({
            "companyName": "Glinka",
            "businessType": "Pottery studio",
            "targetAudience": "hobbyists",
            "contactName": "Aida",
            "contactEmail": "aida@example.com"
        });
        let intake: ClientIntake = serde_json::from_value(json).unwrap();
        assert_eq!(intake.company_name, "Glinka");
        assert!(intake.competitors.is_empty());

        let back = serde_json::to_value(&intake).unwrap();
        assert_eq!(back["businessType"], "Pottery studio");
    }

    #[test]
    fn generation_result_screenshots_default_to_empty() {
        let json = serde_json::json!({
            "pdfUrl": "/artifacts/kp.pdf",
            "completedAt": Utc::now().to_rfc3339()
        });
        let result: GenerationResult = serde_json::from_value(json).unwrap();
        assert!(result.screenshots.is_empty());
    }
}
