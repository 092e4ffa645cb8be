//! # Stage Handlers
//!
//! Thin adapters between the worker loop and the collaborator seams.
//! Each handler decodes its queue's payload, drives the collaborator,
//! persists the stage output on the project record *before* the worker
//! enqueues the successor, and hands back the next queue's payload.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use super::context::StageContext;
use super::stage::{ProjectStatus, Stage};
use crate::collaborators::{Collaborators, DocumentInputs};
use crate::error::StageError;
use crate::project::ProjectManager;
use crate::types::{
    DeployerJob, DocumentsJob, GenerationResult, GeneratorJob, IntakeJob, PlannerJob,
    ResearcherJob,
};

/// What a successful stage run produced: the job's stored result and,
/// unless the chain ends or a gate holds the handoff, the payload for
/// the adjacent next queue.
pub struct StageOutcome {
    pub result: Value,
    pub next: Option<Value>,
}

pub struct StageHandlers {
    projects: Arc<ProjectManager>,
    collaborators: Collaborators,
    auto_approve_plans: bool,
}

impl StageHandlers {
    pub fn new(
        projects: Arc<ProjectManager>,
        collaborators: Collaborators,
        auto_approve_plans: bool,
    ) -> Self {
        Self {
            projects,
            collaborators,
            auto_approve_plans,
        }
    }

    pub async fn run(
        &self,
        stage: Stage,
        ctx: &StageContext,
        payload: Value,
    ) -> Result<StageOutcome, StageError> {
        match stage {
            Stage::Intake => self.intake(ctx, decode(payload)?).await,
            Stage::Researcher => self.researcher(ctx, decode(payload)?).await,
            Stage::Planner => self.planner(ctx, decode(payload)?).await,
            Stage::Generator => self.generator(ctx, decode(payload)?).await,
            Stage::Deployer => self.deployer(ctx, decode(payload)?).await,
            Stage::Documents => self.documents(ctx, decode(payload)?).await,
        }
    }

    async fn intake(&self, ctx: &StageContext, job: IntakeJob) -> Result<StageOutcome, StageError> {
        ctx.progress(5, "analysis").await?;
        validate_intake(&job.intake)?;

        self.projects
            .set_status(&job.project_id, ProjectStatus::IntakeComplete)
            .map_err(StageError::transient)?;
        ctx.progress(10, "analysis").await?;

        Ok(StageOutcome {
            result: serde_json::json!({"validated": true}),
            next: Some(serde_json::to_value(ResearcherJob {
                project_id: job.project_id,
                session_id: job.session_id,
                intake: job.intake,
            })
            .map_err(StageError::transient)?),
        })
    }

    async fn researcher(
        &self,
        ctx: &StageContext,
        job: ResearcherJob,
    ) -> Result<StageOutcome, StageError> {
        self.projects
            .set_status(&job.project_id, ProjectStatus::Researching)
            .map_err(StageError::transient)?;
        ctx.progress(20, "research").await?;
        ctx.checkpoint()?;

        let research = self
            .collaborators
            .researcher
            .research(ctx, &job.intake)
            .await?;

        self.projects
            .save_research(&job.project_id, &research)
            .map_err(StageError::transient)?;
        ctx.progress(35, "research").await?;

        Ok(StageOutcome {
            result: serde_json::json!({"competitors": research.competitors.len()}),
            next: Some(serde_json::to_value(PlannerJob {
                project_id: job.project_id,
                session_id: job.session_id,
                intake: job.intake,
                research,
            })
            .map_err(StageError::transient)?),
        })
    }

    /// The Planner carries the human approval gate: with auto-approve
    /// off it persists the plan, parks the project at
    /// `awaiting_approval`, and returns no successor payload. The
    /// explicit approval action later re-enqueues the plan into the
    /// generator queue, so the gate never holds a worker slot.
    async fn planner(
        &self,
        ctx: &StageContext,
        job: PlannerJob,
    ) -> Result<StageOutcome, StageError> {
        self.projects
            .set_status(&job.project_id, ProjectStatus::Planning)
            .map_err(StageError::transient)?;
        ctx.progress(45, "planning").await?;
        ctx.checkpoint()?;

        let plan = self
            .collaborators
            .planner
            .plan(ctx, &job.intake, &job.research)
            .await?;

        self.projects
            .save_plan(&job.project_id, &plan, &plan.summary)
            .map_err(StageError::transient)?;

        if self.auto_approve_plans {
            ctx.progress(50, "planning").await?;
            Ok(StageOutcome {
                result: serde_json::json!({"summary": plan.summary, "autoApproved": true}),
                next: Some(serde_json::to_value(GeneratorJob {
                    project_id: job.project_id,
                    session_id: job.session_id,
                    intake: job.intake,
                    plan,
                })
                .map_err(StageError::transient)?),
            })
        } else {
            self.projects
                .set_status(&job.project_id, ProjectStatus::AwaitingApproval)
                .map_err(StageError::transient)?;
            ctx.progress(50, "awaiting_approval").await?;
            Ok(StageOutcome {
                result: serde_json::json!({"summary": plan.summary, "awaitingApproval": true}),
                next: None,
            })
        }
    }

    async fn generator(
        &self,
        ctx: &StageContext,
        job: GeneratorJob,
    ) -> Result<StageOutcome, StageError> {
        self.projects
            .set_status(&job.project_id, ProjectStatus::Generating)
            .map_err(StageError::transient)?;
        ctx.progress(55, "generation").await?;
        ctx.checkpoint()?;

        let site = self
            .collaborators
            .generator
            .build_site(ctx, &job.intake, &job.plan)
            .await?;
        ctx.checkpoint()?;

        self.projects
            .save_generated_site(&job.project_id, &site)
            .map_err(StageError::transient)?;
        ctx.progress(70, "generation").await?;

        Ok(StageOutcome {
            result: serde_json::json!({"files": site.files.len()}),
            next: Some(serde_json::to_value(DeployerJob {
                project_id: job.project_id,
                session_id: job.session_id,
                generated_site: site,
                company_name: job.intake.company_name,
            })
            .map_err(StageError::transient)?),
        })
    }

    async fn deployer(
        &self,
        ctx: &StageContext,
        job: DeployerJob,
    ) -> Result<StageOutcome, StageError> {
        self.projects
            .set_status(&job.project_id, ProjectStatus::Deploying)
            .map_err(StageError::transient)?;
        ctx.progress(75, "deployment").await?;
        ctx.checkpoint()?;

        let deployment = self
            .collaborators
            .deployer
            .deploy(ctx, &job.generated_site, &job.company_name)
            .await?;

        self.projects
            .save_deployment(&job.project_id, &deployment)
            .map_err(StageError::transient)?;
        ctx.progress(85, "deployment").await?;

        // The documents payload carries the earlier stage outputs; they
        // come from the durable project record, not from re-threading
        // them through every intermediate queue.
        let project = self
            .projects
            .load(&job.project_id)
            .map_err(StageError::transient)?;

        Ok(StageOutcome {
            result: serde_json::to_value(&deployment).map_err(StageError::transient)?,
            next: Some(serde_json::to_value(DocumentsJob {
                project_id: job.project_id,
                session_id: job.session_id,
                deployment_url: deployment.url,
                preview_url: deployment.preview_url,
                intake: project.intake,
                plan: project.plan.unwrap_or_default(),
                research: project.research.unwrap_or_default(),
                screenshots: job.generated_site.screenshots,
            })
            .map_err(StageError::transient)?),
        })
    }

    async fn documents(
        &self,
        ctx: &StageContext,
        job: DocumentsJob,
    ) -> Result<StageOutcome, StageError> {
        self.projects
            .set_status(&job.project_id, ProjectStatus::GeneratingDocuments)
            .map_err(StageError::transient)?;
        ctx.progress(90, "documents").await?;
        ctx.checkpoint()?;

        let documents = self
            .collaborators
            .documents
            .render(
                ctx,
                DocumentInputs {
                    intake: &job.intake,
                    research: &job.research,
                    plan: &job.plan,
                    deployment_url: &job.deployment_url,
                    preview_url: &job.preview_url,
                },
            )
            .await?;

        self.projects
            .save_documents(&job.project_id, &documents)
            .map_err(StageError::transient)?;
        self.projects
            .mark_completed(&job.project_id)
            .map_err(StageError::transient)?;
        ctx.progress(100, "completed").await?;

        let result = GenerationResult {
            pdf_url: documents.proposal_pdf_url,
            presentation_url: Some(documents.presentation_pdf_url),
            deployment_url: Some(job.deployment_url),
            preview_url: Some(job.preview_url),
            screenshots: job.screenshots,
            completed_at: chrono::Utc::now(),
        };

        Ok(StageOutcome {
            result: serde_json::to_value(result).map_err(StageError::transient)?,
            next: None,
        })
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, StageError> {
    serde_json::from_value(payload)
        .map_err(|e| StageError::Validation(format!("malformed job payload: {}", e)))
}

/// Fail malformed intake before it costs anything downstream. The
/// server runs the same check at enqueue time so callers see it as a
/// 400 rather than a failed job.
pub fn validate_intake(intake: &crate::types::ClientIntake) -> Result<(), StageError> {
    if intake.company_name.trim().is_empty() {
        return Err(StageError::validation("companyName must not be empty"));
    }
    if intake.business_type.trim().is_empty() {
        return Err(StageError::validation("businessType must not be empty"));
    }
    if intake.contact_email.trim().is_empty() || !intake.contact_email.contains('@') {
        return Err(StageError::validation("contactEmail must be a valid email"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientIntake;

    fn intake() -> ClientIntake {
        ClientIntake {
            company_name: "Glinka".to_string(),
            business_type: "Pottery studio".to_string(),
            contact_email: "aida@example.com".to_string(),
            ..ClientIntake::default()
        }
    }

    #[test]
    fn intake_validation_catches_missing_fields() {
        assert!(validate_intake(&intake()).is_ok());

        let mut missing_name = intake();
        missing_name.company_name = "  ".to_string();
        assert!(matches!(
            validate_intake(&missing_name).unwrap_err(),
            StageError::Validation(_)
        ));

        let mut bad_email = intake();
        bad_email.contact_email = "not-an-email".to_string();
        assert!(validate_intake(&bad_email).is_err());
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        let err = decode::<IntakeJob>(serde_json::json!({"nope": 1})).unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
        assert!(!err.is_retryable());
    }
}
