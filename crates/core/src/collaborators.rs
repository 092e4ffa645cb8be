//! # External Collaborators
//!
//! Seams for the replaceable stage content: research, planning, site
//! generation, deployment and document rendering. The orchestration
//! core only depends on these traits; the placeholder implementations
//! produce deterministic offline content so the pipeline runs without
//! any external services wired in.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::StageError;
use crate::pipeline::context::StageContext;
use crate::types::{
    ClientIntake, DeploymentResult, DocumentsResult, GeneratedFile, GeneratedSite, ProjectPlan,
    ResearchResult, SitePage,
};

#[async_trait]
pub trait ResearchProvider: Send + Sync {
    async fn research(
        &self,
        ctx: &StageContext,
        intake: &ClientIntake,
    ) -> Result<ResearchResult, StageError>;
}

#[async_trait]
pub trait PlanProvider: Send + Sync {
    async fn plan(
        &self,
        ctx: &StageContext,
        intake: &ClientIntake,
        research: &ResearchResult,
    ) -> Result<ProjectPlan, StageError>;
}

#[async_trait]
pub trait SiteBuilder: Send + Sync {
    async fn build_site(
        &self,
        ctx: &StageContext,
        intake: &ClientIntake,
        plan: &ProjectPlan,
    ) -> Result<GeneratedSite, StageError>;
}

#[async_trait]
pub trait DeployTarget: Send + Sync {
    async fn deploy(
        &self,
        ctx: &StageContext,
        site: &GeneratedSite,
        company_name: &str,
    ) -> Result<DeploymentResult, StageError>;
}

/// Inputs the document renderer needs, bundled so the trait stays flat.
pub struct DocumentInputs<'a> {
    pub intake: &'a ClientIntake,
    pub research: &'a ResearchResult,
    pub plan: &'a ProjectPlan,
    pub deployment_url: &'a str,
    pub preview_url: &'a str,
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(
        &self,
        ctx: &StageContext,
        inputs: DocumentInputs<'_>,
    ) -> Result<DocumentsResult, StageError>;
}

/// The full collaborator set handed to the worker pools.
#[derive(Clone)]
pub struct Collaborators {
    pub researcher: Arc<dyn ResearchProvider>,
    pub planner: Arc<dyn PlanProvider>,
    pub generator: Arc<dyn SiteBuilder>,
    pub deployer: Arc<dyn DeployTarget>,
    pub documents: Arc<dyn DocumentRenderer>,
}

impl Collaborators {
    /// Deterministic offline implementations, used as the default stack
    /// and by the integration tests.
    pub fn placeholder() -> Self {
        Self {
            researcher: Arc::new(PlaceholderResearcher),
            planner: Arc::new(PlaceholderPlanner),
            generator: Arc::new(PlaceholderGenerator),
            deployer: Arc::new(PlaceholderDeployer),
            documents: Arc::new(PlaceholderDocuments),
        }
    }
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    slug.trim_matches('-').to_string()
}

pub struct PlaceholderResearcher;

#[async_trait]
impl ResearchProvider for PlaceholderResearcher {
    async fn research(
        &self,
        _ctx: &StageContext,
        intake: &ClientIntake,
    ) -> Result<ResearchResult, StageError> {
        Ok(ResearchResult {
            competitors: Vec::new(),
            industry_trends: vec![format!(
                "{} businesses increasingly sell through their own sites",
                intake.business_type
            )],
            target_audience_insights: vec![format!(
                "Audience: {}",
                if intake.target_audience.is_empty() {
                    "local customers"
                } else {
                    &intake.target_audience
                }
            )],
            recommendations: vec![
                "Lead with work samples above the fold".to_string(),
                "Keep the contact form to three fields".to_string(),
            ],
        })
    }
}

pub struct PlaceholderPlanner;

#[async_trait]
impl PlanProvider for PlaceholderPlanner {
    async fn plan(
        &self,
        _ctx: &StageContext,
        intake: &ClientIntake,
        _research: &ResearchResult,
    ) -> Result<ProjectPlan, StageError> {
        Ok(ProjectPlan {
            summary: format!(
                "Showcase site for {} ({})",
                intake.company_name, intake.business_type
            ),
            epics: Vec::new(),
            site_structure: vec![
                SitePage {
                    name: "Home".to_string(),
                    path: "/".to_string(),
                    purpose: "First impression and key offer".to_string(),
                },
                SitePage {
                    name: "Contact".to_string(),
                    path: "/contact".to_string(),
                    purpose: "Lead capture".to_string(),
                },
            ],
            estimated_features: vec!["gallery".to_string(), "contact form".to_string()],
        })
    }
}

pub struct PlaceholderGenerator;

#[async_trait]
impl SiteBuilder for PlaceholderGenerator {
    async fn build_site(
        &self,
        _ctx: &StageContext,
        intake: &ClientIntake,
        plan: &ProjectPlan,
    ) -> Result<GeneratedSite, StageError> {
        let slug = slugify(&intake.company_name);
        let files = plan
            .site_structure
            .iter()
            .map(|page| GeneratedFile {
                path: if page.path == "/" {
                    "index.html".to_string()
                } else {
                    format!("{}.html", page.path.trim_start_matches('/'))
                },
                content: format!(
                    "<html><head><title>{} | {}</title></head><body><h1>{}</h1></body></html>",
                    page.name, intake.company_name, page.purpose
                ),
            })
            .collect();
        Ok(GeneratedSite {
            project_path: format!("/tmp/propgen/{}", slug),
            files,
            screenshots: Vec::new(),
        })
    }
}

pub struct PlaceholderDeployer;

#[async_trait]
impl DeployTarget for PlaceholderDeployer {
    async fn deploy(
        &self,
        _ctx: &StageContext,
        _site: &GeneratedSite,
        company_name: &str,
    ) -> Result<DeploymentResult, StageError> {
        let slug = slugify(company_name);
        Ok(DeploymentResult {
            url: format!("https://{}.demo.propgen.dev", slug),
            preview_url: format!("https://preview-{}.demo.propgen.dev", slug),
            deployment_id: format!("deploy-{}", slug),
        })
    }
}

pub struct PlaceholderDocuments;

#[async_trait]
impl DocumentRenderer for PlaceholderDocuments {
    async fn render(
        &self,
        _ctx: &StageContext,
        inputs: DocumentInputs<'_>,
    ) -> Result<DocumentsResult, StageError> {
        let slug = slugify(&inputs.intake.company_name);
        Ok(DocumentsResult {
            proposal_pdf_url: format!("/artifacts/{}/proposal.pdf", slug),
            presentation_pdf_url: format!("/artifacts/{}/presentation.pdf", slug),
            email_sent: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_strips_punctuation() {
        assert_eq!(slugify("Glinka Pottery & Co."), "glinka-pottery---co");
        assert_eq!(slugify("  "), "");
    }
}
