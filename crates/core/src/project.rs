//! # Project State Manager
//!
//! One row per pipeline run, keyed by project id. Stage workers persist
//! their outputs here before enqueuing the next stage, so a crash after
//! a stage succeeds always leaves a durable trace to recover from.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::PipelineDb;
use crate::job::types::generate_job_id;
use crate::pipeline::stage::ProjectStatus;
use crate::types::{
    ClientIntake, DeploymentResult, DocumentsResult, GeneratedSite, ProjectPlan, ResearchResult,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub session_id: String,
    pub company_name: String,
    pub status: ProjectStatus,
    pub intake: ClientIntake,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research: Option<ResearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<ProjectPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_site: Option<GeneratedSite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<DocumentsResult>,
    pub client_approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// SQLite-backed project manager.
pub struct ProjectManager {
    conn: Arc<Mutex<Connection>>,
}

impl ProjectManager {
    pub fn new(db: &PipelineDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// Create a new project record from validated intake.
    pub fn create(&self, session_id: &str, intake: &ClientIntake) -> Result<ProjectRecord> {
        let id = generate_job_id("proj");
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO projects
            (id, session_id, company_name, status, intake, client_approved,
             created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
            "#,
            params![
                id,
                session_id,
                intake.company_name,
                ProjectStatus::New.as_str(),
                serde_json::to_string(intake)?,
                now,
            ],
        )
        .context("Failed to create project")?;
        drop(conn);
        self.load(&id)
    }

    pub fn load(&self, id: &str) -> Result<ProjectRecord> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                r#"
                SELECT id, session_id, company_name, status, intake, research, plan,
                       approval_summary, generated_site, deployment, documents,
                       client_approved, failed_module, last_error,
                       created_at, updated_at, approved_at, completed_at
                FROM projects WHERE id = ?1
                "#,
                params![id],
                |row| Ok(Self::row_to_record(row)?),
            )
            .context("Project not found")?;
        Ok(record)
    }

    pub fn set_status(&self, id: &str, status: ProjectStatus) -> Result<()> {
        self.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )
    }

    pub fn save_research(&self, id: &str, research: &ResearchResult) -> Result<()> {
        self.execute(
            "UPDATE projects SET research = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(research)?, Utc::now().to_rfc3339(), id],
        )
    }

    /// Persist the plan along with the short summary shown at the
    /// approval gate.
    pub fn save_plan(&self, id: &str, plan: &ProjectPlan, summary: &str) -> Result<()> {
        self.execute(
            "UPDATE projects SET plan = ?1, approval_summary = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                serde_json::to_string(plan)?,
                summary,
                Utc::now().to_rfc3339(),
                id
            ],
        )
    }

    pub fn save_generated_site(&self, id: &str, site: &GeneratedSite) -> Result<()> {
        self.execute(
            "UPDATE projects SET generated_site = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(site)?, Utc::now().to_rfc3339(), id],
        )
    }

    pub fn save_deployment(&self, id: &str, deployment: &DeploymentResult) -> Result<()> {
        self.execute(
            "UPDATE projects SET deployment = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(deployment)?, Utc::now().to_rfc3339(), id],
        )
    }

    pub fn save_documents(&self, id: &str, documents: &DocumentsResult) -> Result<()> {
        self.execute(
            "UPDATE projects SET documents = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(documents)?, Utc::now().to_rfc3339(), id],
        )
    }

    /// Release the approval gate. The caller re-enqueues the plan into
    /// the generator queue; this only records the decision.
    pub fn approve(&self, id: &str) -> Result<()> {
        self.execute(
            r#"
            UPDATE projects
            SET client_approved = 1, approved_at = ?1, status = ?2, updated_at = ?1
            WHERE id = ?3
            "#,
            params![
                Utc::now().to_rfc3339(),
                ProjectStatus::Approved.as_str(),
                id
            ],
        )
    }

    pub fn mark_completed(&self, id: &str) -> Result<()> {
        self.execute(
            "UPDATE projects SET status = ?1, completed_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![
                ProjectStatus::Completed.as_str(),
                Utc::now().to_rfc3339(),
                id
            ],
        )
    }

    /// Terminal failure. Records which module died separately from the
    /// error text for operational triage.
    pub fn mark_failed(&self, id: &str, module: &str, error: &str) -> Result<()> {
        self.execute(
            r#"
            UPDATE projects
            SET status = ?1, failed_module = ?2, last_error = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
            params![
                ProjectStatus::Failed.as_str(),
                module,
                error,
                Utc::now().to_rfc3339(),
                id
            ],
        )
    }

    fn execute(&self, sql: &str, values: impl rusqlite::Params) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn.execute(sql, values)?;
        if affected == 0 {
            anyhow::bail!("Project not found");
        }
        Ok(())
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ProjectRecord> {
        let status: String = row.get(3)?;
        let intake: String = row.get(4)?;
        let research: Option<String> = row.get(5)?;
        let plan: Option<String> = row.get(6)?;
        let generated_site: Option<String> = row.get(8)?;
        let deployment: Option<String> = row.get(9)?;
        let documents: Option<String> = row.get(10)?;
        let created_at: String = row.get(14)?;
        let updated_at: String = row.get(15)?;
        let approved_at: Option<String> = row.get(16)?;
        let completed_at: Option<String> = row.get(17)?;

        Ok(ProjectRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            company_name: row.get(2)?,
            status: ProjectStatus::from_str(&status).unwrap_or(ProjectStatus::New),
            intake: serde_json::from_str(&intake).unwrap_or_default(),
            research: research.and_then(|s| serde_json::from_str(&s).ok()),
            plan: plan.and_then(|s| serde_json::from_str(&s).ok()),
            approval_summary: row.get(7)?,
            generated_site: generated_site.and_then(|s| serde_json::from_str(&s).ok()),
            deployment: deployment.and_then(|s| serde_json::from_str(&s).ok()),
            documents: documents.and_then(|s| serde_json::from_str(&s).ok()),
            client_approved: row.get::<_, i64>(11)? != 0,
            failed_module: row.get(12)?,
            last_error: row.get(13)?,
            created_at: parse_time(&created_at),
            updated_at: parse_time(&updated_at),
            approved_at: approved_at.map(|t| parse_time(&t)),
            completed_at: completed_at.map(|t| parse_time(&t)),
        })
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_intake() -> ClientIntake {
        ClientIntake {
            company_name: "Glinka".to_string(),
            business_type: "Pottery studio".to_string(),
            contact_name: "Aida".to_string(),
            contact_email: "aida@example.com".to_string(),
            ..ClientIntake::default()
        }
    }

    #[test]
    fn create_load_and_advance() {
        let db = PipelineDb::open_in_memory().unwrap();
        let mgr = ProjectManager::new(&db);

        let project = mgr.create("sess-1", &test_intake()).unwrap();
        assert_eq!(project.status, ProjectStatus::New);
        assert_eq!(project.company_name, "Glinka");
        assert!(!project.client_approved);

        mgr.set_status(&project.id, ProjectStatus::Researching).unwrap();
        mgr.save_research(&project.id, &ResearchResult::default()).unwrap();

        let loaded = mgr.load(&project.id).unwrap();
        assert_eq!(loaded.status, ProjectStatus::Researching);
        assert!(loaded.research.is_some());
    }

    #[test]
    fn approval_gate_records_decision() {
        let db = PipelineDb::open_in_memory().unwrap();
        let mgr = ProjectManager::new(&db);
        let project = mgr.create("sess-1", &test_intake()).unwrap();

        let plan = ProjectPlan {
            summary: "Five-page pottery showcase".to_string(),
            ..ProjectPlan::default()
        };
        mgr.save_plan(&project.id, &plan, "Five-page pottery showcase").unwrap();
        mgr.set_status(&project.id, ProjectStatus::AwaitingApproval).unwrap();
        mgr.approve(&project.id).unwrap();

        let loaded = mgr.load(&project.id).unwrap();
        assert!(loaded.client_approved);
        assert!(loaded.approved_at.is_some());
        assert_eq!(loaded.status, ProjectStatus::Approved);
        assert_eq!(
            loaded.approval_summary.as_deref(),
            Some("Five-page pottery showcase")
        );
    }

    #[test]
    fn failure_records_module_and_error_separately() {
        let db = PipelineDb::open_in_memory().unwrap();
        let mgr = ProjectManager::new(&db);
        let project = mgr.create("sess-1", &test_intake()).unwrap();

        mgr.mark_failed(&project.id, "deployer", "target unreachable").unwrap();
        let loaded = mgr.load(&project.id).unwrap();
        assert_eq!(loaded.status, ProjectStatus::Failed);
        assert_eq!(loaded.failed_module.as_deref(), Some("deployer"));
        assert_eq!(loaded.last_error.as_deref(), Some("target unreachable"));
    }

    #[test]
    fn missing_project_is_an_error() {
        let db = PipelineDb::open_in_memory().unwrap();
        let mgr = ProjectManager::new(&db);
        assert!(mgr.load("proj-missing").is_err());
        assert!(mgr.set_status("proj-missing", ProjectStatus::Failed).is_err());
    }
}
