//! End-to-end pipeline runs against the embedded worker runtime, with
//! scripted collaborators where a scenario needs a stage to ask a
//! question or park until cancelled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use propgen_core::channel::{AnswerWaiters, ChannelHub, ClientEvent, SessionRegistry};
use propgen_core::collaborators::{Collaborators, PlanProvider, SiteBuilder};
use propgen_core::config::PipelineConfig;
use propgen_core::db::PipelineDb;
use propgen_core::error::StageError;
use propgen_core::job::{CancelOutcome, JobStore};
use propgen_core::pipeline::{PipelineRuntime, StageContext};
use propgen_core::project::ProjectManager;
use propgen_core::types::{
    ClientIntake, GeneratedSite, GeneratorJob, ProjectPlan, Question, ResearchResult,
};

const SESSION: &str = "sess-1";

struct Harness {
    store: Arc<JobStore>,
    projects: Arc<ProjectManager>,
    hub: Arc<ChannelHub>,
    browser: mpsc::Receiver<ClientEvent>,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start(collaborators: Collaborators, config: PipelineConfig) -> Self {
        let db = PipelineDb::open_in_memory().unwrap();
        let store = Arc::new(JobStore::new(&db, config.clone()));
        let projects = Arc::new(ProjectManager::new(&db));
        let registry = Arc::new(SessionRegistry::new());
        let waiters = Arc::new(AnswerWaiters::new());

        let (hub, events_rx) = ChannelHub::new(Arc::clone(&store), registry, Arc::clone(&waiters));
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&hub).run(events_rx, shutdown.clone()));

        let runtime = Arc::new(PipelineRuntime::new(
            Arc::clone(&store),
            Arc::clone(&projects),
            hub.registry(),
            waiters,
            collaborators,
            hub.events_sender(),
            config,
        ));
        runtime.spawn(shutdown.clone());

        let (tx, browser) = mpsc::channel(128);
        hub.registry().register_session(SESSION, tx).await;

        Self {
            store,
            projects,
            hub,
            browser,
            shutdown,
        }
    }

    /// What the server's start-generation endpoint does: create the
    /// project, enqueue the intake job, bind it to the session.
    async fn submit(&self, intake: &ClientIntake) -> (String, String) {
        let project = self.projects.create(SESSION, intake).unwrap();
        let payload = serde_json::json!({
            "projectId": project.id,
            "sessionId": SESSION,
            "intake": intake,
        });
        let job = self.store.enqueue("intake", payload).unwrap();
        self.hub.registry().bind_job(&job.id, SESSION).await;
        (job.id, project.id)
    }

    async fn next_event(&mut self) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(10), self.browser.recv())
            .await
            .expect("timed out waiting for a channel event")
            .expect("channel closed")
    }

    async fn wait_for_completed(&mut self) -> (String, serde_json::Value) {
        loop {
            if let ClientEvent::Completed { job_id, result } = self.next_event().await {
                return (job_id, result);
            }
        }
    }

    async fn wait_for_question(&mut self) -> (String, Question) {
        loop {
            if let ClientEvent::Question { job_id, question } = self.next_event().await {
                return (job_id, question);
            }
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        backoff_base: Duration::from_millis(10),
        question_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        maintenance_interval: Duration::from_millis(100),
        auto_approve_plans: true,
        ..PipelineConfig::default()
    }
}

fn glinka_intake() -> ClientIntake {
    ClientIntake {
        company_name: "Glinka".to_string(),
        business_type: "Pottery studio".to_string(),
        contact_name: "Aida".to_string(),
        contact_email: "aida@example.com".to_string(),
        ..ClientIntake::default()
    }
}

// === Scenario A: full run to a completed result ===

#[tokio::test]
async fn full_run_yields_pdf_url_and_screenshots() {
    let mut harness = Harness::start(Collaborators::placeholder(), fast_config()).await;
    let (_job_id, project_id) = harness.submit(&glinka_intake()).await;

    let (_final_job, result) = harness.wait_for_completed().await;

    let pdf_url = result["pdfUrl"].as_str().expect("pdfUrl must be a string");
    assert!(!pdf_url.is_empty());
    // Possibly empty, but always an array.
    assert!(result["screenshots"].is_array());

    // The researcher job carried the same intake forward.
    let researcher_jobs = harness.store.jobs_in_queue("researcher").unwrap();
    assert_eq!(researcher_jobs.len(), 1);
    assert_eq!(researcher_jobs[0].payload["intake"]["companyName"], "Glinka");
    assert_eq!(
        researcher_jobs[0].payload["intake"]["businessType"],
        "Pottery studio"
    );

    let project = harness.projects.load(&project_id).unwrap();
    assert!(project.completed_at.is_some());
    assert!(project.documents.is_some());
}

#[tokio::test]
async fn progress_events_are_monotone_across_the_run() {
    let mut harness = Harness::start(Collaborators::placeholder(), fast_config()).await;
    harness.submit(&glinka_intake()).await;

    let mut last = 0u8;
    loop {
        match harness.next_event().await {
            ClientEvent::Progress { progress, .. } => {
                assert!(progress >= last, "progress went backwards: {} < {}", progress, last);
                last = progress;
            }
            ClientEvent::Completed { .. } => break,
            ClientEvent::Failed { error, .. } => panic!("run failed: {}", error),
            _ => {}
        }
    }
    assert_eq!(last, 100);
}

// === Scenario B: mismatched answer, timeout, retry ===

struct AskingPlanner;

#[async_trait]
impl PlanProvider for AskingPlanner {
    async fn plan(
        &self,
        ctx: &StageContext,
        intake: &ClientIntake,
        _research: &ResearchResult,
    ) -> Result<ProjectPlan, StageError> {
        let palette = ctx.ask(Question::new("Q1", "Which color palette?")).await?;
        Ok(ProjectPlan {
            summary: format!("{} site in {}", intake.company_name, palette),
            ..ProjectPlan::default()
        })
    }
}

#[tokio::test]
async fn mismatched_answer_leaves_wait_pending_until_timeout_retry() {
    let collaborators = Collaborators {
        planner: Arc::new(AskingPlanner),
        ..Collaborators::placeholder()
    };
    let mut harness = Harness::start(collaborators, fast_config()).await;
    harness.submit(&glinka_intake()).await;

    let (planner_job, question) = harness.wait_for_question().await;
    assert_eq!(question.id, "Q1");
    let first_attempt = harness.store.get(&planner_job).unwrap().unwrap().attempts_made;
    assert_eq!(first_attempt, 1);

    // Answer with the wrong correlation id: recorded, never delivered.
    let receipt = harness.hub.submit_answer(&planner_job, "Q2", "teal").unwrap();
    assert!(receipt.recorded);
    assert!(!receipt.delivered);

    // The wait times out, the attempt fails, and the retry re-asks.
    let (retry_job, question) = harness.wait_for_question().await;
    assert_eq!(retry_job, planner_job);
    assert_eq!(question.id, "Q1");
    let job = harness.store.get(&planner_job).unwrap().unwrap();
    assert_eq!(job.attempts_made, first_attempt + 1);
    assert_eq!(job.payload["answers"]["Q2"], "teal");

    // A matching answer resumes the stage and the run finishes.
    let receipt = harness.hub.submit_answer(&planner_job, "Q1", "terracotta").unwrap();
    assert!(receipt.delivered);
    let (_job, result) = harness.wait_for_completed().await;
    assert!(result["pdfUrl"].as_str().is_some());

    let plan_summary = harness.store.get(&planner_job).unwrap().unwrap();
    assert_eq!(plan_summary.result.unwrap()["summary"], "Glinka site in terracotta");
}

// === Scenario C: cooperative cancellation mid-generator ===

struct ParkedGenerator;

#[async_trait]
impl SiteBuilder for ParkedGenerator {
    async fn build_site(
        &self,
        ctx: &StageContext,
        _intake: &ClientIntake,
        _plan: &ProjectPlan,
    ) -> Result<GeneratedSite, StageError> {
        ctx.progress(60, "generation").await?;
        // Simulate a long external call with checkpoints between chunks.
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.checkpoint()?;
        }
        Ok(GeneratedSite::default())
    }
}

#[tokio::test]
async fn cancel_mid_generator_terminates_without_a_deployer_job() {
    let collaborators = Collaborators {
        generator: Arc::new(ParkedGenerator),
        ..Collaborators::placeholder()
    };
    let mut harness = Harness::start(collaborators, fast_config()).await;
    let (_job, project_id) = harness.submit(&glinka_intake()).await;

    // Wait until the generator reports its in-stage progress marker.
    let generator_job = loop {
        if let ClientEvent::Progress {
            job_id, progress, ..
        } = harness.next_event().await
        {
            if progress == 60 {
                break job_id;
            }
        }
    };

    let outcome = harness.hub.cancel(&generator_job).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Flagged);

    // The next checkpoint observes the flag and the run dies there.
    loop {
        if let ClientEvent::Failed { job_id, error } = harness.next_event().await {
            assert_eq!(job_id, generator_job);
            assert!(error.contains("cancelled"));
            break;
        }
    }

    assert!(harness.store.jobs_in_queue("deployer").unwrap().is_empty());
    let project = harness.projects.load(&project_id).unwrap();
    assert_eq!(project.failed_module.as_deref(), Some("generator"));
}

// === Approval gate ===

#[tokio::test]
async fn approval_gate_holds_the_run_until_released() {
    let config = PipelineConfig {
        auto_approve_plans: false,
        ..fast_config()
    };
    let mut harness = Harness::start(Collaborators::placeholder(), config).await;
    let (_job, project_id) = harness.submit(&glinka_intake()).await;

    // The planner parks the project instead of handing off.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let project = harness.projects.load(&project_id).unwrap();
        if project.status == propgen_core::pipeline::ProjectStatus::AwaitingApproval {
            assert!(project.plan.is_some());
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "gate never reached");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(harness.store.jobs_in_queue("generator").unwrap().is_empty());

    // What the approval endpoint does: record the decision and
    // re-enqueue the plan into the generator queue.
    let project = harness.projects.load(&project_id).unwrap();
    harness.projects.approve(&project_id).unwrap();
    let payload = serde_json::to_value(GeneratorJob {
        project_id: project.id.clone(),
        session_id: project.session_id.clone(),
        intake: project.intake,
        plan: project.plan.unwrap(),
    })
    .unwrap();
    let job = harness.store.enqueue("generator", payload).unwrap();
    harness.hub.registry().bind_job(&job.id, SESSION).await;

    let (_job, result) = harness.wait_for_completed().await;
    assert!(result["pdfUrl"].as_str().is_some());
}
