//! propgen server
//!
//! Axum process hosting the generation REST API, the WebSocket push
//! channel, and the embedded stage worker runtime.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::{mpsc, RwLock},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::{OpenApi, ToSchema};

use propgen_core::channel::{AnswerWaiters, BrowserCommand, ChannelHub, SessionRegistry};
use propgen_core::collaborators::Collaborators;
use propgen_core::config::PipelineConfig;
use propgen_core::db::PipelineDb;
use propgen_core::job::JobStore;
use propgen_core::pipeline::{validate_intake, PipelineRuntime, ProjectStatus, Stage};
use propgen_core::project::ProjectManager;
use propgen_core::status::project_status;
use propgen_core::types::{ClientIntake, GeneratorJob};

mod ws;

/// Application state, created at server start and torn down at
/// shutdown. All routing maps live behind the hub's injected registry.
pub struct AppState {
    pub store: Arc<JobStore>,
    pub projects: Arc<ProjectManager>,
    pub hub: Arc<ChannelHub>,
    pub worker_secret: String,
    /// The connected external worker peer, if any. Browser commands are
    /// forwarded here best-effort.
    pub worker_tx: RwLock<Option<mpsc::Sender<BrowserCommand>>>,
}

impl AppState {
    pub async fn forward_to_worker(&self, cmd: BrowserCommand) {
        let tx = self.worker_tx.read().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(cmd).await;
        }
    }

    /// Clear the worker sender, but only if it is still the one the
    /// calling connection installed. A stale connection tearing down
    /// must not clobber a newer peer's sender.
    pub async fn clear_worker_tx(&self, tx: &mpsc::Sender<BrowserCommand>) {
        let mut guard = self.worker_tx.write().await;
        if guard.as_ref().is_some_and(|current| current.same_channel(tx)) {
            *guard = None;
        }
    }
}

pub type SharedState = Arc<AppState>;

// === API Types ===

#[derive(Deserialize, ToSchema)]
struct StartGenerationRequest {
    session_id: String,
    #[schema(value_type = Object)]
    intake: serde_json::Value,
}

#[derive(Serialize, ToSchema)]
struct StartGenerationResponse {
    job_id: String,
    project_id: String,
}

#[derive(Serialize, ToSchema)]
struct StatusResponse {
    state: String,
    progress: u8,
    current_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    question: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize, ToSchema)]
struct AnswerRequest {
    job_id: String,
    question_id: String,
    answer: String,
}

#[derive(Serialize, ToSchema)]
struct AnswerResponse {
    recorded: bool,
    delivered: bool,
}

#[derive(Serialize, ToSchema)]
struct CancelResponse {
    accepted: bool,
    outcome: String,
}

#[derive(Serialize, ToSchema)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Json<Self> {
        Json(Self { error: msg.into() })
    }
}

#[derive(Serialize, ToSchema)]
struct ApproveResponse {
    job_id: String,
    project_id: String,
}

// === OpenAPI Definition ===

#[derive(OpenApi)]
#[openapi(
    info(
        title = "propgen API",
        version = "1.0.0",
        description = "Commercial-proposal generation pipeline"
    ),
    paths(
        start_generation,
        get_generation_status,
        cancel_generation,
        submit_answer,
        approve_plan
    ),
    components(schemas(
        StartGenerationRequest,
        StartGenerationResponse,
        StatusResponse,
        AnswerRequest,
        AnswerResponse,
        CancelResponse,
        ApproveResponse,
        ApiError
    )),
    tags(
        (name = "generation", description = "Pipeline run management")
    )
)]
struct ApiDoc;

// === API Handlers ===

/// Start a pipeline run from client intake
#[utoipa::path(
    post,
    path = "/api/v1/generation",
    tag = "generation",
    request_body = StartGenerationRequest,
    responses(
        (status = 200, description = "Run started", body = StartGenerationResponse),
        (status = 400, description = "Invalid intake", body = ApiError)
    )
)]
async fn start_generation(
    State(state): State<SharedState>,
    Json(req): Json<StartGenerationRequest>,
) -> Result<Json<StartGenerationResponse>, (StatusCode, Json<ApiError>)> {
    let intake: ClientIntake = serde_json::from_value(req.intake)
        .map_err(|e| (StatusCode::BAD_REQUEST, ApiError::new(format!("malformed intake: {}", e))))?;

    // Malformed intake fails here, not inside a stage.
    validate_intake(&intake)
        .map_err(|e| (StatusCode::BAD_REQUEST, ApiError::new(e.to_string())))?;

    if req.session_id.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, ApiError::new("session_id required")));
    }

    let project = state
        .projects
        .create(&req.session_id, &intake)
        .map_err(internal)?;
    let payload = serde_json::json!({
        "projectId": project.id,
        "sessionId": req.session_id,
        "intake": intake,
    });
    let job = state
        .store
        .enqueue(Stage::Intake.queue(), payload)
        .map_err(internal)?;
    state.hub.registry().bind_job(&job.id, &req.session_id).await;

    info!(job_id = %job.id, project_id = %project.id, "generation started");
    Ok(Json(StartGenerationResponse {
        job_id: job.id,
        project_id: project.id,
    }))
}

/// Poll the projected status of a job
#[utoipa::path(
    get,
    path = "/api/v1/generation/{job_id}/status",
    tag = "generation",
    params(("job_id" = String, Path, description = "Queue job id")),
    responses(
        (status = 200, description = "Projected status", body = StatusResponse),
        (status = 404, description = "Unknown job", body = ApiError)
    )
)]
async fn get_generation_status(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ApiError>)> {
    let job = state
        .store
        .get(&job_id)
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, ApiError::new("job not found")))?;

    let status = project_status(&job);
    Ok(Json(StatusResponse {
        state: serde_json::to_value(status.state)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default(),
        progress: status.progress,
        current_step: status.current_step,
        question: status
            .question
            .and_then(|q| serde_json::to_value(q).ok()),
        result: status.result,
        error: status.error,
    }))
}

/// Request cancellation of a run
#[utoipa::path(
    post,
    path = "/api/v1/generation/{job_id}/cancel",
    tag = "generation",
    params(("job_id" = String, Path, description = "Queue job id")),
    responses(
        (status = 200, description = "Cancellation outcome", body = CancelResponse)
    )
)]
async fn cancel_generation(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, (StatusCode, Json<ApiError>)> {
    let outcome = state.hub.cancel(&job_id).await.map_err(internal)?;
    state
        .forward_to_worker(BrowserCommand::Cancel {
            job_id: job_id.clone(),
        })
        .await;
    Ok(Json(CancelResponse {
        accepted: outcome.accepted(),
        outcome: format!("{:?}", outcome).to_lowercase(),
    }))
}

/// Submit an answer to an outstanding question
#[utoipa::path(
    post,
    path = "/api/v1/generation/answer",
    tag = "generation",
    request_body = AnswerRequest,
    responses(
        (status = 200, description = "Answer receipt", body = AnswerResponse),
        (status = 404, description = "Unknown job", body = ApiError)
    )
)]
async fn submit_answer(
    State(state): State<SharedState>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<AnswerResponse>, (StatusCode, Json<ApiError>)> {
    let receipt = state
        .hub
        .submit_answer(&req.job_id, &req.question_id, &req.answer)
        .map_err(internal)?;
    if !receipt.recorded {
        return Err((StatusCode::NOT_FOUND, ApiError::new("job not found")));
    }
    state
        .forward_to_worker(BrowserCommand::Answer {
            job_id: req.job_id,
            question_id: req.question_id,
            answer: req.answer,
        })
        .await;
    Ok(Json(AnswerResponse {
        recorded: receipt.recorded,
        delivered: receipt.delivered,
    }))
}

/// Release the plan approval gate
#[utoipa::path(
    post,
    path = "/api/v1/generation/{project_id}/approve",
    tag = "generation",
    params(("project_id" = String, Path, description = "Project id")),
    responses(
        (status = 200, description = "Generator job enqueued", body = ApproveResponse),
        (status = 409, description = "Project not awaiting approval", body = ApiError)
    )
)]
async fn approve_plan(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
) -> Result<Json<ApproveResponse>, (StatusCode, Json<ApiError>)> {
    let project = state
        .projects
        .load(&project_id)
        .map_err(|_| (StatusCode::NOT_FOUND, ApiError::new("project not found")))?;

    if project.status != ProjectStatus::AwaitingApproval {
        return Err((
            StatusCode::CONFLICT,
            ApiError::new(format!(
                "project is {}, not awaiting approval",
                project.status.as_str()
            )),
        ));
    }
    let Some(plan) = project.plan else {
        return Err((StatusCode::CONFLICT, ApiError::new("project has no plan")));
    };

    state.projects.approve(&project_id).map_err(internal)?;

    let payload = serde_json::to_value(GeneratorJob {
        project_id: project.id.clone(),
        session_id: project.session_id.clone(),
        intake: project.intake,
        plan,
    })
    .map_err(internal)?;
    let job = state
        .store
        .enqueue(Stage::Generator.queue(), payload)
        .map_err(internal)?;
    state
        .hub
        .registry()
        .bind_job(&job.id, &project.session_id)
        .await;

    info!(project_id = %project.id, job_id = %job.id, "plan approved");
    Ok(Json(ApproveResponse {
        job_id: job.id,
        project_id: project.id,
    }))
}

async fn serve_openapi() -> impl IntoResponse {
    let spec = ApiDoc::openapi().to_json().unwrap_or_default();
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(spec))
        .unwrap()
}

fn internal(err: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    warn!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        ApiError::new("internal error"),
    )
}

// === CLI ===

#[derive(Parser)]
#[command(name = "propgen", about = "Commercial-proposal generation pipeline server")]
struct Args {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start the propgen server (default)
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// SQLite database path
        #[arg(long)]
        db: Option<PathBuf>,
        /// Skip the plan approval gate
        #[arg(long)]
        auto_approve: bool,
    },
}

// === Server Entry ===

async fn run_server(port: u16, db_path: PathBuf, auto_approve: bool) -> anyhow::Result<()> {
    let config = PipelineConfig {
        auto_approve_plans: auto_approve,
        ..PipelineConfig::default()
    };

    let worker_secret = std::env::var("WORKER_SECRET").unwrap_or_else(|_| {
        warn!("WORKER_SECRET not set, external worker peers are disabled");
        String::new()
    });

    let db = PipelineDb::open_at(&db_path)?;
    let store = Arc::new(JobStore::new(&db, config.clone()));
    let projects = Arc::new(ProjectManager::new(&db));
    let registry = Arc::new(SessionRegistry::new());
    let waiters = Arc::new(AnswerWaiters::new());

    let (hub, events_rx) = ChannelHub::new(Arc::clone(&store), registry, Arc::clone(&waiters));
    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&hub).run(events_rx, shutdown.clone()));

    // Any leases orphaned by a previous process go straight back to the
    // queue instead of waiting out the reaper interval.
    match store.reap_expired_leases() {
        Ok(n) if n > 0 => warn!(count = n, "recovered jobs from a previous run"),
        Ok(_) => {}
        Err(e) => warn!("startup lease recovery failed: {}", e),
    }

    let runtime = Arc::new(PipelineRuntime::new(
        Arc::clone(&store),
        Arc::clone(&projects),
        hub.registry(),
        waiters,
        Collaborators::placeholder(),
        hub.events_sender(),
        config,
    ));
    runtime.spawn(shutdown.clone());

    let state: SharedState = Arc::new(AppState {
        store,
        projects,
        hub,
        worker_secret,
        worker_tx: RwLock::new(None),
    });

    let generation_routes = Router::new()
        .route("/", post(start_generation))
        .route("/answer", post(submit_answer))
        .route("/:job_id/status", get(get_generation_status))
        .route("/:job_id/cancel", post(cancel_generation))
        .route("/:project_id/approve", post(approve_plan));

    let app = Router::new()
        .nest("/api/v1/generation", generation_routes)
        .route("/api/v1/openapi.json", get(serve_openapi))
        .route("/ws", get(ws::websocket_handler))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("propgen server listening on http://{}", addr);
    info!("  REST: /api/v1/generation, /api/v1/openapi.json");
    info!("  Push: /ws?session_id=... (browser), /ws?token=... (worker)");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    shutdown.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let (port, db, auto_approve) = match args.command {
        Some(CliCommand::Serve {
            port,
            db,
            auto_approve,
        }) => (port, db, auto_approve),
        None => (8080, None, false),
    };

    let db_path = db
        .or_else(|| std::env::var("PROPGEN_DB").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".propgen/pipeline.db"));
    let auto_approve = auto_approve
        || std::env::var("AUTO_APPROVE_PLANS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

    run_server(port, db_path, auto_approve).await
}
