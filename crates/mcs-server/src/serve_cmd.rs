//! HTTP API surface for the coordination server, per spec §4.8/§6.
//!
//! Every `/v1/*` route requires a Bearer token compared in constant time
//! against the configured secret; `/health*` is unauthenticated so an
//! orchestrator (e.g. a container runtime) can probe liveness without a
//! credential.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use mcs_core::{Auditor, LlmGateway, LockManager, McsError, Planner, ResultHandler, Scheduler, WorkerReport};
use mcs_db::models::{AggregateStatus, TaskStatus};
use mcs_db::queries::projects as project_queries;
use mcs_db::queries::tasks as task_queries;

// ---------------------------------------------------------------------------
// App state / error type
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<mcs_core::Config>,
    pub gateway: Arc<dyn LlmGateway>,
}

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<McsError> for AppError {
    fn from(err: McsError) -> Self {
        let status = match &err {
            McsError::Validation(_) => StatusCode::BAD_REQUEST,
            McsError::Auth => StatusCode::UNAUTHORIZED,
            McsError::Conflict(_) => StatusCode::CONFLICT,
            McsError::NotFound(_) => StatusCode::NOT_FOUND,
            McsError::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

async fn require_bearer_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let authorized = match presented {
        Some(token) => {
            let expected = state.config.auth_token.as_bytes();
            let got = token.as_bytes();
            got.len() == expected.len() && bool::from(got.ct_eq(expected))
        }
        None => false,
    };

    if authorized {
        next.run(request).await
    } else {
        AppError::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub user_request: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub step_id: String,
    pub role: String,
    pub status: TaskStatus,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub workflow_id: Uuid,
    pub name: String,
    pub tasks: Vec<TaskSummary>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ReadyQuery {
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct FileLeaseView {
    pub path: String,
    pub mode: mcs_db::models::FileLockMode,
}

#[derive(Debug, Serialize)]
pub struct ReadyTaskResponse {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: String,
    pub description: String,
    pub role: String,
    pub rework_note: Option<String>,
    pub file_leases: Vec<FileLeaseView>,
}

#[derive(Debug, Deserialize)]
pub struct RaStep {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub observation: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
pub struct ResultRequest {
    pub workflow_id: Uuid,
    pub step_id: String,
    pub worker_id: String,
    pub status: ReportedStatus,
    pub final_result: String,
    #[serde(default)]
    pub ra_history: Vec<RaStep>,
    #[serde(default)]
    pub execution_time: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ResultResponse {
    pub accepted: bool,
    pub workflow_status: AggregateStatus,
}

#[derive(Debug, Serialize)]
pub struct WorkflowStatusResponse {
    pub workflow_id: Uuid,
    pub status: AggregateStatus,
    pub pending: i64,
    pub ready: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
    pub artifact: Option<String>,
    pub rework_cycles: i32,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/v1/tasks", post(submit_task))
        .route("/v1/tasks/ready", get(poll_ready_task))
        .route("/v1/results", post(report_result))
        .route("/v1/workflows/{id}/status", get(get_workflow_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token));

    Router::new()
        .route("/health", get(health))
        .route("/health/readiness", get(readiness))
        .merge(authenticated)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("mcs-server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("mcs-server shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

/// Spawn the periodic expiry sweep (spec §4.3, §5): reverts stale task
/// claims past `claim_ttl` back to `ready` and deletes file leases past
/// `lock_ttl`. This is the only background activity in the server --
/// everything else is request-driven (spec §4.5's "not a background
/// loop"), but expiring a crashed worker's claim/leases has no request to
/// hang off of, so it needs its own tick.
pub fn spawn_expiry_sweep(state: AppState, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let scheduler = Scheduler::new(&state.pool, state.config.chrono_claim_ttl(), state.config.chrono_lock_ttl());
            match scheduler.revert_expired_claims().await {
                Ok(reverted) if !reverted.is_empty() => {
                    for task in &reverted {
                        tracing::info!(task_id = %task.id, step_id = %task.step_id, "claim expired, reverted to ready");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "claim expiry sweep failed"),
            }

            let locks = LockManager::new(&state.pool, state.config.chrono_lock_ttl());
            if let Err(e) = locks.sweep_expired().await {
                tracing::error!(error = %e, "file lease expiry sweep failed");
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> Result<&'static str, AppError> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("store unreachable: {e}")))?;
    Ok("ready")
}

async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, AppError> {
    let name = derive_workflow_name(&req.metadata, &req.user_request);
    let project_id = resolve_project_id(&state.pool, req.project_id, &req.metadata).await?;

    let planner = Planner::new(
        &state.pool,
        state.gateway.as_ref(),
        state.config.roles.clone(),
        state.config.llm_max_attempts,
    );
    let metadata = req.metadata.clone().unwrap_or_else(|| serde_json::json!({}));
    let outcome = planner.plan(&name, &req.user_request, project_id, metadata).await?;

    let tasks = task_queries::list_tasks_for_workflow(&state.pool, outcome.workflow.id)
        .await
        .map_err(McsError::StoreUnavailable)?;

    Ok(Json(SubmitResponse {
        workflow_id: outcome.workflow.id,
        name: outcome.workflow.name,
        tasks: tasks
            .into_iter()
            .map(|t| TaskSummary {
                id: t.id,
                step_id: t.step_id,
                role: t.role,
                status: t.status,
            })
            .collect(),
        created_at: outcome.workflow.created_at,
    }))
}

/// Derive a workflow name from `metadata.workflow_name` if present,
/// otherwise from the first tokens of the request: non-alphanumerics
/// become underscores, lowercased, capped at 48 characters (spec §4.4
/// step 1).
fn derive_workflow_name(metadata: &Option<serde_json::Value>, user_request: &str) -> String {
    if let Some(name) = metadata
        .as_ref()
        .and_then(|m| m.get("workflow_name"))
        .and_then(|v| v.as_str())
    {
        return name.to_string();
    }

    sanitize_name(user_request, 48)
}

/// Resolve the project a new workflow should be grouped under (spec §3:
/// "Project -- optional grouping... Created by submit").
///
/// An explicit `project_id` must already exist. Otherwise, if
/// `metadata.project_name` is present, a new project is created with that
/// (folder-sanitized) name. With neither, the workflow is ungrouped.
async fn resolve_project_id(
    pool: &PgPool,
    project_id: Option<Uuid>,
    metadata: &Option<serde_json::Value>,
) -> Result<Option<Uuid>, AppError> {
    if let Some(id) = project_id {
        project_queries::get_project(pool, id)
            .await
            .map_err(McsError::StoreUnavailable)?
            .ok_or_else(|| McsError::not_found_project(id))?;
        return Ok(Some(id));
    }

    let Some(project_name) = metadata.as_ref().and_then(|m| m.get("project_name")).and_then(|v| v.as_str()) else {
        return Ok(None);
    };

    let sanitized = sanitize_name(project_name, 64);
    let project = project_queries::insert_project(pool, &sanitized)
        .await
        .map_err(McsError::StoreUnavailable)?;
    Ok(Some(project.id))
}

/// Shared sanitizer for derived names (spec §4.4 step 1, §6's
/// `project_name`): non-alphanumerics become underscores, lowercased,
/// collapsed, and capped at `max_len` characters.
fn sanitize_name(raw: &str, max_len: usize) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let collapsed = sanitized.split('_').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("_");
    collapsed.chars().take(max_len).collect()
}

async fn poll_ready_task(
    State(state): State<AppState>,
    Query(query): Query<ReadyQuery>,
    headers: HeaderMap,
) -> Result<axum::response::Response, AppError> {
    if !state.config.roles.iter().any(|r| r == &query.role) {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            format!("unknown role {:?}", query.role),
        ));
    }

    let worker_id = headers
        .get("x-worker-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown-worker")
        .to_string();

    let scheduler = Scheduler::new(&state.pool, state.config.chrono_claim_ttl(), state.config.chrono_lock_ttl());
    let dispatched = scheduler.dispatch(&query.role, &worker_id).await?;

    match dispatched {
        Some(d) => Ok(Json(ReadyTaskResponse {
            id: d.task.id,
            workflow_id: d.task.workflow_id,
            step_id: d.task.step_id,
            description: d.task.description,
            role: d.task.role,
            rework_note: d.task.rework_note,
            file_leases: d
                .file_leases
                .into_iter()
                .map(|l| FileLeaseView { path: l.path, mode: l.mode })
                .collect(),
        })
        .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn report_result(
    State(state): State<AppState>,
    Json(req): Json<ResultRequest>,
) -> Result<Json<ResultResponse>, AppError> {
    let mut tx = state
        .pool
        .begin()
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let task = task_queries::get_task_by_step_id(&mut tx, req.workflow_id, &req.step_id)
        .await
        .map_err(McsError::StoreUnavailable)?
        .ok_or_else(|| McsError::not_found_task(req.workflow_id, &req.step_id))?;
    tx.rollback()
        .await
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let iterations = serde_json::to_value(
        req.ra_history
            .iter()
            .map(|s| serde_json::json!({"thought": s.thought, "action": s.action, "observation": s.observation}))
            .collect::<Vec<_>>(),
    )
    .expect("RaStep list always serializes");

    let handler = ResultHandler::new(&state.pool, state.config.chrono_lock_ttl(), state.config.max_retries);
    let outcome = handler
        .report(WorkerReport {
            task_id: task.id,
            worker_id: req.worker_id,
            success: matches!(req.status, ReportedStatus::Completed),
            final_result: req.final_result,
            iterations,
            execution_time_ms: req.execution_time,
        })
        .await?;

    if outcome.workflow_status == AggregateStatus::Completed {
        let auditor = Auditor::new(
            &state.pool,
            state.gateway.as_ref(),
            state.config.llm_max_attempts,
            state.config.audit_confidence_threshold,
            state.config.max_rework_cycles,
        );
        if let Err(e) = auditor.audit(outcome.workflow_id).await {
            tracing::error!(error = %e, workflow_id = %outcome.workflow_id, "audit pass failed");
        }
    }

    let workflow_status = mcs_db::queries::workflows::get_workflow(&state.pool, outcome.workflow_id)
        .await
        .map_err(McsError::StoreUnavailable)?
        .map(|w| w.status)
        .unwrap_or(outcome.workflow_status);

    Ok(Json(ResultResponse {
        accepted: true,
        workflow_status,
    }))
}

async fn get_workflow_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowStatusResponse>, AppError> {
    let workflow = mcs_db::queries::workflows::get_workflow(&state.pool, id)
        .await
        .map_err(McsError::StoreUnavailable)?
        .ok_or_else(|| McsError::not_found_workflow(id))?;

    let progress = task_queries::get_workflow_progress(&state.pool, id)
        .await
        .map_err(McsError::StoreUnavailable)?;

    Ok(Json(WorkflowStatusResponse {
        workflow_id: workflow.id,
        status: workflow.status,
        pending: progress.pending,
        ready: progress.ready,
        in_progress: progress.in_progress,
        completed: progress.completed,
        failed: progress.failed,
        total: progress.total,
        artifact: workflow.artifact,
        rework_cycles: workflow.rework_cycles,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
