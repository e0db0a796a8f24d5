/// Execution REST API endpoints
/// 
/// Starts runs of registered workflows and exposes the engine's state store.
/// Finished runs are persisted so records outlive the in-memory history.

use crate::{
    api::workflows::AppState,
    error::EngineError,
    runtime::{
        options::ExecutionOptions,
        plan::{ExecutionPlan, NodeStatus},
    },
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

type ApiError = (StatusCode, Json<Value>);

/// Create execution routes
/// 
/// Run control and inspection endpoints sharing the workflow app state.
pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}/execute", post(execute_workflow))
        .route("/api/executions", get(list_active))
        .route("/api/executions/stats", get(stats))
        .route("/api/executions/history", get(history))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteQuery {
    /// `false` starts the run in the background and answers 202 with its id
    pub wait: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    /// Read persisted records for one workflow instead of in-memory history
    pub workflow_id: Option<String>,
}

/// Compact view of a run for listings
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub workflow_id: String,
    pub status: String,
    pub mode: String,
    pub started_at: Option<String>,
    pub duration_ms: Option<u64>,
    pub nodes: BTreeMap<NodeStatus, usize>,
}

impl From<&ExecutionPlan> for RunSummary {
    fn from(plan: &ExecutionPlan) -> Self {
        Self {
            id: plan.id.clone(),
            workflow_id: plan.workflow_id.clone(),
            status: plan.status.as_str().to_string(),
            mode: plan.mode.as_str().to_string(),
            started_at: plan.started_at.map(|t| t.to_rfc3339()),
            duration_ms: plan.duration_ms,
            nodes: plan.status_counts(),
        }
    }
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Execute a registered workflow
/// 
/// POST /api/workflows/{id}/execute?wait=false
/// Body (optional): { "mode": "parallel", "maxConcurrency": 4, "timeoutMs": 30000 }
/// Returns: the finished plan { "id": "...", "status": "completed", "nodes": { ... }, ... }
/// With wait=false: 202 { "runId": "..." }. Invalid workflows answer 422 with
/// { "error": "...", "validation": { ... } }.
async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExecuteQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let options: ExecutionOptions = if body.iter().all(u8::is_ascii_whitespace) {
        state.engine.config().default_options()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid execution options: {}", e)))?
    };

    let compiled = state
        .registry
        .get_workflow(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Workflow not found: {}", id)))?;
    let workflow = compiled.workflow;

    let plan = match state.engine.build_plan(&workflow.id, &workflow.nodes, &workflow.edges, &options) {
        Ok(plan) => plan,
        Err(EngineError::Validation(validation)) => {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": validation.error_summary(), "validation": validation })),
            ));
        }
        Err(e) => return Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
    };

    if query.wait == Some(false) {
        let run_id = plan.id.clone();
        tracing::info!("📨 Starting background run {} of '{}'", run_id, workflow.id);
        tokio::spawn(async move {
            run_and_store(&state, plan).await;
        });
        return Ok((StatusCode::ACCEPTED, Json(json!({ "runId": run_id }))));
    }

    let record = run_and_store(&state, plan).await.ok_or_else(|| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Run did not produce a record")
    })?;
    let body = serde_json::to_value(&record)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok((StatusCode::OK, Json(body)))
}

/// Drive a plan to the end and persist the record
async fn run_and_store(state: &AppState, plan: ExecutionPlan) -> Option<ExecutionPlan> {
    let record = match state.engine.run_plan(plan, None).await {
        Ok(record) => record,
        Err(e) => {
            tracing::error!("❌ Run could not be driven: {}", e);
            return None;
        }
    };
    if let Err(e) = state.storage.save_execution(&record).await {
        tracing::error!("Failed to persist run {}: {}", record.id, e);
    }
    Some(record)
}

/// List active runs
/// 
/// GET /api/executions
/// Returns: { "executions": [ { "id": "...", "workflowId": "...", "status": "running", "nodes": { "pending": 2 } } ] }
async fn list_active(State(state): State<AppState>) -> Json<Value> {
    let runs: Vec<RunSummary> = state
        .engine
        .state()
        .active_runs()
        .await
        .iter()
        .map(RunSummary::from)
        .collect();
    Json(json!({ "executions": runs }))
}

/// Aggregate run statistics
/// 
/// GET /api/executions/stats
/// Returns: { "totalRuns": 3, "completed": 2, "failed": 1, "paused": 0, "active": 0, "averageDurationMs": 12.5 }
async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.engine.state().stats().await))
}

/// Recent finished runs
/// 
/// GET /api/executions/history?limit=20&workflow_id=wf-1
/// Returns: { "executions": [ ... ] }, from storage when workflow_id is given
async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    if let Some(workflow_id) = &query.workflow_id {
        let limit = query.limit.unwrap_or(50).min(u32::MAX as usize) as u32;
        let stored = state
            .storage
            .list_executions(Some(workflow_id), limit)
            .await
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        return Ok(Json(json!({ "executions": stored })));
    }

    let runs: Vec<RunSummary> = state
        .engine
        .state()
        .history(query.limit)
        .await
        .iter()
        .map(RunSummary::from)
        .collect();
    Ok(Json(json!({ "executions": runs })))
}

/// Get one run, active or historical
/// 
/// GET /api/executions/{id}
/// Returns: the full execution plan with per-node state
async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionPlan>, ApiError> {
    if let Some(plan) = state.engine.state().get(&id).await {
        return Ok(Json(plan));
    }
    match state.storage.get_execution(&id).await {
        Ok(Some(plan)) => Ok(Json(plan)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("Execution not found: {}", id))),
        Err(e) => {
            tracing::error!("Failed to load execution {}: {}", id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Cancel an active run
/// 
/// POST /api/executions/{id}/cancel
/// Returns: { "message": "Execution cancelled", "id": "..." }
async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.engine.cancel(&id).await {
        Ok(Json(json!({ "message": "Execution cancelled", "id": id })))
    } else {
        Err(api_error(StatusCode::NOT_FOUND, format!("No active execution: {}", id)))
    }
}
