/// Workflow management REST API endpoints
/// 
/// Provides CRUD operations for workflow definitions with hot-reload support.
/// Every write is validated and pushed into the registry before the response.

use crate::{
    runtime::engine::ExecutionEngine,
    validation::ValidationResult,
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage, types::Workflow},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    /// Workflow and execution persistence
    pub storage: WorkflowStorage,
    /// Hot-reload registry for in-memory workflows
    pub registry: Arc<WorkflowRegistry>,
    /// Execution engine that plans and runs workflows
    pub engine: Arc<ExecutionEngine>,
}

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
    /// Structural validation of the stored definition
    pub validation: ValidationResult,
}

/// Request body for workflow creation and update
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub workflow: Workflow,
}

/// Create workflow management routes
/// 
/// Sets up CRUD endpoints plus on-demand validation of a registered workflow.
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/validate", post(validate_workflow))
}

/// Create a new workflow
/// 
/// POST /api/workflows
/// Body: { "workflow": { "id": "...", "name": "...", "nodes": [...], "edges": [...] } }
/// Returns: { "id": "...", "message": "...", "validation": { "isValid": true, ... } }
/// 409 when the id is taken, 400 when id or name is blank.
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    let workflow = payload.workflow;
    if workflow.id.trim().is_empty() || workflow.name.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state.storage.get_workflow(&workflow.id).await {
        Ok(Some(_)) => return Err(StatusCode::CONFLICT),
        Ok(None) => {}
        Err(e) => {
            tracing::error!("Failed to look up workflow {}: {}", workflow.id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    store_and_reload(&state, &workflow).await?;
    tracing::info!("🔥 Created workflow: {} ({})", workflow.id, workflow.name);

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: format!("Workflow '{}' created successfully", workflow.name),
        validation: state.engine.validate(&workflow.nodes, &workflow.edges),
    }))
}

/// List all stored workflows
/// 
/// GET /api/workflows
/// Returns: { "workflows": [ { "id": "...", "name": "...", "nodes": [...], "edges": [...] } ] }
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.storage.list_workflows().await {
        Ok(workflows) => Ok(Json(json!({ "workflows": workflows }))),
        Err(e) => {
            tracing::error!("Failed to list workflows: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Get one workflow, preferring the hot registry over storage
/// 
/// GET /api/workflows/{id}
/// Returns: { "id": "...", "name": "...", "nodes": [...], "edges": [...] }
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, StatusCode> {
    if let Some(compiled) = state.registry.get_workflow(&id) {
        return Ok(Json(compiled.workflow));
    }
    match state.storage.get_workflow(&id).await {
        Ok(Some(workflow)) => Ok(Json(workflow)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get workflow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Replace a workflow definition and hot-reload it
/// 
/// PUT /api/workflows/{id}
/// Body: { "workflow": { "name": "...", "nodes": [...], "edges": [...] } }
/// Returns: { "id": "...", "message": "...", "validation": { ... } }
/// The path id wins over any id in the body.
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    let mut workflow = payload.workflow;
    workflow.id = id.clone();
    if workflow.name.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state.storage.get_workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to look up workflow {}: {}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    store_and_reload(&state, &workflow).await?;
    tracing::info!("🔥 Hot-reloaded workflow: {} ({})", workflow.id, workflow.name);

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: format!("Workflow '{}' updated successfully", workflow.name),
        validation: state.engine.validate(&workflow.nodes, &workflow.edges),
    }))
}

/// Delete a workflow from storage and the registry
/// 
/// DELETE /api/workflows/{id}
/// Returns: { "message": "Workflow deleted successfully" }
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state.registry.remove_workflow(&id);

    match state.storage.delete_workflow(&id).await {
        Ok(true) => {
            tracing::info!("🗑️ Deleted workflow: {}", id);
            Ok(Json(json!({ "message": "Workflow deleted successfully" })))
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to delete workflow: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Validate a registered workflow
/// 
/// POST /api/workflows/{id}/validate
/// Returns: { "isValid": false, "errors": [ { "category": "missing-exit", ... } ], "warnings": [], "summary": { ... } }
/// Always 200 for a known workflow; `isValid` tells whether it can run.
async fn validate_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ValidationResult>, StatusCode> {
    let workflow = match state.registry.get_workflow(&id) {
        Some(compiled) => compiled.workflow,
        None => return Err(StatusCode::NOT_FOUND),
    };
    Ok(Json(state.engine.validate(&workflow.nodes, &workflow.edges)))
}

/// Persist a workflow and push it into the hot registry
async fn store_and_reload(state: &AppState, workflow: &Workflow) -> Result<(), StatusCode> {
    if let Err(e) = state.storage.save_workflow(workflow).await {
        tracing::error!("Failed to save workflow {}: {}", workflow.id, e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    if let Err(e) = state.registry.reload_workflow(&workflow.id).await {
        tracing::error!("Failed to reload workflow {} into registry: {}", workflow.id, e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(())
}
