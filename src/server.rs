//! Server setup and initialization
//!
//! Wires storage, the workflow registry, the execution engine and the HTTP
//! routes into one Axum application.

use crate::{
    api::{create_execution_routes, create_workflow_routes, AppState},
    config::Config,
    runtime::engine::ExecutionEngine,
    validation::WorkflowValidator,
    workflow::{registry::WorkflowRegistry, storage::WorkflowStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Build the application router and every component behind it
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    std::fs::create_dir_all(&config.database.data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory: {}", e))?;

    let db_path = Path::new(&config.database.data_dir).join("weaveflow.db");
    tracing::info!("🗄️ Opening database: {}", db_path.display());
    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;

    let storage = WorkflowStorage::new(pool);
    storage
        .init_schema()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize storage schema: {}", e))?;

    let engine = Arc::new(ExecutionEngine::with_builtins(config.engine.clone()));

    tracing::info!("📊 Initializing workflow registry");
    let validator = WorkflowValidator::new(config.engine.entry_types.clone(), config.engine.exit_types.clone());
    let registry = Arc::new(WorkflowRegistry::new(storage.clone(), validator));
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

    Ok(build_router(AppState {
        storage,
        registry,
        engine,
    }))
}

/// Router over an already-assembled state
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_execution_routes())
        .with_state(state)
}

/// Initialize logging and serve until the process is stopped
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting weaveflow server...");
    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
