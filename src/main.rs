//! weaveflow server entry point
//!
//! Loads configuration from the environment and serves:
//! - Workflow management API at /api/workflows/*
//! - Execution API at /api/executions/*
//! - Health check at /healthz

use weaveflow::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    start_server(config).await?;
    Ok(())
}
