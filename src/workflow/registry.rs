//! Hot-reload workflow registry using ArcSwap
//!
//! Keeps every stored workflow in memory together with its latest validation
//! result. Updates swap the whole map atomically, so in-flight runs keep the
//! definition they started with while new runs see the new one.

use crate::validation::{ValidationResult, WorkflowValidator};
use crate::workflow::{storage::WorkflowStorage, types::Workflow};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Workflow plus the structural facts derived from it
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow: Workflow,
    pub validation: ValidationResult,
}

impl CompiledWorkflow {
    pub fn is_executable(&self) -> bool {
        self.validation.is_valid
    }
}

/// Lock-free workflow registry
#[derive(Debug)]
pub struct WorkflowRegistry {
    /// workflow_id -> compiled workflow
    workflows: ArcSwap<HashMap<String, CompiledWorkflow>>,
    storage: WorkflowStorage,
    validator: WorkflowValidator,
}

impl WorkflowRegistry {
    pub fn new(storage: WorkflowStorage, validator: WorkflowValidator) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
            validator,
        }
    }

    /// Load every stored workflow; invalid ones are kept with their issues
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_all_workflows().await?;
        let compiled: HashMap<String, CompiledWorkflow> = stored
            .into_iter()
            .map(|(id, workflow)| (id, self.compile(workflow)))
            .collect();

        let invalid = compiled.values().filter(|c| !c.is_executable()).count();
        self.workflows.store(Arc::new(compiled));
        tracing::info!(
            "📊 Initialized workflow registry with {} workflows ({} failing validation)",
            self.workflows.load().len(),
            invalid
        );
        Ok(())
    }

    /// Re-read one workflow from storage and swap it in
    pub async fn reload_workflow(&self, workflow_id: &str) -> Result<CompiledWorkflow> {
        let workflow = self
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Workflow not found: {}", workflow_id))?;
        let compiled = self.compile(workflow);

        self.workflows.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(workflow_id.to_string(), compiled.clone());
            next
        });

        tracing::info!("🔄 Hot-reloaded workflow: {}", workflow_id);
        Ok(compiled)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<CompiledWorkflow> {
        self.workflows.load().get(workflow_id).cloned()
    }

    pub fn remove_workflow(&self, workflow_id: &str) -> bool {
        let removed = self.workflows.load().contains_key(workflow_id);
        if removed {
            self.workflows.rcu(|current| {
                let mut next = HashMap::clone(current);
                next.remove(workflow_id);
                next
            });
            tracing::info!("🗑️ Removed workflow from registry: {}", workflow_id);
        }
        removed
    }

    fn compile(&self, workflow: Workflow) -> CompiledWorkflow {
        let validation = self.validator.validate(&workflow.nodes, &workflow.edges);
        if !validation.is_valid {
            tracing::warn!(
                "⚠️ Workflow '{}' is not executable: {}",
                workflow.id,
                validation.error_summary()
            );
        }
        CompiledWorkflow { workflow, validation }
    }
}
