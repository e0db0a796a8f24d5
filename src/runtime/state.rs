//! Execution state store
//!
//! Tracks in-flight runs (so they can be inspected and cancelled) and keeps a
//! bounded history of finished run records with aggregate statistics.

use crate::runtime::plan::{ExecutionPlan, RunStatus};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

struct ActiveRun {
    plan: Arc<Mutex<ExecutionPlan>>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_runs: u64,
    pub completed: u64,
    pub failed: u64,
    pub paused: u64,
    pub active: usize,
    pub average_duration_ms: f64,
}

#[derive(Default)]
struct StoreInner {
    active: HashMap<String, ActiveRun>,
    history: VecDeque<ExecutionPlan>,
    total_runs: u64,
    completed: u64,
    failed: u64,
    paused: u64,
    total_duration_ms: u64,
}

pub struct ExecutionStateStore {
    inner: RwLock<StoreInner>,
    history_limit: usize,
}

impl Default for ExecutionStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl std::fmt::Debug for ExecutionStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStateStore")
            .field("history_limit", &self.history_limit)
            .finish_non_exhaustive()
    }
}

impl ExecutionStateStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            history_limit: history_limit.max(1),
        }
    }

    /// Track a run that is about to start
    pub async fn register(&self, run_id: &str, plan: Arc<Mutex<ExecutionPlan>>, cancel: CancellationToken) {
        let mut inner = self.inner.write().await;
        inner.active.insert(run_id.to_string(), ActiveRun { plan, cancel });
        tracing::debug!("📌 Registered active run {} ({} active)", run_id, inner.active.len());
    }

    /// Move a finished run into history
    pub async fn finish(&self, plan: ExecutionPlan) {
        let mut inner = self.inner.write().await;
        inner.active.remove(&plan.id);
        inner.total_runs += 1;
        match plan.status {
            RunStatus::Completed => inner.completed += 1,
            RunStatus::Failed => inner.failed += 1,
            RunStatus::Paused => inner.paused += 1,
            RunStatus::Pending | RunStatus::Running => {}
        }
        inner.total_duration_ms += plan.duration_ms.unwrap_or(0);

        inner.history.push_back(plan);
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }
    }

    /// Cancel an active run
    ///
    /// The run is marked paused and leaves the active registry immediately;
    /// its nodes observe the token at their next suspension point. Returns
    /// false for unknown or already finished runs.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let Some(run) = self.inner.write().await.active.remove(run_id) else {
            return false;
        };
        run.plan.lock().await.status = RunStatus::Paused;
        run.cancel.cancel();
        tracing::info!("⏸️ Run {} cancelled", run_id);
        true
    }

    /// Current state of a run, active or historical
    pub async fn get(&self, run_id: &str) -> Option<ExecutionPlan> {
        let active = self.inner.read().await.active.get(run_id).map(|run| run.plan.clone());
        if let Some(plan) = active {
            return Some(plan.lock().await.clone());
        }
        self.inner
            .read()
            .await
            .history
            .iter()
            .rev()
            .find(|plan| plan.id == run_id)
            .cloned()
    }

    /// Snapshots of every active run
    pub async fn active_runs(&self) -> Vec<ExecutionPlan> {
        let plans: Vec<Arc<Mutex<ExecutionPlan>>> = self
            .inner
            .read()
            .await
            .active
            .values()
            .map(|run| run.plan.clone())
            .collect();
        let mut snapshots = Vec::with_capacity(plans.len());
        for plan in plans {
            snapshots.push(plan.lock().await.clone());
        }
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }

    /// Finished runs, newest first
    pub async fn history(&self, limit: Option<usize>) -> Vec<ExecutionPlan> {
        let inner = self.inner.read().await;
        inner
            .history
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> ExecutionStats {
        let inner = self.inner.read().await;
        ExecutionStats {
            total_runs: inner.total_runs,
            completed: inner.completed,
            failed: inner.failed,
            paused: inner.paused,
            active: inner.active.len(),
            average_duration_ms: if inner.total_runs == 0 {
                0.0
            } else {
                inner.total_duration_ms as f64 / inner.total_runs as f64
            },
        }
    }
}
