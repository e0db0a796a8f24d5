//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weaveflow::config::EngineConfig;
use weaveflow::runtime::plan::ExecutionContext;
use weaveflow::runtime::{ExecutionEngine, NodeProcessor, ProcessorRegistry, RetryPolicy, RunView};
use weaveflow::{Edge, Node};

/// Journal of processor activity shared by every recording node in a test.
#[derive(Debug, Default)]
pub struct Journal {
    /// `start:<id>` and `end:<id>` entries in the order they happened
    pub log: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl Journal {
    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Node ids in the order they started
    pub fn started(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix("start:").map(str::to_string))
            .collect()
    }

    /// Index of an entry such as `end:A`
    pub fn index_of(&self, entry: &str) -> usize {
        let entries = self.entries();
        entries
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("'{}' not in {:?}", entry, entries))
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Records start/finish order, optionally sleeps for `config.sleepMs`, and
/// returns `config.emit` (or a summary of its inputs).
pub struct RecordingProcessor {
    pub journal: Arc<Journal>,
}

#[async_trait]
impl NodeProcessor for RecordingProcessor {
    async fn process(&self, ctx: &ExecutionContext, _run: &RunView) -> anyhow::Result<Value> {
        self.journal.log.lock().unwrap().push(format!("start:{}", ctx.node_id));
        let now = self.journal.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(ms) = ctx.config.get("sleepMs").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        self.journal.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.journal.log.lock().unwrap().push(format!("end:{}", ctx.node_id));

        let inputs: Vec<&String> = ctx.inputs.keys().collect();
        Ok(match ctx.config.get("emit") {
            Some(value) => value.clone(),
            None => json!({ "node": ctx.node_id, "inputs": inputs }),
        })
    }
}

/// Fails every call and counts them.
pub struct AlwaysFails {
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl NodeProcessor for AlwaysFails {
    async fn process(&self, ctx: &ExecutionContext, _run: &RunView) -> anyhow::Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        anyhow::bail!("{} refused call {}", ctx.node_id, call)
    }
}

pub struct Panics;

#[async_trait]
impl NodeProcessor for Panics {
    async fn process(&self, _ctx: &ExecutionContext, _run: &RunView) -> anyhow::Result<Value> {
        panic!("processor exploded")
    }
}

pub struct Harness {
    pub engine: ExecutionEngine,
    pub journal: Arc<Journal>,
    pub failures: Arc<AtomicU32>,
}

/// Engine whose `dataInput`, `dataOutput` and `record` nodes all record into
/// one journal, with `fail` and `panic` nodes available and millisecond backoff.
pub fn harness() -> Harness {
    let journal = Arc::new(Journal::default());
    let failures = Arc::new(AtomicU32::new(0));

    let mut registry = ProcessorRegistry::with_builtins();
    for node_type in ["dataInput", "dataOutput", "record"] {
        registry.register(
            node_type,
            Arc::new(RecordingProcessor {
                journal: journal.clone(),
            }),
        );
    }
    registry.register(
        "fail",
        Arc::new(AlwaysFails {
            calls: failures.clone(),
        }),
    );
    registry.register("panic", Arc::new(Panics));

    Harness {
        engine: ExecutionEngine::new(registry, fast_config()),
        journal,
        failures,
    }
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_policy: RetryPolicy {
            max_retries: 3,
            retry_delay_ms: 1,
            backoff_multiplier: 2.0,
        },
        node_timeout_ms: None,
        ..EngineConfig::default()
    }
}

pub fn node(id: &str, node_type: &str) -> Node {
    Node::new(id, node_type)
}

pub fn edge(source: &str, target: &str) -> Edge {
    Edge::new(format!("{}-{}", source, target), source, target)
}
