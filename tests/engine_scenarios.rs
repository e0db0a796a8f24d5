//! End-to-end runs through the execution engine.

mod common;

use common::{edge, harness, node};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weaveflow::graph::cycle::describe_cycles;
use weaveflow::graph::DependencyGraph;
use weaveflow::runtime::events::{ExecutionEvent, NodeUpdate};
use weaveflow::runtime::{ExecutionEngine, ExecutionMode, ExecutionOptions, NodeStatus, ProcessorRegistry, RetryPolicy, RunStatus};
use weaveflow::validation::IssueCategory;
use weaveflow::EngineError;

fn no_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        retry_delay_ms: 1,
        backoff_multiplier: 2.0,
    }
}

#[tokio::test]
async fn lone_input_is_rejected_before_running() {
    let h = harness();
    let err = h
        .engine
        .execute_workflow("wf", &[node("in", "dataInput")], &[], ExecutionOptions::default(), None)
        .await
        .unwrap_err();

    match err {
        EngineError::Validation(result) => {
            assert!(!result.is_valid);
            assert!(result.errors.iter().any(|i| i.category == IssueCategory::MissingExit));
        }
        other => panic!("expected validation failure, got {other}"),
    }
    assert!(h.journal.entries().is_empty());
    assert_eq!(h.engine.state().stats().await.total_runs, 0);
}

#[tokio::test]
async fn input_to_output_runs_in_order() {
    let h = harness();
    let plan = h
        .engine
        .execute_workflow(
            "wf",
            &[node("in", "dataInput"), node("out", "dataOutput")],
            &[edge("in", "out")],
            ExecutionOptions::default(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(plan.mode, ExecutionMode::Sequential);
    assert_eq!(plan.order, vec!["in", "out"]);
    assert_eq!(plan.status, RunStatus::Completed);
    assert_eq!(h.journal.started(), vec!["in", "out"]);
    assert_eq!(plan.context("out").unwrap().inputs.len(), 1);
    assert!(plan.finished_at.is_some());
}

#[tokio::test]
async fn cycles_are_reported_and_never_planned() {
    let h = harness();
    let nodes = [node("A", "record"), node("B", "record"), node("C", "record")];
    let edges = [edge("A", "B"), edge("B", "C"), edge("C", "A")];

    let graph = DependencyGraph::build(&nodes, &edges);
    assert_eq!(describe_cycles(&graph), vec!["A -> B -> C -> A"]);

    let err = h
        .engine
        .build_plan("wf", &nodes, &edges, &ExecutionOptions::default())
        .unwrap_err();
    match err {
        EngineError::Validation(result) => assert!(result.errors.iter().any(|i| i.category == IssueCategory::CircularDependency)),
        other => panic!("expected validation failure, got {other}"),
    }
    assert!(h.journal.entries().is_empty());
}

#[tokio::test]
async fn independent_inputs_run_as_a_parallel_group() {
    let h = harness();
    let nodes = [
        node("A", "dataInput").with_config(json!({ "sleepMs": 40 })),
        node("B", "dataInput").with_config(json!({ "sleepMs": 40 })),
        node("C", "record"),
        node("D", "dataOutput"),
    ];
    let edges = [edge("A", "C"), edge("B", "C"), edge("C", "D")];

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(plan.mode, ExecutionMode::Parallel);
    assert_eq!(plan.parallel_groups.len(), 1);
    assert_eq!(plan.parallel_groups[0].node_ids, vec!["A", "B"]);
    assert_eq!(plan.status, RunStatus::Completed);

    let journal = &h.journal;
    assert!(journal.index_of("start:C") > journal.index_of("end:A"));
    assert!(journal.index_of("start:C") > journal.index_of("end:B"));
    assert!(journal.index_of("start:D") > journal.index_of("end:C"));
    assert_eq!(journal.max_in_flight(), 2);
}

#[tokio::test]
async fn always_failing_node_gets_exactly_three_attempts() {
    let h = harness();
    let nodes = [
        node("in", "dataInput"),
        node("flaky", "fail").with_config(json!({ "maxRetries": 2 })),
        node("out", "dataOutput"),
    ];
    let edges = [edge("in", "flaky"), edge("flaky", "out")];

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(h.failures.load(Ordering::SeqCst), 3);
    let flaky = plan.context("flaky").unwrap();
    assert_eq!(flaky.retry_count, 2);
    assert_eq!(flaky.status, NodeStatus::Failed);
    assert_eq!(plan.errors.get("flaky").map(String::as_str), Some("flaky refused call 3"));
    // non-critical failure: the run carries on
    assert_eq!(plan.status, RunStatus::Completed);
    assert_eq!(plan.status_of("out"), Some(NodeStatus::Completed));
}

#[tokio::test]
async fn critical_failure_aborts_the_run() {
    let h = harness();
    let nodes = [
        node("in", "dataInput"),
        node("gate", "fail").with_config(json!({ "critical": true, "maxRetries": 1 })),
        node("out", "dataOutput"),
    ];
    let edges = [edge("in", "gate"), edge("gate", "out")];

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(plan.status, RunStatus::Failed);
    assert_eq!(h.failures.load(Ordering::SeqCst), 2);
    let root = plan.errors.get("root").unwrap();
    assert!(root.contains("'gate'"), "{root}");
    assert!(root.contains("2 attempt"), "{root}");
    assert_eq!(plan.status_of("out"), Some(NodeStatus::Pending));
    assert_eq!(h.journal.started(), vec!["in"]);
    assert!(plan.duration_ms.is_some());
}

#[tokio::test]
async fn parallel_runs_respect_the_concurrency_limit() {
    let h = harness();
    let mut nodes: Vec<_> = (1..=5)
        .map(|i| node(&format!("in{i}"), "dataInput").with_config(json!({ "sleepMs": 20 })))
        .collect();
    nodes.push(node("out", "dataOutput"));
    let edges: Vec<_> = (1..=5).map(|i| edge(&format!("in{i}"), "out")).collect();

    let options = ExecutionOptions::default().with_max_concurrency(2);
    let plan = h.engine.execute_workflow("wf", &nodes, &edges, options, None).await.unwrap();

    assert_eq!(plan.status, RunStatus::Completed);
    assert_eq!(h.journal.max_in_flight(), 2);
    assert_eq!(plan.context("out").unwrap().inputs.len(), 5);
}

#[tokio::test]
async fn group_concurrency_overrides_the_run_limit() {
    let h = harness();
    let nodes = [
        node("a", "dataInput").with_config(json!({ "sleepMs": 10 })),
        node("b", "dataInput").with_config(json!({ "sleepMs": 10 })),
        node("c", "dataInput").with_config(json!({ "sleepMs": 10 })),
        node("out", "dataOutput"),
    ];
    let edges = [edge("a", "out"), edge("b", "out"), edge("c", "out")];

    let mut plan = h
        .engine
        .build_plan("wf", &nodes, &edges, &ExecutionOptions::default())
        .unwrap();
    plan.parallel_groups[0].max_concurrency = Some(1);
    let plan = h.engine.run_plan(plan, None).await.unwrap();

    assert_eq!(plan.status, RunStatus::Completed);
    assert_eq!(h.journal.max_in_flight(), 1);
}

#[tokio::test]
async fn strict_groups_fail_on_member_errors() {
    let nodes = [
        node("in", "dataInput"),
        node("x", "fail"),
        node("y", "record"),
        node("out", "dataOutput"),
    ];
    let edges = [edge("in", "x"), edge("in", "y"), edge("x", "out"), edge("y", "out")];

    let tolerant = harness();
    let options = ExecutionOptions::default().with_retry_policy(no_retries());
    let plan = tolerant
        .engine
        .execute_workflow("wf", &nodes, &edges, options.clone(), None)
        .await
        .unwrap();
    assert_eq!(plan.mode, ExecutionMode::Parallel);
    assert_eq!(plan.status, RunStatus::Completed);
    assert_eq!(plan.status_of("x"), Some(NodeStatus::Failed));

    let strict = harness();
    let options = ExecutionOptions {
        continue_on_error: Some(false),
        ..options
    };
    let plan = strict.engine.execute_workflow("wf", &nodes, &edges, options, None).await.unwrap();
    assert_eq!(plan.status, RunStatus::Failed);
    let root = plan.errors.get("root").unwrap();
    assert!(root.contains("group-1") && root.contains("'x'"), "{root}");
    assert_eq!(plan.status_of("out"), Some(NodeStatus::Pending));
}

#[tokio::test]
async fn first_settled_member_releases_the_next_wave() {
    let h = harness();
    let nodes = [
        node("fast", "dataInput"),
        node("slow", "dataInput").with_config(json!({ "sleepMs": 150 })),
        node("after_fast", "record"),
        node("out", "dataOutput"),
    ];
    let edges = [edge("fast", "after_fast"), edge("after_fast", "out"), edge("slow", "out")];
    let options = ExecutionOptions {
        wait_for_all: Some(false),
        ..ExecutionOptions::default()
    };

    let plan = h.engine.execute_workflow("wf", &nodes, &edges, options, None).await.unwrap();

    assert_eq!(plan.status, RunStatus::Completed);
    let journal = &h.journal;
    // the fast branch moves on while its group sibling is still running
    assert!(journal.index_of("start:after_fast") < journal.index_of("end:slow"));
    // dependents still wait for every one of their own inputs
    assert!(journal.index_of("start:out") > journal.index_of("end:slow"));
}

fn branching_workflow(condition_yes: &str, condition_no: &str) -> (Vec<weaveflow::Node>, Vec<weaveflow::Edge>) {
    let nodes = vec![
        node("in", "dataInput").with_config(json!({ "emit": { "score": 0.9 } })),
        node("check", "record").with_config(json!({ "emit": { "ok": true } })),
        node("yes", "record"),
        node("no", "record"),
        node("after_no", "record"),
        node("out", "dataOutput"),
    ];
    let edges = vec![
        edge("in", "check"),
        edge("check", "yes").when(condition_yes),
        edge("check", "no").when(condition_no),
        edge("no", "after_no"),
        edge("yes", "out"),
        edge("after_no", "out"),
    ];
    (nodes, edges)
}

#[tokio::test]
async fn conditions_select_one_branch() {
    let h = harness();
    let (nodes, edges) = branching_workflow("${check.ok} == true && ${in.score} > 0.5", "${check.ok} == false");

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(plan.mode, ExecutionMode::Conditional);
    assert_eq!(plan.status, RunStatus::Completed);
    assert_eq!(plan.condition_results.get("check_yes"), Some(&true));
    assert_eq!(plan.condition_results.get("check_no"), Some(&false));
    assert_eq!(plan.status_of("yes"), Some(NodeStatus::Completed));
    assert_eq!(plan.status_of("no"), Some(NodeStatus::Skipped));
    assert_eq!(plan.status_of("after_no"), Some(NodeStatus::Skipped));
    assert_eq!(plan.status_of("out"), Some(NodeStatus::Completed));
    assert_eq!(h.journal.started(), vec!["in", "check", "yes", "out"]);

    let branch = plan.branches.iter().find(|b| b.target == "no").unwrap();
    assert_eq!(branch.true_path, vec!["no", "after_no", "out"]);
    assert_eq!(branch.false_path, vec!["yes"]);
}

fn if_else_workflow(ok: bool) -> (Vec<weaveflow::Node>, Vec<weaveflow::Edge>) {
    let nodes = vec![
        node("in", "dataInput"),
        node("check", "record").with_config(json!({ "emit": { "ok": ok } })),
        node("yes", "record"),
        node("no", "record"),
        node("out", "dataOutput"),
    ];
    let edges = vec![
        edge("in", "check"),
        edge("check", "yes").when("${check.ok} == true"),
        edge("check", "no"),
        edge("yes", "out"),
        edge("no", "out"),
    ];
    (nodes, edges)
}

#[tokio::test]
async fn true_condition_skips_the_plain_sibling_branch() {
    let h = harness();
    let (nodes, edges) = if_else_workflow(true);

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    let branch = plan.branches.iter().find(|b| b.target == "yes").unwrap();
    assert_eq!(branch.true_path, vec!["yes", "out"]);
    assert_eq!(branch.false_path, vec!["no"]);
    assert_eq!(plan.condition_results.get("check_yes"), Some(&true));
    assert_eq!(plan.status_of("yes"), Some(NodeStatus::Completed));
    assert_eq!(plan.status_of("no"), Some(NodeStatus::Skipped));
    assert_eq!(plan.status_of("out"), Some(NodeStatus::Completed));
    assert_eq!(h.journal.started(), vec!["in", "check", "yes", "out"]);
    assert_eq!(plan.status, RunStatus::Completed);
}

#[tokio::test]
async fn false_condition_takes_the_plain_sibling_branch() {
    let h = harness();
    let (nodes, edges) = if_else_workflow(false);

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(plan.condition_results.get("check_yes"), Some(&false));
    assert_eq!(plan.status_of("yes"), Some(NodeStatus::Skipped));
    assert_eq!(plan.status_of("no"), Some(NodeStatus::Completed));
    assert_eq!(plan.status_of("out"), Some(NodeStatus::Completed));
    assert_eq!(h.journal.started(), vec!["in", "check", "no", "out"]);
}

#[tokio::test]
async fn untaken_branch_still_runs_when_reached_from_elsewhere() {
    let h = harness();
    let (mut nodes, mut edges) = if_else_workflow(true);
    nodes.push(node("side", "dataInput"));
    edges.push(edge("side", "no"));

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(plan.status_of("yes"), Some(NodeStatus::Completed));
    assert_eq!(plan.status_of("no"), Some(NodeStatus::Completed));
}

#[tokio::test]
async fn broken_conditions_count_as_false() {
    let h = harness();
    let (nodes, edges) = branching_workflow("${check.ok} ==", "${check.ok} == true");

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(plan.status, RunStatus::Completed);
    assert!(plan.errors.contains_key("check_yes"));
    assert_eq!(plan.condition_results.get("check_yes"), Some(&false));
    assert_eq!(plan.status_of("yes"), Some(NodeStatus::Skipped));
    assert_eq!(plan.status_of("after_no"), Some(NodeStatus::Completed));
}

#[tokio::test]
async fn templates_resolve_labels_from_upstream_outputs() {
    let h = harness();
    let nodes = [
        node("src", "dataInput")
            .with_label("Source Page")
            .with_config(json!({ "emit": { "title": "Hello" } })),
        node("step", "record").with_config(json!({ "emit": "Summary of {{Source Page.title}} ({{src.missing}})" })),
        node("out", "dataOutput"),
    ];
    let edges = [edge("src", "step"), edge("step", "out")];

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(plan.results["step"], json!("Summary of Hello ({{src.missing}})"));
    let step = plan.context("step").unwrap();
    assert_eq!(step.outputs["output"], json!("Summary of Hello ({{src.missing}})"));
    assert_eq!(step.raw_config["emit"], json!("Summary of {{Source Page.title}} ({{src.missing}})"));
}

#[tokio::test]
async fn unknown_types_pass_through_with_a_warning() {
    let h = harness();
    let nodes = [
        node("in", "dataInput").with_config(json!({ "emit": [1, 2, 3] })),
        node("mystery", "luaScrpt"),
        node("out", "dataOutput"),
    ];
    let edges = [edge("in", "mystery"), edge("mystery", "out")];

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(plan.status, RunStatus::Completed);
    assert_eq!(plan.results["mystery"], json!([1, 2, 3]));
    let warnings = &plan.context("mystery").unwrap().warnings;
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("luaScript"), "{warnings:?}");
    assert!(plan.warnings.iter().any(|w| w.contains("luaScrpt")));
}

#[tokio::test]
async fn missing_fallback_is_a_fatal_configuration_error() {
    let strict = ExecutionEngine::new(
        ProcessorRegistry::with_builtins().without_fallback(),
        common::fast_config(),
    );
    let nodes = [node("in", "dataInput"), node("mystery", "nope"), node("out", "dataOutput")];
    let edges = [edge("in", "mystery"), edge("mystery", "out")];

    let err = strict
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap_err();
    match err {
        EngineError::Validation(result) => {
            assert!(!result.is_valid);
            assert!(result.error_summary().contains("'nope'"));
        }
        other => panic!("expected validation failure, got {other}"),
    }
    assert_eq!(strict.state().stats().await.total_runs, 0);

    // a plan built elsewhere still fails fast on the first unresolvable node
    let lenient = ExecutionEngine::with_builtins(common::fast_config());
    let plan = lenient
        .build_plan("wf", &nodes, &edges, &ExecutionOptions::default())
        .unwrap();
    let plan = strict.run_plan(plan, None).await.unwrap();

    assert_eq!(plan.status, RunStatus::Failed);
    assert!(plan.errors["root"].contains("'nope'"));
    assert_eq!(plan.status_of("mystery"), Some(NodeStatus::Failed));
    assert_eq!(plan.status_of("out"), Some(NodeStatus::Pending));
}

#[tokio::test]
async fn slow_processors_time_out() {
    let h = harness();
    let nodes = [
        node("in", "dataInput"),
        node("slow", "record").with_config(json!({ "sleepMs": 2000, "timeout": 20, "maxRetries": 0 })),
        node("out", "dataOutput"),
    ];
    let edges = [edge("in", "slow"), edge("slow", "out")];

    let plan = tokio::time::timeout(
        Duration::from_secs(1),
        h.engine.execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None),
    )
    .await
    .expect("timeout was not enforced")
    .unwrap();

    let slow = plan.context("slow").unwrap();
    assert_eq!(slow.status, NodeStatus::Failed);
    assert!(slow.error.as_deref().unwrap_or_default().contains("timed out"));
    assert_eq!(plan.status, RunStatus::Completed);
}

#[tokio::test]
async fn cancelling_pauses_the_run() {
    let h = harness();
    let nodes = [
        node("in", "dataInput"),
        node("slow", "record").with_config(json!({ "sleepMs": 5000 })),
        node("out", "dataOutput"),
    ];
    let edges = [edge("in", "slow"), edge("slow", "out")];
    let mut events = h.engine.subscribe();

    let canceller = async {
        let run_id = loop {
            match events.recv().await.unwrap() {
                ExecutionEvent::NodeStarted { run_id, node_id, .. } if node_id == "slow" => break run_id,
                _ => {}
            }
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.engine.cancel(&run_id).await);
    };
    let run = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None);

    let (plan, ()) = tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(run, canceller) })
        .await
        .expect("cancellation did not interrupt the run");
    let plan = plan.unwrap();

    assert_eq!(plan.status, RunStatus::Paused);
    assert_eq!(plan.status_of("in"), Some(NodeStatus::Completed));
    assert_eq!(plan.status_of("slow"), Some(NodeStatus::Pending));
    assert_eq!(plan.status_of("out"), Some(NodeStatus::Pending));
    let stats = h.engine.state().stats().await;
    assert_eq!(stats.paused, 1);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
async fn panicking_processor_fails_the_run_with_a_root_error() {
    let h = harness();
    let nodes = [node("in", "dataInput"), node("boom", "panic"), node("out", "dataOutput")];
    let edges = [edge("in", "boom"), edge("boom", "out")];

    let plan = h
        .engine
        .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
        .await
        .unwrap();

    assert_eq!(plan.status, RunStatus::Failed);
    assert!(plan.errors["root"].contains("processor exploded"));
    assert!(plan.finished_at.is_some());
    assert!(h.engine.state().active_runs().await.iter().all(|p| p.id != plan.id));
}

#[tokio::test]
async fn events_and_callbacks_follow_the_lifecycle() {
    let h = harness();
    let mut events = h.engine.subscribe();
    let updates: Arc<Mutex<Vec<NodeUpdate>>> = Arc::default();
    let sink = updates.clone();
    let callback: weaveflow::runtime::NodeUpdateCallback = Arc::new(move |update| sink.lock().unwrap().push(update));

    let plan = h
        .engine
        .execute_workflow(
            "wf",
            &[node("in", "dataInput"), node("out", "dataOutput")],
            &[edge("in", "out")],
            ExecutionOptions::default(),
            Some(callback),
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(ExecutionEvent::RunStarted { .. })));
    assert!(matches!(
        seen.last(),
        Some(ExecutionEvent::RunCompleted { status: RunStatus::Completed, .. })
    ));
    let completed: Vec<_> = seen
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::NodeCompleted { .. }))
        .filter_map(|e| e.node_id())
        .collect();
    assert_eq!(completed, vec!["in", "out"]);
    assert!(seen.iter().all(|e| e.run_id() == plan.id));

    let updates = updates.lock().unwrap();
    let out: Vec<NodeStatus> = updates.iter().filter(|u| u.node_id == "out").map(|u| u.status).collect();
    assert_eq!(out, vec![NodeStatus::Running, NodeStatus::Completed]);
}

#[tokio::test]
async fn finished_runs_feed_history_and_stats() {
    let h = harness();
    let nodes = [node("in", "dataInput"), node("out", "dataOutput")];
    let edges = [edge("in", "out")];
    for _ in 0..2 {
        h.engine
            .execute_workflow("wf", &nodes, &edges, ExecutionOptions::default(), None)
            .await
            .unwrap();
    }

    let stats = h.engine.state().stats().await;
    assert_eq!(stats.total_runs, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(h.engine.state().history(Some(1)).await.len(), 1);
}
