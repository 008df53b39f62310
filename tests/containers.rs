//! Container and subflow execution through the engine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use flowloom::definition::{
    ExecutionMode, NodeConfig, NodeDefinition, WorkflowDefinition,
};
use flowloom::nodes::TaskRegistry;
use flowloom::types::{NodeStatus, WorkflowStatus};

use common::fixtures::test_engine_with_tasks;
use common::tasks::{
    register_failing, register_interval, register_recorder, ExecutionLog, IntervalLog,
};

fn task_node(node_id: &str, task_name: &str) -> NodeDefinition {
    NodeDefinition::new(
        node_id,
        NodeConfig::Task {
            task_name: task_name.to_string(),
        },
    )
}

fn container_node(
    node_id: &str,
    mode: ExecutionMode,
    children: Vec<NodeDefinition>,
) -> NodeDefinition {
    NodeDefinition::new(
        node_id,
        NodeConfig::Container {
            execution_mode: mode,
            child_nodes: children,
            child_connections: vec![],
            cancel_siblings_on_failure: false,
        },
    )
}

#[tokio::test]
async fn sequential_container_chains_children() {
    let registry = Arc::new(TaskRegistry::new());
    let log = ExecutionLog::new();
    register_recorder(&registry, "one", &log, Duration::from_millis(10));
    register_recorder(&registry, "two", &log, Duration::from_millis(10));
    register_recorder(&registry, "three", &log, Duration::from_millis(10));

    let definition = WorkflowDefinition::new("seqbox").with_node(container_node(
        "box",
        ExecutionMode::Sequential,
        vec![
            task_node("one", "one"),
            task_node("two", "two"),
            task_node("three", "three"),
        ],
    ));

    let engine = test_engine_with_tasks(definition, registry);
    let ctx = engine.start(Default::default()).await.unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    assert_eq!(log.snapshot(), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn parallel_container_starts_children_concurrently() {
    let registry = Arc::new(TaskRegistry::new());
    let intervals = IntervalLog::new();
    register_interval(&registry, "left", &intervals, Duration::from_millis(80));
    register_interval(&registry, "right", &intervals, Duration::from_millis(80));

    let definition = WorkflowDefinition::new("parbox").with_node(container_node(
        "box",
        ExecutionMode::Parallel,
        vec![task_node("left", "left"), task_node("right", "right")],
    ));

    let engine = test_engine_with_tasks(definition, registry);
    let ctx = engine.start(Default::default()).await.unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    assert!(intervals.overlaps("left", "right"));
}

#[tokio::test]
async fn failed_child_fails_the_container() {
    let registry = Arc::new(TaskRegistry::new());
    let _attempts = register_failing(&registry, "doomed");

    let definition = WorkflowDefinition::new("failbox").with_node(container_node(
        "box",
        ExecutionMode::Sequential,
        vec![task_node("doomed", "doomed")],
    ));

    let engine = test_engine_with_tasks(definition, registry);
    let ctx = engine.start(Default::default()).await.unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Failed);
    let container = ctx
        .instances()
        .into_iter()
        .find(|i| i.node_id == "box")
        .unwrap();
    assert_eq!(container.status, NodeStatus::Failed);
    assert!(container.error.as_deref().unwrap().contains("children failed"));
}

#[tokio::test]
async fn container_children_share_parent_variables() {
    let definition = WorkflowDefinition::new("sharedvars")
        .with_variable("total", json!(1))
        .with_node(container_node(
            "box",
            ExecutionMode::Sequential,
            vec![
                NodeDefinition::new(
                    "bump",
                    NodeConfig::Script {
                        script: "SetGlobal(\"total\", GetGlobal(\"total\") + 10)".to_string(),
                    },
                ),
                NodeDefinition::new(
                    "bump_again",
                    NodeConfig::Script {
                        script: "SetGlobal(\"total\", GetGlobal(\"total\") + 100)".to_string(),
                    },
                ),
            ],
        ));

    let engine = test_engine_with_tasks(definition, Arc::new(TaskRegistry::new()));
    let ctx = engine.start(Default::default()).await.unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    assert_eq!(ctx.get_variable("total"), Some(json!(111)));
}

#[tokio::test]
async fn subflow_failure_aggregates_child_errors() {
    let child = WorkflowDefinition::new("failing-child").with_node(task_node("inner", "doomed"));
    let registry = Arc::new(TaskRegistry::new());
    let _attempts = register_failing(&registry, "doomed");

    let definition = WorkflowDefinition::new("parent").with_node(NodeDefinition::new(
        "sub",
        NodeConfig::Subflow {
            workflow_file_path: None,
            workflow: Some(Box::new(child)),
            input_mappings: Default::default(),
            output_mappings: Default::default(),
            timeout_seconds: None,
        },
    ));

    let engine = test_engine_with_tasks(definition, registry);
    let ctx = engine.start(Default::default()).await.unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Failed);
    let sub = ctx
        .instances()
        .into_iter()
        .find(|i| i.node_id == "sub")
        .unwrap();
    assert_eq!(sub.status, NodeStatus::Failed);
    let error = sub.error.as_deref().unwrap();
    assert!(error.contains("inner"), "error should name the failed child: {error}");
}

#[tokio::test]
async fn subflow_with_missing_file_dead_letters_fatally() {
    let definition = WorkflowDefinition::new("parent").with_node(NodeDefinition::new(
        "sub",
        NodeConfig::Subflow {
            workflow_file_path: Some("does-not-exist.yaml".to_string()),
            workflow: None,
            input_mappings: Default::default(),
            output_mappings: Default::default(),
            timeout_seconds: None,
        },
    ));

    let engine = test_engine_with_tasks(definition, Arc::new(TaskRegistry::new()));
    let ctx = engine.start(Default::default()).await.unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Failed);
    // Fatal path: the triggering envelope went straight to the DLQ.
    assert_eq!(ctx.dead_letter.len(), 1);
    assert!(ctx.dead_letter.list()[0].reason.contains("fatal error"));
}
