//! Lifecycle event ordering observed through the event bus.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flowloom::definition::{NodeConfig, NodeConnection, NodeDefinition, WorkflowDefinition};
use flowloom::event_bus::{Event, NodeLifecycleEvent, WorkflowLifecycleEvent};
use flowloom::nodes::TaskRegistry;
use flowloom::types::WorkflowStatus;

use common::fixtures::test_engine_with_tasks;
use common::tasks::{register_failing, register_recorder, ExecutionLog};

fn task_node(node_id: &str, task_name: &str) -> NodeDefinition {
    NodeDefinition::new(
        node_id,
        NodeConfig::Task {
            task_name: task_name.to_string(),
        },
    )
}

#[tokio::test]
async fn start_precedes_terminal_exactly_once_per_instance() {
    let registry = Arc::new(TaskRegistry::new());
    let log = ExecutionLog::new();
    register_recorder(&registry, "work", &log, Duration::from_millis(5));
    let _attempts = register_failing(&registry, "broken");

    let definition = WorkflowDefinition::new("observed")
        .with_node(task_node("first", "work"))
        .with_node(task_node("second", "broken"))
        .with_connection(NodeConnection::complete("first", "second"));

    let engine = test_engine_with_tasks(definition, registry);
    let mut stream = engine.subscribe().unwrap();
    let ctx = engine.start(Default::default()).await.unwrap();
    assert_eq!(ctx.status(), WorkflowStatus::Failed);

    let events = stream.drain();

    // Per instance: exactly one Started, exactly one terminal, in order.
    #[derive(Default)]
    struct Observed {
        started: usize,
        terminal: usize,
        started_first: bool,
    }
    let mut per_instance: HashMap<String, Observed> = HashMap::new();
    for event in &events {
        if let Event::Node(node) = event {
            let Some(instance_id) = node.instance_id() else {
                continue;
            };
            let entry = per_instance.entry(instance_id.to_string()).or_default();
            match node {
                NodeLifecycleEvent::Started { .. } => {
                    entry.started += 1;
                    entry.started_first = entry.terminal == 0;
                }
                NodeLifecycleEvent::Completed { .. }
                | NodeLifecycleEvent::Failed { .. }
                | NodeLifecycleEvent::Cancelled { .. } => entry.terminal += 1,
                NodeLifecycleEvent::Created { .. } => {}
            }
        }
    }
    assert!(!per_instance.is_empty());
    for (instance_id, observed) in &per_instance {
        assert_eq!(observed.started, 1, "instance {instance_id}");
        assert_eq!(observed.terminal, 1, "instance {instance_id}");
        assert!(observed.started_first, "instance {instance_id}");
    }

    // NodeCreated fires once per node before anything runs.
    let created: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            Event::Node(NodeLifecycleEvent::Created { node_id, .. }) => Some(node_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(created.len(), 2);

    // The workflow terminal event reflects the failed run.
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Workflow(WorkflowLifecycleEvent::Failed { .. })
    )));
}

#[tokio::test]
async fn container_events_are_namespaced() {
    let registry = Arc::new(TaskRegistry::new());
    let log = ExecutionLog::new();
    register_recorder(&registry, "inner", &log, Duration::ZERO);

    let definition = WorkflowDefinition::new("nested").with_node(NodeDefinition::new(
        "box",
        NodeConfig::Container {
            execution_mode: Default::default(),
            child_nodes: vec![task_node("child", "inner")],
            child_connections: vec![],
            cancel_siblings_on_failure: false,
        },
    ));

    let engine = test_engine_with_tasks(definition, registry);
    let mut stream = engine.subscribe().unwrap();
    let ctx = engine.start(Default::default()).await.unwrap();
    assert_eq!(ctx.status(), WorkflowStatus::Completed);

    let events = stream.drain();
    assert!(
        events.iter().any(|e| e.node_id() == Some("box/child")),
        "expected a namespaced child event, got {events:?}"
    );
}
