//! Pause, checkpoint, and resume across engine instances.

mod common;

use std::sync::Arc;
use std::time::Duration;

use flowloom::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
use flowloom::definition::{NodeConfig, NodeConnection, NodeDefinition, WorkflowDefinition};
use flowloom::nodes::TaskRegistry;
use flowloom::types::WorkflowStatus;

use common::fixtures::test_engine_with_tasks;
use common::tasks::{register_gate, register_noop_task, register_recorder, ExecutionLog};

fn five_node_chain() -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new("fivesteps")
        .with_node(NodeDefinition::new(
            "a",
            NodeConfig::Task {
                task_name: "quick".to_string(),
            },
        ))
        .with_node(NodeDefinition::new(
            "b",
            NodeConfig::Task {
                task_name: "quick".to_string(),
            },
        ))
        .with_node(NodeDefinition::new(
            "c",
            NodeConfig::Task {
                task_name: "quick".to_string(),
            },
        ))
        .with_node(NodeDefinition::new(
            "gate",
            NodeConfig::Task {
                task_name: "gate".to_string(),
            },
        ))
        .with_node(NodeDefinition::new(
            "e",
            NodeConfig::Task {
                task_name: "quick".to_string(),
            },
        ))
        .with_connection(NodeConnection::complete("a", "b"))
        .with_connection(NodeConnection::complete("b", "c"))
        .with_connection(NodeConnection::complete("c", "gate"))
        .with_connection(NodeConnection::complete("gate", "e"));
    definition.allow_pause = true;
    definition
}

#[tokio::test]
async fn pause_checkpoint_resume_completes_all_nodes() {
    let definition = five_node_chain();

    // First engine: the gate blocks until cancelled, so pausing catches
    // the run with three nodes done and two pending.
    let registry = Arc::new(TaskRegistry::new());
    let log = ExecutionLog::new();
    register_recorder(&registry, "quick", &log, Duration::from_millis(5));
    register_gate(&registry, "gate");

    let engine = test_engine_with_tasks(definition.clone(), registry);
    let paused = {
        let run = engine.start(Default::default());
        let pauser = async {
            // Let a, b, c finish and the gate start.
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(engine.request_pause());
        };
        let (ctx, ()) = tokio::join!(run, pauser);
        ctx.unwrap()
    };

    assert_eq!(paused.status(), WorkflowStatus::Paused);
    let done = paused.completed_node_ids();
    assert!(done.contains(&"a".to_string()));
    assert!(done.contains(&"b".to_string()));
    assert!(done.contains(&"c".to_string()));
    assert!(!done.contains(&"gate".to_string()));
    assert!(!done.contains(&"e".to_string()));

    // Persist through the file store and load it back.
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    let checkpoint =
        Checkpoint::capture(&paused, Some(&definition), Some("mid-run".to_string())).unwrap();
    assert!(checkpoint.pending_messages() >= 1);
    store.save(&checkpoint).await.unwrap();
    let restored = store.load(&checkpoint.checkpoint_id).await.unwrap().unwrap();

    // Second engine: the gate completes immediately now.
    let registry2 = Arc::new(TaskRegistry::new());
    register_recorder(&registry2, "quick", &ExecutionLog::new(), Duration::ZERO);
    register_noop_task(&registry2, "gate");

    let engine2 = test_engine_with_tasks(definition.clone(), registry2);
    let ctx2 = engine2.resume(restored).await.unwrap();

    assert_eq!(ctx2.status(), WorkflowStatus::Completed);
    let completed = ctx2.completed_node_ids();
    for node in ["a", "b", "c", "gate", "e"] {
        assert!(
            completed.contains(&node.to_string()),
            "{node} missing from completed set {completed:?}"
        );
    }
}

#[tokio::test]
async fn resume_rejects_checkpoints_from_other_workflows() {
    let definition = five_node_chain();
    let registry = Arc::new(TaskRegistry::new());
    register_noop_task(&registry, "quick");
    register_noop_task(&registry, "gate");
    let engine = test_engine_with_tasks(definition, registry);

    let other = WorkflowDefinition::new("different")
        .with_node(NodeDefinition::new("x", NodeConfig::Noop));
    let other_registry = Arc::new(TaskRegistry::new());
    let other_engine = test_engine_with_tasks(other.clone(), other_registry);
    let ctx = other_engine.start(Default::default()).await.unwrap();
    let checkpoint = Checkpoint::capture(&ctx, Some(&other), None).unwrap();

    assert!(engine.resume(checkpoint).await.is_err());
}
