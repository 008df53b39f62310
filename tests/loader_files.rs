//! Loading workflow definitions from disk, including subflow files.

mod common;

use std::sync::Arc;

use serde_json::json;

use flowloom::definition::{NodeConfig, NodeDefinition, WorkflowDefinition};
use flowloom::engine::WorkflowEngine;
use flowloom::event_bus::EventBus;
use flowloom::loader;
use flowloom::nodes::{NodeServices, TaskRegistry};
use flowloom::types::WorkflowStatus;

use common::fixtures::test_config;

const CHILD_YAML: &str = r#"
workflowId: doubler
workflowName: Doubler
nodes:
  - nodeId: double
    runtimeType: Script
    script: 'SetGlobal("result", GetGlobal("value") * 2)'
"#;

#[tokio::test]
async fn load_workflow_file_parses_and_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doubler.yaml");
    tokio::fs::write(&path, CHILD_YAML).await.unwrap();

    let definition = loader::load_workflow_file(&path).await.unwrap();
    assert_eq!(definition.workflow_id, "doubler");
    assert_eq!(definition.nodes.len(), 1);
}

#[tokio::test]
async fn subflow_resolves_relative_paths_against_base_dir() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("doubler.yaml"), CHILD_YAML)
        .await
        .unwrap();

    let definition = WorkflowDefinition::new("parent")
        .with_variable("x", json!(21))
        .with_node(NodeDefinition::new(
            "sub",
            NodeConfig::Subflow {
                workflow_file_path: Some("doubler.yaml".to_string()),
                workflow: None,
                input_mappings: [("x".to_string(), "value".to_string())].into_iter().collect(),
                output_mappings: [("result".to_string(), "answer".to_string())]
                    .into_iter()
                    .collect(),
                timeout_seconds: Some(10),
            },
        ));

    let services = Arc::new(NodeServices {
        tasks: Arc::new(TaskRegistry::new()),
        base_dir: dir.path().to_path_buf(),
        ..NodeServices::default()
    });
    let engine = WorkflowEngine::new(definition)
        .with_config(test_config())
        .with_event_bus(EventBus::silent())
        .with_services(services);

    let ctx = engine.start(Default::default()).await.unwrap();
    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    assert_eq!(ctx.get_variable("answer"), Some(json!(42)));
}
