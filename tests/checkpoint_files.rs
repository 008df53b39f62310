//! File checkpoint store behavior: layout, atomicity, listing order.

use rustc_hash::FxHashMap;
use serde_json::json;

use flowloom::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore};
use flowloom::types::WorkflowStatus;

fn checkpoint(id: &str, workflow_id: &str) -> Checkpoint {
    let mut variables = FxHashMap::default();
    variables.insert("k".to_string(), json!("v"));
    Checkpoint {
        checkpoint_id: id.to_string(),
        workflow_instance_id: format!("inst-{id}"),
        workflow_id: workflow_id.to_string(),
        created_at: chrono::Utc::now(),
        description: None,
        status: WorkflowStatus::Paused,
        started_at: chrono::Utc::now(),
        ended_at: None,
        variables,
        node_instances: Vec::new(),
        queues: FxHashMap::default(),
        definition: None,
    }
}

#[tokio::test]
async fn save_writes_one_named_file_and_no_temp_residue() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    store.save(&checkpoint("cp-1", "wf")).await.unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["cp-1.checkpoint.json"]);
}

#[tokio::test]
async fn load_roundtrips_variables_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    store.save(&checkpoint("cp-2", "wf")).await.unwrap();

    let loaded = store.load("cp-2").await.unwrap().unwrap();
    assert_eq!(loaded.checkpoint_id, "cp-2");
    assert_eq!(loaded.status, WorkflowStatus::Paused);
    assert_eq!(loaded.variables.get("k"), Some(&json!("v")));
    assert!(store.load("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn listing_is_sorted_by_modification_time_desc() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    store.save(&checkpoint("older", "wf")).await.unwrap();
    // File mtimes need to differ for the ordering to be observable.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    store.save(&checkpoint("newer", "wf")).await.unwrap();

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].checkpoint_id, "newer");
    assert_eq!(listed[1].checkpoint_id, "older");
    assert!(listed[0].size_bytes > 0);
}

#[tokio::test]
async fn list_on_missing_directory_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path().join("not-created-yet"));
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn remove_deletes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path());
    store.save(&checkpoint("cp-3", "wf")).await.unwrap();
    store.remove("cp-3").await.unwrap();
    assert!(store.load("cp-3").await.unwrap().is_none());
    assert!(matches!(
        store.remove("cp-3").await,
        Err(CheckpointError::NotFound { .. })
    ));
}
