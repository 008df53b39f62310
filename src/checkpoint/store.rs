//! Checkpoint storage trait and the in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{Checkpoint, CheckpointError};

/// Listing entry describing one stored checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub workflow_instance_id: String,
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub size_bytes: u64,
}

/// Pluggable durable storage for checkpoints.
///
/// Saves must be atomic: a reader never observes a partially written
/// checkpoint. Saving the same checkpoint id twice replaces the stored
/// snapshot.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// `None` when the id is unknown.
    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// All stored checkpoints, newest first.
    async fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError>;

    async fn remove(&self, checkpoint_id: &str) -> Result<(), CheckpointError>;
}

/// Volatile process-local store; suitable for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<FxHashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.inner
            .write()
            .insert(checkpoint.checkpoint_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.inner.read().get(checkpoint_id).cloned())
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let mut summaries: Vec<CheckpointSummary> = self
            .inner
            .read()
            .values()
            .map(|cp| CheckpointSummary {
                checkpoint_id: cp.checkpoint_id.clone(),
                workflow_instance_id: cp.workflow_instance_id.clone(),
                workflow_id: cp.workflow_id.clone(),
                created_at: cp.created_at,
                total_nodes: cp
                    .definition
                    .as_ref()
                    .map_or(cp.node_instances.len(), |d| d.nodes.len()),
                completed_nodes: completed_count(cp),
                size_bytes: 0,
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn remove(&self, checkpoint_id: &str) -> Result<(), CheckpointError> {
        match self.inner.write().remove(checkpoint_id) {
            Some(_) => Ok(()),
            None => Err(CheckpointError::NotFound {
                checkpoint_id: checkpoint_id.to_string(),
            }),
        }
    }
}

pub(crate) fn completed_count(checkpoint: &Checkpoint) -> usize {
    use crate::types::NodeStatus;
    let mut seen = Vec::new();
    for inst in &checkpoint.node_instances {
        if inst.status == NodeStatus::Completed && !seen.contains(&inst.node_id.as_str()) {
            seen.push(inst.node_id.as_str());
        }
    }
    seen.len()
}
