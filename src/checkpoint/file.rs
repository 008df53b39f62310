//! File-backed checkpoint store.
//!
//! One `<id>.checkpoint.json` per checkpoint inside a configured
//! directory. Saves are atomic: the document is written to a temp file in
//! the same directory and renamed into place. Listing scans the directory
//! and sorts by modification time, newest first.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::persisted::PersistedCheckpoint;
use super::store::{CheckpointStore, CheckpointSummary};
use super::{Checkpoint, CheckpointError};

const SUFFIX: &str = ".checkpoint.json";

pub struct FileCheckpointStore {
    directory: PathBuf,
}

impl FileCheckpointStore {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, checkpoint_id: &str) -> PathBuf {
        self.directory.join(format!("{checkpoint_id}{SUFFIX}"))
    }

    async fn read_document(path: &Path) -> Result<PersistedCheckpoint, CheckpointError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CheckpointError::storage(format!("read {}: {e}", path.display())))?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| {
                CheckpointError::storage(format!(
                    "create {}: {e}",
                    self.directory.display()
                ))
            })?;

        // Two-pass encode so the stored metadata carries the real size.
        let mut document = PersistedCheckpoint::from(checkpoint);
        let first = serde_json::to_string_pretty(&document)?;
        document.metadata.size_bytes = first.len() as u64;
        let encoded = serde_json::to_string_pretty(&document)?;

        let target = self.path_for(&checkpoint.checkpoint_id);
        let temp = self
            .directory
            .join(format!(".{}.tmp", checkpoint.checkpoint_id));
        tokio::fs::write(&temp, encoded.as_bytes())
            .await
            .map_err(|e| CheckpointError::storage(format!("write {}: {e}", temp.display())))?;
        tokio::fs::rename(&temp, &target)
            .await
            .map_err(|e| CheckpointError::storage(format!("rename {}: {e}", target.display())))?;
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(checkpoint_id);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::storage(format!(
                    "stat {}: {e}",
                    path.display()
                )));
            }
        }
        let document = Self::read_document(&path).await?;
        Ok(Some(Checkpoint::from(document)))
    }

    async fn list(&self) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            // An absent directory simply has no checkpoints yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CheckpointError::storage(format!(
                    "read dir {}: {e}",
                    self.directory.display()
                )));
            }
        };

        let mut found: Vec<(SystemTime, CheckpointSummary)> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(SUFFIX) {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let Ok(document) = Self::read_document(&path).await else {
                tracing::warn!(
                    target: "flowloom::checkpoint",
                    path = %path.display(),
                    "skipping unreadable checkpoint file"
                );
                continue;
            };
            found.push((
                modified,
                CheckpointSummary {
                    checkpoint_id: document.metadata.checkpoint_id,
                    workflow_instance_id: document.metadata.workflow_instance_id,
                    workflow_id: document.metadata.workflow_id,
                    created_at: document.metadata.timestamp,
                    total_nodes: document.metadata.total_nodes,
                    completed_nodes: document.metadata.completed_nodes,
                    size_bytes: document.metadata.size_bytes,
                },
            ));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found.into_iter().map(|(_, summary)| summary).collect())
    }

    async fn remove(&self, checkpoint_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(checkpoint_id);
        tokio::fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CheckpointError::NotFound {
                    checkpoint_id: checkpoint_id.to_string(),
                }
            } else {
                CheckpointError::storage(format!("remove {}: {e}", path.display()))
            }
        })
    }
}
