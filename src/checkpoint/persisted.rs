//! Serde-friendly persisted forms, decoupled from in-memory state.
//!
//! Persistent backends serialize [`PersistedCheckpoint`] rather than the
//! in-memory [`Checkpoint`] so the on-disk schema stays stable: metadata
//! (ids, timestamp, node counts, size), context (status, variables,
//! times), node instances, and per-node message queues. Scalars, dates,
//! GUID strings, and nested maps/lists round-trip verbatim. This module
//! performs no I/O; it is pure data transformation.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::store::completed_count;
use super::{Checkpoint, SerializedMessage};
use crate::context::{IoMap, NodeExecutionContext, NodeInstance};
use crate::definition::WorkflowDefinition;
use crate::types::{NodeStatus, WorkflowStatus};

/// The stable on-disk checkpoint document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCheckpoint {
    pub metadata: PersistedMetadata,
    pub context: PersistedContext,
    #[serde(default)]
    pub node_instances: Vec<PersistedNodeInstance>,
    #[serde(default)]
    pub message_queues: FxHashMap<String, Vec<SerializedMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<WorkflowDefinition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMetadata {
    pub checkpoint_id: String,
    pub workflow_instance_id: String,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub pending_nodes: usize,
    /// Document size; filled in by the storage backend after encoding.
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedContext {
    pub status: WorkflowStatus,
    #[serde(default)]
    pub variables: FxHashMap<String, Value>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNodeInstance {
    pub node_instance_id: String,
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub source_port: String,
    #[serde(default)]
    pub input_data: IoMap,
    #[serde(default)]
    pub output_data: IoMap,
}

impl From<&Checkpoint> for PersistedCheckpoint {
    fn from(cp: &Checkpoint) -> Self {
        let total_nodes = cp
            .definition
            .as_ref()
            .map_or(cp.node_instances.len(), |d| d.nodes.len());
        let completed_nodes = completed_count(cp);
        Self {
            metadata: PersistedMetadata {
                checkpoint_id: cp.checkpoint_id.clone(),
                workflow_instance_id: cp.workflow_instance_id.clone(),
                workflow_id: cp.workflow_id.clone(),
                timestamp: cp.created_at,
                total_nodes,
                completed_nodes,
                pending_nodes: total_nodes.saturating_sub(completed_nodes),
                size_bytes: 0,
                description: cp.description.clone(),
            },
            context: PersistedContext {
                status: cp.status,
                variables: cp.variables.clone(),
                start_time: cp.started_at,
                end_time: cp.ended_at,
            },
            node_instances: cp
                .node_instances
                .iter()
                .map(|inst| PersistedNodeInstance {
                    node_instance_id: inst.instance_id.clone(),
                    node_id: inst.node_id.clone(),
                    status: inst.status,
                    start_time: inst.started_at,
                    end_time: inst.ended_at,
                    error_message: inst.error.clone(),
                    source_port: inst.source_port.clone(),
                    input_data: inst.context.input.clone(),
                    output_data: inst.context.output.clone(),
                })
                .collect(),
            message_queues: cp.queues.clone(),
            definition: cp.definition.clone(),
        }
    }
}

impl From<PersistedCheckpoint> for Checkpoint {
    fn from(doc: PersistedCheckpoint) -> Self {
        let workflow_instance_id = doc.metadata.workflow_instance_id.clone();
        Self {
            checkpoint_id: doc.metadata.checkpoint_id,
            workflow_instance_id: workflow_instance_id.clone(),
            workflow_id: doc.metadata.workflow_id,
            created_at: doc.metadata.timestamp,
            description: doc.metadata.description,
            status: doc.context.status,
            started_at: doc.context.start_time,
            ended_at: doc.context.end_time,
            variables: doc.context.variables,
            node_instances: doc
                .node_instances
                .into_iter()
                .map(|inst| NodeInstance {
                    instance_id: inst.node_instance_id,
                    node_id: inst.node_id,
                    workflow_instance_id: workflow_instance_id.clone(),
                    status: inst.status,
                    started_at: inst.start_time,
                    ended_at: inst.end_time,
                    error: inst.error_message,
                    error_detail: None,
                    source_port: inst.source_port,
                    context: NodeExecutionContext {
                        input: inst.input_data,
                        output: inst.output_data,
                        ..NodeExecutionContext::default()
                    },
                })
                .collect(),
            queues: doc.message_queues,
            definition: doc.definition,
        }
    }
}
