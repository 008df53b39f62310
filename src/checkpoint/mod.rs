//! Checkpoint persistence: snapshot and restore of a running workflow.
//!
//! A [`Checkpoint`] captures everything needed to resume a run: status,
//! variables, node-instance history, and the serialized contents of every
//! node queue. Envelope status and lease are preserved verbatim, so
//! envelopes that were InFlight at snapshot time restore as InFlight and
//! flow through the buffer's just-in-time lease recovery on resume.
//!
//! Storage is pluggable through [`CheckpointStore`]; this module ships an
//! in-memory store and a file backend writing one
//! `<id>.checkpoint.json` per checkpoint with atomic temp-file renames.

mod file;
mod persisted;
mod store;

pub use file::FileCheckpointStore;
pub use persisted::{
    PersistedCheckpoint, PersistedContext, PersistedMetadata, PersistedNodeInstance,
};
pub use store::{CheckpointStore, CheckpointSummary, InMemoryCheckpointStore};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::context::{NodeInstance, WorkflowExecutionContext};
use crate::definition::WorkflowDefinition;
use crate::envelope::{EnvelopeStatus, Lease, MessageEnvelope};
use crate::messages::WorkflowMessage;
use crate::types::WorkflowStatus;

/// Errors raised by checkpoint capture, storage, and restore.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint serialization failed: {source}")]
    #[diagnostic(code(flowloom::checkpoint::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    #[error("checkpoint storage error: {message}")]
    #[diagnostic(code(flowloom::checkpoint::storage))]
    Storage { message: String },

    #[error("checkpoint not found: {checkpoint_id}")]
    #[diagnostic(code(flowloom::checkpoint::not_found))]
    NotFound { checkpoint_id: String },
}

impl CheckpointError {
    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

/// A durable snapshot of one workflow run.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub workflow_instance_id: String,
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
    pub description: Option<String>,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub variables: FxHashMap<String, Value>,
    pub node_instances: Vec<NodeInstance>,
    /// Node id → pending (Ready or InFlight) messages.
    pub queues: FxHashMap<String, Vec<SerializedMessage>>,
    /// The definition this run executes, for audit and validation.
    pub definition: Option<WorkflowDefinition>,
}

impl Checkpoint {
    /// Snapshot the current state of a run.
    pub fn capture(
        ctx: &WorkflowExecutionContext,
        definition: Option<&WorkflowDefinition>,
        description: Option<String>,
    ) -> Result<Self, CheckpointError> {
        let mut queues = FxHashMap::default();
        for (node_id, queue) in &ctx.node_queues {
            let mut messages = Vec::new();
            for envelope in queue.pending() {
                if matches!(
                    envelope.status,
                    EnvelopeStatus::Ready | EnvelopeStatus::InFlight
                ) {
                    messages.push(SerializedMessage::from_envelope(&envelope)?);
                }
            }
            if !messages.is_empty() {
                queues.insert(node_id.clone(), messages);
            }
        }

        Ok(Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            workflow_instance_id: ctx.instance_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            created_at: Utc::now(),
            description,
            status: ctx.status(),
            started_at: ctx.started_at,
            ended_at: ctx.ended_at(),
            variables: ctx.variables_snapshot(),
            node_instances: ctx.instances(),
            queues,
            definition: definition.cloned(),
        })
    }

    /// Total pending messages across all queues.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }
}

/// Wire form of one queued envelope inside a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedMessage {
    pub message_id: String,
    pub message_type: String,
    /// The message payload as a nested JSON string, so the checkpoint
    /// schema stays stable across payload evolution.
    pub payload_json: String,
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    /// `Ready` or `InFlight`; restored verbatim.
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<SerializedLease>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

fn default_status() -> String {
    "Ready".to_string()
}

/// Wire form of a lease held at snapshot time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedLease {
    pub handler_id: String,
    pub checked_out_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SerializedMessage {
    pub fn from_envelope(envelope: &MessageEnvelope) -> Result<Self, CheckpointError> {
        Ok(Self {
            message_id: envelope.message_id.clone(),
            message_type: envelope.message_type.clone(),
            payload_json: serde_json::to_string(&*envelope.payload)?,
            retry_count: envelope.retry_count,
            max_retries: envelope.max_retries,
            status: match envelope.status {
                EnvelopeStatus::InFlight => "InFlight".to_string(),
                _ => "Ready".to_string(),
            },
            lease: envelope.lease.as_ref().map(|l| SerializedLease {
                handler_id: l.handler_id.clone(),
                checked_out_at: l.checked_out_at,
                expires_at: l.expires_at,
            }),
            enqueued_at: envelope.enqueued_at,
            not_before: envelope.not_before,
        })
    }

    /// Rebuild the envelope, preserving status and lease verbatim.
    pub fn to_envelope(&self) -> Result<MessageEnvelope, CheckpointError> {
        let payload: WorkflowMessage = serde_json::from_str(&self.payload_json)?;
        let status = if self.status == "InFlight" {
            EnvelopeStatus::InFlight
        } else {
            EnvelopeStatus::Ready
        };
        Ok(MessageEnvelope {
            message_id: self.message_id.clone(),
            message_type: self.message_type.clone(),
            payload: Arc::new(payload),
            status,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            lease: self.lease.as_ref().map(|l| Lease {
                handler_id: l.handler_id.clone(),
                checked_out_at: l.checked_out_at,
                expires_at: l.expires_at,
            }),
            dedupe_key: None,
            enqueued_at: self.enqueued_at,
            not_before: self.not_before,
            sequence: 0,
        })
    }
}
