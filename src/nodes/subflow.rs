//! Subflow node: recursive engine invocation with variable mapping.
//!
//! Loads (or receives inline) a child workflow definition, maps parent
//! variables into the child via `inputMappings` (parent name → child
//! name), runs the child to a terminal status on a fresh variable scope,
//! then maps child variables back via `outputMappings` (child name →
//! parent name). Child node lifecycle events are re-broadcast upward
//! namespaced by the subflow node id.
//!
//! A missing or unreadable workflow file is a fatal error: the triggering
//! envelope goes straight to the dead-letter queue without retry.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{NodeError, NodeOutcome, NodeRun, WorkflowNode};
use crate::context::NodeExecutionContext;
use crate::definition::{NodeConfig, NodeDefinition, WorkflowDefinition};
use crate::engine::WorkflowEngine;
use crate::event_bus::NamespacedEmitter;
use crate::loader::{self, LoaderError};
use crate::types::{RuntimeType, WorkflowStatus};

pub struct SubflowNode {
    node_id: String,
    workflow_file_path: Option<String>,
    inline: Option<WorkflowDefinition>,
    input_mappings: FxHashMap<String, String>,
    output_mappings: FxHashMap<String, String>,
    timeout: Option<Duration>,
}

impl SubflowNode {
    pub fn from_definition(def: &NodeDefinition) -> Result<Self, NodeError> {
        match &def.config {
            NodeConfig::Subflow {
                workflow_file_path,
                workflow,
                input_mappings,
                output_mappings,
                timeout_seconds,
            } => Ok(Self {
                node_id: def.node_id.clone(),
                workflow_file_path: workflow_file_path.clone(),
                inline: workflow.as_deref().cloned(),
                input_mappings: input_mappings.clone(),
                output_mappings: output_mappings.clone(),
                timeout: timeout_seconds.map(Duration::from_secs),
            }),
            other => Err(NodeError::InvalidConfiguration {
                message: format!("expected Subflow configuration, got {}", other.runtime_type()),
            }),
        }
    }

    async fn resolve_definition(&self, base_dir: &Path) -> Result<WorkflowDefinition, NodeError> {
        if let Some(inline) = &self.inline {
            return Ok(inline.clone());
        }
        let Some(path) = &self.workflow_file_path else {
            return Err(NodeError::InvalidConfiguration {
                message: "subflow has neither a file path nor an inline definition".to_string(),
            });
        };
        let resolved = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            base_dir.join(path)
        };
        loader::load_workflow_file(&resolved).await.map_err(|e| match e {
            // An unparsable or invalid file is still a missing capability
            // from the engine's point of view: fatal, no retry.
            LoaderError::Io { .. } | LoaderError::Parse { .. } | LoaderError::Invalid(_) => {
                NodeError::SubflowLoad {
                    path: resolved.display().to_string(),
                    message: e.to_string(),
                }
            }
        })
    }
}

#[async_trait]
impl WorkflowNode for SubflowNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Subflow
    }

    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let definition = self.resolve_definition(&run.services.base_dir).await?;
        definition.validate().map_err(|e| NodeError::InvalidConfiguration {
            message: e.to_string(),
        })?;

        // Parent → child variable mapping.
        let mut child_vars: FxHashMap<String, Value> = FxHashMap::default();
        for (parent_name, child_name) in &self.input_mappings {
            let value = run
                .workflow
                .get_variable(parent_name)
                .unwrap_or(Value::Null);
            child_vars.insert(child_name.clone(), value);
        }

        let engine = WorkflowEngine::new(definition)
            .with_config(run.config.clone())
            .with_services(run.services.clone())
            .with_emitter(Arc::new(NamespacedEmitter::new(
                run.emitter.clone(),
                self.node_id.clone(),
            )))
            .with_parent_cancellation(cancel.clone());

        let started = engine.start(child_vars);
        let child = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, started).await {
                Ok(result) => result,
                Err(_) => {
                    engine.cancellation_token().cancel();
                    return Err(NodeError::cancelled(format!(
                        "sub-workflow `{}` timed out after {limit:?}",
                        self.node_id
                    )));
                }
            },
            None => started.await,
        }
        .map_err(|e| NodeError::ChildWorkflow {
            message: e.to_string(),
        })?;

        match child.status() {
            WorkflowStatus::Completed => {
                // Child → parent variable mapping.
                let mut context = input;
                context.output = context.input.clone();
                for (child_name, parent_name) in &self.output_mappings {
                    let value = child.get_variable(child_name).unwrap_or(Value::Null);
                    run.workflow.set_variable(parent_name, value.clone());
                    context.output.insert(parent_name.clone(), value);
                }
                Ok(NodeOutcome::with_context(context))
            }
            WorkflowStatus::Cancelled => {
                Err(NodeError::cancelled("sub-workflow cancelled"))
            }
            _ => Err(NodeError::ChildWorkflow {
                message: format!(
                    "sub-workflow `{}` failed: {}",
                    self.node_id,
                    child.errors().join("; ")
                ),
            }),
        }
    }
}
