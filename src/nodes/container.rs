//! Container node: a nested child graph executed as a unit.
//!
//! The container runs its children through a nested engine sharing the
//! parent's variable scope. In Sequential mode children without explicit
//! child connections are chained in definition order; in Parallel mode
//! children with no internal dependencies start concurrently (they are
//! the child graph's entry points). Child lifecycle and progress events
//! are re-published upward with hierarchical keys (`container/child`).
//!
//! The container completes only when all started children have reached a
//! terminal state: Completed iff every child completed, Failed if any
//! child failed without an internal compensation path.

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{NodeError, NodeOutcome, NodeRun, WorkflowNode};
use crate::context::NodeExecutionContext;
use crate::definition::{
    ExecutionMode, NodeConfig, NodeConnection, NodeDefinition, WorkflowDefinition,
};
use crate::engine::WorkflowEngine;
use crate::event_bus::NamespacedEmitter;
use crate::types::{RuntimeType, WorkflowStatus};
use std::sync::Arc;

pub struct ContainerNode {
    node_id: String,
    execution_mode: ExecutionMode,
    child_nodes: Vec<NodeDefinition>,
    child_connections: Vec<NodeConnection>,
    cancel_siblings_on_failure: bool,
}

impl ContainerNode {
    pub fn from_definition(def: &NodeDefinition) -> Result<Self, NodeError> {
        match &def.config {
            NodeConfig::Container {
                execution_mode,
                child_nodes,
                child_connections,
                cancel_siblings_on_failure,
            } => Ok(Self {
                node_id: def.node_id.clone(),
                execution_mode: *execution_mode,
                child_nodes: child_nodes.clone(),
                child_connections: child_connections.clone(),
                cancel_siblings_on_failure: *cancel_siblings_on_failure,
            }),
            other => Err(NodeError::InvalidConfiguration {
                message: format!(
                    "expected Container configuration, got {}",
                    other.runtime_type()
                ),
            }),
        }
    }

    /// The child graph as a standalone definition. Sequential containers
    /// without explicit connections get a synthesized Complete chain in
    /// definition order.
    fn child_definition(&self, parent_workflow_id: &str) -> WorkflowDefinition {
        let connections = if self.child_connections.is_empty()
            && self.execution_mode == ExecutionMode::Sequential
        {
            self.child_nodes
                .windows(2)
                .map(|pair| NodeConnection::complete(&pair[0].node_id, &pair[1].node_id))
                .collect()
        } else {
            self.child_connections.clone()
        };

        let mut def = WorkflowDefinition::new(&format!("{parent_workflow_id}/{}", self.node_id));
        def.nodes = self.child_nodes.clone();
        def.connections = connections;
        def
    }
}

#[async_trait]
impl WorkflowNode for ContainerNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Container
    }

    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let definition = self.child_definition(&run.workflow.workflow_id);
        let mut config = run.config.clone();
        config.cancel_on_unrouted_failure = self.cancel_siblings_on_failure;

        let engine = WorkflowEngine::new(definition)
            .with_config(config)
            .with_services(run.services.clone())
            .with_emitter(Arc::new(NamespacedEmitter::new(
                run.emitter.clone(),
                self.node_id.clone(),
            )))
            .with_shared_variables(run.workflow.variables.clone())
            .with_parent_cancellation(cancel.clone());

        let child = engine
            .start(Default::default())
            .await
            .map_err(|e| NodeError::ChildWorkflow {
                message: e.to_string(),
            })?;

        match child.status() {
            WorkflowStatus::Completed => {
                let instances = child.instances();
                let mut context = input;
                context.output = context.input.clone();
                context
                    .output
                    .insert("completedNodes".into(), json!(child.completed_node_ids().len()));
                context
                    .output
                    .insert("childInstances".into(), json!(instances.len()));
                Ok(NodeOutcome::with_context(context))
            }
            WorkflowStatus::Cancelled => Err(NodeError::cancelled("container children cancelled")),
            _ => Err(NodeError::ChildWorkflow {
                message: format!(
                    "container `{}` children failed: {}",
                    self.node_id,
                    child.errors().join("; ")
                ),
            }),
        }
    }
}
