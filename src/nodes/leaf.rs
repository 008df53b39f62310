//! Leaf nodes: noop, in-process task, and expression script.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::task::TaskContext;
use super::{NodeError, NodeOutcome, NodeRun, WorkflowNode};
use crate::context::NodeExecutionContext;
use crate::definition::{NodeConfig, NodeDefinition};
use crate::expression::{self, Environment};
use crate::types::RuntimeType;

/// Pass-through node: completes immediately with its input as output.
pub struct NoopNode {
    node_id: String,
}

impl NoopNode {
    pub fn from_definition(def: &NodeDefinition) -> Self {
        Self {
            node_id: def.node_id.clone(),
        }
    }
}

#[async_trait]
impl WorkflowNode for NoopNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Noop
    }

    async fn execute(
        &self,
        _run: &NodeRun,
        input: NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let mut context = input;
        context.output = context.input.clone();
        Ok(NodeOutcome::with_context(context))
    }
}

/// Runs a named handler resolved from the engine's task registry.
pub struct TaskNode {
    node_id: String,
    task_name: String,
}

impl TaskNode {
    pub fn from_definition(def: &NodeDefinition) -> Result<Self, NodeError> {
        match &def.config {
            NodeConfig::Task { task_name } => Ok(Self {
                node_id: def.node_id.clone(),
                task_name: task_name.clone(),
            }),
            other => Err(NodeError::InvalidConfiguration {
                message: format!("expected Task configuration, got {}", other.runtime_type()),
            }),
        }
    }
}

#[async_trait]
impl WorkflowNode for TaskNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Task
    }

    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let handler =
            run.services
                .tasks
                .get(&self.task_name)
                .ok_or_else(|| NodeError::TaskNotFound {
                    name: self.task_name.clone(),
                })?;
        let ctx = TaskContext {
            input: input.input.clone(),
            variables: run.workflow.variables.clone(),
            cancel: cancel.clone(),
        };
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(NodeError::cancelled("task cancelled")),
            result = handler.run(ctx) => result?,
        };
        let mut context = input;
        context.output = output;
        Ok(NodeOutcome::with_context(context))
    }
}

/// Evaluates a program through the expression service. `SetOutput` calls
/// become the node's output data; the program's final value lands under
/// `result`.
pub struct ScriptNode {
    node_id: String,
    source: String,
}

impl ScriptNode {
    pub fn from_definition(def: &NodeDefinition) -> Result<Self, NodeError> {
        match &def.config {
            NodeConfig::Script { script } => Ok(Self {
                node_id: def.node_id.clone(),
                source: script.clone(),
            }),
            other => Err(NodeError::InvalidConfiguration {
                message: format!("expected Script configuration, got {}", other.runtime_type()),
            }),
        }
    }
}

#[async_trait]
impl WorkflowNode for ScriptNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Script
    }

    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let env = Environment::new(
            run.workflow.variables.clone(),
            input.input.clone(),
            input.local.clone(),
        );
        let value = expression::evaluate(&self.source, &env)?;
        let mut context = input;
        context.output = env.take_output();
        context.output.insert("result".into(), value);
        Ok(NodeOutcome::with_context(context))
    }
}
