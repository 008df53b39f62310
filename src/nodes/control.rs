//! Single-port branching and feedback-loop iteration nodes.
//!
//! IfElse and Switch evaluate one expression and pick an outcome port;
//! ForEach walks a collection, emitting one `NodeNext` per element before
//! completing; While implements the feedback-loop iteration protocol:
//! one condition evaluation per execution, routing on `IterationCheck`
//! while the condition holds and exiting on `LoopBody`. Neither loop node
//! blocks across iterations; re-execution happens through the graph's
//! feedback edge, which keeps the engine's completion detector uniform.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use super::{NodeError, NodeOutcome, NodeRun, WorkflowNode};
use crate::context::{META_ITERATION_INDEX, META_ITEM_VARIABLE, NodeExecutionContext};
use crate::definition::{
    NodeConfig, NodeDefinition, PORT_DEFAULT_CASE, PORT_ITERATION_CHECK, PORT_LOOP_BODY,
};
use crate::expression::{self, Environment};
use crate::types::RuntimeType;

fn environment(run: &NodeRun, input: &NodeExecutionContext) -> Environment {
    Environment::new(
        run.workflow.variables.clone(),
        input.input.clone(),
        input.local.clone(),
    )
}

/// Two-way branch on a boolean condition.
pub struct IfElseNode {
    node_id: String,
    condition: String,
}

impl IfElseNode {
    pub const PORT_TRUE: &'static str = "True";
    pub const PORT_FALSE: &'static str = "False";

    pub fn from_definition(def: &NodeDefinition) -> Result<Self, NodeError> {
        match &def.config {
            NodeConfig::IfElse { condition } => Ok(Self {
                node_id: def.node_id.clone(),
                condition: condition.clone(),
            }),
            other => Err(NodeError::InvalidConfiguration {
                message: format!("expected IfElse configuration, got {}", other.runtime_type()),
            }),
        }
    }
}

#[async_trait]
impl WorkflowNode for IfElseNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::IfElse
    }

    fn ports(&self) -> Vec<String> {
        vec![Self::PORT_TRUE.to_string(), Self::PORT_FALSE.to_string()]
    }

    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let env = environment(run, &input);
        let verdict = expression::evaluate_bool(&self.condition, &env)?;
        let port = if verdict {
            Self::PORT_TRUE
        } else {
            Self::PORT_FALSE
        };
        let mut context = input;
        context.output = context.input.clone();
        context.output.insert("condition".into(), json!(verdict));
        Ok(NodeOutcome::with_context(context).on_port(port))
    }
}

/// Multi-way branch: the selector expression's string value names the
/// outcome port. When a case list is configured, values outside it fall
/// through to the default sentinel port; the case → target mapping itself
/// lives in the connections.
pub struct SwitchNode {
    node_id: String,
    selector: String,
    cases: Vec<String>,
}

impl SwitchNode {
    pub fn from_definition(def: &NodeDefinition) -> Result<Self, NodeError> {
        match &def.config {
            NodeConfig::Switch { selector, cases } => Ok(Self {
                node_id: def.node_id.clone(),
                selector: selector.clone(),
                cases: cases.clone(),
            }),
            other => Err(NodeError::InvalidConfiguration {
                message: format!("expected Switch configuration, got {}", other.runtime_type()),
            }),
        }
    }

    fn port_for(&self, value: &Value) -> String {
        let key = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if key.is_empty() {
            return PORT_DEFAULT_CASE.to_string();
        }
        if self.cases.is_empty() || self.cases.iter().any(|c| c.eq_ignore_ascii_case(&key)) {
            key
        } else {
            PORT_DEFAULT_CASE.to_string()
        }
    }
}

#[async_trait]
impl WorkflowNode for SwitchNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Switch
    }

    fn ports(&self) -> Vec<String> {
        let mut ports = self.cases.clone();
        ports.push(PORT_DEFAULT_CASE.to_string());
        ports
    }

    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let env = environment(run, &input);
        let value = expression::evaluate(&self.selector, &env)?;
        let port = self.port_for(&value);
        let mut context = input;
        context.output = context.input.clone();
        context.output.insert("case".into(), value);
        Ok(NodeOutcome::with_context(context).on_port(port))
    }
}

/// Collection iteration: evaluates the collection once, emits one
/// `NodeNext(index, item)` per element toward the `LoopBody` port, then
/// completes on `LoopBody`.
pub struct ForEachNode {
    node_id: String,
    collection: String,
    item_variable: String,
}

impl ForEachNode {
    pub fn from_definition(def: &NodeDefinition) -> Result<Self, NodeError> {
        match &def.config {
            NodeConfig::ForEach {
                collection,
                item_variable,
            } => Ok(Self {
                node_id: def.node_id.clone(),
                collection: collection.clone(),
                item_variable: item_variable.clone(),
            }),
            other => Err(NodeError::InvalidConfiguration {
                message: format!("expected ForEach configuration, got {}", other.runtime_type()),
            }),
        }
    }
}

#[async_trait]
impl WorkflowNode for ForEachNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::ForEach
    }

    fn ports(&self) -> Vec<String> {
        vec![PORT_LOOP_BODY.to_string()]
    }

    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let env = environment(run, &input);
        let items = match expression::evaluate(&self.collection, &env)? {
            Value::Array(items) => items,
            other => {
                return Err(NodeError::InvalidConfiguration {
                    message: format!("collection expression did not yield a list (got {other})"),
                });
            }
        };

        let total = items.len();
        for (index, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(NodeError::cancelled("for-each interrupted"));
            }
            // Iteration context: a copy of this node's input plus the item
            // bound under the configured variable name.
            let mut iteration = NodeExecutionContext::with_input(input.input.clone());
            iteration
                .input
                .insert(self.item_variable.clone(), item.clone());
            iteration.set_metadata(META_ITERATION_INDEX, json!(index as u64));
            iteration.set_metadata(META_ITEM_VARIABLE, json!(self.item_variable));
            run.emit_next(
                &self.node_id,
                index as u64,
                item,
                PORT_LOOP_BODY,
                iteration,
            );
            run.emit_progress(
                &self.node_id,
                ((index + 1) as f64 / total as f64) * 100.0,
                &format!("iteration {}/{total}", index + 1),
            );
        }

        let mut context = input;
        context.output = context.input.clone();
        context.output.insert("IterationCount".into(), json!(total));
        Ok(NodeOutcome::with_context(context).on_port(PORT_LOOP_BODY))
    }
}

/// Condition-gated feedback loop.
///
/// A single execution evaluates the condition once. While true, one
/// `NodeNext` goes to the loop body and the node itself routes on
/// `IterationCheck`; the graph must loop a downstream path back so the
/// node re-evaluates after the body completes. When false, the node exits
/// on `LoopBody` with `IterationCount` in its output. A per-run counter
/// caps iterations.
pub struct WhileNode {
    node_id: String,
    condition: String,
    max_iterations: u64,
    iterations: AtomicU64,
}

impl WhileNode {
    pub fn from_definition(def: &NodeDefinition) -> Result<Self, NodeError> {
        match &def.config {
            NodeConfig::While {
                condition,
                max_iterations,
            } => Ok(Self {
                node_id: def.node_id.clone(),
                condition: condition.clone(),
                max_iterations: *max_iterations,
                iterations: AtomicU64::new(0),
            }),
            other => Err(NodeError::InvalidConfiguration {
                message: format!("expected While configuration, got {}", other.runtime_type()),
            }),
        }
    }

    /// Iterations run so far in this engine run.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Acquire)
    }
}

#[async_trait]
impl WorkflowNode for WhileNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::While
    }

    fn ports(&self) -> Vec<String> {
        vec![
            PORT_ITERATION_CHECK.to_string(),
            PORT_LOOP_BODY.to_string(),
        ]
    }

    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        _cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError> {
        let count = self.iterations.load(Ordering::Acquire);
        let env = environment(run, &input);
        let keep_going = expression::evaluate_bool(&self.condition, &env)?;

        if keep_going {
            if count >= self.max_iterations {
                return Err(NodeError::MaxIterations {
                    limit: self.max_iterations,
                });
            }
            self.iterations.store(count + 1, Ordering::Release);
            let mut iteration = NodeExecutionContext::with_input(input.input.clone());
            iteration.set_metadata(META_ITERATION_INDEX, json!(count));
            run.emit_next(&self.node_id, count, Value::Null, PORT_LOOP_BODY, iteration);

            let mut context = input;
            context.output = context.input.clone();
            context.output.insert("iteration".into(), json!(count));
            Ok(NodeOutcome::with_context(context).on_port(PORT_ITERATION_CHECK))
        } else {
            let mut context = input;
            context.output = context.input.clone();
            context.output.insert("IterationCount".into(), json!(count));
            Ok(NodeOutcome::with_context(context).on_port(PORT_LOOP_BODY))
        }
    }
}
