//! Executable workflow nodes.
//!
//! This module provides the core abstractions for node execution: the
//! [`WorkflowNode`] trait, the [`NodeRun`] handle giving a node access to
//! its execution environment, the [`NodeOutcome`] result carrying output
//! data and the chosen source port, and the error taxonomy.
//!
//! # Design Principles
//!
//! - **One message at a time**: a node instance processes at most one
//!   message concurrently; parallelism exists across nodes.
//! - **Errors stay local**: a node failure is recorded on its
//!   [`NodeInstance`](crate::context::NodeInstance) and emitted as a
//!   `NodeFail` message, never raised across the worker boundary.
//! - **No reflection**: implementations are constructed through a simple
//!   [`NodeRegistry`] mapping `RuntimeType → constructor`.

mod container;
mod control;
mod leaf;
mod registry;
mod shell;
mod subflow;
mod task;

pub use container::ContainerNode;
pub use control::{ForEachNode, IfElseNode, SwitchNode, WhileNode};
pub use leaf::{NoopNode, ScriptNode, TaskNode};
pub use registry::{NodeConstructor, NodeRegistry};
pub use shell::{
    ProcessShellBackend, ShellBackend, ShellOutput, ShellScriptNode, ShellTaskNode,
};
pub use subflow::SubflowNode;
pub use task::{TaskContext, TaskHandler, TaskRegistry};

use async_trait::async_trait;
use miette::Diagnostic;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::{IoMap, NodeExecutionContext, WorkflowExecutionContext};
use crate::event_bus::{Event, EventEmitter};
use crate::expression::ExpressionError;
use crate::messages::{NodeNextMessage, WorkflowMessage};
use crate::router::MessageRouter;
use crate::types::RuntimeType;

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur during node execution.
///
/// Workers convert these into node-instance state: `Cancelled` becomes a
/// cancelled instance, fatal variants dead-letter the triggering envelope,
/// everything else becomes a failed instance (retried through the queue
/// when the node has a retry budget).
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expression parse or evaluation failure.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Expression(#[from] ExpressionError),

    /// Expected input data is missing.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(flowloom::node::missing_input),
        help("Check that the upstream node produced the required data: {what}.")
    )]
    MissingInput { what: String },

    /// No task handler registered under the configured name. Fatal: the
    /// triggering envelope goes straight to the dead-letter queue.
    #[error("no task registered under name `{name}`")]
    #[diagnostic(
        code(flowloom::node::task_not_found),
        help("Register the handler on the engine's TaskRegistry before starting.")
    )]
    TaskNotFound { name: String },

    /// Shell or other execution backend error.
    #[error("backend error ({backend}): {message}")]
    #[diagnostic(code(flowloom::node::backend))]
    Backend {
        backend: &'static str,
        message: String,
    },

    /// A sub-workflow definition could not be loaded. Fatal.
    #[error("failed to load sub-workflow `{path}`: {message}")]
    #[diagnostic(code(flowloom::node::subflow_load))]
    SubflowLoad { path: String, message: String },

    /// A nested child workflow reached Failed.
    #[error("child workflow failed: {message}")]
    #[diagnostic(code(flowloom::node::child_workflow))]
    ChildWorkflow { message: String },

    /// The while loop exceeded its configured iteration cap.
    #[error("Maximum iterations ({limit}) exceeded")]
    #[diagnostic(
        code(flowloom::node::max_iterations),
        help("Raise maxIterations or fix the loop condition so it terminates.")
    )]
    MaxIterations { limit: u64 },

    /// The node configuration is unusable at runtime.
    #[error("invalid node configuration: {message}")]
    #[diagnostic(code(flowloom::node::invalid_configuration))]
    InvalidConfiguration { message: String },

    /// Cooperative cancellation or timeout; not an error.
    #[error("execution cancelled: {reason}")]
    #[diagnostic(code(flowloom::node::cancelled))]
    Cancelled { reason: String },
}

impl NodeError {
    /// Fatal errors dead-letter the triggering envelope without retry.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TaskNotFound { .. } | Self::SubflowLoad { .. })
    }

    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Execution environment
// ============================================================================

/// Capability backends shared by every node in an engine run.
pub struct NodeServices {
    /// In-process task handlers for `Task` nodes.
    pub tasks: Arc<TaskRegistry>,
    /// Process backend for `ShellTask`/`ShellScript` nodes.
    pub shell: Arc<dyn ShellBackend>,
    /// Base directory for resolving relative sub-workflow file paths.
    pub base_dir: PathBuf,
}

impl Default for NodeServices {
    fn default() -> Self {
        Self {
            tasks: Arc::new(TaskRegistry::new()),
            shell: Arc::new(ProcessShellBackend::default()),
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

/// The execution environment handed to a node for one run.
///
/// Gives the node access to the shared workflow context (variables), the
/// router (for mid-execution `NodeNext` emission), the event emitter, and
/// the capability backends.
#[derive(Clone)]
pub struct NodeRun {
    pub workflow: Arc<WorkflowExecutionContext>,
    pub router: Arc<MessageRouter>,
    pub emitter: Arc<dyn EventEmitter>,
    pub services: Arc<NodeServices>,
    /// Engine configuration, inherited by nested container/subflow runs.
    pub config: crate::engine::EngineConfig,
}

impl NodeRun {
    /// Emit one `NodeNext` iteration toward the loop body and route it
    /// immediately. Returns the number of deliveries.
    pub fn emit_next(
        &self,
        node_id: &str,
        iteration_index: u64,
        item: serde_json::Value,
        source_port: &str,
        context: NodeExecutionContext,
    ) -> usize {
        let message = Arc::new(WorkflowMessage::NodeNext(NodeNextMessage::new(
            node_id,
            iteration_index,
            item,
            source_port,
            context,
        )));
        self.router.route_message(message, &self.workflow)
    }

    /// Emit an observational progress event.
    pub fn emit_progress(&self, key: &str, percent: f64, status: &str) {
        let _ = self.emitter.emit(Event::progress(key, percent, status));
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// What a successful node execution produced: the outcome port the worker
/// routes on, and the context snapshot whose `output` becomes downstream
/// `input`.
#[derive(Clone, Debug, Default)]
pub struct NodeOutcome {
    pub source_port: String,
    pub context: NodeExecutionContext,
}

impl NodeOutcome {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcome on the default (empty) port carrying the given context.
    #[must_use]
    pub fn with_context(context: NodeExecutionContext) -> Self {
        Self {
            source_port: String::new(),
            context,
        }
    }

    #[must_use]
    pub fn on_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = port.into();
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: IoMap) -> Self {
        self.context.output = output;
        self
    }
}

// ============================================================================
// Core trait
// ============================================================================

/// Core trait defining executable workflow nodes.
///
/// One implementation object exists per node id per engine run; the
/// node's worker invokes [`execute`](Self::execute) once per leased
/// message. Implementations observe the cancellation token at every
/// suspension point.
#[async_trait]
pub trait WorkflowNode: Send + Sync {
    /// The node id this instance was constructed for.
    fn node_id(&self) -> &str;

    fn runtime_type(&self) -> RuntimeType;

    /// The outcome ports this node can route on. Empty for single-port
    /// nodes (default port).
    fn ports(&self) -> Vec<String> {
        Vec::new()
    }

    /// Execute this node against one triggering message context.
    async fn execute(
        &self,
        run: &NodeRun,
        input: NodeExecutionContext,
        cancel: CancellationToken,
    ) -> Result<NodeOutcome, NodeError>;
}
