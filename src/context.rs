//! Execution state for workflows and node executions.
//!
//! Three layers of state live here:
//!
//! - [`NodeExecutionContext`]: the data a single node execution reads and
//!   writes (insertion-ordered input/output maps, local variables, free-form
//!   metadata). Owned by one execution at a time; downstream consumers see
//!   an immutable snapshot captured at emit time.
//! - [`NodeInstance`]: the record of one execution of one node. A node may
//!   execute many times; each execution gets a fresh instance with a
//!   monotonic lifecycle.
//! - [`WorkflowExecutionContext`]: the shared state of a running workflow
//!   instance: status, variables, per-node queues, router/DLQ handles,
//!   and the accumulated instance history.
//!
//! The workflow variables map is the only globally mutable state in the
//! engine; every other piece of state is bound to a message or an instance.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::queue::{DeadLetterQueue, NodeMessageQueue};
use crate::types::{NodeStatus, WorkflowStatus};

/// Insertion-ordered string→value map used for node input and output data.
///
/// `serde_json`'s `preserve_order` feature backs this with an index map, so
/// downstream consumers observe keys in the order the producer wrote them.
pub type IoMap = serde_json::Map<String, Value>;

/// Metadata key for the iteration index set by ForEach/While.
pub const META_ITERATION_INDEX: &str = "iteration_index";
/// Metadata key for the source port the triggering message arrived on.
pub const META_SOURCE_PORT: &str = "source_port";
/// Metadata key for the loop variable name bound by ForEach.
pub const META_ITEM_VARIABLE: &str = "item_variable";

// ============================================================================
// Node execution context
// ============================================================================

/// Per-execution data for a single node run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionContext {
    /// Data handed to the node by its triggering message.
    #[serde(default)]
    pub input: IoMap,
    /// Data the node produces; becomes downstream `input` at emit time.
    #[serde(default)]
    pub output: IoMap,
    /// Scratch variables private to this execution; never propagated.
    #[serde(default)]
    pub local: FxHashMap<String, Value>,
    /// Free-form execution metadata (iteration index, source port, timing).
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

impl NodeExecutionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context whose input is the given map.
    #[must_use]
    pub fn with_input(input: IoMap) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    /// The iteration index recorded in metadata, if any.
    #[must_use]
    pub fn iteration_index(&self) -> Option<u64> {
        self.metadata.get(META_ITERATION_INDEX).and_then(Value::as_u64)
    }

    /// The source port recorded in metadata, if any.
    #[must_use]
    pub fn source_port(&self) -> Option<&str> {
        self.metadata.get(META_SOURCE_PORT).and_then(Value::as_str)
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }
}

// ============================================================================
// Node instance
// ============================================================================

/// Record of one execution of one node.
///
/// Lifecycle is monotonic over [`NodeStatus::rank`]; `Completed`, `Failed`
/// and `Cancelled` are terminal. Attempted regressions are ignored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInstance {
    pub instance_id: String,
    pub node_id: String,
    pub workflow_instance_id: String,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Human-readable failure message; set iff status is `Failed`.
    pub error: Option<String>,
    /// Extra failure detail (backend stderr, cause chain rendering).
    pub error_detail: Option<String>,
    /// The outcome port this execution routed on (empty = default port).
    pub source_port: String,
    /// Snapshot of the execution context at completion time.
    pub context: NodeExecutionContext,
}

impl NodeInstance {
    #[must_use]
    pub fn new(node_id: &str, workflow_instance_id: &str) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            workflow_instance_id: workflow_instance_id.to_string(),
            status: NodeStatus::Pending,
            started_at: None,
            ended_at: None,
            error: None,
            error_detail: None,
            source_port: String::new(),
            context: NodeExecutionContext::new(),
        }
    }

    /// Transition to a new status, enforcing monotonicity. Returns `true`
    /// if the transition was applied.
    pub fn transition(&mut self, status: NodeStatus) -> bool {
        if self.status.is_terminal() || status.rank() < self.status.rank() {
            return false;
        }
        self.status = status;
        match status {
            NodeStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        true
    }

    /// Mark this instance completed on the given source port.
    pub fn complete(&mut self, source_port: impl Into<String>) {
        self.source_port = source_port.into();
        self.transition(NodeStatus::Completed);
    }

    /// Mark this instance failed with a message.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.transition(NodeStatus::Failed);
    }

    /// Mark this instance cancelled.
    pub fn cancel(&mut self) {
        self.transition(NodeStatus::Cancelled);
    }

    /// Wall-clock duration; defined iff the instance is terminal.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

// ============================================================================
// Workflow execution context
// ============================================================================

/// Shared state of one running workflow instance.
///
/// Cloned handles (`Arc`) are held by every worker, the router, and the
/// control-flow nodes. The variables map is thread-safe for concurrent
/// writers; status transitions go through [`try_transition`]
/// (`Self::try_transition`), which enforces the terminal-once invariant.
pub struct WorkflowExecutionContext {
    pub instance_id: String,
    pub workflow_id: String,
    pub graph_id: String,
    status: RwLock<WorkflowStatus>,
    pub started_at: DateTime<Utc>,
    ended_at: RwLock<Option<DateTime<Utc>>>,
    /// Workflow-scoped variables; case-sensitive names.
    pub variables: Arc<RwLock<FxHashMap<String, Value>>>,
    /// One queue per node in this graph scope, keyed by node id.
    pub node_queues: FxHashMap<String, Arc<NodeMessageQueue>>,
    pub dead_letter: Arc<DeadLetterQueue>,
    instances: RwLock<Vec<NodeInstance>>,
    errors: RwLock<Vec<String>>,
}

impl WorkflowExecutionContext {
    #[must_use]
    pub fn new(
        workflow_id: &str,
        graph_id: &str,
        variables: FxHashMap<String, Value>,
        node_queues: FxHashMap<String, Arc<NodeMessageQueue>>,
        dead_letter: Arc<DeadLetterQueue>,
    ) -> Self {
        Self::new_shared(
            workflow_id,
            graph_id,
            Arc::new(RwLock::new(variables)),
            node_queues,
            dead_letter,
        )
    }

    /// Build a context over an existing variables map. Containers use
    /// this so their children mutate the parent's variable scope.
    #[must_use]
    pub fn new_shared(
        workflow_id: &str,
        graph_id: &str,
        variables: Arc<RwLock<FxHashMap<String, Value>>>,
        node_queues: FxHashMap<String, Arc<NodeMessageQueue>>,
        dead_letter: Arc<DeadLetterQueue>,
    ) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            graph_id: graph_id.to_string(),
            status: RwLock::new(WorkflowStatus::Pending),
            started_at: Utc::now(),
            ended_at: RwLock::new(None),
            variables,
            node_queues,
            dead_letter,
            instances: RwLock::new(Vec::new()),
            errors: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn status(&self) -> WorkflowStatus {
        *self.status.read()
    }

    /// Attempt a status transition. Terminal statuses are sticky: once the
    /// workflow is Completed/Failed/Cancelled no further transition applies.
    /// Returns `true` if the transition was applied.
    pub fn try_transition(&self, next: WorkflowStatus) -> bool {
        let mut status = self.status.write();
        if status.is_terminal() {
            return false;
        }
        *status = next;
        if next.is_terminal() {
            *self.ended_at.write() = Some(Utc::now());
        }
        true
    }

    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        *self.ended_at.read()
    }

    /// Wall-clock duration of the run; defined iff the status is terminal.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        if !self.status().is_terminal() {
            return None;
        }
        self.ended_at()
            .and_then(|end| (end - self.started_at).to_std().ok())
    }

    #[must_use]
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    pub fn set_variable(&self, name: &str, value: Value) {
        self.variables.write().insert(name.to_string(), value);
    }

    /// Snapshot of all variables.
    #[must_use]
    pub fn variables_snapshot(&self) -> FxHashMap<String, Value> {
        self.variables.read().clone()
    }

    pub fn queue(&self, node_id: &str) -> Option<Arc<NodeMessageQueue>> {
        self.node_queues.get(node_id).cloned()
    }

    /// Record a finished (terminal) node instance.
    pub fn record_instance(&self, instance: NodeInstance) {
        if let Some(error) = &instance.error {
            self.errors
                .write()
                .push(format!("[{}] {}", instance.node_id, error));
        }
        self.instances.write().push(instance);
    }

    /// All recorded instances, in completion order.
    #[must_use]
    pub fn instances(&self) -> Vec<NodeInstance> {
        self.instances.read().clone()
    }

    /// Node ids that have at least one Completed instance.
    #[must_use]
    pub fn completed_node_ids(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for inst in self.instances.read().iter() {
            if inst.status == NodeStatus::Completed && !seen.contains(&inst.node_id) {
                seen.push(inst.node_id.clone());
            }
        }
        seen
    }

    /// Aggregated per-node error messages observed so far.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.errors.read().clone()
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.errors.write().push(message.into());
    }
}

impl std::fmt::Debug for WorkflowExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutionContext")
            .field("instance_id", &self.instance_id)
            .field("workflow_id", &self.workflow_id)
            .field("graph_id", &self.graph_id)
            .field("status", &self.status())
            .field("nodes", &self.node_queues.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn instance_lifecycle_is_monotonic() {
        let mut inst = NodeInstance::new("a", "wf");
        assert!(inst.transition(NodeStatus::Running));
        assert!(inst.started_at.is_some());
        inst.complete("True");
        assert_eq!(inst.status, NodeStatus::Completed);
        assert_eq!(inst.source_port, "True");
        // Terminal is sticky.
        assert!(!inst.transition(NodeStatus::Running));
        assert!(!inst.transition(NodeStatus::Failed));
        assert!(inst.duration().is_some());
    }

    #[test]
    fn io_map_preserves_insertion_order() {
        let mut io = IoMap::new();
        io.insert("zulu".into(), json!(1));
        io.insert("alpha".into(), json!(2));
        io.insert("mike".into(), json!(3));
        let keys: Vec<&str> = io.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zulu", "alpha", "mike"]);
    }

    #[test]
    fn context_metadata_accessors() {
        let mut ctx = NodeExecutionContext::new();
        ctx.set_metadata(META_ITERATION_INDEX, json!(4));
        ctx.set_metadata(META_SOURCE_PORT, json!("True"));
        assert_eq!(ctx.iteration_index(), Some(4));
        assert_eq!(ctx.source_port(), Some("True"));
    }
}
