//! Workflow definitions: the static description of a graph.
//!
//! A [`WorkflowDefinition`] is the immutable input to the engine: an
//! ordered set of [`NodeDefinition`]s, an ordered set of
//! [`NodeConnection`] edges, default variables, and run-level options.
//! Node configuration is a tagged variant keyed by `runtimeType`, which
//! gives the on-disk shape described in the external interface: each node
//! object carries `nodeId`, `nodeName`, `runtimeType`, and the
//! runtime-specific fields flattened alongside.
//!
//! Validation happens before the engine starts: `validate()` aggregates
//! human-readable diagnostics across nodes, connections (including guard
//! expression syntax), and nested container/subflow definitions, and the
//! engine refuses to run a definition with any diagnostic.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::expression;
use crate::types::{RuntimeType, TriggerKind};

/// Default iteration cap for While nodes.
pub const DEFAULT_MAX_ITERATIONS: u64 = 1000;
/// Port carrying loop-body iterations and the loop exit.
pub const PORT_LOOP_BODY: &str = "LoopBody";
/// Port the While node routes on while its condition holds.
pub const PORT_ITERATION_CHECK: &str = "IterationCheck";
/// Sentinel port a Switch emits when no case matches.
pub const PORT_DEFAULT_CASE: &str = "__default__";

/// Errors raised when a definition fails validation.
#[derive(Debug, Error, Diagnostic)]
pub enum DefinitionError {
    #[error("workflow definition `{workflow_id}` is invalid:\n{}", .diagnostics.join("\n"))]
    #[diagnostic(
        code(flowloom::definition::invalid),
        help("Fix the listed diagnostics; the engine refuses to start an invalid workflow.")
    )]
    Invalid {
        workflow_id: String,
        diagnostics: Vec<String>,
    },
}

/// Execution mode of a container's children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Children chained in definition order (explicit child connections
    /// take precedence).
    #[default]
    Sequential,
    /// Children with no internal dependencies start concurrently.
    Parallel,
}

/// Runtime-specific node configuration, tagged by `runtimeType`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "runtimeType")]
pub enum NodeConfig {
    /// Pass-through; completes with its input as output.
    Noop,
    /// Named handler from the in-process task registry.
    Task {
        #[serde(rename = "taskName")]
        task_name: String,
    },
    /// Program evaluated through the expression service; `SetOutput`
    /// calls become the node's output data.
    Script { script: String },
    /// Single command run by the shell backend.
    ShellTask {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Multi-line script run by the shell backend.
    ShellScript {
        script: String,
        #[serde(default)]
        shell: Option<String>,
    },
    /// Boolean branch; routes on `True`/`False`.
    IfElse { condition: String },
    /// String-valued branch; routes on the matched case key or the
    /// default sentinel port.
    Switch {
        selector: String,
        #[serde(default)]
        cases: Vec<String>,
    },
    /// Collection iteration; one `NodeNext` per element on `LoopBody`.
    ForEach {
        collection: String,
        #[serde(default = "default_item_variable", rename = "itemVariable")]
        item_variable: String,
    },
    /// Condition-gated feedback loop.
    While {
        condition: String,
        #[serde(default = "default_max_iterations", rename = "maxIterations")]
        max_iterations: u64,
    },
    /// Nested child graph executed as a unit.
    Container {
        #[serde(default, rename = "executionMode")]
        execution_mode: ExecutionMode,
        #[serde(default, rename = "childNodes", alias = "ChildNodes")]
        child_nodes: Vec<NodeDefinition>,
        #[serde(default, rename = "childConnections", alias = "ChildConnections")]
        child_connections: Vec<NodeConnection>,
        /// Whether a failed child cancels its running siblings in
        /// Parallel mode.
        #[serde(default, rename = "cancelSiblingsOnFailure")]
        cancel_siblings_on_failure: bool,
    },
    /// Recursive engine invocation of a child workflow.
    Subflow {
        #[serde(default, rename = "workflowFilePath", alias = "WorkflowFilePath")]
        workflow_file_path: Option<String>,
        #[serde(default, rename = "workflow")]
        workflow: Option<Box<WorkflowDefinition>>,
        #[serde(default, rename = "inputMappings", alias = "InputMappings")]
        input_mappings: FxHashMap<String, String>,
        #[serde(default, rename = "outputMappings", alias = "OutputMappings")]
        output_mappings: FxHashMap<String, String>,
        #[serde(default, rename = "timeoutSeconds", alias = "Timeout")]
        timeout_seconds: Option<u64>,
    },
}

fn default_item_variable() -> String {
    "item".to_string()
}

fn default_max_iterations() -> u64 {
    DEFAULT_MAX_ITERATIONS
}

impl NodeConfig {
    #[must_use]
    pub fn runtime_type(&self) -> RuntimeType {
        match self {
            Self::Noop => RuntimeType::Noop,
            Self::Task { .. } => RuntimeType::Task,
            Self::Script { .. } => RuntimeType::Script,
            Self::ShellTask { .. } => RuntimeType::ShellTask,
            Self::ShellScript { .. } => RuntimeType::ShellScript,
            Self::IfElse { .. } => RuntimeType::IfElse,
            Self::Switch { .. } => RuntimeType::Switch,
            Self::ForEach { .. } => RuntimeType::ForEach,
            Self::While { .. } => RuntimeType::While,
            Self::Container { .. } => RuntimeType::Container,
            Self::Subflow { .. } => RuntimeType::Subflow,
        }
    }
}

/// One node in a workflow graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    /// Unique within the graph scope.
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(flatten)]
    pub config: NodeConfig,
    /// Per-node-type execution throttle.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub priority: i32,
    /// Wall-clock cap for one execution of this node.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Queue-level retry budget for messages failing at this node.
    /// `0` disables queue retries (failures route as `NodeFail`).
    #[serde(default)]
    pub max_retries: u32,
}

fn default_max_concurrent() -> u32 {
    1
}

impl NodeDefinition {
    #[must_use]
    pub fn new(node_id: &str, config: NodeConfig) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: node_id.to_string(),
            config,
            max_concurrent: 1,
            priority: 0,
            timeout_seconds: None,
            max_retries: 0,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn runtime_type(&self) -> RuntimeType {
        self.config.runtime_type()
    }

    /// Human-readable display name; falls back to the node id.
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.node_name.is_empty() {
            &self.node_id
        } else {
            &self.node_name
        }
    }

    /// Per-variant validation diagnostics, prefixed with the node id.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut diags = Vec::new();
        let prefix = |msg: String| format!("node `{}`: {msg}", self.node_id);

        if self.node_id.trim().is_empty() {
            diags.push("node id must not be empty".to_string());
        }

        match &self.config {
            NodeConfig::Noop => {}
            NodeConfig::Task { task_name } => {
                if task_name.trim().is_empty() {
                    diags.push(prefix("task name must not be empty".into()));
                }
            }
            NodeConfig::Script { script } => {
                if let Some(d) = expr_diag("script", script) {
                    diags.push(prefix(d));
                }
            }
            NodeConfig::ShellTask { command, .. } => {
                if command.trim().is_empty() {
                    diags.push(prefix("shell command must not be empty".into()));
                }
            }
            NodeConfig::ShellScript { script, .. } => {
                if script.trim().is_empty() {
                    diags.push(prefix("shell script must not be empty".into()));
                }
            }
            NodeConfig::IfElse { condition } => {
                if let Some(d) = expr_diag("condition", condition) {
                    diags.push(prefix(d));
                }
            }
            NodeConfig::Switch { selector, .. } => {
                if let Some(d) = expr_diag("selector", selector) {
                    diags.push(prefix(d));
                }
            }
            NodeConfig::ForEach { collection, item_variable } => {
                if let Some(d) = expr_diag("collection", collection) {
                    diags.push(prefix(d));
                }
                if item_variable.trim().is_empty() {
                    diags.push(prefix("item variable name must not be empty".into()));
                }
            }
            NodeConfig::While { condition, max_iterations } => {
                if let Some(d) = expr_diag("condition", condition) {
                    diags.push(prefix(d));
                }
                if *max_iterations == 0 {
                    diags.push(prefix("max iterations must be at least 1".into()));
                }
            }
            NodeConfig::Container {
                child_nodes,
                child_connections,
                ..
            } => {
                if child_nodes.is_empty() {
                    diags.push(prefix("container must have at least one child node".into()));
                }
                diags.extend(
                    validate_graph(child_nodes, child_connections)
                        .into_iter()
                        .map(|d| prefix(d)),
                );
            }
            NodeConfig::Subflow {
                workflow_file_path,
                workflow,
                ..
            } => match (workflow_file_path, workflow) {
                (None, None) => diags.push(prefix(
                    "subflow needs a workflow file path or an inline definition".into(),
                )),
                (Some(_), Some(_)) => diags.push(prefix(
                    "subflow must not set both a file path and an inline definition".into(),
                )),
                (_, Some(inline)) => {
                    if let Err(DefinitionError::Invalid { diagnostics, .. }) = inline.validate() {
                        diags.extend(diagnostics.into_iter().map(|d| prefix(d)));
                    }
                }
                _ => {}
            },
        }
        diags
    }
}

/// A routing rule: source → target, filtered by trigger kind, source
/// port, and guard expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnection {
    pub source_node_id: String,
    pub target_node_id: String,
    pub trigger_kind: TriggerKind,
    /// Port filter; `None` or empty matches any port. Case-insensitive.
    #[serde(default)]
    pub source_port: Option<String>,
    /// Guard expression evaluated against the source node's execution
    /// context; absent = always routes.
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NodeConnection {
    #[must_use]
    pub fn new(source: &str, target: &str, trigger_kind: TriggerKind) -> Self {
        Self {
            source_node_id: source.to_string(),
            target_node_id: target.to_string(),
            trigger_kind,
            source_port: None,
            guard: None,
            is_enabled: true,
        }
    }

    /// Complete-trigger edge, the most common kind.
    #[must_use]
    pub fn complete(source: &str, target: &str) -> Self {
        Self::new(source, target, TriggerKind::Complete)
    }

    #[must_use]
    pub fn on_port(mut self, port: &str) -> Self {
        self.source_port = Some(port.to_string());
        self
    }

    #[must_use]
    pub fn with_guard(mut self, guard: &str) -> Self {
        self.guard = Some(guard.to_string());
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.is_enabled = false;
        self
    }

    /// Case-insensitive port match; an absent/empty filter matches any.
    #[must_use]
    pub fn matches_port(&self, message_port: &str) -> bool {
        match self.source_port.as_deref() {
            None | Some("") => true,
            Some(filter) => filter.eq_ignore_ascii_case(message_port),
        }
    }
}

/// The immutable static description of a workflow graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    /// Overrides entry-point detection when set.
    #[serde(default)]
    pub entry_point_node_id: Option<String>,
    /// `0` = unlimited.
    #[serde(default)]
    pub max_concurrency: usize,
    #[serde(default)]
    pub allow_pause: bool,
    /// Wall-clock cap for the whole run.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub default_variables: FxHashMap<String, Value>,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub connections: Vec<NodeConnection>,
}

impl WorkflowDefinition {
    #[must_use]
    pub fn new(workflow_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_id.to_string(),
            description: String::new(),
            version: String::new(),
            entry_point_node_id: None,
            max_concurrency: 0,
            allow_pause: false,
            timeout_seconds: None,
            default_variables: FxHashMap::default(),
            metadata: FxHashMap::default(),
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    #[must_use]
    pub fn with_connection(mut self, connection: NodeConnection) -> Self {
        self.connections.push(connection);
        self
    }

    #[must_use]
    pub fn with_variable(mut self, name: &str, value: Value) -> Self {
        self.default_variables.insert(name.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Connections leaving the given node.
    #[must_use]
    pub fn connections_from(&self, node_id: &str) -> Vec<&NodeConnection> {
        self.connections
            .iter()
            .filter(|c| c.source_node_id == node_id)
            .collect()
    }

    /// Entry points: the configured entry node if set, else every node
    /// with no incoming enabled connection.
    #[must_use]
    pub fn entry_points(&self) -> Vec<&NodeDefinition> {
        if let Some(entry) = &self.entry_point_node_id {
            return self.node(entry).into_iter().collect();
        }
        self.nodes
            .iter()
            .filter(|n| {
                !self
                    .connections
                    .iter()
                    .any(|c| c.is_enabled && c.target_node_id == n.node_id)
            })
            .collect()
    }

    /// Validate the whole definition, aggregating diagnostics across
    /// nodes, connections, and nested definitions.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut diags = Vec::new();
        if self.workflow_id.trim().is_empty() {
            diags.push("workflow id must not be empty".to_string());
        }
        if self.nodes.is_empty() {
            diags.push("workflow must have at least one node".to_string());
        }
        if let Some(entry) = &self.entry_point_node_id {
            if self.node(entry).is_none() {
                diags.push(format!("entry point `{entry}` is not a node in this workflow"));
            }
        }
        diags.extend(validate_graph(&self.nodes, &self.connections));

        if diags.is_empty() {
            Ok(())
        } else {
            Err(DefinitionError::Invalid {
                workflow_id: self.workflow_id.clone(),
                diagnostics: diags,
            })
        }
    }
}

/// Diagnostic for an empty or unparsable expression, if any.
fn expr_diag(what: &str, source: &str) -> Option<String> {
    if source.trim().is_empty() {
        Some(format!("{what} expression must not be empty"))
    } else if let Err(e) = expression::parse(source) {
        Some(format!("{what} expression does not parse: {e}"))
    } else {
        None
    }
}

/// Shared graph-level checks for workflows and container child graphs.
fn validate_graph(nodes: &[NodeDefinition], connections: &[NodeConnection]) -> Vec<String> {
    let mut diags = Vec::new();

    let mut seen = rustc_hash::FxHashSet::default();
    for node in nodes {
        if !seen.insert(node.node_id.as_str()) {
            diags.push(format!("duplicate node id `{}`", node.node_id));
        }
        diags.extend(node.validate());
    }

    for (idx, conn) in connections.iter().enumerate() {
        if !seen.contains(conn.source_node_id.as_str()) {
            diags.push(format!(
                "connection #{idx} references unknown source node `{}`",
                conn.source_node_id
            ));
        }
        if !seen.contains(conn.target_node_id.as_str()) {
            diags.push(format!(
                "connection #{idx} references unknown target node `{}`",
                conn.target_node_id
            ));
        }
        if let Some(guard) = &conn.guard {
            if let Err(e) = expression::parse(guard) {
                diags.push(format!(
                    "connection #{idx} ({} -> {}) guard does not parse: {e}",
                    conn.source_node_id, conn.target_node_id
                ));
            }
        }
    }
    diags
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_node_workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("wf")
            .with_node(NodeDefinition::new("a", NodeConfig::Noop))
            .with_node(NodeDefinition::new("b", NodeConfig::Noop))
            .with_connection(NodeConnection::complete("a", "b"))
    }

    #[test]
    fn valid_workflow_passes() {
        two_node_workflow().validate().unwrap();
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let wf = two_node_workflow().with_node(NodeDefinition::new("a", NodeConfig::Noop));
        let err = wf.validate().unwrap_err();
        let DefinitionError::Invalid { diagnostics, .. } = err;
        assert!(diagnostics.iter().any(|d| d.contains("duplicate node id `a`")));
    }

    #[test]
    fn dangling_connection_is_rejected() {
        let wf = two_node_workflow().with_connection(NodeConnection::complete("a", "ghost"));
        let DefinitionError::Invalid { diagnostics, .. } = wf.validate().unwrap_err();
        assert!(diagnostics.iter().any(|d| d.contains("unknown target node `ghost`")));
    }

    #[test]
    fn guard_syntax_is_checked_at_load_time() {
        let wf = two_node_workflow()
            .with_connection(NodeConnection::complete("a", "b").with_guard("1 +"));
        let DefinitionError::Invalid { diagnostics, .. } = wf.validate().unwrap_err();
        assert!(diagnostics.iter().any(|d| d.contains("guard does not parse")));
    }

    #[test]
    fn while_condition_is_validated() {
        let wf = WorkflowDefinition::new("wf").with_node(NodeDefinition::new(
            "loop",
            NodeConfig::While {
                condition: String::new(),
                max_iterations: 10,
            },
        ));
        let DefinitionError::Invalid { diagnostics, .. } = wf.validate().unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.contains("condition expression must not be empty")));
    }

    #[test]
    fn entry_points_are_nodes_without_incoming_edges() {
        let wf = two_node_workflow();
        let entries: Vec<&str> = wf.entry_points().iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(entries, vec!["a"]);
    }

    #[test]
    fn disabled_incoming_edges_do_not_hide_entry_points() {
        let wf = WorkflowDefinition::new("wf")
            .with_node(NodeDefinition::new("a", NodeConfig::Noop))
            .with_node(NodeDefinition::new("b", NodeConfig::Noop))
            .with_connection(NodeConnection::complete("a", "b").disabled());
        let entries: Vec<&str> = wf.entry_points().iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(entries, vec!["a", "b"]);
    }

    #[test]
    fn port_matching_is_case_insensitive() {
        let conn = NodeConnection::complete("a", "b").on_port("True");
        assert!(conn.matches_port("true"));
        assert!(conn.matches_port("TRUE"));
        assert!(!conn.matches_port("False"));
        let any = NodeConnection::complete("a", "b");
        assert!(any.matches_port("anything"));
    }

    #[test]
    fn definition_json_roundtrip() {
        let wf = WorkflowDefinition::new("wf")
            .with_variable("x", json!(3))
            .with_node(NodeDefinition::new(
                "gate",
                NodeConfig::IfElse {
                    condition: "GetGlobal(\"x\") < 5".to_string(),
                },
            ))
            .with_node(NodeDefinition::new("done", NodeConfig::Noop))
            .with_connection(NodeConnection::complete("gate", "done").on_port("True"));
        let json = serde_json::to_string(&wf).unwrap();
        assert!(json.contains("\"runtimeType\":\"IfElse\""));
        let parsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(wf, parsed);
    }

    #[test]
    fn subflow_requires_a_source() {
        let wf = WorkflowDefinition::new("wf").with_node(NodeDefinition::new(
            "sub",
            NodeConfig::Subflow {
                workflow_file_path: None,
                workflow: None,
                input_mappings: FxHashMap::default(),
                output_mappings: FxHashMap::default(),
                timeout_seconds: None,
            },
        ));
        let DefinitionError::Invalid { diagnostics, .. } = wf.validate().unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.contains("workflow file path or an inline definition")));
    }
}
